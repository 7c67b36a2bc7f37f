use serde_json::Value;

/// Resolves "city,country" (or "state,country") for a point. Lookup
/// failures are logged and reported as `None`.
pub async fn address_from_lat_lon(
    http: &reqwest::Client,
    base_url: &str,
    latitude: f64,
    longitude: f64,
) -> Option<String> {
    tracing::debug!(latitude, longitude, "reverse geocoding project centroid");
    let response = http
        .get(base_url)
        .query(&[
            ("format", "json".to_string()),
            ("lat", latitude.to_string()),
            ("lon", longitude.to_string()),
            ("zoom", "18".to_string()),
        ])
        .header(reqwest::header::ACCEPT_LANGUAGE, "en")
        .send()
        .await;

    let response = match response {
        Ok(response) if response.status().is_success() => response,
        Ok(response) => {
            tracing::warn!(status = %response.status(), "reverse geocoding failed");
            return None;
        }
        Err(err) => {
            tracing::warn!(error = %err, "reverse geocoding failed");
            return None;
        }
    };

    match response.json::<Value>().await {
        Ok(body) => {
            let address = format_address(&body);
            if address.is_none() {
                tracing::warn!("reverse geocoding returned no usable address");
            }
            address
        }
        Err(err) => {
            tracing::warn!(error = %err, "reverse geocoding response invalid");
            None
        }
    }
}

pub fn format_address(body: &Value) -> Option<String> {
    let address = body.get("address")?;
    let field = |key: &str| {
        address
            .get(key)
            .and_then(Value::as_str)
            .filter(|value| !value.is_empty())
    };
    let country = field("country").unwrap_or_default();
    let place = field("city").or_else(|| field("state")).unwrap_or_default();
    if place.is_empty() && country.is_empty() {
        return None;
    }
    Some(format!("{place},{country}"))
}
