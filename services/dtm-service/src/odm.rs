use reqwest::multipart::{Form, Part};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Clone)]
pub struct OdmClient {
    http: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct OdmOption {
    pub name: &'static str,
    pub value: serde_json::Value,
}

#[derive(Deserialize)]
struct NewTaskResponse {
    uuid: Option<String>,
    error: Option<String>,
}

/// Options every drone-image job is submitted with.
pub fn default_options() -> Vec<OdmOption> {
    vec![
        OdmOption {
            name: "dsm",
            value: serde_json::Value::Bool(true),
        },
        OdmOption {
            name: "orthophoto-resolution",
            value: serde_json::Value::from(5),
        },
    ]
}

pub struct OdmImage {
    pub name: String,
    pub data: Vec<u8>,
}

impl OdmClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, String> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| format!("odm client init failed: {err}"))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Submits images as a new processing task and returns the ODM task uuid.
    pub async fn create_task(
        &self,
        name: &str,
        images: Vec<OdmImage>,
        options: &[OdmOption],
        webhook: &str,
    ) -> Result<String, String> {
        if images.is_empty() {
            return Err("no images to process".to_string());
        }
        let options = serde_json::to_string(options)
            .map_err(|err| format!("encode odm options failed: {err}"))?;
        let mut form = Form::new()
            .text("name", name.to_string())
            .text("options", options)
            .text("webhook", webhook.to_string());
        for image in images {
            form = form.part("images", Part::bytes(image.data).file_name(image.name));
        }

        let response = self
            .http
            .post(format!("{}/task/new", self.base_url))
            .multipart(form)
            .send()
            .await
            .map_err(|err| format!("odm task submit failed: {err}"))?
            .error_for_status()
            .map_err(|err| format!("odm task submit failed: {err}"))?;
        let body: NewTaskResponse = response
            .json()
            .await
            .map_err(|err| format!("odm task response invalid: {err}"))?;
        match (body.uuid, body.error) {
            (Some(uuid), _) => Ok(uuid),
            (None, Some(error)) => Err(format!("odm rejected task: {error}")),
            (None, None) => Err("odm response had no task uuid".to_string()),
        }
    }

    /// Downloads the zipped outputs of a finished (or failed) task.
    pub async fn download_assets(&self, odm_task_id: &str) -> Result<Vec<u8>, String> {
        let response = self
            .http
            .get(self.assets_url(odm_task_id))
            .send()
            .await
            .map_err(|err| format!("odm assets download failed: {err}"))?
            .error_for_status()
            .map_err(|err| format!("odm assets download failed: {err}"))?;
        let bytes = response
            .bytes()
            .await
            .map_err(|err| format!("odm assets read failed: {err}"))?;
        Ok(bytes.to_vec())
    }

    fn assets_url(&self, odm_task_id: &str) -> String {
        format!("{}/task/{}/download/all.zip", self.base_url, odm_task_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_encode_as_name_value_pairs() {
        let encoded = serde_json::to_value(default_options()).unwrap();
        assert_eq!(
            encoded,
            serde_json::json!([
                { "name": "dsm", "value": true },
                { "name": "orthophoto-resolution", "value": 5 }
            ])
        );
    }

    #[test]
    fn assets_url_ignores_trailing_slash() {
        let client = OdmClient::new("http://odm:3000/", Duration::from_secs(5)).unwrap();
        assert_eq!(
            client.assets_url("abc"),
            "http://odm:3000/task/abc/download/all.zip"
        );
    }

    #[tokio::test]
    async fn refuses_empty_submissions() {
        let client = OdmClient::new("http://127.0.0.1:9", Duration::from_secs(1)).unwrap();
        let result = client
            .create_task("task", Vec::new(), &default_options(), "http://hook")
            .await;
        assert_eq!(result, Err("no images to process".to_string()));
    }
}
