use dtm_common::{env_flag, env_opt, env_or};
use std::time::Duration;

use crate::storage::StorageConfig;

const DEFAULT_NOMINATIM_URL: &str = "https://nominatim.openstreetmap.org/reverse";

#[derive(Clone)]
pub struct Settings {
    pub port: u16,
    pub api_prefix: String,
    pub backend_url: String,
    pub node_odm_url: Option<String>,
    pub nominatim_url: Option<String>,
    pub default_split_dimension: u32,
    pub http_timeout: Duration,
    pub max_upload_bytes: usize,
    pub storage: Option<StorageConfig>,
}

impl Settings {
    pub fn from_env() -> Self {
        // Defaults match a local docker-compose deployment.
        let api_prefix = normalize_prefix(&env_opt("API_PREFIX").unwrap_or_else(|| "/api".to_string()));
        let backend_url = env_opt("BACKEND_URL")
            .unwrap_or_else(|| "http://localhost:8000".to_string())
            .trim_end_matches('/')
            .to_string();
        let nominatim_url = match std::env::var("NOMINATIM_URL") {
            Ok(value) if value.trim().is_empty() => None,
            Ok(value) => Some(value.trim().to_string()),
            Err(_) => Some(DEFAULT_NOMINATIM_URL.to_string()),
        };

        Self {
            port: env_or("PORT", 8000u16),
            api_prefix,
            backend_url,
            node_odm_url: env_opt("NODE_ODM_URL"),
            nominatim_url,
            default_split_dimension: env_or("DEFAULT_TASK_SPLIT_DIMENSION", 100u32),
            http_timeout: Duration::from_secs(env_or("HTTP_TIMEOUT_SECS", 60u64)),
            max_upload_bytes: env_or("MAX_UPLOAD_MB", 512usize).saturating_mul(1024 * 1024),
            storage: storage_from_env(),
        }
    }

    /// Callback URL NodeODM posts task status to.
    pub fn odm_webhook_url(&self, user_id: &str, project_id: uuid::Uuid, task_id: uuid::Uuid) -> String {
        format!(
            "{}{}/projects/odm/webhook/{}/{}/{}/",
            self.backend_url, self.api_prefix, user_id, project_id, task_id
        )
    }
}

fn storage_from_env() -> Option<StorageConfig> {
    let endpoint = env_opt("S3_ENDPOINT")?;
    let access_key = env_opt("S3_ACCESS_KEY")?;
    let secret_key = env_opt("S3_SECRET_KEY")?;
    Some(StorageConfig {
        endpoint,
        access_key,
        secret_key,
        bucket: env_opt("S3_BUCKET_NAME").unwrap_or_else(|| "dtm-bucket".to_string()),
        region: env_opt("S3_REGION").unwrap_or_else(|| "us-east-1".to_string()),
        force_path_style: env_flag("S3_FORCE_PATH_STYLE", true),
    })
}

/// Leading slash, no trailing slash; "/" collapses to an empty prefix.
fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim().trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("/{trimmed}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> Settings {
        Settings {
            port: 8000,
            api_prefix: "/api".to_string(),
            backend_url: "https://dtm.example.org".to_string(),
            node_odm_url: None,
            nominatim_url: None,
            default_split_dimension: 100,
            http_timeout: Duration::from_secs(1),
            max_upload_bytes: 1024,
            storage: None,
        }
    }

    #[test]
    fn prefixes_are_normalized() {
        assert_eq!(normalize_prefix("api/"), "/api");
        assert_eq!(normalize_prefix("/api/v1"), "/api/v1");
        assert_eq!(normalize_prefix("/"), "");
    }

    #[test]
    fn webhook_url_embeds_identifiers() {
        let project = uuid::Uuid::from_u128(7);
        let task = uuid::Uuid::from_u128(8);
        let url = settings().odm_webhook_url("user-1", project, task);
        assert_eq!(
            url,
            format!("https://dtm.example.org/api/projects/odm/webhook/user-1/{project}/{task}/")
        );
    }
}
