use aws_config::BehaviorVersion;
use aws_sdk_s3::{
    config::{Credentials, Region},
    error::SdkError,
    operation::head_object::HeadObjectError,
    primitives::ByteStream,
    types::{Delete, ObjectIdentifier},
    Client,
};
use std::sync::Arc;
use tokio::sync::OnceCell;
use uuid::Uuid;

const DATA_ROOT: &str = "dtm-data/projects";
/// DeleteObjects accepts at most this many keys per request.
const DELETE_BATCH: usize = 1000;

#[derive(Clone)]
pub struct StorageConfig {
    pub endpoint: String,
    pub access_key: String,
    pub secret_key: String,
    pub bucket: String,
    pub region: String,
    pub force_path_style: bool,
}

#[derive(Clone)]
pub struct StorageClient {
    client: Client,
    bucket: String,
    endpoint: String,
    bucket_ready: Arc<OnceCell<()>>,
}

impl StorageClient {
    pub async fn new(config: StorageConfig) -> Result<Self, String> {
        let credentials =
            Credentials::new(config.access_key, config.secret_key, None, None, "dtm-env");
        let shared = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.region))
            .credentials_provider(credentials)
            .endpoint_url(config.endpoint.as_str())
            .load()
            .await;
        let s3_config = aws_sdk_s3::config::Builder::from(&shared)
            .force_path_style(config.force_path_style)
            .build();
        Ok(Self {
            client: Client::from_conf(s3_config),
            bucket: config.bucket,
            endpoint: config.endpoint,
            bucket_ready: Arc::new(OnceCell::new()),
        })
    }

    pub fn object_url(&self, key: &str) -> String {
        object_url(&self.endpoint, &self.bucket, key)
    }

    pub async fn put_object(
        &self,
        key: &str,
        body: Vec<u8>,
        content_type: Option<&str>,
    ) -> Result<(), String> {
        self.ensure_bucket().await?;
        self.client
            .put_object()
            .bucket(self.bucket.as_str())
            .key(key)
            .set_content_type(content_type.map(str::to_string))
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|err| format!("put object {key} failed: {err}"))?;
        tracing::debug!(key, "object stored");
        Ok(())
    }

    pub async fn get_object(&self, key: &str) -> Result<Vec<u8>, String> {
        let output = self
            .client
            .get_object()
            .bucket(self.bucket.as_str())
            .key(key)
            .send()
            .await
            .map_err(|err| format!("get object {key} failed: {err}"))?;
        let data = output
            .body
            .collect()
            .await
            .map_err(|err| format!("read object {key} failed: {err}"))?;
        Ok(data.into_bytes().to_vec())
    }

    pub async fn object_exists(&self, key: &str) -> Result<bool, String> {
        match self
            .client
            .head_object()
            .bucket(self.bucket.as_str())
            .key(key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(err) if is_missing_object(&err) => Ok(false),
            Err(err) => Err(format!("head object {key} failed: {err}")),
        }
    }

    /// Lists every key under `prefix`, following continuation tokens.
    pub async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, String> {
        let mut keys = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let output = self
                .client
                .list_objects_v2()
                .bucket(self.bucket.as_str())
                .prefix(prefix)
                .set_continuation_token(token.take())
                .send()
                .await
                .map_err(|err| format!("list objects {prefix} failed: {err}"))?;
            keys.extend(
                output
                    .contents()
                    .iter()
                    .filter_map(|object| object.key().map(str::to_string)),
            );
            match output.next_continuation_token() {
                Some(next) => token = Some(next.to_string()),
                None => break,
            }
        }
        Ok(keys)
    }

    pub async fn delete_prefix(&self, prefix: &str) -> Result<usize, String> {
        let keys = self.list_keys(prefix).await?;
        for chunk in keys.chunks(DELETE_BATCH) {
            let objects = chunk
                .iter()
                .map(|key| ObjectIdentifier::builder().key(key).build())
                .collect::<Result<Vec<_>, _>>()
                .map_err(|err| format!("delete request failed: {err}"))?;
            let delete = Delete::builder()
                .set_objects(Some(objects))
                .build()
                .map_err(|err| format!("delete request failed: {err}"))?;
            self.client
                .delete_objects()
                .bucket(self.bucket.as_str())
                .delete(delete)
                .send()
                .await
                .map_err(|err| format!("delete objects {prefix} failed: {err}"))?;
        }
        Ok(keys.len())
    }

    /// Creates the bucket on first use; later calls are free.
    async fn ensure_bucket(&self) -> Result<(), String> {
        self.bucket_ready
            .get_or_try_init(|| async {
                let exists = self
                    .client
                    .head_bucket()
                    .bucket(self.bucket.as_str())
                    .send()
                    .await
                    .is_ok();
                if !exists {
                    self.client
                        .create_bucket()
                        .bucket(self.bucket.as_str())
                        .send()
                        .await
                        .map_err(|err| format!("create bucket {} failed: {err}", self.bucket))?;
                    tracing::info!(bucket = self.bucket.as_str(), "bucket created");
                }
                Ok::<(), String>(())
            })
            .await
            .map(|_| ())
    }
}

pub fn object_url(endpoint: &str, bucket: &str, key: &str) -> String {
    format!("{}/{}/{}", endpoint.trim_end_matches('/'), bucket, key)
}

fn is_missing_object(err: &SdkError<HeadObjectError>) -> bool {
    err.as_service_error().is_some_and(HeadObjectError::is_not_found)
}

pub fn project_prefix(project_id: Uuid) -> String {
    format!("{DATA_ROOT}/{project_id}/")
}

pub fn dem_key(project_id: Uuid) -> String {
    format!("{DATA_ROOT}/{project_id}/dem.tif")
}

pub fn screenshot_key(project_id: Uuid) -> String {
    format!("{DATA_ROOT}/{project_id}/map_screenshot.png")
}

pub fn task_images_prefix(project_id: Uuid, task_id: Uuid) -> String {
    format!("{DATA_ROOT}/{project_id}/{task_id}/images/")
}

pub fn task_assets_key(project_id: Uuid, task_id: Uuid) -> String {
    format!("{DATA_ROOT}/{project_id}/{task_id}/assets.zip")
}

/// Keys of image files, ignoring folder markers and sidecar files.
pub fn image_keys(keys: Vec<String>) -> Vec<String> {
    keys.into_iter()
        .filter(|key| {
            let lower = key.to_ascii_lowercase();
            [".jpg", ".jpeg", ".png", ".tif", ".tiff"]
                .iter()
                .any(|ext| lower.ends_with(ext))
        })
        .collect()
}

pub fn file_name(key: &str) -> &str {
    key.rsplit('/').next().unwrap_or(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use aws_sdk_s3::types::error::NotFound;

    #[test]
    fn only_not_found_means_missing() {
        assert!(HeadObjectError::NotFound(NotFound::builder().build()).is_not_found());

        let offline = SdkError::<HeadObjectError>::construction_failure("endpoint unreachable");
        assert!(!is_missing_object(&offline));
        let slow = SdkError::<HeadObjectError>::timeout_error("head object timed out");
        assert!(!is_missing_object(&slow));
    }

    #[test]
    fn key_layout() {
        let project = Uuid::nil();
        let task = Uuid::from_u128(1);
        assert_eq!(
            dem_key(project),
            "dtm-data/projects/00000000-0000-0000-0000-000000000000/dem.tif"
        );
        assert!(task_images_prefix(project, task).ends_with("0000-000000000001/images/"));
        assert!(task_assets_key(project, task).starts_with(&project_prefix(project)));
        assert!(screenshot_key(project).ends_with("/map_screenshot.png"));
    }

    #[test]
    fn object_urls_are_path_style() {
        assert_eq!(
            object_url("http://minio:9000/", "dtm-bucket", "a/b.zip"),
            "http://minio:9000/dtm-bucket/a/b.zip"
        );
    }

    #[test]
    fn image_filter_and_names() {
        let keys = vec![
            "p/t/images/".to_string(),
            "p/t/images/DJI_0001.JPG".to_string(),
            "p/t/images/flight.log".to_string(),
            "p/t/images/DJI_0002.jpeg".to_string(),
        ];
        let images = image_keys(keys);
        assert_eq!(images.len(), 2);
        assert_eq!(file_name(&images[0]), "DJI_0001.JPG");
        assert_eq!(file_name("plain"), "plain");
    }
}
