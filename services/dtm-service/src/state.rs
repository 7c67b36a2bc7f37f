use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_postgres::Client;

use crate::config::Settings;
use crate::odm::OdmClient;
use crate::storage::StorageClient;

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<Mutex<Client>>,
    pub storage: Option<StorageClient>,
    pub odm: Option<OdmClient>,
    /// Shared client for outbound lookups such as reverse geocoding.
    pub http: reqwest::Client,
    pub settings: Arc<Settings>,
}
