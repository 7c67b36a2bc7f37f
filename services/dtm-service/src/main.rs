mod app;
mod config;
mod db;
mod geocode;
mod geojson;
mod geometry;
mod handlers;
mod kml;
mod models;
mod odm;
mod service;
mod state;
mod storage;
mod task_state;
mod wkb;

use dtm_common::{bind_listener, init_tracing, shutdown_signal};
use std::sync::Arc;
use tokio_postgres::NoTls;

use crate::config::Settings;
use crate::odm::OdmClient;
use crate::state::AppState;
use crate::storage::StorageClient;

const USER_AGENT: &str = concat!("dtm-service/", env!("CARGO_PKG_VERSION"));

#[tokio::main]
async fn main() {
    let _guards = init_tracing("dtm-service");

    let database_url = std::env::var("DATABASE_URL").expect("DATABASE_URL is required");
    let settings = Settings::from_env();

    if let Err(err) = run(&database_url, settings).await {
        tracing::error!(error = %err, "dtm-service stopped");
        std::process::exit(1);
    }
}

async fn run(database_url: &str, settings: Settings) -> Result<(), String> {
    let (db, connection) = tokio_postgres::connect(database_url, NoTls)
        .await
        .map_err(|err| format!("connect db failed: {err}"))?;
    tokio::spawn(async move {
        // Drive the connection in the background.
        if let Err(err) = connection.await {
            tracing::error!(error = %err, "database connection error");
        }
    });

    let http = reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .timeout(settings.http_timeout)
        .build()
        .map_err(|err| format!("http client init failed: {err}"))?;
    let storage = build_storage(&settings).await;
    let odm = build_odm(&settings);

    let port = settings.port;
    let state = AppState {
        db: Arc::new(tokio::sync::Mutex::new(db)),
        storage,
        odm,
        http,
        settings: Arc::new(settings),
    };

    let app = app::build_router(state);
    let listener = bind_listener(port)
        .await
        .map_err(|err| format!("bind port {port} failed: {err}"))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|err| format!("serve failed: {err}"))
}

async fn build_storage(settings: &Settings) -> Option<StorageClient> {
    let Some(config) = settings.storage.clone() else {
        tracing::warn!("S3 settings incomplete; object storage disabled");
        return None;
    };
    match StorageClient::new(config).await {
        Ok(client) => Some(client),
        Err(err) => {
            tracing::warn!(error = %err, "object storage client init failed");
            None
        }
    }
}

fn build_odm(settings: &Settings) -> Option<OdmClient> {
    let Some(url) = settings.node_odm_url.as_deref() else {
        tracing::warn!("NODE_ODM_URL not set; image processing disabled");
        return None;
    };
    match OdmClient::new(url, settings.http_timeout) {
        Ok(client) => Some(client),
        Err(err) => {
            tracing::warn!(error = %err, "odm client init failed");
            None
        }
    }
}
