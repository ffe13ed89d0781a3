//! Embedded chat session client with engagement tracking.
//!
//! # Architecture
//!
//! - `chat`: session protocol client (connect, send, live event stream)
//! - `bus`: in-process publish/subscribe for session lifecycle events
//! - `activity`: batches bus events into one persisted record per session
//! - `db`: SQLite storage for activity records
//! - `config`: typed settings with documented defaults
//! - `host`: render target acquisition for embedding hosts
//! - `console`: terminal host used by the `chatwire` binary

pub mod activity;
pub mod bus;
pub mod chat;
pub mod config;
pub mod console;
pub mod db;
pub mod host;
pub mod retry;

use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;

use activity::ActivityBatcher;
use bus::EventBus;
use chat::{ChatError, SessionProtocolClient};
use config::{ChatSettings, ConfigError};
use db::Database;

// ---------------------------------------------------------------------------
// Shared error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("{0}")]
    Db(#[from] db::DbError),
    #[error("{0}")]
    Chat(#[from] ChatError),
    #[error("{0}")]
    Config(#[from] ConfigError),
    #[error("{0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Other(String),
}

impl Serialize for AppError {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

// ---------------------------------------------------------------------------
// Storage location
// ---------------------------------------------------------------------------

pub fn chatwire_data_dir() -> PathBuf {
    if let Ok(path) = std::env::var("CHATWIRE_DATA_DIR") {
        let trimmed = path.trim();
        if !trimmed.is_empty() {
            return PathBuf::from(trimmed);
        }
    }

    #[cfg(target_os = "windows")]
    {
        if let Ok(app_data) = std::env::var("APPDATA") {
            return PathBuf::from(app_data).join("Chatwire");
        }
    }

    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".chatwire");
    }

    if let Ok(home) = std::env::var("USERPROFILE") {
        return PathBuf::from(home).join(".chatwire");
    }

    PathBuf::from(".chatwire")
}

fn stable_db_path() -> Result<PathBuf, AppError> {
    let data_dir = chatwire_data_dir();
    std::fs::create_dir_all(&data_dir).map_err(|e| {
        AppError::Other(format!(
            "failed to create data directory {}: {e}",
            data_dir.display()
        ))
    })?;
    Ok(data_dir.join("chatwire.db"))
}

// ---------------------------------------------------------------------------
// Application entry point
// ---------------------------------------------------------------------------

pub async fn run() -> Result<(), AppError> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "chatwire_lib=info,warn".parse().expect("valid env filter")),
        )
        .init();

    let settings = ChatSettings::from_env()?;
    let db_path = stable_db_path()?;
    let db = Arc::new(Database::open(&db_path)?);
    tracing::debug!("activity database at {}", db_path.display());

    let bus = Arc::new(EventBus::new());
    let batcher = ActivityBatcher::start(&bus, db.clone(), settings.tracking_options());
    let client = SessionProtocolClient::builder(settings)
        .bus(bus.clone())
        .build()?;

    tracing::info!("chatwire started");
    console::run(client, batcher, db).await
}
