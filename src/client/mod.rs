pub mod local_db;
pub mod server_api;
pub mod uploader;
pub mod walker;

use std::time::Duration;

use thiserror::Error;

use crate::config::ClientConfig;

pub use local_db::{LocalDirectory, LocalFile, LocalProject, ProjectDb};
pub use server_api::ServerApi;
pub use uploader::{upload_project_tree, UploadSummary};
pub use walker::TreeEntry;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("server returned {status}: {message}")]
    Server { status: u16, message: String },
    #[error("local database error: {0}")]
    Database(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("cancelled")]
    Cancelled,
    #[error("retries exhausted: {0}")]
    RetriesExhausted(String),
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl From<sqlx::Error> for ClientError {
    fn from(err: sqlx::Error) -> Self {
        ClientError::Database(err.to_string())
    }
}

impl ClientError {
    /// Transport failures and server-side trouble are worth retrying; a
    /// 4xx means the request itself is wrong and a retry cannot help.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Request(_) => true,
            ClientError::Server { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

/// Randomized wait between retries: uniform in
/// `[min_wait, min_wait + max_wait)` milliseconds.
#[derive(Debug, Clone)]
pub struct Backoff {
    pub min_wait_ms: u64,
    pub max_wait_ms: u64,
    /// `None` keeps retrying until cancelled.
    pub max_retries: Option<u32>,
}

impl Backoff {
    pub fn from_config(config: &ClientConfig) -> Self {
        Backoff {
            min_wait_ms: config.min_wait_ms,
            max_wait_ms: config.max_wait_ms,
            max_retries: config.max_retries,
        }
    }

    pub fn delay(&self) -> Duration {
        use rand::Rng;
        let millis = if self.max_wait_ms == 0 {
            self.min_wait_ms
        } else {
            rand::thread_rng().gen_range(self.min_wait_ms..self.min_wait_ms + self.max_wait_ms)
        };
        Duration::from_millis(millis)
    }
}
