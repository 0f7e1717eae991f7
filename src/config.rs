use std::path::PathBuf;

use crate::error::{Error, Result};

/// Server configuration, assembled from environment variables with
/// command-line overrides applied on top.
///
/// Recognized variables: `MCDIR` (storage root), `MCDB_CONNECTION`,
/// `MCDB_NAME`, `MCDB_TYPE` (catalog database), and
/// `MCSTORED_MONITOR_USERS` (enables the API-key cache refresher).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Root of the on-disk store. Staging lives under `<mcdir>/upload`,
    /// committed content under the two-level shard of the file id.
    pub mcdir: PathBuf,
    /// Catalog database connection string (a sqlite path).
    pub db_connection: String,
    /// Database name, joined onto the connection string when it points at
    /// a directory.
    pub db_name: String,
    /// Database type. Only "sqlite" is supported.
    pub db_type: String,
    pub http_port: u16,
    /// When true, a background task periodically reloads users from the
    /// catalog so revoked or rotated API keys fall out of the cache.
    pub monitor_users: bool,
}

impl ServerConfig {
    /// Load configuration from the environment. A `.env` file is honored
    /// in dev setups.
    pub fn from_env() -> Result<Self> {
        let _ = dotenvy::dotenv();

        let mcdir =
            std::env::var("MCDIR").map_err(|_| Error::invalid("MCDIR is not set"))?;
        let db_connection = std::env::var("MCDB_CONNECTION")
            .map_err(|_| Error::invalid("MCDB_CONNECTION is not set"))?;
        let db_name = std::env::var("MCDB_NAME").unwrap_or_default();
        let db_type = std::env::var("MCDB_TYPE").unwrap_or_else(|_| "sqlite".to_string());

        let config = ServerConfig {
            mcdir: PathBuf::from(mcdir),
            db_connection,
            db_name,
            db_type,
            http_port: 5010,
            monitor_users: env_flag("MCSTORED_MONITOR_USERS"),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.db_type != "sqlite" {
            return Err(Error::invalid(format!(
                "unsupported MCDB_TYPE {:?}, only sqlite is supported",
                self.db_type
            )));
        }
        if self.db_connection.trim().is_empty() {
            return Err(Error::invalid("MCDB_CONNECTION cannot be empty"));
        }
        Ok(())
    }

    /// Path of the catalog database file. `MCDB_NAME` is joined on when
    /// the connection string points at a directory.
    pub fn database_path(&self) -> PathBuf {
        let base = PathBuf::from(&self.db_connection);
        if self.db_name.is_empty() {
            base
        } else {
            base.join(&self.db_name)
        }
    }
}

pub const DEFAULT_MIN_WAIT_MS: u64 = 100;
pub const DEFAULT_MAX_WAIT_MS: u64 = 5000;

/// Client configuration for the uploader.
///
/// Recognized variables: `mcurl` (server base URL) and `apikey`.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub mcurl: String,
    pub apikey: String,
    pub num_threads: usize,
    /// Lower bound of the randomized retry wait, in milliseconds.
    pub min_wait_ms: u64,
    /// Width of the randomized retry wait window, in milliseconds.
    pub max_wait_ms: u64,
    /// Attempt cap for network retries. `None` retries until cancelled.
    pub max_retries: Option<u32>,
}

impl ClientConfig {
    pub fn from_env() -> Result<Self> {
        let _ = dotenvy::dotenv();

        let mcurl = std::env::var("mcurl").map_err(|_| Error::invalid("mcurl is not set"))?;
        let apikey = std::env::var("apikey").map_err(|_| Error::invalid("apikey is not set"))?;

        Ok(ClientConfig {
            mcurl,
            apikey,
            num_threads: 4,
            min_wait_ms: DEFAULT_MIN_WAIT_MS,
            max_wait_ms: DEFAULT_MAX_WAIT_MS,
            max_retries: None,
        })
    }
}

fn env_flag(name: &str) -> bool {
    matches!(
        std::env::var(name).as_deref(),
        Ok("1") | Ok("true") | Ok("TRUE") | Ok("yes")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn database_path_joins_name_onto_directory_connection() {
        let config = ServerConfig {
            mcdir: PathBuf::from("/tmp/mcdir"),
            db_connection: "/var/lib/depot".to_string(),
            db_name: "catalog.db".to_string(),
            db_type: "sqlite".to_string(),
            http_port: 5010,
            monitor_users: false,
        };
        assert_eq!(
            config.database_path(),
            PathBuf::from("/var/lib/depot/catalog.db")
        );
    }

    #[test]
    fn rejects_non_sqlite_db_type() {
        let config = ServerConfig {
            mcdir: PathBuf::from("/tmp/mcdir"),
            db_connection: "x".to_string(),
            db_name: String::new(),
            db_type: "rethinkdb".to_string(),
            http_port: 5010,
            monitor_users: false,
        };
        assert!(config.validate().is_err());
    }
}
