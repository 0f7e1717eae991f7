use thiserror::Error;

/// Errors surfaced by the upload core.
///
/// Handlers map these onto HTTP statuses (400/401/404/500); everything the
/// services return funnels through this one enum so callers can match on
/// the kind instead of the underlying cause.
#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid request: {0}")]
    Invalid(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("no access")]
    NoAccess,
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Error::Invalid(msg.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Error::NotFound(what.into())
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Error::NotFound("row not found".to_string()),
            other => Error::Internal(format!("database error: {}", other)),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Internal(format!("io error: {}", err))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
