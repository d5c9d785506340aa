use std::fmt;

/// Application error taxonomy.
///
/// Fetch/Parse/Write errors are recorded in the surrounding fetcher's
/// summary and the run continues; InvariantViolation and Authentication
/// abort the job. Transient HTTP failures (429, 5xx) are retried inside
/// the API client and only surface as `Fetch` once retries are exhausted.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Fetch error: {0}")]
    Fetch(String),

    #[error("Parse error in document {doc_id}: {detail}")]
    Parse { doc_id: String, detail: String },

    #[error("Write error: {0}")]
    Write(String),

    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("Authentication error: {0}")]
    Authentication(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl AppError {
    /// Construct a `Parse` error for a document, naming the offending field.
    pub fn parse(doc_id: impl fmt::Display, detail: impl fmt::Display) -> Self {
        AppError::Parse {
            doc_id: doc_id.to_string(),
            detail: detail.to_string(),
        }
    }

    /// Process exit code for this error when it aborts a run.
    ///
    /// 2 = configuration error, 3 = authentication error, 1 = everything else.
    pub fn exit_code(&self) -> i32 {
        match self {
            AppError::Config(_) => 2,
            AppError::Authentication(_) => 3,
            _ => 1,
        }
    }
}
