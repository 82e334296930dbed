use thiserror::Error;

/// Transport failures talking to a remote completion or embedding endpoint.
///
/// Any of these aborts the task that hit it; the batch keeps going.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("request timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("stream error: {0}")]
    Stream(String),

    #[error("malformed response: {0}")]
    Response(String),
}

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("stored vector has {len} bytes, not a multiple of 4")]
    CorruptVector { len: usize },

    #[error("cache lock poisoned")]
    Poisoned,
}

#[derive(Error, Debug)]
pub enum RetrievalError {
    #[error("embedding model {model_id} produces {actual}-dim vectors, expected {expected}")]
    ModelMismatch {
        model_id: String,
        expected: usize,
        actual: usize,
    },

    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("embedding failed: {0}")]
    Embedding(#[from] ApiError),

    #[error("cache failed: {0}")]
    Cache(#[from] CacheError),
}

pub type CacheResult<T> = std::result::Result<T, CacheError>;
