use thiserror::Error;

#[derive(Error, Debug)]
pub enum HozonError {
    #[error("HTTP error: {0}")]
    HttpError(reqwest::StatusCode),

    #[error("No media playlist found in master playlist")]
    MissingVariant,

    #[error("No playable segment found in playlist")]
    NoSegments,

    #[error("Unsupported key method: {0}")]
    UnsupportedKeyMethod(String),

    #[error("Key URI required for method {0}")]
    KeyUriRequired(String),

    #[error("Invalid AES-128 key: expected 16 bytes, got {0}")]
    InvalidAes128Key(usize),

    #[error("Download cancelled")]
    Cancelled,

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Task is downloading: {0}")]
    TaskRunning(String),

    #[error("Same video is already handled by task {0}")]
    DuplicateTask(String),

    #[error(transparent)]
    IOError(#[from] std::io::Error),

    #[error(transparent)]
    UrlParseError(#[from] url::ParseError),

    #[error(transparent)]
    RequestError(#[from] reqwest::Error),

    #[error(transparent)]
    JsonError(#[from] serde_json::Error),
}

impl HozonError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, HozonError::Cancelled)
    }
}

pub type HozonResult<T> = Result<T, HozonError>;
