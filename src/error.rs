use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("SLACK_TOKEN environment variable not set")]
    MissingToken,

    #[error("authentication error: {0}")]
    Auth(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Slack API error: {0}")]
    SlackApi(String),

    #[error("Slack rate limit error: retry after {retry_after_secs}s")]
    SlackRateLimit { retry_after_secs: u64 },

    #[error("fetch failed: {0}")]
    Fetch(String),

    #[error("download failed: {0}")]
    Download(String),

    #[error("failed to read file at {path}: {source}")]
    ReadFile {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to write file at {path}: {source}")]
    WriteFile {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("JSON serialization error: {0}")]
    JsonSerialize(String),

    #[error("JSON parse error: {0}")]
    JsonParse(String),

    #[error("TOML parse error: {0}")]
    TomlParse(String),

    #[error("TOML serialization error: {0}")]
    TomlSerialize(String),

    #[error("Markdown conversion error: {0}")]
    MarkdownConvert(String),
}

impl AppError {
    /// Whether a retry with backoff may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AppError::SlackRateLimit { .. } | AppError::Http(_) | AppError::SlackApi(_)
        )
    }

    pub fn is_rate_limit(&self) -> bool {
        matches!(self, AppError::SlackRateLimit { .. })
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, AppError::MissingToken | AppError::Auth(_))
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        AppError::Http(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
