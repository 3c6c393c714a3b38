//! Top-level error types for chatrelay.

/// Crate-wide result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error enum wrapping domain-specific errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Platform(#[from] PlatformError),

    #[error(transparent)]
    Completion(#[from] CompletionError),

    #[error(transparent)]
    Reply(#[from] ReplyError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Configuration loading errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("missing required config key: {0}")]
    MissingKey(String),

    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },
}

/// Chat-platform API errors (message post/update, history, file downloads).
#[derive(Debug, thiserror::Error)]
pub enum PlatformError {
    #[error("platform API call failed: {0}")]
    Api(String),

    #[error("no permission to download file: {url}")]
    FileNotAccessible { url: String },

    #[error("unexpected content type {content_type} for {url}")]
    UnexpectedContentType { url: String, content_type: String },

    #[error("request to {url} failed with status code {status}")]
    DownloadFailed { url: String, status: u16 },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Completion-provider errors.
#[derive(Debug, thiserror::Error)]
pub enum CompletionError {
    #[error("unsupported model: {0}")]
    UnsupportedModel(String),

    #[error("provider request failed: {0}")]
    ProviderRequest(String),

    #[error("invalid provider response: {0}")]
    InvalidResponse(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Recoverable outcomes of a reply session. Callers match on the variant to
/// decide the user-visible rendering; none of these should crash the event
/// handler.
#[derive(Debug, thiserror::Error)]
pub enum ReplyError {
    #[error("the input is too long to be processed ({used_tokens}/{max_tokens} tokens)")]
    Overflow { used_tokens: usize, max_tokens: usize },

    #[error("the model did not respond within the timeout")]
    Timeout,

    #[error("remote tool authentication failed")]
    ToolAuth,

    #[error(transparent)]
    Generic(#[from] anyhow::Error),
}

impl From<PlatformError> for ReplyError {
    fn from(error: PlatformError) -> Self {
        ReplyError::Generic(error.into())
    }
}

impl From<CompletionError> for ReplyError {
    fn from(error: CompletionError) -> Self {
        ReplyError::Generic(error.into())
    }
}
