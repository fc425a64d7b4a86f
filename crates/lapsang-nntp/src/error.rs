use thiserror::Error;

#[derive(Debug, Error)]
pub enum NntpError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("Temporary failure {code}: {message}")]
    Temporary { code: u16, message: String },

    #[error("Permanent failure {code}: {message}")]
    Permanent { code: u16, message: String },

    #[error("Unexpected response {0}: {1}")]
    UnexpectedResponse(u16, String),

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Data error: {0}")]
    DataError(String),

    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    #[error("Authentication required")]
    AuthRequired,

    #[error("Article not found: {0}")]
    ArticleNotFound(String),

    #[error("Connection timed out")]
    Timeout,
}

impl NntpError {
    /// The status code carried by the error, when there is one.
    pub fn code(&self) -> Option<u16> {
        match self {
            Self::Temporary { code, .. } | Self::Permanent { code, .. } => Some(*code),
            Self::UnexpectedResponse(code, _) => Some(*code),
            Self::AuthRequired => Some(480),
            _ => None,
        }
    }
}
