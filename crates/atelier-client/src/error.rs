//! Client error types.

/// Errors returned by the client SDK.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Transport failure.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The API answered with a failure envelope.
    #[error("API error ({status}): {message}")]
    Api {
        /// HTTP status.
        status: u16,
        /// Stable machine-readable code, when present.
        code: Option<String>,
        /// Human-readable message.
        message: String,
    },

    /// No usable session; the caller must authenticate.
    #[error("not authenticated")]
    NotAuthenticated,

    /// The response body did not match the envelope contract.
    #[error("failed to decode response: {0}")]
    Decode(String),
}

impl ClientError {
    /// The stable error code, when the server sent one.
    #[must_use]
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Api { code, .. } => code.as_deref(),
            _ => None,
        }
    }
}
