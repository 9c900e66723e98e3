//! Error types for the cloud control-plane client.

use thiserror::Error;

/// Errors raised by [`super::CloudClient`].
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum CloudError {
    /// Raised when a credential or endpoint needed to authenticate is unset.
    #[error("missing cloud credential: set OS_{} to authenticate", .0.to_uppercase())]
    MissingCredential(&'static str),
    /// Raised when the identity service rejects the credentials.
    #[error("authentication failed with status {status}: {body}")]
    Auth {
        /// HTTP status returned by the identity service.
        status: u16,
        /// Response body returned alongside the status.
        body: String,
    },
    /// Raised when the compute API answers with an unexpected status.
    #[error("{method} {url} returned status {status}: {body}")]
    Api {
        /// HTTP method of the failed request.
        method: String,
        /// Full URL of the failed request.
        url: String,
        /// HTTP status returned by the API.
        status: u16,
        /// Response body returned alongside the status.
        body: String,
    },
    /// Raised when no image carries the requested name.
    #[error("image '{0}' not found")]
    UnknownImage(String),
    /// Raised when no flavor carries the requested name.
    #[error("flavor '{0}' not found")]
    UnknownFlavor(String),
    /// Raised when no network carries the requested label.
    #[error("network '{0}' not found")]
    UnknownNetwork(String),
    /// Wrapper for connection failures and timeouts at the HTTP layer.
    #[error("transport error: {message}")]
    Transport {
        /// Message reported by the HTTP client.
        message: String,
    },
    /// Raised when a successful response cannot be decoded.
    #[error("failed to decode response from {url}: {message}")]
    Decode {
        /// URL whose response failed to decode.
        url: String,
        /// Decoder message.
        message: String,
    },
}

impl CloudError {
    /// Returns `true` for failures that originate from credentials.
    #[must_use]
    pub const fn is_auth(&self) -> bool {
        matches!(self, Self::MissingCredential(_) | Self::Auth { .. })
    }
}

impl From<reqwest::Error> for CloudError {
    fn from(value: reqwest::Error) -> Self {
        Self::Transport {
            message: value.to_string(),
        }
    }
}
