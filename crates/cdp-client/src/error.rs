use thiserror::Error;

/// Errors surfaced by the CDP client.
#[derive(Clone, Debug, Error)]
pub enum CdpError {
    #[error("failed to connect to devtools endpoint: {0}")]
    Connect(String),

    #[error("cdp transport failure: {0}")]
    Io(String),

    /// The browser answered the call with a protocol-level error object.
    #[error("cdp error {code}: {message}")]
    Protocol { code: i64, message: String },

    #[error("cdp client is closed")]
    Closed,

    #[error("cdp call timed out: {0}")]
    Timeout(String),

    #[error("failed to decode cdp payload: {0}")]
    Decode(String),
}

impl CdpError {
    /// Protocol and decode errors leave the connection usable; everything
    /// else means the client should be considered gone.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, CdpError::Protocol { .. } | CdpError::Decode(_))
    }
}
