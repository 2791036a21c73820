use cdp_client::CdpError;
use thiserror::Error;

/// Errors produced by the browser supervision layer.
#[derive(Clone, Debug, Error)]
pub enum BrowserError {
    /// A state-machine precondition was violated. Always a programmer bug,
    /// never an environmental failure.
    #[error("logic error: {0}")]
    Logic(String),

    #[error("failed to spawn browser process: {0}")]
    Spawn(String),

    #[error("devtools endpoint unavailable: {0}")]
    Endpoint(String),

    #[error(transparent)]
    Cdp(#[from] CdpError),
}

impl BrowserError {
    pub fn logic(msg: impl Into<String>) -> Self {
        BrowserError::Logic(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, BrowserError>;
