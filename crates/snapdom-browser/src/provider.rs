//! The seam between the render layer and whichever browser supply is
//! configured: a supervised local pair or an external debugging endpoint.

use async_trait::async_trait;

use crate::error::Result;
use crate::handle::BrowserHandle;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProviderStatus {
    Initial,
    Starting,
    Running,
    Closing,
    Closed,
}

#[async_trait]
pub trait BrowserProvider: Send + Sync {
    /// Bring the provider up. Rejects with a logic error unless Initial.
    async fn start(&self) -> Result<()>;

    /// Idempotent; concurrent callers share one teardown.
    async fn close(&self);

    /// A handle over the currently serving browser, or `None` when no
    /// browser can serve right now (still starting, faulted, disconnected).
    async fn create_handle(&self) -> Result<Option<BrowserHandle>>;

    async fn status(&self) -> ProviderStatus;
}
