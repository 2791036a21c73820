//! Degenerate triggers: `Always` completes immediately, `Never` leaves the
//! timeout as the only way out (useful for exercising that path).

use async_trait::async_trait;
use cdp_client::CdpError;

use crate::triggers::{CompletionTrigger, TriggerEnv};
use crate::types::CompletionType;

pub struct AlwaysTrigger;

#[async_trait]
impl CompletionTrigger for AlwaysTrigger {
    async fn init(&mut self, _env: &TriggerEnv) -> Result<(), CdpError> {
        Ok(())
    }

    async fn wait(&mut self) -> CompletionType {
        CompletionType::Always
    }

    async fn close(&mut self) {}
}

pub struct NeverTrigger;

#[async_trait]
impl CompletionTrigger for NeverTrigger {
    async fn init(&mut self, _env: &TriggerEnv) -> Result<(), CdpError> {
        Ok(())
    }

    async fn wait(&mut self) -> CompletionType {
        futures::future::pending::<()>().await;
        unreachable!()
    }

    async fn close(&mut self) {}
}
