//! snapdom: a local HTTP service that renders web pages into their
//! post-JavaScript HTML by driving headless Chromium over CDP.
//!
//! The heavy lifting lives in the workspace crates: `snapdom-browser`
//! (process supervision and providers) and `snapdom-renderer` (per-request
//! tab coordination). This crate wires them to configuration and the HTTP
//! surface.

pub mod config;
pub mod render_manager;
pub mod server;

pub use config::{ConfigError, ProviderConfig, ServiceConfig};
pub use render_manager::{RenderDefaults, RenderManager, RenderRequestBody, TriggerRequest};
pub use server::{build_router, AppState};
