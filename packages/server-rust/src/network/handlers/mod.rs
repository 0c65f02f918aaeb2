//! axum handlers and the state they share.

pub mod gateway;
pub mod health;

pub use gateway::gateway_handler;
pub use health::{health_handler, liveness_handler, readiness_handler};

use std::sync::Arc;
use std::time::Instant;

use super::{NetworkConfig, ShutdownController};
use crate::dispatch::DispatchPipeline;
use crate::service::runtime::RuntimeContext;

/// Shared state handed to every handler. Cloning is cheap.
#[derive(Clone)]
pub struct AppState {
    /// Dispatch pipeline; clones share one concurrency budget.
    pub pipeline: DispatchPipeline,
    pub runtime: Arc<RuntimeContext>,
    pub shutdown: Arc<ShutdownController>,
    pub config: Arc<NetworkConfig>,
    pub start_time: Instant,
}
