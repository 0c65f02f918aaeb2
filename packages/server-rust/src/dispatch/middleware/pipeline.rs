//! Pipeline composition: wraps the dispatcher in the middleware stack.

use tower::ServiceBuilder;

use super::load_shed::{LoadShedLayer, LoadShedService};
use super::metrics::{MetricsLayer, MetricsService};
use crate::dispatch::dispatcher::RequestDispatcher;
use crate::service::config::RuntimeConfig;

/// The fully layered dispatcher.
pub type DispatchPipeline = LoadShedService<MetricsService<RequestDispatcher>>;

/// Builds the dispatch pipeline.
///
/// Layer order (outermost to innermost):
/// 1. `LoadShedLayer` -- reject when overloaded, before any work is done
/// 2. `MetricsLayer` -- span, timing and status of admitted requests
///
/// The pipeline is `Clone`; every clone shares one concurrency budget.
#[must_use]
pub fn build_dispatch_pipeline(
    dispatcher: RequestDispatcher,
    config: &RuntimeConfig,
) -> DispatchPipeline {
    ServiceBuilder::new()
        .layer(LoadShedLayer::new(
            config.max_concurrent_requests,
            &config.json_content_type,
        ))
        .layer(MetricsLayer)
        .service(dispatcher)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
