//! Inbound request path.
//!
//! A transport adapter turns its native request into a [`DispatchRequest`]
//! and sends it through the pipeline built by [`build_dispatch_pipeline`]:
//!
//! 1. **Middleware** (`middleware`): load shedding, span and metrics
//! 2. **Dispatcher** (`dispatcher`): method check, routing, security, rate
//!    limiting, audit and error mapping
//! 3. **Handler** (`handler`): parameters, response cache, service invocation

pub mod dispatcher;
pub mod handler;
pub mod middleware;
pub mod request;

pub use dispatcher::RequestDispatcher;
pub use handler::{HandlerResponse, RequestHandler};
pub use middleware::{build_dispatch_pipeline, DispatchPipeline};
pub use request::{DispatchRequest, DispatchResponse, RequestMeta};
