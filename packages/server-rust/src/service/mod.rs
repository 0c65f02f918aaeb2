//! Service invocation.
//!
//! 1. **Definitions** (`definition`): handler plus optional lifecycle hooks
//! 2. **Registry** (`registry`): name and id lookup, fresh instances per call
//! 3. **Engine** (`engine`): the fixed hook pipeline around a handler
//! 4. **Invoker** (`invoker`): synchronous and asynchronous service-to-service
//!    calls, fan-out and parallel patterns (`patterns`)
//! 5. **Runtime** (`runtime`): the shared context every request runs against

pub mod config;
pub mod definition;
pub mod engine;
pub mod error;
pub mod instance;
pub mod invoker;
pub mod matcher;
pub mod patterns;
pub mod registry;
pub mod runtime;

pub use config::RuntimeConfig;
pub use definition::{handler_fn, Handler, HookSet, JobType, ServiceDefinition};
pub use engine::ResponseMode;
pub use error::{ChannelRegistryError, IdentityLinkError, InvocationError, RateLimitError};
pub use instance::{ServiceInstance, ServiceRequest, ServiceResponse};
pub use invoker::{CallerIdentity, Callback, InvokeOptions, Invoker};
pub use matcher::Matcher;
pub use patterns::{FanOut, ParallelExec, PatternKind, PatternRegistry};
pub use registry::ServiceStore;
pub use runtime::{RuntimeBuilder, RuntimeContext};
