//! Reference in-memory collaborators.
//!
//! Used by the `busline` binary and the test suite. Production deployments
//! plug their own implementations of the [`crate::traits`] contracts into
//! [`crate::service::runtime::RuntimeBuilder`].

pub mod audit;
pub mod cache;
pub mod rate_limit;
pub mod routes;
pub mod schema;
pub mod security;

pub use audit::{AuditEvent, AuditSink, MemoryAuditSink, NoopAuditLog, TracingAuditSink, WorkerAuditLog};
pub use cache::MemoryResponseCache;
pub use rate_limit::{FixedWindowRateLimiter, RateLimitRule, UnlimitedRateLimiter};
pub use routes::RouteTable;
pub use schema::RequiredKeysValidator;
pub use security::CredentialGate;
