//! Collaborator contracts consumed by the dispatch core.
//!
//! The runtime owns none of these concerns; it only calls them in a fixed
//! order. Reference in-memory implementations live in [`crate::collab`].

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use busline_core::{AuthResult, CacheType, ChannelDescriptor, ChannelParams, Payload};

use crate::dispatch::request::RequestMeta;
use crate::service::error::{IdentityLinkError, InvocationError, RateLimitError};
use crate::service::instance::ServiceInstance;

/// Result of a successful route match.
#[derive(Debug, Clone)]
pub struct ChannelMatch {
    pub path_params: ChannelParams,
    pub channel: Arc<ChannelDescriptor>,
}

/// Resolves inbound requests to channels.
pub trait ChannelRegistry: Send + Sync {
    /// `accept_key` is the normalized Accept value (see
    /// [`crate::dispatch::request::normalize_accept`]).
    fn match_request(&self, path: &str, method: &str, accept_key: &str) -> Option<ChannelMatch>;
}

/// Authenticates a request against the channel's security definition.
#[async_trait]
pub trait SecurityGate: Send + Sync {
    /// Returns `Ok(None)` when the channel carries no security definition
    /// and the gate lets the request through.
    ///
    /// `post` holds form data parsed ahead of the gate for security types
    /// that read credentials from the body.
    async fn check_security(
        &self,
        channel: &ChannelDescriptor,
        cid: &str,
        raw_body: &[u8],
        meta: &RequestMeta,
        post: Option<&ChannelParams>,
    ) -> Result<Option<AuthResult>, InvocationError>;
}

/// Secondary identity system a security definition can be linked to.
#[async_trait]
pub trait IdentityLinker: Send + Sync {
    async fn on_external_auth(
        &self,
        linked_identity: &str,
        auth: &AuthResult,
        cid: &str,
    ) -> Result<(), IdentityLinkError>;
}

/// What a rate limit applies to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateLimitScope {
    pub object_type: &'static str,
    pub name: String,
}

impl RateLimitScope {
    pub fn channel(name: impl Into<String>) -> Self {
        Self {
            object_type: "http_soap",
            name: name.into(),
        }
    }

    pub fn service(name: impl Into<String>) -> Self {
        Self {
            object_type: "service",
            name: name.into(),
        }
    }
}

pub trait RateLimiter: Send + Sync {
    /// # Errors
    ///
    /// Returns the reason the call is refused.
    fn check_limit(&self, scope: &RateLimitScope, key: &str, cid: &str) -> Result<(), RateLimitError>;
}

/// Request payload recorded before the service runs.
#[derive(Debug, Clone, PartialEq)]
pub struct DataReceived {
    pub object_type: &'static str,
    pub object_id: u64,
    pub data: Vec<u8>,
    pub timestamp: SystemTime,
    pub msg_id: String,
}

/// Response payload recorded after the service ran.
#[derive(Debug, Clone, PartialEq)]
pub struct DataSent {
    pub object_type: &'static str,
    pub object_id: u64,
    pub data: Vec<u8>,
    pub timestamp: SystemTime,
    pub msg_id: String,
    pub in_reply_to: String,
}

/// Fire-and-forget audit sink. Implementations must not block.
pub trait AuditLog: Send + Sync {
    fn store_received(&self, event: DataReceived);
    fn store_sent(&self, event: DataSent);
}

/// Byte-oriented response cache. Absence is `None`, never an error.
pub trait ResponseCache: Send + Sync {
    fn get(&self, cache_type: CacheType, name: &str, key: &str) -> Option<Vec<u8>>;
    /// `ttl` of `None` keeps the entry until evicted.
    fn set(&self, cache_type: CacheType, name: &str, key: &str, value: Vec<u8>, ttl: Option<Duration>);
}

/// Creates service instances and resolves service identifiers.
pub trait ServiceRegistry: Send + Sync {
    /// Returns a fresh, unbound instance and whether the service is active.
    ///
    /// # Errors
    ///
    /// Returns [`InvocationError::NotFound`] for unknown implementations.
    fn new_instance(&self, impl_id: &str) -> Result<(ServiceInstance, bool), InvocationError>;

    /// # Errors
    ///
    /// Returns [`InvocationError::NotFound`] for unknown names.
    fn resolve_name_to_impl(&self, name: &str) -> Result<String, InvocationError>;

    /// # Errors
    ///
    /// Returns [`InvocationError::NotFound`] for unknown ids.
    fn resolve_id_to_impl(&self, id: u64) -> Result<String, InvocationError>;

    fn contains_name(&self, name: &str) -> bool;
}

/// Why a payload failed schema validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaFailure {
    pub short: String,
    pub details: String,
    /// Return `details` to the caller instead of the short message.
    pub needs_details: bool,
}

impl From<SchemaFailure> for InvocationError {
    fn from(failure: SchemaFailure) -> Self {
        Self::SchemaValidation {
            short: failure.short,
            details: failure.details,
            needs_details: failure.needs_details,
        }
    }
}

/// Validates request payloads before any hook runs.
pub trait SchemaValidator: Send + Sync + std::fmt::Debug {
    /// Validation is skipped until the validator is initialized.
    fn is_initialized(&self) -> bool;

    /// # Errors
    ///
    /// Returns the failure when the payload does not conform.
    fn validate(&self, cid: &str, payload: &Payload) -> Result<(), SchemaFailure>;
}
