//! Test doubles and helpers shared by the unit tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use busline_core::{new_cid, AuthResult, ChannelDescriptor, ChannelParams, ChannelType};
use bytes::Bytes;
use parking_lot::Mutex;

use crate::dispatch::request::{DispatchRequest, RequestMeta};
use crate::dispatch::{build_dispatch_pipeline, RequestDispatcher};
use crate::network::{AppState, NetworkConfig, ShutdownController};
use crate::service::config::RuntimeConfig;
use crate::service::error::{IdentityLinkError, InvocationError, RateLimitError};
use crate::service::instance::ServiceInstance;
use crate::service::invoker::CallerIdentity;
use crate::service::runtime::{RuntimeBuilder, RuntimeContext};
use crate::traits::{
    AuditLog, ChannelMatch, ChannelRegistry, DataReceived, DataSent, IdentityLinker, RateLimitScope,
    RateLimiter, SecurityGate, ServiceRegistry,
};

// ---------------------------------------------------------------------------
// Runtime construction
// ---------------------------------------------------------------------------

pub fn runtime_builder(services: Arc<dyn ServiceRegistry>) -> RuntimeBuilder {
    RuntimeContext::builder(RuntimeConfig::default(), services)
}

pub fn runtime_builder_with(services: Arc<dyn ServiceRegistry>, config: RuntimeConfig) -> RuntimeBuilder {
    RuntimeContext::builder(config, services)
}

pub fn runtime(services: Arc<dyn ServiceRegistry>) -> Arc<RuntimeContext> {
    runtime_builder(services).build().unwrap()
}

pub fn runtime_with(services: Arc<dyn ServiceRegistry>, config: RuntimeConfig) -> Arc<RuntimeContext> {
    runtime_builder_with(services, config).build().unwrap()
}

/// Handler state over `runtime` with default network settings. Starts in
/// `Starting`; call `shutdown.set_ready()` to accept traffic.
pub fn app_state(runtime: Arc<RuntimeContext>) -> AppState {
    AppState {
        pipeline: build_dispatch_pipeline(RequestDispatcher::new(runtime.clone()), &runtime.config),
        runtime,
        shutdown: Arc::new(ShutdownController::new()),
        config: Arc::new(NetworkConfig::default()),
        start_time: std::time::Instant::now(),
    }
}

pub fn caller(name: &str) -> CallerIdentity {
    CallerIdentity {
        name: name.to_string(),
        impl_id: name.to_string(),
        cid: new_cid(),
        invokes: Vec::new(),
        remote_addr: None,
        channel_type: ChannelType::Invoke,
        cancellation: None,
    }
}

pub fn request(method: &str, path: &str) -> DispatchRequest {
    DispatchRequest::new(RequestMeta::new(method, path), Bytes::new())
}

/// Polls `cond` until it holds. Panics after roughly two seconds.
pub async fn wait_until(cond: impl Fn() -> bool) {
    for _ in 0..400 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached");
}

// ---------------------------------------------------------------------------
// CallLog
// ---------------------------------------------------------------------------

/// Ordered record of named events, shared between clones.
#[derive(Debug, Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<String>>>);

impl CallLog {
    pub fn push(&self, entry: &str) {
        self.0.lock().push(entry.to_string());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().clone()
    }

    pub fn count(&self, entry: &str) -> usize {
        self.0.lock().iter().filter(|e| *e == entry).count()
    }

    pub fn clear(&self) {
        self.0.lock().clear();
    }
}

// ---------------------------------------------------------------------------
// Recording collaborators
// ---------------------------------------------------------------------------

/// Records every scope it is asked about; allows or refuses everything.
#[derive(Debug, Default)]
pub struct RecordingRateLimiter {
    refuse: bool,
    scopes: Mutex<Vec<String>>,
    log: Option<CallLog>,
}

impl RecordingRateLimiter {
    pub fn allowing() -> Self {
        Self::default()
    }

    pub fn exhausted() -> Self {
        Self {
            refuse: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_log(mut self, log: CallLog) -> Self {
        self.log = Some(log);
        self
    }

    /// `object_type:name` of every checked scope, in order.
    pub fn scopes(&self) -> Vec<String> {
        self.scopes.lock().clone()
    }
}

impl RateLimiter for RecordingRateLimiter {
    fn check_limit(&self, scope: &RateLimitScope, _key: &str, _cid: &str) -> Result<(), RateLimitError> {
        let label = format!("{}:{}", scope.object_type, scope.name);
        self.scopes.lock().push(label.clone());
        if let Some(log) = &self.log {
            log.push("rate_limit");
        }
        if self.refuse {
            return Err(RateLimitError::LimitReached { scope: label });
        }
        Ok(())
    }
}

/// Logs `security` on every check.
#[derive(Debug)]
pub struct RecordingGate {
    allow: bool,
    log: CallLog,
}

impl RecordingGate {
    /// Accepts every request, authenticating as the definition's username.
    pub fn allowing(log: CallLog) -> Self {
        Self { allow: true, log }
    }

    /// Refuses every request with a Basic challenge.
    pub fn denying(log: CallLog) -> Self {
        Self { allow: false, log }
    }
}

#[async_trait]
impl SecurityGate for RecordingGate {
    async fn check_security(
        &self,
        channel: &ChannelDescriptor,
        _cid: &str,
        _raw_body: &[u8],
        _meta: &RequestMeta,
        _post: Option<&ChannelParams>,
    ) -> Result<Option<AuthResult>, InvocationError> {
        self.log.push("security");
        if !self.allow {
            return Err(InvocationError::unauthorized(
                "denied",
                Some("Basic realm=\"busline\"".to_string()),
            ));
        }
        Ok(channel.security.as_ref().map(|s| AuthResult {
            security_id: s.id,
            security_type: s.sec_type,
            username: s.username.clone(),
            raw_token: Some("token".to_string()),
        }))
    }
}

/// Logs `match` and delegates.
pub struct RecordingChannels {
    inner: Arc<dyn ChannelRegistry>,
    log: CallLog,
}

impl RecordingChannels {
    pub fn new(inner: Arc<dyn ChannelRegistry>, log: CallLog) -> Self {
        Self { inner, log }
    }
}

impl ChannelRegistry for RecordingChannels {
    fn match_request(&self, path: &str, method: &str, accept_key: &str) -> Option<ChannelMatch> {
        self.log.push("match");
        self.inner.match_request(path, method, accept_key)
    }
}

#[derive(Debug, Default)]
pub struct RecordingAudit {
    received: Mutex<Vec<DataReceived>>,
    sent: Mutex<Vec<DataSent>>,
}

impl RecordingAudit {
    pub fn received(&self) -> Vec<DataReceived> {
        self.received.lock().clone()
    }

    pub fn sent(&self) -> Vec<DataSent> {
        self.sent.lock().clone()
    }
}

impl AuditLog for RecordingAudit {
    fn store_received(&self, event: DataReceived) {
        self.received.lock().push(event);
    }

    fn store_sent(&self, event: DataSent) {
        self.sent.lock().push(event);
    }
}

/// Identity linker that always fails with the given error.
pub struct FailingLinker(pub IdentityLinkError);

#[async_trait]
impl IdentityLinker for FailingLinker {
    async fn on_external_auth(
        &self,
        _linked_identity: &str,
        _auth: &AuthResult,
        _cid: &str,
    ) -> Result<(), IdentityLinkError> {
        Err(self.0.clone())
    }
}

/// Service registry wrapper counting `new_instance` calls.
pub struct CountingRegistry<R> {
    inner: R,
    new_instance_calls: AtomicUsize,
}

impl<R: ServiceRegistry> CountingRegistry<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            new_instance_calls: AtomicUsize::new(0),
        }
    }

    pub fn inner(&self) -> &R {
        &self.inner
    }

    pub fn new_instance_calls(&self) -> usize {
        self.new_instance_calls.load(Ordering::SeqCst)
    }
}

impl<R: ServiceRegistry> ServiceRegistry for CountingRegistry<R> {
    fn new_instance(&self, impl_id: &str) -> Result<(ServiceInstance, bool), InvocationError> {
        self.new_instance_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.new_instance(impl_id)
    }

    fn resolve_name_to_impl(&self, name: &str) -> Result<String, InvocationError> {
        self.inner.resolve_name_to_impl(name)
    }

    fn resolve_id_to_impl(&self, id: u64) -> Result<String, InvocationError> {
        self.inner.resolve_id_to_impl(id)
    }

    fn contains_name(&self, name: &str) -> bool {
        self.inner.contains_name(name)
    }
}
