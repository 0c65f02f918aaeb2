//! Per-invocation service state.
//!
//! A [`ServiceInstance`] is created by the service registry for exactly one
//! invocation and dropped once its response has been extracted. Instances are
//! never reused.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use busline_core::{
    ChannelInfo, ChannelParams, ChannelType, DataFormat, ParamsPriority, Payload, Transport,
};
use bytes::Bytes;
use http::StatusCode;
use tokio_util::sync::CancellationToken;

use crate::service::definition::{JobType, ServiceDefinition};
use crate::service::error::InvocationError;
use crate::service::invoker::{CallerIdentity, Invoker};
use crate::service::runtime::RuntimeContext;
use crate::traits::ResponseCache;

/// Request side of an invocation.
#[derive(Debug, Clone, Default)]
pub struct ServiceRequest {
    pub payload: Payload,
    /// Body exactly as received, for services that parse it themselves.
    pub raw_request: Bytes,
    pub http_method: Option<String>,
    pub path: Option<String>,
    pub remote_addr: Option<String>,
    pub headers: BTreeMap<String, String>,
    /// Parameters captured from the URL pattern.
    pub path_params: ChannelParams,
    /// Query and path parameters merged by priority.
    pub channel_params: ChannelParams,
    /// Form fields from a POST body.
    pub post: ChannelParams,
    pub merge_channel_params: bool,
    pub params_priority: ParamsPriority,
}

impl ServiceRequest {
    /// Looks a parameter up in merged channel params, then path params, then form data.
    #[must_use]
    pub fn param(&self, name: &str) -> Option<&str> {
        self.channel_params
            .get(name)
            .or_else(|| self.path_params.get(name))
            .or_else(|| self.post.get(name))
            .and_then(|v| v.first())
    }
}

/// Response side of an invocation.
#[derive(Debug, Clone)]
pub struct ServiceResponse {
    pub payload: Payload,
    pub content_type: String,
    /// Set once the service assigns a content type explicitly.
    pub content_type_changed: bool,
    pub headers: BTreeMap<String, String>,
    pub status_code: StatusCode,
}

impl Default for ServiceResponse {
    fn default() -> Self {
        Self {
            payload: Payload::Empty,
            content_type: "text/plain".to_string(),
            content_type_changed: false,
            headers: BTreeMap::new(),
            status_code: StatusCode::OK,
        }
    }
}

impl ServiceResponse {
    pub fn set_payload(&mut self, payload: impl Into<Payload>) {
        self.payload = payload.into();
    }

    pub fn set_content_type(&mut self, content_type: impl Into<String>) {
        self.content_type = content_type.into();
        self.content_type_changed = true;
    }
}

/// Handles shared with the instance at bind time.
#[derive(Clone)]
pub struct Facilities {
    pub runtime: Arc<RuntimeContext>,
}

/// One invocation of one service.
pub struct ServiceInstance {
    pub name: String,
    pub impl_id: String,
    pub cid: String,
    pub request: ServiceRequest,
    pub response: ServiceResponse,
    pub channel: Arc<ChannelInfo>,
    pub transport: Transport,
    pub data_format: Option<DataFormat>,
    pub job_type: Option<JobType>,
    /// Correlation id of the async invocation this one answers.
    pub in_reply_to: Option<String>,
    pub environ: serde_json::Map<String, serde_json::Value>,
    pub invocation_time: Option<SystemTime>,
    pub processing_time_ms: u64,
    usage: Arc<AtomicU64>,
    definition: Arc<ServiceDefinition>,
    facilities: Option<Facilities>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for ServiceInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceInstance")
            .field("name", &self.name)
            .field("impl_id", &self.impl_id)
            .field("cid", &self.cid)
            .field("channel", &self.channel.channel_type)
            .field("bound", &self.facilities.is_some())
            .finish_non_exhaustive()
    }
}

impl ServiceInstance {
    /// Creates an unbound instance. Only service registries call this.
    #[must_use]
    pub fn new(definition: Arc<ServiceDefinition>, usage: Arc<AtomicU64>) -> Self {
        Self {
            name: definition.name.clone(),
            impl_id: definition.impl_id.clone(),
            cid: String::new(),
            request: ServiceRequest::default(),
            response: ServiceResponse::default(),
            channel: Arc::new(ChannelInfo::internal(ChannelType::NewInstance, None)),
            transport: Transport::default(),
            data_format: None,
            job_type: None,
            in_reply_to: None,
            environ: serde_json::Map::new(),
            invocation_time: None,
            processing_time_ms: 0,
            usage,
            definition,
            facilities: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Attaches correlation id, channel, and shared facilities.
    pub fn bind(&mut self, cid: String, channel: Arc<ChannelInfo>, facilities: Facilities) {
        self.cid = cid;
        self.data_format = channel.data_format;
        self.channel = channel;
        self.facilities = Some(facilities);
    }

    #[must_use]
    pub fn definition(&self) -> &Arc<ServiceDefinition> {
        &self.definition
    }

    #[must_use]
    pub fn is_bound(&self) -> bool {
        self.facilities.is_some()
    }

    /// Process-wide number of invocations of this service so far.
    #[must_use]
    pub fn usage(&self) -> u64 {
        self.usage.load(Ordering::Relaxed)
    }

    pub(crate) fn record_usage(&self) -> u64 {
        self.usage.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Token cancelled when a bounded invocation of this instance times out
    /// or its caller is cancelled.
    #[must_use]
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub(crate) fn set_cancellation(&mut self, token: CancellationToken) {
        self.cancel = token;
    }

    pub(crate) fn runtime(&self) -> Result<&Arc<RuntimeContext>, InvocationError> {
        self.facilities
            .as_ref()
            .map(|f| &f.runtime)
            .ok_or_else(|| InvocationError::Configuration(format!("service `{}` is not bound", self.name)))
    }

    /// Invoker acting on behalf of this service.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the instance was never bound.
    pub fn invoker(&self) -> Result<Invoker, InvocationError> {
        let runtime = self.runtime()?.clone();
        let caller = CallerIdentity {
            name: self.name.clone(),
            impl_id: self.impl_id.clone(),
            cid: self.cid.clone(),
            invokes: self.definition.invokes.clone(),
            remote_addr: self.request.remote_addr.clone(),
            channel_type: self.channel.channel_type,
            cancellation: Some(self.cancel.clone()),
        };
        Ok(Invoker::new(runtime).with_caller(caller))
    }

    /// Shared response cache.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the instance was never bound.
    pub fn cache(&self) -> Result<Arc<dyn ResponseCache>, InvocationError> {
        Ok(self.runtime()?.cache.clone())
    }

    /// Creates an unbound instance of another service without running it.
    ///
    /// # Errors
    ///
    /// Fails if the instance is unbound or the service is unknown.
    pub fn new_instance(&self, name: &str) -> Result<ServiceInstance, InvocationError> {
        self.invoker()?.new_instance(name)
    }
}
