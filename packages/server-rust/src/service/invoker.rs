//! Synchronous and asynchronous service invocation.
//!
//! An [`Invoker`] resolves a service, applies the invocation guards, binds a
//! fresh instance and hands it to the engine. Invocation methods return
//! boxed futures so that services can invoke other services from inside
//! their handlers.

use std::sync::Arc;
use std::time::Duration;

use busline_core::{
    new_cid, ChannelInfo, ChannelType, DataFormat, InvocationContext, Payload, Transport,
};
use futures_util::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use super::definition::JobType;
use super::engine::{self, ResponseMode};
use super::error::InvocationError;
use super::instance::{Facilities, ServiceInstance};
use super::patterns::PatternCompletion;
use super::runtime::RuntimeContext;

/// Suffix of the service implicitly used as an async callback.
pub const ASYNC_CALLBACK_SUFFIX: &str = "-async-callback";

/// Environ key holding the `@target` part of a service name.
pub const TARGET_ENVIRON_KEY: &str = "busline.target";

/// Environ key holding the async context handed to callbacks.
pub const ASYNC_ENVIRON_KEY: &str = "busline.async";

// ---------------------------------------------------------------------------
// CallerIdentity / InvokeOptions / Callback
// ---------------------------------------------------------------------------

/// The service on whose behalf an invoker acts.
#[derive(Debug, Clone)]
pub struct CallerIdentity {
    pub name: String,
    pub impl_id: String,
    pub cid: String,
    /// Declared allow-list of services this caller may invoke by name.
    pub invokes: Vec<String>,
    pub remote_addr: Option<String>,
    pub channel_type: ChannelType,
    /// Cancellation of the calling instance. Sub-invocations run under a
    /// child of it.
    pub cancellation: Option<CancellationToken>,
}

/// Per-call settings.
#[derive(Debug, Clone)]
pub struct InvokeOptions {
    pub payload: Payload,
    pub channel: ChannelType,
    pub data_format: Option<DataFormat>,
    pub transport: Transport,
    /// Defaults to the caller's cid, or a fresh one without a caller.
    pub cid: Option<String>,
    /// Overrides the configured default timeout.
    pub timeout: Option<Duration>,
    /// `false` turns a timeout into an empty payload instead of an error.
    pub raise_timeout: bool,
    pub skip_response_envelope: bool,
    /// For callbacks, the async cid; for pattern calls, the group cid.
    pub in_reply_to: Option<String>,
    pub environ: serde_json::Map<String, serde_json::Value>,
    pub job_type: Option<JobType>,
    pub http_method: Option<String>,
    /// Serialize the payload to a JSON string before an async invocation.
    pub to_json_string: bool,
    /// Free-form data forwarded to async callbacks.
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Default for InvokeOptions {
    fn default() -> Self {
        Self {
            payload: Payload::Empty,
            channel: ChannelType::Invoke,
            data_format: None,
            transport: Transport::default(),
            cid: None,
            timeout: None,
            raise_timeout: true,
            skip_response_envelope: false,
            in_reply_to: None,
            environ: serde_json::Map::new(),
            job_type: None,
            http_method: None,
            to_json_string: false,
            extra: serde_json::Map::new(),
        }
    }
}

impl InvokeOptions {
    #[must_use]
    pub fn new(payload: impl Into<Payload>) -> Self {
        Self {
            payload: payload.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn channel(mut self, channel: ChannelType) -> Self {
        self.channel = channel;
        self
    }

    #[must_use]
    pub fn data_format(mut self, data_format: Option<DataFormat>) -> Self {
        self.data_format = data_format;
        self
    }

    #[must_use]
    pub fn cid(mut self, cid: impl Into<String>) -> Self {
        self.cid = Some(cid.into());
        self
    }

    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn raise_timeout(mut self, raise: bool) -> Self {
        self.raise_timeout = raise;
        self
    }

    #[must_use]
    pub fn skip_response_envelope(mut self, skip: bool) -> Self {
        self.skip_response_envelope = skip;
        self
    }

    #[must_use]
    pub fn in_reply_to(mut self, cid: impl Into<String>) -> Self {
        self.in_reply_to = Some(cid.into());
        self
    }

    #[must_use]
    pub fn environ(mut self, environ: serde_json::Map<String, serde_json::Value>) -> Self {
        self.environ = environ;
        self
    }

    #[must_use]
    pub fn job_type(mut self, job_type: JobType) -> Self {
        self.job_type = Some(job_type);
        self
    }

    #[must_use]
    pub fn http_method(mut self, method: impl Into<String>) -> Self {
        self.http_method = Some(method.into());
        self
    }

    #[must_use]
    pub fn to_json_string(mut self, on: bool) -> Self {
        self.to_json_string = on;
        self
    }

    #[must_use]
    pub fn extra(mut self, extra: serde_json::Map<String, serde_json::Value>) -> Self {
        self.extra = extra;
        self
    }
}

/// Which services receive the result of an async invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Callback {
    /// No callback.
    None,
    /// `<caller>-async-callback`, if such a service is registered.
    #[default]
    Convention,
    /// The calling service itself.
    SelfRef,
    /// Explicit services, invoked in order.
    Named(Vec<String>),
}

// ---------------------------------------------------------------------------
// Invoker
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct Invoker {
    runtime: Arc<RuntimeContext>,
    caller: Option<Arc<CallerIdentity>>,
}

impl std::fmt::Debug for Invoker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Invoker")
            .field("caller", &self.caller.as_ref().map(|c| c.name.as_str()))
            .finish_non_exhaustive()
    }
}

impl Invoker {
    /// An invoker with no calling service, as used by transports and the scheduler.
    #[must_use]
    pub fn new(runtime: Arc<RuntimeContext>) -> Self {
        Self {
            runtime,
            caller: None,
        }
    }

    #[must_use]
    pub fn with_caller(mut self, caller: CallerIdentity) -> Self {
        self.caller = Some(Arc::new(caller));
        self
    }

    #[must_use]
    pub fn runtime(&self) -> &Arc<RuntimeContext> {
        &self.runtime
    }

    #[must_use]
    pub fn caller(&self) -> Option<&CallerIdentity> {
        self.caller.as_deref()
    }

    /// Invokes a service by name. `name@target` routes to a target node.
    pub fn invoke(
        &self,
        name: &str,
        opts: InvokeOptions,
    ) -> BoxFuture<'static, Result<Payload, InvocationError>> {
        let this = self.clone();
        let name = name.to_string();
        Box::pin(async move {
            let group = pattern_group(&opts);
            let result = this.invoke_by_name(&name, opts).await;
            this.finish_pattern_call(&name, group, &result);
            result
        })
    }

    /// Invokes a service by its numeric registry id.
    pub fn invoke_by_id(
        &self,
        id: u64,
        opts: InvokeOptions,
    ) -> BoxFuture<'static, Result<Payload, InvocationError>> {
        let this = self.clone();
        Box::pin(async move {
            let group = pattern_group(&opts);
            let result = match this.runtime.services.resolve_id_to_impl(id) {
                Ok(impl_id) => this.run_impl(impl_id, None, opts).await,
                Err(err) => Err(err),
            };
            this.finish_pattern_call(&id.to_string(), group, &result);
            result
        })
    }

    /// Invokes a service by its implementation id.
    pub fn invoke_by_impl_id(
        &self,
        impl_id: &str,
        opts: InvokeOptions,
    ) -> BoxFuture<'static, Result<Payload, InvocationError>> {
        let this = self.clone();
        let impl_id = impl_id.to_string();
        Box::pin(async move {
            let group = pattern_group(&opts);
            let result = this.run_impl(impl_id.clone(), None, opts).await;
            this.finish_pattern_call(&impl_id, group, &result);
            result
        })
    }

    /// Schedules a service invocation and returns its cid immediately.
    ///
    /// The target runs on a detached task with its response envelope
    /// stripped; on success each callback is invoked with the target's
    /// response, a fresh cid, and `in_reply_to` set to the returned cid.
    ///
    /// # Errors
    ///
    /// Fails synchronously if the name is malformed, unknown, refused by a
    /// matcher, or if a self-referencing callback has no caller.
    pub fn invoke_async(
        &self,
        name: &str,
        opts: InvokeOptions,
        callback: Callback,
    ) -> Result<String, InvocationError> {
        let (name, target) = split_target(name)?;
        self.check_target(target.as_deref())?;
        self.runtime.services.resolve_name_to_impl(&name)?;
        self.check_invoke_matcher(&name)?;

        let payload = if opts.to_json_string {
            Payload::Text(opts.payload.to_json_string())
        } else {
            opts.payload
        };
        let cid = opts.cid.unwrap_or_else(new_cid);
        let callbacks = self.resolve_callbacks(callback)?;

        let mut environment = opts.environ;
        if let Some(target) = target {
            environment.insert(TARGET_ENVIRON_KEY.to_string(), target.into());
        }

        let ctx = InvocationContext {
            calling_service: self.caller.as_ref().map(|c| c.name.clone()).unwrap_or_default(),
            target_service: name,
            cid: cid.clone(),
            payload,
            data_format: opts.data_format,
            callbacks,
            extra: opts.extra,
            environment,
        };

        tracing::debug!(
            cid = %ctx.cid,
            target = %ctx.target_service,
            callbacks = ?ctx.callbacks,
            "scheduling async invocation"
        );
        tokio::spawn(run_async(Self::new(self.runtime.clone()), ctx));
        Ok(cid)
    }

    /// Creates a bound instance of another service without running it.
    ///
    /// # Errors
    ///
    /// Fails if the service is unknown or inactive.
    pub fn new_instance(&self, name: &str) -> Result<ServiceInstance, InvocationError> {
        let impl_id = self.runtime.services.resolve_name_to_impl(name)?;
        let (mut svc, active) = self.runtime.services.new_instance(&impl_id)?;
        if !active {
            return Err(InvocationError::ServiceNotActive { name: svc.name });
        }
        let opts = InvokeOptions::default().channel(ChannelType::NewInstance);
        self.bind(&mut svc, &opts, None);
        Ok(svc)
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    async fn invoke_by_name(&self, name: &str, opts: InvokeOptions) -> Result<Payload, InvocationError> {
        let (name, target) = split_target(name)?;
        self.check_target(target.as_deref())?;
        if let Some(caller) = &self.caller {
            if caller.name == name {
                return Err(self_invocation(&name));
            }
        }
        self.check_caller_invokes(&name)?;
        let impl_id = self.runtime.services.resolve_name_to_impl(&name)?;
        self.run_impl(impl_id, target, opts).await
    }

    async fn run_impl(
        &self,
        impl_id: String,
        target: Option<String>,
        opts: InvokeOptions,
    ) -> Result<Payload, InvocationError> {
        if let Some(caller) = &self.caller {
            if caller.impl_id == impl_id {
                return Err(self_invocation(&caller.name));
            }
        }

        let (mut svc, active) = self.runtime.services.new_instance(&impl_id)?;
        self.check_invoke_matcher(&svc.name)?;
        if !active {
            return Err(InvocationError::ServiceNotActive { name: svc.name });
        }
        self.bind(&mut svc, &opts, target);

        let mode = ResponseMode::Raw {
            skip_response_envelope: opts.skip_response_envelope,
        };
        let default_ms = self.runtime.config.default_invoke_timeout_ms;
        let limit = opts
            .timeout
            .or_else(|| (default_ms > 0).then(|| Duration::from_millis(default_ms)));

        let parent = self.caller.as_ref().and_then(|c| c.cancellation.as_ref());
        if limit.is_none() && parent.is_none() {
            return engine::execute(svc, &mode).await.map(|r| r.payload);
        }

        // Runs on its own task: dropping the caller's future must not drop
        // the child mid-stage. The child sees the caller's cancellation.
        let token = parent.map_or_else(CancellationToken::new, CancellationToken::child_token);
        svc.set_cancellation(token.clone());
        let name = svc.name.clone();
        let cid = svc.cid.clone();
        let mut task = tokio::spawn(async move { engine::execute(svc, &mode).await });

        let Some(limit) = limit else {
            return task
                .await
                .map_err(|e| InvocationError::Internal(e.into()))?
                .map(|r| r.payload);
        };

        match tokio::time::timeout(limit, &mut task).await {
            Ok(joined) => joined
                .map_err(|e| InvocationError::Internal(e.into()))?
                .map(|r| r.payload),
            Err(_) => {
                token.cancel();
                #[allow(clippy::cast_possible_truncation)]
                let timeout_ms = limit.as_millis() as u64;
                tracing::warn!(service = %name, cid = %cid, timeout_ms, "invocation timed out");
                if opts.raise_timeout {
                    Err(InvocationError::Timeout {
                        service: name,
                        timeout_ms,
                    })
                } else {
                    Ok(Payload::Empty)
                }
            }
        }
    }

    fn bind(&self, svc: &mut ServiceInstance, opts: &InvokeOptions, target: Option<String>) {
        let cid = opts
            .cid
            .clone()
            .or_else(|| self.caller.as_ref().map(|c| c.cid.clone()))
            .unwrap_or_else(new_cid);
        let channel = Arc::new(ChannelInfo::internal(opts.channel, opts.data_format));
        svc.bind(
            cid,
            channel,
            Facilities {
                runtime: self.runtime.clone(),
            },
        );
        svc.transport = opts.transport;
        svc.job_type = opts.job_type;
        svc.in_reply_to.clone_from(&opts.in_reply_to);
        svc.environ.clone_from(&opts.environ);
        if let Some(target) = target {
            svc.environ.insert(TARGET_ENVIRON_KEY.to_string(), target.into());
        }
        svc.request.payload = opts.payload.clone();
        svc.request.http_method.clone_from(&opts.http_method);
        svc.request.remote_addr = self.caller.as_ref().and_then(|c| c.remote_addr.clone());
    }

    fn check_target(&self, target: Option<&str>) -> Result<(), InvocationError> {
        let Some(matcher) = self.runtime.target_matcher() else {
            return Ok(());
        };
        let target = target.unwrap_or(&self.runtime.config.node_id);
        if matcher.is_allowed(target) {
            Ok(())
        } else {
            Err(InvocationError::Configuration(format!(
                "target `{target}` is not allowed"
            )))
        }
    }

    fn check_invoke_matcher(&self, name: &str) -> Result<(), InvocationError> {
        match self.runtime.invoke_matcher() {
            Some(matcher) if !matcher.is_allowed(name) => Err(InvocationError::Configuration(
                format!("service `{name}` cannot be invoked"),
            )),
            _ => Ok(()),
        }
    }

    fn check_caller_invokes(&self, name: &str) -> Result<(), InvocationError> {
        if !self.runtime.config.enforce_service_invokes {
            return Ok(());
        }
        match &self.caller {
            Some(caller) if !caller.invokes.is_empty() && !caller.invokes.iter().any(|n| n == name) => {
                Err(InvocationError::Configuration(format!(
                    "service `{}` may not invoke `{name}`, allowed: {:?}",
                    caller.name, caller.invokes
                )))
            }
            _ => Ok(()),
        }
    }

    fn resolve_callbacks(&self, callback: Callback) -> Result<Vec<String>, InvocationError> {
        match callback {
            Callback::None => Ok(Vec::new()),
            Callback::Named(names) => Ok(names),
            Callback::SelfRef => self
                .caller
                .as_ref()
                .map(|c| vec![c.name.clone()])
                .ok_or_else(|| {
                    InvocationError::Configuration(
                        "self callback requested without a calling service".to_string(),
                    )
                }),
            Callback::Convention => Ok(self
                .caller
                .as_ref()
                .map(|c| format!("{}{ASYNC_CALLBACK_SUFFIX}", c.name))
                .filter(|sink| self.runtime.services.contains_name(sink))
                .into_iter()
                .collect()),
        }
    }

    /// Reports a pattern call's outcome on a detached task. Runs for
    /// failures raised before the pipeline too.
    fn finish_pattern_call(
        &self,
        service: &str,
        group: Option<String>,
        result: &Result<Payload, InvocationError>,
    ) {
        let Some(group_cid) = group else {
            return;
        };
        let completion = PatternCompletion {
            group_cid,
            service: service.to_string(),
            outcome: match result {
                Ok(payload) => Ok(payload.clone()),
                Err(err) => Err(err.to_string()),
            },
        };
        let runtime = self.runtime.clone();
        tokio::spawn(async move {
            let patterns = runtime.patterns.clone();
            patterns.on_call_finished(runtime, completion).await;
        });
    }
}

/// Group cid of a pattern call, `None` for every other channel.
fn pattern_group(opts: &InvokeOptions) -> Option<String> {
    if opts.channel.is_pattern_call() {
        if opts.in_reply_to.is_none() {
            tracing::warn!(channel = %opts.channel, "pattern call without a group cid");
        }
        opts.in_reply_to.clone()
    } else {
        None
    }
}

fn self_invocation(name: &str) -> InvocationError {
    InvocationError::Configuration(format!("service `{name}` cannot invoke itself"))
}

/// Splits `name@target`. A name without `@` has no target.
///
/// # Errors
///
/// Fails if the name or the target part is empty.
pub fn split_target(name: &str) -> Result<(String, Option<String>), InvocationError> {
    let (name, target) = match name.rsplit_once('@') {
        Some((name, target)) if target.is_empty() => {
            return Err(InvocationError::Configuration(format!(
                "empty target in `{name}@`"
            )));
        }
        Some((name, target)) => (name, Some(target.to_string())),
        None => (name, None),
    };
    if name.is_empty() {
        return Err(InvocationError::Configuration("empty service name".to_string()));
    }
    Ok((name.to_string(), target))
}

async fn run_async(invoker: Invoker, ctx: InvocationContext) {
    let opts = InvokeOptions::new(ctx.payload.clone())
        .channel(ChannelType::InvokeAsync)
        .data_format(ctx.data_format)
        .cid(ctx.cid.clone())
        .skip_response_envelope(true)
        .environ(ctx.environment.clone());

    let response = match invoker.invoke(&ctx.target_service, opts).await {
        Ok(response) => response,
        Err(err) => {
            tracing::error!(
                cid = %ctx.cid,
                service = %ctx.target_service,
                error = %err,
                "async invocation failed"
            );
            return;
        }
    };

    let mut environ = ctx.environment.clone();
    if let Ok(value) = serde_json::to_value(ctx.callback_environment()) {
        environ.insert(ASYNC_ENVIRON_KEY.to_string(), value);
    }

    for callback in &ctx.callbacks {
        let opts = InvokeOptions::new(response.clone())
            .channel(ChannelType::AsyncCallback)
            .data_format(ctx.data_format)
            .cid(new_cid())
            .in_reply_to(ctx.cid.clone())
            .environ(environ.clone());
        if let Err(err) = invoker.invoke(callback, opts).await {
            tracing::error!(
                cid = %ctx.cid,
                callback = %callback,
                error = %err,
                "async callback failed"
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
