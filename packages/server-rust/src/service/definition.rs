//! Service definitions: the handler plus its optional lifecycle hooks.
//!
//! Optional behaviour is declared up front in a [`HookSet`]. An absent hook
//! is `None` and costs nothing; a present hook is called at its fixed stage
//! by the invocation engine.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use busline_core::ChannelParams;

use crate::service::error::InvocationError;
use crate::service::instance::ServiceInstance;
use crate::traits::SchemaValidator;

/// Business logic of a service.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Reads `svc.request`, writes `svc.response`.
    ///
    /// # Errors
    ///
    /// Any error aborts the invocation; the engine still runs the cleanup hooks.
    async fn handle(&self, svc: &mut ServiceInstance) -> Result<(), InvocationError>;
}

/// Adapter turning a synchronous closure into a [`Handler`].
pub struct FnHandler<F>(F);

#[async_trait]
impl<F> Handler for FnHandler<F>
where
    F: Fn(&mut ServiceInstance) -> Result<(), InvocationError> + Send + Sync,
{
    async fn handle(&self, svc: &mut ServiceInstance) -> Result<(), InvocationError> {
        (self.0)(svc)
    }
}

/// Wraps a synchronous closure as a shareable handler.
pub fn handler_fn<F>(f: F) -> Arc<dyn Handler>
where
    F: Fn(&mut ServiceInstance) -> Result<(), InvocationError> + Send + Sync + 'static,
{
    Arc::new(FnHandler(f))
}

pub type Hook = Arc<dyn Fn(&mut ServiceInstance) -> Result<(), InvocationError> + Send + Sync>;

/// Veto predicate evaluated before the pipeline starts.
pub type AcceptFn = Arc<dyn Fn(&ServiceInstance) -> bool + Send + Sync>;

/// Custom cache-key function. `None` falls back to the request fingerprint.
pub type RequestHashFn = Arc<dyn Fn(&HashInput<'_>) -> Option<String> + Send + Sync>;

/// Request facts available to a custom cache-key function.
#[derive(Debug)]
pub struct HashInput<'a> {
    pub service: &'a str,
    pub method: &'a str,
    pub path: &'a str,
    pub params: &'a ChannelParams,
    pub body: &'a [u8],
}

/// Kind of scheduled job that triggered an invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobType {
    OneTime,
    IntervalBased,
    CronStyle,
}

/// Scheduler hooks: a generic one plus one per job type.
#[derive(Clone, Default)]
pub struct JobHooks {
    pub any: Option<Hook>,
    pub one_time: Option<Hook>,
    pub interval_based: Option<Hook>,
    pub cron_style: Option<Hook>,
}

impl JobHooks {
    /// Hooks to run for `job_type`, generic first.
    pub fn for_job(&self, job_type: Option<JobType>) -> impl Iterator<Item = &Hook> {
        let specific = match job_type {
            Some(JobType::OneTime) => self.one_time.as_ref(),
            Some(JobType::IntervalBased) => self.interval_based.as_ref(),
            Some(JobType::CronStyle) => self.cron_style.as_ref(),
            None => None,
        };
        self.any.iter().chain(specific)
    }

    fn set(&mut self, job_type: Option<JobType>, hook: Hook) {
        match job_type {
            None => self.any = Some(hook),
            Some(JobType::OneTime) => self.one_time = Some(hook),
            Some(JobType::IntervalBased) => self.interval_based = Some(hook),
            Some(JobType::CronStyle) => self.cron_style = Some(hook),
        }
    }
}

/// Optional lifecycle hooks, populated at registration time.
#[derive(Clone, Default)]
pub struct HookSet {
    pub accept: Option<AcceptFn>,
    pub before_handle: Option<Hook>,
    pub after_handle: Option<Hook>,
    pub validate_input: Option<Hook>,
    pub validate_output: Option<Hook>,
    pub finalize: Option<Hook>,
    pub before_job: JobHooks,
    pub after_job: JobHooks,
    pub request_hash: Option<RequestHashFn>,
}

impl std::fmt::Debug for HookSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookSet")
            .field("accept", &self.accept.is_some())
            .field("before_handle", &self.before_handle.is_some())
            .field("after_handle", &self.after_handle.is_some())
            .field("validate_input", &self.validate_input.is_some())
            .field("validate_output", &self.validate_output.is_some())
            .field("finalize", &self.finalize.is_some())
            .field("request_hash", &self.request_hash.is_some())
            .finish_non_exhaustive()
    }
}

/// A registered service.
#[derive(Clone)]
pub struct ServiceDefinition {
    pub name: String,
    /// Implementation id; defaults to the name.
    pub impl_id: String,
    pub handler: Option<Arc<dyn Handler>>,
    /// Per-verb handlers keyed by upper-case HTTP method. When any are
    /// declared they replace the generic handler on HTTP-like channels.
    pub verb_handlers: HashMap<String, Arc<dyn Handler>>,
    pub hooks: HookSet,
    /// Services this one may call by name.
    pub invokes: Vec<String>,
    pub rate_limited: bool,
    pub schema: Option<Arc<dyn SchemaValidator>>,
    /// `false` unwraps the response envelope on every internal invocation.
    pub needs_response_envelope: bool,
    /// `false` skips `before_job`, `before_handle` and `after_handle`. The
    /// accept predicate, validation gates and `finalize` still run.
    pub call_hooks: bool,
    pub slow_threshold: Duration,
}

impl std::fmt::Debug for ServiceDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut verbs: Vec<&String> = self.verb_handlers.keys().collect();
        verbs.sort();
        f.debug_struct("ServiceDefinition")
            .field("name", &self.name)
            .field("impl_id", &self.impl_id)
            .field("handler", &self.handler.is_some())
            .field("verbs", &verbs)
            .field("hooks", &self.hooks)
            .field("invokes", &self.invokes)
            .field("rate_limited", &self.rate_limited)
            .field("needs_response_envelope", &self.needs_response_envelope)
            .finish_non_exhaustive()
    }
}

impl ServiceDefinition {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            impl_id: name.clone(),
            name,
            handler: None,
            verb_handlers: HashMap::new(),
            hooks: HookSet::default(),
            invokes: Vec::new(),
            rate_limited: false,
            schema: None,
            needs_response_envelope: true,
            call_hooks: true,
            slow_threshold: Duration::from_secs(99_999),
        }
    }

    #[must_use]
    pub fn impl_id(mut self, impl_id: impl Into<String>) -> Self {
        self.impl_id = impl_id.into();
        self
    }

    #[must_use]
    pub fn handler(mut self, handler: Arc<dyn Handler>) -> Self {
        self.handler = Some(handler);
        self
    }

    #[must_use]
    pub fn verb(mut self, method: &str, handler: Arc<dyn Handler>) -> Self {
        self.verb_handlers.insert(method.to_ascii_uppercase(), handler);
        self
    }

    #[must_use]
    pub fn invokes<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.invokes = names.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn rate_limited(mut self, on: bool) -> Self {
        self.rate_limited = on;
        self
    }

    #[must_use]
    pub fn schema(mut self, validator: Arc<dyn SchemaValidator>) -> Self {
        self.schema = Some(validator);
        self
    }

    #[must_use]
    pub fn needs_response_envelope(mut self, on: bool) -> Self {
        self.needs_response_envelope = on;
        self
    }

    #[must_use]
    pub fn call_hooks(mut self, on: bool) -> Self {
        self.call_hooks = on;
        self
    }

    #[must_use]
    pub fn slow_threshold(mut self, threshold: Duration) -> Self {
        self.slow_threshold = threshold;
        self
    }

    #[must_use]
    pub fn accept<F>(mut self, f: F) -> Self
    where
        F: Fn(&ServiceInstance) -> bool + Send + Sync + 'static,
    {
        self.hooks.accept = Some(Arc::new(f));
        self
    }

    #[must_use]
    pub fn before_handle<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut ServiceInstance) -> Result<(), InvocationError> + Send + Sync + 'static,
    {
        self.hooks.before_handle = Some(Arc::new(f));
        self
    }

    #[must_use]
    pub fn after_handle<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut ServiceInstance) -> Result<(), InvocationError> + Send + Sync + 'static,
    {
        self.hooks.after_handle = Some(Arc::new(f));
        self
    }

    #[must_use]
    pub fn validate_input<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut ServiceInstance) -> Result<(), InvocationError> + Send + Sync + 'static,
    {
        self.hooks.validate_input = Some(Arc::new(f));
        self
    }

    #[must_use]
    pub fn validate_output<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut ServiceInstance) -> Result<(), InvocationError> + Send + Sync + 'static,
    {
        self.hooks.validate_output = Some(Arc::new(f));
        self
    }

    #[must_use]
    pub fn finalize<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut ServiceInstance) -> Result<(), InvocationError> + Send + Sync + 'static,
    {
        self.hooks.finalize = Some(Arc::new(f));
        self
    }

    /// Registers a before-job hook; `None` applies to every job type.
    #[must_use]
    pub fn before_job<F>(mut self, job_type: Option<JobType>, f: F) -> Self
    where
        F: Fn(&mut ServiceInstance) -> Result<(), InvocationError> + Send + Sync + 'static,
    {
        self.hooks.before_job.set(job_type, Arc::new(f));
        self
    }

    /// Registers an after-job hook; `None` applies to every job type.
    #[must_use]
    pub fn after_job<F>(mut self, job_type: Option<JobType>, f: F) -> Self
    where
        F: Fn(&mut ServiceInstance) -> Result<(), InvocationError> + Send + Sync + 'static,
    {
        self.hooks.after_job.set(job_type, Arc::new(f));
        self
    }

    #[must_use]
    pub fn request_hash<F>(mut self, f: F) -> Self
    where
        F: Fn(&HashInput<'_>) -> Option<String> + Send + Sync + 'static,
    {
        self.hooks.request_hash = Some(Arc::new(f));
        self
    }

    /// Picks the handler for `method`. On HTTP-like channels with per-verb
    /// handlers declared, only those are eligible.
    #[must_use]
    pub fn select_handler(&self, http_like: bool, method: Option<&str>) -> HandlerChoice {
        if http_like && !self.verb_handlers.is_empty() {
            let found = method
                .map(str::to_ascii_uppercase)
                .and_then(|m| self.verb_handlers.get(&m).cloned());
            return match found {
                Some(h) => HandlerChoice::Run(h),
                None => HandlerChoice::MethodNotAllowed,
            };
        }
        match &self.handler {
            Some(h) => HandlerChoice::Run(h.clone()),
            None => HandlerChoice::Missing,
        }
    }
}

/// Outcome of [`ServiceDefinition::select_handler`].
pub enum HandlerChoice {
    Run(Arc<dyn Handler>),
    /// Per-verb handlers exist but none matches the request method.
    MethodNotAllowed,
    /// No generic handler was registered.
    Missing,
}
