/// Runtime-level configuration for dispatch and service invocation.
///
/// Controls the method allow-list, error detail policy, invocation guards,
/// concurrency limits, and background task intervals.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Unique identifier for this node; the default target of `name@target` calls.
    pub node_id: String,
    /// HTTP methods accepted at all. Anything else is rejected before routing.
    pub allowed_http_methods: Vec<String>,
    /// Content type applied to JSON responses when the service did not set one.
    pub json_content_type: String,
    /// Body returned for internal errors when details are hidden.
    pub default_error_message: String,
    /// Return internal error text to every caller, not only the admin channel.
    pub return_error_details: bool,
    /// Channel whose callers receive full error details.
    pub admin_channel_name: String,
    /// Run the security gate even on channels without a security definition.
    pub rbac_mandatory: bool,
    /// Refuse calls to services missing from the caller's declared `invokes` list.
    pub enforce_service_invokes: bool,
    /// Glob allow-list for the target part of `name@target`. `None` disables the check.
    pub target_matcher: Option<Vec<String>>,
    /// Glob allow-list for invoked service names. `None` disables the check.
    pub invoke_matcher: Option<Vec<String>>,
    /// Timeout for synchronous invocations without an explicit one. Zero means unbounded.
    pub default_invoke_timeout_ms: u64,
    /// Maximum number of concurrent dispatches before load shedding.
    pub max_concurrent_requests: u32,
    /// Interval between audit worker flush ticks in milliseconds.
    pub audit_worker_tick_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            node_id: "busline-1".to_string(),
            allowed_http_methods: ["GET", "POST", "PUT", "PATCH", "DELETE", "OPTIONS", "HEAD"]
                .iter()
                .map(ToString::to_string)
                .collect(),
            json_content_type: "application/json".to_string(),
            default_error_message: "Internal server error".to_string(),
            return_error_details: false,
            admin_channel_name: "admin.invoke.json".to_string(),
            rbac_mandatory: false,
            enforce_service_invokes: true,
            target_matcher: None,
            invoke_matcher: None,
            default_invoke_timeout_ms: 0,
            max_concurrent_requests: 1000,
            audit_worker_tick_ms: 1000,
        }
    }
}

impl RuntimeConfig {
    /// Returns `true` if `method` is in the allow-list (case-insensitive).
    #[must_use]
    pub fn is_method_allowed(&self, method: &str) -> bool {
        self.allowed_http_methods
            .iter()
            .any(|m| m.eq_ignore_ascii_case(method))
    }
}
