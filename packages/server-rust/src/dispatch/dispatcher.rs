//! Request dispatcher: one inbound request in, one response out.
//!
//! Runs the fixed pre-invocation sequence (method check, route match,
//! security, rate limiting, audit, identity link) and hands the request to
//! the [`RequestHandler`]. Every failure is mapped to a status and a
//! transport-appropriate error body here, and nowhere else.

use std::convert::Infallible;
use std::future::Future;
use std::io::Write as _;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::SystemTime;

use busline_core::{
    AuthResult, ChannelDescriptor, ContentEncoding, DataFormat, SecurityInfo, SecurityType,
};
use bytes::Bytes;
use flate2::write::GzEncoder;
use flate2::Compression;
use http::StatusCode;
use serde_json::json;
use tower::Service;

use super::handler::{parse_form, HandleRequest, RequestHandler};
use super::request::{normalize_accept, DispatchRequest, DispatchResponse};
use crate::service::error::{IdentityLinkError, InvocationError};
use crate::service::runtime::RuntimeContext;
use crate::traits::{DataReceived, DataSent, RateLimitScope};

/// Response header carrying the request's correlation id.
pub const CID_HEADER: &str = "X-Busline-CID";
/// Response header carrying the error text on the admin channel.
pub const MESSAGE_HEADER: &str = "X-Busline-Message";

const AUDIT_OBJECT_TYPE: &str = "http_soap";

// ---------------------------------------------------------------------------
// Error bodies
// ---------------------------------------------------------------------------

/// `true` if errors on a channel with this format use the JSON envelope.
/// Channels without a format get it too, so the cid always reaches the caller.
fn uses_json_envelope(format: Option<DataFormat>) -> bool {
    match format {
        None | Some(DataFormat::Hl7) => true,
        Some(format) => format.is_json_like(),
    }
}

/// `{"result":"Error","cid":..,"details":..}`, `details` omitted when empty.
fn json_envelope(cid: &str, details: &str) -> String {
    let mut body = json!({"result": "Error", "cid": cid});
    if !details.is_empty() {
        body["details"] = json!(details);
    }
    body.to_string()
}

/// Builds an error response carrying `details` in the envelope for `format`.
#[must_use]
pub fn error_envelope(
    cid: &str,
    status: StatusCode,
    details: &str,
    format: Option<DataFormat>,
    json_content_type: &str,
) -> DispatchResponse {
    let (body, content_type) = if uses_json_envelope(format) {
        (json_envelope(cid, details), json_content_type)
    } else {
        (details.to_string(), "text/plain")
    };
    let mut resp = DispatchResponse {
        cid: cid.to_string(),
        status,
        headers: Vec::new(),
        body: Bytes::from(body),
    };
    resp.set_header("Content-Type", content_type);
    resp.set_header(CID_HEADER, cid);
    resp
}

fn single_line(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

// ---------------------------------------------------------------------------
// RequestDispatcher
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RequestDispatcher {
    runtime: Arc<RuntimeContext>,
    handler: RequestHandler,
}

impl RequestDispatcher {
    #[must_use]
    pub fn new(runtime: Arc<RuntimeContext>) -> Self {
        Self {
            handler: RequestHandler::new(runtime.clone()),
            runtime,
        }
    }

    #[must_use]
    pub fn runtime(&self) -> &Arc<RuntimeContext> {
        &self.runtime
    }

    /// Dispatches one request. Never fails: errors become error responses.
    pub async fn dispatch(&self, req: DispatchRequest) -> DispatchResponse {
        let mut matched: Option<Arc<ChannelDescriptor>> = None;
        match self.run(&req, &mut matched).await {
            Ok(resp) => resp,
            Err(err) => self.error_response(&req, matched.as_deref(), &err),
        }
    }

    async fn run(
        &self,
        req: &DispatchRequest,
        matched: &mut Option<Arc<ChannelDescriptor>>,
    ) -> Result<DispatchResponse, InvocationError> {
        let config = &self.runtime.config;
        let meta = &req.meta;
        let cid = req.cid.as_str();

        if !config.is_method_allowed(&meta.method) {
            return Err(InvocationError::MethodNotAllowed {
                method: meta.method.clone(),
            });
        }

        let accept_key = normalize_accept(meta.accept.as_deref());
        let Some(found) = self
            .runtime
            .channels
            .match_request(&meta.path, &meta.method, &accept_key)
        else {
            tracing::warn!(
                cid = %cid,
                path = %meta.path,
                method = %meta.method,
                accept = %accept_key,
                "URL not found"
            );
            return Err(InvocationError::RouteNotFound);
        };

        // Resolved once; every later stage reads this snapshot.
        let channel = found.channel;
        *matched = Some(channel.clone());

        if !channel.is_active {
            return Err(InvocationError::ChannelInactive {
                name: channel.name.clone(),
            });
        }

        // Credentials posted in the body must be visible to the gate.
        let post = channel
            .security
            .as_ref()
            .filter(|s| s.sec_type == SecurityType::OAuth)
            .map(|_| parse_form(&req.body));

        let auth = if channel.security.is_some() || config.rbac_mandatory {
            self.runtime
                .gate
                .check_security(&channel, cid, &req.body, meta, post.as_ref())
                .await?
        } else {
            None
        };

        if channel.rate_limit_active {
            let key = meta.remote_addr.as_deref().unwrap_or_default();
            self.runtime
                .rate_limiter
                .check_limit(&RateLimitScope::channel(&channel.name), key, cid)?;
        }

        if channel.audit_received {
            self.runtime.audit.store_received(DataReceived {
                object_type: AUDIT_OBJECT_TYPE,
                object_id: channel.id,
                data: req.body.to_vec(),
                timestamp: req.timestamp,
                msg_id: cid.to_string(),
            });
        }

        let security = match (&channel.security, &auth) {
            (Some(descriptor), Some(auth)) => SecurityInfo::from_auth(descriptor, auth),
            _ => SecurityInfo::default(),
        };

        self.link_identity(&channel, auth.as_ref(), cid).await?;

        let handled = self
            .handler
            .handle(HandleRequest {
                cid,
                channel: &channel,
                path_params: &found.path_params,
                meta,
                raw_body: &req.body,
                post,
                security,
            })
            .await?;

        let mut resp = DispatchResponse {
            cid: cid.to_string(),
            status: handled.status,
            headers: handled.headers.into_iter().collect(),
            body: handled.payload,
        };
        resp.set_header("Content-Type", handled.content_type);
        resp.set_header(CID_HEADER, cid);

        if channel.content_encoding == Some(ContentEncoding::Gzip) {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder
                .write_all(&resp.body)
                .map_err(|e| InvocationError::internal(format!("gzip failed: {e}")))?;
            let compressed = encoder
                .finish()
                .map_err(|e| InvocationError::internal(format!("gzip failed: {e}")))?;
            resp.body = Bytes::from(compressed);
            resp.set_header("Content-Encoding", "gzip");
        }

        if channel.audit_sent {
            self.runtime.audit.store_sent(DataSent {
                object_type: AUDIT_OBJECT_TYPE,
                object_id: channel.id,
                data: resp.body.to_vec(),
                timestamp: SystemTime::now(),
                msg_id: format!("rsp{cid}"),
                in_reply_to: cid.to_string(),
            });
        }

        Ok(resp)
    }

    /// Forwards a session token to the linked identity system, if any.
    async fn link_identity(
        &self,
        channel: &ChannelDescriptor,
        auth: Option<&AuthResult>,
        cid: &str,
    ) -> Result<(), InvocationError> {
        let (Some(linker), Some(linked), Some(auth)) = (
            self.runtime.identity_linker.as_ref(),
            channel.security.as_ref().and_then(|s| s.linked_identity.as_deref()),
            auth,
        ) else {
            return Ok(());
        };
        if auth.raw_token.is_none() {
            return Ok(());
        }
        match linker.on_external_auth(linked, auth, cid).await {
            Ok(()) => Ok(()),
            Err(err @ IdentityLinkError::UnexpectedSecurityType(_)) => {
                Err(InvocationError::internal(err))
            }
            Err(IdentityLinkError::Failed(reason)) => {
                tracing::warn!(cid = %cid, linked = %linked, reason = %reason, "identity link failed");
                Ok(())
            }
        }
    }

    fn error_response(
        &self,
        req: &DispatchRequest,
        channel: Option<&ChannelDescriptor>,
        err: &InvocationError,
    ) -> DispatchResponse {
        let config = &self.runtime.config;
        let cid = req.cid.as_str();
        let status = err.status_for();
        let is_admin = channel.is_some_and(|c| c.name == config.admin_channel_name);
        let format = channel.and_then(|c| c.data_format);
        let json_ct = config.json_content_type.as_str();

        if !matches!(err, InvocationError::RouteNotFound) {
            tracing::error!(
                cid = %cid,
                status = status.as_u16(),
                kind = err.kind(),
                error = ?err,
                "dispatch failed"
            );
        }

        match err {
            InvocationError::RouteNotFound => {
                let mut resp = error_envelope(cid, status, "", Some(DataFormat::Plain), json_ct);
                resp.body = Bytes::from(format!("URL not found (CID:{cid})"));
                resp
            }
            InvocationError::MethodNotAllowed { .. } => {
                error_envelope(cid, status, "Unsupported HTTP method", None, json_ct)
            }
            InvocationError::SchemaValidation {
                short,
                details,
                needs_details,
            } => {
                let message = if *needs_details {
                    details.clone()
                } else {
                    format!("Invalid request: {short}")
                };
                let mut resp = error_envelope(cid, status, "", None, json_ct);
                resp.body = Bytes::from(
                    json!({"cid": cid, "is_ok": false, "message": message}).to_string(),
                );
                resp
            }
            InvocationError::Unauthorized { message, challenge } => {
                let mut resp = error_envelope(cid, status, message, format, json_ct);
                if let Some(challenge) = challenge {
                    resp.set_header("WWW-Authenticate", challenge.clone());
                }
                resp
            }
            InvocationError::ChannelInactive { .. } => {
                error_envelope(cid, status, "Channel inactive", format, json_ct)
            }
            InvocationError::NotFound { message } | InvocationError::Forbidden { message } => {
                error_envelope(cid, status, message, format, json_ct)
            }
            InvocationError::RateLimit(_) => {
                let line = format!(
                    "Error {} {}",
                    status.as_u16(),
                    status.canonical_reason().unwrap_or("Unknown")
                );
                error_envelope(cid, status, &line, format, json_ct)
            }
            InvocationError::BadRequest {
                message,
                needs_raw_message,
            } => {
                let details = if is_admin || *needs_raw_message {
                    message.as_str()
                } else {
                    "Invalid input"
                };
                error_envelope(cid, status, details, format, json_ct)
            }
            InvocationError::Overloaded => {
                error_envelope(cid, status, &err.to_string(), format, json_ct)
            }
            InvocationError::ServiceNotActive { .. }
            | InvocationError::Configuration(_)
            | InvocationError::Timeout { .. }
            | InvocationError::Cancelled { .. }
            | InvocationError::Internal(_) => {
                if is_admin {
                    let full = match err {
                        InvocationError::Internal(inner) => format!("{inner:?}"),
                        other => other.to_string(),
                    };
                    let mut resp = error_envelope(cid, status, &full, format, json_ct);
                    resp.set_header(MESSAGE_HEADER, single_line(&err.to_string()));
                    resp
                } else if config.return_error_details {
                    error_envelope(cid, status, &err.to_string(), format, json_ct)
                } else {
                    error_envelope(cid, status, &config.default_error_message, format, json_ct)
                }
            }
        }
    }
}

/// Response returned by load shedding before the dispatcher runs.
#[must_use]
pub fn overloaded_response(req: &DispatchRequest, json_content_type: &str) -> DispatchResponse {
    error_envelope(
        &req.cid,
        InvocationError::Overloaded.status_for(),
        &InvocationError::Overloaded.to_string(),
        None,
        json_content_type,
    )
}

impl Service<DispatchRequest> for RequestDispatcher {
    type Response = DispatchResponse;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<DispatchResponse, Infallible>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: DispatchRequest) -> Self::Future {
        let this = self.clone();
        Box::pin(async move { Ok(this.dispatch(req).await) })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::io::Read as _;
    use std::time::Duration;

    use busline_core::{CacheConfig, CacheType, SecurityDescriptor};
    use serde_json::Value;
    use tower::ServiceExt;

    use super::*;
    use crate::collab::routes::RouteTable;
    use crate::service::config::RuntimeConfig;
    use crate::service::definition::{handler_fn, ServiceDefinition};
    use crate::service::registry::ServiceStore;
    use crate::dispatch::request::RequestMeta;
    use crate::testing::{
        self, request, CallLog, RecordingAudit, RecordingGate, RecordingRateLimiter,
    };
    use crate::traits::{SchemaFailure, SchemaValidator};

    fn json_channel(id: u64, name: &str, target: &str, service: &str) -> ChannelDescriptor {
        let mut c = ChannelDescriptor::new(id, name, target, service);
        c.data_format = Some(DataFormat::Json);
        c
    }

    fn secured(mut c: ChannelDescriptor) -> ChannelDescriptor {
        c.security = Some(SecurityDescriptor {
            id: 3,
            name: "api.users".into(),
            sec_type: SecurityType::Basic,
            username: Some("alice".into()),
            linked_identity: None,
        });
        c
    }

    fn routes(channels: Vec<ChannelDescriptor>) -> Arc<RouteTable> {
        let table = RouteTable::new();
        table.replace(channels).unwrap();
        Arc::new(table)
    }

    fn echo_store() -> Arc<ServiceStore> {
        let store = Arc::new(ServiceStore::new());
        store.register(ServiceDefinition::new("echo").handler(handler_fn(|svc| {
            let out = json!({"got": svc.request.payload.to_json_value()});
            svc.response.set_payload(out);
            Ok(())
        })));
        store
    }

    fn dispatcher(store: Arc<ServiceStore>, channels: Vec<ChannelDescriptor>) -> RequestDispatcher {
        let runtime = testing::runtime_builder(store)
            .channels(routes(channels))
            .build()
            .unwrap();
        RequestDispatcher::new(runtime)
    }

    fn body_json(resp: &DispatchResponse) -> Value {
        serde_json::from_slice(&resp.body).unwrap()
    }

    #[tokio::test]
    async fn successful_dispatch() {
        let d = dispatcher(echo_store(), vec![json_channel(1, "echo", "/echo", "echo")]);
        let req = DispatchRequest::new(RequestMeta::new("POST", "/echo"), "{\"a\":1}");
        let cid = req.cid.clone();
        let resp = d.dispatch(req).await;
        assert_eq!(resp.status, StatusCode::OK);
        assert_eq!(body_json(&resp), json!({"got": {"a": 1}}));
        assert_eq!(resp.header("content-type"), Some("application/json"));
        assert_eq!(resp.header(CID_HEADER), Some(cid.as_str()));
    }

    #[tokio::test]
    async fn not_found_body_names_cid_not_path() {
        let d = dispatcher(echo_store(), Vec::new());
        let req = request("GET", "/secret/internal/route");
        let cid = req.cid.clone();
        let resp = d.dispatch(req).await;
        assert_eq!(resp.status, StatusCode::NOT_FOUND);
        let body = String::from_utf8(resp.body.to_vec()).unwrap();
        assert_eq!(body, format!("URL not found (CID:{cid})"));
        assert!(!body.contains("secret"));
    }

    #[tokio::test]
    async fn disallowed_method_rejected_before_anything_else() {
        let log = CallLog::default();
        let config = RuntimeConfig {
            allowed_http_methods: vec!["GET".into()],
            ..RuntimeConfig::default()
        };
        let mut channel = secured(json_channel(1, "echo", "/echo", "echo"));
        channel.rate_limit_active = true;
        let runtime = testing::runtime_builder_with(echo_store(), config)
            .channels(Arc::new(testing::RecordingChannels::new(
                routes(vec![channel]),
                log.clone(),
            )))
            .gate(Arc::new(RecordingGate::allowing(log.clone())))
            .rate_limiter(Arc::new(RecordingRateLimiter::allowing().with_log(log.clone())))
            .build()
            .unwrap();
        let d = RequestDispatcher::new(runtime);

        let req = request("TRACE", "/echo");
        let cid = req.cid.clone();
        let resp = d.dispatch(req).await;
        assert_eq!(resp.status, StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(
            body_json(&resp),
            json!({"result": "Error", "cid": cid, "details": "Unsupported HTTP method"})
        );
        assert!(log.entries().is_empty());
    }

    #[tokio::test]
    async fn security_runs_before_rate_limiting() {
        let log = CallLog::default();
        let mut channel = secured(json_channel(1, "echo", "/echo", "echo"));
        channel.rate_limit_active = true;
        let runtime = testing::runtime_builder(echo_store())
            .channels(routes(vec![channel]))
            .gate(Arc::new(RecordingGate::allowing(log.clone())))
            .rate_limiter(Arc::new(RecordingRateLimiter::allowing().with_log(log.clone())))
            .build()
            .unwrap();
        let resp = RequestDispatcher::new(runtime).dispatch(request("GET", "/echo")).await;
        assert_eq!(resp.status, StatusCode::OK);
        assert_eq!(log.entries(), vec!["security", "rate_limit"]);
    }

    #[tokio::test]
    async fn bad_credentials_with_exhausted_budget_is_unauthorized() {
        let log = CallLog::default();
        let mut channel = secured(json_channel(1, "echo", "/echo", "echo"));
        channel.rate_limit_active = true;
        let runtime = testing::runtime_builder(echo_store())
            .channels(routes(vec![channel]))
            .gate(Arc::new(RecordingGate::denying(log.clone())))
            .rate_limiter(Arc::new(RecordingRateLimiter::exhausted().with_log(log.clone())))
            .build()
            .unwrap();
        let resp = RequestDispatcher::new(runtime).dispatch(request("GET", "/echo")).await;
        assert_eq!(resp.status, StatusCode::UNAUTHORIZED);
        assert_eq!(resp.header("www-authenticate"), Some("Basic realm=\"busline\""));
        assert_eq!(log.entries(), vec!["security"]);
    }

    #[tokio::test]
    async fn security_info_reaches_the_service() {
        let store = Arc::new(ServiceStore::new());
        store.register(ServiceDefinition::new("who").handler(handler_fn(|svc| {
            let user = svc.channel.security.username.clone();
            svc.response.set_payload(json!({"user": user}));
            Ok(())
        })));
        let runtime = testing::runtime_builder(store)
            .channels(routes(vec![secured(json_channel(1, "who", "/who", "who"))]))
            .gate(Arc::new(RecordingGate::allowing(CallLog::default())))
            .build()
            .unwrap();
        let resp = RequestDispatcher::new(runtime).dispatch(request("GET", "/who")).await;
        assert_eq!(body_json(&resp), json!({"user": "alice"}));
    }

    #[tokio::test]
    async fn rate_limit_maps_to_status_line_body() {
        let mut channel = json_channel(1, "echo", "/echo", "echo");
        channel.rate_limit_active = true;
        let limiter = Arc::new(RecordingRateLimiter::exhausted());
        let runtime = testing::runtime_builder(echo_store())
            .channels(routes(vec![channel]))
            .rate_limiter(limiter.clone())
            .build()
            .unwrap();
        let resp = RequestDispatcher::new(runtime).dispatch(request("GET", "/echo")).await;
        assert_eq!(resp.status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body_json(&resp)["details"], json!("Error 429 Too Many Requests"));
        assert_eq!(limiter.scopes(), vec!["http_soap:echo"]);
    }

    #[tokio::test]
    async fn inactive_channel_is_not_found() {
        let mut channel = json_channel(1, "echo", "/echo", "echo");
        channel.is_active = false;
        let resp = dispatcher(echo_store(), vec![channel]).dispatch(request("GET", "/echo")).await;
        assert_eq!(resp.status, StatusCode::NOT_FOUND);
        assert_eq!(body_json(&resp)["details"], json!("Channel inactive"));
    }

    #[tokio::test]
    async fn cache_hit_skips_the_service() {
        let store = Arc::new(ServiceStore::new());
        let calls = CallLog::default();
        let c = calls.clone();
        store.register(ServiceDefinition::new("slow").handler(handler_fn(move |svc| {
            c.push("handle");
            svc.response.set_payload(json!({"v": 1}));
            Ok(())
        })));
        let mut channel = json_channel(1, "slow", "/slow", "slow");
        channel.cache = Some(CacheConfig {
            cache_type: CacheType::Builtin,
            name: "default".into(),
            ttl: Some(Duration::from_secs(30)),
        });
        let d = dispatcher(store, vec![channel]);

        let first = d.dispatch(request("GET", "/slow")).await;
        let second = d.dispatch(request("GET", "/slow")).await;
        assert_eq!(calls.count("handle"), 1);
        assert_eq!(first.body, second.body);
        assert_eq!(second.header("content-type"), Some("application/json"));
    }

    #[tokio::test]
    async fn gzip_encoding() {
        let mut channel = json_channel(1, "echo", "/echo", "echo");
        channel.content_encoding = Some(ContentEncoding::Gzip);
        let d = dispatcher(echo_store(), vec![channel]);
        let resp = d
            .dispatch(DispatchRequest::new(RequestMeta::new("POST", "/echo"), "{\"z\":true}"))
            .await;
        assert_eq!(resp.header("content-encoding"), Some("gzip"));
        let mut decoded = String::new();
        flate2::read::GzDecoder::new(&resp.body[..])
            .read_to_string(&mut decoded)
            .unwrap();
        assert_eq!(serde_json::from_str::<Value>(&decoded).unwrap(), json!({"got": {"z": true}}));
    }

    fn failing_store() -> Arc<ServiceStore> {
        let store = Arc::new(ServiceStore::new());
        store.register(
            ServiceDefinition::new("broken")
                .handler(handler_fn(|_| Err(InvocationError::internal("database unreachable")))),
        );
        store.register(
            ServiceDefinition::new("picky")
                .handler(handler_fn(|_| Err(InvocationError::bad_request("field x is secret")))),
        );
        store
    }

    #[tokio::test]
    async fn internal_errors_hidden_from_regular_channels() {
        let d = dispatcher(failing_store(), vec![json_channel(1, "broken", "/broken", "broken")]);
        let req = request("GET", "/broken");
        let cid = req.cid.clone();
        let resp = d.dispatch(req).await;
        assert_eq!(resp.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            body_json(&resp),
            json!({"result": "Error", "cid": cid, "details": "Internal server error"})
        );
        assert!(resp.header(MESSAGE_HEADER).is_none());
    }

    #[tokio::test]
    async fn admin_channel_gets_full_details() {
        let admin = RuntimeConfig::default().admin_channel_name;
        let d = dispatcher(failing_store(), vec![json_channel(1, &admin, "/admin", "broken")]);
        let resp = d.dispatch(request("POST", "/admin")).await;
        let details = body_json(&resp)["details"].as_str().unwrap().to_string();
        assert!(details.contains("database unreachable"));
        assert!(resp.header(MESSAGE_HEADER).unwrap().contains("database unreachable"));
    }

    #[tokio::test]
    async fn return_error_details_exposes_error_text() {
        let config = RuntimeConfig {
            return_error_details: true,
            ..RuntimeConfig::default()
        };
        let runtime = testing::runtime_builder_with(failing_store(), config)
            .channels(routes(vec![json_channel(1, "broken", "/broken", "broken")]))
            .build()
            .unwrap();
        let resp = RequestDispatcher::new(runtime).dispatch(request("GET", "/broken")).await;
        assert!(body_json(&resp)["details"]
            .as_str()
            .unwrap()
            .contains("database unreachable"));
    }

    #[tokio::test]
    async fn bad_request_text_hidden_unless_raw() {
        let d = dispatcher(failing_store(), vec![json_channel(1, "picky", "/picky", "picky")]);
        let resp = d.dispatch(request("GET", "/picky")).await;
        assert_eq!(resp.status, StatusCode::BAD_REQUEST);
        assert_eq!(body_json(&resp)["details"], json!("Invalid input"));
    }

    #[tokio::test]
    async fn plain_channels_get_text_errors() {
        let mut channel = json_channel(1, "picky", "/picky", "picky");
        channel.data_format = Some(DataFormat::Xml);
        let resp = dispatcher(failing_store(), vec![channel])
            .dispatch(request("GET", "/picky"))
            .await;
        assert_eq!(&resp.body[..], b"Invalid input");
        assert_eq!(resp.header("content-type"), Some("text/plain"));
    }

    #[tokio::test]
    async fn schema_failure_body() {
        #[derive(Debug)]
        struct Strict;
        impl SchemaValidator for Strict {
            fn is_initialized(&self) -> bool {
                true
            }
            fn validate(&self, _cid: &str, _payload: &busline_core::Payload) -> Result<(), SchemaFailure> {
                Err(SchemaFailure {
                    short: "missing key".into(),
                    details: "key `id` is required".into(),
                    needs_details: true,
                })
            }
        }
        let store = Arc::new(ServiceStore::new());
        store.register(
            ServiceDefinition::new("strict")
                .schema(Arc::new(Strict))
                .handler(handler_fn(|_| Ok(()))),
        );
        let d = dispatcher(store, vec![json_channel(1, "strict", "/strict", "strict")]);
        let req = DispatchRequest::new(RequestMeta::new("POST", "/strict"), "{}");
        let cid = req.cid.clone();
        let resp = d.dispatch(req).await;
        assert_eq!(resp.status, StatusCode::BAD_REQUEST);
        assert_eq!(
            body_json(&resp),
            json!({"cid": cid, "is_ok": false, "message": "key `id` is required"})
        );
    }

    #[tokio::test]
    async fn audit_records_request_and_response() {
        let audit = Arc::new(RecordingAudit::default());
        let mut channel = json_channel(9, "echo", "/echo", "echo");
        channel.audit_received = true;
        channel.audit_sent = true;
        let runtime = testing::runtime_builder(echo_store())
            .channels(routes(vec![channel]))
            .audit(audit.clone())
            .build()
            .unwrap();
        let req = DispatchRequest::new(RequestMeta::new("POST", "/echo"), "{\"a\":1}");
        let cid = req.cid.clone();
        let resp = RequestDispatcher::new(runtime).dispatch(req).await;

        let received = audit.received();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].msg_id, cid);
        assert_eq!(received[0].object_id, 9);
        assert_eq!(received[0].data, b"{\"a\":1}");

        let sent = audit.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].msg_id, format!("rsp{cid}"));
        assert_eq!(sent[0].in_reply_to, cid);
        assert_eq!(sent[0].data, resp.body.to_vec());
    }

    #[tokio::test]
    async fn identity_link_failure_policy() {
        let mut channel = secured(json_channel(1, "echo", "/echo", "echo"));
        if let Some(sec) = channel.security.as_mut() {
            sec.linked_identity = Some("sso".into());
        }

        let soft = testing::runtime_builder(echo_store())
            .channels(routes(vec![channel.clone()]))
            .gate(Arc::new(RecordingGate::allowing(CallLog::default())))
            .identity_linker(Arc::new(testing::FailingLinker(IdentityLinkError::Failed(
                "down".into(),
            ))))
            .build()
            .unwrap();
        let resp = RequestDispatcher::new(soft).dispatch(request("GET", "/echo")).await;
        assert_eq!(resp.status, StatusCode::OK);

        let hard = testing::runtime_builder(echo_store())
            .channels(routes(vec![channel]))
            .gate(Arc::new(RecordingGate::allowing(CallLog::default())))
            .identity_linker(Arc::new(testing::FailingLinker(
                IdentityLinkError::UnexpectedSecurityType("ntlm".into()),
            )))
            .build()
            .unwrap();
        let resp = RequestDispatcher::new(hard).dispatch(request("GET", "/echo")).await;
        assert_eq!(resp.status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn usable_as_tower_service() {
        let d = dispatcher(echo_store(), vec![json_channel(1, "echo", "/echo", "echo")]);
        let resp = d.oneshot(request("GET", "/echo")).await.unwrap();
        assert_eq!(resp.status, StatusCode::OK);
    }

    #[test]
    fn overloaded_envelope() {
        let req = request("GET", "/");
        let resp = overloaded_response(&req, "application/json");
        assert_eq!(resp.status, StatusCode::SERVICE_UNAVAILABLE);
        let body: Value = serde_json::from_slice(&resp.body).unwrap();
        assert_eq!(body["cid"], json!(req.cid));
    }
}
