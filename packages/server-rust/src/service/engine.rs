//! Invocation engine: runs one bound service instance through its lifecycle.
//!
//! Stages run in a fixed order:
//!
//! ```text
//! accept? -> rate check -> schema -> before_job -> before_handle -> validate_input
//!         -> handle -> validate_output -> after_handle -> after_job -> finalize
//!         -> response extraction
//! ```
//!
//! Rate check, schema validation, `validate_input`, `handle` and
//! `validate_output` propagate their errors and abort the remaining stages.
//! Job hooks, `before_handle`, `after_handle` and `finalize` are logged and
//! swallowed. `after_handle` and `after_job` run only when every earlier
//! stage succeeded. `finalize` runs exactly once on every path that passed
//! the accept gate. A definition with `call_hooks` off skips `before_job`,
//! `before_handle` and `after_handle` only.

use std::time::{Instant, SystemTime};

use busline_core::{ChannelType, DataFormat, Payload};
use bytes::Bytes;
use http::header::{HeaderName, HeaderValue};
use http::StatusCode;
use serde_json::Value;

use super::definition::{HandlerChoice, Hook, ServiceDefinition};
use super::error::InvocationError;
use super::instance::{ServiceInstance, ServiceResponse};
use crate::traits::RateLimitScope;

/// Keys with this prefix are treated as response envelopes.
pub const ENVELOPE_PREFIX: &str = "busline";

/// Pagination metadata stripped before unwrapping.
const META_KEY: &str = "_meta";

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// How the response is extracted once the pipeline finishes.
#[derive(Debug, Clone)]
pub enum ResponseMode {
    /// Internal callers get the payload as produced, unwrapped on request.
    Raw { skip_response_envelope: bool },
    /// Transport callers get a serialized payload and a final content type.
    Transport { json_content_type: String },
}

// ---------------------------------------------------------------------------
// Stages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Stage {
    Bound,
    RateChecked,
    SchemaValidated,
    BeforeJob,
    BeforeHandle,
    ValidateInput,
    Handle,
    ValidateOutput,
    AfterHandle,
    AfterJob,
    Finalize,
}

impl Stage {
    fn as_str(self) -> &'static str {
        match self {
            Self::Bound => "bound",
            Self::RateChecked => "rate_checked",
            Self::SchemaValidated => "schema_validated",
            Self::BeforeJob => "before_job",
            Self::BeforeHandle => "before_handle",
            Self::ValidateInput => "validate_input",
            Self::Handle => "handle",
            Self::ValidateOutput => "validate_output",
            Self::AfterHandle => "after_handle",
            Self::AfterJob => "after_job",
            Self::Finalize => "finalize",
        }
    }
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

/// Runs `svc` through its lifecycle and extracts the response.
///
/// The instance is consumed; it is dropped once the response is extracted.
///
/// # Errors
///
/// Returns the first propagated stage error. If response extraction also
/// fails, the stage error wins and the extraction error is only logged.
#[allow(clippy::cast_possible_truncation)]
pub async fn execute(
    mut svc: ServiceInstance,
    mode: &ResponseMode,
) -> Result<ServiceResponse, InvocationError> {
    let def = svc.definition().clone();

    if let Some(accept) = &def.hooks.accept {
        if !accept(&svc) {
            tracing::debug!(service = %svc.name, cid = %svc.cid, "invocation vetoed by accept");
            return Ok(ServiceResponse {
                payload: Payload::Empty,
                status_code: StatusCode::BAD_REQUEST,
                ..ServiceResponse::default()
            });
        }
    }

    let started = Instant::now();
    let mut reached = Stage::Bound;
    let result = run_stages(&mut svc, &def, &mut reached).await;
    if let Err(err) = &result {
        tracing::debug!(
            service = %svc.name,
            cid = %svc.cid,
            stage = reached.as_str(),
            error = %err,
            "invocation stopped"
        );
    }

    if def.call_hooks && result.is_ok() {
        if let Some(hook) = &def.hooks.after_handle {
            run_swallowed(&mut svc, Stage::AfterHandle, hook);
        }
    }

    if result.is_ok() && svc.channel.channel_type == ChannelType::Scheduler {
        for hook in def.hooks.after_job.for_job(svc.job_type) {
            run_swallowed(&mut svc, Stage::AfterJob, hook);
        }
    }

    let elapsed_ms = started.elapsed().as_millis() as u64;
    svc.processing_time_ms = elapsed_ms;
    if started.elapsed() > def.slow_threshold {
        tracing::warn!(
            service = %svc.name,
            cid = %svc.cid,
            processing_time_ms = elapsed_ms,
            threshold_ms = def.slow_threshold.as_millis() as u64,
            "slow service invocation"
        );
    }

    if let Some(hook) = &def.hooks.finalize {
        run_swallowed(&mut svc, Stage::Finalize, hook);
    }

    let extracted = extract_response(&mut svc, &def, mode);

    match (result, extracted) {
        (Ok(()), extracted) => extracted,
        (Err(err), Ok(_)) => Err(err),
        (Err(err), Err(extract_err)) => {
            tracing::error!(
                service = %svc.name,
                cid = %svc.cid,
                error = %extract_err,
                "response extraction failed after handler error"
            );
            Err(err)
        }
    }
}

async fn run_stages(
    svc: &mut ServiceInstance,
    def: &ServiceDefinition,
    reached: &mut Stage,
) -> Result<(), InvocationError> {
    let runtime = svc.runtime()?.clone();

    if def.rate_limited {
        *reached = Stage::RateChecked;
        let key = svc
            .request
            .remote_addr
            .clone()
            .unwrap_or_else(|| "internal".to_string());
        runtime
            .rate_limiter
            .check_limit(&RateLimitScope::service(svc.name.clone()), &key, &svc.cid)?;
    }

    svc.invocation_time = Some(SystemTime::now());
    svc.record_usage();
    metrics::counter!("busline_service_invocations_total", "service" => svc.name.clone())
        .increment(1);

    if let Some(schema) = def.schema.as_ref().filter(|s| s.is_initialized()) {
        *reached = Stage::SchemaValidated;
        schema.validate(&svc.cid, &svc.request.payload)?;
    }

    if def.call_hooks {
        if svc.channel.channel_type == ChannelType::Scheduler {
            *reached = Stage::BeforeJob;
            for hook in def.hooks.before_job.for_job(svc.job_type) {
                run_swallowed(svc, Stage::BeforeJob, hook);
            }
        }
        if let Some(hook) = &def.hooks.before_handle {
            *reached = Stage::BeforeHandle;
            run_swallowed(svc, Stage::BeforeHandle, hook);
        }
    }
    if let Some(hook) = &def.hooks.validate_input {
        *reached = Stage::ValidateInput;
        hook(svc)?;
    }

    *reached = Stage::Handle;
    run_handler(svc, def).await?;

    if let Some(hook) = &def.hooks.validate_output {
        *reached = Stage::ValidateOutput;
        hook(svc)?;
    }
    Ok(())
}

async fn run_handler(svc: &mut ServiceInstance, def: &ServiceDefinition) -> Result<(), InvocationError> {
    let http_like = svc.channel.channel_type.is_http_like();
    let handler = match def.select_handler(http_like, svc.request.http_method.as_deref()) {
        HandlerChoice::Run(handler) => handler,
        HandlerChoice::MethodNotAllowed => {
            svc.response.status_code = StatusCode::METHOD_NOT_ALLOWED;
            return Ok(());
        }
        HandlerChoice::Missing => {
            return Err(InvocationError::internal(format!(
                "service `{}` has no handler",
                svc.name
            )));
        }
    };

    let token = svc.cancellation().clone();
    let name = svc.name.clone();
    if token.is_cancelled() {
        return Err(InvocationError::Cancelled { service: name });
    }

    tokio::select! {
        biased;
        () = token.cancelled() => Err(InvocationError::Cancelled { service: name }),
        result = handler.handle(svc) => result,
    }
}

fn run_swallowed(svc: &mut ServiceInstance, stage: Stage, hook: &Hook) {
    if let Err(err) = hook(svc) {
        tracing::error!(
            service = %svc.name,
            cid = %svc.cid,
            stage = stage.as_str(),
            error = %err,
            "hook failed"
        );
    }
}

// ---------------------------------------------------------------------------
// Response extraction
// ---------------------------------------------------------------------------

fn extract_response(
    svc: &mut ServiceInstance,
    def: &ServiceDefinition,
    mode: &ResponseMode,
) -> Result<ServiceResponse, InvocationError> {
    let mut response = std::mem::take(&mut svc.response);
    match mode {
        ResponseMode::Raw {
            skip_response_envelope,
        } => {
            if *skip_response_envelope || !def.needs_response_envelope {
                response.payload = unwrap_envelope(response.payload);
            }
        }
        ResponseMode::Transport { json_content_type } => {
            shape_for_transport(&mut response, svc.data_format, json_content_type)?;
        }
    }
    Ok(response)
}

/// Serializes structured payloads and settles the content type.
///
/// Text and bytes pass through. Structured values become JSON for JSON-like
/// formats; otherwise strings are emitted bare and other values as their
/// JSON text. The JSON content type applies only to the `json` format and
/// only when the service did not pick one.
///
/// # Errors
///
/// Fails if a response header or the content type is not a valid HTTP value.
pub fn shape_for_transport(
    response: &mut ServiceResponse,
    data_format: Option<DataFormat>,
    json_content_type: &str,
) -> Result<(), InvocationError> {
    response.payload = match std::mem::take(&mut response.payload) {
        Payload::Json(value) if data_format.is_some_and(DataFormat::is_json_like) => {
            let encoded = serde_json::to_vec(&value).map_err(anyhow::Error::from)?;
            Payload::Bytes(Bytes::from(encoded))
        }
        Payload::Json(Value::String(s)) => Payload::Text(s),
        Payload::Json(Value::Null) => Payload::Empty,
        Payload::Json(other) => Payload::Text(other.to_string()),
        passthrough => passthrough,
    };

    if !response.content_type_changed && data_format == Some(DataFormat::Json) {
        response.content_type = json_content_type.to_string();
    }

    HeaderValue::from_str(&response.content_type).map_err(|_| {
        InvocationError::internal(format!("invalid content type `{}`", response.content_type))
    })?;
    for (name, value) in &response.headers {
        HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| InvocationError::internal(format!("invalid response header name `{name}`")))?;
        HeaderValue::from_str(value)
            .map_err(|_| InvocationError::internal(format!("invalid value for response header `{name}`")))?;
    }
    Ok(())
}

/// Strips the response envelope from a structured payload.
///
/// `_meta` is removed first. If exactly one key remains and it is `response`
/// or starts with [`ENVELOPE_PREFIX`], its value is returned. Anything else
/// is returned as a mapping, unchanged apart from the removed `_meta`.
#[must_use]
pub fn unwrap_envelope(payload: Payload) -> Payload {
    let Payload::Json(Value::Object(mut map)) = payload else {
        return payload;
    };
    map.remove(META_KEY);
    if map.len() == 1 {
        let key = map.keys().next().cloned().unwrap_or_default();
        if key == "response" || key.starts_with(ENVELOPE_PREFIX) {
            if let Some(inner) = map.remove(&key) {
                return Payload::Json(inner);
            }
        }
    }
    Payload::Json(Value::Object(map))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
