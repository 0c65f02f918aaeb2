//! Request handler: bridges a matched request to a service invocation.
//!
//! Assembles channel parameters, serves and fills the response cache, binds
//! a fresh service instance and runs it through the engine.

use std::collections::BTreeMap;
use std::sync::Arc;

use busline_core::{
    cache_key, request_fingerprint, CacheEntry, ChannelDescriptor, ChannelInfo, ChannelParams,
    DataFormat, ParamValue, ParamsPriority, Payload, SecurityInfo,
};
use bytes::Bytes;
use http::StatusCode;

use super::request::RequestMeta;
use crate::service::definition::{HashInput, ServiceDefinition};
use crate::service::engine::{self, ResponseMode};
use crate::service::error::InvocationError;
use crate::service::instance::{Facilities, ServiceResponse};
use crate::service::runtime::RuntimeContext;

/// Result of a handled request, ready for the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerResponse {
    pub payload: Bytes,
    pub content_type: String,
    pub headers: BTreeMap<String, String>,
    pub status: StatusCode,
    pub from_cache: bool,
}

impl HandlerResponse {
    fn from_service(response: ServiceResponse) -> Self {
        let payload = match response.payload {
            Payload::Empty => Bytes::new(),
            Payload::Text(text) => Bytes::from(text),
            Payload::Bytes(bytes) => bytes,
            Payload::Json(value) => Bytes::from(value.to_string()),
        };
        Self {
            payload,
            content_type: response.content_type,
            headers: response.headers,
            status: response.status_code,
            from_cache: false,
        }
    }

    fn from_cache(entry: CacheEntry) -> Self {
        Self {
            payload: Bytes::from(entry.payload),
            content_type: entry.content_type,
            headers: entry.headers,
            status: StatusCode::from_u16(entry.status_code).unwrap_or(StatusCode::OK),
            from_cache: true,
        }
    }

    fn to_cache_entry(&self) -> CacheEntry {
        CacheEntry {
            payload: self.payload.to_vec(),
            content_type: self.content_type.clone(),
            headers: self.headers.clone(),
            status_code: self.status.as_u16(),
        }
    }
}

/// Parameters assembled for one request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssembledParams {
    /// Query and path parameters merged by the channel's priority.
    pub channel_params: ChannelParams,
    /// Form fields from the body.
    pub post: ChannelParams,
}

/// Parses `application/x-www-form-urlencoded` data. Keys given once become
/// scalars; repeated keys keep all values in order.
#[must_use]
pub fn parse_form(raw: &[u8]) -> ChannelParams {
    let mut grouped: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (key, value) in form_urlencoded::parse(raw) {
        grouped.entry(key.into_owned()).or_default().push(value.into_owned());
    }
    grouped
        .into_iter()
        .map(|(key, mut values)| {
            let value = if values.len() == 1 {
                ParamValue::Single(values.remove(0))
            } else {
                ParamValue::Multi(values)
            };
            (key, value)
        })
        .collect()
}

/// Merges query and path parameters and, for channels without a data
/// format, flattens a form-encoded body.
#[must_use]
pub fn assemble_params(
    path_params: &ChannelParams,
    channel: &ChannelDescriptor,
    meta: &RequestMeta,
    raw_body: &[u8],
    pre_parsed_post: Option<ChannelParams>,
) -> AssembledParams {
    let query = parse_form(meta.query_string.as_bytes());
    let (low, high) = match channel.params_priority {
        ParamsPriority::QueryOverPath => (path_params.clone(), query),
        ParamsPriority::PathOverQuery => (query, path_params.clone()),
    };
    let mut channel_params = low;
    channel_params.extend(high);

    let post = match pre_parsed_post {
        Some(post) => post,
        None if channel.data_format.is_none() && is_form(meta) => parse_form(raw_body),
        None => ChannelParams::new(),
    };

    AssembledParams {
        channel_params,
        post,
    }
}

fn is_form(meta: &RequestMeta) -> bool {
    meta.header("content-type")
        .is_some_and(|ct| ct.starts_with("application/x-www-form-urlencoded"))
}

/// Parses the body according to the channel's data format.
///
/// # Errors
///
/// Returns a bad request if a JSON channel receives a body that is not JSON.
pub fn parse_payload(raw: &Bytes, data_format: Option<DataFormat>) -> Result<Payload, InvocationError> {
    match data_format {
        Some(format) if format.is_json_like() => {
            if raw.iter().all(u8::is_ascii_whitespace) {
                return Ok(Payload::Empty);
            }
            serde_json::from_slice(raw)
                .map(Payload::Json)
                .map_err(|e| InvocationError::bad_request(format!("invalid JSON input: {e}")))
        }
        _ => Ok(Payload::from_raw(raw.clone())),
    }
}

/// Computes the cache key for a request: the service's own hash if it
/// declares one and it yields a value, otherwise the request fingerprint.
#[must_use]
pub fn compute_cache_key(
    definition: &ServiceDefinition,
    channel: &ChannelDescriptor,
    params: &ChannelParams,
    meta: &RequestMeta,
    raw_body: &[u8],
) -> String {
    let custom = definition.hooks.request_hash.as_ref().and_then(|hash| {
        hash(&HashInput {
            service: &definition.name,
            method: &meta.method,
            path: &meta.path,
            params,
            body: raw_body,
        })
    });
    let hash = custom
        .unwrap_or_else(|| request_fingerprint(&meta.method, &meta.path, params, raw_body));
    cache_key(channel.id, &hash)
}

/// Everything the handler needs about one matched request.
#[derive(Debug)]
pub struct HandleRequest<'a> {
    pub cid: &'a str,
    pub channel: &'a Arc<ChannelDescriptor>,
    pub path_params: &'a ChannelParams,
    pub meta: &'a RequestMeta,
    pub raw_body: &'a Bytes,
    pub post: Option<ChannelParams>,
    pub security: SecurityInfo,
}

#[derive(Debug, Clone)]
pub struct RequestHandler {
    runtime: Arc<RuntimeContext>,
}

impl RequestHandler {
    #[must_use]
    pub fn new(runtime: Arc<RuntimeContext>) -> Self {
        Self { runtime }
    }

    /// Looks the request up in the channel's cache. Returns the key to store
    /// under after a miss, and the cached response on a hit.
    fn cache_lookup(
        &self,
        definition: &ServiceDefinition,
        req: &HandleRequest<'_>,
        params: &ChannelParams,
    ) -> Option<(String, Option<HandlerResponse>)> {
        let cache = req.channel.cache.as_ref()?;
        let key = compute_cache_key(definition, req.channel, params, req.meta, req.raw_body);
        let hit = self
            .runtime
            .cache
            .get(cache.cache_type, &cache.name, &key)
            .and_then(|raw| match CacheEntry::from_bytes(&raw) {
                Ok(entry) => Some(HandlerResponse::from_cache(entry)),
                Err(err) => {
                    tracing::warn!(cid = %req.cid, key = %key, error = %err, "undecodable cache entry");
                    None
                }
            });
        Some((key, hit))
    }

    /// Invokes the channel's service for one request.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the service is unknown or inactive, and any
    /// error raised while parsing the payload or running the service.
    pub async fn handle(&self, req: HandleRequest<'_>) -> Result<HandlerResponse, InvocationError> {
        let services = &self.runtime.services;
        let impl_id = services.resolve_name_to_impl(&req.channel.service)?;
        let (mut svc, active) = services.new_instance(&impl_id)?;
        if !active {
            return Err(InvocationError::not_found(format!(
                "service `{}` is not active",
                svc.name
            )));
        }
        let definition = svc.definition().clone();

        let params = if req.channel.merge_url_params {
            assemble_params(
                req.path_params,
                req.channel,
                req.meta,
                req.raw_body,
                req.post.clone(),
            )
        } else {
            AssembledParams {
                post: req.post.clone().unwrap_or_default(),
                ..AssembledParams::default()
            }
        };

        let cached = self.cache_lookup(&definition, &req, &params.channel_params);
        if let Some((key, Some(hit))) = &cached {
            tracing::debug!(cid = %req.cid, key = %key, "served from cache");
            return Ok(hit.clone());
        }

        let payload = parse_payload(req.raw_body, req.channel.data_format)?;

        let channel_info = Arc::new(ChannelInfo::from_descriptor(req.channel, req.security));
        svc.bind(
            req.cid.to_string(),
            channel_info,
            Facilities {
                runtime: self.runtime.clone(),
            },
        );
        svc.transport = req.channel.transport;
        svc.request.payload = payload;
        svc.request.raw_request = req.raw_body.clone();
        svc.request.http_method = Some(req.meta.method.clone());
        svc.request.path = Some(req.meta.path.clone());
        svc.request.remote_addr.clone_from(&req.meta.remote_addr);
        svc.request.headers.clone_from(&req.meta.headers);
        svc.request.path_params = req.path_params.clone();
        svc.request.channel_params = params.channel_params;
        svc.request.post = params.post;
        svc.request.merge_channel_params = req.channel.merge_url_params;
        svc.request.params_priority = req.channel.params_priority;

        let mode = ResponseMode::Transport {
            json_content_type: self.runtime.config.json_content_type.clone(),
        };
        let response = HandlerResponse::from_service(engine::execute(svc, &mode).await?);

        if let (Some((key, None)), Some(cache)) = (cached, req.channel.cache.as_ref()) {
            match response.to_cache_entry().to_bytes() {
                Ok(bytes) => self
                    .runtime
                    .cache
                    .set(cache.cache_type, &cache.name, &key, bytes, cache.ttl),
                Err(err) => {
                    tracing::warn!(cid = %req.cid, error = %err, "response not cacheable");
                }
            }
        }
        Ok(response)
    }
}
