//! Fallback handler turning every unrouted HTTP request into a dispatch.

use std::net::SocketAddr;

use axum::body::{to_bytes, Body};
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use tower::ServiceExt;

use super::AppState;
use crate::dispatch::dispatcher::error_envelope;
use crate::dispatch::request::{DispatchRequest, DispatchResponse, RequestMeta};

/// Converts the request, runs it through the dispatch pipeline and converts
/// the response back. The body is read once, up to `max_body_bytes`.
pub async fn gateway_handler(State(state): State<AppState>, req: Request) -> Response {
    let (parts, body) = req.into_parts();

    let mut meta = RequestMeta::new(parts.method.as_str(), parts.uri.path())
        .with_query(parts.uri.query().unwrap_or_default());
    for (name, value) in &parts.headers {
        if let Ok(value) = value.to_str() {
            meta = meta.with_header(name.as_str(), value);
        }
    }
    meta.remote_addr = parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string());

    let body = match to_bytes(body, state.config.max_body_bytes).await {
        Ok(body) => body,
        Err(err) => {
            tracing::warn!(path = %meta.path, error = %err, "request body rejected");
            return StatusCode::PAYLOAD_TOO_LARGE.into_response();
        }
    };
    let request = DispatchRequest::new(meta, body);

    if !state.shutdown.health_state().accepts_requests() {
        let resp = error_envelope(
            &request.cid,
            StatusCode::SERVICE_UNAVAILABLE,
            "server is not accepting requests",
            None,
            &state.runtime.config.json_content_type,
        );
        return into_http(resp);
    }

    let _guard = state.shutdown.in_flight_guard();
    match state.pipeline.clone().oneshot(request).await {
        Ok(resp) => into_http(resp),
        Err(never) => match never {},
    }
}

fn into_http(resp: DispatchResponse) -> Response {
    let mut out = Response::new(Body::from(resp.body));
    *out.status_mut() = resp.status;
    let headers = out.headers_mut();
    for (name, value) in resp.headers {
        match (HeaderName::try_from(name.as_str()), HeaderValue::try_from(value.as_str())) {
            (Ok(name), Ok(value)) => {
                headers.insert(name, value);
            }
            _ => tracing::warn!(cid = %resp.cid, header = %name, "dropping invalid response header"),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::Router;
    use busline_core::{ChannelDescriptor, DataFormat};
    use serde_json::{json, Value};

    use super::*;
    use crate::collab::routes::RouteTable;
    use crate::dispatch::dispatcher::CID_HEADER;
    use crate::service::definition::{handler_fn, ServiceDefinition};
    use crate::service::registry::ServiceStore;
    use crate::testing;

    fn app() -> AppState {
        let store = Arc::new(ServiceStore::new());
        store.register(ServiceDefinition::new("greet").handler(handler_fn(|svc| {
            let name = svc.request.param("name").unwrap_or("nobody").to_string();
            let addr = svc.request.remote_addr.clone();
            svc.response.set_payload(json!({"hello": name, "from": addr}));
            Ok(())
        })));
        let mut channel = ChannelDescriptor::new(1, "greet", "/greet/{name}", "greet");
        channel.data_format = Some(DataFormat::Json);
        channel.merge_url_params = true;
        let routes = RouteTable::new();
        routes.replace(vec![channel]).unwrap();
        let runtime = testing::runtime_builder(store)
            .channels(Arc::new(routes))
            .build()
            .unwrap();
        testing::app_state(runtime)
    }

    fn router(state: AppState) -> Router {
        Router::new().fallback(gateway_handler).with_state(state)
    }

    async fn body_json(resp: Response) -> Value {
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn dispatches_through_the_pipeline() {
        let state = app();
        state.shutdown.set_ready();
        let mut req = Request::builder()
            .uri("/greet/ada")
            .body(Body::empty())
            .unwrap();
        req.extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([10, 0, 0, 7], 4000))));

        let resp = router(state).oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(resp.headers().contains_key(CID_HEADER.to_ascii_lowercase().as_str()));
        assert_eq!(body_json(resp).await, json!({"hello": "ada", "from": "10.0.0.7"}));
    }

    #[tokio::test]
    async fn unknown_route_is_404() {
        let state = app();
        state.shutdown.set_ready();
        let req = Request::builder().uri("/nope").body(Body::empty()).unwrap();
        let resp = router(state).oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn refuses_while_not_ready() {
        let state = app();
        let req = Request::builder().uri("/greet/ada").body(Body::empty()).unwrap();
        let resp = router(state).oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body_json(resp).await["result"], json!("Error"));
    }

    #[tokio::test]
    async fn oversized_body_is_rejected() {
        let mut state = app();
        state.shutdown.set_ready();
        let mut config = (*state.config).clone();
        config.max_body_bytes = 4;
        state.config = Arc::new(config);
        let req = Request::builder()
            .method("POST")
            .uri("/greet/ada")
            .body(Body::from("{\"too\":\"long\"}"))
            .unwrap();
        let resp = router(state).oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }
}
