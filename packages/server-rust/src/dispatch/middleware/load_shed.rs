//! Load-shedding middleware for dispatched requests.
//!
//! Rejects requests when the number in flight reaches
//! `max_concurrent_requests`, answering with the standard 503 error envelope.

use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::sync::Semaphore;
use tower::{Layer, Service};

use crate::dispatch::dispatcher::overloaded_response;
use crate::dispatch::request::{DispatchRequest, DispatchResponse};

// ---------------------------------------------------------------------------
// LoadShedLayer
// ---------------------------------------------------------------------------

/// Tower layer that limits concurrent requests via a semaphore.
///
/// When all permits are taken, incoming requests are rejected immediately
/// rather than queued.
#[derive(Debug, Clone)]
pub struct LoadShedLayer {
    semaphore: Arc<Semaphore>,
    json_content_type: Arc<str>,
}

impl LoadShedLayer {
    #[must_use]
    pub fn new(max_concurrent: u32, json_content_type: &str) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent as usize)),
            json_content_type: Arc::from(json_content_type),
        }
    }
}

impl<S> Layer<S> for LoadShedLayer {
    type Service = LoadShedService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        LoadShedService {
            inner,
            semaphore: self.semaphore.clone(),
            json_content_type: self.json_content_type.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// LoadShedService
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct LoadShedService<S> {
    inner: S,
    semaphore: Arc<Semaphore>,
    json_content_type: Arc<str>,
}

impl<S> Service<DispatchRequest> for LoadShedService<S>
where
    S: Service<DispatchRequest, Response = DispatchResponse, Error = Infallible> + Send,
    S::Future: Send + 'static,
{
    type Response = DispatchResponse;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<DispatchResponse, Infallible>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: DispatchRequest) -> Self::Future {
        let Ok(permit) = self.semaphore.clone().try_acquire_owned() else {
            metrics::counter!("busline_requests_shed_total").increment(1);
            tracing::warn!(cid = %req.cid, path = %req.meta.path, "request shed");
            let resp = overloaded_response(&req, &self.json_content_type);
            return Box::pin(async move { Ok(resp) });
        };

        let fut = self.inner.call(req);
        Box::pin(async move {
            // Held until the response is ready.
            let result = fut.await;
            drop(permit);
            result
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use http::StatusCode;
    use tower::ServiceExt;

    use super::*;
    use crate::testing::request;

    /// Service that holds each request for a fixed delay.
    struct SlowService {
        delay_ms: u64,
    }

    impl Service<DispatchRequest> for SlowService {
        type Response = DispatchResponse;
        type Error = Infallible;
        type Future = Pin<Box<dyn Future<Output = Result<DispatchResponse, Infallible>> + Send>>;

        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, req: DispatchRequest) -> Self::Future {
            let delay = self.delay_ms;
            Box::pin(async move {
                tokio::time::sleep(Duration::from_millis(delay)).await;
                Ok(DispatchResponse {
                    cid: req.cid,
                    status: StatusCode::OK,
                    headers: Vec::new(),
                    body: Bytes::new(),
                })
            })
        }
    }

    #[tokio::test]
    async fn allows_requests_under_limit() {
        let svc = LoadShedLayer::new(10, "application/json").layer(SlowService { delay_ms: 1 });
        let resp = svc.oneshot(request("GET", "/")).await.unwrap();
        assert_eq!(resp.status, StatusCode::OK);
    }

    #[tokio::test(start_paused = true)]
    async fn sheds_when_overloaded() {
        let mut svc =
            LoadShedLayer::new(1, "application/json").layer(SlowService { delay_ms: 500 });

        let _ = ServiceExt::ready(&mut svc).await.unwrap();
        let in_flight = tokio::spawn(svc.call(request("GET", "/first")));
        tokio::task::yield_now().await;

        let rejected = request("GET", "/second");
        let cid = rejected.cid.clone();
        let resp = svc.call(rejected).await.unwrap();
        assert_eq!(resp.status, StatusCode::SERVICE_UNAVAILABLE);
        let body: serde_json::Value = serde_json::from_slice(&resp.body).unwrap();
        assert_eq!(body["cid"], serde_json::json!(cid));

        assert_eq!(in_flight.await.unwrap().unwrap().status, StatusCode::OK);
    }
}
