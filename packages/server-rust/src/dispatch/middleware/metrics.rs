//! Metrics middleware for dispatched requests.
//!
//! Wraps every request in a `dispatch` span carrying the cid, records the
//! final status and duration on it, and feeds the `metrics` facade.

use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use tower::{Layer, Service};
use tracing::{info_span, Instrument};

use crate::dispatch::request::{DispatchRequest, DispatchResponse};

// ---------------------------------------------------------------------------
// MetricsLayer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct MetricsLayer;

impl<S> Layer<S> for MetricsLayer {
    type Service = MetricsService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        MetricsService { inner }
    }
}

// ---------------------------------------------------------------------------
// MetricsService
// ---------------------------------------------------------------------------

/// Service wrapper that records request duration and status.
#[derive(Debug, Clone)]
pub struct MetricsService<S> {
    inner: S,
}

impl<S> Service<DispatchRequest> for MetricsService<S>
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
        let span = info_span!(
            "dispatch",
            cid = %req.cid,
            method = %req.meta.method,
            path = %req.meta.path,
            status = tracing::field::Empty,
            duration_ms = tracing::field::Empty,
        );

        let fut = self.inner.call(req);

        Box::pin(
            async move {
                let start = Instant::now();
                let result = fut.await;
                let elapsed = start.elapsed();

                #[allow(clippy::cast_possible_truncation)]
                let duration_ms = elapsed.as_millis() as u64;
                let status = match &result {
                    Ok(resp) => resp.status.as_u16(),
                    Err(never) => match *never {},
                };

                let current = tracing::Span::current();
                current.record("status", status);
                current.record("duration_ms", duration_ms);

                metrics::counter!("busline_requests_total", "status" => status.to_string())
                    .increment(1);
                metrics::histogram!("busline_request_duration_ms")
                    .record(elapsed.as_secs_f64() * 1000.0);

                tracing::info!(status, duration_ms, "request complete");

                result
            }
            .instrument(span),
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use http::StatusCode;
    use tower::ServiceExt;

    use super::*;
    use crate::testing::request;

    /// Answers every request with 418 and echoes the cid.
    struct Teapot;

    impl Service<DispatchRequest> for Teapot {
        type Response = DispatchResponse;
        type Error = Infallible;
        type Future = Pin<Box<dyn Future<Output = Result<DispatchResponse, Infallible>> + Send>>;

        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, req: DispatchRequest) -> Self::Future {
            Box::pin(async move {
                Ok(DispatchResponse {
                    cid: req.cid,
                    status: StatusCode::IM_A_TEAPOT,
                    headers: Vec::new(),
                    body: Bytes::new(),
                })
            })
        }
    }

    #[tokio::test]
    async fn passes_response_through() {
        let req = request("GET", "/tea");
        let cid = req.cid.clone();
        let resp = MetricsLayer.layer(Teapot).oneshot(req).await.unwrap();
        assert_eq!(resp.status, StatusCode::IM_A_TEAPOT);
        assert_eq!(resp.cid, cid);
    }
}
