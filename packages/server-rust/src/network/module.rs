//! Network module with deferred startup lifecycle.
//!
//! `new()` builds the dispatch pipeline, `start()` binds the TCP listener and
//! `serve()` starts accepting connections. Splitting bind from serve lets the
//! caller learn the bound port before traffic flows.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tracing::{info, warn};

use super::config::NetworkConfig;
use super::handlers::{
    gateway_handler, health_handler, liveness_handler, readiness_handler, AppState,
};
use super::middleware::build_http_layers;
use super::shutdown::ShutdownController;
use crate::dispatch::{build_dispatch_pipeline, DispatchPipeline, RequestDispatcher};
use crate::service::runtime::RuntimeContext;

/// Owns the HTTP listener and the request pipeline behind it.
///
/// Routes:
/// - `GET /health`, `/health/live`, `/health/ready` -- probes
/// - everything else -- the gateway, which hands the request to the
///   dispatcher
pub struct NetworkModule {
    config: NetworkConfig,
    runtime: Arc<RuntimeContext>,
    pipeline: DispatchPipeline,
    listener: Option<TcpListener>,
    shutdown: Arc<ShutdownController>,
}

impl NetworkModule {
    #[must_use]
    pub fn new(config: NetworkConfig, runtime: Arc<RuntimeContext>) -> Self {
        let pipeline =
            build_dispatch_pipeline(RequestDispatcher::new(Arc::clone(&runtime)), &runtime.config);
        Self {
            config,
            runtime,
            pipeline,
            listener: None,
            shutdown: Arc::new(ShutdownController::new()),
        }
    }

    #[must_use]
    pub fn shutdown_controller(&self) -> Arc<ShutdownController> {
        Arc::clone(&self.shutdown)
    }

    /// Assembles the axum router with all routes and middleware.
    pub fn build_router(&self) -> Router {
        let state = AppState {
            pipeline: self.pipeline.clone(),
            runtime: Arc::clone(&self.runtime),
            shutdown: Arc::clone(&self.shutdown),
            config: Arc::new(self.config.clone()),
            start_time: Instant::now(),
        };

        Router::new()
            .route("/health", get(health_handler))
            .route("/health/live", get(liveness_handler))
            .route("/health/ready", get(readiness_handler))
            .fallback(gateway_handler)
            .layer(build_http_layers(&self.config))
            .with_state(state)
    }

    /// Binds the TCP listener and returns the bound port, which differs from
    /// the configured one when port 0 is used.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound.
    pub async fn start(&mut self) -> anyhow::Result<u16> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&addr).await?;
        let port = listener.local_addr()?.port();

        info!("TCP listener bound to {}:{}", self.config.host, port);

        self.listener = Some(listener);
        Ok(port)
    }

    /// Serves until `shutdown` resolves, then drains in-flight requests for
    /// at most `drain_timeout`.
    ///
    /// # Errors
    ///
    /// Returns an error if `start()` was not called or the server hits a
    /// fatal I/O error.
    pub async fn serve(
        mut self,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> anyhow::Result<()> {
        let listener = self
            .listener
            .take()
            .ok_or_else(|| anyhow::anyhow!("start() must be called before serve()"))?;
        let router = self.build_router();
        let shutdown_ctrl = self.shutdown;

        shutdown_ctrl.set_ready();
        info!("Serving HTTP connections");

        let ctrl = Arc::clone(&shutdown_ctrl);
        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            shutdown.await;
            ctrl.trigger_shutdown();
        })
        .await?;

        shutdown_ctrl.trigger_shutdown();
        if !shutdown_ctrl.wait_for_drain(self.config.drain_timeout).await {
            warn!(
                in_flight = shutdown_ctrl.in_flight_count(),
                "drain timed out with requests still in flight"
            );
        }
        info!("Network module stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    use super::*;
    use crate::service::registry::ServiceStore;
    use crate::testing;

    fn module() -> NetworkModule {
        let config = NetworkConfig {
            host: "127.0.0.1".to_string(),
            ..NetworkConfig::default()
        };
        NetworkModule::new(config, testing::runtime(Arc::new(ServiceStore::new())))
    }

    #[tokio::test]
    async fn serve_without_start_fails() {
        let err = module().serve(async {}).await.unwrap_err();
        assert!(err.to_string().contains("start()"));
    }

    #[tokio::test]
    async fn router_serves_probes_and_falls_back_to_gateway() {
        let module = module();
        module.shutdown_controller().set_ready();
        let router = module.build_router();

        let resp = router
            .clone()
            .oneshot(Request::builder().uri("/health/live").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = router
            .oneshot(Request::builder().uri("/no/such/channel").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert!(String::from_utf8_lossy(&body).starts_with("URL not found (CID:"));
    }

    #[tokio::test]
    async fn start_then_serve_until_shutdown() {
        let mut module = module();
        let port = module.start().await.unwrap();
        assert_ne!(port, 0);
        let ctrl = module.shutdown_controller();

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let server = tokio::spawn(module.serve(async move {
            let _ = rx.await;
        }));

        testing::wait_until(|| ctrl.health_state().accepts_requests()).await;
        tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(ctrl.health_state().as_str(), "stopped");
    }
}
