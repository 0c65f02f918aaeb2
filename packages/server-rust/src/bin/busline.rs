//! busline server binary.
//!
//! Serves the built-in `busline.ping` service on `GET /busline/ping` and
//! writes audit events to the log.

use std::sync::Arc;

use anyhow::Context;
use busline_core::{ChannelDescriptor, DataFormat};
use busline_server::collab::{RouteTable, TracingAuditSink, WorkerAuditLog};
use busline_server::logging::{self, LogFormat};
use busline_server::service::handler_fn;
use busline_server::{NetworkConfig, NetworkModule, RuntimeConfig, RuntimeContext, ServiceDefinition, ServiceStore};
use clap::Parser;
use serde_json::json;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "busline", version, about = "busline integration bus server")]
struct Args {
    /// Bind address
    #[arg(long, env = "BUSLINE_HOST", default_value = "0.0.0.0")]
    host: String,

    /// Listen port; 0 picks a free one
    #[arg(long, env = "BUSLINE_PORT", default_value_t = 17010)]
    port: u16,

    /// fmt or json
    #[arg(long, env = "BUSLINE_LOG_FORMAT", default_value = "fmt")]
    log_format: LogFormat,

    /// Filter directive, e.g. `busline_server=debug`. `RUST_LOG` wins when set.
    #[arg(long, env = "BUSLINE_LOG_DIRECTIVE")]
    log_directive: Option<String>,

    /// Concurrent dispatches before requests are shed
    #[arg(long, env = "BUSLINE_MAX_CONCURRENT_REQUESTS", default_value_t = 1000)]
    max_concurrent_requests: u32,

    /// Include internal error text in every error response
    #[arg(long, env = "BUSLINE_RETURN_ERROR_DETAILS")]
    return_error_details: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    logging::init(args.log_directive.as_deref(), args.log_format)?;

    let config = RuntimeConfig {
        max_concurrent_requests: args.max_concurrent_requests,
        return_error_details: args.return_error_details,
        ..RuntimeConfig::default()
    };

    let services = Arc::new(ServiceStore::new());
    services.register(ServiceDefinition::new("busline.ping").handler(handler_fn(|svc| {
        svc.response.set_payload(json!({"pong": svc.cid}));
        Ok(())
    })));

    let mut ping = ChannelDescriptor::new(1, "busline.ping", "/busline/ping", "busline.ping");
    ping.method = Some("GET".to_string());
    ping.data_format = Some(DataFormat::Json);
    let routes = Arc::new(RouteTable::new());
    routes.replace(vec![ping]).context("registering built-in channels")?;

    let audit = Arc::new(WorkerAuditLog::start(TracingAuditSink, config.audit_worker_tick_ms));
    let runtime = RuntimeContext::builder(config, services)
        .channels(routes)
        .audit(audit.clone())
        .build()?;

    let network = NetworkConfig {
        host: args.host,
        port: args.port,
        ..NetworkConfig::default()
    };
    let mut module = NetworkModule::new(network, runtime);
    let port = module.start().await?;
    info!(port, "busline listening");

    module
        .serve(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %err, "failed to listen for ctrl-c");
            }
            info!("shutdown signal received");
        })
        .await?;

    audit.stop().await;
    Ok(())
}
