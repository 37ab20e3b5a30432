//! CSI Volume Bridge
//!
//! Serves the container runtime's volume plugin protocol and drives a
//! CSI-style remote volume service behind it.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │              Container runtime (plugin client)            │
//! └─────────────────────────────┬────────────────────────────┘
//!                               │ POST /VolumeDriver.*
//! ┌─────────────────────────────┴────────────────────────────┐
//! │  Plugin API  →  Lifecycle bridge  →  Name cache           │
//! ├──────────────────────────────────────────────────────────┤
//! │  Idempotent interceptor  ←  Resolver  ←  Host inspector   │
//! ├──────────────────────────────────────────────────────────┤
//! │               Remote volume service backend               │
//! └──────────────────────────────────────────────────────────┘
//! ```

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use csi_volume_bridge::{
    assemble, BridgeConfig, BridgeMetrics, Error, PluginServer, PluginServerConfig, Result,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// CSI Volume Bridge - volume plugin protocol on top of CSI-style volume services
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Plugin API bind address
    #[arg(long, env = "PLUGIN_ADDR", default_value = "127.0.0.1:8095")]
    plugin_addr: String,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: String,

    /// YAML configuration file
    #[arg(long, env = "BRIDGE_CONFIG")]
    config: Option<PathBuf>,

    /// Backend driving the remote volume service
    #[arg(long, env = "BRIDGE_BACKEND")]
    backend: Option<String>,

    /// Directory under which volumes are mounted
    #[arg(long, env = "MOUNT_ROOT")]
    mount_root: Option<PathBuf>,

    /// Node id reported by the loopback backend
    #[arg(long, env = "NODE_ID")]
    node_id: Option<String>,

    /// Disable the idempotent interceptor
    #[arg(long, env = "NO_IDEMPOTENCY")]
    no_idempotency: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args);

    let config = load_config(&args)?;

    info!("Starting CSI Volume Bridge");
    info!("  Version: {}", csi_volume_bridge::VERSION);
    info!("  Plugin API: {}", args.plugin_addr);
    info!("  Backend: {}", config.backend);
    info!("  Mount root: {}", config.mount_root.display());

    let bridge = assemble(config)?;

    let health_addr = args.health_addr.clone();
    let metrics_addr = args.metrics_addr.clone();
    let metrics = bridge.metrics().clone();
    tokio::spawn(async move {
        let servers = futures::future::try_join(
            run_health_server(&health_addr),
            run_metrics_server(&metrics_addr, metrics),
        );
        if let Err(e) = servers.await {
            error!("Side server error: {}", e);
        }
    });

    let server_config = PluginServerConfig {
        addr: args.plugin_addr.parse().map_err(|e| {
            Error::Configuration(format!("Invalid plugin API address: {}", e))
        })?,
    };
    let server = PluginServer::new(server_config, bridge);

    let serve = server.run();
    tokio::pin!(serve);
    tokio::select! {
        res = &mut serve => res?,
        _ = tokio::signal::ctrl_c() => {
            info!("Received interrupt, shutting down");
            server.shutdown();
            serve.await?;
        }
    }

    info!("Bridge shutdown complete");
    Ok(())
}

fn load_config(args: &Args) -> Result<BridgeConfig> {
    let mut config = match &args.config {
        Some(path) => BridgeConfig::load(path)?,
        None => BridgeConfig::default(),
    };

    if let Some(backend) = &args.backend {
        config.backend = backend.clone();
    }
    if let Some(mount_root) = &args.mount_root {
        config.mount_root = mount_root.clone();
    }
    if let Some(node_id) = &args.node_id {
        config.backends.loopback.node_id = node_id.clone();
    }
    if args.no_idempotency {
        config.idempotency = false;
    }

    Ok(config)
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "tower=warn", "tower_http=info", "axum=info"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}

// =============================================================================
// Health Server
// =============================================================================

async fn run_health_server(addr: &str) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Response, Server, StatusCode};

    let make_svc = make_service_fn(|_conn| async {
        Ok::<_, std::convert::Infallible>(service_fn(|req: Request<Body>| async move {
            let (status, body) = match req.uri().path() {
                "/healthz" | "/livez" | "/readyz" => (StatusCode::OK, "ok"),
                _ => (StatusCode::NOT_FOUND, "not found"),
            };
            let mut response = Response::new(Body::from(body));
            *response.status_mut() = status;
            Ok::<_, std::convert::Infallible>(response)
        }))
    });

    let addr: SocketAddr = addr.parse().map_err(|e| {
        Error::Configuration(format!("Invalid health server address: {}", e))
    })?;

    info!("Health server listening on {}", addr);
    Server::try_bind(&addr)
        .map_err(|e| Error::Internal(format!("Health server bind error: {}", e)))?
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Health server error: {}", e)))?;

    Ok(())
}

// =============================================================================
// Metrics Server
// =============================================================================

async fn run_metrics_server(addr: &str, metrics: BridgeMetrics) -> Result<()> {
    use hyper::header::{HeaderValue, CONTENT_TYPE};
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Response, Server, StatusCode};

    let make_svc = make_service_fn(move |_conn| {
        let metrics = metrics.clone();
        async move {
            Ok::<_, std::convert::Infallible>(service_fn(move |req: Request<Body>| {
                let metrics = metrics.clone();
                async move {
                    let response = match req.uri().path() {
                        "/metrics" => match metrics.encode() {
                            Ok((content_type, buffer)) => {
                                let mut response = Response::new(Body::from(buffer));
                                if let Ok(value) = HeaderValue::from_str(&content_type) {
                                    response.headers_mut().insert(CONTENT_TYPE, value);
                                }
                                response
                            }
                            Err(e) => {
                                error!("Failed to encode metrics: {}", e);
                                let mut response = Response::new(Body::from(e.to_string()));
                                *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                                response
                            }
                        },
                        _ => {
                            let mut response = Response::new(Body::from("not found"));
                            *response.status_mut() = StatusCode::NOT_FOUND;
                            response
                        }
                    };
                    Ok::<_, std::convert::Infallible>(response)
                }
            }))
        }
    });

    let addr: SocketAddr = addr.parse().map_err(|e| {
        Error::Configuration(format!("Invalid metrics server address: {}", e))
    })?;

    info!("Metrics server listening on {}", addr);
    Server::try_bind(&addr)
        .map_err(|e| Error::Internal(format!("Metrics server bind error: {}", e)))?
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Metrics server error: {}", e)))?;

    Ok(())
}
