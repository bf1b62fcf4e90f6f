//! Edge Cache Server
//!
//! Runs the cache engine with its maintenance loop and exposes health,
//! Prometheus metrics and analytics over HTTP.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        edgecache                                 │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐    ┌──────────────┐    ┌──────────────┐       │
//! │  │  EdgeCache   │───▶│ Maintenance  │    │  HTTP        │       │
//! │  │  (engine)    │    │ sweep/health │    │ /healthz     │       │
//! │  │              │◀───┼──────────────┼────│ /metrics     │       │
//! │  └──────────────┘    └──────────────┘    │ /analytics   │       │
//! │                                           └──────────────┘       │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use edgecache::cache::{EdgeCache, LayerStatus, MaintenanceTask};
use edgecache::config::EngineConfig;
use edgecache::error::{Error, Result};
use edgecache::exporter::CacheExporter;

// =============================================================================
// CLI Arguments
// =============================================================================

/// Edge cache server - multi-tier, tenant-isolated caching
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Engine configuration file (YAML); stock layers when omitted
    #[arg(long, env = "EDGECACHE_CONFIG")]
    config: Option<PathBuf>,

    /// Metrics and analytics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: String,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

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

    info!("Starting edge cache");

    let config = match &args.config {
        Some(path) => {
            info!("  Config file: {}", path.display());
            EngineConfig::from_file(path)?
        }
        None => {
            info!("  Config file: none, using stock layers");
            EngineConfig::default()
        }
    };
    for layer in &config.layers {
        info!(
            "  Layer {} ({}, {}, max {}, ttl {})",
            layer.id, layer.kind, layer.eviction, layer.max_size, layer.default_ttl
        );
    }

    let cache = Arc::new(EdgeCache::new(config)?);
    let exporter = Arc::new(CacheExporter::new()?);
    let shutdown = CancellationToken::new();

    let maintenance = MaintenanceTask::new(cache.clone(), shutdown.clone()).spawn();

    // Start health server
    let health_addr = args.health_addr.clone();
    let health_cache = cache.clone();
    tokio::spawn(async move {
        if let Err(e) = run_health_server(&health_addr, health_cache).await {
            error!("Health server error: {}", e);
        }
    });

    // Start metrics server
    let metrics_addr = args.metrics_addr.clone();
    let metrics_cache = cache.clone();
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(&metrics_addr, metrics_cache, exporter).await {
            error!("Metrics server error: {}", e);
        }
    });

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| Error::Internal(format!("Failed to listen for shutdown signal: {}", e)))?;

    info!("Shutdown requested");
    shutdown.cancel();
    if let Err(e) = maintenance.await {
        error!("Maintenance task ended abnormally: {}", e);
    }

    info!("Edge cache shutdown complete");
    Ok(())
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
    for directive in ["hyper=warn", "h2=warn"] {
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
// HTTP Helpers
// =============================================================================

type HttpResponse = Response<Full<Bytes>>;

fn respond(status: StatusCode, content_type: &str, body: impl Into<Bytes>) -> HttpResponse {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    if let Ok(value) = content_type.parse() {
        response.headers_mut().insert(hyper::header::CONTENT_TYPE, value);
    }
    response
}

fn text(status: StatusCode, body: &'static str) -> HttpResponse {
    respond(status, "text/plain; charset=utf-8", body)
}

async fn serve<F, Fut>(addr: &str, name: &'static str, handler: F) -> Result<()>
where
    F: Fn(Request<hyper::body::Incoming>) -> Fut + Clone + Send + Sync + 'static,
    Fut: std::future::Future<Output = std::result::Result<HttpResponse, Infallible>>
        + Send
        + 'static,
{
    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| Error::Internal(format!("Invalid {} server address: {}", name, e)))?;

    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Internal(format!("Failed to bind {} server: {}", name, e)))?;

    info!("{} server listening on {}", name, addr);

    loop {
        let (stream, _) = listener
            .accept()
            .await
            .map_err(|e| Error::Internal(format!("{} server accept error: {}", name, e)))?;

        let io = TokioIo::new(stream);
        let handler = handler.clone();

        tokio::spawn(async move {
            if let Err(e) = http1::Builder::new()
                .serve_connection(io, service_fn(handler))
                .await
            {
                error!("{} server connection error: {}", name, e);
            }
        });
    }
}

// =============================================================================
// Health Server
// =============================================================================

async fn run_health_server(addr: &str, cache: Arc<EdgeCache>) -> Result<()> {
    serve(addr, "Health", move |req: Request<hyper::body::Incoming>| {
        let cache = cache.clone();
        async move {
            let response = match req.uri().path() {
                "/healthz" | "/livez" => text(StatusCode::OK, "ok"),
                // Ready while at least one layer can serve traffic
                "/readyz" => {
                    let ready = cache
                        .registry()
                        .layers()
                        .iter()
                        .any(|l| l.status() == LayerStatus::Active);
                    if ready {
                        text(StatusCode::OK, "ok")
                    } else {
                        text(StatusCode::SERVICE_UNAVAILABLE, "no active cache layers")
                    }
                }
                _ => text(StatusCode::NOT_FOUND, "not found"),
            };
            Ok::<_, Infallible>(response)
        }
    })
    .await
}

// =============================================================================
// Metrics Server
// =============================================================================

async fn run_metrics_server(
    addr: &str,
    cache: Arc<EdgeCache>,
    exporter: Arc<CacheExporter>,
) -> Result<()> {
    serve(addr, "Metrics", move |req: Request<hyper::body::Incoming>| {
        let cache = cache.clone();
        let exporter = exporter.clone();
        async move {
            let response = match req.uri().path() {
                "/metrics" => {
                    exporter.update(&cache.statistics());
                    match exporter.encode() {
                        Ok(body) => respond(StatusCode::OK, &exporter.content_type(), body),
                        Err(e) => {
                            error!("Failed to encode metrics: {}", e);
                            text(StatusCode::INTERNAL_SERVER_ERROR, "metrics unavailable")
                        }
                    }
                }
                "/analytics" => {
                    let analytics = cache.cache_analytics(None).await;
                    match serde_json::to_vec(&analytics) {
                        Ok(body) => respond(StatusCode::OK, "application/json", body),
                        Err(e) => {
                            error!("Failed to serialize analytics: {}", e);
                            text(StatusCode::INTERNAL_SERVER_ERROR, "analytics unavailable")
                        }
                    }
                }
                "/statistics" => match serde_json::to_vec(&cache.statistics()) {
                    Ok(body) => respond(StatusCode::OK, "application/json", body),
                    Err(e) => {
                        error!("Failed to serialize statistics: {}", e);
                        text(StatusCode::INTERNAL_SERVER_ERROR, "statistics unavailable")
                    }
                },
                _ => text(StatusCode::NOT_FOUND, "not found"),
            };
            Ok::<_, Infallible>(response)
        }
    })
    .await
}
