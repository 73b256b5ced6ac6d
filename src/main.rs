//! tiercache daemon
//!
//! Hosts a cache registry backed by the in-memory distributed provider, runs
//! the background sweeper and exposes cache statistics over HTTP.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         tiercache daemon                         │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐    ┌──────────────┐    ┌──────────────┐       │
//! │  │   Sweeper    │───▶│ CacheRegistry│───▶│  Management  │──▶ /metrics
//! │  │  (periodic)  │    │              │    │   Registry   │       │
//! │  └──────────────┘    └──────────────┘    └──────────────┘       │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use tiercache::{
    CacheRegistry, EngineConfig, Error, InMemoryDistributedProvider, ManagementRegistry, Result,
    Sweeper, TaskLocalTenantContext,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// tiercache - multi-tenant two-tier cache engine
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Engine configuration file (YAML)
    #[arg(long, env = "TIERCACHE_CONFIG")]
    config: Option<PathBuf>,

    /// Override the sweep interval in seconds
    #[arg(long, env = "TIERCACHE_SWEEP_INTERVAL_SECONDS")]
    sweep_interval_seconds: Option<u64>,

    /// Metrics and health server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:9100")]
    metrics_addr: String,

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

    info!("Starting tiercache");

    let mut config = match &args.config {
        Some(path) => {
            info!("  Config file: {}", path.display());
            EngineConfig::from_file(path)?
        }
        None => EngineConfig::default(),
    };
    if let Some(secs) = args.sweep_interval_seconds {
        config.sweep.interval_secs = secs;
    }
    config.validate()?;

    info!("  Sweep interval: {:?}", config.sweep.interval());
    info!("  Sweep budget: {:?}", config.sweep.budget());
    info!("  Sweep concurrency: {}", config.sweep.concurrency());
    info!("  Idle cache retention: {:?}", config.idle_cache_retention());
    info!("  Default capacity: {}", config.defaults.capacity);

    let registry = CacheRegistry::builder(config)
        .tenant_context(Arc::new(TaskLocalTenantContext::new()))
        .provider(Arc::new(InMemoryDistributedProvider::new()))
        .build();
    info!(node = %registry.node_id(), "Cache registry ready");

    let sweeper = Sweeper::new(registry.clone()).start();

    let management = Arc::clone(registry.management());
    let metrics_addr = args.metrics_addr.clone();
    let server = tokio::spawn(async move {
        if let Err(e) = run_metrics_server(&metrics_addr, management).await {
            error!("Metrics server error: {}", e);
        }
    });

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl-C, shutting down"),
        Err(e) => warn!("Failed to listen for Ctrl-C: {}", e),
    }

    server.abort();
    if tokio::time::timeout(Duration::from_secs(90), sweeper.stop())
        .await
        .is_err()
    {
        warn!("Sweeper did not stop in time");
    }

    info!("tiercache shutdown complete");
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
// Metrics Server
// =============================================================================

async fn run_metrics_server(addr: &str, management: Arc<ManagementRegistry>) -> Result<()> {
    use http_body_util::Full;
    use hyper::body::Bytes;
    use hyper::header::{HeaderValue, CONTENT_TYPE};
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{Request, Response, StatusCode};
    use hyper_util::rt::TokioIo;
    use tokio::net::TcpListener;

    fn respond(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
        let mut response = Response::new(Full::new(body.into()));
        *response.status_mut() = status;
        response
    }

    async fn handle(
        req: Request<hyper::body::Incoming>,
        management: Arc<ManagementRegistry>,
    ) -> std::result::Result<Response<Full<Bytes>>, std::convert::Infallible> {
        let response = match req.uri().path() {
            "/metrics" => match management.render_prometheus() {
                Ok(text) => {
                    let mut response = respond(StatusCode::OK, text);
                    response.headers_mut().insert(
                        CONTENT_TYPE,
                        HeaderValue::from_static("text/plain; version=0.0.4"),
                    );
                    response
                }
                Err(e) => {
                    error!("Failed to render metrics: {}", e);
                    respond(StatusCode::INTERNAL_SERVER_ERROR, "metrics unavailable")
                }
            },
            "/healthz" | "/livez" | "/readyz" => respond(StatusCode::OK, "ok"),
            _ => respond(StatusCode::NOT_FOUND, "not found"),
        };
        Ok(response)
    }

    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| Error::Config(format!("Invalid metrics server address: {}", e)))?;

    let listener = TcpListener::bind(addr).await?;

    info!("Metrics server listening on {}", addr);

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let management = Arc::clone(&management);

        tokio::spawn(async move {
            let service = service_fn(move |req| handle(req, Arc::clone(&management)));
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                error!("Metrics server connection error: {}", e);
            }
        });
    }
}
