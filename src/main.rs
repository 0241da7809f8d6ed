use clap::Parser;
use model_router::{build_router, AppState, RouterConfig, UpstreamClient};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(
    name = "model-router",
    about = "Protocol-translation proxy: Anthropic Messages in, OpenAI Chat Completions / Responses out",
    version
)]
struct Cli {
    /// Path to config file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Host to listen on (overrides config)
    #[arg(long)]
    host: Option<String>,

    /// Port to listen on (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Upstream base URL (overrides config)
    #[arg(long)]
    upstream: Option<String>,

    /// Upstream connect timeout in seconds (overrides config)
    #[arg(long)]
    connect_timeout: Option<u64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "model_router=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = match cli.config.as_deref() {
        Some(path) => RouterConfig::load(path)?,
        None => RouterConfig::default(),
    };

    if let Some(host) = cli.host {
        config.host = host;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(upstream) = cli.upstream {
        config.upstream_base_url = upstream;
    }
    if let Some(secs) = cli.connect_timeout {
        config.connect_timeout_secs = secs;
    }

    let upstream = UpstreamClient::new(
        &config.upstream_base_url,
        Duration::from_secs(config.connect_timeout_secs),
    )?;

    info!("model-router v{}", env!("CARGO_PKG_VERSION"));
    info!("  Upstream:  {}", config.upstream_base_url);
    if let Some(ref model) = config.default_model_override {
        info!("  Model:     {} (override)", model);
    }
    info!("  Listen:    {}", config.listen_addr());

    let bind_addr = config.listen_addr();
    let state = Arc::new(AppState { config, upstream });
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;

    info!("Listening on http://{}", bind_addr);
    info!("");
    info!("  To use with an Anthropic-API client:");
    info!("    ANTHROPIC_BASE_URL=http://{}", bind_addr);
    info!("");

    axum::serve(listener, app).await?;

    Ok(())
}
