use clap::Parser;
use ollama_openai_proxy::config::config_search_paths;
use ollama_openai_proxy::{build_router, AppState, ProxyConfig, SharedLogger};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(
    name = "ollama-openai-proxy",
    about = "OpenAI-compatible API in front of a local Ollama runtime",
    version
)]
struct Cli {
    /// Path to config file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Port to listen on (overrides config and PORT)
    #[arg(short, long)]
    port: Option<u16>,

    /// Ollama base URL (overrides config and OLLAMA_URL)
    #[arg(long)]
    backend_url: Option<String>,

    /// Default model for requests without one (overrides config and OLLAMA_MODEL)
    #[arg(long)]
    model: Option<String>,

    /// Serve /v1 without a bearer token when the API key variable is unset
    #[arg(long)]
    allow_unauthenticated: bool,

    /// Log file path
    #[arg(long, default_value = "ollama-openai-proxy.log")]
    log_file: PathBuf,

    /// Print config search paths and exit
    #[arg(long)]
    show_config_paths: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ollama_openai_proxy=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if cli.show_config_paths {
        println!("Config search paths:");
        for (i, path) in config_search_paths().iter().enumerate() {
            println!("  {}. {}", i + 1, path.display());
        }
        return Ok(());
    }

    let mut config = ProxyConfig::find_and_load(cli.config.as_deref())?;
    config.apply_env_overrides()?;

    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(url) = cli.backend_url {
        config.backend.base_url = url;
    }
    if let Some(model) = cli.model {
        config.backend.default_model = model;
    }
    if cli.allow_unauthenticated {
        config.auth.allow_unauthenticated = true;
    }

    let logger = SharedLogger::new(&cli.log_file)?;
    let api_key = config.resolve_api_key()?;

    info!("ollama-openai-proxy v{}", env!("CARGO_PKG_VERSION"));
    info!("  Ollama URL:     {}", config.backend.base_url);
    info!("  Default model:  {}", config.backend.default_model);
    info!("  Timeout:        {}s", config.backend.timeout_secs);
    info!("  Port:           {}", config.port);
    info!("  Log file:       {}", cli.log_file.display());
    if api_key.is_none() {
        warn!(
            "{} is not set: /v1 endpoints accept unauthenticated requests",
            config.auth.api_key_env
        );
    }

    logger.info(
        "startup",
        format!(
            "Starting ollama-openai-proxy backend={} port={}",
            config.backend.base_url, config.port
        ),
    );

    let port = config.port;
    let state = Arc::new(AppState::new(&config, api_key, logger)?);

    let app = build_router(state);
    let bind_addr = format!("0.0.0.0:{}", port);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;

    info!("Listening on http://{}", bind_addr);

    axum::serve(listener, app).await?;

    Ok(())
}
