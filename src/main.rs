use clap::Parser;
use llm_gateway::chat::{ChatOrchestrator, SessionManager};
use llm_gateway::config::ConfigStore;
use llm_gateway::llm::Throttler;
use llm_gateway::server::{router, AppState};
use llm_gateway::tools::ToolRegistry;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "llm-gateway")]
#[command(author, version, about = "Multi-tenant gateway for heterogeneous LLM providers", long_about = None)]
struct Cli {
    /// Directory holding models.json, apps.json, platform.json and locales/
    #[arg(short, long, default_value = "contents/config")]
    config_dir: PathBuf,

    /// Address to bind the HTTP surface to
    #[arg(short, long, default_value = "127.0.0.1:8720")]
    listen: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let cli = Cli::parse();

    let config = Arc::new(ConfigStore::load(&cli.config_dir)?);
    log::info!(
        "loaded config from {} ({} models)",
        cli.config_dir.display(),
        config.models().count()
    );

    // One pooled client for every upstream; per-endpoint gating happens in
    // the throttler.
    let http = reqwest::Client::builder()
        .pool_idle_timeout(Duration::from_secs(90))
        .tcp_keepalive(Duration::from_secs(60))
        .connect_timeout(Duration::from_secs(30))
        .build()?;

    let mut throttler = Throttler::new(config.platform().upstream_concurrency);
    for model in config.models() {
        if let Some(limit) = model.concurrency {
            throttler = throttler.with_limit(model.url.clone(), limit);
        }
    }
    let throttler = Arc::new(throttler);

    let sessions = Arc::new(SessionManager::new());
    let orchestrator = Arc::new(ChatOrchestrator::new(
        config.clone(),
        ToolRegistry::new(),
        sessions.clone(),
        http,
        throttler,
    ));

    let state = AppState {
        config,
        sessions,
        orchestrator,
        workflows: None,
    };

    let listener = tokio::net::TcpListener::bind(&cli.listen).await?;
    log::info!("listening on {}", cli.listen);
    axum::serve(listener, router(state)).await?;
    Ok(())
}
