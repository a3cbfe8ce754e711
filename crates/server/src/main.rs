//! confab-server binary

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use confab_browse::{BrowseConfig, BrowseRuntime, BrowserTool, ReadImageTool};
use confab_core::llm::{ModelRegistry, PredictableService, PREDICTABLE_MODEL_ID};
use confab_core::store::MemoryStore;
use confab_core::tools::ToolRegistry;
use confab_server::coordinator::Coordinator;
use confab_server::handlers::AppState;
use confab_server::router;

const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful agent with access to a shared browser. \
Use the browser tool to look things up and interact with pages, and the read_image tool to \
inspect image files. Report what you find concisely.";

#[derive(Debug, Parser)]
#[command(name = "confab-server", about = "Multi-conversation agent server")]
struct Args {
    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1:7420")]
    listen: String,

    /// Model used when a request names none
    #[arg(long, default_value = PREDICTABLE_MODEL_ID)]
    default_model: String,

    /// Override the agent system prompt
    #[arg(long)]
    system_prompt: Option<String>,

    /// Minutes before an idle browser is shut down (0 uses the default)
    #[arg(long, default_value_t = 30)]
    browser_idle_minutes: u64,

    /// Minutes before an idle conversation manager is evicted
    #[arg(long, default_value_t = 30)]
    manager_idle_minutes: u64,

    /// Maximum pixel dimension for returned images (0 = unlimited)
    #[arg(long, default_value_t = 0)]
    max_image_dimension: u32,

    /// Directory for screenshots
    #[arg(long, default_value = "/tmp/confab-screenshots")]
    screenshot_dir: PathBuf,

    /// Directory for browser downloads
    #[arg(long, default_value = "/tmp/confab-downloads")]
    download_dir: PathBuf,

    /// Directory for spilled console logs and eval results
    #[arg(long, default_value = "/tmp/confab-console-logs")]
    console_logs_dir: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let store = Arc::new(MemoryStore::new());

    // Real model providers are wired here by deployment-specific setup;
    // the deterministic model is always available.
    let provider = Arc::new(ModelRegistry::new());
    provider.register(
        PREDICTABLE_MODEL_ID,
        "slug",
        Arc::new(PredictableService::new()),
    );

    let browse_config = BrowseConfig {
        screenshot_dir: args.screenshot_dir.clone(),
        download_dir: args.download_dir.clone(),
        console_logs_dir: args.console_logs_dir.clone(),
        idle_timeout: Duration::from_secs(args.browser_idle_minutes * 60),
        max_image_dimension: args.max_image_dimension,
    };
    let read_roots = Arc::new(vec![
        browse_config.screenshot_dir.clone(),
        browse_config.download_dir.clone(),
        browse_config.console_logs_dir.clone(),
    ]);
    let browse = Arc::new(BrowseRuntime::new(browse_config));

    let tools = Arc::new(ToolRegistry::new());
    tools.register(Arc::new(BrowserTool::new(browse.clone())));
    tools.register(Arc::new(ReadImageTool::new(browse.clone())));

    let coordinator = Coordinator::new(
        store,
        provider,
        tools,
        Some(
            args.system_prompt
                .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string()),
        ),
        args.default_model,
        Duration::from_secs(args.manager_idle_minutes * 60),
    );
    coordinator.spawn_eviction_loop();

    let app = router::build(AppState {
        coordinator,
        read_roots,
    });

    let listener = tokio::net::TcpListener::bind(&args.listen)
        .await
        .with_context(|| format!("failed to listen on {}", args.listen))?;
    tracing::info!(addr = %listener.local_addr()?, "server starting");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutting down");
        })
        .await
        .context("server failed")?;

    browse.close().await;
    tracing::info!("server exited");
    Ok(())
}
