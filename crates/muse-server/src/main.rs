//! muse - conversational portfolio assistant server

mod config;
mod routes;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use muse_agent::{
    CorpusRetriever, Engine, JsonFileQuotaStore, ProgressStreamer, ProviderJudgment, QuotaGate,
    Retriever,
};
use muse_ai::providers::{LlmProvider, openai::OpenAIProvider};

/// muse - conversational portfolio assistant
#[derive(Parser, Debug)]
#[command(name = "muse")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Config file (default: $MUSE_CONFIG_PATH or ~/.config/muse/config.toml)
    #[arg(short, long)]
    config: Option<std::path::PathBuf>,

    /// Address to listen on, overriding the config file
    #[arg(short, long)]
    bind: Option<String>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Initialize config file
    #[arg(long)]
    init_config: bool,
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "muse=debug" } else { "muse=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn build_retriever(cfg: &config::Config) -> anyhow::Result<Arc<dyn Retriever>> {
    match &cfg.retrieval.corpus_dir {
        Some(dir) => {
            let retriever = CorpusRetriever::load(dir, &cfg.chunk_config())
                .with_context(|| format!("loading corpus from {}", dir.display()))?;
            Ok(Arc::new(retriever))
        }
        None => {
            tracing::warn!("no corpus_dir configured, every technical question will fall back");
            Ok(Arc::new(CorpusRetriever::from_documents(
                Vec::new(),
                &cfg.chunk_config(),
            )))
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    let config_path = args.config.clone().unwrap_or_else(config::Config::config_path);

    // Initialize config and exit
    if args.init_config {
        config::Config::init(&config_path)
            .with_context(|| format!("creating {}", config_path.display()))?;
        println!("Config file at: {}", config_path.display());
        println!("\nExample config:\n{}", config::example_config());
        return Ok(());
    }

    let cfg = config::Config::load_from(&config_path);
    let provider = cfg.provider()?;

    let llm: Arc<dyn LlmProvider> = match cfg.api_key(provider) {
        Some(key) => Arc::new(OpenAIProvider::new(key)),
        None => match provider.api_key_env_var() {
            Some(var) => anyhow::bail!(
                "no API key for {}: set {} or llm.api_key in the config file",
                provider.name(),
                var
            ),
            None => Arc::new(OpenAIProvider::anonymous()),
        },
    };

    let judgment = ProviderJudgment::new(llm, cfg.registry(provider))
        .with_timeout(Duration::from_secs(cfg.llm.request_timeout_secs))
        .with_retry_config(cfg.retry_config());

    let engine = Arc::new(Engine::new(
        Arc::new(judgment),
        build_retriever(&cfg)?,
        cfg.engine_config(),
    ));

    let mut quota = QuotaGate::daily(cfg.quota.daily_limit);
    if let Some(path) = &cfg.quota.state_file {
        quota = quota.with_store(Arc::new(JsonFileQuotaStore::new(path)));
    }
    let quota = Arc::new(quota);

    let state = routes::AppState {
        streamer: ProgressStreamer::new(engine, quota.clone()),
        quota,
        provider: provider.name().to_string(),
        padding_bytes: cfg.server.padding_bytes,
    };
    let app = routes::create_router(state, &cfg.server.cors_origins);

    let bind = args.bind.unwrap_or_else(|| cfg.server.bind.clone());
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("binding {bind}"))?;
    tracing::info!(
        %bind,
        provider = provider.name(),
        native_language = %cfg.native_language,
        daily_limit = cfg.quota.daily_limit,
        "muse listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutting down");
        })
        .await?;
    Ok(())
}
