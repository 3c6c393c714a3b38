//! Chatrelay CLI entry point.

use anyhow::Context as _;
use chatrelay::assemble::Assembler;
use chatrelay::attachments;
use chatrelay::config::Config;
use chatrelay::normalize::Normalizer;
use chatrelay::openai::OpenAiProvider;
use chatrelay::platform::ChatPlatform;
use chatrelay::reply::ReplyEngine;
use chatrelay::slack::{self, SlackPlatform};
use chatrelay::tools::mcp::RemoteToolRegistry;
use chatrelay::tools::{ToolEnvironment, ToolRegistry};
use chatrelay::trim::HeuristicTokenCounter;
use clap::Parser;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "chatrelay")]
#[command(about = "A Slack bot that relays conversations to a streaming LLM backend")]
struct Cli {
    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    tracing::info!("starting chatrelay");

    let config = Config::from_env().context("failed to load configuration from environment")?;

    let platform = Arc::new(
        SlackPlatform::new(config.slack.bot_token.clone())
            .context("failed to create slack client")?,
    );
    let identity = platform
        .resolve_identity()
        .await
        .context("failed to resolve the bot's slack identity")?;

    let provider = Arc::new(OpenAiProvider::new(
        config.model.api_base.clone(),
        config.model.api_key.clone(),
    ));

    let normalizer = Arc::new(
        Normalizer::new(&identity.user_id, &config.features, &config.redaction)
            .context("failed to compile text normalization patterns")?,
    );

    // Whether the token actually carries files:read is only knowable by
    // trying; a probe against a known-missing file would always 404, so file
    // access is trusted to the feature flags and download errors are handled
    // per file.
    let files_readable = config.features.image_file_access || config.features.pdf_file_access;
    if files_readable {
        tracing::info!(
            image = config.features.image_file_access,
            pdf = config.features.pdf_file_access,
            supported_images = ?attachments::SUPPORTED_IMAGE_MIME_TYPES,
            "file access enabled"
        );
    }

    let assembler = Arc::new(Assembler::new(
        Arc::clone(&platform) as Arc<dyn ChatPlatform>,
        Arc::clone(&normalizer),
        identity.clone(),
        config.features,
        files_readable,
        config.reply.system_text.clone(),
    ));

    let remote_tools = if config.tools.mcp_servers.is_empty() {
        None
    } else {
        let registry = Arc::new(RemoteToolRegistry::new(
            config.tools.mcp_servers.clone(),
            config.tools.mcp_bearer_token.clone(),
        ));
        registry.refresh().await;
        let _refresh_task = Arc::clone(&registry)
            .spawn_refresh_task(config.tools.mcp_refresh_interval);
        Some(registry)
    };
    let tools = Arc::new(ToolEnvironment::new(
        ToolRegistry::default(),
        remote_tools,
        config.model.model.clone(),
    ));

    let engine = Arc::new(ReplyEngine::new(
        Arc::clone(&platform) as Arc<dyn ChatPlatform>,
        provider,
        Arc::new(HeuristicTokenCounter),
        tools,
        assembler,
        normalizer,
        identity.clone(),
        config.model.clone(),
        config.reply.clone(),
        config.features.prompt_caching,
    ));

    tracing::info!(model = %config.model.model, "chatrelay started");
    slack::run_socket_mode(&config.slack.app_token, engine, &identity).await?;

    tracing::info!("chatrelay stopped");
    Ok(())
}
