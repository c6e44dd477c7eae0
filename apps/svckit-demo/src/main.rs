mod app;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use svckit::{ChannelBroker, LifecycleState, ServiceConfig, ServiceLifecycle};

const DEFAULT_NAME: &str = "demo";

/// svckit demo service - registers itself, consumes actions, serves HTTP
#[derive(Parser)]
#[command(name = "svckit-demo")]
#[command(about = "svckit demo service")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the service
    Runserver(RunArgs),
    /// Validate configuration, print it and exit
    Check,
}

#[derive(Args, Default)]
struct RunArgs {
    /// Host override (overrides config)
    #[arg(long)]
    host: Option<String>,

    /// Port override (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Force debug logging
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(path) = &cli.config
        && !path.is_file()
    {
        anyhow::bail!("config file does not exist: {}", path.display());
    }

    // defaults -> YAML (if provided) -> env (SVCKIT__*) -> CLI overrides
    let mut config = ServiceConfig::load(cli.config.as_deref())?;
    if config.name.trim().is_empty() {
        DEFAULT_NAME.clone_into(&mut config.name);
    }

    match cli.command.unwrap_or_else(|| Commands::Runserver(RunArgs::default())) {
        Commands::Runserver(args) => {
            apply_overrides(&mut config, &args);
            run_server(config).await
        }
        Commands::Check => check_config(&config),
    }
}

fn apply_overrides(config: &mut ServiceConfig, args: &RunArgs) {
    if let Some(host) = &args.host {
        config.host.clone_from(host);
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if args.debug {
        config.debug = true;
    }
}

fn check_config(config: &ServiceConfig) -> Result<()> {
    config.validate()?;
    println!("Configuration is valid");
    println!("{}", serde_json::to_string_pretty(config)?);
    Ok(())
}

async fn run_server(config: ServiceConfig) -> Result<()> {
    svckit::telemetry::init_logging(&config.logging, config.debug)
        .context("failed to initialize logging")?;

    let directory = svckit::directory::from_config(&config.directory)?;
    let broker = ChannelBroker::new(app::QUEUE_CAPACITY);
    let identity = app::Identity::default();

    let lifecycle = Arc::new(
        ServiceLifecycle::builder(config, directory)
            .with_action_handler(Arc::new(broker.clone()), Arc::new(app::action_handler()))
            .with_router(app::router(identity.clone(), broker.publisher()))
            .build()?,
    );

    // publish the instance identity once start got past registration
    tokio::spawn({
        let lifecycle = Arc::clone(&lifecycle);
        async move {
            let mut state = lifecycle.subscribe_state();
            let running = state.wait_for(|s| *s == LifecycleState::Running).await.is_ok();
            if running && let Some(descriptor) = lifecycle.descriptor() {
                identity.set(descriptor.clone());
            }
        }
    });

    tracing::info!("svckit demo starting");
    lifecycle.start().await?;
    tracing::info!("svckit demo exited");
    Ok(())
}
