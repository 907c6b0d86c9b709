//! modelrelay - policy-driven routing across LLM providers
//!
//! Validates router configuration, lists providers, and sends one-off
//! prompts through the router from the command line.

use std::io::Write;

use anyhow::Context;
use clap::{Parser, Subcommand};
use futures::StreamExt;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use modelrelay::config::{Config, KeySource};
use modelrelay::{Message, ModelConfig, Router, Strategy};

#[derive(Parser)]
#[command(name = "modelrelay")]
#[command(about = "Policy-driven routing across LLM providers")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate configuration file
    Check {
        /// Path to configuration file
        #[arg(short, long, default_value = "modelrelay.toml")]
        config: String,
    },

    /// Show configured providers, capabilities and rates
    Providers {
        /// Path to configuration file
        #[arg(short, long, default_value = "modelrelay.toml")]
        config: String,
    },

    /// Send one prompt through the router
    Route {
        /// Path to configuration file
        #[arg(short, long, default_value = "modelrelay.toml")]
        config: String,

        /// Named policy from [policies.<name>]
        #[arg(short, long)]
        policy: Option<String>,

        /// Override the policy's strategy (e.g. cost-optimized, failover)
        #[arg(short, long)]
        strategy: Option<String>,

        /// System prompt
        #[arg(long)]
        system: Option<String>,

        /// Model name passed to the provider
        #[arg(short, long, default_value = "default")]
        model: String,

        /// Print chunks as they arrive
        #[arg(long)]
        stream: bool,

        /// Prompt text
        #[arg(required = true)]
        prompt: Vec<String>,
    },
}

impl Commands {
    fn config_path(&self) -> &str {
        match self {
            Commands::Check { config }
            | Commands::Providers { config }
            | Commands::Route { config, .. } => config,
        }
    }
}

fn init_tracing(level: &str) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("modelrelay={}", level).into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let path = cli.command.config_path().to_string();

    let loaded = Config::from_file_with_env(&path);
    let level = loaded
        .as_ref()
        .map(|(config, _)| config.logging.level.clone())
        .unwrap_or_else(|_| "info".to_string());
    init_tracing(&level);

    let (config, key_sources) =
        loaded.with_context(|| format!("Failed to load configuration from '{}'", path))?;

    match cli.command {
        Commands::Check { .. } => {
            println!("Configuration OK: {}", path);
            println!("  providers: {}", config.providers.len());
            println!("  named policies: {}", config.policies.len());
            for (name, source) in &key_sources {
                let marker = if *source == KeySource::None { "!" } else { " " };
                println!(" {} {:<24} key: {}", marker, name, source);
            }
            Ok(())
        }

        Commands::Providers { .. } => {
            if config.providers.is_empty() {
                println!("No providers configured");
                return Ok(());
            }
            println!(
                "{:<20} {:<10} {:>5} {:>10} {:>10} {:>10}  capabilities / models",
                "NAME", "KIND", "ORDER", "IN/1K", "OUT/1K", "FEE"
            );
            for p in &config.providers {
                let capabilities: Vec<&str> = p.capabilities.iter().map(|c| c.as_str()).collect();
                println!(
                    "{:<20} {:<10} {:>5} {:>10.4} {:>10.4} {:>10.4}  [{}] {}",
                    p.name,
                    p.kind.as_str(),
                    p.fallback_order,
                    p.input_rate,
                    p.output_rate,
                    p.base_fee,
                    capabilities.join(", "),
                    p.models.join(", ")
                );
            }
            Ok(())
        }

        Commands::Route {
            policy,
            strategy,
            system,
            model,
            stream,
            prompt,
            ..
        } => {
            let mut routing = config
                .policy(policy.as_deref())
                .cloned()
                .with_context(|| format!("Unknown policy '{}'", policy.unwrap_or_default()))?;
            if let Some(name) = strategy {
                let parsed = Strategy::parse(&name)
                    .with_context(|| format!("Unknown strategy '{}'", name))?;
                routing = routing.with_strategy(parsed);
            }

            let mut messages = Vec::new();
            if let Some(system) = system {
                messages.push(Message::system(system));
            }
            messages.push(Message::user(prompt.join(" ")));
            let model_config = ModelConfig::new(model);

            let router = Router::from_config(&config)?;

            if stream {
                let mut routed = router
                    .route_stream(&messages, &model_config, &routing)
                    .await?;
                tracing::info!(provider = %routed.provider, "Streaming");
                let mut stdout = std::io::stdout();
                while let Some(chunk) = routed.stream.next().await {
                    write!(stdout, "{}", chunk?)?;
                    stdout.flush()?;
                }
                writeln!(stdout)?;
            } else {
                let response = router.route(&messages, &model_config, &routing).await?;
                tracing::info!(
                    provider = %response.provider,
                    prompt_tokens = response.usage.prompt_tokens,
                    completion_tokens = response.usage.completion_tokens,
                    "Routed"
                );
                println!("{}", response.content);
            }
            Ok(())
        }
    }
}
