//! Duplex CLI entry point

mod cli;

use crate::cli::{Cli, Commands};
use anyhow::{Context, Result};
use clap::Parser;
use duplex_client::{DuplexApi, DuplexClient, DuplexConfig, MatchKey, Subscription};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    let default_level = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = build_config(&cli)?;

    match cli.command {
        Commands::Request { payload } => request(config, payload).await,
        Commands::Call { endpoint, body, role } => call(config.role(role), endpoint, body).await,
        Commands::Watch { topic, pattern } => watch(config, topic, pattern).await,
    }
}

fn build_config(cli: &Cli) -> Result<DuplexConfig> {
    let url = cli
        .url
        .clone()
        .context("--url or DUPLEX_URL is required")?;

    let mut config = DuplexConfig::new(url).debug(cli.debug);
    if let Some(identity) = &cli.identity {
        config = config.identity(identity.clone());
    }
    if let Some(delay) = cli.reconnect_delay {
        config = config.reconnect_delay(delay);
    }
    if let Some(limit) = cli.timeout {
        config = config.request_timeout(limit);
    }
    Ok(config)
}

async fn request(config: DuplexConfig, payload: serde_json::Value) -> Result<()> {
    let client = DuplexClient::connect(config)
        .await
        .context("Failed to connect")?;

    let response = client.request(payload).await.context("Request failed")?;
    println!("{}", serde_json::to_string_pretty(&response)?);

    client.dispose();
    Ok(())
}

async fn call(config: DuplexConfig, endpoint: String, body: serde_json::Value) -> Result<()> {
    let client = DuplexClient::connect(config)
        .await
        .context("Failed to connect")?;

    let response = client
        .call(&endpoint, body)
        .await
        .with_context(|| format!("Call to {} failed", endpoint))?;
    println!("{}", serde_json::to_string_pretty(&response)?);

    client.dispose();
    Ok(())
}

async fn watch(config: DuplexConfig, topics: Vec<String>, patterns: Vec<String>) -> Result<()> {
    let client = DuplexClient::connect_lazy(config).await?;

    let print = |body: &serde_json::Value| println!("{}", body);

    let mut subscriptions: Vec<Subscription> = topics
        .into_iter()
        .map(|topic| client.subscribe(topic, print))
        .collect();

    for pattern in &patterns {
        let key = MatchKey::pattern(pattern)
            .with_context(|| format!("Invalid pattern: {}", pattern))?;
        subscriptions.push(client.subscribe(key, print));
    }

    // Nothing given: everything with a `type` or `path`
    if subscriptions.is_empty() {
        subscriptions.push(client.subscribe(MatchKey::pattern(".*")?, print));
    }

    info!(count = subscriptions.len(), url = %client.connection().url(), "Watching");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    for sub in &subscriptions {
        sub.stop();
    }
    client.dispose();
    Ok(())
}
