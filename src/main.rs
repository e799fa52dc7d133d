//! Tezos indexer service entry point

use tezos_indexer::{Config, Indexer};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "tezos_indexer=info".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Parse CLI arguments
    let args: Vec<String> = std::env::args().collect();
    let mode = if args.len() > 1 { &args[1] } else { "live" };

    // Load configuration
    let config = Config::from_env();
    config.validate()?;

    info!("Configuration:");
    info!("  Node:     {}", config.node.base_url());
    info!(
        "  Database: {}",
        config.database_url.split('@').last().unwrap_or("***")
    );
    info!("  Status:   {}", config.api_bind);
    info!("  Mode:     {}", mode);

    match mode {
        "sync-latest" => {
            // One-shot mode: re-index the most recent levels and exit.
            let depth: Option<i64> = args.get(2).and_then(|s| s.parse().ok());
            info!("sync-latest mode: depth {:?}", depth);

            let indexer = Indexer::new(config).await?;
            let indexed = indexer.sync_latest_once(depth, None).await?;
            info!("done, {} blocks indexed", indexed);
        }
        _ => {
            // Live mode: poll the head and catch up until terminated.
            let indexer = Indexer::new(config).await?;
            info!("starting indexer in live mode");
            indexer.run().await?;
        }
    }

    Ok(())
}
