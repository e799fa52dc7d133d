//! The long-running indexer service.
//!
//! Wires the node client, the store and the sync engine together, runs the
//! catch-up cycle in a poll loop, and tears the node client down on SIGINT
//! or SIGTERM so in-flight pages resolve while new calls are rejected.

use crate::api::StatusServer;
use crate::config::Config;
use crate::error::{IndexerError, Result};
use crate::metrics::IndexerMetrics;
use crate::models::BlockHash;
use crate::rpc::RpcClient;
use crate::storage::{IndexerStore, PostgresStore};
use crate::sync::{ChainSyncEngine, SyncPlan};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::time::sleep;
use tracing::{error, info, warn};

pub struct Indexer {
    config: Config,
    client: Arc<RpcClient>,
    store: Arc<PostgresStore>,
    engine: ChainSyncEngine,
    metrics: Arc<IndexerMetrics>,
}

impl Indexer {
    pub async fn new(config: Config) -> Result<Self> {
        let store = Arc::new(PostgresStore::connect(&config.database_url).await?);
        store.run_migrations().await?;

        let client = Arc::new(RpcClient::new(&config.node)?);
        let engine = ChainSyncEngine::new(
            client.clone(),
            store.clone() as Arc<dyn IndexerStore>,
            config.sync.clone(),
        );
        Ok(Self {
            config,
            client,
            store,
            engine,
            metrics: Arc::new(IndexerMetrics::new()),
        })
    }

    pub fn metrics(&self) -> Arc<IndexerMetrics> {
        self.metrics.clone()
    }

    /// Run the catch-up loop until a shutdown signal arrives.
    pub async fn run(&self) -> Result<()> {
        let status = StatusServer::new(self.metrics.clone(), &self.config.api_bind);
        tokio::spawn(async move {
            if let Err(e) = status.run().await {
                error!("status server failed: {}", e);
            }
        });

        // The signal watcher flips the rejecting flag so the in-flight page
        // resolves (or fails with a shutdown error) instead of being
        // cancelled mid-request.
        let shutdown = Arc::new(Notify::new());
        let client = self.client.clone();
        let notify = shutdown.clone();
        tokio::spawn(async move {
            wait_for_shutdown_signal().await;
            client.shutdown();
            notify.notify_waiters();
        });

        loop {
            if self.client.is_rejecting() {
                break;
            }
            match self.sync_cycle().await {
                Ok(0) => {}
                Ok(count) => info!("cycle complete, {} blocks indexed", count),
                Err(IndexerError::Shutdown) => {
                    info!("sync interrupted by shutdown");
                    break;
                }
                Err(e) => error!("sync cycle failed: {}", e),
            }
            if self.client.is_rejecting() {
                break;
            }
            tokio::select! {
                _ = shutdown.notified() => break,
                _ = sleep(self.config.sync.poll_interval) => {}
            }
        }

        info!("indexer stopped");
        Ok(())
    }

    /// One catch-up pass: plan the gap to the head and drive its pages in
    /// order, persisting each page before fetching the next.
    async fn sync_cycle(&self) -> Result<u64> {
        self.metrics.set_syncing(true);
        let outcome = self.run_cycle_pages().await;
        self.metrics.set_syncing(false);
        outcome
    }

    async fn run_cycle_pages(&self) -> Result<u64> {
        let plan = self
            .engine
            .sync_from_last_indexed(self.config.sync.follow_fork)
            .await?;
        self.drive_pages(&plan).await
    }

    /// One-shot pass over the most recent `depth` levels, regardless of
    /// what the store already holds.
    pub async fn sync_latest_once(
        &self,
        depth: Option<i64>,
        start_hash: Option<BlockHash>,
    ) -> Result<u64> {
        let plan = self
            .engine
            .sync_latest(depth, start_hash, self.config.sync.follow_fork)
            .await?;
        if plan.is_empty() {
            warn!("nothing to sync");
        }
        self.drive_pages(&plan).await
    }

    /// Drive the plan's pages in order, persisting each page before
    /// fetching the next so database writes stay level-ordered.
    async fn drive_pages(&self, plan: &SyncPlan) -> Result<u64> {
        let mut indexed = 0u64;
        for (page_index, page) in plan.pages.iter().enumerate() {
            let results = self
                .engine
                .get_blocks(
                    plan.reference.clone(),
                    page.clone(),
                    plan.follow_fork_for(page_index),
                )
                .await?;
            self.store.write_results(&results).await?;
            self.metrics.record_page(&results);
            indexed += results.len() as u64;
        }
        Ok(indexed)
    }
}

/// Completes when a shutdown signal is received.
pub async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");

        tokio::select! {
            _ = sigint.recv() => {
                info!("received SIGINT, shutting down");
            }
            _ = sigterm.recv() => {
                info!("received SIGTERM, shutting down");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
        info!("received Ctrl+C, shutting down");
    }
}
