//! Chain synchronization engine and indexer for the Tezos network.
//!
//! The indexer follows a node's canonical chain over its HTTP interface,
//! assembles each block with its operations, touched accounts and voting
//! state, repairs forks against the locally indexed branch, rewrites
//! embedded Michelson into source text, and hands normalized records to a
//! relational store.

pub mod accounts;
pub mod api;
pub mod config;
pub mod decoder;
pub mod error;
pub mod fetcher;
pub mod fork;
pub mod indexer;
pub mod metrics;
pub mod michelson;
pub mod models;
pub mod pagination;
pub mod rpc;
pub mod storage;
pub mod sync;

#[cfg(test)]
pub(crate) mod test_support;

pub use config::Config;
pub use error::{IndexerError, Result};
pub use indexer::Indexer;
pub use metrics::IndexerMetrics;
pub use rpc::{NodeGateway, RpcClient};
pub use storage::{IndexerStore, PostgresStore};
pub use sync::{ChainSyncEngine, SyncPlan};
