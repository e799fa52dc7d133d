//! HTTP gateway to the remote node.
//!
//! The rest of the crate talks to the node exclusively through the
//! [`NodeGateway`] capability: two operations returning sanitized JSON
//! bodies. The concrete [`RpcClient`] adds the connection pool, per-call
//! timeouts and the rejecting flag used for graceful shutdown; nothing
//! above this module knows about any of that.

use crate::config::NodeConfig;
use crate::decoder;
use crate::error::{IndexerError, Result};
use crate::models::{
    Account, AccountId, BakerRolls, BallotCounts, BlockData, BlockHash, CurrentVotes, ManagerKey,
};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info};

/// Capability for issuing commands against `{base}/chains/main/`.
#[async_trait]
pub trait NodeGateway: Send + Sync {
    async fn get(&self, command: &str) -> Result<String>;
    async fn post(&self, command: &str, payload: Option<String>) -> Result<String>;
}

/// `blocks/{hash}`: address a block directly.
pub fn block_path(hash: &BlockHash) -> String {
    format!("blocks/{}", hash)
}

/// `blocks/{hash}~{offset}`: address the `offset`-th ancestor of a block.
/// An absent offset serializes as the empty string, so `blocks/H~` is a
/// valid path addressing the block itself.
pub fn block_offset_path(hash: &BlockHash, offset: Option<i64>) -> String {
    format!(
        "blocks/{}~{}",
        hash,
        offset.map(|k| k.to_string()).unwrap_or_default()
    )
}

/// reqwest-backed gateway with a global rejecting flag.
pub struct RpcClient {
    base_url: String,
    client: reqwest::Client,
    get_timeout: Duration,
    post_timeout: Duration,
    rejecting: AtomicBool,
}

impl RpcClient {
    pub fn new(config: &NodeConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| IndexerError::Connection(e.to_string()))?;
        Ok(Self {
            base_url: config.base_url(),
            client,
            get_timeout: config.get_timeout,
            post_timeout: config.post_timeout,
            rejecting: AtomicBool::new(false),
        })
    }

    /// Flip the rejecting flag. Every call issued after this returns
    /// [`IndexerError::Shutdown`] without touching the network; in-flight
    /// calls complete or time out naturally and the pooled connections are
    /// released as the client drops. Returns whether this call initiated
    /// the shutdown.
    pub fn shutdown(&self) -> bool {
        let initiated = !self.rejecting.swap(true, Ordering::SeqCst);
        if initiated {
            info!("node client shutting down, rejecting new calls");
        }
        initiated
    }

    pub fn is_rejecting(&self) -> bool {
        self.rejecting.load(Ordering::SeqCst)
    }

    fn url_for(&self, command: &str) -> String {
        format!("{}{}", self.base_url, command)
    }
}

#[async_trait]
impl NodeGateway for RpcClient {
    async fn get(&self, command: &str) -> Result<String> {
        if self.is_rejecting() {
            return Err(IndexerError::Shutdown);
        }
        debug!("GET {}", command);
        let response = self
            .client
            .get(self.url_for(command))
            .timeout(self.get_timeout)
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(IndexerError::NotFound(command.to_string()));
        }
        let response = response
            .error_for_status()
            .map_err(|e| IndexerError::Transport(e.to_string()))?;
        let body = response.text().await?;
        Ok(decoder::sanitize(&body))
    }

    async fn post(&self, command: &str, payload: Option<String>) -> Result<String> {
        if self.is_rejecting() {
            return Err(IndexerError::Shutdown);
        }
        debug!("POST {}", command);
        let mut request = self
            .client
            .post(self.url_for(command))
            .timeout(self.post_timeout)
            .header("Content-Type", "application/json");
        if let Some(body) = payload {
            request = request.body(body);
        }
        let response = request.send().await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(IndexerError::NotFound(command.to_string()));
        }
        let response = response
            .error_for_status()
            .map_err(|e| IndexerError::Transport(e.to_string()))?;
        let body = response.text().await?;
        Ok(decoder::sanitize(&body))
    }
}

/// Fetch and decode the block addressed by `hash` (or its `offset`-th
/// ancestor).
pub async fn get_block(
    gateway: &dyn NodeGateway,
    hash: &BlockHash,
    offset: Option<i64>,
) -> Result<BlockData> {
    let command = match offset {
        Some(_) => block_offset_path(hash, offset),
        None => block_path(hash),
    };
    decoder::decode_block(&gateway.get(&command).await?)
}

/// Fetch the current head of the canonical chain.
pub async fn get_block_head(gateway: &dyn NodeGateway) -> Result<BlockData> {
    get_block(gateway, &BlockHash::head(), None).await
}

/// Fetch the flattened operations of a block. Genesis exposes no such
/// sub-resource; the call is gated on the genesis predicate and a node 404
/// is also treated as an empty listing.
pub async fn get_operations(
    gateway: &dyn NodeGateway,
    block: &BlockData,
) -> Result<Vec<crate::models::OperationsGroup>> {
    if block.is_genesis() {
        return Ok(Vec::new());
    }
    match gateway.get(&format!("blocks/{}/operations", block.hash)).await {
        Ok(body) => decoder::decode_operations(&body),
        Err(IndexerError::NotFound(_)) => Ok(Vec::new()),
        Err(e) => Err(e),
    }
}

/// Fetch every account id known at a block. Genesis exposes no contracts
/// sub-resource; same gating as [`get_operations`].
pub async fn get_all_account_ids_for_block(
    gateway: &dyn NodeGateway,
    block: &BlockData,
) -> Result<Vec<AccountId>> {
    if block.is_genesis() {
        return Ok(Vec::new());
    }
    match gateway
        .get(&format!("blocks/{}/context/contracts", block.hash))
        .await
    {
        Ok(body) => decoder::decode_account_ids(&body),
        Err(IndexerError::NotFound(_)) => Ok(Vec::new()),
        Err(e) => Err(e),
    }
}

/// Fetch one account snapshot observed at `block`.
pub async fn get_account(
    gateway: &dyn NodeGateway,
    block: &BlockData,
    account_id: &AccountId,
) -> Result<Account> {
    let body = gateway
        .get(&format!(
            "blocks/{}/context/contracts/{}",
            block.hash, account_id
        ))
        .await?;
    decoder::decode_account(&body, account_id.clone(), block.hash.clone(), block.level())
}

/// Fetch the revealed manager key of an account, if any.
pub async fn get_manager_key(
    gateway: &dyn NodeGateway,
    block: &BlockData,
    account_id: &AccountId,
) -> Result<ManagerKey> {
    let body = gateway
        .get(&format!(
            "blocks/{}/context/contracts/{}/manager_key",
            block.hash, account_id
        ))
        .await?;
    decoder::decode_manager_key(&body)
}

/// Fetch the voting state observed at a block, combining the expected
/// quorum and the active proposal. Genesis has no voting state.
pub async fn get_current_votes(
    gateway: &dyn NodeGateway,
    block: &BlockData,
) -> Result<CurrentVotes> {
    if block.is_genesis() {
        return Ok(CurrentVotes::empty());
    }
    let quorum_cmd = format!(
        "{}/votes/current_quorum",
        block_offset_path(&block.hash, None)
    );
    let proposal_cmd = format!(
        "{}/votes/current_proposal",
        block_offset_path(&block.hash, None)
    );
    let (quorum_body, proposal_body) =
        tokio::try_join!(gateway.get(&quorum_cmd), gateway.get(&proposal_cmd))?;
    Ok(CurrentVotes {
        quorum: decoder::decode_current_quorum(&quorum_body)?,
        active_proposal: decoder::decode_current_proposal(&proposal_body)?,
    })
}

/// Fetch the ballot tallies of the voting period a block sits in.
pub async fn get_ballot_counts(
    gateway: &dyn NodeGateway,
    block: &BlockData,
) -> Result<BallotCounts> {
    let body = gateway
        .get(&format!("blocks/{}/votes/ballots", block.hash))
        .await?;
    decoder::decode_ballot_counts(&body)
}

/// Fetch the roll distribution of the voting period a block sits in.
pub async fn get_baker_rolls(
    gateway: &dyn NodeGateway,
    block: &BlockData,
) -> Result<Vec<BakerRolls>> {
    let body = gateway
        .get(&format!("blocks/{}/votes/listings", block.hash))
        .await?;
    decoder::decode_baker_rolls(&body)
}
