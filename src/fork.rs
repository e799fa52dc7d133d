//! Fork detection and repair.
//!
//! When the node's block at the locally indexed head level no longer
//! matches what was stored, the local branch has been orphaned. The
//! follower walks backward from the disagreeing block, deciding per
//! ancestor whether it is new to the store, stored-but-invalidated, or the
//! first still-valid ancestor where the walk can stop. After a run, every
//! covered level holds the block the node currently reports there, with
//! its invalidated flag cleared.

use crate::error::{IndexerError, Result};
use crate::michelson;
use crate::models::{Block, BlockAction, BlockData, BlockHash};
use crate::rpc::{self, NodeGateway};
use crate::storage::IndexerStore;
use std::sync::Arc;
use tracing::{error, info, warn};

pub struct ForkFollower {
    gateway: Arc<dyn NodeGateway>,
    store: Arc<dyn IndexerStore>,
}

impl ForkFollower {
    pub fn new(gateway: Arc<dyn NodeGateway>, store: Arc<dyn IndexerStore>) -> Self {
        Self { gateway, store }
    }

    /// Check the node's block at `max_offset` below `reference` against the
    /// stored head and, on hash disagreement, repair the forked range.
    ///
    /// The returned actions are reverse-chronological: the disagreeing
    /// block first, deeper ancestors after it. Empty when the chains agree.
    pub async fn follow(
        &self,
        reference: &BlockHash,
        max_offset: i64,
    ) -> Result<Vec<BlockAction>> {
        let fork_top = rpc::get_block(self.gateway.as_ref(), reference, Some(max_offset)).await?;

        match self.store.fetch_latest_block().await? {
            None => {
                warn!(
                    "no locally stored head to compare against, walking from level {}",
                    fork_top.level()
                );
            }
            Some(stored) => {
                if stored.level != fork_top.level() {
                    return Err(IndexerError::ForkInconsistency(format!(
                        "stored head level {} does not match node level {} at offset {}",
                        stored.level,
                        fork_top.level(),
                        max_offset
                    )));
                }
                if stored.hash == fork_top.hash {
                    return Ok(Vec::new());
                }
                info!(
                    "fork detected at level {}: stored {} vs node {}",
                    stored.level, stored.hash, fork_top.hash
                );
            }
        }

        let fork_top_hash = fork_top.hash.clone();
        let mut actions = vec![BlockAction::WriteAndMakeValidBlock(
            self.assemble(fork_top).await?,
        )];

        for offset in 1.. {
            let data =
                rpc::get_block(self.gateway.as_ref(), &fork_top_hash, Some(offset)).await?;
            let exists = self.store.block_exists(&data.hash).await?;
            let invalidated = self.store.block_is_invalidated(&data.hash).await?;
            let at_genesis = data.is_genesis();

            match (exists, invalidated) {
                // Reached a stored ancestor that is still valid: the chains
                // agree from here down.
                (true, false) => break,
                (true, true) => {
                    actions.push(BlockAction::RevalidateBlock(self.assemble(data).await?));
                }
                (false, false) => {
                    actions.push(BlockAction::WriteAndMakeValidBlock(
                        self.assemble(data).await?,
                    ));
                }
                (false, true) => {
                    error!(
                        "block {} is absent from the store yet marked invalidated",
                        data.hash
                    );
                    return Err(IndexerError::ImpossibleState(format!(
                        "block {} absent but invalidated",
                        data.hash
                    )));
                }
            }

            // There is nothing below genesis to walk to.
            if at_genesis {
                break;
            }
        }

        Ok(actions)
    }

    async fn assemble(&self, data: BlockData) -> Result<Block> {
        let operations = rpc::get_operations(self.gateway.as_ref(), &data).await?;
        let votes = rpc::get_current_votes(self.gateway.as_ref(), &data).await?;
        Ok(michelson::transform_block(Block {
            data,
            operations,
            votes,
        }))
    }
}
