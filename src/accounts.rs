//! Extraction of the account ids touched by a block action.

use crate::error::Result;
use crate::models::{AccountId, BlockAction, BlockFetchingResults};
use crate::rpc::{self, NodeGateway};
use std::sync::Arc;

/// Pairs block actions with the account ids the persistence layer should
/// refresh for them. Revalidated blocks were indexed before, so their
/// accounts already exist and no call is made.
pub struct AccountReferenceExtractor {
    gateway: Arc<dyn NodeGateway>,
}

impl AccountReferenceExtractor {
    pub fn new(gateway: Arc<dyn NodeGateway>) -> Self {
        Self { gateway }
    }

    pub async fn extract(&self, action: &BlockAction) -> Result<Vec<AccountId>> {
        match action {
            BlockAction::RevalidateBlock(_) => Ok(Vec::new()),
            BlockAction::WriteBlock(block) | BlockAction::WriteAndMakeValidBlock(block) => {
                rpc::get_all_account_ids_for_block(self.gateway.as_ref(), &block.data).await
            }
        }
    }

    pub async fn extract_all(&self, actions: Vec<BlockAction>) -> Result<BlockFetchingResults> {
        let mut results = Vec::with_capacity(actions.len());
        for action in actions {
            let ids = self.extract(&action).await?;
            results.push((action, ids));
        }
        Ok(results)
    }
}
