//! Chain synchronization engine.
//!
//! Each cycle reconciles the highest indexed level with the node's head,
//! partitions the gap into pages and, per page, joins three concurrent
//! batch fetches (block data by offset, operations with touched accounts,
//! voting state) into an ordered list of write actions for the store. The
//! first page of a cycle optionally checks the stored head for a fork and
//! appends the repair actions.

use crate::accounts::AccountReferenceExtractor;
use crate::config::SyncConfig;
use crate::decoder;
use crate::error::{IndexerError, Result};
use crate::fetcher::{fetch_all, fetch_merged, Fetch};
use crate::fork::ForkFollower;
use crate::michelson;
use crate::models::{
    Account, AccountId, BakingRights, Block, BlockAction, BlockData, BlockFetchingResults,
    BlockHash, CurrentVotes, EndorsingRights, OperationsGroup,
};
use crate::pagination::partition_ranges;
use crate::rpc::{self, NodeGateway};
use crate::storage::IndexerStore;
use std::collections::HashMap;
use std::ops::RangeInclusive;
use std::sync::Arc;
use tracing::info;

/// The work laid out for one sync cycle: the reference the offsets are
/// computed against, the pages to drive in order, and the number of levels
/// the cycle will index.
#[derive(Debug, Clone)]
pub struct SyncPlan {
    pub reference: (BlockHash, i64),
    pub pages: Vec<RangeInclusive<i64>>,
    pub follow_fork: bool,
    pub total: i64,
}

impl SyncPlan {
    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// Fork detection runs against the boundary with previously stored
    /// data, so only the first page of a cycle carries it.
    pub fn follow_fork_for(&self, page_index: usize) -> bool {
        self.follow_fork && page_index == 0
    }
}

/// Fetches block data by offset from a fixed reference block. Historical
/// blocks are only addressable this way: the node resolves `H~k`, not
/// absolute levels.
struct BlockFetcher {
    reference: BlockHash,
}

impl Fetch for BlockFetcher {
    type Input = i64;
    type Output = BlockData;

    fn command(&self, offset: &i64) -> String {
        rpc::block_offset_path(&self.reference, Some(*offset))
    }

    fn decode(&self, _offset: &i64, body: &str) -> Result<BlockData> {
        decoder::decode_block(body)
    }
}

struct OperationsFetcher;

impl Fetch for OperationsFetcher {
    type Input = BlockHash;
    type Output = Vec<OperationsGroup>;

    fn command(&self, hash: &BlockHash) -> String {
        format!("blocks/{}/operations", hash)
    }

    fn decode(&self, _hash: &BlockHash, body: &str) -> Result<Vec<OperationsGroup>> {
        decoder::decode_operations(body)
    }
}

struct AccountIdsFetcher;

impl Fetch for AccountIdsFetcher {
    type Input = BlockHash;
    type Output = Vec<AccountId>;

    fn command(&self, hash: &BlockHash) -> String {
        format!("blocks/{}/context/contracts", hash)
    }

    fn decode(&self, _hash: &BlockHash, body: &str) -> Result<Vec<AccountId>> {
        decoder::decode_account_ids(body)
    }
}

struct QuorumFetcher;

impl Fetch for QuorumFetcher {
    type Input = BlockHash;
    type Output = Option<i32>;

    fn command(&self, hash: &BlockHash) -> String {
        format!("{}/votes/current_quorum", rpc::block_offset_path(hash, None))
    }

    fn decode(&self, _hash: &BlockHash, body: &str) -> Result<Option<i32>> {
        decoder::decode_current_quorum(body)
    }
}

struct ProposalFetcher;

impl Fetch for ProposalFetcher {
    type Input = BlockHash;
    type Output = Option<crate::models::ProtocolId>;

    fn command(&self, hash: &BlockHash) -> String {
        format!(
            "{}/votes/current_proposal",
            rpc::block_offset_path(hash, None)
        )
    }

    fn decode(&self, _hash: &BlockHash, body: &str) -> Result<Option<crate::models::ProtocolId>> {
        decoder::decode_current_proposal(body)
    }
}

/// Fetches account snapshots as observed at a fixed block.
struct AccountFetcher {
    block: BlockData,
}

impl Fetch for AccountFetcher {
    type Input = AccountId;
    type Output = Account;

    fn command(&self, id: &AccountId) -> String {
        format!("blocks/{}/context/contracts/{}", self.block.hash, id)
    }

    fn decode(&self, id: &AccountId, body: &str) -> Result<Account> {
        decoder::decode_account(body, id.clone(), self.block.hash.clone(), self.block.level())
    }
}

struct BakingRightsFetcher;

impl Fetch for BakingRightsFetcher {
    type Input = BlockHash;
    type Output = Vec<BakingRights>;

    fn command(&self, hash: &BlockHash) -> String {
        format!("blocks/{}/helpers/baking_rights", hash)
    }

    fn decode(&self, _hash: &BlockHash, body: &str) -> Result<Vec<BakingRights>> {
        decoder::decode_baking_rights(body)
    }
}

struct EndorsingRightsFetcher;

impl Fetch for EndorsingRightsFetcher {
    type Input = BlockHash;
    type Output = Vec<EndorsingRights>;

    fn command(&self, hash: &BlockHash) -> String {
        format!("blocks/{}/helpers/endorsing_rights", hash)
    }

    fn decode(&self, _hash: &BlockHash, body: &str) -> Result<Vec<EndorsingRights>> {
        decoder::decode_endorsing_rights(body)
    }
}

pub struct ChainSyncEngine {
    gateway: Arc<dyn NodeGateway>,
    store: Arc<dyn IndexerStore>,
    config: SyncConfig,
}

impl ChainSyncEngine {
    pub fn new(
        gateway: Arc<dyn NodeGateway>,
        store: Arc<dyn IndexerStore>,
        config: SyncConfig,
    ) -> Self {
        Self {
            gateway,
            store,
            config,
        }
    }

    /// Plan a cycle covering everything between the highest indexed level
    /// and the node's head. Empty when the store is already caught up.
    pub async fn sync_from_last_indexed(&self, follow_fork: bool) -> Result<SyncPlan> {
        let stored_max = self.store.fetch_max_level().await?;
        let head = rpc::get_block_head(self.gateway.as_ref()).await?;
        let head_level = head.level();
        let reference = (head.hash, head_level);

        if stored_max >= head_level {
            return Ok(SyncPlan {
                reference,
                pages: Vec::new(),
                follow_fork,
                total: 0,
            });
        }

        let bootstrapping = stored_max < 0;
        let start = if bootstrapping { 1 } else { stored_max + 1 };
        let pages = partition_ranges(self.config.block_page_size, start..=head_level);
        let total = head_level - stored_max.max(0);
        info!(
            "syncing levels {}..={} ({} blocks in {} pages)",
            start,
            head_level,
            total,
            pages.len()
        );
        Ok(SyncPlan {
            reference,
            pages,
            follow_fork,
            total,
        })
    }

    /// Plan a cycle over the most recent `depth` levels (everything when
    /// absent), optionally anchored at `start_hash` instead of the head.
    pub async fn sync_latest(
        &self,
        depth: Option<i64>,
        start_hash: Option<BlockHash>,
        follow_fork: bool,
    ) -> Result<SyncPlan> {
        let reference_block = match start_hash {
            Some(hash) => rpc::get_block(self.gateway.as_ref(), &hash, None).await?,
            None => rpc::get_block_head(self.gateway.as_ref()).await?,
        };
        let head_level = reference_block.level();
        let reference = (reference_block.hash, head_level);

        let start = match depth {
            Some(d) => (head_level - d + 1).max(1),
            None => 1,
        };
        if head_level < start {
            return Ok(SyncPlan {
                reference,
                pages: Vec::new(),
                follow_fork,
                total: 0,
            });
        }
        let pages = partition_ranges(self.config.block_page_size, start..=head_level);
        let total = head_level - start + 1;
        Ok(SyncPlan {
            reference,
            pages,
            follow_fork,
            total,
        })
    }

    /// Fetch and assemble one page of blocks, ordered by level ascending,
    /// with the fork repair appended when requested.
    pub async fn get_blocks(
        &self,
        reference: (BlockHash, i64),
        levels: RangeInclusive<i64>,
        follow_fork: bool,
    ) -> Result<BlockFetchingResults> {
        let (ref_hash, ref_level) = reference;
        assert!(
            *levels.start() >= 0 && *levels.end() <= ref_level,
            "level range {:?} outside of reference level {}",
            levels,
            ref_level
        );

        let offsets: Vec<i64> = levels.clone().map(|lvl| ref_level - lvl).collect();
        let block_fetcher = BlockFetcher {
            reference: ref_hash.clone(),
        };
        let blocks = fetch_all(
            self.gateway.as_ref(),
            &block_fetcher,
            &offsets,
            self.config.block_operations_concurrency,
        )
        .await?;

        let hashes: Vec<BlockHash> = blocks
            .iter()
            .filter(|(_, data)| !data.is_genesis())
            .map(|(_, data)| data.hash.clone())
            .collect();

        let (ops_and_ids, votes) = tokio::try_join!(
            fetch_merged(
                self.gateway.as_ref(),
                &OperationsFetcher,
                &AccountIdsFetcher,
                |operations, ids| (operations, ids),
                &hashes,
                self.config.block_operations_concurrency,
            ),
            fetch_merged(
                self.gateway.as_ref(),
                &QuorumFetcher,
                &ProposalFetcher,
                |quorum, active_proposal| CurrentVotes {
                    quorum,
                    active_proposal,
                },
                &hashes,
                self.config.block_operations_concurrency,
            )
        )?;
        let mut ops_by_hash: HashMap<BlockHash, (Vec<OperationsGroup>, Vec<AccountId>)> =
            ops_and_ids.into_iter().collect();
        let mut votes_by_hash: HashMap<BlockHash, CurrentVotes> = votes.into_iter().collect();

        let mut results: BlockFetchingResults = Vec::with_capacity(blocks.len());
        for (_, data) in blocks {
            let (operations, account_ids, votes) = if data.is_genesis() {
                (Vec::new(), Vec::new(), CurrentVotes::empty())
            } else {
                let (operations, account_ids) = ops_by_hash.remove(&data.hash).ok_or_else(|| {
                    IndexerError::Decode(format!("no operations fetched for block {}", data.hash))
                })?;
                let votes = votes_by_hash.remove(&data.hash).ok_or_else(|| {
                    IndexerError::Decode(format!("no votes fetched for block {}", data.hash))
                })?;
                (operations, account_ids, votes)
            };
            let block = michelson::transform_block(Block {
                data,
                operations,
                votes,
            });
            results.push((BlockAction::WriteBlock(block), account_ids));
        }

        if follow_fork && *levels.start() > 0 {
            let max_offset = *levels.end() - *levels.start() + 1;
            let follower = ForkFollower::new(self.gateway.clone(), self.store.clone());
            let fork_actions = follower.follow(&ref_hash, max_offset).await?;
            if !fork_actions.is_empty() {
                info!("fork repair produced {} actions", fork_actions.len());
            }
            let extractor = AccountReferenceExtractor::new(self.gateway.clone());
            results.extend(extractor.extract_all(fork_actions).await?);
        }

        Ok(results)
    }

    /// Batch-fetch the accounts observed at `block`, scripts rewritten to
    /// Michelson source. Ids are chunked by the page size; within a chunk
    /// at most `account_concurrency` calls are in flight.
    pub async fn get_accounts_for_block(
        &self,
        block: &BlockData,
        ids: &[AccountId],
    ) -> Result<Vec<Account>> {
        let fetcher = AccountFetcher {
            block: block.clone(),
        };
        let mut accounts = Vec::with_capacity(ids.len());
        for chunk in ids.chunks(self.config.block_page_size.max(1) as usize) {
            let fetched = fetch_all(
                self.gateway.as_ref(),
                &fetcher,
                chunk,
                self.config.account_concurrency,
            )
            .await?;
            accounts.extend(
                fetched
                    .into_iter()
                    .map(|(_, account)| michelson::transform_account(account)),
            );
        }
        Ok(accounts)
    }

    /// Batch-fetch the baking rights recorded at each of the given blocks.
    pub async fn get_baking_rights(
        &self,
        hashes: &[BlockHash],
    ) -> Result<Vec<(BlockHash, Vec<BakingRights>)>> {
        fetch_all(
            self.gateway.as_ref(),
            &BakingRightsFetcher,
            hashes,
            self.config.block_operations_concurrency,
        )
        .await
    }

    /// Batch-fetch the endorsing rights recorded at each of the given blocks.
    pub async fn get_endorsing_rights(
        &self,
        hashes: &[BlockHash],
    ) -> Result<Vec<(BlockHash, Vec<EndorsingRights>)>> {
        fetch_all(
            self.gateway.as_ref(),
            &EndorsingRightsFetcher,
            hashes,
            self.config.block_operations_concurrency,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::BlockReference;
    use crate::test_support::{stage_block, test_sync_config, MockNode, MockStore};

    fn engine(node: Arc<MockNode>, store: Arc<MockStore>) -> ChainSyncEngine {
        ChainSyncEngine::new(node, store, test_sync_config())
    }

    fn engine_with_page_size(
        node: Arc<MockNode>,
        store: Arc<MockStore>,
        page_size: i64,
    ) -> ChainSyncEngine {
        let mut config = test_sync_config();
        config.block_page_size = page_size;
        ChainSyncEngine::new(node, store, config)
    }

    /// Stage a simple chain `BL1..BLn` with head `BLn`, addressable both
    /// directly and by offset from the head.
    fn stage_chain(node: &MockNode, head_level: i64) {
        let hash_at = |lvl: i64| format!("BL{}", lvl);
        stage_block(
            node,
            "blocks/head",
            head_level,
            &hash_at(head_level),
            &hash_at(head_level - 1),
        );
        for lvl in 0..=head_level {
            let predecessor = if lvl == 0 { hash_at(0) } else { hash_at(lvl - 1) };
            stage_block(
                node,
                &format!("blocks/{}~{}", hash_at(head_level), head_level - lvl),
                lvl,
                &hash_at(lvl),
                &predecessor,
            );
        }
    }

    #[tokio::test]
    async fn test_bootstrapping_plan_covers_one_through_head() {
        let node = Arc::new(MockNode::new());
        stage_chain(&node, 3);
        let store = Arc::new(MockStore::new());
        let engine = engine(node, store);

        let plan = engine.sync_from_last_indexed(false).await.unwrap();
        assert_eq!(plan.total, 3);
        assert_eq!(plan.pages, vec![1..=3]);

        let results = engine
            .get_blocks(plan.reference.clone(), plan.pages[0].clone(), false)
            .await
            .unwrap();
        let levels: Vec<i64> = results.iter().map(|(a, _)| a.level()).collect();
        assert_eq!(levels, vec![1, 2, 3]);
        assert!(results
            .iter()
            .all(|(a, _)| matches!(a, BlockAction::WriteBlock(_))));
    }

    #[tokio::test]
    async fn test_nominal_catch_up_is_paged() {
        let node = Arc::new(MockNode::new());
        stage_chain(&node, 103);
        let store = Arc::new(MockStore::new());
        store.set_max_level(100);
        let engine = engine_with_page_size(node, store, 2);

        let plan = engine.sync_from_last_indexed(false).await.unwrap();
        assert_eq!(plan.total, 3);
        assert_eq!(plan.pages, vec![101..=102, 103..=103]);

        let mut levels = Vec::new();
        for page in &plan.pages {
            let results = engine
                .get_blocks(plan.reference.clone(), page.clone(), false)
                .await
                .unwrap();
            levels.extend(results.iter().map(|(a, _)| a.level()));
        }
        assert_eq!(levels, vec![101, 102, 103]);
    }

    #[tokio::test]
    async fn test_caught_up_store_plans_no_work() {
        let node = Arc::new(MockNode::new());
        stage_chain(&node, 500);
        let store = Arc::new(MockStore::new());
        store.set_max_level(500);
        let engine = engine(node, store);

        let plan = engine.sync_from_last_indexed(true).await.unwrap();
        assert!(plan.is_empty());
        assert_eq!(plan.total, 0);
    }

    #[tokio::test]
    async fn test_sync_latest_bounded_by_depth() {
        let node = Arc::new(MockNode::new());
        stage_chain(&node, 10);
        let store = Arc::new(MockStore::new());
        let engine = engine(node, store);

        let plan = engine.sync_latest(Some(4), None, false).await.unwrap();
        assert_eq!(plan.pages, vec![7..=10]);
        assert_eq!(plan.total, 4);

        // Depth past genesis clamps to level 1.
        let plan = engine.sync_latest(Some(100), None, false).await.unwrap();
        assert_eq!(plan.pages, vec![1..=10]);
        assert_eq!(plan.total, 10);
    }

    #[tokio::test]
    async fn test_get_blocks_substitutes_genesis_sub_resources() {
        let node = Arc::new(MockNode::new());
        stage_chain(&node, 3);
        // Remove everything staged under the genesis hash so any attempt to
        // fetch its sub-resources would error out.
        node.unstage("blocks/BL0/operations");
        node.unstage("blocks/BL0/context/contracts");
        node.unstage("blocks/BL0~/votes/current_quorum");
        node.unstage("blocks/BL0~/votes/current_proposal");
        let store = Arc::new(MockStore::new());
        let engine = engine(node.clone(), store);

        let results = engine
            .get_blocks((BlockHash("BL3".into()), 3), 0..=3, false)
            .await
            .unwrap();
        assert_eq!(results.len(), 4);
        let (genesis_action, genesis_ids) = &results[0];
        assert_eq!(genesis_action.level(), 0);
        assert!(genesis_action.block().operations.is_empty());
        assert_eq!(genesis_action.block().votes, CurrentVotes::empty());
        assert!(genesis_ids.is_empty());
        assert!(!node
            .calls()
            .iter()
            .any(|c| c.starts_with("blocks/BL0/") || c.starts_with("blocks/BL0~/")));
    }

    #[tokio::test]
    async fn test_get_blocks_appends_fork_repair() {
        let node = Arc::new(MockNode::new());
        stage_chain(&node, 55);
        let store = Arc::new(MockStore::new());
        store.set_max_level(50);
        // The store's head at level 50 is a block the node no longer
        // reports: the node serves BL50 where the store kept FORK50.
        store.set_latest(BlockReference {
            hash: BlockHash("FORK50".into()),
            level: 50,
        });
        store.insert_block("BL49", false);
        // The walk below the fork head addresses ancestors through the fork
        // head's own hash.
        stage_block(&node, "blocks/BL50~1", 49, "BL49", "BL48");
        let engine = engine(node, store.clone());

        let results = engine
            .get_blocks((BlockHash("BL55".into()), 55), 51..=55, true)
            .await
            .unwrap();
        // Five forward blocks plus the repaired head of the fork.
        assert_eq!(results.len(), 6);
        let (repair, _) = &results[5];
        assert!(matches!(repair, BlockAction::WriteAndMakeValidBlock(_)));
        assert_eq!(repair.block().data.hash.as_str(), "BL50");

        store.write_results(&results).await.unwrap();
        let written = store.written();
        assert_eq!(written.len(), 6);
        assert_eq!(written[5].0, "write_valid");
        assert!(written[..5].iter().all(|(kind, _, _, _)| kind == "write"));
    }

    #[tokio::test]
    async fn test_fork_level_mismatch_aborts_the_page() {
        let node = Arc::new(MockNode::new());
        stage_chain(&node, 55);
        let store = Arc::new(MockStore::new());
        store.set_max_level(50);
        store.set_latest(BlockReference {
            hash: BlockHash("FORK49".into()),
            level: 49,
        });
        let engine = engine(node, store);

        let result = engine
            .get_blocks((BlockHash("BL55".into()), 55), 51..=55, true)
            .await;
        assert!(matches!(result, Err(IndexerError::ForkInconsistency(_))));
    }

    #[tokio::test]
    async fn test_shutdown_mid_sync_rejects_next_page() {
        let node = Arc::new(MockNode::new());
        stage_chain(&node, 4);
        let store = Arc::new(MockStore::new());
        let engine = engine_with_page_size(node.clone(), store, 2);

        let plan = engine.sync_from_last_indexed(false).await.unwrap();
        assert_eq!(plan.pages.len(), 2);

        let first = engine
            .get_blocks(plan.reference.clone(), plan.pages[0].clone(), false)
            .await
            .unwrap();
        assert_eq!(first.len(), 2);

        node.set_rejecting(true);
        let second = engine
            .get_blocks(plan.reference.clone(), plan.pages[1].clone(), false)
            .await;
        assert!(matches!(second, Err(IndexerError::Shutdown)));
    }

    #[tokio::test]
    async fn test_batch_rights_fetches() {
        let node = Arc::new(MockNode::new());
        node.stage(
            "blocks/BL5/helpers/baking_rights",
            r#"[{"level": 5, "delegate": "tz1baker", "priority": 0}]"#,
        );
        node.stage(
            "blocks/BL5/helpers/endorsing_rights",
            r#"[{"level": 5, "delegate": "tz1baker", "slots": [1, 2]}]"#,
        );
        let store = Arc::new(MockStore::new());
        let engine = engine(node, store);

        let hashes = vec![BlockHash("BL5".into())];
        let baking = engine.get_baking_rights(&hashes).await.unwrap();
        assert_eq!(baking[0].1[0].delegate.0, "tz1baker");
        let endorsing = engine.get_endorsing_rights(&hashes).await.unwrap();
        assert_eq!(endorsing[0].1[0].slots, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_account_snapshots_are_rewritten() {
        let node = Arc::new(MockNode::new());
        stage_block(&node, "blocks/BL7", 7, "BL7", "BL6");
        node.stage(
            "blocks/BL7/context/contracts/KT1abc",
            r#"{
                "manager": "tz1mgr",
                "balance": "1000",
                "spendable": true,
                "counter": "4",
                "script": {
                    "code": [{"prim": "parameter", "args": [{"prim": "unit"}]}],
                    "storage": {"prim": "Unit"}
                }
            }"#,
        );
        node.stage(
            "blocks/BL7/context/contracts/tz1plain",
            r#"{"manager": "tz1plain", "balance": "42", "spendable": true, "counter": "1"}"#,
        );
        let store = Arc::new(MockStore::new());
        let engine = engine(node.clone(), store);

        let block = rpc::get_block(node.as_ref(), &BlockHash("BL7".into()), None)
            .await
            .unwrap();
        let ids = vec![AccountId("KT1abc".into()), AccountId("tz1plain".into())];
        let accounts = engine.get_accounts_for_block(&block, &ids).await.unwrap();

        assert_eq!(accounts.len(), 2);
        assert_eq!(accounts[0].block_level, 7);
        assert_eq!(
            accounts[0].script,
            Some(serde_json::Value::String("parameter unit".into()))
        );
        assert_eq!(
            accounts[0].storage,
            Some(serde_json::Value::String("Unit".into()))
        );
        assert!(accounts[1].script.is_none());
    }

    #[tokio::test]
    async fn test_round_trip_block_hash() {
        let node = Arc::new(MockNode::new());
        stage_chain(&node, 2);
        let store = Arc::new(MockStore::new());
        let engine = engine(node.clone(), store);

        let results = engine
            .get_blocks((BlockHash("BL2".into()), 2), 1..=2, false)
            .await
            .unwrap();
        for (action, _) in &results {
            let direct = rpc::get_block(node.as_ref(), &action.block().data.hash, None)
                .await
                .unwrap();
            assert_eq!(direct.hash, action.block().data.hash);
        }
    }
}
