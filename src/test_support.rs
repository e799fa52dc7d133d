//! In-memory fakes shared by the unit tests: a node gateway serving staged
//! JSON bodies and a store with scriptable block state.

use crate::config::SyncConfig;
use crate::error::{IndexerError, Result};
use crate::models::{
    Block, BlockData, BlockFetchingResults, BlockHash, BlockReference, CurrentVotes,
};
use crate::rpc::NodeGateway;
use crate::storage::IndexerStore;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

pub(crate) fn test_sync_config() -> SyncConfig {
    SyncConfig {
        block_page_size: 500,
        block_operations_concurrency: 4,
        account_concurrency: 2,
        follow_fork: true,
        poll_interval: Duration::from_millis(10),
    }
}

/// Gateway fake: every command resolves against a staged response map, and
/// every call is recorded. Unstaged commands answer with `NotFound`, which
/// doubles as the node's 404 behavior.
pub(crate) struct MockNode {
    responses: Mutex<HashMap<String, String>>,
    calls: Mutex<Vec<String>>,
    rejecting: AtomicBool,
}

impl MockNode {
    pub fn new() -> Self {
        Self {
            responses: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            rejecting: AtomicBool::new(false),
        }
    }

    pub fn stage(&self, command: &str, body: &str) {
        self.responses
            .lock()
            .unwrap()
            .insert(command.to_string(), body.to_string());
    }

    pub fn unstage(&self, command: &str) {
        self.responses.lock().unwrap().remove(command);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn set_rejecting(&self, rejecting: bool) {
        self.rejecting.store(rejecting, Ordering::SeqCst);
    }
}

#[async_trait]
impl NodeGateway for MockNode {
    async fn get(&self, command: &str) -> Result<String> {
        if self.rejecting.load(Ordering::SeqCst) {
            return Err(IndexerError::Shutdown);
        }
        self.calls.lock().unwrap().push(command.to_string());
        self.responses
            .lock()
            .unwrap()
            .get(command)
            .cloned()
            .ok_or_else(|| IndexerError::NotFound(command.to_string()))
    }

    async fn post(&self, command: &str, _payload: Option<String>) -> Result<String> {
        if self.rejecting.load(Ordering::SeqCst) {
            return Err(IndexerError::Shutdown);
        }
        self.calls.lock().unwrap().push(command.to_string());
        self.responses
            .lock()
            .unwrap()
            .get(command)
            .cloned()
            .ok_or_else(|| IndexerError::NotFound(command.to_string()))
    }
}

pub(crate) fn block_json(level: i64, hash: &str, predecessor: &str) -> String {
    serde_json::json!({
        "protocol": "PsddFKi32cMJ2qPjf43Qv5GDWLDPZb3T3bF6fLKiF5HtvHNU7aP",
        "chain_id": "NetXdQprcVkpaWU",
        "hash": hash,
        "header": {
            "level": level,
            "predecessor": predecessor,
            "timestamp": "2018-06-30T16:07:32Z",
            "validation_pass": 4,
            "fitness": ["00"],
        },
        "metadata": {
            "baker": "tz1Yju7jmmsaUiG9qQLoYv35v5pHgnWoLWbt",
            "cycle": level / 4096,
        }
    })
    .to_string()
}

/// Stage a block body at `command` and at its direct address, together with
/// empty operations, contracts and votes sub-resources under its hash.
pub(crate) fn stage_block(
    node: &MockNode,
    command: &str,
    level: i64,
    hash: &str,
    predecessor: &str,
) {
    let body = block_json(level, hash, predecessor);
    node.stage(command, &body);
    node.stage(&format!("blocks/{}", hash), &body);
    node.stage(&format!("blocks/{}/operations", hash), "[[]]");
    node.stage(&format!("blocks/{}/context/contracts", hash), "[]");
    node.stage(&format!("blocks/{}~/votes/current_quorum", hash), "null");
    node.stage(&format!("blocks/{}~/votes/current_proposal", hash), "null");
}

/// Build an assembled in-memory block without going through the decoders.
pub(crate) fn block_at(level: i64, hash: &str, predecessor: &str) -> Block {
    let data: BlockData = serde_json::from_str(&block_json(level, hash, predecessor)).unwrap();
    Block {
        data,
        operations: Vec::new(),
        votes: CurrentVotes::empty(),
    }
}

/// Store fake with scriptable existence and invalidation state.
pub(crate) struct MockStore {
    max_level: Mutex<i64>,
    latest: Mutex<Option<BlockReference>>,
    /// Stored blocks, mapped to their invalidated flag.
    blocks: Mutex<HashMap<String, bool>>,
    /// Hashes reported invalidated despite not being stored, to drive the
    /// impossible-state path.
    phantom_invalidated: Mutex<HashSet<String>>,
    written: Mutex<Vec<(String, i64, String, usize)>>,
}

impl MockStore {
    pub fn new() -> Self {
        Self {
            max_level: Mutex::new(-1),
            latest: Mutex::new(None),
            blocks: Mutex::new(HashMap::new()),
            phantom_invalidated: Mutex::new(HashSet::new()),
            written: Mutex::new(Vec::new()),
        }
    }

    pub fn set_max_level(&self, level: i64) {
        *self.max_level.lock().unwrap() = level;
    }

    pub fn set_latest(&self, reference: BlockReference) {
        *self.latest.lock().unwrap() = Some(reference);
    }

    pub fn insert_block(&self, hash: &str, invalidated: bool) {
        self.blocks
            .lock()
            .unwrap()
            .insert(hash.to_string(), invalidated);
    }

    pub fn mark_invalidated_only(&self, hash: &str) {
        self.phantom_invalidated
            .lock()
            .unwrap()
            .insert(hash.to_string());
    }

    /// Summaries of everything written: action kind, level, hash and the
    /// number of touched accounts.
    pub fn written(&self) -> Vec<(String, i64, String, usize)> {
        self.written.lock().unwrap().clone()
    }
}

#[async_trait]
impl IndexerStore for MockStore {
    async fn fetch_max_level(&self) -> Result<i64> {
        Ok(*self.max_level.lock().unwrap())
    }

    async fn fetch_latest_block(&self) -> Result<Option<BlockReference>> {
        Ok(self.latest.lock().unwrap().clone())
    }

    async fn block_exists(&self, hash: &BlockHash) -> Result<bool> {
        Ok(self.blocks.lock().unwrap().contains_key(hash.as_str()))
    }

    async fn block_is_invalidated(&self, hash: &BlockHash) -> Result<bool> {
        if *self
            .blocks
            .lock()
            .unwrap()
            .get(hash.as_str())
            .unwrap_or(&false)
        {
            return Ok(true);
        }
        Ok(self
            .phantom_invalidated
            .lock()
            .unwrap()
            .contains(hash.as_str()))
    }

    async fn write_results(&self, results: &BlockFetchingResults) -> Result<()> {
        let mut written = self.written.lock().unwrap();
        for (action, ids) in results {
            let kind = match action {
                crate::models::BlockAction::WriteBlock(_) => "write",
                crate::models::BlockAction::WriteAndMakeValidBlock(_) => "write_valid",
                crate::models::BlockAction::RevalidateBlock(_) => "revalidate",
            };
            written.push((
                kind.to_string(),
                action.level(),
                action.block().data.hash.as_str().to_string(),
                ids.len(),
            ));
        }
        Ok(())
    }
}
