//! Domain model for indexed chain data.
//!
//! These types mirror the JSON shapes served by the node's HTTP interface.
//! Monetary amounts, counters and gas limits are kept as the strings the
//! node serialized them as, so records round-trip into the store unchanged.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Base58-encoded block identifier.
///
/// The literal value `head` addresses the node's current chain tip.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockHash(pub String);

impl BlockHash {
    /// Reference to the current tip of the node's canonical chain.
    pub fn head() -> Self {
        BlockHash("head".to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Base58-encoded account (implicit or originated contract) identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AccountId(pub String);

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Base58-encoded protocol identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProtocolId(pub String);

impl fmt::Display for ProtocolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Base58-encoded operation group identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OperationGroupHash(pub String);

impl fmt::Display for OperationGroupHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Shell header of a block as served by `blocks/{hash}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockHeader {
    pub level: i64,
    pub predecessor: BlockHash,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub validation_pass: i32,
    #[serde(default)]
    pub operations_hash: Option<String>,
    #[serde(default)]
    pub fitness: Vec<String>,
    #[serde(default)]
    pub context: Option<String>,
    #[serde(default)]
    pub priority: Option<i32>,
    #[serde(default)]
    pub signature: Option<String>,
}

/// Protocol-level block metadata. Every field is optional because genesis
/// and protocol-transition blocks omit most of them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BlockMetadata {
    #[serde(default)]
    pub baker: Option<AccountId>,
    #[serde(default)]
    pub consumed_gas: Option<String>,
    #[serde(default)]
    pub cycle: Option<i64>,
    #[serde(default)]
    pub cycle_position: Option<i64>,
    #[serde(default)]
    pub voting_period: Option<i64>,
    #[serde(default)]
    pub voting_period_position: Option<i64>,
    #[serde(default)]
    pub period_kind: Option<String>,
    #[serde(default)]
    pub current_expected_quorum: Option<i32>,
    #[serde(default)]
    pub active_proposal: Option<ProtocolId>,
    #[serde(default)]
    pub nonce_hash: Option<String>,
    #[serde(default)]
    pub expected_commitment: Option<bool>,
}

/// A decoded block header with its metadata. Immutable once decoded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockData {
    pub protocol: ProtocolId,
    #[serde(default)]
    pub chain_id: Option<String>,
    pub hash: BlockHash,
    pub header: BlockHeader,
    #[serde(default)]
    pub metadata: BlockMetadata,
}

impl BlockData {
    pub fn level(&self) -> i64 {
        self.header.level
    }

    /// Level 0 is genesis. Genesis exposes no operations, accounts or votes
    /// sub-resources on the node, so every sub-resource call is gated on
    /// this predicate instead of relying on the node's 404.
    pub fn is_genesis(&self) -> bool {
        self.header.level == 0
    }
}

/// A batch of operations sharing a branch and signature, as included in a
/// block's operation listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationsGroup {
    pub protocol: ProtocolId,
    #[serde(default)]
    pub chain_id: Option<String>,
    pub hash: OperationGroupHash,
    pub branch: BlockHash,
    pub contents: Vec<Operation>,
    #[serde(default)]
    pub signature: Option<String>,
}

/// Contract script payload carried by originations: a Michelson code
/// expression plus the initial storage value. Both fields hold the node's
/// JSON form until the Michelson rewrite replaces them with source text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scripted {
    pub code: Value,
    pub storage: Value,
}

/// A single operation, discriminated by its `kind` tag.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Operation {
    Endorsement {
        level: i64,
    },
    SeedNonceRevelation {
        level: i64,
        nonce: String,
    },
    ActivateAccount {
        pkh: AccountId,
        secret: String,
    },
    Reveal {
        source: AccountId,
        fee: String,
        counter: String,
        gas_limit: String,
        storage_limit: String,
        public_key: String,
    },
    Transaction {
        source: AccountId,
        fee: String,
        counter: String,
        gas_limit: String,
        storage_limit: String,
        amount: String,
        destination: AccountId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parameters: Option<Value>,
    },
    Origination {
        source: AccountId,
        fee: String,
        counter: String,
        gas_limit: String,
        storage_limit: String,
        #[serde(rename = "managerPubkey")]
        manager_pubkey: String,
        balance: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        spendable: Option<bool>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        delegatable: Option<bool>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        delegate: Option<AccountId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        script: Option<Scripted>,
    },
    Delegation {
        source: AccountId,
        fee: String,
        counter: String,
        gas_limit: String,
        storage_limit: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        delegate: Option<AccountId>,
    },
    Ballot {
        source: AccountId,
        period: i64,
        proposal: ProtocolId,
        ballot: String,
    },
    Proposals {
        source: AccountId,
        period: i64,
        proposals: Vec<ProtocolId>,
    },
    DoubleBakingEvidence {
        bh1: Value,
        bh2: Value,
    },
    DoubleEndorsementEvidence {
        op1: Value,
        op2: Value,
    },
}

/// Voting state observed alongside a block: the expected quorum and the
/// currently active proposal, both legitimately absent (genesis, or voting
/// periods with no proposal on the table).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CurrentVotes {
    pub quorum: Option<i32>,
    pub active_proposal: Option<ProtocolId>,
}

impl CurrentVotes {
    pub fn empty() -> Self {
        Self::default()
    }
}

/// Ballot tallies for the current voting period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BallotCounts {
    pub yay: i64,
    pub nay: i64,
    pub pass: i64,
}

/// A delegate's voting weight, measured in rolls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BakerRolls {
    pub pkh: AccountId,
    pub rolls: i64,
}

/// Block-production right for a delegate at a level.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BakingRights {
    pub level: i64,
    pub delegate: AccountId,
    pub priority: i32,
    #[serde(default)]
    pub estimated_time: Option<DateTime<Utc>>,
}

/// Endorsement right for a delegate at a level.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndorsingRights {
    pub level: i64,
    pub delegate: AccountId,
    pub slots: Vec<i32>,
    #[serde(default)]
    pub estimated_time: Option<DateTime<Utc>>,
}

/// Account state snapshot, tagged with the block that observed it.
/// `script` and `storage` hold JSON Michelson until rewritten to source text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub account_id: AccountId,
    pub manager: Option<AccountId>,
    pub balance: String,
    pub spendable: bool,
    pub delegate_setable: bool,
    pub delegate_value: Option<AccountId>,
    pub counter: Option<String>,
    pub script: Option<Value>,
    pub storage: Option<Value>,
    pub block_id: BlockHash,
    pub block_level: i64,
}

/// Registered public key of an account's manager, absent until revealed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerKey {
    pub manager: AccountId,
    #[serde(default)]
    pub key: Option<String>,
}

/// A fully assembled block: header data joined with its operations and the
/// voting state observed at the same hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Block {
    pub data: BlockData,
    pub operations: Vec<OperationsGroup>,
    pub votes: CurrentVotes,
}

/// Reference to a stored block, used to compare the local head against the
/// node's view of the same level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockReference {
    pub hash: BlockHash,
    pub level: i64,
}

/// Instruction for the persistence layer. Closed set: downstream consumers
/// pattern-match all three variants.
#[derive(Debug, Clone)]
pub enum BlockAction {
    /// New block observed during normal forward sync.
    WriteBlock(Block),
    /// Block observed during fork recovery that was absent locally; persist
    /// it and mark it valid.
    WriteAndMakeValidBlock(Block),
    /// Block already present locally but flagged invalidated; clear the flag.
    RevalidateBlock(Block),
}

impl BlockAction {
    pub fn block(&self) -> &Block {
        match self {
            BlockAction::WriteBlock(b)
            | BlockAction::WriteAndMakeValidBlock(b)
            | BlockAction::RevalidateBlock(b) => b,
        }
    }

    pub fn level(&self) -> i64 {
        self.block().data.level()
    }
}

/// One entry per level produced by a sync cycle: the action to apply and the
/// account ids its operations touched.
pub type BlockFetchingResults = Vec<(BlockAction, Vec<AccountId>)>;
