//! Persistence boundary.
//!
//! The sync engine reads exactly four facts from the store (highest indexed
//! level, latest stored block, block existence, invalidation state) and
//! writes through a single sink taking the per-page action list. Everything
//! else about persistence is an implementation detail behind the
//! [`IndexerStore`] trait; the bundled implementation targets PostgreSQL.

use crate::error::Result;
use crate::models::{
    AccountId, Block, BlockAction, BlockFetchingResults, BlockHash, BlockReference, Operation,
};
use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::{Executor, PgPool, Row};
use tracing::{debug, info};

#[async_trait]
pub trait IndexerStore: Send + Sync {
    /// Highest indexed level, `-1` when nothing has been indexed yet.
    async fn fetch_max_level(&self) -> Result<i64>;
    async fn fetch_latest_block(&self) -> Result<Option<BlockReference>>;
    async fn block_exists(&self, hash: &BlockHash) -> Result<bool>;
    async fn block_is_invalidated(&self, hash: &BlockHash) -> Result<bool>;
    /// Apply one page of sync results. Implementations must make the page
    /// atomic: a fork repair either lands fully or not at all.
    async fn write_results(&self, results: &BlockFetchingResults) -> Result<()>;
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS blocks (
    hash TEXT PRIMARY KEY,
    level BIGINT NOT NULL,
    predecessor TEXT NOT NULL,
    timestamp TIMESTAMPTZ NOT NULL,
    protocol TEXT NOT NULL,
    chain_id TEXT,
    validation_pass INT NOT NULL,
    fitness TEXT,
    context TEXT,
    priority INT,
    signature TEXT,
    baker TEXT,
    consumed_gas TEXT,
    cycle BIGINT,
    cycle_position BIGINT,
    voting_period BIGINT,
    voting_period_position BIGINT,
    period_kind TEXT,
    current_expected_quorum INT,
    active_proposal TEXT,
    invalidated BOOLEAN NOT NULL DEFAULT FALSE
);
CREATE INDEX IF NOT EXISTS blocks_level_idx ON blocks (level);

CREATE TABLE IF NOT EXISTS operation_groups (
    hash TEXT PRIMARY KEY,
    block_hash TEXT NOT NULL,
    block_level BIGINT NOT NULL,
    protocol TEXT NOT NULL,
    chain_id TEXT,
    branch TEXT NOT NULL,
    signature TEXT
);
CREATE INDEX IF NOT EXISTS operation_groups_block_idx ON operation_groups (block_hash);

CREATE TABLE IF NOT EXISTS operations (
    id BIGSERIAL PRIMARY KEY,
    group_hash TEXT NOT NULL,
    block_hash TEXT NOT NULL,
    block_level BIGINT NOT NULL,
    kind TEXT NOT NULL,
    source TEXT,
    destination TEXT,
    delegate TEXT,
    amount TEXT,
    fee TEXT,
    counter TEXT,
    gas_limit TEXT,
    storage_limit TEXT,
    public_key TEXT,
    manager_pubkey TEXT,
    balance TEXT,
    proposal TEXT,
    ballot TEXT,
    operation_level BIGINT,
    nonce TEXT,
    pkh TEXT,
    secret TEXT,
    parameters TEXT,
    script TEXT,
    storage TEXT
);
CREATE INDEX IF NOT EXISTS operations_block_idx ON operations (block_hash);
CREATE INDEX IF NOT EXISTS operations_kind_idx ON operations (kind);

CREATE TABLE IF NOT EXISTS account_checkpoint (
    account_id TEXT NOT NULL,
    block_hash TEXT NOT NULL,
    block_level BIGINT NOT NULL
);
CREATE INDEX IF NOT EXISTS account_checkpoint_account_idx ON account_checkpoint (account_id);
"#;

/// Flattened column values for one operation row.
#[derive(Debug, Default)]
pub(crate) struct OperationRow {
    pub kind: &'static str,
    pub source: Option<String>,
    pub destination: Option<String>,
    pub delegate: Option<String>,
    pub amount: Option<String>,
    pub fee: Option<String>,
    pub counter: Option<String>,
    pub gas_limit: Option<String>,
    pub storage_limit: Option<String>,
    pub public_key: Option<String>,
    pub manager_pubkey: Option<String>,
    pub balance: Option<String>,
    pub proposal: Option<String>,
    pub ballot: Option<String>,
    pub operation_level: Option<i64>,
    pub nonce: Option<String>,
    pub pkh: Option<String>,
    pub secret: Option<String>,
    pub parameters: Option<String>,
    pub script: Option<String>,
    pub storage: Option<String>,
}

/// Scripts and parameters have been rewritten to Michelson source by the
/// time they reach the store; anything still in JSON form is stored as its
/// compact JSON text.
fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

pub(crate) fn operation_row(op: &Operation) -> OperationRow {
    match op {
        Operation::Endorsement { level } => OperationRow {
            kind: "endorsement",
            operation_level: Some(*level),
            ..Default::default()
        },
        Operation::SeedNonceRevelation { level, nonce } => OperationRow {
            kind: "seed_nonce_revelation",
            operation_level: Some(*level),
            nonce: Some(nonce.clone()),
            ..Default::default()
        },
        Operation::ActivateAccount { pkh, secret } => OperationRow {
            kind: "activate_account",
            pkh: Some(pkh.0.clone()),
            secret: Some(secret.clone()),
            ..Default::default()
        },
        Operation::Reveal {
            source,
            fee,
            counter,
            gas_limit,
            storage_limit,
            public_key,
        } => OperationRow {
            kind: "reveal",
            source: Some(source.0.clone()),
            fee: Some(fee.clone()),
            counter: Some(counter.clone()),
            gas_limit: Some(gas_limit.clone()),
            storage_limit: Some(storage_limit.clone()),
            public_key: Some(public_key.clone()),
            ..Default::default()
        },
        Operation::Transaction {
            source,
            fee,
            counter,
            gas_limit,
            storage_limit,
            amount,
            destination,
            parameters,
        } => OperationRow {
            kind: "transaction",
            source: Some(source.0.clone()),
            fee: Some(fee.clone()),
            counter: Some(counter.clone()),
            gas_limit: Some(gas_limit.clone()),
            storage_limit: Some(storage_limit.clone()),
            amount: Some(amount.clone()),
            destination: Some(destination.0.clone()),
            parameters: parameters.as_ref().map(value_text),
            ..Default::default()
        },
        Operation::Origination {
            source,
            fee,
            counter,
            gas_limit,
            storage_limit,
            manager_pubkey,
            balance,
            delegate,
            script,
            ..
        } => OperationRow {
            kind: "origination",
            source: Some(source.0.clone()),
            fee: Some(fee.clone()),
            counter: Some(counter.clone()),
            gas_limit: Some(gas_limit.clone()),
            storage_limit: Some(storage_limit.clone()),
            manager_pubkey: Some(manager_pubkey.clone()),
            balance: Some(balance.clone()),
            delegate: delegate.as_ref().map(|d| d.0.clone()),
            script: script.as_ref().map(|s| value_text(&s.code)),
            storage: script.as_ref().map(|s| value_text(&s.storage)),
            ..Default::default()
        },
        Operation::Delegation {
            source,
            fee,
            counter,
            gas_limit,
            storage_limit,
            delegate,
        } => OperationRow {
            kind: "delegation",
            source: Some(source.0.clone()),
            fee: Some(fee.clone()),
            counter: Some(counter.clone()),
            gas_limit: Some(gas_limit.clone()),
            storage_limit: Some(storage_limit.clone()),
            delegate: delegate.as_ref().map(|d| d.0.clone()),
            ..Default::default()
        },
        Operation::Ballot {
            source,
            period,
            proposal,
            ballot,
        } => OperationRow {
            kind: "ballot",
            source: Some(source.0.clone()),
            operation_level: Some(*period),
            proposal: Some(proposal.0.clone()),
            ballot: Some(ballot.clone()),
            ..Default::default()
        },
        Operation::Proposals {
            source,
            period,
            proposals,
        } => OperationRow {
            kind: "proposals",
            source: Some(source.0.clone()),
            operation_level: Some(*period),
            proposal: Some(
                proposals
                    .iter()
                    .map(|p| p.0.as_str())
                    .collect::<Vec<_>>()
                    .join(","),
            ),
            ..Default::default()
        },
        Operation::DoubleBakingEvidence { .. } => OperationRow {
            kind: "double_baking_evidence",
            ..Default::default()
        },
        Operation::DoubleEndorsementEvidence { .. } => OperationRow {
            kind: "double_endorsement_evidence",
            ..Default::default()
        },
    }
}

/// PostgreSQL-backed store.
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    /// Create the schema if it does not exist. Also serves as a connection
    /// check at startup.
    pub async fn run_migrations(&self) -> Result<()> {
        info!("applying database schema");
        self.pool.execute(SCHEMA).await?;
        Ok(())
    }

    async fn insert_block<'t>(
        &self,
        tx: &mut sqlx::Transaction<'t, sqlx::Postgres>,
        block: &Block,
        make_valid: bool,
    ) -> Result<()> {
        let data = &block.data;
        let conflict_clause = if make_valid {
            "ON CONFLICT (hash) DO UPDATE SET invalidated = FALSE"
        } else {
            "ON CONFLICT (hash) DO NOTHING"
        };
        let sql = format!(
            "INSERT INTO blocks (hash, level, predecessor, timestamp, protocol, chain_id, \
             validation_pass, fitness, context, priority, signature, baker, consumed_gas, \
             cycle, cycle_position, voting_period, voting_period_position, period_kind, \
             current_expected_quorum, active_proposal, invalidated) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, \
             $17, $18, $19, $20, FALSE) {}",
            conflict_clause
        );
        sqlx::query(&sql)
            .bind(data.hash.as_str())
            .bind(data.level())
            .bind(data.header.predecessor.as_str())
            .bind(data.header.timestamp)
            .bind(data.protocol.0.as_str())
            .bind(data.chain_id.as_deref())
            .bind(data.header.validation_pass)
            .bind(data.header.fitness.join(","))
            .bind(data.header.context.as_deref())
            .bind(data.header.priority)
            .bind(data.header.signature.as_deref())
            .bind(data.metadata.baker.as_ref().map(|b| b.0.as_str()))
            .bind(data.metadata.consumed_gas.as_deref())
            .bind(data.metadata.cycle)
            .bind(data.metadata.cycle_position)
            .bind(data.metadata.voting_period)
            .bind(data.metadata.voting_period_position)
            .bind(data.metadata.period_kind.as_deref())
            .bind(block.votes.quorum.or(data.metadata.current_expected_quorum))
            .bind(
                block
                    .votes
                    .active_proposal
                    .as_ref()
                    .or(data.metadata.active_proposal.as_ref())
                    .map(|p| p.0.as_str()),
            )
            .execute(&mut **tx)
            .await?;

        for group in &block.operations {
            sqlx::query(
                "INSERT INTO operation_groups (hash, block_hash, block_level, protocol, \
                 chain_id, branch, signature) VALUES ($1, $2, $3, $4, $5, $6, $7) \
                 ON CONFLICT (hash) DO NOTHING",
            )
            .bind(group.hash.0.as_str())
            .bind(data.hash.as_str())
            .bind(data.level())
            .bind(group.protocol.0.as_str())
            .bind(group.chain_id.as_deref())
            .bind(group.branch.as_str())
            .bind(group.signature.as_deref())
            .execute(&mut **tx)
            .await?;

            for op in &group.contents {
                let row = operation_row(op);
                sqlx::query(
                    "INSERT INTO operations (group_hash, block_hash, block_level, kind, \
                     source, destination, delegate, amount, fee, counter, gas_limit, \
                     storage_limit, public_key, manager_pubkey, balance, proposal, ballot, \
                     operation_level, nonce, pkh, secret, parameters, script, storage) \
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, \
                     $15, $16, $17, $18, $19, $20, $21, $22, $23, $24)",
                )
                .bind(group.hash.0.as_str())
                .bind(data.hash.as_str())
                .bind(data.level())
                .bind(row.kind)
                .bind(row.source)
                .bind(row.destination)
                .bind(row.delegate)
                .bind(row.amount)
                .bind(row.fee)
                .bind(row.counter)
                .bind(row.gas_limit)
                .bind(row.storage_limit)
                .bind(row.public_key)
                .bind(row.manager_pubkey)
                .bind(row.balance)
                .bind(row.proposal)
                .bind(row.ballot)
                .bind(row.operation_level)
                .bind(row.nonce)
                .bind(row.pkh)
                .bind(row.secret)
                .bind(row.parameters)
                .bind(row.script)
                .bind(row.storage)
                .execute(&mut **tx)
                .await?;
            }
        }
        Ok(())
    }

    async fn checkpoint_accounts<'t>(
        &self,
        tx: &mut sqlx::Transaction<'t, sqlx::Postgres>,
        block: &Block,
        account_ids: &[AccountId],
    ) -> Result<()> {
        for id in account_ids {
            sqlx::query(
                "INSERT INTO account_checkpoint (account_id, block_hash, block_level) \
                 VALUES ($1, $2, $3)",
            )
            .bind(id.0.as_str())
            .bind(block.data.hash.as_str())
            .bind(block.data.level())
            .execute(&mut **tx)
            .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl IndexerStore for PostgresStore {
    async fn fetch_max_level(&self) -> Result<i64> {
        let level: i64 = sqlx::query_scalar("SELECT COALESCE(MAX(level), -1) FROM blocks")
            .fetch_one(&self.pool)
            .await?;
        Ok(level)
    }

    async fn fetch_latest_block(&self) -> Result<Option<BlockReference>> {
        let row = sqlx::query("SELECT hash, level FROM blocks ORDER BY level DESC LIMIT 1")
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| BlockReference {
            hash: BlockHash(r.get("hash")),
            level: r.get("level"),
        }))
    }

    async fn block_exists(&self, hash: &BlockHash) -> Result<bool> {
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM blocks WHERE hash = $1)")
                .bind(hash.as_str())
                .fetch_one(&self.pool)
                .await?;
        Ok(exists)
    }

    async fn block_is_invalidated(&self, hash: &BlockHash) -> Result<bool> {
        let invalidated: bool = sqlx::query_scalar(
            "SELECT COALESCE((SELECT invalidated FROM blocks WHERE hash = $1), FALSE)",
        )
        .bind(hash.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(invalidated)
    }

    async fn write_results(&self, results: &BlockFetchingResults) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for (action, account_ids) in results {
            match action {
                BlockAction::WriteBlock(block) => {
                    self.insert_block(&mut tx, block, false).await?;
                    self.checkpoint_accounts(&mut tx, block, account_ids).await?;
                }
                BlockAction::WriteAndMakeValidBlock(block) => {
                    self.insert_block(&mut tx, block, true).await?;
                    self.checkpoint_accounts(&mut tx, block, account_ids).await?;
                }
                BlockAction::RevalidateBlock(block) => {
                    debug!("revalidating block {}", block.data.hash);
                    sqlx::query("UPDATE blocks SET invalidated = FALSE WHERE hash = $1")
                        .bind(block.data.hash.as_str())
                        .execute(&mut *tx)
                        .await?;
                }
            }
        }
        tx.commit().await?;
        Ok(())
    }
}
