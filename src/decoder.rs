//! JSON decoders for node responses.
//!
//! Every response body goes through the same normalization before hitting
//! serde: control characters are stripped (some nodes leak them into string
//! fields) and the legacy `manager_pubkey` spelling is renamed to
//! `managerPubkey` so one set of models covers both node versions.

use crate::error::Result;
use crate::models::{
    Account, AccountId, BakerRolls, BakingRights, BallotCounts, BlockData, EndorsingRights,
    ManagerKey, OperationsGroup, ProtocolId,
};
use serde::Deserialize;
use serde_json::Value;

/// Strip non-printable ASCII from a response body before parsing.
pub fn sanitize(raw: &str) -> String {
    raw.chars().filter(|c| !c.is_ascii_control()).collect()
}

/// Rename the legacy `manager_pubkey` field to `managerPubkey` across the
/// whole document.
pub fn normalize_legacy_fields(raw: &str) -> String {
    raw.replace("\"manager_pubkey\"", "\"managerPubkey\"")
}

fn prepare(raw: &str) -> String {
    normalize_legacy_fields(&sanitize(raw))
}

pub fn decode_block(raw: &str) -> Result<BlockData> {
    Ok(serde_json::from_str(&prepare(raw))?)
}

/// Operations arrive grouped by validation pass as `[[OperationsGroup]]`;
/// the nesting carries no information the group contents don't, so it is
/// flattened here.
pub fn decode_operations(raw: &str) -> Result<Vec<OperationsGroup>> {
    let nested: Vec<Vec<OperationsGroup>> = serde_json::from_str(&prepare(raw))?;
    Ok(nested.into_iter().flatten().collect())
}

pub fn decode_account_ids(raw: &str) -> Result<Vec<AccountId>> {
    Ok(serde_json::from_str(&prepare(raw))?)
}

/// Wire shape of `blocks/{hash}/context/contracts/{id}`.
#[derive(Debug, Deserialize)]
struct ContractResponse {
    #[serde(default)]
    manager: Option<AccountId>,
    balance: String,
    #[serde(default)]
    spendable: bool,
    #[serde(default)]
    delegate: Option<ContractDelegate>,
    #[serde(default)]
    counter: Option<String>,
    #[serde(default)]
    script: Option<ContractScript>,
}

#[derive(Debug, Deserialize)]
struct ContractDelegate {
    #[serde(default)]
    setable: bool,
    #[serde(default)]
    value: Option<AccountId>,
}

#[derive(Debug, Deserialize)]
struct ContractScript {
    code: Value,
    storage: Value,
}

/// Decode an account snapshot, flattening the nested delegate and script
/// objects and tagging the record with the observing block.
pub fn decode_account(
    raw: &str,
    account_id: AccountId,
    block_id: crate::models::BlockHash,
    block_level: i64,
) -> Result<Account> {
    let wire: ContractResponse = serde_json::from_str(&prepare(raw))?;
    let (delegate_setable, delegate_value) = match wire.delegate {
        Some(d) => (d.setable, d.value),
        None => (false, None),
    };
    let (script, storage) = match wire.script {
        Some(s) => (Some(s.code), Some(s.storage)),
        None => (None, None),
    };
    Ok(Account {
        account_id,
        manager: wire.manager,
        balance: wire.balance,
        spendable: wire.spendable,
        delegate_setable,
        delegate_value,
        counter: wire.counter,
        script,
        storage,
        block_id,
        block_level,
    })
}

pub fn decode_manager_key(raw: &str) -> Result<ManagerKey> {
    Ok(serde_json::from_str(&prepare(raw))?)
}

/// `votes/current_quorum` serves a bare integer, or `null` outside voting.
pub fn decode_current_quorum(raw: &str) -> Result<Option<i32>> {
    Ok(serde_json::from_str(&prepare(raw))?)
}

/// `votes/current_proposal` serves a bare protocol hash, or `null`.
pub fn decode_current_proposal(raw: &str) -> Result<Option<ProtocolId>> {
    Ok(serde_json::from_str(&prepare(raw))?)
}

pub fn decode_ballot_counts(raw: &str) -> Result<BallotCounts> {
    Ok(serde_json::from_str(&prepare(raw))?)
}

pub fn decode_baker_rolls(raw: &str) -> Result<Vec<BakerRolls>> {
    Ok(serde_json::from_str(&prepare(raw))?)
}

pub fn decode_baking_rights(raw: &str) -> Result<Vec<BakingRights>> {
    Ok(serde_json::from_str(&prepare(raw))?)
}

pub fn decode_endorsing_rights(raw: &str) -> Result<Vec<EndorsingRights>> {
    Ok(serde_json::from_str(&prepare(raw))?)
}
