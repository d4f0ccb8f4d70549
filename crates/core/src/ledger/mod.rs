//! Status history ledger.
//!
//! Entries are append-only and hash-chained per request. The ledger, replayed
//! in sequence order through the transition table, must land on the request's
//! current state.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::domain::history::StatusHistoryEntry;
use crate::domain::request::{RequestId, RequestState};
use crate::flows::{FlowEngine, TransitionOutcome};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerVerification {
    pub request_id: RequestId,
    pub valid: bool,
    pub verified_entries: usize,
    pub replayed_state: Option<RequestState>,
    pub latest_hash: Option<String>,
    pub failure_reason: Option<String>,
}

/// Builds the entry that follows `previous` for a committed transition.
pub fn next_entry(
    previous: Option<&StatusHistoryEntry>,
    request_id: &RequestId,
    outcome: &TransitionOutcome,
    comment: Option<String>,
    cycle: u32,
    timestamp: DateTime<Utc>,
) -> StatusHistoryEntry {
    let sequence_number = previous.map_or(1, |entry| entry.sequence_number.saturating_add(1));
    let prev_hash = previous.map(|entry| entry.entry_hash.clone());

    let mut entry = StatusHistoryEntry {
        request_id: request_id.clone(),
        sequence_number,
        action: outcome.action,
        from_state: outcome.from,
        to_state: outcome.to,
        description: outcome.action.history_description().to_string(),
        actor_role: outcome.actor_role,
        comment,
        cycle,
        prev_hash,
        entry_hash: String::new(),
        timestamp,
    };
    entry.entry_hash = hash_entry(&entry);
    entry
}

/// Replays `entries` through the transition table and returns the end state.
pub fn replay_state(entries: &[StatusHistoryEntry]) -> Result<RequestState, String> {
    let engine = FlowEngine::default();
    engine
        .replay(entries.iter().map(|entry| (entry.action, entry.actor_role)))
        .map_err(|error| error.to_string())
}

/// Checks sequence continuity, state continuity, transition legality, the hash
/// chain, and (when given) agreement with the request's current state.
pub fn verify_history(
    request_id: &RequestId,
    entries: &[StatusHistoryEntry],
    current_state: Option<RequestState>,
) -> LedgerVerification {
    let engine = FlowEngine::default();
    let mut state = engine.initial_state();
    let mut previous_hash: Option<String> = None;

    let failure = |index: usize, state: RequestState, hash: Option<String>, reason: String| {
        LedgerVerification {
            request_id: request_id.clone(),
            valid: false,
            verified_entries: index,
            replayed_state: Some(state),
            latest_hash: hash,
            failure_reason: Some(reason),
        }
    };

    for (index, entry) in entries.iter().enumerate() {
        let expected_sequence = u64::try_from(index).unwrap_or(u64::MAX).saturating_add(1);
        if entry.request_id != *request_id {
            return failure(
                index,
                state,
                previous_hash,
                format!("entry {} belongs to request {}", entry.sequence_number, entry.request_id),
            );
        }
        if entry.sequence_number != expected_sequence {
            return failure(
                index,
                state,
                previous_hash,
                format!(
                    "sequence gap: expected {expected_sequence}, found {}",
                    entry.sequence_number
                ),
            );
        }
        if entry.from_state != state {
            return failure(
                index,
                state,
                previous_hash,
                format!(
                    "entry {} starts from {} but replay is at {state}",
                    entry.sequence_number, entry.from_state
                ),
            );
        }

        let outcome = match engine.apply(state, entry.action, entry.actor_role) {
            Ok(outcome) => outcome,
            Err(error) => {
                return failure(
                    index,
                    state,
                    previous_hash,
                    format!("entry {} is not a legal transition: {error}", entry.sequence_number),
                );
            }
        };
        if outcome.to != entry.to_state {
            return failure(
                index,
                state,
                previous_hash,
                format!(
                    "entry {} records {} but the transition leads to {}",
                    entry.sequence_number, entry.to_state, outcome.to
                ),
            );
        }

        if entry.prev_hash != previous_hash {
            return failure(
                index,
                state,
                previous_hash,
                format!("previous hash mismatch at entry {}", entry.sequence_number),
            );
        }
        if hash_entry(entry) != entry.entry_hash {
            return failure(
                index,
                state,
                previous_hash,
                format!("entry hash mismatch at entry {}", entry.sequence_number),
            );
        }

        state = outcome.to;
        previous_hash = Some(entry.entry_hash.clone());
    }

    if let Some(current) = current_state {
        if current != state {
            return failure(
                entries.len(),
                state,
                previous_hash,
                format!("replayed state {state} does not match current state {current}"),
            );
        }
    }

    LedgerVerification {
        request_id: request_id.clone(),
        valid: true,
        verified_entries: entries.len(),
        replayed_state: Some(state),
        latest_hash: previous_hash,
        failure_reason: None,
    }
}

fn hash_entry(entry: &StatusHistoryEntry) -> String {
    let material = format!(
        "{}|{}|{}|{}|{}|{}|{}|{}|{}|{}",
        entry.request_id.0,
        entry.sequence_number,
        entry.action.as_str(),
        entry.from_state.as_str(),
        entry.to_state.as_str(),
        entry.actor_role.as_str(),
        entry.comment.as_deref().unwrap_or(""),
        entry.cycle,
        entry.timestamp.to_rfc3339_opts(SecondsFormat::Micros, true),
        entry.prev_hash.as_deref().unwrap_or(""),
    );
    sha256_hex(material.as_bytes())
}

fn sha256_hex(payload: &[u8]) -> String {
    let digest = Sha256::digest(payload);
    let mut output = String::with_capacity(digest.len() * 2);
    for byte in digest.as_slice() {
        output.push_str(&format!("{byte:02x}"));
    }
    output
}
