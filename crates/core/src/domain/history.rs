use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::approval::ActorRole;
use crate::domain::request::{RequestId, RequestState};
use crate::flows::WorkflowAction;

/// One append-only row of a request's status history.
///
/// `sequence_number` starts at 1 and increases by exactly one per successful
/// action. `entry_hash` covers the entry's content and `prev_hash`, so any edit
/// to a stored entry breaks the chain.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusHistoryEntry {
    pub request_id: RequestId,
    pub sequence_number: u64,
    pub action: WorkflowAction,
    pub from_state: RequestState,
    pub to_state: RequestState,
    pub description: String,
    pub actor_role: ActorRole,
    pub comment: Option<String>,
    pub cycle: u32,
    pub prev_hash: Option<String>,
    pub entry_hash: String,
    pub timestamp: DateTime<Utc>,
}
