use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::request::RequestId;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DecisionId(pub String);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorRole {
    Requester,
    /// Head of Department, first-tier approver.
    Hod,
    /// General Manager, second-tier approver.
    Gm,
}

impl ActorRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Requester => "requester",
            Self::Hod => "hod",
            Self::Gm => "gm",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "requester" => Some(Self::Requester),
            "hod" | "head_of_department" => Some(Self::Hod),
            "gm" | "general_manager" => Some(Self::Gm),
            _ => None,
        }
    }
}

impl fmt::Display for ActorRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionOutcome {
    Approved,
    Rejected,
}

impl DecisionOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            _ => None,
        }
    }
}

/// A recorded approver decision. Immutable once stored; `cycle` ties it to one
/// pass through the approval chain.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalDecision {
    pub id: DecisionId,
    pub request_id: RequestId,
    pub actor_role: ActorRole,
    pub outcome: DecisionOutcome,
    pub comment: Option<String>,
    pub cycle: u32,
    pub decided_at: DateTime<Utc>,
}
