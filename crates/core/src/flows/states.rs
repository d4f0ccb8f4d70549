use std::fmt;

use serde::{Deserialize, Serialize};

use crate::domain::approval::{ActorRole, DecisionOutcome};
use crate::domain::request::RequestState;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowAction {
    Submit,
    HodApprove,
    HodReject,
    GmApprove,
    GmReject,
    Resubmit,
    Cancel,
}

impl WorkflowAction {
    pub const ALL: [WorkflowAction; 7] = [
        Self::Submit,
        Self::HodApprove,
        Self::HodReject,
        Self::GmApprove,
        Self::GmReject,
        Self::Resubmit,
        Self::Cancel,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Submit => "submit",
            Self::HodApprove => "hod_approve",
            Self::HodReject => "hod_reject",
            Self::GmApprove => "gm_approve",
            Self::GmReject => "gm_reject",
            Self::Resubmit => "resubmit",
            Self::Cancel => "cancel",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "submit" => Some(Self::Submit),
            "hod_approve" | "hodapprove" => Some(Self::HodApprove),
            "hod_reject" | "hodreject" => Some(Self::HodReject),
            "gm_approve" | "gmapprove" => Some(Self::GmApprove),
            "gm_reject" | "gmreject" => Some(Self::GmReject),
            "resubmit" => Some(Self::Resubmit),
            "cancel" => Some(Self::Cancel),
            _ => None,
        }
    }

    pub fn required_role(&self) -> ActorRole {
        match self {
            Self::Submit | Self::Resubmit | Self::Cancel => ActorRole::Requester,
            Self::HodApprove | Self::HodReject => ActorRole::Hod,
            Self::GmApprove | Self::GmReject => ActorRole::Gm,
        }
    }

    /// Decision actions record an `ApprovalDecision` alongside the history entry.
    pub fn decision_outcome(&self) -> Option<DecisionOutcome> {
        match self {
            Self::HodApprove | Self::GmApprove => Some(DecisionOutcome::Approved),
            Self::HodReject | Self::GmReject => Some(DecisionOutcome::Rejected),
            Self::Submit | Self::Resubmit | Self::Cancel => None,
        }
    }

    pub fn requires_comment(&self) -> bool {
        matches!(self, Self::HodReject | Self::GmReject)
    }

    pub fn history_description(&self) -> &'static str {
        match self {
            Self::Submit => "Submitted for Head of Department review",
            Self::HodApprove => "Approved by Head of Department, forwarded to General Manager",
            Self::HodReject => "Rejected by Head of Department",
            Self::GmApprove => "Approved by General Manager",
            Self::GmReject => "Rejected by General Manager",
            Self::Resubmit => "Resubmitted for Head of Department review",
            Self::Cancel => "Cancelled by requester",
        }
    }
}

impl fmt::Display for WorkflowAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionOutcome {
    pub from: RequestState,
    pub to: RequestState,
    pub action: WorkflowAction,
    pub actor_role: ActorRole,
}

impl TransitionOutcome {
    /// Submissions open a new approval cycle.
    pub fn opens_cycle(&self) -> bool {
        matches!(self.action, WorkflowAction::Submit | WorkflowAction::Resubmit)
    }
}
