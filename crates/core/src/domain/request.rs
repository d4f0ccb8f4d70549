use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::approval::ActorRole;
use crate::errors::WorkflowError;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestId(pub String);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequesterId(pub String);

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    Draft,
    PendingHodReview,
    RejectedByHod,
    PendingGmReview,
    RejectedByGm,
    Approved,
    Cancelled,
}

impl RequestState {
    pub const ALL: [RequestState; 7] = [
        Self::Draft,
        Self::PendingHodReview,
        Self::RejectedByHod,
        Self::PendingGmReview,
        Self::RejectedByGm,
        Self::Approved,
        Self::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::PendingHodReview => "pending_hod_review",
            Self::RejectedByHod => "rejected_by_hod",
            Self::PendingGmReview => "pending_gm_review",
            Self::RejectedByGm => "rejected_by_gm",
            Self::Approved => "approved",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "draft" => Some(Self::Draft),
            "pending_hod_review" => Some(Self::PendingHodReview),
            "rejected_by_hod" => Some(Self::RejectedByHod),
            "pending_gm_review" => Some(Self::PendingGmReview),
            "rejected_by_gm" => Some(Self::RejectedByGm),
            "approved" => Some(Self::Approved),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Approved | Self::Cancelled)
    }

    /// Core fields may only be mutated in these states.
    pub fn is_editable(&self) -> bool {
        matches!(self, Self::Draft | Self::RejectedByHod | Self::RejectedByGm)
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, Self::RejectedByHod | Self::RejectedByGm)
    }

    /// The role expected to act next. Terminal states have none.
    pub fn current_approver_role(&self) -> Option<ActorRole> {
        match self {
            Self::PendingHodReview => Some(ActorRole::Hod),
            Self::PendingGmReview => Some(ActorRole::Gm),
            Self::Draft | Self::RejectedByHod | Self::RejectedByGm => Some(ActorRole::Requester),
            Self::Approved | Self::Cancelled => None,
        }
    }
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub id: RequestId,
    pub requester_id: RequesterId,
    pub item_description: String,
    pub quantity: u32,
    pub reason: Option<String>,
    pub department: Option<String>,
    pub priority: Priority,
    pub state: RequestState,
    pub cycle: u32,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Request {
    pub fn current_approver_role(&self) -> Option<ActorRole> {
        self.state.current_approver_role()
    }

    pub fn fields(&self) -> RequestFields {
        RequestFields {
            item_description: self.item_description.clone(),
            quantity: self.quantity,
            reason: self.reason.clone(),
            department: self.department.clone(),
            priority: self.priority,
        }
    }

    /// Applies an already validated patch. Callers check editability first.
    pub(crate) fn apply_patch(&mut self, patch: ValidatedPatch) {
        if let Some(item_description) = patch.item_description {
            self.item_description = item_description;
        }
        if let Some(quantity) = patch.quantity {
            self.quantity = quantity;
        }
        if let Some(reason) = patch.reason {
            self.reason = reason;
        }
        if let Some(department) = patch.department {
            self.department = department;
        }
        if let Some(priority) = patch.priority {
            self.priority = priority;
        }
    }
}

/// The editable subset of a request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestFields {
    pub item_description: String,
    pub quantity: u32,
    pub reason: Option<String>,
    pub department: Option<String>,
    pub priority: Priority,
}

/// Caller-supplied input for `create`. Missing fields are reported as validation errors.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestDraft {
    pub requester_id: String,
    #[serde(default)]
    pub item_description: Option<String>,
    #[serde(default)]
    pub quantity: Option<i64>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub department: Option<String>,
    #[serde(default)]
    pub priority: Option<Priority>,
}

/// Partial update of the editable fields. `Some("")` clears an optional text field.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestPatch {
    #[serde(default)]
    pub item_description: Option<String>,
    #[serde(default)]
    pub quantity: Option<i64>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub department: Option<String>,
    #[serde(default)]
    pub priority: Option<Priority>,
}

impl RequestPatch {
    pub fn is_empty(&self) -> bool {
        self.item_description.is_none()
            && self.quantity.is_none()
            && self.reason.is_none()
            && self.department.is_none()
            && self.priority.is_none()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct ValidatedPatch {
    item_description: Option<String>,
    quantity: Option<u32>,
    reason: Option<Option<String>>,
    department: Option<Option<String>>,
    priority: Option<Priority>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestFilter {
    #[serde(default)]
    pub requester_id: Option<RequesterId>,
    #[serde(default)]
    pub state: Option<RequestState>,
    #[serde(default)]
    pub department: Option<String>,
    #[serde(default)]
    pub limit: Option<u32>,
    #[serde(default)]
    pub offset: Option<u32>,
}

impl RequestFilter {
    pub fn matches(&self, request: &Request) -> bool {
        if let Some(requester_id) = &self.requester_id {
            if &request.requester_id != requester_id {
                return false;
            }
        }
        if let Some(state) = self.state {
            if request.state != state {
                return false;
            }
        }
        if let Some(department) = &self.department {
            if request.department.as_deref() != Some(department.as_str()) {
                return false;
            }
        }
        true
    }
}

pub(crate) fn validate_draft(
    draft: RequestDraft,
) -> Result<(RequesterId, RequestFields), WorkflowError> {
    let requester_id = draft.requester_id.trim();
    if requester_id.is_empty() {
        return Err(WorkflowError::validation(None, "requester_id", "requester id is required"));
    }

    let item_description = match draft.item_description {
        Some(value) => validate_item_description(None, &value)?,
        None => {
            return Err(WorkflowError::validation(
                None,
                "item_description",
                "item description is required",
            ))
        }
    };
    let quantity = match draft.quantity {
        Some(value) => validate_quantity(None, value)?,
        None => return Err(WorkflowError::validation(None, "quantity", "quantity is required")),
    };

    Ok((
        RequesterId(requester_id.to_string()),
        RequestFields {
            item_description,
            quantity,
            reason: normalize_optional(draft.reason),
            department: normalize_optional(draft.department),
            priority: draft.priority.unwrap_or_default(),
        },
    ))
}

pub(crate) fn validate_patch(
    request_id: &RequestId,
    patch: RequestPatch,
) -> Result<ValidatedPatch, WorkflowError> {
    let item_description = patch
        .item_description
        .map(|value| validate_item_description(Some(request_id), &value))
        .transpose()?;
    let quantity = patch.quantity.map(|value| validate_quantity(Some(request_id), value)).transpose()?;

    Ok(ValidatedPatch {
        item_description,
        quantity,
        reason: patch.reason.map(|value| normalize_optional(Some(value))),
        department: patch.department.map(|value| normalize_optional(Some(value))),
        priority: patch.priority,
    })
}

fn validate_item_description(
    request_id: Option<&RequestId>,
    value: &str,
) -> Result<String, WorkflowError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(WorkflowError::validation(
            request_id.cloned(),
            "item_description",
            "item description must not be empty",
        ));
    }
    Ok(trimmed.to_string())
}

fn validate_quantity(request_id: Option<&RequestId>, value: i64) -> Result<u32, WorkflowError> {
    if value < 1 {
        return Err(WorkflowError::validation(
            request_id.cloned(),
            "quantity",
            format!("quantity must be a positive integer, got {value}"),
        ));
    }
    u32::try_from(value).map_err(|_| {
        WorkflowError::validation(
            request_id.cloned(),
            "quantity",
            format!("quantity {value} exceeds the supported maximum of {}", u32::MAX),
        )
    })
}

fn normalize_optional(value: Option<String>) -> Option<String> {
    value.map(|value| value.trim().to_string()).filter(|value| !value.is_empty())
}
