use serde::Serialize;
use thiserror::Error;

use crate::domain::approval::ActorRole;
use crate::domain::request::{RequestId, RequestState};
use crate::flows::{FlowTransitionError, WorkflowAction};
use crate::store::StorageError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    NotFound,
    InvalidState,
    ForbiddenTransition,
    ConcurrencyConflict,
    Persistence,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::NotFound => "not_found",
            Self::InvalidState => "invalid_state",
            Self::ForbiddenTransition => "forbidden_transition",
            Self::ConcurrencyConflict => "concurrency_conflict",
            Self::Persistence => "persistence",
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum WorkflowError {
    #[error("invalid `{field}`: {message}")]
    Validation { request_id: Option<RequestId>, field: String, message: String },
    #[error("request {request_id} was not found")]
    NotFound { request_id: RequestId },
    #[error("request {request_id} is {state}; `{operation}` is not allowed")]
    InvalidState { request_id: RequestId, state: RequestState, operation: String },
    #[error("request {request_id}: `{action}` requires role {required_role}, got {actor_role}")]
    ForbiddenTransition {
        request_id: RequestId,
        action: WorkflowAction,
        actor_role: ActorRole,
        required_role: ActorRole,
    },
    #[error("request {request_id} changed concurrently (expected version {expected_version})")]
    ConcurrencyConflict { request_id: RequestId, expected_version: u64 },
    #[error("persistence failure: {0}")]
    Persistence(String),
}

impl WorkflowError {
    pub fn validation(
        request_id: Option<RequestId>,
        field: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Validation { request_id, field: field.into(), message: message.into() }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation { .. } => ErrorKind::Validation,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::InvalidState { .. } => ErrorKind::InvalidState,
            Self::ForbiddenTransition { .. } => ErrorKind::ForbiddenTransition,
            Self::ConcurrencyConflict { .. } => ErrorKind::ConcurrencyConflict,
            Self::Persistence(_) => ErrorKind::Persistence,
        }
    }

    pub fn request_id(&self) -> Option<&RequestId> {
        match self {
            Self::Validation { request_id, .. } => request_id.as_ref(),
            Self::NotFound { request_id }
            | Self::InvalidState { request_id, .. }
            | Self::ForbiddenTransition { request_id, .. }
            | Self::ConcurrencyConflict { request_id, .. } => Some(request_id),
            Self::Persistence(_) => None,
        }
    }

    pub fn field(&self) -> Option<&str> {
        match self {
            Self::Validation { field, .. } => Some(field),
            _ => None,
        }
    }

    /// The action or operation the caller attempted, when one applies.
    pub fn operation(&self) -> Option<String> {
        match self {
            Self::InvalidState { operation, .. } => Some(operation.clone()),
            Self::ForbiddenTransition { action, .. } => Some(action.as_str().to_string()),
            _ => None,
        }
    }

    pub(crate) fn from_flow(request_id: &RequestId, error: FlowTransitionError) -> Self {
        match error {
            FlowTransitionError::ForbiddenRole { action, actor_role, required_role } => {
                Self::ForbiddenTransition {
                    request_id: request_id.clone(),
                    action,
                    actor_role,
                    required_role,
                }
            }
            FlowTransitionError::InvalidTransition { state, action } => Self::InvalidState {
                request_id: request_id.clone(),
                state,
                operation: action.as_str().to_string(),
            },
        }
    }
}

impl From<StorageError> for WorkflowError {
    fn from(value: StorageError) -> Self {
        match value {
            StorageError::NotFound { request_id } => Self::NotFound { request_id },
            StorageError::VersionConflict { request_id, expected_version } => {
                Self::ConcurrencyConflict { request_id, expected_version }
            }
            StorageError::AlreadyExists { request_id } => {
                Self::Persistence(format!("request {request_id} already exists"))
            }
            StorageError::Backend(message) => Self::Persistence(message),
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum InterfaceError {
    #[error("bad request: {message}")]
    BadRequest { message: String, correlation_id: String },
    #[error("not found: {message}")]
    NotFound { message: String, correlation_id: String },
    #[error("forbidden: {message}")]
    Forbidden { message: String, correlation_id: String },
    #[error("conflict: {message}")]
    Conflict { message: String, correlation_id: String },
    #[error("service unavailable: {message}")]
    ServiceUnavailable { message: String, correlation_id: String },
}

impl InterfaceError {
    pub fn from_workflow(error: &WorkflowError, correlation_id: impl Into<String>) -> Self {
        let message = error.to_string();
        let correlation_id = correlation_id.into();
        match error.kind() {
            ErrorKind::Validation => Self::BadRequest { message, correlation_id },
            ErrorKind::NotFound => Self::NotFound { message, correlation_id },
            ErrorKind::ForbiddenTransition => Self::Forbidden { message, correlation_id },
            ErrorKind::InvalidState | ErrorKind::ConcurrencyConflict => {
                Self::Conflict { message, correlation_id }
            }
            ErrorKind::Persistence => Self::ServiceUnavailable { message, correlation_id },
        }
    }

    pub fn correlation_id(&self) -> &str {
        match self {
            Self::BadRequest { correlation_id, .. }
            | Self::NotFound { correlation_id, .. }
            | Self::Forbidden { correlation_id, .. }
            | Self::Conflict { correlation_id, .. }
            | Self::ServiceUnavailable { correlation_id, .. } => correlation_id,
        }
    }

    pub fn user_message(&self) -> &'static str {
        match self {
            Self::BadRequest { .. } => "The request could not be processed. Check inputs and try again.",
            Self::NotFound { .. } => "The requested record does not exist.",
            Self::Forbidden { .. } => "Your role is not allowed to perform this action.",
            Self::Conflict { .. } => {
                "The request is not in a state that allows this action. Refresh and try again."
            }
            Self::ServiceUnavailable { .. } => {
                "The service is temporarily unavailable. Please retry shortly."
            }
        }
    }
}
