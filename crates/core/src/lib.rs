pub mod config;
pub mod domain;
pub mod errors;
pub mod flows;
pub mod ledger;
mod locks;
pub mod notifications;
pub mod resubmission;
pub mod service;
pub mod store;

pub use domain::approval::{ActorRole, ApprovalDecision, DecisionId, DecisionOutcome};
pub use domain::history::StatusHistoryEntry;
pub use domain::request::{
    Priority, Request, RequestDraft, RequestFields, RequestFilter, RequestId, RequestPatch,
    RequestState, RequesterId,
};
pub use errors::{ErrorKind, InterfaceError, WorkflowError};
pub use flows::{FlowEngine, TransitionOutcome, WorkflowAction};
pub use ledger::LedgerVerification;
pub use notifications::{
    DispatchError, InMemoryNotificationDispatcher, NoopNotificationDispatcher,
    NotificationDispatcher, NotificationEvent,
};
pub use resubmission::EditableDraft;
pub use service::{ActionOutcome, WorkflowService, WorkflowSettings};
pub use store::{InMemoryRequestStorage, RequestStorage, StorageError, TransitionCommit};
