use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::domain::approval::ActorRole;
use crate::domain::request::{RequestId, RequestState};
use crate::flows::WorkflowAction;

/// Emitted after every committed transition. Delivery belongs to the dispatcher.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationEvent {
    pub event_id: String,
    pub request_id: RequestId,
    pub action: WorkflowAction,
    pub actor_role: ActorRole,
    pub resulting_state: RequestState,
    pub timestamp: DateTime<Utc>,
}

impl NotificationEvent {
    pub fn new(
        request_id: RequestId,
        action: WorkflowAction,
        actor_role: ActorRole,
        resulting_state: RequestState,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4().to_string(),
            request_id,
            action,
            actor_role,
            resulting_state,
            timestamp,
        }
    }

    /// Role that should be told about the new state, if anyone must act.
    pub fn next_actor(&self) -> Option<ActorRole> {
        self.resulting_state.current_approver_role()
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("notification dispatch failed: {0}")]
pub struct DispatchError(pub String);

pub trait NotificationDispatcher: Send + Sync {
    fn dispatch(&self, event: &NotificationEvent) -> Result<(), DispatchError>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NoopNotificationDispatcher;

impl NotificationDispatcher for NoopNotificationDispatcher {
    fn dispatch(&self, _event: &NotificationEvent) -> Result<(), DispatchError> {
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct InMemoryNotificationDispatcher {
    events: Arc<Mutex<Vec<NotificationEvent>>>,
}

impl InMemoryNotificationDispatcher {
    pub fn events(&self) -> Vec<NotificationEvent> {
        match self.events.lock() {
            Ok(events) => events.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl NotificationDispatcher for InMemoryNotificationDispatcher {
    fn dispatch(&self, event: &NotificationEvent) -> Result<(), DispatchError> {
        match self.events.lock() {
            Ok(mut events) => events.push(event.clone()),
            Err(poisoned) => poisoned.into_inner().push(event.clone()),
        }
        Ok(())
    }
}

impl<T> NotificationDispatcher for Arc<T>
where
    T: NotificationDispatcher + ?Sized,
{
    fn dispatch(&self, event: &NotificationEvent) -> Result<(), DispatchError> {
        (**self).dispatch(event)
    }
}
