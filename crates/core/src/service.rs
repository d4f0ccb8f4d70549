//! Approval step engine and request entity store API.
//!
//! Every state change goes through [`WorkflowService::apply_action`] (or the
//! resubmission path, which shares its commit). A transition validates against
//! the transition table, then writes the request, its history entry, and any
//! approval decision in one storage commit before a notification is emitted.

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::WorkflowConfig;
use crate::domain::approval::{ActorRole, ApprovalDecision, DecisionId};
use crate::domain::history::StatusHistoryEntry;
use crate::domain::request::{
    validate_draft, validate_patch, Request, RequestDraft, RequestFilter, RequestId, RequestPatch,
    ValidatedPatch,
};
use crate::errors::WorkflowError;
use crate::flows::{ApprovalChainFlow, FlowEngine, WorkflowAction};
use crate::ledger::{self, LedgerVerification};
use crate::locks::RequestLocks;
use crate::notifications::{NotificationDispatcher, NotificationEvent};
use crate::store::{RequestStorage, StorageError, TransitionCommit};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkflowSettings {
    /// Reload-and-retry attempts after a storage version conflict.
    pub max_conflict_retries: u32,
    pub notifications_enabled: bool,
}

impl Default for WorkflowSettings {
    fn default() -> Self {
        Self { max_conflict_retries: 3, notifications_enabled: true }
    }
}

impl From<&WorkflowConfig> for WorkflowSettings {
    fn from(config: &WorkflowConfig) -> Self {
        Self {
            max_conflict_retries: config.max_conflict_retries,
            notifications_enabled: config.notifications_enabled,
        }
    }
}

/// Result of a committed transition.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionOutcome {
    pub request: Request,
    pub entry: StatusHistoryEntry,
    pub decision: Option<ApprovalDecision>,
    pub notification: NotificationEvent,
}

pub struct WorkflowService<S, N> {
    storage: S,
    dispatcher: N,
    flow: FlowEngine<ApprovalChainFlow>,
    locks: RequestLocks,
    settings: WorkflowSettings,
}

impl<S, N> WorkflowService<S, N>
where
    S: RequestStorage,
    N: NotificationDispatcher,
{
    pub fn new(storage: S, dispatcher: N) -> Self {
        Self {
            storage,
            dispatcher,
            flow: FlowEngine::default(),
            locks: RequestLocks::default(),
            settings: WorkflowSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: WorkflowSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub async fn create(&self, draft: RequestDraft) -> Result<Request, WorkflowError> {
        let (requester_id, fields) = validate_draft(draft)?;
        let now = timestamp();
        let request = Request {
            id: RequestId(Uuid::new_v4().to_string()),
            requester_id,
            item_description: fields.item_description,
            quantity: fields.quantity,
            reason: fields.reason,
            department: fields.department,
            priority: fields.priority,
            state: self.flow.initial_state(),
            cycle: 0,
            version: 1,
            created_at: now,
            updated_at: now,
        };

        self.storage.save(request.clone(), None).await?;
        info!(
            event_name = "workflow.request.created",
            request_id = %request.id,
            requester_id = %request.requester_id.0,
            quantity = request.quantity,
            "request created in draft"
        );
        Ok(request)
    }

    pub async fn get(&self, id: &RequestId) -> Result<Request, WorkflowError> {
        self.storage
            .load(id)
            .await?
            .ok_or_else(|| WorkflowError::NotFound { request_id: id.clone() })
    }

    /// Edits core fields. Only Draft and rejected requests are editable.
    pub async fn update(
        &self,
        id: &RequestId,
        patch: RequestPatch,
    ) -> Result<Request, WorkflowError> {
        let empty = patch.is_empty();
        let validated = validate_patch(id, patch)?;
        let _guard = self.locks.acquire(id).await;

        let current = self.get(id).await?;
        if !current.state.is_editable() {
            return Err(WorkflowError::InvalidState {
                request_id: id.clone(),
                state: current.state,
                operation: "update".to_string(),
            });
        }
        if empty {
            return Ok(current);
        }

        let mut next = current.clone();
        next.apply_patch(validated);
        next.version = current.version + 1;
        next.updated_at = timestamp();
        self.storage.save(next.clone(), Some(current.version)).await?;

        info!(
            event_name = "workflow.request.updated",
            request_id = %id,
            version = next.version,
            "request fields updated"
        );
        Ok(next)
    }

    pub async fn list(&self, filter: &RequestFilter) -> Result<Vec<Request>, WorkflowError> {
        Ok(self.storage.list(filter).await?)
    }

    pub async fn apply_action(
        &self,
        id: &RequestId,
        action: WorkflowAction,
        actor_role: ActorRole,
        comment: Option<String>,
    ) -> Result<ActionOutcome, WorkflowError> {
        self.commit_transition(id, action, actor_role, comment, None).await
    }

    /// Ascending by sequence number.
    pub async fn entries_for(
        &self,
        id: &RequestId,
    ) -> Result<Vec<StatusHistoryEntry>, WorkflowError> {
        self.get(id).await?;
        Ok(self.storage.history(id).await?)
    }

    /// Every decision across all cycles, oldest first.
    pub async fn decisions_for(
        &self,
        id: &RequestId,
    ) -> Result<Vec<ApprovalDecision>, WorkflowError> {
        self.get(id).await?;
        Ok(self.storage.decisions(id).await?)
    }

    pub async fn allowed_actions(
        &self,
        id: &RequestId,
        role: ActorRole,
    ) -> Result<Vec<WorkflowAction>, WorkflowError> {
        let request = self.get(id).await?;
        Ok(self.flow.allowed_actions(request.state, role))
    }

    /// Request and ledger are read under the request's lock so a concurrent
    /// commit cannot land between the two reads.
    pub async fn verify_history(&self, id: &RequestId) -> Result<LedgerVerification, WorkflowError> {
        let _guard = self.locks.acquire(id).await;
        let request = self.get(id).await?;
        let entries = self.storage.history(id).await?;
        Ok(ledger::verify_history(id, &entries, Some(request.state)))
    }

    pub(crate) async fn commit_transition(
        &self,
        id: &RequestId,
        action: WorkflowAction,
        actor_role: ActorRole,
        comment: Option<String>,
        patch: Option<ValidatedPatch>,
    ) -> Result<ActionOutcome, WorkflowError> {
        let comment = comment.map(|value| value.trim().to_string()).filter(|value| !value.is_empty());
        let guard = self.locks.acquire(id).await;
        let mut attempt = 0u32;

        let (request, entry, decision) = loop {
            let current = self.get(id).await?;
            let outcome = self
                .flow
                .apply(current.state, action, actor_role)
                .map_err(|error| WorkflowError::from_flow(id, error))?;
            if action.requires_comment() && comment.is_none() {
                return Err(WorkflowError::validation(
                    Some(id.clone()),
                    "comment",
                    format!("a non-empty comment is required for {action}"),
                ));
            }

            let history = self.storage.history(id).await?;
            let now = timestamp();
            let mut next = current.clone();
            if let Some(patch) = patch.clone() {
                next.apply_patch(patch);
            }
            next.state = outcome.to;
            if outcome.opens_cycle() {
                next.cycle = current.cycle.saturating_add(1);
            }
            next.version = current.version + 1;
            next.updated_at = now;

            let entry =
                ledger::next_entry(history.last(), id, &outcome, comment.clone(), next.cycle, now);
            let decision = action.decision_outcome().map(|outcome| ApprovalDecision {
                id: DecisionId(Uuid::new_v4().to_string()),
                request_id: id.clone(),
                actor_role,
                outcome,
                comment: comment.clone(),
                cycle: next.cycle,
                decided_at: now,
            });

            let commit = TransitionCommit {
                request: next.clone(),
                expected_version: current.version,
                entry: entry.clone(),
                decision: decision.clone(),
            };
            match self.storage.append_atomic(commit).await {
                Ok(()) => break (next, entry, decision),
                Err(StorageError::VersionConflict { expected_version, .. })
                    if attempt < self.settings.max_conflict_retries =>
                {
                    attempt += 1;
                    warn!(
                        event_name = "workflow.transition.version_conflict",
                        request_id = %id,
                        action = %action,
                        expected_version,
                        attempt,
                        "concurrent modification detected, retrying"
                    );
                }
                Err(error) => return Err(error.into()),
            }
        };
        drop(guard);

        info!(
            event_name = "workflow.transition.applied",
            request_id = %id,
            action = %action,
            actor_role = %actor_role,
            from = %entry.from_state,
            to = %entry.to_state,
            sequence_number = entry.sequence_number,
            cycle = request.cycle,
            "request transition committed"
        );

        let notification =
            NotificationEvent::new(id.clone(), action, actor_role, request.state, entry.timestamp);
        self.notify(&notification);

        Ok(ActionOutcome { request, entry, decision, notification })
    }

    fn notify(&self, event: &NotificationEvent) {
        if !self.settings.notifications_enabled {
            return;
        }
        if let Err(error) = self.dispatcher.dispatch(event) {
            warn!(
                event_name = "workflow.notification.dispatch_failed",
                request_id = %event.request_id,
                action = %event.action,
                error = %error,
                "notification dispatch failed; transition stays committed"
            );
        }
    }
}

/// Persisted timestamps carry microsecond precision, so values are truncated
/// before they are hashed or stored.
fn timestamp() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::{mpsc, Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;

    use super::{WorkflowService, WorkflowSettings};
    use crate::domain::approval::{ActorRole, ApprovalDecision, DecisionOutcome};
    use crate::domain::history::StatusHistoryEntry;
    use crate::domain::request::{
        Request, RequestDraft, RequestFilter, RequestId, RequestPatch, RequestState, RequesterId,
    };
    use crate::errors::{ErrorKind, WorkflowError};
    use crate::flows::WorkflowAction;
    use crate::ledger;
    use crate::notifications::{
        DispatchError, InMemoryNotificationDispatcher, NotificationDispatcher, NotificationEvent,
    };
    use crate::store::{InMemoryRequestStorage, RequestStorage, StorageError, TransitionCommit};

    type MemoryService = WorkflowService<InMemoryRequestStorage, InMemoryNotificationDispatcher>;

    fn service() -> (MemoryService, InMemoryNotificationDispatcher) {
        let dispatcher = InMemoryNotificationDispatcher::default();
        (WorkflowService::new(InMemoryRequestStorage::default(), dispatcher.clone()), dispatcher)
    }

    fn torque_wrench() -> RequestDraft {
        RequestDraft {
            requester_id: "emp-042".to_string(),
            item_description: Some("Torque Wrench".to_string()),
            quantity: Some(2),
            department: Some("Maintenance".to_string()),
            ..RequestDraft::default()
        }
    }

    async fn submitted<S, N>(service: &WorkflowService<S, N>) -> Request
    where
        S: RequestStorage,
        N: NotificationDispatcher,
    {
        let request = service.create(torque_wrench()).await.expect("create");
        service
            .apply_action(&request.id, WorkflowAction::Submit, ActorRole::Requester, None)
            .await
            .expect("submit")
            .request
    }

    #[tokio::test]
    async fn create_starts_in_draft_without_history() {
        let (service, _) = service();
        let request = service.create(torque_wrench()).await.expect("create");

        assert_eq!(request.state, RequestState::Draft);
        assert_eq!(request.cycle, 0);
        assert_eq!(request.version, 1);
        assert_eq!(request.current_approver_role(), Some(ActorRole::Requester));
        assert!(service.entries_for(&request.id).await.expect("history").is_empty());
    }

    #[tokio::test]
    async fn create_rejects_missing_quantity() {
        let (service, _) = service();
        let error = service
            .create(RequestDraft { quantity: None, ..torque_wrench() })
            .await
            .expect_err("missing quantity");
        assert_eq!(error.kind(), ErrorKind::Validation);
        assert_eq!(error.field(), Some("quantity"));
    }

    #[tokio::test]
    async fn get_unknown_request_is_not_found() {
        let (service, _) = service();
        let error = service.get(&RequestId("REQ-missing".to_string())).await.expect_err("missing");
        assert!(matches!(error, WorkflowError::NotFound { .. }));

        let error = service
            .apply_action(
                &RequestId("REQ-missing".to_string()),
                WorkflowAction::Submit,
                ActorRole::Requester,
                None,
            )
            .await
            .expect_err("missing");
        assert_eq!(error.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn update_is_refused_once_under_review() {
        let (service, _) = service();
        let request = service.create(torque_wrench()).await.expect("create");
        let updated = service
            .update(&request.id, RequestPatch { quantity: Some(3), ..RequestPatch::default() })
            .await
            .expect("draft is editable");
        assert_eq!(updated.quantity, 3);
        assert_eq!(updated.version, 2);

        service
            .apply_action(&request.id, WorkflowAction::Submit, ActorRole::Requester, None)
            .await
            .expect("submit");
        let error = service
            .update(&request.id, RequestPatch { quantity: Some(1), ..RequestPatch::default() })
            .await
            .expect_err("pending review is not editable");
        assert!(matches!(
            error,
            WorkflowError::InvalidState { state: RequestState::PendingHodReview, .. }
        ));
    }

    #[tokio::test]
    async fn wrong_role_is_forbidden_and_leaves_no_entry() {
        let (service, dispatcher) = service();
        let request = submitted(&service).await;

        for (action, role) in [
            (WorkflowAction::HodApprove, ActorRole::Gm),
            (WorkflowAction::HodApprove, ActorRole::Requester),
            (WorkflowAction::GmApprove, ActorRole::Hod),
            (WorkflowAction::Cancel, ActorRole::Hod),
        ] {
            let error = service
                .apply_action(&request.id, action, role, Some("note".to_string()))
                .await
                .expect_err("forbidden");
            assert_eq!(error.kind(), ErrorKind::ForbiddenTransition);
            assert_eq!(error.request_id(), Some(&request.id));
        }

        assert_eq!(service.entries_for(&request.id).await.expect("history").len(), 1);
        assert_eq!(dispatcher.events().len(), 1);
    }

    #[tokio::test]
    async fn rejection_requires_a_non_empty_comment() {
        let (service, _) = service();
        let request = submitted(&service).await;

        for comment in [None, Some(String::new()), Some("   ".to_string())] {
            let error = service
                .apply_action(&request.id, WorkflowAction::HodReject, ActorRole::Hod, comment)
                .await
                .expect_err("comment required");
            assert_eq!(error.field(), Some("comment"));
        }

        let stored = service.get(&request.id).await.expect("get");
        assert_eq!(stored.state, RequestState::PendingHodReview);
        assert_eq!(service.entries_for(&request.id).await.expect("history").len(), 1);
    }

    #[tokio::test]
    async fn torque_wrench_scenario_reaches_approved_with_five_entries() {
        let (service, dispatcher) = service();
        let request = service.create(torque_wrench()).await.expect("create");
        let id = request.id.clone();

        let submitted = service
            .apply_action(&id, WorkflowAction::Submit, ActorRole::Requester, None)
            .await
            .expect("submit");
        assert_eq!(submitted.request.state, RequestState::PendingHodReview);

        let rejected = service
            .apply_action(
                &id,
                WorkflowAction::HodReject,
                ActorRole::Hod,
                Some("over budget".to_string()),
            )
            .await
            .expect("hod reject");
        assert_eq!(rejected.request.state, RequestState::RejectedByHod);
        assert_eq!(service.entries_for(&id).await.expect("history").len(), 2);

        let resubmitted = service
            .submit_resubmission(&id, RequestPatch { quantity: Some(1), ..RequestPatch::default() })
            .await
            .expect("resubmit");
        assert_eq!(resubmitted.request.state, RequestState::PendingHodReview);
        assert_eq!(resubmitted.request.quantity, 1);
        assert_eq!(resubmitted.request.cycle, 2);
        assert_eq!(service.entries_for(&id).await.expect("history").len(), 3);
        let decisions = service.decisions_for(&id).await.expect("decisions");
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].comment.as_deref(), Some("over budget"));

        service
            .apply_action(&id, WorkflowAction::HodApprove, ActorRole::Hod, None)
            .await
            .expect("hod approve");
        let approved = service
            .apply_action(&id, WorkflowAction::GmApprove, ActorRole::Gm, None)
            .await
            .expect("gm approve");
        assert_eq!(approved.request.state, RequestState::Approved);
        assert_eq!(approved.request.current_approver_role(), None);

        let entries = service.entries_for(&id).await.expect("history");
        let actions: Vec<_> = entries.iter().map(|entry| entry.action).collect();
        assert_eq!(
            actions,
            vec![
                WorkflowAction::Submit,
                WorkflowAction::HodReject,
                WorkflowAction::Resubmit,
                WorkflowAction::HodApprove,
                WorkflowAction::GmApprove,
            ]
        );
        let sequence: Vec<_> = entries.iter().map(|entry| entry.sequence_number).collect();
        assert_eq!(sequence, vec![1, 2, 3, 4, 5]);
        assert_eq!(ledger::replay_state(&entries), Ok(RequestState::Approved));

        let decisions: Vec<(ActorRole, DecisionOutcome, u32)> = service
            .decisions_for(&id)
            .await
            .expect("decisions")
            .into_iter()
            .map(|d: ApprovalDecision| (d.actor_role, d.outcome, d.cycle))
            .collect();
        assert_eq!(
            decisions,
            vec![
                (ActorRole::Hod, DecisionOutcome::Rejected, 1),
                (ActorRole::Hod, DecisionOutcome::Approved, 2),
                (ActorRole::Gm, DecisionOutcome::Approved, 2),
            ]
        );

        assert!(service.verify_history(&id).await.expect("verify").valid);
        assert_eq!(dispatcher.events().len(), 5);
        assert_eq!(dispatcher.events()[4].resulting_state, RequestState::Approved);
    }

    #[tokio::test]
    async fn cancel_from_gm_review_blocks_later_approval() {
        let (service, _) = service();
        let request = submitted(&service).await;
        service
            .apply_action(&request.id, WorkflowAction::HodApprove, ActorRole::Hod, None)
            .await
            .expect("hod approve");

        let cancelled = service
            .apply_action(&request.id, WorkflowAction::Cancel, ActorRole::Requester, None)
            .await
            .expect("cancel");
        assert_eq!(cancelled.request.state, RequestState::Cancelled);
        assert!(cancelled.decision.is_none());

        let error = service
            .apply_action(&request.id, WorkflowAction::GmApprove, ActorRole::Gm, None)
            .await
            .expect_err("cancelled is terminal");
        assert!(matches!(error, WorkflowError::InvalidState { state: RequestState::Cancelled, .. }));
        assert_eq!(service.entries_for(&request.id).await.expect("history").len(), 3);
    }

    #[tokio::test]
    async fn allowed_actions_follow_current_state() {
        let (service, _) = service();
        let request = submitted(&service).await;

        assert_eq!(
            service.allowed_actions(&request.id, ActorRole::Hod).await.expect("hod"),
            vec![WorkflowAction::HodApprove, WorkflowAction::HodReject]
        );
        assert_eq!(
            service.allowed_actions(&request.id, ActorRole::Requester).await.expect("requester"),
            vec![WorkflowAction::Cancel]
        );
        assert!(service.allowed_actions(&request.id, ActorRole::Gm).await.expect("gm").is_empty());
    }

    #[tokio::test]
    async fn concurrent_actions_on_one_request_never_share_a_sequence_number() {
        let (service, _) = service();
        let service = Arc::new(service);
        let request = service.create(torque_wrench()).await.expect("create");

        let mut handles = Vec::new();
        for _ in 0..16 {
            let service = Arc::clone(&service);
            let id = request.id.clone();
            handles.push(tokio::spawn(async move {
                service.apply_action(&id, WorkflowAction::Submit, ActorRole::Requester, None).await
            }));
        }

        let mut successes = 0;
        for handle in handles {
            match handle.await.expect("task") {
                Ok(_) => successes += 1,
                Err(error) => assert_eq!(error.kind(), ErrorKind::InvalidState),
            }
        }
        assert_eq!(successes, 1);

        let entries = service.entries_for(&request.id).await.expect("history");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].sequence_number, 1);
    }

    #[tokio::test]
    async fn concurrent_round_trips_keep_the_ledger_gap_free() {
        let (service, _) = service();
        let service = Arc::new(service);
        let request = submitted(&service).await;

        let hod = {
            let service = Arc::clone(&service);
            let id = request.id.clone();
            tokio::spawn(async move {
                service.apply_action(&id, WorkflowAction::HodApprove, ActorRole::Hod, None).await
            })
        };
        let cancel = {
            let service = Arc::clone(&service);
            let id = request.id.clone();
            tokio::spawn(async move {
                service.apply_action(&id, WorkflowAction::Cancel, ActorRole::Requester, None).await
            })
        };
        let results = [hod.await.expect("hod task"), cancel.await.expect("cancel task")];
        let committed = results.iter().filter(|result| result.is_ok()).count();

        let entries = service.entries_for(&request.id).await.expect("history");
        assert_eq!(entries.len(), 1 + committed);
        let sequence: Vec<_> = entries.iter().map(|entry| entry.sequence_number).collect();
        let expected: Vec<u64> = (1..=entries.len() as u64).collect();
        assert_eq!(sequence, expected);
        assert!(service.verify_history(&request.id).await.expect("verify").valid);
    }

    struct FailingDispatcher;

    impl NotificationDispatcher for FailingDispatcher {
        fn dispatch(&self, _event: &NotificationEvent) -> Result<(), DispatchError> {
            Err(DispatchError("push gateway unreachable".to_string()))
        }
    }

    #[tokio::test]
    async fn dispatch_failure_does_not_roll_back_the_transition() {
        let service = WorkflowService::new(InMemoryRequestStorage::default(), FailingDispatcher);
        let request = submitted(&service).await;

        assert_eq!(request.state, RequestState::PendingHodReview);
        let stored = service.get(&request.id).await.expect("get");
        assert_eq!(stored.state, RequestState::PendingHodReview);
        assert_eq!(service.entries_for(&request.id).await.expect("history").len(), 1);
    }

    #[tokio::test]
    async fn disabled_notifications_are_not_dispatched() {
        let dispatcher = InMemoryNotificationDispatcher::default();
        let service = WorkflowService::new(InMemoryRequestStorage::default(), dispatcher.clone())
            .with_settings(WorkflowSettings {
                notifications_enabled: false,
                ..WorkflowSettings::default()
            });
        submitted(&service).await;
        assert!(dispatcher.events().is_empty());
    }

    /// Blocks the first dispatch until the test opens the gate.
    struct GatedDispatcher {
        gate: Mutex<Option<mpsc::Receiver<()>>>,
        timed_out: AtomicBool,
    }

    impl NotificationDispatcher for GatedDispatcher {
        fn dispatch(&self, _event: &NotificationEvent) -> Result<(), DispatchError> {
            let gate = self.gate.lock().map(|mut gate| gate.take()).unwrap_or(None);
            if let Some(gate) = gate {
                if gate.recv_timeout(Duration::from_secs(2)).is_err() {
                    self.timed_out.store(true, Ordering::SeqCst);
                }
            }
            Ok(())
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn slow_dispatch_does_not_hold_the_request_lock() {
        let (open, gate) = mpsc::channel();
        let dispatcher =
            GatedDispatcher { gate: Mutex::new(Some(gate)), timed_out: AtomicBool::new(false) };
        let service = Arc::new(WorkflowService::new(InMemoryRequestStorage::default(), dispatcher));
        let request = service.create(torque_wrench()).await.expect("create");

        let submit = {
            let service = Arc::clone(&service);
            let id = request.id.clone();
            tokio::spawn(async move {
                service.apply_action(&id, WorkflowAction::Submit, ActorRole::Requester, None).await
            })
        };
        for _ in 0..100 {
            let state = service.get(&request.id).await.expect("get").state;
            if state == RequestState::PendingHodReview {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let approved = tokio::time::timeout(
            Duration::from_secs(1),
            service.apply_action(&request.id, WorkflowAction::HodApprove, ActorRole::Hod, None),
        )
        .await
        .expect("approval should not wait on the pending dispatch")
        .expect("hod approve");
        assert_eq!(approved.request.state, RequestState::PendingGmReview);

        open.send(()).expect("open gate");
        submit.await.expect("submit task").expect("submit");
        assert!(!service.dispatcher.timed_out.load(Ordering::SeqCst));
    }

    /// Delays `history` reads while `slow` is set.
    struct SlowHistoryStorage {
        inner: InMemoryRequestStorage,
        slow: AtomicBool,
    }

    #[async_trait]
    impl RequestStorage for SlowHistoryStorage {
        async fn save(
            &self,
            request: Request,
            expected_version: Option<u64>,
        ) -> Result<(), StorageError> {
            self.inner.save(request, expected_version).await
        }

        async fn load(&self, id: &RequestId) -> Result<Option<Request>, StorageError> {
            self.inner.load(id).await
        }

        async fn list(&self, filter: &RequestFilter) -> Result<Vec<Request>, StorageError> {
            self.inner.list(filter).await
        }

        async fn append_atomic(&self, commit: TransitionCommit) -> Result<(), StorageError> {
            self.inner.append_atomic(commit).await
        }

        async fn history(&self, id: &RequestId) -> Result<Vec<StatusHistoryEntry>, StorageError> {
            if self.slow.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            self.inner.history(id).await
        }

        async fn decisions(
            &self,
            id: &RequestId,
        ) -> Result<Vec<ApprovalDecision>, StorageError> {
            self.inner.decisions(id).await
        }
    }

    #[tokio::test]
    async fn verification_is_not_torn_by_a_concurrent_commit() {
        let storage = SlowHistoryStorage {
            inner: InMemoryRequestStorage::default(),
            slow: AtomicBool::new(false),
        };
        let service =
            Arc::new(WorkflowService::new(storage, InMemoryNotificationDispatcher::default()));
        let request = service.create(torque_wrench()).await.expect("create");
        service.storage().slow.store(true, Ordering::SeqCst);

        let verifier = {
            let service = Arc::clone(&service);
            let id = request.id.clone();
            tokio::spawn(async move { service.verify_history(&id).await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        service
            .apply_action(&request.id, WorkflowAction::Submit, ActorRole::Requester, None)
            .await
            .expect("submit");

        let verification = verifier.await.expect("verifier task").expect("verify");
        assert!(verification.valid, "unexpected failure: {:?}", verification.failure_reason);
        assert!(service.verify_history(&request.id).await.expect("verify").valid);
    }

    /// Fails the first `conflicts` commits as if another writer got there first.
    struct ContendedStorage {
        inner: InMemoryRequestStorage,
        conflicts: AtomicU32,
    }

    #[async_trait]
    impl RequestStorage for ContendedStorage {
        async fn save(
            &self,
            request: Request,
            expected_version: Option<u64>,
        ) -> Result<(), StorageError> {
            self.inner.save(request, expected_version).await
        }

        async fn load(&self, id: &RequestId) -> Result<Option<Request>, StorageError> {
            self.inner.load(id).await
        }

        async fn list(&self, filter: &RequestFilter) -> Result<Vec<Request>, StorageError> {
            self.inner.list(filter).await
        }

        async fn append_atomic(&self, commit: TransitionCommit) -> Result<(), StorageError> {
            let remaining = self.conflicts.load(Ordering::SeqCst);
            if remaining > 0 {
                self.conflicts.store(remaining - 1, Ordering::SeqCst);
                return Err(StorageError::VersionConflict {
                    request_id: commit.request.id.clone(),
                    expected_version: commit.expected_version,
                });
            }
            self.inner.append_atomic(commit).await
        }

        async fn history(&self, id: &RequestId) -> Result<Vec<StatusHistoryEntry>, StorageError> {
            self.inner.history(id).await
        }

        async fn decisions(
            &self,
            id: &RequestId,
        ) -> Result<Vec<ApprovalDecision>, StorageError> {
            self.inner.decisions(id).await
        }
    }

    #[tokio::test]
    async fn version_conflicts_are_retried_then_surfaced() {
        let storage = ContendedStorage {
            inner: InMemoryRequestStorage::default(),
            conflicts: AtomicU32::new(2),
        };
        let service = WorkflowService::new(storage, InMemoryNotificationDispatcher::default());
        let request = submitted(&service).await;
        assert_eq!(request.state, RequestState::PendingHodReview);

        service.storage().conflicts.store(10, Ordering::SeqCst);
        let error = service
            .apply_action(&request.id, WorkflowAction::HodApprove, ActorRole::Hod, None)
            .await
            .expect_err("retries exhausted");
        assert_eq!(error.kind(), ErrorKind::ConcurrencyConflict);
        assert_eq!(service.entries_for(&request.id).await.expect("history").len(), 1);
    }

    #[tokio::test]
    async fn list_filters_by_requester_and_state() {
        let (service, _) = service();
        let first = submitted(&service).await;
        service
            .create(RequestDraft { requester_id: "emp-077".to_string(), ..torque_wrench() })
            .await
            .expect("second");

        let pending = service
            .list(&RequestFilter {
                state: Some(RequestState::PendingHodReview),
                ..RequestFilter::default()
            })
            .await
            .expect("list");
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, first.id);

        let other = service
            .list(&RequestFilter {
                requester_id: Some(RequesterId("emp-077".to_string())),
                ..RequestFilter::default()
            })
            .await
            .expect("list");
        assert_eq!(other.len(), 1);
        assert_eq!(other[0].state, RequestState::Draft);
    }
}
