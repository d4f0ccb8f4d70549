//! Editing and resubmitting a rejected request.
//!
//! A rejected request is handed back to its requester as an [`EditableDraft`]
//! carrying the rejection that caused it. Resubmitting applies the edits and the
//! `resubmit` transition in one commit, so a reader never observes the edited
//! fields without the matching history entry.

use serde::{Deserialize, Serialize};

use crate::domain::approval::{ActorRole, DecisionOutcome};
use crate::domain::request::{validate_patch, RequestFields, RequestId, RequestPatch, RequestState};
use crate::errors::WorkflowError;
use crate::flows::WorkflowAction;
use crate::notifications::NotificationDispatcher;
use crate::service::{ActionOutcome, WorkflowService};
use crate::store::RequestStorage;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditableDraft {
    pub request_id: RequestId,
    pub state: RequestState,
    /// Review cycle the rejection belongs to.
    pub rejected_cycle: u32,
    pub rejected_by: Option<ActorRole>,
    pub rejection_comment: Option<String>,
    pub fields: RequestFields,
}

impl<S, N> WorkflowService<S, N>
where
    S: RequestStorage,
    N: NotificationDispatcher,
{
    pub async fn prepare_resubmission(
        &self,
        id: &RequestId,
    ) -> Result<EditableDraft, WorkflowError> {
        let request = self.get(id).await?;
        if !request.state.is_rejected() {
            return Err(WorkflowError::InvalidState {
                request_id: id.clone(),
                state: request.state,
                operation: "prepare_resubmission".to_string(),
            });
        }

        let decisions = self.storage().decisions(id).await?;
        let rejection = decisions.iter().rev().find(|decision| {
            decision.outcome == DecisionOutcome::Rejected && decision.cycle == request.cycle
        });

        Ok(EditableDraft {
            request_id: request.id.clone(),
            state: request.state,
            rejected_cycle: request.cycle,
            rejected_by: rejection.map(|decision| decision.actor_role),
            rejection_comment: rejection.and_then(|decision| decision.comment.clone()),
            fields: request.fields(),
        })
    }

    /// Applies `patch` and moves the request back to HoD review as a new cycle.
    pub async fn submit_resubmission(
        &self,
        id: &RequestId,
        patch: RequestPatch,
    ) -> Result<ActionOutcome, WorkflowError> {
        let validated = validate_patch(id, patch)?;
        self.commit_transition(
            id,
            WorkflowAction::Resubmit,
            ActorRole::Requester,
            None,
            Some(validated),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use crate::domain::approval::ActorRole;
    use crate::domain::request::{Priority, RequestDraft, RequestPatch, RequestState};
    use crate::errors::{ErrorKind, WorkflowError};
    use crate::flows::WorkflowAction;
    use crate::notifications::NoopNotificationDispatcher;
    use crate::service::WorkflowService;
    use crate::store::InMemoryRequestStorage;

    type Service = WorkflowService<InMemoryRequestStorage, NoopNotificationDispatcher>;

    fn service() -> Service {
        WorkflowService::new(InMemoryRequestStorage::default(), NoopNotificationDispatcher)
    }

    fn drill() -> RequestDraft {
        RequestDraft {
            requester_id: "emp-310".to_string(),
            item_description: Some("Cordless Drill".to_string()),
            quantity: Some(4),
            reason: Some("new assembly bay".to_string()),
            priority: Some(Priority::High),
            ..RequestDraft::default()
        }
    }

    async fn rejected_by_gm(service: &Service) -> crate::domain::request::Request {
        let request = service.create(drill()).await.expect("create");
        for (action, role, comment) in [
            (WorkflowAction::Submit, ActorRole::Requester, None),
            (WorkflowAction::HodApprove, ActorRole::Hod, None),
            (WorkflowAction::GmReject, ActorRole::Gm, Some("reduce to two units".to_string())),
        ] {
            service.apply_action(&request.id, action, role, comment).await.expect("transition");
        }
        service.get(&request.id).await.expect("get")
    }

    #[tokio::test]
    async fn editable_draft_carries_the_rejection() {
        let service = service();
        let request = rejected_by_gm(&service).await;

        let draft = service.prepare_resubmission(&request.id).await.expect("prepare");
        assert_eq!(draft.state, RequestState::RejectedByGm);
        assert_eq!(draft.rejected_cycle, 1);
        assert_eq!(draft.rejected_by, Some(ActorRole::Gm));
        assert_eq!(draft.rejection_comment.as_deref(), Some("reduce to two units"));
        assert_eq!(draft.fields.quantity, 4);
    }

    #[tokio::test]
    async fn prepare_is_refused_outside_rejected_states() {
        let service = service();
        let request = service.create(drill()).await.expect("create");

        let error = service.prepare_resubmission(&request.id).await.expect_err("draft");
        assert!(matches!(
            error,
            WorkflowError::InvalidState { ref operation, state: RequestState::Draft, .. }
                if operation == "prepare_resubmission"
        ));
    }

    #[tokio::test]
    async fn resubmission_applies_edits_and_opens_a_new_cycle() {
        let service = service();
        let request = rejected_by_gm(&service).await;

        let outcome = service
            .submit_resubmission(
                &request.id,
                RequestPatch {
                    quantity: Some(2),
                    reason: Some(String::new()),
                    ..RequestPatch::default()
                },
            )
            .await
            .expect("resubmit");

        assert_eq!(outcome.request.state, RequestState::PendingHodReview);
        assert_eq!(outcome.request.quantity, 2);
        assert_eq!(outcome.request.reason, None);
        assert_eq!(outcome.request.cycle, 2);
        assert_eq!(outcome.entry.action, WorkflowAction::Resubmit);
        assert_eq!(outcome.entry.from_state, RequestState::RejectedByGm);
        assert!(outcome.decision.is_none());

        let decisions = service.decisions_for(&request.id).await.expect("decisions");
        assert_eq!(decisions.len(), 2);
        assert!(decisions.iter().all(|decision| decision.cycle == 1));
    }

    #[tokio::test]
    async fn invalid_edit_leaves_the_request_rejected() {
        let service = service();
        let request = rejected_by_gm(&service).await;

        let error = service
            .submit_resubmission(
                &request.id,
                RequestPatch { quantity: Some(0), ..RequestPatch::default() },
            )
            .await
            .expect_err("zero quantity");
        assert_eq!(error.kind(), ErrorKind::Validation);

        let stored = service.get(&request.id).await.expect("get");
        assert_eq!(stored.state, RequestState::RejectedByGm);
        assert_eq!(stored.quantity, 4);
        assert_eq!(service.entries_for(&request.id).await.expect("history").len(), 3);
    }

    #[tokio::test]
    async fn resubmitting_a_pending_request_is_an_invalid_state() {
        let service = service();
        let request = service.create(drill()).await.expect("create");
        service
            .apply_action(&request.id, WorkflowAction::Submit, ActorRole::Requester, None)
            .await
            .expect("submit");

        let error = service
            .submit_resubmission(&request.id, RequestPatch::default())
            .await
            .expect_err("pending");
        assert_eq!(error.kind(), ErrorKind::InvalidState);
    }
}
