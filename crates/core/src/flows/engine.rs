use thiserror::Error;

use crate::domain::approval::ActorRole;
use crate::domain::request::RequestState;
use crate::flows::states::{TransitionOutcome, WorkflowAction};

pub trait FlowDefinition {
    fn initial_state(&self) -> RequestState;
    fn transition(
        &self,
        current: RequestState,
        action: WorkflowAction,
        actor_role: ActorRole,
    ) -> Result<TransitionOutcome, FlowTransitionError>;
}

/// Requester -> Head of Department -> General Manager. HoD approval always
/// precedes GM review.
#[derive(Clone, Debug, Default)]
pub struct ApprovalChainFlow;

impl FlowDefinition for ApprovalChainFlow {
    fn initial_state(&self) -> RequestState {
        RequestState::Draft
    }

    fn transition(
        &self,
        current: RequestState,
        action: WorkflowAction,
        actor_role: ActorRole,
    ) -> Result<TransitionOutcome, FlowTransitionError> {
        transition_approval_chain(current, action, actor_role)
    }
}

pub struct FlowEngine<F> {
    flow: F,
}

impl<F> FlowEngine<F>
where
    F: FlowDefinition,
{
    pub fn new(flow: F) -> Self {
        Self { flow }
    }

    pub fn initial_state(&self) -> RequestState {
        self.flow.initial_state()
    }

    pub fn apply(
        &self,
        current: RequestState,
        action: WorkflowAction,
        actor_role: ActorRole,
    ) -> Result<TransitionOutcome, FlowTransitionError> {
        self.flow.transition(current, action, actor_role)
    }

    /// Actions `role` may take from `state`, in table order.
    pub fn allowed_actions(&self, state: RequestState, role: ActorRole) -> Vec<WorkflowAction> {
        WorkflowAction::ALL
            .into_iter()
            .filter(|action| self.apply(state, *action, role).is_ok())
            .collect()
    }

    /// Replays `(action, role)` steps from the initial state and returns the end state.
    pub fn replay<I>(&self, steps: I) -> Result<RequestState, FlowTransitionError>
    where
        I: IntoIterator<Item = (WorkflowAction, ActorRole)>,
    {
        steps.into_iter().try_fold(self.initial_state(), |state, (action, role)| {
            self.apply(state, action, role).map(|outcome| outcome.to)
        })
    }
}

impl Default for FlowEngine<ApprovalChainFlow> {
    fn default() -> Self {
        Self::new(ApprovalChainFlow)
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum FlowTransitionError {
    #[error("action {action} requires role {required_role}, got {actor_role}")]
    ForbiddenRole { action: WorkflowAction, actor_role: ActorRole, required_role: ActorRole },
    #[error("action {action} is not permitted from state {state}")]
    InvalidTransition { state: RequestState, action: WorkflowAction },
}

fn transition_approval_chain(
    current: RequestState,
    action: WorkflowAction,
    actor_role: ActorRole,
) -> Result<TransitionOutcome, FlowTransitionError> {
    use RequestState::{
        Approved, Cancelled, Draft, PendingGmReview, PendingHodReview, RejectedByGm,
        RejectedByHod,
    };
    use WorkflowAction::{Cancel, GmApprove, GmReject, HodApprove, HodReject, Resubmit, Submit};

    let required_role = action.required_role();
    if actor_role != required_role {
        return Err(FlowTransitionError::ForbiddenRole { action, actor_role, required_role });
    }

    let to = match (current, action) {
        (Draft, Submit) => PendingHodReview,
        (PendingHodReview, HodApprove) => PendingGmReview,
        (PendingHodReview, HodReject) => RejectedByHod,
        (PendingGmReview, GmApprove) => Approved,
        (PendingGmReview, GmReject) => RejectedByGm,
        (RejectedByHod, Resubmit) | (RejectedByGm, Resubmit) => PendingHodReview,
        (state, Cancel) if !state.is_terminal() => Cancelled,
        _ => return Err(FlowTransitionError::InvalidTransition { state: current, action }),
    };

    Ok(TransitionOutcome { from: current, to, action, actor_role })
}
