use toolcrib_core::notifications::{DispatchError, NotificationDispatcher, NotificationEvent};
use tracing::info;

/// Emits each event as a structured log line. Downstream delivery (mail, chat)
/// tails these events rather than running inside the request path.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingNotificationDispatcher;

impl NotificationDispatcher for TracingNotificationDispatcher {
    fn dispatch(&self, event: &NotificationEvent) -> Result<(), DispatchError> {
        info!(
            event_name = "workflow.notification.dispatched",
            event_id = %event.event_id,
            request_id = %event.request_id,
            action = %event.action,
            actor_role = %event.actor_role,
            resulting_state = %event.resulting_state,
            next_actor = event.next_actor().map(|role| role.as_str()).unwrap_or("none"),
            "request status changed"
        );
        Ok(())
    }
}
