//! Lifecycle event delivery to mounted channels.

use std::sync::Arc;

use tracing::debug;

use sandbox_bridge_core::protocol::LifecycleEvent;

use crate::state::HostState;

/// Post a lifecycle event to every channel mounted for `interaction_id`.
pub async fn send_lifecycle(
    state: &Arc<HostState>,
    event: &LifecycleEvent,
    interaction_id: &str,
) -> usize {
    let envelope = event.to_envelope();
    let channels = state.channels.read().await;
    let mut sent = 0;
    for channel in channels
        .values()
        .filter(|c| c.interaction_id == interaction_id)
    {
        if channel.sender.post(envelope.clone()).is_ok() {
            sent += 1;
        }
    }
    debug!(event = %envelope.kind, interaction_id, sent, "Lifecycle event sent");
    sent
}
