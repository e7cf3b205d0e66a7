//! Action dispatch task
//!
//! Sends one lifecycle command and reports a structured outcome. The
//! controller owns the policy of what an outcome implies for the
//! displayed stats; this module only carries the mechanism.

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::SessionEvent;
use crate::api::{ApiClient, ApiError, ContainerAction};

#[derive(Debug, Error)]
pub enum ActionError {
    #[error("another action is already in flight")]
    Busy,
    #[error("session is closed")]
    SessionClosed,
    #[error("action {action} failed: {source}")]
    Failed {
        action: ContainerAction,
        #[source]
        source: ApiError,
    },
}

/// What a completed action implies for the stats view.
#[derive(Debug, Clone, Copy)]
pub struct ActionOutcome {
    pub refresh_stats: bool,
    pub clear_stats: bool,
}

impl ActionOutcome {
    pub(crate) fn for_action(action: ContainerAction) -> Self {
        match action {
            ContainerAction::Restart => Self {
                refresh_stats: true,
                clear_stats: false,
            },
            ContainerAction::Stop | ContainerAction::Remove => Self {
                refresh_stats: false,
                clear_stats: true,
            },
        }
    }
}

pub(crate) fn spawn_dispatch(
    api: ApiClient,
    node: String,
    container_id: String,
    action: ContainerAction,
    generation: u64,
    events: mpsc::UnboundedSender<SessionEvent>,
) {
    let command_id = Uuid::new_v4();
    tokio::spawn(async move {
        debug!(%command_id, "sending {} for container {}", action, container_id);
        let outcome = match api.container_action(&node, &container_id, action).await {
            Ok(()) => {
                info!(%command_id, "{} completed for container {}", action, container_id);
                Ok(ActionOutcome::for_action(action))
            }
            Err(source) => {
                warn!(%command_id, "{} failed for container {}: {}", action, container_id, source);
                Err(ActionError::Failed { action, source })
            }
        };
        let _ = events.send(SessionEvent::ActionDone {
            generation,
            action,
            outcome,
        });
    });
}
