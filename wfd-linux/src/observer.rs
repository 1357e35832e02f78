//! Observer that logs and republishes session notifications to async consumers.

use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};

use wfd_core::{ConnectionState, Notification, SessionObserver, SessionState};

const NOTIFICATION_CHANNEL_SIZE: usize = 64;

/// Publishes the latest state on a watch channel and every notification on a broadcast channel.
pub struct PublishingObserver {
    state: watch::Sender<SessionState>,
    notifications: broadcast::Sender<Notification>,
}

impl PublishingObserver {
    pub fn new() -> (Self, watch::Receiver<SessionState>) {
        let (state, state_rx) = watch::channel(SessionState::default());
        let (notifications, _) = broadcast::channel(NOTIFICATION_CHANNEL_SIZE);
        (
            Self {
                state,
                notifications,
            },
            state_rx,
        )
    }

    /// Sender half, for handing out new subscriptions after the observer moves into a session.
    pub fn notifier(&self) -> broadcast::Sender<Notification> {
        self.notifications.clone()
    }

    fn publish(&self, n: Notification) {
        // No subscribers is fine.
        let _ = self.notifications.send(n);
    }
}

impl SessionObserver for PublishingObserver {
    fn on_state_changed(&mut self, state: &SessionState) {
        match &state.connection {
            ConnectionState::Connected { peer, info } => info!(
                phase = ?state.phase,
                peer = %peer.name,
                group_owner = ?info.group_owner_address,
                "state changed"
            ),
            _ => debug!(
                phase = ?state.phase,
                peers = state.peers.len(),
                "state changed"
            ),
        }
        self.state.send_replace(state.clone());
        self.publish(Notification::StateChanged(state.clone()));
    }

    fn on_fatal_channel_loss(&mut self) {
        error!("p2p channel lost permanently; toggle Wi-Fi Direct to recover");
        self.publish(Notification::FatalChannelLoss);
    }

    fn on_transient_error(&mut self, message: &str) {
        warn!("{}", message);
        self.publish(Notification::TransientError(message.to_string()));
    }

    fn on_notice(&mut self, message: &str) {
        info!("{}", message);
        self.publish(Notification::Notice(message.to_string()));
    }
}
