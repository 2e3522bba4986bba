//! Connection lifecycle status delivered to the caller. Grounded on the
//! teacher's `State` enum (`iothub/mod.rs`), generalised from its
//! two-variant {Ready, ConnectionError} shape into the closed set this
//! crate needs, still read by multiple tasks through a `watch` channel
//! the same way the teacher's `OnlineConnection` state cell is.

use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connected,
    DisconnectedRetrying,
    Closed,
    Disabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeReason {
    ClientOpen,
    ClientClose,
    CommunicationError,
    BadCredential,
    DeviceDisabled,
    QuotaExceeded,
    RetryExpired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecommendedAction {
    PerformNormally,
    Retry,
    WaitForReconnect,
    Stop,
}

/// A single connection-status transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusChange {
    pub status: ConnectionStatus,
    pub reason: ChangeReason,
    pub recommended_action: RecommendedAction,
}

impl StatusChange {
    pub fn new(status: ConnectionStatus, reason: ChangeReason) -> Self {
        Self {
            status,
            reason,
            recommended_action: recommended_action(status, reason),
        }
    }
}

/// Deterministic mapping from `(status, reason)` to the action the caller
/// should take, closed over the same transient/non-transient split as
/// the error taxonomy so the two can't drift apart.
fn recommended_action(status: ConnectionStatus, reason: ChangeReason) -> RecommendedAction {
    use ChangeReason::*;
    use ConnectionStatus::*;
    match (status, reason) {
        (Connected, _) => RecommendedAction::PerformNormally,
        (DisconnectedRetrying, CommunicationError) => RecommendedAction::Retry,
        (DisconnectedRetrying, _) => RecommendedAction::Retry,
        (Disabled, QuotaExceeded) => RecommendedAction::WaitForReconnect,
        (Disabled, DeviceDisabled) => RecommendedAction::Stop,
        (Disabled, _) => RecommendedAction::WaitForReconnect,
        (Closed, _) => RecommendedAction::Stop,
    }
}

/// Broadcasts status transitions to every subscriber, backed by a
/// `tokio::sync::watch` channel so late subscribers immediately observe
/// the current status rather than missing it.
pub struct ConnectionStatusBus {
    tx: watch::Sender<StatusChange>,
}

impl Default for ConnectionStatusBus {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionStatusBus {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(StatusChange::new(ConnectionStatus::Closed, ChangeReason::ClientClose));
        Self { tx }
    }

    pub fn subscribe(&self) -> watch::Receiver<StatusChange> {
        self.tx.subscribe()
    }

    pub fn publish(&self, status: ConnectionStatus, reason: ChangeReason) {
        let change = StatusChange::new(status, reason);
        log::debug!("connection status -> {status:?} ({reason:?})");
        let _ = self.tx.send(change);
    }

    pub fn current(&self) -> StatusChange {
        *self.tx.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connected_always_recommends_normal_operation() {
        let change = StatusChange::new(ConnectionStatus::Connected, ChangeReason::ClientOpen);
        assert_eq!(change.recommended_action, RecommendedAction::PerformNormally);
    }

    #[test]
    fn quota_exceeded_recommends_waiting_not_stopping() {
        let change = StatusChange::new(ConnectionStatus::Disabled, ChangeReason::QuotaExceeded);
        assert_eq!(change.recommended_action, RecommendedAction::WaitForReconnect);
    }

    #[test]
    fn device_disabled_recommends_stop() {
        let change = StatusChange::new(ConnectionStatus::Disabled, ChangeReason::DeviceDisabled);
        assert_eq!(change.recommended_action, RecommendedAction::Stop);
    }

    #[tokio::test]
    async fn open_close_pair_emits_exactly_two_transitions() {
        let bus = ConnectionStatusBus::new();
        let mut rx = bus.subscribe();
        rx.borrow_and_update();

        let mut seen = Vec::new();
        bus.publish(ConnectionStatus::Connected, ChangeReason::ClientOpen);
        rx.changed().await.unwrap();
        seen.push(*rx.borrow_and_update());

        bus.publish(ConnectionStatus::Closed, ChangeReason::ClientClose);
        rx.changed().await.unwrap();
        seen.push(*rx.borrow_and_update());

        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].status, ConnectionStatus::Connected);
        assert_eq!(seen[1].status, ConnectionStatus::Closed);
    }
}
