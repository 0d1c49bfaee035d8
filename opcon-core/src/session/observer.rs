//! What a [`ControlSession`](super::ControlSession) tells its host.
//!
//! All observer calls happen on the session's dispatcher task, one at a
//! time, in the order the underlying events occurred.

use tokio::sync::mpsc;

use crate::error::ProtocolError;
use crate::protocol::{AckTimestamp, ChannelFields, ChannelId, RelayMask};

// ── Reconciliation ───────────────────────────────────────────────

/// Two-state controls whose shown state follows device acks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ToggleControl {
    Camera,
    Fan,
    /// `true` means up.
    Brush,
}

/// Result of comparing a reported toggle state with the shown one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToggleOutcome {
    /// Device agrees with what the console shows.
    Confirmed(bool),
    /// Device disagrees; the shown state flipped to the reported one.
    Flipped(bool),
}

impl ToggleOutcome {
    pub fn state(self) -> bool {
        match self {
            ToggleOutcome::Confirmed(s) | ToggleOutcome::Flipped(s) => s,
        }
    }
}

/// How an acknowledgement changed the device model.
#[derive(Debug, Clone, PartialEq)]
pub enum Reconciliation {
    Toggle {
        control: ToggleControl,
        outcome: ToggleOutcome,
    },
    RelayObserved(RelayMask),
    SpeedRecorded(f64),
    PositionReported(f64),
}

// ── Reports ──────────────────────────────────────────────────────

/// A validated acknowledgement.
#[derive(Debug, Clone, PartialEq)]
pub struct AckReport {
    pub channel: ChannelId,
    pub acked_at: AckTimestamp,
    pub fields: Option<ChannelFields>,
    pub reconciliation: Option<Reconciliation>,
}

/// A protocol failure surfaced to the operator.
#[derive(Debug, Clone, PartialEq)]
pub struct ProtocolErrorEvent {
    pub error: ProtocolError,
    /// Set when a rate or capacity limit stopped the command; the UI
    /// re-enables controls it disabled while waiting for an ack.
    pub rate_limited: bool,
    /// The command channel involved, if any.
    pub channel: Option<ChannelId>,
}

impl ProtocolErrorEvent {
    pub fn new(error: ProtocolError, channel: Option<ChannelId>) -> Self {
        Self {
            rate_limited: error.is_capacity(),
            error,
            channel,
        }
    }

    pub fn message(&self) -> String {
        self.error.to_string()
    }
}

// ── SessionObserver ──────────────────────────────────────────────

pub trait SessionObserver: Send + 'static {
    fn on_ack_received(&mut self, report: &AckReport);

    fn on_protocol_error(&mut self, event: &ProtocolErrorEvent);

    fn on_connection_changed(&mut self, _connected: bool) {}
}

/// Everything a session reports, as one message type.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Ack(AckReport),
    ProtocolError(ProtocolErrorEvent),
    Connection(bool),
}

/// Forward session reports to a channel.
impl SessionObserver for mpsc::UnboundedSender<SessionEvent> {
    fn on_ack_received(&mut self, report: &AckReport) {
        let _ = self.send(SessionEvent::Ack(report.clone()));
    }

    fn on_protocol_error(&mut self, event: &ProtocolErrorEvent) {
        let _ = self.send(SessionEvent::ProtocolError(event.clone()));
    }

    fn on_connection_changed(&mut self, connected: bool) {
        let _ = self.send(SessionEvent::Connection(connected));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn rate_limited_flag_follows_error() {
        let limited = ProtocolErrorEvent::new(
            ProtocolError::RateLimited {
                max_per_window: 5,
                window: Duration::from_secs(1),
            },
            Some(ChannelId::Camera),
        );
        assert!(limited.rate_limited);

        let timeout = ProtocolErrorEvent::new(
            ProtocolError::PublishTimeout {
                topic: "cmd".into(),
                after: Duration::from_secs(10),
            },
            None,
        );
        assert!(!timeout.rate_limited);
        assert!(timeout.message().contains("timed out"));
    }

    #[test]
    fn channel_observer_forwards() {
        let (mut tx, mut rx) = mpsc::unbounded_channel::<SessionEvent>();
        tx.on_connection_changed(true);
        assert_eq!(rx.try_recv().unwrap(), SessionEvent::Connection(true));
    }
}
