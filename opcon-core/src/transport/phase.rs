//! Broker connection state machine.
//!
//! Transitions are validated and return `Result` instead of panicking.

use std::time::{Duration, Instant};

use crate::error::ProtocolError;

/// ```text
///  Disconnected ──► Connecting ──► Connected ◄──► Reconnecting
///       ▲               │              │               │
///       └───────────────┴──────────────┴───────────────┘
///          (connect failure, or disconnect at any time)
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LinkPhase {
    #[default]
    Disconnected,
    Connecting,
    Connected {
        since: Instant,
    },
    /// Lost after being connected; the link retries on its own.
    Reconnecting {
        reason: String,
    },
}

impl std::fmt::Display for LinkPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected { .. } => write!(f, "Connected"),
            Self::Reconnecting { reason } => write!(f, "Reconnecting ({reason})"),
        }
    }
}

impl LinkPhase {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected { .. })
    }

    pub fn is_disconnected(&self) -> bool {
        matches!(self, Self::Disconnected)
    }

    /// How long the link has been up, `None` unless connected.
    pub fn connected_duration(&self) -> Option<Duration> {
        match self {
            Self::Connected { since } => Some(since.elapsed()),
            _ => None,
        }
    }

    // ── Transitions ──────────────────────────────────────────────

    /// Valid from: `Disconnected`.
    pub fn begin_connect(&mut self) -> Result<(), ProtocolError> {
        match self {
            Self::Disconnected => {
                *self = Self::Connecting;
                Ok(())
            }
            _ => Err(ProtocolError::InvalidTransition(
                "cannot connect: not in Disconnected state",
            )),
        }
    }

    /// Valid from: `Connecting`, `Reconnecting`.
    pub fn link_up(&mut self) -> Result<(), ProtocolError> {
        match self {
            Self::Connecting | Self::Reconnecting { .. } => {
                *self = Self::Connected {
                    since: Instant::now(),
                };
                Ok(())
            }
            _ => Err(ProtocolError::InvalidTransition(
                "link up while not connecting",
            )),
        }
    }

    /// A failed first attempt ends in `Disconnected`; a drop after
    /// being connected moves to `Reconnecting`.
    pub fn link_lost(&mut self, reason: impl Into<String>) -> Result<(), ProtocolError> {
        match self {
            Self::Connecting => {
                *self = Self::Disconnected;
                Ok(())
            }
            Self::Connected { .. } | Self::Reconnecting { .. } => {
                *self = Self::Reconnecting {
                    reason: reason.into(),
                };
                Ok(())
            }
            Self::Disconnected => Err(ProtocolError::InvalidTransition(
                "link lost while disconnected",
            )),
        }
    }

    /// Reset to `Disconnected` regardless of current state.
    pub fn force_disconnect(&mut self) {
        *self = Self::Disconnected;
    }
}
