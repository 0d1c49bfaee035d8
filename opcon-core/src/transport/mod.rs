//! Broker transport for the command/ack protocol.
//!
//! ```text
//!  ProtocolTransport ──► BrokerLink (MqttLink / test links)
//!        │                     │
//!        │◄──── LinkEvent ─────┘   connected / lost / message / closed
//!        ▼
//!  TransportEvent ──► ControlSession dispatcher
//! ```
//!
//! - [`link`]: the [`BrokerLink`] seam and its events
//! - [`mqtt`]: `rumqttc` implementation of the seam
//! - [`phase`]: [`LinkPhase`] connection state machine
//! - [`registry`]: subscriptions replayed on every (re)connect
//! - [`rate_limit`]: sliding-window admission for outbound commands
//! - [`client`]: [`ProtocolTransport`], tying the above together

pub mod client;
pub mod link;
pub mod mqtt;
pub mod phase;
pub mod rate_limit;
pub mod registry;

use serde::{Deserialize, Serialize};

pub use client::{ProtocolTransport, TransportConfig, TransportEvent};
pub use link::{BrokerLink, LinkEvent};
pub use mqtt::MqttLink;
pub use phase::LinkPhase;
pub use rate_limit::{Admission, RateLimiter};
pub use registry::{Subscription, SubscriptionRegistry};

// ── QoS ──────────────────────────────────────────────────────────

/// Delivery guarantee requested from the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QoS {
    AtMostOnce,
    #[default]
    AtLeastOnce,
    ExactlyOnce,
}

impl QoS {
    pub fn level(self) -> u8 {
        match self {
            QoS::AtMostOnce => 0,
            QoS::AtLeastOnce => 1,
            QoS::ExactlyOnce => 2,
        }
    }
}

impl TryFrom<u8> for QoS {
    type Error = crate::error::ProtocolError;

    fn try_from(level: u8) -> Result<Self, Self::Error> {
        match level {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            other => Err(crate::error::ProtocolError::InvalidCommand(format!(
                "QoS level {other} does not exist"
            ))),
        }
    }
}

impl From<QoS> for rumqttc::QoS {
    fn from(qos: QoS) -> Self {
        match qos {
            QoS::AtMostOnce => rumqttc::QoS::AtMostOnce,
            QoS::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
            QoS::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
        }
    }
}

impl std::fmt::Display for QoS {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "QoS{}", self.level())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qos_levels() {
        assert_eq!(QoS::try_from(2).unwrap(), QoS::ExactlyOnce);
        assert!(QoS::try_from(3).is_err());
        assert_eq!(QoS::default().level(), 1);
        assert_eq!(rumqttc::QoS::from(QoS::AtMostOnce), rumqttc::QoS::AtMostOnce);
        assert_eq!(QoS::AtLeastOnce.to_string(), "QoS1");
    }

    #[test]
    fn qos_serde_names() {
        let q: QoS = serde_json::from_str("\"exactly_once\"").unwrap();
        assert_eq!(q, QoS::ExactlyOnce);
    }
}
