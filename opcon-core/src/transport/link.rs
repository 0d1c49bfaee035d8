//! The broker link seam.
//!
//! A [`BrokerLink`] owns the actual broker connection. Requests resolve
//! when the broker acknowledges them; everything the broker pushes
//! arrives as [`LinkEvent`]s on the channel handed out at construction.

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::ProtocolError;
use crate::transport::QoS;

/// Unsolicited link activity.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// The broker accepted the connection (initial or after a reconnect).
    Connected,
    /// The connection dropped; the link keeps trying to reconnect.
    ConnectionLost(String),
    /// An inbound publish.
    Message { topic: String, payload: Bytes },
    /// The link was shut down on request.
    Closed,
}

#[async_trait]
pub trait BrokerLink: Send + Sync {
    /// Start connecting. Completion is signalled by [`LinkEvent::Connected`].
    async fn connect(&self) -> Result<(), ProtocolError>;

    /// Publish and wait for the broker acknowledgement (immediate for QoS 0).
    async fn publish(&self, topic: &str, qos: QoS, payload: Vec<u8>) -> Result<(), ProtocolError>;

    /// Subscribe and wait for the SUBACK.
    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), ProtocolError>;

    /// Unsubscribe and wait for the UNSUBACK.
    async fn unsubscribe(&self, topic: &str) -> Result<(), ProtocolError>;

    /// Close the connection and stop reconnecting.
    async fn disconnect(&self) -> Result<(), ProtocolError>;
}
