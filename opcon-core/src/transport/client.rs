//! `ProtocolTransport`: connection lifecycle, bounded publishes and
//! subscription replay on top of a [`BrokerLink`].
//!
//! A pump task consumes [`LinkEvent`]s, keeps the [`LinkPhase`] current,
//! replays the [`SubscriptionRegistry`] after every (re)connect and
//! forwards inbound messages on the configured topic, in arrival order,
//! as [`TransportEvent`]s.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::BrokerConfig;
use crate::error::ProtocolError;
use crate::transport::QoS;
use crate::transport::link::{BrokerLink, LinkEvent};
use crate::transport::phase::LinkPhase;
use crate::transport::registry::SubscriptionRegistry;

/// Transport-level settings.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportConfig {
    /// Only messages on this topic are forwarded.
    pub inbound_topic: String,
    pub connect_timeout: Duration,
    pub publish_timeout: Duration,
    pub subscribe_timeout: Duration,
}

impl TransportConfig {
    pub fn from_broker(config: &BrokerConfig) -> Self {
        Self {
            inbound_topic: config.ack_topic.clone(),
            connect_timeout: config.connect_timeout(),
            publish_timeout: config.publish_timeout(),
            subscribe_timeout: config.subscribe_timeout(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::from_broker(&BrokerConfig::default())
    }
}

/// What the transport reports upward.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// The link is up and the registry has been replayed.
    Connected,
    ConnectionLost(String),
    Inbound { topic: String, payload: Bytes },
    /// A background failure, e.g. a subscription that failed on replay.
    Error(ProtocolError),
}

pub struct ProtocolTransport {
    link: Arc<dyn BrokerLink>,
    registry: Arc<SubscriptionRegistry>,
    phase: Arc<watch::Sender<LinkPhase>>,
    last_loss: Arc<Mutex<Option<String>>>,
    config: TransportConfig,
    pump: CancellationToken,
}

impl ProtocolTransport {
    /// Wrap `link` and start the pump.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(
        link: Arc<dyn BrokerLink>,
        link_events: mpsc::UnboundedReceiver<LinkEvent>,
        config: TransportConfig,
    ) -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (phase, _) = watch::channel(LinkPhase::Disconnected);

        let transport = Self {
            link,
            registry: Arc::new(SubscriptionRegistry::new()),
            phase: Arc::new(phase),
            last_loss: Arc::new(Mutex::new(None)),
            config,
            pump: CancellationToken::new(),
        };

        tokio::spawn(
            Pump {
                link: Arc::clone(&transport.link),
                registry: Arc::clone(&transport.registry),
                phase: Arc::clone(&transport.phase),
                last_loss: Arc::clone(&transport.last_loss),
                inbound_topic: transport.config.inbound_topic.clone(),
                subscribe_timeout: transport.config.subscribe_timeout,
                events: events_tx,
            }
            .run(link_events, transport.pump.clone()),
        );

        (transport, events_rx)
    }

    /// Connect and wait (bounded) for the broker to accept.
    ///
    /// On failure the link is shut down and the transport is left
    /// `Disconnected`.
    pub async fn connect(&self) -> Result<(), ProtocolError> {
        let mut phase_rx = self.phase.subscribe();
        let started = self.phase.send_if_modified(|p| p.begin_connect().is_ok());

        if started {
            info!("connecting to broker");
            if let Err(e) = self.link.connect().await {
                self.abandon_connect().await;
                return Err(ProtocolError::ConnectionFailed(e.to_string()));
            }
        } else if self.phase().is_connected() {
            return Ok(());
        }

        let settled = timeout(self.config.connect_timeout, async {
            phase_rx
                .wait_for(|p| p.is_connected() || p.is_disconnected())
                .await
                .map(|p| p.is_connected())
        })
        .await;

        match settled {
            Ok(Ok(true)) => Ok(()),
            Ok(Ok(false)) => {
                let reason = self
                    .take_last_loss()
                    .unwrap_or_else(|| "link closed while connecting".into());
                self.abandon_connect().await;
                Err(ProtocolError::ConnectionFailed(reason))
            }
            Ok(Err(_)) => Err(ProtocolError::ChannelClosed),
            Err(_) => {
                self.abandon_connect().await;
                Err(ProtocolError::ConnectionFailed(format!(
                    "no broker acknowledgement within {:?}",
                    self.config.connect_timeout
                )))
            }
        }
    }

    async fn abandon_connect(&self) {
        if let Err(e) = self.link.disconnect().await {
            debug!("link disconnect after failed connect: {e}");
        }
        self.phase.send_modify(LinkPhase::force_disconnect);
    }

    fn take_last_loss(&self) -> Option<String> {
        match self.last_loss.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }

    /// Publish and wait for the broker acknowledgement, bounded by the
    /// publish timeout.
    pub async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
    ) -> Result<(), ProtocolError> {
        if self.phase().is_disconnected() {
            return Err(ProtocolError::PublishFailed {
                reason: "not connected".into(),
                capacity: false,
            });
        }
        match timeout(self.config.publish_timeout, self.link.publish(topic, qos, payload)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(topic = %topic, "publish not acknowledged within {:?}", self.config.publish_timeout);
                Err(ProtocolError::PublishTimeout {
                    topic: topic.to_string(),
                    after: self.config.publish_timeout,
                })
            }
        }
    }

    /// Record `topic` and subscribe now if connected. While not
    /// connected the binding is only recorded; the next connect
    /// replays it.
    pub async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), ProtocolError> {
        self.registry.record(topic, qos);
        if !self.phase().is_connected() {
            debug!(topic = %topic, "recorded subscription for next connect");
            return Ok(());
        }
        subscribe_bounded(self.link.as_ref(), topic, qos, self.config.subscribe_timeout).await
    }

    pub async fn unsubscribe(&self, topic: &str) -> Result<(), ProtocolError> {
        self.registry.remove(topic);
        if !self.phase().is_connected() {
            return Ok(());
        }
        match timeout(self.config.subscribe_timeout, self.link.unsubscribe(topic)).await {
            Ok(result) => result,
            Err(_) => Err(ProtocolError::SubscribeFailed {
                topic: topic.to_string(),
                reason: format!("no UNSUBACK within {:?}", self.config.subscribe_timeout),
            }),
        }
    }

    pub async fn disconnect(&self) -> Result<(), ProtocolError> {
        let result = self.link.disconnect().await;
        self.phase.send_modify(LinkPhase::force_disconnect);
        info!("disconnected from broker");
        result
    }

    pub fn phase(&self) -> LinkPhase {
        self.phase.borrow().clone()
    }

    /// Watch phase changes.
    pub fn phase_receiver(&self) -> watch::Receiver<LinkPhase> {
        self.phase.subscribe()
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }
}

impl Drop for ProtocolTransport {
    fn drop(&mut self) {
        self.pump.cancel();
    }
}

async fn subscribe_bounded(
    link: &dyn BrokerLink,
    topic: &str,
    qos: QoS,
    limit: Duration,
) -> Result<(), ProtocolError> {
    match timeout(limit, link.subscribe(topic, qos)).await {
        Ok(result) => result,
        Err(_) => Err(ProtocolError::SubscribeFailed {
            topic: topic.to_string(),
            reason: format!("no SUBACK within {limit:?}"),
        }),
    }
}

// ── Pump ─────────────────────────────────────────────────────────

struct Pump {
    link: Arc<dyn BrokerLink>,
    registry: Arc<SubscriptionRegistry>,
    phase: Arc<watch::Sender<LinkPhase>>,
    last_loss: Arc<Mutex<Option<String>>>,
    inbound_topic: String,
    subscribe_timeout: Duration,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl Pump {
    async fn run(self, mut link_events: mpsc::UnboundedReceiver<LinkEvent>, cancel: CancellationToken) {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = link_events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            match event {
                LinkEvent::Connected => self.on_connected().await,
                LinkEvent::ConnectionLost(reason) => {
                    if let Ok(mut last) = self.last_loss.lock() {
                        *last = Some(reason.clone());
                    }
                    let mut transition = Ok(());
                    self.phase.send_modify(|p| transition = p.link_lost(reason.clone()));
                    if let Err(e) = transition {
                        debug!("ignoring connection loss: {e}");
                        continue;
                    }
                    warn!("broker connection lost: {reason}");
                    let _ = self.events.send(TransportEvent::ConnectionLost(reason));
                }
                LinkEvent::Message { topic, payload } => {
                    if topic == self.inbound_topic {
                        let _ = self.events.send(TransportEvent::Inbound { topic, payload });
                    } else {
                        debug!(topic = %topic, "dropping message on unexpected topic");
                    }
                }
                LinkEvent::Closed => {
                    self.phase.send_modify(LinkPhase::force_disconnect);
                }
            }
        }
        debug!("transport pump stopped");
    }

    async fn on_connected(&self) {
        let mut transition = Ok(());
        self.phase.send_modify(|p| transition = p.link_up());
        if let Err(e) = transition {
            debug!("ignoring link up: {e}");
            return;
        }

        let subscriptions = self.registry.snapshot();
        info!("broker connected, replaying {} subscription(s)", subscriptions.len());
        for sub in subscriptions {
            if let Err(e) =
                subscribe_bounded(self.link.as_ref(), &sub.topic, sub.qos, self.subscribe_timeout).await
            {
                warn!(topic = %sub.topic, "subscription replay failed: {e}");
                let _ = self.events.send(TransportEvent::Error(e));
            }
        }
        let _ = self.events.send(TransportEvent::Connected);
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    /// Link whose broker accepts immediately and records requests.
    #[derive(Default)]
    struct EchoLink {
        events: Mutex<Option<mpsc::UnboundedSender<LinkEvent>>>,
        subscribes: Mutex<Vec<(String, QoS)>>,
        fail_topic: Option<String>,
        refuse: bool,
        hang_publish: bool,
    }

    impl EchoLink {
        fn emit(&self, event: LinkEvent) {
            if let Some(tx) = self.events.lock().unwrap().as_ref() {
                tx.send(event).unwrap();
            }
        }
    }

    #[async_trait]
    impl BrokerLink for EchoLink {
        async fn connect(&self) -> Result<(), ProtocolError> {
            if self.refuse {
                self.emit(LinkEvent::ConnectionLost("connection refused".into()));
            } else {
                self.emit(LinkEvent::Connected);
            }
            Ok(())
        }

        async fn publish(&self, _topic: &str, _qos: QoS, _payload: Vec<u8>) -> Result<(), ProtocolError> {
            if self.hang_publish {
                std::future::pending::<()>().await;
            }
            Ok(())
        }

        async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), ProtocolError> {
            self.subscribes.lock().unwrap().push((topic.to_string(), qos));
            if self.fail_topic.as_deref() == Some(topic) {
                return Err(ProtocolError::SubscribeFailed {
                    topic: topic.into(),
                    reason: "not authorised".into(),
                });
            }
            Ok(())
        }

        async fn unsubscribe(&self, _topic: &str) -> Result<(), ProtocolError> {
            Ok(())
        }

        async fn disconnect(&self) -> Result<(), ProtocolError> {
            self.emit(LinkEvent::Closed);
            Ok(())
        }
    }

    fn transport(
        link: EchoLink,
        config: TransportConfig,
    ) -> (Arc<EchoLink>, ProtocolTransport, mpsc::UnboundedReceiver<TransportEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        *link.events.lock().unwrap() = Some(tx);
        let link = Arc::new(link);
        let (transport, events) = ProtocolTransport::new(link.clone(), rx, config);
        (link, transport, events)
    }

    fn config() -> TransportConfig {
        TransportConfig {
            inbound_topic: "ack".into(),
            ..TransportConfig::default()
        }
    }

    #[tokio::test]
    async fn connect_replays_registry_in_order() {
        let (link, transport, mut events) = transport(EchoLink::default(), config());
        transport.subscribe("A", QoS::AtLeastOnce).await.unwrap();
        transport.subscribe("B", QoS::AtMostOnce).await.unwrap();
        transport.unsubscribe("A").await.unwrap();
        assert!(link.subscribes.lock().unwrap().is_empty());

        transport.connect().await.unwrap();
        assert_eq!(events.recv().await, Some(TransportEvent::Connected));
        assert!(transport.phase().is_connected());
        assert_eq!(
            *link.subscribes.lock().unwrap(),
            vec![("B".to_string(), QoS::AtMostOnce)]
        );
    }

    #[tokio::test]
    async fn reconnect_replays_and_reports_failures() {
        let link = EchoLink {
            fail_topic: Some("bad".into()),
            ..EchoLink::default()
        };
        let (link, transport, mut events) = transport(link, config());
        transport.subscribe("bad", QoS::AtLeastOnce).await.unwrap();
        transport.subscribe("good", QoS::AtLeastOnce).await.unwrap();
        transport.connect().await.unwrap();

        assert!(matches!(
            events.recv().await,
            Some(TransportEvent::Error(ProtocolError::SubscribeFailed { .. }))
        ));
        assert_eq!(events.recv().await, Some(TransportEvent::Connected));

        link.emit(LinkEvent::ConnectionLost("keep-alive timeout".into()));
        assert_eq!(
            events.recv().await,
            Some(TransportEvent::ConnectionLost("keep-alive timeout".into()))
        );
        assert!(matches!(transport.phase(), LinkPhase::Reconnecting { .. }));

        link.emit(LinkEvent::Connected);
        assert!(matches!(events.recv().await, Some(TransportEvent::Error(_))));
        assert_eq!(events.recv().await, Some(TransportEvent::Connected));
        // Both topics replayed on each of the two connects.
        assert_eq!(link.subscribes.lock().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn refused_connect_leaves_disconnected() {
        let link = EchoLink {
            refuse: true,
            ..EchoLink::default()
        };
        let (_link, transport, _events) = transport(link, config());
        let err = transport.connect().await.unwrap_err();
        assert_eq!(
            err,
            ProtocolError::ConnectionFailed("connection refused".into())
        );
        assert!(transport.phase().is_disconnected());
    }

    #[tokio::test]
    async fn inbound_filtered_to_ack_topic() {
        let (link, transport, mut events) = transport(EchoLink::default(), config());
        transport.connect().await.unwrap();
        assert_eq!(events.recv().await, Some(TransportEvent::Connected));

        link.emit(LinkEvent::Message {
            topic: "other".into(),
            payload: Bytes::from_static(b"x"),
        });
        link.emit(LinkEvent::Message {
            topic: "ack".into(),
            payload: Bytes::from_static(b"y"),
        });
        assert_eq!(
            events.recv().await,
            Some(TransportEvent::Inbound {
                topic: "ack".into(),
                payload: Bytes::from_static(b"y"),
            })
        );
    }

    #[tokio::test]
    async fn publish_times_out() {
        let link = EchoLink {
            hang_publish: true,
            ..EchoLink::default()
        };
        let cfg = TransportConfig {
            publish_timeout: Duration::from_millis(20),
            ..config()
        };
        let (_link, transport, _events) = transport(link, cfg);
        transport.connect().await.unwrap();

        let err = transport
            .publish("cmd", b"{}".to_vec(), QoS::AtLeastOnce)
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::PublishTimeout { .. }));
    }

    #[tokio::test]
    async fn publish_while_disconnected_fails_fast() {
        let (_link, transport, _events) = transport(EchoLink::default(), config());
        let err = transport
            .publish("cmd", b"{}".to_vec(), QoS::AtLeastOnce)
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::PublishFailed { capacity: false, .. }));
    }
}
