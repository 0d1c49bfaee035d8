//! `rumqttc`-backed [`BrokerLink`].
//!
//! The `rumqttc` event loop is polled on a Tokio task. A poll error is
//! reported once as [`LinkEvent::ConnectionLost`]; the task then sleeps
//! the reconnect delay and polls again, which makes `rumqttc` redial.
//!
//! Requests go through the non-blocking `try_*` client calls so that a
//! full request queue surfaces as a capacity error instead of stalling
//! the caller. Each request parks a oneshot waiter that is matched to
//! its packet id when the event loop writes the packet, and resolved
//! when the broker acknowledges that id.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ClientError, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet,
    SubscribeReasonCode,
};
use tokio::sync::{Mutex as AsyncMutex, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::BrokerConfig;
use crate::error::ProtocolError;
use crate::transport::QoS;
use crate::transport::link::{BrokerLink, LinkEvent};

const DEFAULT_PORT: u16 = 1883;

/// Split `tcp://host:port`, `mqtt://host:port` or `host:port`.
pub fn parse_address(address: &str) -> Result<(String, u16), ProtocolError> {
    let rest = address
        .strip_prefix("tcp://")
        .or_else(|| address.strip_prefix("mqtt://"))
        .unwrap_or(address)
        .trim_end_matches('/');

    let (host, port) = match rest.rsplit_once(':') {
        Some((host, port)) => {
            let port = port.parse::<u16>().map_err(|_| {
                ProtocolError::ConnectionFailed(format!("bad port in broker address {address:?}"))
            })?;
            (host, port)
        }
        None => (rest, DEFAULT_PORT),
    };

    if host.is_empty() || host.contains("://") {
        return Err(ProtocolError::ConnectionFailed(format!(
            "unsupported broker address {address:?}"
        )));
    }
    Ok((host.to_string(), port))
}

// ── Request correlation ──────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum RequestKind {
    Publish,
    Subscribe,
    Unsubscribe,
}

type Reply = Result<(), String>;

struct Waiter {
    kind: RequestKind,
    /// Resolves as soon as the packet is written (QoS 0 publish).
    on_write: bool,
    tx: oneshot::Sender<Reply>,
}

/// Waiters in submission order, then by packet id once written.
#[derive(Default)]
struct Pending {
    queued: VecDeque<Waiter>,
    inflight: HashMap<(RequestKind, u16), oneshot::Sender<Reply>>,
}

impl Pending {
    /// The event loop wrote a packet of `kind` with `pkid`.
    fn written(&mut self, kind: RequestKind, pkid: u16) {
        // A retransmission after reconnect keeps its original waiter.
        if pkid != 0 && self.inflight.contains_key(&(kind, pkid)) {
            return;
        }
        let Some(pos) = self.queued.iter().position(|w| w.kind == kind) else {
            return;
        };
        let Some(waiter) = self.queued.remove(pos) else {
            return;
        };
        if waiter.on_write {
            let _ = waiter.tx.send(Ok(()));
        } else {
            self.inflight.insert((kind, pkid), waiter.tx);
        }
    }

    /// The broker acknowledged `pkid`.
    fn acked(&mut self, kind: RequestKind, pkid: u16, reply: Reply) {
        if let Some(tx) = self.inflight.remove(&(kind, pkid)) {
            let _ = tx.send(reply);
        }
    }

    /// Drop every waiter; their receivers observe a closed channel.
    fn clear(&mut self) {
        self.queued.clear();
        self.inflight.clear();
    }
}

fn lock(pending: &Mutex<Pending>) -> MutexGuard<'_, Pending> {
    match pending.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

// ── MqttLink ─────────────────────────────────────────────────────

pub struct MqttLink {
    client: AsyncClient,
    eventloop: Arc<AsyncMutex<EventLoop>>,
    events: mpsc::UnboundedSender<LinkEvent>,
    pending: Arc<Mutex<Pending>>,
    driver: Mutex<Option<CancellationToken>>,
    reconnect_delay: Duration,
}

impl MqttLink {
    /// Build the client from broker settings. Nothing is dialled until
    /// [`BrokerLink::connect`].
    pub fn new(
        config: &BrokerConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<LinkEvent>), ProtocolError> {
        let (host, port) = parse_address(&config.address)?;
        let client_id = if config.client_id.trim().is_empty() {
            format!("opcon-{}", std::process::id())
        } else {
            config.client_id.clone()
        };

        let mut options = MqttOptions::new(client_id, host, port);
        options.set_keep_alive(config.keep_alive().max(Duration::from_secs(1)));
        options.set_clean_session(true);
        if !config.username.is_empty() {
            options.set_credentials(config.username.clone(), config.password.clone());
        }

        let (client, eventloop) = AsyncClient::new(options, config.request_capacity.max(1));
        let (events, events_rx) = mpsc::unbounded_channel();

        Ok((
            Self {
                client,
                eventloop: Arc::new(AsyncMutex::new(eventloop)),
                events,
                pending: Arc::new(Mutex::new(Pending::default())),
                driver: Mutex::new(None),
                reconnect_delay: config.reconnect_delay(),
            },
            events_rx,
        ))
    }

    /// Queue a request and park its waiter under one lock, so waiters
    /// stay in the order the event loop will write the packets.
    fn submit(
        &self,
        kind: RequestKind,
        on_write: bool,
        request: impl FnOnce(&AsyncClient) -> Result<(), ClientError>,
    ) -> Result<oneshot::Receiver<Reply>, ClientError> {
        let (tx, rx) = oneshot::channel();
        let mut pending = lock(&self.pending);
        request(&self.client)?;
        pending.queued.push_back(Waiter { kind, on_write, tx });
        Ok(rx)
    }

    fn driver_slot(&self) -> MutexGuard<'_, Option<CancellationToken>> {
        match self.driver.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl BrokerLink for MqttLink {
    async fn connect(&self) -> Result<(), ProtocolError> {
        let mut slot = self.driver_slot();
        if slot.as_ref().is_some_and(|t| !t.is_cancelled()) {
            debug!("mqtt event loop already running");
            return Ok(());
        }
        let cancel = CancellationToken::new();
        *slot = Some(cancel.clone());
        drop(slot);

        tokio::spawn(drive(
            Arc::clone(&self.eventloop),
            Arc::clone(&self.pending),
            self.events.clone(),
            cancel,
            self.reconnect_delay,
        ));
        Ok(())
    }

    async fn publish(&self, topic: &str, qos: QoS, payload: Vec<u8>) -> Result<(), ProtocolError> {
        let rx = self
            .submit(RequestKind::Publish, qos == QoS::AtMostOnce, |c| {
                c.try_publish(topic, qos.into(), false, payload)
            })
            .map_err(|e| ProtocolError::PublishFailed {
                reason: e.to_string(),
                capacity: true,
            })?;
        rx.await?.map_err(|reason| ProtocolError::PublishFailed {
            reason,
            capacity: false,
        })
    }

    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), ProtocolError> {
        let failed = |reason: String| ProtocolError::SubscribeFailed {
            topic: topic.to_string(),
            reason,
        };
        let rx = self
            .submit(RequestKind::Subscribe, false, |c| {
                c.try_subscribe(topic, qos.into())
            })
            .map_err(|e| failed(e.to_string()))?;
        rx.await?.map_err(failed)
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), ProtocolError> {
        let failed = |reason: String| ProtocolError::SubscribeFailed {
            topic: topic.to_string(),
            reason,
        };
        let rx = self
            .submit(RequestKind::Unsubscribe, false, |c| c.try_unsubscribe(topic))
            .map_err(|e| failed(e.to_string()))?;
        rx.await?.map_err(failed)
    }

    async fn disconnect(&self) -> Result<(), ProtocolError> {
        if let Err(e) = self.client.try_disconnect() {
            debug!("mqtt disconnect request not queued: {e}");
        }
        if let Some(cancel) = self.driver_slot().take() {
            cancel.cancel();
        }
        lock(&self.pending).clear();
        let _ = self.events.send(LinkEvent::Closed);
        info!("mqtt link closed");
        Ok(())
    }
}

// ── Event loop driver ────────────────────────────────────────────

async fn drive(
    eventloop: Arc<AsyncMutex<EventLoop>>,
    pending: Arc<Mutex<Pending>>,
    events: mpsc::UnboundedSender<LinkEvent>,
    cancel: CancellationToken,
    reconnect_delay: Duration,
) {
    // Held for the life of this driver; a later driver waits here.
    let mut eventloop = eventloop.lock().await;
    let mut loss_reported = false;

    loop {
        let polled = tokio::select! {
            _ = cancel.cancelled() => break,
            polled = eventloop.poll() => polled,
        };

        match polled {
            Ok(Event::Incoming(packet)) => match packet {
                Packet::ConnAck(ack) if ack.code == ConnectReturnCode::Success => {
                    loss_reported = false;
                    info!("mqtt connected (session present: {})", ack.session_present);
                    let _ = events.send(LinkEvent::Connected);
                }
                Packet::Publish(publish) => {
                    let _ = events.send(LinkEvent::Message {
                        topic: publish.topic.clone(),
                        payload: publish.payload.clone(),
                    });
                }
                Packet::PubAck(ack) => lock(&pending).acked(RequestKind::Publish, ack.pkid, Ok(())),
                Packet::PubComp(comp) => {
                    lock(&pending).acked(RequestKind::Publish, comp.pkid, Ok(()));
                }
                Packet::SubAck(ack) => {
                    let reply = if ack
                        .return_codes
                        .iter()
                        .any(|c| matches!(c, SubscribeReasonCode::Failure))
                    {
                        Err("broker rejected the subscription".to_string())
                    } else {
                        Ok(())
                    };
                    lock(&pending).acked(RequestKind::Subscribe, ack.pkid, reply);
                }
                Packet::UnsubAck(ack) => {
                    lock(&pending).acked(RequestKind::Unsubscribe, ack.pkid, Ok(()));
                }
                _ => {}
            },
            Ok(Event::Outgoing(outgoing)) => match outgoing {
                Outgoing::Publish(pkid) => lock(&pending).written(RequestKind::Publish, pkid),
                Outgoing::Subscribe(pkid) => lock(&pending).written(RequestKind::Subscribe, pkid),
                Outgoing::Unsubscribe(pkid) => {
                    lock(&pending).written(RequestKind::Unsubscribe, pkid);
                }
                _ => {}
            },
            Err(e) => {
                if loss_reported {
                    debug!("mqtt reconnect attempt failed: {e}");
                } else {
                    warn!("mqtt connection lost: {e}");
                    let _ = events.send(LinkEvent::ConnectionLost(e.to_string()));
                    loss_reported = true;
                }
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(reconnect_delay) => {}
                }
            }
        }
    }
    debug!("mqtt event loop driver stopped");
}

// ── Tests ────────────────────────────────────────────────────────
