//! `ControlSession`: rate-limited commands out, reconciled acks in.
//!
//! ```text
//!  send_command ──► encode ──► RateLimiter ──► ProtocolTransport::publish
//!        │ rejected                                  │ failed
//!        └──────────────► error queue ◄──────────────┘
//!                              │
//!  TransportEvent ──────► dispatcher task ──► decode_ack ──► DeviceState
//!                              │
//!                              └──► SessionObserver (one call at a time)
//! ```
//!
//! The dispatcher never publishes; inbound handling only updates the
//! device model and notifies the observer.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{BrokerConfig, DeviceTuning, RateLimitConfig};
use crate::error::ProtocolError;
use crate::protocol::{ChannelCodec, ChannelFields, ChannelId, RelayAction, RelayMask};
use crate::session::observer::{AckReport, ProtocolErrorEvent, SessionObserver};
use crate::session::reconcile::DeviceState;
use crate::transport::{
    Admission, LinkPhase, ProtocolTransport, QoS, RateLimiter, TransportEvent,
};

pub struct ControlSession {
    transport: Arc<ProtocolTransport>,
    codec: Arc<ChannelCodec>,
    limiter: RateLimiter,
    state: Arc<Mutex<DeviceState>>,
    command_topic: String,
    command_qos: QoS,
    errors: mpsc::UnboundedSender<ProtocolErrorEvent>,
    cancel: CancellationToken,
    dispatcher: Option<JoinHandle<()>>,
}

fn lock(state: &Mutex<DeviceState>) -> MutexGuard<'_, DeviceState> {
    match state.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl ControlSession {
    /// Subscribe to the ack topic and start the dispatcher.
    ///
    /// The transport may still be disconnected; the subscription is
    /// then issued on connect.
    pub async fn start(
        transport: ProtocolTransport,
        events: mpsc::UnboundedReceiver<TransportEvent>,
        broker: &BrokerConfig,
        rate_limit: &RateLimitConfig,
        tuning: DeviceTuning,
        observer: impl SessionObserver,
    ) -> Result<Self, ProtocolError> {
        transport.subscribe(&broker.ack_topic, broker.ack_qos).await?;

        let transport = Arc::new(transport);
        let codec = Arc::new(ChannelCodec::new(broker.protocol_version.clone(), tuning.clone()));
        let state = Arc::new(Mutex::new(DeviceState::new(&tuning)));
        let (errors, errors_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let dispatcher = tokio::spawn(dispatch(
            events,
            errors_rx,
            Arc::clone(&codec),
            Arc::clone(&state),
            observer,
            cancel.clone(),
        ));

        info!(
            "control session started (commands on {}, acks on {})",
            broker.command_topic, broker.ack_topic
        );

        Ok(Self {
            transport,
            codec,
            limiter: RateLimiter::from_config(rate_limit),
            state,
            command_topic: broker.command_topic.clone(),
            command_qos: broker.command_qos,
            errors,
            cancel,
            dispatcher: Some(dispatcher),
        })
    }

    pub async fn connect(&self) -> Result<(), ProtocolError> {
        self.transport.connect().await
    }

    /// Encode, admit and publish one command.
    ///
    /// A rejected or failed command is also reported to the observer.
    pub async fn send_command(&self, fields: ChannelFields) -> Result<(), ProtocolError> {
        let channel = fields.channel();
        fields.validate()?;
        let payload = self.codec.encode(&fields).to_bytes()?;

        if self.limiter.try_admit(Instant::now()) == Admission::Rejected {
            let err = ProtocolError::RateLimited {
                max_per_window: self.limiter.max_per_window(),
                window: self.limiter.window(),
            };
            warn!("{channel} command dropped: {err}");
            self.report(err.clone(), channel);
            return Err(err);
        }

        lock(&self.state).record_command(&fields, &self.codec);

        match self
            .transport
            .publish(&self.command_topic, payload, self.command_qos)
            .await
        {
            Ok(()) => {
                debug!("{channel} command published");
                Ok(())
            }
            Err(err) => {
                warn!("{channel} command failed: {err}");
                lock(&self.state).clear_pending(channel);
                self.report(err.clone(), channel);
                Err(err)
            }
        }
    }

    /// Validate a plain field map against `channel` and send it.
    pub async fn send_fields(
        &self,
        channel: ChannelId,
        fields: &Map<String, Value>,
    ) -> Result<(), ProtocolError> {
        let fields = ChannelFields::from_field_map(channel, fields)?;
        self.send_command(fields).await
    }

    /// Flip one relay in the operator selection. Nothing is sent.
    pub fn toggle_relay(&self, index: u8) -> Result<RelayMask, ProtocolError> {
        lock(&self.state).relays.toggle(index)
    }

    pub fn set_relay_intent(&self, mask: RelayMask) {
        lock(&self.state).relays.set_intent(mask);
    }

    /// Send the relay mask derived for `action`.
    pub async fn send_relay(&self, action: RelayAction) -> Result<RelayMask, ProtocolError> {
        let status = lock(&self.state).relays.mask_for(action);
        self.send_command(ChannelFields::Relay { status }).await?;
        Ok(status)
    }

    pub fn device_snapshot(&self) -> DeviceState {
        lock(&self.state).clone()
    }

    /// Channels whose controls stay disabled until their ack arrives.
    pub fn pending_channels(&self) -> Vec<ChannelId> {
        lock(&self.state).pending_channels()
    }

    pub fn connection_phase(&self) -> LinkPhase {
        self.transport.phase()
    }

    pub fn codec(&self) -> &ChannelCodec {
        &self.codec
    }

    /// Stop the dispatcher and close the broker link.
    pub async fn shutdown(mut self) -> Result<(), ProtocolError> {
        self.cancel.cancel();
        if let Some(dispatcher) = self.dispatcher.take() {
            if let Err(e) = dispatcher.await {
                warn!("session dispatcher ended abnormally: {e}");
            }
        }
        let result = self.transport.disconnect().await;
        info!("control session shut down");
        result
    }

    fn report(&self, error: ProtocolError, channel: ChannelId) {
        let _ = self
            .errors
            .send(ProtocolErrorEvent::new(error, Some(channel)));
    }
}

impl Drop for ControlSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// ── Dispatcher ───────────────────────────────────────────────────

async fn dispatch(
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
    mut errors: mpsc::UnboundedReceiver<ProtocolErrorEvent>,
    codec: Arc<ChannelCodec>,
    state: Arc<Mutex<DeviceState>>,
    mut observer: impl SessionObserver,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            Some(event) = errors.recv() => observer.on_protocol_error(&event),
            event = events.recv() => match event {
                Some(event) => handle_event(event, &codec, &state, &mut observer),
                None => break,
            },
        }
    }
    debug!("session dispatcher stopped");
}

fn handle_event(
    event: TransportEvent,
    codec: &ChannelCodec,
    state: &Mutex<DeviceState>,
    observer: &mut impl SessionObserver,
) {
    match event {
        TransportEvent::Connected => observer.on_connection_changed(true),
        TransportEvent::ConnectionLost(_) => observer.on_connection_changed(false),
        TransportEvent::Error(error) => {
            observer.on_protocol_error(&ProtocolErrorEvent::new(error, None));
        }
        TransportEvent::Inbound { payload, .. } => match codec.decode_ack(&payload) {
            Ok(ack) => {
                let reconciliation = lock(state).apply_ack(&ack, codec);
                debug!("{} ack at {}", ack.channel, ack.acked_at);
                observer.on_ack_received(&AckReport {
                    channel: ack.channel,
                    acked_at: ack.acked_at,
                    fields: ack.fields,
                    reconciliation,
                });
            }
            Err(e) => warn!("discarding ack: {e}"),
        },
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::observer::SessionEvent;
    use crate::transport::{BrokerLink, LinkEvent, TransportConfig};
    use async_trait::async_trait;
    use bytes::Bytes;

    #[derive(Default)]
    struct RecordingLink {
        published: Mutex<Vec<(String, Vec<u8>)>>,
        events: Mutex<Option<mpsc::UnboundedSender<LinkEvent>>>,
    }

    #[async_trait]
    impl BrokerLink for RecordingLink {
        async fn connect(&self) -> Result<(), ProtocolError> {
            if let Some(tx) = self.events.lock().unwrap().as_ref() {
                tx.send(LinkEvent::Connected).unwrap();
            }
            Ok(())
        }
        async fn publish(&self, topic: &str, _qos: QoS, payload: Vec<u8>) -> Result<(), ProtocolError> {
            self.published.lock().unwrap().push((topic.to_string(), payload));
            Ok(())
        }
        async fn subscribe(&self, _topic: &str, _qos: QoS) -> Result<(), ProtocolError> {
            Ok(())
        }
        async fn unsubscribe(&self, _topic: &str) -> Result<(), ProtocolError> {
            Ok(())
        }
        async fn disconnect(&self) -> Result<(), ProtocolError> {
            Ok(())
        }
    }

    async fn session(
        rate_limit: RateLimitConfig,
    ) -> (
        Arc<RecordingLink>,
        ControlSession,
        mpsc::UnboundedReceiver<SessionEvent>,
    ) {
        let broker = BrokerConfig::default();
        let link = Arc::new(RecordingLink::default());
        let (link_tx, link_rx) = mpsc::unbounded_channel();
        *link.events.lock().unwrap() = Some(link_tx);
        let (transport, events) =
            ProtocolTransport::new(link.clone(), link_rx, TransportConfig::from_broker(&broker));
        let (observer, observed) = mpsc::unbounded_channel();
        let session = ControlSession::start(
            transport,
            events,
            &broker,
            &rate_limit,
            DeviceTuning::default(),
            observer,
        )
        .await
        .unwrap();
        session.connect().await.unwrap();
        (link, session, observed)
    }

    #[tokio::test]
    async fn rate_limited_command_is_not_published() {
        let (link, session, mut observed) = session(RateLimitConfig {
            max_per_window: 1,
            window_ms: 60_000,
        })
        .await;
        assert_eq!(observed.recv().await, Some(SessionEvent::Connection(true)));

        session.send_command(ChannelFields::Camera { on: true }).await.unwrap();
        let err = session
            .send_command(ChannelFields::Camera { on: false })
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::RateLimited { .. }));
        assert_eq!(link.published.lock().unwrap().len(), 1);

        match observed.recv().await {
            Some(SessionEvent::ProtocolError(event)) => {
                assert!(event.rate_limited);
                assert_eq!(event.channel, Some(ChannelId::Camera));
            }
            other => panic!("expected rate-limit report, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn relay_actions_use_derived_masks() {
        let (link, session, _observed) = session(RateLimitConfig::default()).await;
        session.set_relay_intent(RelayMask::from_bits_retain(0b101));
        assert_eq!(session.toggle_relay(1).unwrap().bits(), 0b111);
        assert!(session.toggle_relay(9).is_err());

        let sent = session.send_relay(RelayAction::Sync).await.unwrap();
        assert_eq!(sent.bits(), 0b111);

        let published = link.published.lock().unwrap();
        let wire: Value = serde_json::from_slice(&published[0].1).unwrap();
        assert_eq!(wire["id"], "relay");
        assert_eq!(wire["params"]["status"]["value"], "07");
    }

    #[tokio::test]
    async fn invalid_field_map_is_rejected_before_admission() {
        let (link, session, _observed) = session(RateLimitConfig::default()).await;
        let mut fields = Map::new();
        fields.insert("duty".into(), Value::from("fast"));
        let err = session.send_fields(ChannelId::Pwm, &fields).await.unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidCommand(_)));
        assert!(link.published.lock().unwrap().is_empty());
        assert!(session.pending_channels().is_empty());
    }

    #[tokio::test]
    async fn non_finite_command_is_rejected_before_admission() {
        let (link, session, _observed) = session(RateLimitConfig {
            max_per_window: 1,
            window_ms: 60_000,
        })
        .await;

        let err = session
            .send_command(ChannelFields::CanSpeed {
                speed: f64::INFINITY,
                current: 30,
                mode: 2,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidCommand(_)));
        let fan = session.codec().fan_command(crate::protocol::FanState::On);
        assert!(session.send_command(ChannelFields::Pwm { duty: f64::NAN }).await.is_err());
        assert!(session.pending_channels().is_empty());
        assert!(link.published.lock().unwrap().is_empty());

        // The single window slot is still free.
        session.send_command(fan).await.unwrap();
        assert_eq!(link.published.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn malformed_ack_is_not_delivered() {
        let (link, session, mut observed) = session(RateLimitConfig::default()).await;
        assert_eq!(observed.recv().await, Some(SessionEvent::Connection(true)));

        session.send_command(ChannelFields::Camera { on: true }).await.unwrap();
        let tx = link.events.lock().unwrap().clone().unwrap();
        let ack_topic = BrokerConfig::default().ack_topic;
        tx.send(LinkEvent::Message {
            topic: ack_topic.clone(),
            payload: Bytes::from_static(br#"{"id":null,"params":{"ack":{"value":"1"}}}"#),
        })
        .unwrap();
        tx.send(LinkEvent::Message {
            topic: ack_topic,
            payload: Bytes::from_static(br#"{"id":"camera","params":{"ack":{"value":"2"}}}"#),
        })
        .unwrap();

        match observed.recv().await {
            Some(SessionEvent::Ack(report)) => {
                assert_eq!(report.channel, ChannelId::Camera);
                assert_eq!(report.acked_at.millis(), 2);
                assert!(report.fields.is_none());
            }
            other => panic!("expected the camera ack, got {other:?}"),
        }
        assert!(session.pending_channels().is_empty());
    }
}
