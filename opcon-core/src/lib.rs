//! # opcon-core
//!
//! Core library for the opcon remote-operation console.
//!
//! This crate contains:
//! - **Video**: `StreamDecoder`, a cancellable background RTMP/RTSP decode
//!   loop delivering RGB24 frames, and its FFmpeg pipeline
//! - **Transport**: `ProtocolTransport` over a `BrokerLink` (MQTT via
//!   `rumqttc`), with subscription replay and a `RateLimiter`
//! - **Protocol**: `ChannelCodec` for the JSON command/ack envelopes
//! - **Session**: `ControlSession`, tying commands, acks and the device
//!   model together behind a `SessionObserver`
//! - **Config**: serde value objects injected into each component
//! - **Error**: `DecodeError`, `ProtocolError` and `ConsoleError`

pub mod config;
pub mod error;
pub mod protocol;
pub mod session;
pub mod transport;
pub mod video;

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use config::{BrokerConfig, DeviceTuning, RateLimitConfig, StreamOptions};
pub use error::{ConsoleError, DecodeError, DecodeErrorKind, ProtocolError};
pub use protocol::{
    AckEnvelope, AckTimestamp, BrushPosition, ChannelCodec, ChannelFields, ChannelId,
    CommandEnvelope, FanState, RelayAction, RelayBank, RelayMask,
};
pub use session::{
    AckReport, ControlSession, DeviceState, ProtocolErrorEvent, Reconciliation, SessionEvent,
    SessionObserver, ToggleControl, ToggleOutcome,
};
pub use transport::{
    BrokerLink, LinkEvent, LinkPhase, MqttLink, ProtocolTransport, QoS, RateLimiter,
    SubscriptionRegistry, TransportConfig, TransportEvent,
};
pub use video::{
    DecodedFrame, DecoderState, FfmpegFactory, FrameStats, RgbBuffer, StreamDecoder,
    StreamGeometry, StreamSession,
};
