//! Domain-specific error types for the operator console.
//!
//! Each subsystem owns a typed error enum. Library-level failures
//! (I/O, FFmpeg tooling, MQTT client, JSON) are converted into these at
//! the subsystem boundary and never escape as raw errors.

use std::time::Duration;
use thiserror::Error;

// ── DecodeError ──────────────────────────────────────────────────

/// Terminal failures of a video decode session.
///
/// Every variant ends the current session and is reported exactly
/// once through the decoder's error callback. There is no automatic
/// retry; the caller decides whether to start a new session.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DecodeError {
    /// The stream could not be opened or its stream info discovered.
    #[error("failed to open stream: {0}")]
    OpenFailed(String),

    /// The stream carries no video track.
    #[error("no video stream found: {0}")]
    NoVideoStream(String),

    /// A mid-stream read failed for a reason other than end-of-stream.
    #[error("stream read failed: {0}")]
    ReadFailed(String),

    /// The video codec could not be opened.
    #[error("failed to open codec: {0}")]
    CodecOpenFailed(String),

    /// The colour-space conversion context could not be created.
    #[error("failed to initialise colour conversion: {0}")]
    ConvertInitFailed(String),
}

/// Fieldless discriminant of [`DecodeError`] for UI consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DecodeErrorKind {
    OpenFailed,
    NoVideoStream,
    ReadFailed,
    CodecOpenFailed,
    ConvertInitFailed,
}

impl DecodeError {
    pub fn kind(&self) -> DecodeErrorKind {
        match self {
            Self::OpenFailed(_) => DecodeErrorKind::OpenFailed,
            Self::NoVideoStream(_) => DecodeErrorKind::NoVideoStream,
            Self::ReadFailed(_) => DecodeErrorKind::ReadFailed,
            Self::CodecOpenFailed(_) => DecodeErrorKind::CodecOpenFailed,
            Self::ConvertInitFailed(_) => DecodeErrorKind::ConvertInitFailed,
        }
    }

    /// The human-readable detail without the kind prefix.
    pub fn message(&self) -> &str {
        match self {
            Self::OpenFailed(m)
            | Self::NoVideoStream(m)
            | Self::ReadFailed(m)
            | Self::CodecOpenFailed(m)
            | Self::ConvertInitFailed(m) => m,
        }
    }
}

// ── ProtocolError ────────────────────────────────────────────────

/// Failures of the command/acknowledgement protocol client.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ProtocolError {
    // ── Connection ───────────────────────────────────────────────
    /// The broker connection could not be established.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    // ── Outbound ─────────────────────────────────────────────────
    /// A publish was neither acknowledged nor rejected in time.
    #[error("publish to {topic} timed out after {after:?}")]
    PublishTimeout { topic: String, after: Duration },

    /// The transport refused or lost a publish.
    ///
    /// `capacity` is set when the refusal came from a full request queue.
    #[error("publish failed: {reason}")]
    PublishFailed { reason: String, capacity: bool },

    /// A subscribe or unsubscribe request failed.
    #[error("subscribe to {topic} failed: {reason}")]
    SubscribeFailed { topic: String, reason: String },

    /// The outbound rate limiter rejected the command.
    #[error("rate limited: more than {max_per_window} commands in {window:?}")]
    RateLimited {
        max_per_window: usize,
        window: Duration,
    },

    /// A UI field map did not match the channel schema.
    #[error("invalid command: {0}")]
    InvalidCommand(String),

    // ── Inbound ──────────────────────────────────────────────────
    /// An inbound acknowledgement lacked a channel id or ack timestamp.
    #[error("malformed ack: {0}")]
    MalformedAck(String),

    /// An inbound acknowledgement carried a value that fails the
    /// channel's sanity predicate.
    #[error("unexpected ack value for {field}: {detail}")]
    UnexpectedAckValue { field: &'static str, detail: String },

    // ── Internal ─────────────────────────────────────────────────
    /// A connection phase change that the state machine does not allow.
    #[error("invalid transition: {0}")]
    InvalidTransition(&'static str),

    /// A background task or channel went away.
    #[error("channel closed")]
    ChannelClosed,
}

impl ProtocolError {
    /// Whether the failure means the command never left the client
    /// because of a capacity or rate limit.
    ///
    /// The UI re-enables any control it disabled pending an ack when
    /// this is set.
    pub fn is_capacity(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. } | Self::PublishFailed { capacity: true, .. }
        )
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for ProtocolError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        ProtocolError::ChannelClosed
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for ProtocolError {
    fn from(_: tokio::sync::oneshot::error::RecvError) -> Self {
        ProtocolError::ChannelClosed
    }
}

// ── ConsoleError ─────────────────────────────────────────────────

/// The canonical error type for hosting applications.
#[derive(Debug, Error)]
pub enum ConsoleError {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The TCP/IO layer reported an error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration could not be parsed or is inconsistent.
    #[error("invalid configuration: {0}")]
    Config(String),
}
