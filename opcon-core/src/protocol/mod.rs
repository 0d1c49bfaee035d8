//! Device channel protocol: JSON command/ack envelopes over the broker.
//!
//! - [`channel`]: channel ids and their closed field schemas
//! - [`codec`]: envelope encoding, ack decoding and sanity checks
//! - [`relay`]: relay masks and the intent/observed relay bank

pub mod channel;
pub mod codec;
pub mod relay;

pub use channel::{ChannelFields, ChannelId};
pub use codec::{
    AckEnvelope, AckTimestamp, BrushPosition, ChannelCodec, CommandEnvelope, FanState, METHOD,
};
pub use relay::{RelayAction, RelayBank, RelayMask};
