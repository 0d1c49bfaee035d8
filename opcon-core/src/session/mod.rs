//! Operator session over the command/ack protocol.
//!
//! - [`observer`]: reports delivered to the hosting application
//! - [`reconcile`]: the device model commands and acks update
//! - [`control`]: [`ControlSession`], the rate-limited command path

pub mod control;
pub mod observer;
pub mod reconcile;

pub use control::ControlSession;
pub use observer::{
    AckReport, ProtocolErrorEvent, Reconciliation, SessionEvent, SessionObserver, ToggleControl,
    ToggleOutcome,
};
pub use reconcile::{DeviceState, ToggleState};
