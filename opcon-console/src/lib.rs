//! # opcon-console
//!
//! Headless operator console: decodes the device's live video in the
//! background and drives its channels over MQTT from stdin commands.

pub mod config;
pub mod console;
pub mod input;

pub use config::ConsoleConfig;
pub use console::Console;
