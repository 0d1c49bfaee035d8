//! Configuration value objects injected into each component.
//!
//! Nothing here is global: the hosting application builds these (usually
//! from a TOML file) and hands them to the constructors that need them.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::transport::QoS;

// ── StreamOptions ────────────────────────────────────────────────

/// Low-latency options applied when opening a video stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamOptions {
    /// Force reliable, ordered (TCP) transport for RTSP.
    pub force_tcp: bool,
    /// Disable demuxer input buffering.
    pub no_buffer: bool,
    /// Low-delay decoding.
    pub low_delay: bool,
    /// Zero-latency tuning (no demuxer reordering delay).
    pub zero_latency: bool,
    /// Allow corrupt or late frames to be dropped.
    pub frame_drop: bool,
    /// Probe size in bytes used for stream discovery.
    pub probe_size: u32,
    /// Decoder frame threads.
    pub decode_threads: u32,
    /// Network open/read timeout in milliseconds.
    pub io_timeout_ms: u64,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            force_tcp: true,
            no_buffer: true,
            low_delay: true,
            zero_latency: true,
            frame_drop: true,
            probe_size: 32,
            decode_threads: 4,
            io_timeout_ms: 5_000,
        }
    }
}

impl StreamOptions {
    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }
}

// ── BrokerConfig ─────────────────────────────────────────────────

/// Broker connection and topic settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// `tcp://host:port`, `mqtt://host:port` or `host:port`.
    pub address: String,
    pub client_id: String,
    pub username: String,
    pub password: String,
    /// Keep-alive interval in seconds.
    pub keep_alive_secs: u64,
    /// Topic commands are published on.
    pub command_topic: String,
    /// Topic acknowledgements arrive on.
    pub ack_topic: String,
    pub command_qos: QoS,
    pub ack_qos: QoS,
    /// Protocol version stamped into every envelope.
    pub protocol_version: String,
    pub connect_timeout_ms: u64,
    /// Upper bound a publish waits for the broker acknowledgement.
    pub publish_timeout_ms: u64,
    pub subscribe_timeout_ms: u64,
    /// Pause between reconnect attempts.
    pub reconnect_delay_ms: u64,
    /// Capacity of the outbound request queue.
    pub request_capacity: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            address: "tcp://127.0.0.1:1883".into(),
            client_id: "opcon-console".into(),
            username: String::new(),
            password: String::new(),
            keep_alive_secs: 60,
            command_topic: "/opcon/device/command".into(),
            ack_topic: "/opcon/device/ack".into(),
            command_qos: QoS::AtLeastOnce,
            ack_qos: QoS::AtLeastOnce,
            protocol_version: "1.0".into(),
            connect_timeout_ms: 10_000,
            publish_timeout_ms: 10_000,
            subscribe_timeout_ms: 10_000,
            reconnect_delay_ms: 2_000,
            request_capacity: 16,
        }
    }
}

impl BrokerConfig {
    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }

    pub fn subscribe_timeout(&self) -> Duration {
        Duration::from_millis(self.subscribe_timeout_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

// ── RateLimitConfig ──────────────────────────────────────────────

/// Sliding-window admission limit for outbound commands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub max_per_window: usize,
    pub window_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_per_window: 5,
            window_ms: 1_000,
        }
    }
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

// ── DeviceTuning ─────────────────────────────────────────────────

/// Device constants shared by the console and the ack sanity checks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceTuning {
    /// Current limit sent with CAN motor commands.
    pub motor_current: i32,
    /// Step applied by the faster/slower speed controls.
    pub speed_delta: f64,
    /// Step applied by angle controls.
    pub angle_delta: f64,
    /// Speed used for CAN position moves.
    pub angle_speed: i32,
    /// `mode` sent with CAN position commands.
    pub can_position_mode: i32,
    /// `mode` sent with CAN speed commands.
    pub can_speed_mode: i32,
    /// 485 motor reference angles for the fully-down position.
    pub motor485_1_down: f64,
    pub motor485_2_down: f64,
    /// 485 motor reference angles for the fully-up position.
    pub motor485_1_up: f64,
    pub motor485_2_up: f64,
    /// Allowed deviation when matching reported 485 angles.
    pub angle_tolerance: f64,
    /// `type` field sent with 485 moves.
    pub motor485_type: i32,
    /// Reported fan duty at or above this is "on".
    pub fan_on_duty: f64,
    /// Reported fan duty at or below this is "off".
    pub fan_off_duty: f64,
    /// Duty sent when the fan is switched on.
    pub fan_run_duty: f64,
    /// Number of reported motor speeds retained.
    pub speed_history: usize,
}

impl Default for DeviceTuning {
    fn default() -> Self {
        Self {
            motor_current: 30,
            speed_delta: 5.0,
            angle_delta: 90.0,
            angle_speed: 10,
            can_position_mode: 1,
            can_speed_mode: 2,
            motor485_1_down: -90.0,
            motor485_2_down: -90.0,
            motor485_1_up: 90.0,
            motor485_2_up: 90.0,
            angle_tolerance: 0.5,
            motor485_type: 1,
            fan_on_duty: 5.2,
            fan_off_duty: 0.02,
            fan_run_duty: 50.0,
            speed_history: 32,
        }
    }
}
