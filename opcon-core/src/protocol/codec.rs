//! Command and acknowledgement envelopes.
//!
//! # Wire format
//!
//! ```text
//! console ──► device   {"id": "camera", "version": "1.0", "method": "property-post",
//!                       "params": {"Camera_state": {"value": 1}}}
//!
//! device  ──► console  {"id": "camera",
//!                       "params": {"ack": {"value": "1700000000000"},
//!                                  "Camera_state": {"value": 1}}}
//! ```
//!
//! The `ack` value is the device's epoch-millisecond timestamp. Echoed
//! channel fields are optional, but when present they must form the
//! channel's complete field set.

use std::fmt;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::config::DeviceTuning;
use crate::error::ProtocolError;
use crate::protocol::channel::{ChannelFields, ChannelId, FieldError, fields, unwrap_value};

/// The method stamped on every command.
pub const METHOD: &str = "property-post";

/// Params key carrying the ack timestamp.
pub const ACK_KEY: &str = "ack";

// ── CommandEnvelope ──────────────────────────────────────────────

/// Outbound command, ready to serialize.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    pub id: String,
    pub version: String,
    pub method: String,
    /// Field name to `{"value": v}`.
    pub params: Map<String, Value>,
}

impl CommandEnvelope {
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(self)
            .map_err(|e| ProtocolError::InvalidCommand(format!("unencodable command: {e}")))
    }

    pub fn channel(&self) -> Option<ChannelId> {
        ChannelId::from_wire(&self.id)
    }
}

// ── AckTimestamp ─────────────────────────────────────────────────

/// Device-side acknowledgement time, UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AckTimestamp(DateTime<Utc>);

impl AckTimestamp {
    pub fn from_millis(ms: i64) -> Option<Self> {
        Utc.timestamp_millis_opt(ms).single().map(Self)
    }

    pub fn millis(&self) -> i64 {
        self.0.timestamp_millis()
    }

    pub fn datetime(&self) -> DateTime<Utc> {
        self.0
    }

    /// Parse the `ack` value: a decimal string or a JSON integer.
    fn parse(v: &Value) -> Result<Self, ProtocolError> {
        let ms = match v {
            Value::String(s) => s.trim().parse::<i64>().ok(),
            Value::Number(n) => n.as_i64(),
            _ => None,
        };
        ms.filter(|ms| *ms >= 0)
            .and_then(Self::from_millis)
            .ok_or_else(|| ProtocolError::MalformedAck(format!("ack timestamp is not epoch millis: {v}")))
    }
}

impl fmt::Display for AckTimestamp {
    /// `seconds.milliseconds UTC`
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{:03} UTC",
            self.0.timestamp(),
            self.0.timestamp_subsec_millis()
        )
    }
}

// ── AckEnvelope ──────────────────────────────────────────────────

/// A decoded, validated acknowledgement.
#[derive(Debug, Clone, PartialEq)]
pub struct AckEnvelope {
    pub channel: ChannelId,
    pub acked_at: AckTimestamp,
    /// Echoed channel state, absent for ack-only messages.
    pub fields: Option<ChannelFields>,
}

// ── Interpreted readings ─────────────────────────────────────────

/// Fan state derived from a reported PWM duty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FanState {
    On,
    Off,
}

/// Brush position derived from the reported 485 angle pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BrushPosition {
    Up,
    Down,
}

// ── ChannelCodec ─────────────────────────────────────────────────

/// Encodes commands and decodes acknowledgements.
#[derive(Debug, Clone)]
pub struct ChannelCodec {
    version: String,
    tuning: DeviceTuning,
}

impl ChannelCodec {
    pub fn new(version: impl Into<String>, tuning: DeviceTuning) -> Self {
        Self {
            version: version.into(),
            tuning,
        }
    }

    pub fn tuning(&self) -> &DeviceTuning {
        &self.tuning
    }

    pub fn encode(&self, fields: &ChannelFields) -> CommandEnvelope {
        let params = fields
            .to_values()
            .into_iter()
            .map(|(k, v)| (k, json!({ "value": v })))
            .collect();
        CommandEnvelope {
            id: fields.channel().wire_id().to_string(),
            version: self.version.clone(),
            method: METHOD.to_string(),
            params,
        }
    }

    /// Decode and sanity-check an inbound acknowledgement.
    pub fn decode_ack(&self, payload: &[u8]) -> Result<AckEnvelope, ProtocolError> {
        let root: Value = serde_json::from_slice(payload)
            .map_err(|e| ProtocolError::MalformedAck(format!("not JSON: {e}")))?;
        let root = root
            .as_object()
            .ok_or_else(|| ProtocolError::MalformedAck("not a JSON object".into()))?;

        let channel = match root.get("id") {
            None | Some(Value::Null) => {
                return Err(ProtocolError::MalformedAck("missing channel id".into()));
            }
            Some(Value::String(id)) => ChannelId::from_wire(id)
                .ok_or_else(|| ProtocolError::MalformedAck(format!("unknown channel id {id:?}")))?,
            Some(other) => {
                return Err(ProtocolError::MalformedAck(format!("channel id is not a string: {other}")));
            }
        };

        let params = root
            .get("params")
            .and_then(Value::as_object)
            .ok_or_else(|| ProtocolError::MalformedAck(format!("{channel} ack has no params")))?;

        let acked_at = params
            .get(ACK_KEY)
            .map(unwrap_value)
            .ok_or_else(|| ProtocolError::MalformedAck(format!("{channel} ack has no timestamp")))
            .and_then(AckTimestamp::parse)?;

        let fields = self.echoed_fields(channel, params)?;

        Ok(AckEnvelope {
            channel,
            acked_at,
            fields,
        })
    }

    fn echoed_fields(
        &self,
        channel: ChannelId,
        params: &Map<String, Value>,
    ) -> Result<Option<ChannelFields>, ProtocolError> {
        let names = channel.field_names();
        let present = names.iter().filter(|n| params.contains_key(**n)).count();
        if present == 0 {
            return Ok(None);
        }
        if present < names.len() {
            return Err(ProtocolError::MalformedAck(format!(
                "{channel} ack echoes {present} of {} fields",
                names.len()
            )));
        }

        let fields = ChannelFields::read(channel, params).map_err(|e| match e {
            FieldError::Missing(field) => {
                ProtocolError::MalformedAck(format!("{channel} ack lacks {field}"))
            }
            FieldError::Invalid { field, detail } => {
                ProtocolError::UnexpectedAckValue { field, detail }
            }
        })?;

        match &fields {
            ChannelFields::Motor485 { angle_1, angle_2, .. } => {
                self.classify_brush(*angle_1, *angle_2)?;
            }
            ChannelFields::Pwm { duty } => {
                self.classify_fan(*duty)?;
            }
            _ => {}
        }
        Ok(Some(fields))
    }

    /// Classify a reported duty against the fan thresholds.
    pub fn classify_fan(&self, duty: f64) -> Result<FanState, ProtocolError> {
        if duty.is_finite() && duty >= self.tuning.fan_on_duty {
            Ok(FanState::On)
        } else if duty.is_finite() && duty <= self.tuning.fan_off_duty {
            Ok(FanState::Off)
        } else {
            Err(ProtocolError::UnexpectedAckValue {
                field: fields::DUTY,
                detail: format!(
                    "{duty} is neither on (>= {}) nor off (<= {})",
                    self.tuning.fan_on_duty, self.tuning.fan_off_duty
                ),
            })
        }
    }

    /// Match a reported angle pair against the up/down reference pairs.
    pub fn classify_brush(&self, angle_1: f64, angle_2: f64) -> Result<BrushPosition, ProtocolError> {
        let t = &self.tuning;
        let near = |a: f64, b: f64| (a - b).abs() <= t.angle_tolerance;
        if near(angle_1, t.motor485_1_up) && near(angle_2, t.motor485_2_up) {
            Ok(BrushPosition::Up)
        } else if near(angle_1, t.motor485_1_down) && near(angle_2, t.motor485_2_down) {
            Ok(BrushPosition::Down)
        } else {
            Err(ProtocolError::UnexpectedAckValue {
                field: fields::ANGLE485_1,
                detail: format!("({angle_1}, {angle_2}) matches neither the up nor the down pair"),
            })
        }
    }

    /// The 485 command that drives the brush to `position`.
    pub fn brush_command(&self, position: BrushPosition) -> ChannelFields {
        let t = &self.tuning;
        let (angle_1, angle_2) = match position {
            BrushPosition::Up => (t.motor485_1_up, t.motor485_2_up),
            BrushPosition::Down => (t.motor485_1_down, t.motor485_2_down),
        };
        ChannelFields::Motor485 {
            angle_1,
            angle_2,
            kind: t.motor485_type,
        }
    }

    /// CAN move to an absolute angle.
    pub fn position_command(&self, angle: f64) -> ChannelFields {
        ChannelFields::CanPosition {
            angle,
            current: self.tuning.motor_current,
            speed: self.tuning.angle_speed,
            mode: self.tuning.can_position_mode,
        }
    }

    /// CAN run at a constant speed.
    pub fn speed_command(&self, speed: f64) -> ChannelFields {
        ChannelFields::CanSpeed {
            speed,
            current: self.tuning.motor_current,
            mode: self.tuning.can_speed_mode,
        }
    }

    /// The PWM command that switches the fan.
    pub fn fan_command(&self, state: FanState) -> ChannelFields {
        let duty = match state {
            FanState::On => self.tuning.fan_run_duty,
            FanState::Off => 0.0,
        };
        ChannelFields::Pwm { duty }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::relay::RelayMask;

    fn codec() -> ChannelCodec {
        ChannelCodec::new("1.0", DeviceTuning::default())
    }

    /// Turn an encoded command into the ack a device would echo.
    fn echo(envelope: &CommandEnvelope, ack_ms: &str) -> Vec<u8> {
        let mut params = envelope.params.clone();
        params.insert("ack".into(), json!({ "value": ack_ms }));
        serde_json::to_vec(&json!({ "id": envelope.id, "params": params })).unwrap()
    }

    #[test]
    fn encode_wraps_values() {
        let env = codec().encode(&ChannelFields::Camera { on: true });
        let wire: Value = serde_json::from_slice(&env.to_bytes().unwrap()).unwrap();
        assert_eq!(wire["id"], "camera");
        assert_eq!(wire["version"], "1.0");
        assert_eq!(wire["method"], "property-post");
        assert_eq!(wire["params"]["Camera_state"]["value"], 1);
        assert_eq!(env.channel(), Some(ChannelId::Camera));
    }

    #[test]
    fn round_trips_every_channel() {
        let codec = codec();
        let samples = [
            ChannelFields::Camera { on: true },
            codec.position_command(-45.5),
            codec.speed_command(12.5),
            codec.brush_command(BrushPosition::Down),
            ChannelFields::Relay { status: RelayMask::from_bits_retain(0xA5) },
            codec.fan_command(FanState::On),
        ];
        for fields in samples {
            let sent = codec.encode(&fields);
            let ack = codec.decode_ack(&echo(&sent, "1700000000000")).unwrap();
            assert_eq!(ack.fields.as_ref(), Some(&fields));
            assert_eq!(codec.encode(&ack.fields.unwrap()), sent);
        }
    }

    #[test]
    fn ack_only_message() {
        let ack = codec()
            .decode_ack(br#"{"id":"relay","params":{"ack":{"value":"1700000000000"}}}"#)
            .unwrap();
        assert_eq!(ack.channel, ChannelId::Relay);
        assert_eq!(ack.acked_at.millis(), 1_700_000_000_000);
        assert_eq!(ack.acked_at.to_string(), "1700000000.000 UTC");
        assert!(ack.fields.is_none());
    }

    #[test]
    fn legacy_id_and_integer_timestamp() {
        let ack = codec()
            .decode_ack(br#"{"id":"006","params":{"ack":1700000000123,"Camera_state":0}}"#)
            .unwrap();
        assert_eq!(ack.channel, ChannelId::Camera);
        assert_eq!(ack.acked_at.to_string(), "1700000000.123 UTC");
        assert_eq!(ack.fields, Some(ChannelFields::Camera { on: false }));
    }

    #[test]
    fn missing_or_null_id_is_malformed() {
        let codec = codec();
        for payload in [
            &br#"{"params":{"ack":{"value":"1"}}}"#[..],
            br#"{"id":null,"params":{"ack":{"value":"1"}}}"#,
            br#"{"id":"lamp","params":{"ack":{"value":"1"}}}"#,
            br#"[1,2,3]"#,
            b"\xff\xfe",
        ] {
            assert!(matches!(
                codec.decode_ack(payload),
                Err(ProtocolError::MalformedAck(_))
            ));
        }
    }

    #[test]
    fn bad_timestamp_is_malformed() {
        let codec = codec();
        for payload in [
            &br#"{"id":"relay","params":{}}"#[..],
            br#"{"id":"relay","params":{"ack":{"value":"soon"}}}"#,
            br#"{"id":"relay","params":{"ack":{"value":"-5"}}}"#,
            br#"{"id":"relay"}"#,
        ] {
            assert!(matches!(
                codec.decode_ack(payload),
                Err(ProtocolError::MalformedAck(_))
            ));
        }
    }

    #[test]
    fn partial_echo_is_malformed() {
        let err = codec()
            .decode_ack(br#"{"id":"can_speed","params":{"ack":"1","speed2":5.0}}"#)
            .unwrap_err();
        assert!(matches!(err, ProtocolError::MalformedAck(_)));
    }

    #[test]
    fn sanity_predicates() {
        let codec = codec();
        let cases: [(&[u8], &str); 5] = [
            (br#"{"id":"relay","params":{"ack":"1","status":"XZ"}}"#, "status"),
            (br#"{"id":"camera","params":{"ack":"1","Camera_state":3}}"#, "Camera_state"),
            (
                br#"{"id":"motor485","params":{"ack":"1","angle485_1":10,"angle485_2":90,"type":1}}"#,
                "angle485_1",
            ),
            (br#"{"id":"pwm","params":{"ack":"1","duty":2.5}}"#, "duty"),
            (
                br#"{"id":"can_position","params":{"ack":"1","angle":1,"current":30,"speed":"fast","mode":1}}"#,
                "speed",
            ),
        ];
        for (payload, expected) in cases {
            match codec.decode_ack(payload) {
                Err(ProtocolError::UnexpectedAckValue { field, .. }) => assert_eq!(field, expected),
                other => panic!("expected UnexpectedAckValue for {expected}, got {other:?}"),
            }
        }
    }

    #[test]
    fn brush_within_tolerance() {
        let codec = codec();
        assert_eq!(codec.classify_brush(89.8, 90.3).unwrap(), BrushPosition::Up);
        assert_eq!(codec.classify_brush(-90.0, -89.6).unwrap(), BrushPosition::Down);
        assert!(codec.classify_brush(90.0, -90.0).is_err());
    }

    #[test]
    fn fan_thresholds() {
        let codec = codec();
        assert_eq!(codec.classify_fan(5.2).unwrap(), FanState::On);
        assert_eq!(codec.classify_fan(0.0).unwrap(), FanState::Off);
        assert_eq!(codec.classify_fan(0.02).unwrap(), FanState::Off);
        assert!(codec.classify_fan(1.0).is_err());
        assert!(codec.classify_fan(f64::NAN).is_err());
    }
}
