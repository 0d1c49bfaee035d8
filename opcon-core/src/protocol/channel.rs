//! Device channels and their closed field schemas.
//!
//! Every command and every echoed acknowledgement concerns exactly one
//! channel. Field values travel either bare or wrapped as
//! `{"value": v}`; readers here accept both.

use std::fmt;
use std::str::FromStr;

use serde_json::{Map, Value, json};

use crate::error::ProtocolError;
use crate::protocol::relay::RelayMask;

// ── ChannelId ────────────────────────────────────────────────────

/// A device channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelId {
    Camera,
    CanPosition,
    CanSpeed,
    Motor485,
    Relay,
    Pwm,
}

impl ChannelId {
    pub const ALL: [ChannelId; 6] = [
        ChannelId::Camera,
        ChannelId::CanPosition,
        ChannelId::CanSpeed,
        ChannelId::Motor485,
        ChannelId::Relay,
        ChannelId::Pwm,
    ];

    /// The `id` emitted in command envelopes.
    pub fn wire_id(self) -> &'static str {
        match self {
            ChannelId::Camera => "camera",
            ChannelId::CanPosition => "can_position",
            ChannelId::CanSpeed => "can_speed",
            ChannelId::Motor485 => "motor485",
            ChannelId::Relay => "relay",
            ChannelId::Pwm => "pwm",
        }
    }

    /// Numeric code used by older device firmware.
    pub fn legacy_code(self) -> &'static str {
        match self {
            ChannelId::CanPosition => "001",
            ChannelId::CanSpeed => "002",
            ChannelId::Motor485 => "003",
            ChannelId::Relay => "004",
            ChannelId::Pwm => "005",
            ChannelId::Camera => "006",
        }
    }

    /// Resolve a wire id or legacy code.
    pub fn from_wire(id: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|c| c.wire_id() == id || c.legacy_code() == id)
    }

    /// Wire names of the channel's fields, in schema order.
    pub fn field_names(self) -> &'static [&'static str] {
        match self {
            ChannelId::Camera => &[fields::CAMERA_STATE],
            ChannelId::CanPosition => &[fields::ANGLE, fields::CURRENT, fields::SPEED, fields::MODE],
            ChannelId::CanSpeed => &[fields::SPEED2, fields::CURRENT, fields::MODE],
            ChannelId::Motor485 => &[fields::ANGLE485_1, fields::ANGLE485_2, fields::TYPE],
            ChannelId::Relay => &[fields::STATUS],
            ChannelId::Pwm => &[fields::DUTY],
        }
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_id())
    }
}

impl FromStr for ChannelId {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_wire(s).ok_or_else(|| ProtocolError::InvalidCommand(format!("unknown channel {s:?}")))
    }
}

/// Wire field names.
pub mod fields {
    pub const CAMERA_STATE: &str = "Camera_state";
    pub const ANGLE: &str = "angle";
    pub const CURRENT: &str = "current";
    pub const SPEED: &str = "speed";
    pub const MODE: &str = "mode";
    pub const SPEED2: &str = "speed2";
    pub const ANGLE485_1: &str = "angle485_1";
    pub const ANGLE485_2: &str = "angle485_2";
    pub const TYPE: &str = "type";
    pub const STATUS: &str = "status";
    pub const DUTY: &str = "duty";
}

// ── ChannelFields ────────────────────────────────────────────────

/// Typed field values of one channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelFields {
    Camera { on: bool },
    CanPosition { angle: f64, current: i32, speed: i32, mode: i32 },
    CanSpeed { speed: f64, current: i32, mode: i32 },
    Motor485 { angle_1: f64, angle_2: f64, kind: i32 },
    Relay { status: RelayMask },
    Pwm { duty: f64 },
}

impl ChannelFields {
    pub fn channel(&self) -> ChannelId {
        match self {
            ChannelFields::Camera { .. } => ChannelId::Camera,
            ChannelFields::CanPosition { .. } => ChannelId::CanPosition,
            ChannelFields::CanSpeed { .. } => ChannelId::CanSpeed,
            ChannelFields::Motor485 { .. } => ChannelId::Motor485,
            ChannelFields::Relay { .. } => ChannelId::Relay,
            ChannelFields::Pwm { .. } => ChannelId::Pwm,
        }
    }

    /// Reject values the wire cannot carry. JSON has no NaN or infinity.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        let floats: Vec<(&'static str, f64)> = match *self {
            ChannelFields::CanPosition { angle, .. } => vec![(fields::ANGLE, angle)],
            ChannelFields::CanSpeed { speed, .. } => vec![(fields::SPEED2, speed)],
            ChannelFields::Motor485 { angle_1, angle_2, .. } => {
                vec![(fields::ANGLE485_1, angle_1), (fields::ANGLE485_2, angle_2)]
            }
            ChannelFields::Pwm { duty } => vec![(fields::DUTY, duty)],
            ChannelFields::Camera { .. } | ChannelFields::Relay { .. } => Vec::new(),
        };
        match floats.iter().find(|(_, v)| !v.is_finite()) {
            Some((field, v)) => Err(ProtocolError::InvalidCommand(format!(
                "{} {field} must be finite, got {v}",
                self.channel()
            ))),
            None => Ok(()),
        }
    }

    /// Plain (unwrapped) wire values keyed by field name.
    pub fn to_values(&self) -> Map<String, Value> {
        let pairs: Vec<(&str, Value)> = match *self {
            ChannelFields::Camera { on } => vec![(fields::CAMERA_STATE, json!(u8::from(on)))],
            ChannelFields::CanPosition { angle, current, speed, mode } => vec![
                (fields::ANGLE, json!(angle)),
                (fields::CURRENT, json!(current)),
                (fields::SPEED, json!(speed)),
                (fields::MODE, json!(mode)),
            ],
            ChannelFields::CanSpeed { speed, current, mode } => vec![
                (fields::SPEED2, json!(speed)),
                (fields::CURRENT, json!(current)),
                (fields::MODE, json!(mode)),
            ],
            ChannelFields::Motor485 { angle_1, angle_2, kind } => vec![
                (fields::ANGLE485_1, json!(angle_1)),
                (fields::ANGLE485_2, json!(angle_2)),
                (fields::TYPE, json!(kind)),
            ],
            ChannelFields::Relay { status } => vec![(fields::STATUS, json!(status.to_hex()))],
            ChannelFields::Pwm { duty } => vec![(fields::DUTY, json!(duty))],
        };
        pairs.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
    }

    /// Validate a UI-supplied field map against the channel schema.
    ///
    /// Every schema field must be present with the right type and no
    /// other keys are allowed.
    pub fn from_field_map(
        channel: ChannelId,
        map: &Map<String, Value>,
    ) -> Result<Self, ProtocolError> {
        if let Some(extra) = map
            .keys()
            .find(|k| !channel.field_names().contains(&k.as_str()))
        {
            return Err(ProtocolError::InvalidCommand(format!(
                "{channel} has no field {extra:?}"
            )));
        }
        Self::read(channel, map).map_err(|e| ProtocolError::InvalidCommand(format!("{channel}: {e}")))
    }

    /// Read all schema fields of `channel` from `map`, ignoring other keys.
    pub(crate) fn read(channel: ChannelId, map: &Map<String, Value>) -> Result<Self, FieldError> {
        let r = FieldReader { map };
        Ok(match channel {
            ChannelId::Camera => ChannelFields::Camera {
                on: r.switch(fields::CAMERA_STATE)?,
            },
            ChannelId::CanPosition => ChannelFields::CanPosition {
                angle: r.float(fields::ANGLE)?,
                current: r.int(fields::CURRENT)?,
                speed: r.int(fields::SPEED)?,
                mode: r.int(fields::MODE)?,
            },
            ChannelId::CanSpeed => ChannelFields::CanSpeed {
                speed: r.float(fields::SPEED2)?,
                current: r.int(fields::CURRENT)?,
                mode: r.int(fields::MODE)?,
            },
            ChannelId::Motor485 => ChannelFields::Motor485 {
                angle_1: r.float(fields::ANGLE485_1)?,
                angle_2: r.float(fields::ANGLE485_2)?,
                kind: r.int(fields::TYPE)?,
            },
            ChannelId::Relay => ChannelFields::Relay {
                status: r.relay_status(fields::STATUS)?,
            },
            ChannelId::Pwm => ChannelFields::Pwm {
                duty: r.float(fields::DUTY)?,
            },
        })
    }
}

// ── Field reading ────────────────────────────────────────────────

/// Why a field could not be read.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum FieldError {
    Missing(&'static str),
    Invalid { field: &'static str, detail: String },
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldError::Missing(field) => write!(f, "missing field {field}"),
            FieldError::Invalid { field, detail } => write!(f, "field {field}: {detail}"),
        }
    }
}

/// Strip the `{"value": v}` wrapper if present.
pub(crate) fn unwrap_value(v: &Value) -> &Value {
    match v {
        Value::Object(o) if o.len() == 1 => o.get("value").unwrap_or(v),
        _ => v,
    }
}

struct FieldReader<'a> {
    map: &'a Map<String, Value>,
}

impl FieldReader<'_> {
    fn raw(&self, field: &'static str) -> Result<&Value, FieldError> {
        self.map
            .get(field)
            .map(unwrap_value)
            .ok_or(FieldError::Missing(field))
    }

    fn invalid(field: &'static str, detail: impl Into<String>) -> FieldError {
        FieldError::Invalid {
            field,
            detail: detail.into(),
        }
    }

    fn float(&self, field: &'static str) -> Result<f64, FieldError> {
        let v = self.raw(field)?;
        match v.as_f64() {
            Some(x) if x.is_finite() => Ok(x),
            _ => Err(Self::invalid(field, format!("expected a finite number, got {v}"))),
        }
    }

    fn int(&self, field: &'static str) -> Result<i32, FieldError> {
        let v = self.raw(field)?;
        let wide = match v.as_i64() {
            Some(i) => Some(i),
            // Firmware sometimes echoes integral floats.
            None => v
                .as_f64()
                .filter(|x| x.fract() == 0.0 && x.abs() <= i64::MAX as f64)
                .map(|x| x as i64),
        };
        wide.and_then(|i| i32::try_from(i).ok())
            .ok_or_else(|| Self::invalid(field, format!("expected a 32-bit integer, got {v}")))
    }

    fn switch(&self, field: &'static str) -> Result<bool, FieldError> {
        let v = self.raw(field)?;
        match v {
            Value::Bool(b) => Ok(*b),
            _ => match v.as_i64() {
                Some(0) => Ok(false),
                Some(1) => Ok(true),
                _ => Err(Self::invalid(field, format!("expected 0 or 1, got {v}"))),
            },
        }
    }

    fn relay_status(&self, field: &'static str) -> Result<RelayMask, FieldError> {
        let v = self.raw(field)?;
        v.as_str()
            .and_then(RelayMask::from_hex)
            .ok_or_else(|| Self::invalid(field, format!("expected two hex digits, got {v}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(v: Value) -> Map<String, Value> {
        match v {
            Value::Object(m) => m,
            _ => panic!("not an object"),
        }
    }

    #[test]
    fn wire_ids_and_legacy_codes() {
        for channel in ChannelId::ALL {
            assert_eq!(ChannelId::from_wire(channel.wire_id()), Some(channel));
            assert_eq!(ChannelId::from_wire(channel.legacy_code()), Some(channel));
        }
        assert_eq!(ChannelId::from_wire("006"), Some(ChannelId::Camera));
        assert_eq!(ChannelId::from_wire("000"), None);
        assert!("lamp".parse::<ChannelId>().is_err());
        assert_eq!("relay".parse::<ChannelId>().unwrap(), ChannelId::Relay);
    }

    #[test]
    fn non_finite_floats_fail_validation() {
        let err = ChannelFields::Pwm { duty: f64::NAN }.validate().unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidCommand(ref m) if m.contains("duty")));

        let brush = ChannelFields::Motor485 {
            angle_1: 90.0,
            angle_2: f64::NEG_INFINITY,
            kind: 1,
        };
        assert!(matches!(
            brush.validate(),
            Err(ProtocolError::InvalidCommand(ref m)) if m.contains("angle485_2")
        ));

        assert!(ChannelFields::Camera { on: true }.validate().is_ok());
        assert!(
            ChannelFields::CanSpeed { speed: -20.0, current: 30, mode: 2 }
                .validate()
                .is_ok()
        );
    }

    #[test]
    fn field_map_accepts_exact_schema() {
        let fields = ChannelFields::from_field_map(
            ChannelId::CanPosition,
            &map(json!({"angle": 90.0, "current": 30, "speed": 10, "mode": 1})),
        )
        .unwrap();
        assert_eq!(
            fields,
            ChannelFields::CanPosition { angle: 90.0, current: 30, speed: 10, mode: 1 }
        );
    }

    #[test]
    fn field_map_rejects_missing_extra_and_mistyped() {
        let missing = ChannelFields::from_field_map(
            ChannelId::CanSpeed,
            &map(json!({"speed2": 5.0, "current": 30})),
        );
        assert!(matches!(missing, Err(ProtocolError::InvalidCommand(_))));

        let extra = ChannelFields::from_field_map(
            ChannelId::Pwm,
            &map(json!({"duty": 5.0, "freq": 100})),
        );
        assert!(matches!(extra, Err(ProtocolError::InvalidCommand(_))));

        let mistyped = ChannelFields::from_field_map(
            ChannelId::Relay,
            &map(json!({"status": 5})),
        );
        assert!(matches!(mistyped, Err(ProtocolError::InvalidCommand(_))));

        let overflow = ChannelFields::from_field_map(
            ChannelId::Motor485,
            &map(json!({"angle485_1": 90.0, "angle485_2": 90.0, "type": 5_000_000_000i64})),
        );
        assert!(matches!(overflow, Err(ProtocolError::InvalidCommand(_))));
    }

    #[test]
    fn camera_switch_values() {
        let on = ChannelFields::from_field_map(ChannelId::Camera, &map(json!({"Camera_state": 1})));
        assert_eq!(on.unwrap(), ChannelFields::Camera { on: true });

        let bad = ChannelFields::read(ChannelId::Camera, &map(json!({"Camera_state": 2})));
        assert!(matches!(bad, Err(FieldError::Invalid { field: "Camera_state", .. })));
    }

    #[test]
    fn reads_wrapped_and_bare_values() {
        let wrapped = ChannelFields::read(
            ChannelId::Relay,
            &map(json!({"status": {"value": "0A"}, "ack": {"value": "1"}})),
        )
        .unwrap();
        assert_eq!(wrapped, ChannelFields::Relay { status: RelayMask::from_bits_retain(0x0A) });

        let integral = ChannelFields::read(
            ChannelId::CanSpeed,
            &map(json!({"speed2": 12.5, "current": 30.0, "mode": 0})),
        )
        .unwrap();
        assert_eq!(integral, ChannelFields::CanSpeed { speed: 12.5, current: 30, mode: 0 });
    }

    #[test]
    fn to_values_uses_wire_names() {
        let values = ChannelFields::Relay { status: RelayMask::R0 | RelayMask::R2 }.to_values();
        assert_eq!(values.get("status"), Some(&json!("05")));

        let values = ChannelFields::Camera { on: false }.to_values();
        assert_eq!(values.get("Camera_state"), Some(&json!(0)));
    }
}
