//! Operator command line parsing.
//!
//! ```text
//! camera on|off            fan on|off|<duty>
//! speed <value>            faster | slower
//! angle <deg>              left | right
//! brush up|down
//! relay toggle <0-7>       relay open|close|sync
//! send <channel> key=value ...
//! pause | resume | status | help | quit
//! ```

use std::str::FromStr;

use serde_json::{Map, Value};
use thiserror::Error;

use opcon_core::protocol::channel::fields;
use opcon_core::{BrushPosition, ChannelId, FanState, RelayAction};

/// One parsed console command.
#[derive(Debug, Clone, PartialEq)]
pub enum ConsoleCommand {
    Camera(bool),
    Fan(FanSetting),
    Speed(f64),
    Faster,
    Slower,
    Angle(f64),
    /// Step the commanded angle down by the configured delta.
    Left,
    Right,
    Brush(BrushPosition),
    RelayToggle(u8),
    Relay(RelayAction),
    /// Raw field map for one channel.
    Send {
        channel: ChannelId,
        fields: Map<String, Value>,
    },
    Pause,
    Resume,
    Status,
    Help,
    Quit,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FanSetting {
    State(FanState),
    Duty(f64),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InputError {
    #[error("empty command")]
    Empty,

    #[error("unknown command {0:?}; try `help`")]
    Unknown(String),

    #[error("usage: {0}")]
    Usage(&'static str),

    #[error("invalid {what}: {value:?}")]
    Invalid { what: &'static str, value: String },
}

pub const HELP: &str = "\
camera on|off            switch the camera
fan on|off|<duty>        switch the fan or set its PWM duty
speed <value>            CAN speed; faster / slower step by the configured delta
angle <deg>              CAN position move; left / right step by the configured delta
brush up|down            485 brush reference position
relay toggle <0-7>       flip one relay in the selection (nothing is sent)
relay open|close|sync    send the selection
send <channel> k=v ...   send raw fields (quote values to keep them strings)
pause | resume           pause or resume video delivery
status                   show link, device and video state
quit                     exit";

impl FromStr for ConsoleCommand {
    type Err = InputError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut words = line.split_whitespace();
        let verb = words.next().ok_or(InputError::Empty)?.to_ascii_lowercase();
        let args: Vec<&str> = words.collect();

        let cmd = match (verb.as_str(), args.as_slice()) {
            ("camera", [state]) => Self::Camera(on_off(state).ok_or(InputError::Usage("camera on|off"))?),
            ("camera", _) => return Err(InputError::Usage("camera on|off")),

            ("fan", [arg]) => Self::Fan(match on_off(arg) {
                Some(true) => FanSetting::State(FanState::On),
                Some(false) => FanSetting::State(FanState::Off),
                None => FanSetting::Duty(number("duty", arg)?),
            }),
            ("fan", _) => return Err(InputError::Usage("fan on|off|<duty>")),

            ("speed", [value]) => Self::Speed(number("speed", value)?),
            ("speed", _) => return Err(InputError::Usage("speed <value>")),
            ("faster", []) => Self::Faster,
            ("slower", []) => Self::Slower,

            ("angle", [deg]) => Self::Angle(number("angle", deg)?),
            ("angle", _) => return Err(InputError::Usage("angle <deg>")),
            ("left", []) => Self::Left,
            ("right", []) => Self::Right,

            ("brush", [pos]) => Self::Brush(match pos.to_ascii_lowercase().as_str() {
                "up" => BrushPosition::Up,
                "down" => BrushPosition::Down,
                _ => return Err(InputError::Usage("brush up|down")),
            }),
            ("brush", _) => return Err(InputError::Usage("brush up|down")),

            ("relay", ["toggle", index]) => Self::RelayToggle(index.parse().map_err(|_| {
                InputError::Invalid {
                    what: "relay index",
                    value: index.to_string(),
                }
            })?),
            ("relay", [action]) => Self::Relay(match action.to_ascii_lowercase().as_str() {
                "open" => RelayAction::OpenSelected,
                "close" => RelayAction::CloseSelected,
                "sync" => RelayAction::Sync,
                _ => return Err(InputError::Usage("relay toggle <0-7> | relay open|close|sync")),
            }),
            ("relay", _) => return Err(InputError::Usage("relay toggle <0-7> | relay open|close|sync")),

            ("send", [channel, pairs @ ..]) if !pairs.is_empty() => Self::Send {
                channel: channel.parse().map_err(|_| InputError::Invalid {
                    what: "channel",
                    value: channel.to_string(),
                })?,
                fields: field_map(pairs)?,
            },
            ("send", _) => return Err(InputError::Usage("send <channel> key=value ...")),

            ("pause", []) => Self::Pause,
            ("resume", []) => Self::Resume,
            ("status", []) => Self::Status,
            ("help" | "?", []) => Self::Help,
            ("quit" | "exit", []) => Self::Quit,
            _ => return Err(InputError::Unknown(line.trim().to_string())),
        };
        Ok(cmd)
    }
}

fn on_off(word: &str) -> Option<bool> {
    match word.to_ascii_lowercase().as_str() {
        "on" | "1" => Some(true),
        "off" | "0" => Some(false),
        _ => None,
    }
}

fn number(what: &'static str, word: &str) -> Result<f64, InputError> {
    word.parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| InputError::Invalid {
            what,
            value: word.to_string(),
        })
}

/// `key=value` pairs; values are read as JSON where they parse, else as
/// strings. Relay status is always a string.
fn field_map(pairs: &[&str]) -> Result<Map<String, Value>, InputError> {
    let mut map = Map::new();
    for pair in pairs {
        let (key, raw) = pair
            .split_once('=')
            .filter(|(k, _)| !k.is_empty())
            .ok_or_else(|| InputError::Invalid {
                what: "field",
                value: pair.to_string(),
            })?;
        let value = if key == fields::STATUS {
            Value::String(raw.trim_matches('"').to_string())
        } else {
            serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
        };
        map.insert(key.to_string(), value);
    }
    Ok(map)
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(line: &str) -> Result<ConsoleCommand, InputError> {
        line.parse()
    }

    #[test]
    fn toggles_and_moves() {
        assert_eq!(parse("camera on").unwrap(), ConsoleCommand::Camera(true));
        assert_eq!(parse("  CAMERA off ").unwrap(), ConsoleCommand::Camera(false));
        assert_eq!(
            parse("fan on").unwrap(),
            ConsoleCommand::Fan(FanSetting::State(FanState::On))
        );
        assert_eq!(
            parse("fan 12.5").unwrap(),
            ConsoleCommand::Fan(FanSetting::Duty(12.5))
        );
        assert_eq!(parse("speed -20").unwrap(), ConsoleCommand::Speed(-20.0));
        assert_eq!(parse("faster").unwrap(), ConsoleCommand::Faster);
        assert_eq!(parse("angle 90").unwrap(), ConsoleCommand::Angle(90.0));
        assert_eq!(parse("left").unwrap(), ConsoleCommand::Left);
        assert_eq!(parse("Right").unwrap(), ConsoleCommand::Right);
        assert!(matches!(parse("left 5"), Err(InputError::Unknown(_))));
        assert_eq!(
            parse("brush up").unwrap(),
            ConsoleCommand::Brush(BrushPosition::Up)
        );
    }

    #[test]
    fn relay_commands() {
        assert_eq!(parse("relay toggle 3").unwrap(), ConsoleCommand::RelayToggle(3));
        assert_eq!(
            parse("relay close").unwrap(),
            ConsoleCommand::Relay(RelayAction::CloseSelected)
        );
        assert!(matches!(
            parse("relay toggle x"),
            Err(InputError::Invalid { what: "relay index", .. })
        ));
        assert!(matches!(parse("relay"), Err(InputError::Usage(_))));
    }

    #[test]
    fn raw_send() {
        match parse("send pwm duty=12.5").unwrap() {
            ConsoleCommand::Send { channel, fields } => {
                assert_eq!(channel, ChannelId::Pwm);
                assert_eq!(fields["duty"], 12.5);
            }
            other => panic!("unexpected {other:?}"),
        }
        match parse("send relay status=10").unwrap() {
            ConsoleCommand::Send { fields, .. } => assert_eq!(fields["status"], "10"),
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(parse("send pwm"), Err(InputError::Usage(_))));
        assert!(matches!(
            parse("send nowhere a=1"),
            Err(InputError::Invalid { what: "channel", .. })
        ));
        assert!(matches!(
            parse("send pwm duty"),
            Err(InputError::Invalid { what: "field", .. })
        ));
    }

    #[test]
    fn rejects_bad_input() {
        assert_eq!(parse("   "), Err(InputError::Empty));
        assert!(matches!(parse("launch"), Err(InputError::Unknown(_))));
        assert!(matches!(parse("speed fast"), Err(InputError::Invalid { .. })));
        assert!(matches!(parse("speed NaN"), Err(InputError::Invalid { .. })));
        assert!(matches!(parse("camera maybe"), Err(InputError::Usage(_))));
        assert!(matches!(parse("status now"), Err(InputError::Unknown(_))));
    }
}
