//! The console's model of the device.
//!
//! Commands set what the console *shows*; acknowledgements report what
//! the device *did*. Toggle controls only change their shown state when
//! the two disagree.

use std::collections::{HashSet, VecDeque};

use crate::config::DeviceTuning;
use crate::protocol::{
    AckEnvelope, BrushPosition, ChannelCodec, ChannelFields, ChannelId, FanState, RelayBank,
};
use crate::session::observer::{Reconciliation, ToggleControl, ToggleOutcome};

/// Shown and last reported state of a two-state control.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ToggleState {
    pub shown: bool,
    pub reported: Option<bool>,
}

impl ToggleState {
    pub fn request(&mut self, on: bool) {
        self.shown = on;
    }

    pub fn reconcile(&mut self, reported: bool) -> ToggleOutcome {
        self.reported = Some(reported);
        if self.shown == reported {
            ToggleOutcome::Confirmed(reported)
        } else {
            self.shown = reported;
            ToggleOutcome::Flipped(reported)
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeviceState {
    pub camera: ToggleState,
    pub fan: ToggleState,
    /// Shown `true` means up.
    pub brush: ToggleState,
    pub relays: RelayBank,
    /// Last commanded CAN speed.
    pub commanded_speed: Option<f64>,
    /// Last commanded CAN angle.
    pub commanded_angle: Option<f64>,
    /// Last reported CAN angle.
    pub reported_angle: Option<f64>,
    /// Reported CAN speeds, oldest first.
    pub speed_history: VecDeque<f64>,
    speed_history_cap: usize,
    pending: HashSet<ChannelId>,
}

impl DeviceState {
    pub fn new(tuning: &DeviceTuning) -> Self {
        Self {
            camera: ToggleState::default(),
            fan: ToggleState::default(),
            brush: ToggleState::default(),
            relays: RelayBank::new(),
            commanded_speed: None,
            commanded_angle: None,
            reported_angle: None,
            speed_history: VecDeque::with_capacity(tuning.speed_history),
            speed_history_cap: tuning.speed_history.max(1),
            pending: HashSet::new(),
        }
    }

    /// Channels with a command awaiting its ack, in channel order.
    pub fn pending_channels(&self) -> Vec<ChannelId> {
        ChannelId::ALL
            .into_iter()
            .filter(|c| self.pending.contains(c))
            .collect()
    }

    pub fn is_pending(&self, channel: ChannelId) -> bool {
        self.pending.contains(&channel)
    }

    pub fn clear_pending(&mut self, channel: ChannelId) {
        self.pending.remove(&channel);
    }

    /// Note an admitted command.
    pub fn record_command(&mut self, fields: &ChannelFields, codec: &ChannelCodec) {
        match *fields {
            ChannelFields::Camera { on } => self.camera.request(on),
            ChannelFields::Pwm { duty } => {
                if let Ok(state) = codec.classify_fan(duty) {
                    self.fan.request(state == FanState::On);
                }
            }
            ChannelFields::Motor485 { angle_1, angle_2, .. } => {
                if let Ok(position) = codec.classify_brush(angle_1, angle_2) {
                    self.brush.request(position == BrushPosition::Up);
                }
            }
            ChannelFields::CanSpeed { speed, .. } => self.commanded_speed = Some(speed),
            ChannelFields::CanPosition { angle, .. } => self.commanded_angle = Some(angle),
            ChannelFields::Relay { .. } => {}
        }
        self.pending.insert(fields.channel());
    }

    /// Fold a validated ack into the model.
    pub fn apply_ack(&mut self, ack: &AckEnvelope, codec: &ChannelCodec) -> Option<Reconciliation> {
        self.pending.remove(&ack.channel);

        let toggle = |control: ToggleControl, outcome: ToggleOutcome| Some(Reconciliation::Toggle { control, outcome });
        match *ack.fields.as_ref()? {
            ChannelFields::Camera { on } => toggle(ToggleControl::Camera, self.camera.reconcile(on)),
            ChannelFields::Pwm { duty } => {
                let on = codec.classify_fan(duty).ok()? == FanState::On;
                toggle(ToggleControl::Fan, self.fan.reconcile(on))
            }
            ChannelFields::Motor485 { angle_1, angle_2, .. } => {
                let up = codec.classify_brush(angle_1, angle_2).ok()? == BrushPosition::Up;
                toggle(ToggleControl::Brush, self.brush.reconcile(up))
            }
            ChannelFields::Relay { status } => {
                self.relays.observe(status);
                Some(Reconciliation::RelayObserved(status))
            }
            ChannelFields::CanSpeed { speed, .. } => {
                if self.speed_history.len() == self.speed_history_cap {
                    self.speed_history.pop_front();
                }
                self.speed_history.push_back(speed);
                Some(Reconciliation::SpeedRecorded(speed))
            }
            ChannelFields::CanPosition { angle, .. } => {
                self.reported_angle = Some(angle);
                Some(Reconciliation::PositionReported(angle))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{AckTimestamp, RelayMask};

    fn setup() -> (DeviceState, ChannelCodec) {
        let tuning = DeviceTuning {
            speed_history: 2,
            ..DeviceTuning::default()
        };
        (DeviceState::new(&tuning), ChannelCodec::new("1.0", tuning))
    }

    fn ack(fields: ChannelFields) -> AckEnvelope {
        AckEnvelope {
            channel: fields.channel(),
            acked_at: AckTimestamp::from_millis(1_700_000_000_000).unwrap(),
            fields: Some(fields),
        }
    }

    #[test]
    fn toggle_confirms_or_flips() {
        let mut t = ToggleState::default();
        t.request(true);
        assert_eq!(t.reconcile(true), ToggleOutcome::Confirmed(true));
        assert_eq!(t.reconcile(false), ToggleOutcome::Flipped(false));
        assert!(!t.shown);
        assert_eq!(t.reported, Some(false));
    }

    #[test]
    fn command_then_ack_clears_pending() {
        let (mut state, codec) = setup();
        state.record_command(&ChannelFields::Camera { on: true }, &codec);
        assert_eq!(state.pending_channels(), vec![ChannelId::Camera]);

        let r = state.apply_ack(&ack(ChannelFields::Camera { on: true }), &codec);
        assert_eq!(
            r,
            Some(Reconciliation::Toggle {
                control: ToggleControl::Camera,
                outcome: ToggleOutcome::Confirmed(true),
            })
        );
        assert!(state.pending_channels().is_empty());
    }

    #[test]
    fn fan_and_brush_follow_classification() {
        let (mut state, codec) = setup();
        state.record_command(&codec.fan_command(FanState::On), &codec);
        assert!(state.fan.shown);
        let r = state.apply_ack(&ack(ChannelFields::Pwm { duty: 0.0 }), &codec);
        assert!(matches!(
            r,
            Some(Reconciliation::Toggle { control: ToggleControl::Fan, outcome: ToggleOutcome::Flipped(false) })
        ));

        let r = state.apply_ack(&ack(codec.brush_command(BrushPosition::Up)), &codec);
        assert!(matches!(
            r,
            Some(Reconciliation::Toggle { control: ToggleControl::Brush, outcome: ToggleOutcome::Flipped(true) })
        ));
    }

    #[test]
    fn relay_ack_updates_observed_only() {
        let (mut state, codec) = setup();
        state.relays.toggle(1).unwrap();
        state.apply_ack(&ack(ChannelFields::Relay { status: RelayMask::R3 }), &codec);
        assert_eq!(state.relays.observed(), RelayMask::R3);
        assert_eq!(state.relays.intent(), RelayMask::R1);
    }

    #[test]
    fn speed_history_is_bounded() {
        let (mut state, codec) = setup();
        for speed in [1.0, 2.0, 3.0] {
            state.apply_ack(&ack(codec.speed_command(speed)), &codec);
        }
        assert_eq!(state.speed_history, VecDeque::from([2.0, 3.0]));
    }

    #[test]
    fn ack_only_clears_pending_without_reconciling() {
        let (mut state, codec) = setup();
        state.record_command(&codec.position_command(90.0), &codec);
        let bare = AckEnvelope {
            channel: ChannelId::CanPosition,
            acked_at: AckTimestamp::from_millis(0).unwrap(),
            fields: None,
        };
        assert_eq!(state.apply_ack(&bare, &codec), None);
        assert!(!state.is_pending(ChannelId::CanPosition));
        assert_eq!(state.commanded_angle, Some(90.0));
    }
}
