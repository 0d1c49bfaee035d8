//! The 8-way relay board.
//!
//! The operator's selection (`intent`) and the board's last reported
//! state (`observed`) are kept apart; publish masks are derived from
//! both at send time.

use std::fmt;

use bitflags::bitflags;

use crate::error::ProtocolError;

bitflags! {
    /// One bit per relay, relay 0 in the least significant bit.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct RelayMask: u8 {
        const R0 = 1 << 0;
        const R1 = 1 << 1;
        const R2 = 1 << 2;
        const R3 = 1 << 3;
        const R4 = 1 << 4;
        const R5 = 1 << 5;
        const R6 = 1 << 6;
        const R7 = 1 << 7;
    }
}

/// Number of relays on the board.
pub const RELAY_COUNT: u8 = 8;

impl RelayMask {
    /// The mask for a single relay, `None` past the last relay.
    pub fn relay(index: u8) -> Option<Self> {
        (index < RELAY_COUNT).then(|| Self::from_bits_retain(1 << index))
    }

    /// Two uppercase hex digits, as carried in the `status` field.
    pub fn to_hex(self) -> String {
        format!("{:02X}", self.bits())
    }

    /// Parse exactly two hex digits.
    pub fn from_hex(s: &str) -> Option<Self> {
        if s.len() != 2 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }
        u8::from_str_radix(s, 16).ok().map(Self::from_bits_retain)
    }
}

impl fmt::Display for RelayMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08b}", self.bits())
    }
}

// ── RelayAction ──────────────────────────────────────────────────

/// Which derived mask a relay publish carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelayAction {
    /// Close every selected relay on top of those already on.
    OpenSelected,
    /// Switch off the reported-on relays that are not selected.
    CloseSelected,
    /// Make the board match the selection.
    Sync,
}

// ── RelayBank ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayBank {
    intent: RelayMask,
    observed: RelayMask,
}

impl RelayBank {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn intent(&self) -> RelayMask {
        self.intent
    }

    pub fn observed(&self) -> RelayMask {
        self.observed
    }

    /// Flip one relay in the operator selection.
    pub fn toggle(&mut self, index: u8) -> Result<RelayMask, ProtocolError> {
        let bit = RelayMask::relay(index).ok_or_else(|| {
            ProtocolError::InvalidCommand(format!(
                "relay index {index} out of range 0..{RELAY_COUNT}"
            ))
        })?;
        self.intent.toggle(bit);
        Ok(self.intent)
    }

    pub fn set_intent(&mut self, mask: RelayMask) {
        self.intent = mask;
    }

    /// Record the state reported by a relay acknowledgement.
    pub fn observe(&mut self, mask: RelayMask) {
        self.observed = mask;
    }

    pub fn open_mask(&self) -> RelayMask {
        self.intent | self.observed
    }

    pub fn close_mask(&self) -> RelayMask {
        !self.intent & self.observed
    }

    pub fn sync_mask(&self) -> RelayMask {
        self.intent
    }

    pub fn mask_for(&self, action: RelayAction) -> RelayMask {
        match action {
            RelayAction::OpenSelected => self.open_mask(),
            RelayAction::CloseSelected => self.close_mask(),
            RelayAction::Sync => self.sync_mask(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_masks() {
        let mut bank = RelayBank::new();
        bank.set_intent(RelayMask::from_bits_retain(0b101));
        bank.observe(RelayMask::from_bits_retain(0b011));

        assert_eq!(bank.open_mask().bits(), 0b111);
        assert_eq!(bank.close_mask().bits(), 0b010);
        assert_eq!(bank.sync_mask().bits(), 0b101);
        assert_eq!(bank.mask_for(RelayAction::CloseSelected).bits(), 0b010);
    }

    #[test]
    fn intent_and_observed_stay_separate() {
        let mut bank = RelayBank::new();
        bank.toggle(0).unwrap();
        bank.observe(RelayMask::R7);
        assert_eq!(bank.intent(), RelayMask::R0);
        assert_eq!(bank.observed(), RelayMask::R7);

        bank.toggle(0).unwrap();
        assert!(bank.intent().is_empty());
        assert_eq!(bank.observed(), RelayMask::R7);
    }

    #[test]
    fn toggle_out_of_range_is_rejected() {
        let mut bank = RelayBank::new();
        assert!(matches!(
            bank.toggle(8),
            Err(ProtocolError::InvalidCommand(_))
        ));
        assert!(bank.intent().is_empty());
    }

    #[test]
    fn hex_status() {
        assert_eq!(RelayMask::from_bits_retain(0x0A).to_hex(), "0A");
        assert_eq!(RelayMask::from_hex("ff"), Some(RelayMask::all()));
        assert_eq!(RelayMask::from_hex("05").map(|m| m.bits()), Some(5));
        assert_eq!(RelayMask::from_hex("5"), None);
        assert_eq!(RelayMask::from_hex("0G"), None);
        assert_eq!(RelayMask::from_hex("+5"), None);
    }
}
