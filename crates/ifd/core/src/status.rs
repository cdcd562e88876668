//! Terminal and slot status records

use bytes::Bytes;

/// Status of one slot of a terminal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotStatus {
    /// Slot index within the terminal
    pub index: u32,
    /// Whether a card is available in the slot
    pub card_available: bool,
    /// ATR or ATS of the card, when known
    pub atr: Option<Bytes>,
}

impl SlotStatus {
    /// Slot without a card
    pub const fn empty(index: u32) -> Self {
        Self {
            index,
            card_available: false,
            atr: None,
        }
    }

    /// Slot holding a card
    pub const fn with_card(index: u32, atr: Option<Bytes>) -> Self {
        Self {
            index,
            card_available: true,
            atr,
        }
    }

    /// Presence equality, the ATR is not compared
    pub const fn state_equals(&self, other: &Self) -> bool {
        self.card_available == other.card_available && self.index == other.index
    }
}

/// Status of one terminal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IfdStatus {
    /// Terminal name
    pub name: String,
    /// Whether the terminal is attached
    pub connected: bool,
    /// Slots of the terminal
    pub slots: Vec<SlotStatus>,
}

impl IfdStatus {
    /// Create a new status record
    pub fn new<S: Into<String>>(name: S, connected: bool, slots: Vec<SlotStatus>) -> Self {
        Self {
            name: name.into(),
            connected,
            slots,
        }
    }

    /// Attached terminal with a single empty slot
    pub fn empty<S: Into<String>>(name: S) -> Self {
        Self::new(name, true, vec![SlotStatus::empty(0)])
    }

    /// Whether any slot holds a card
    pub fn card_available(&self) -> bool {
        self.slots.iter().any(|s| s.card_available)
    }

    /// Equality used for diffing: name, connected flag and per-slot presence
    /// and index. ATRs are ignored.
    pub fn state_equals(&self, other: &Self) -> bool {
        self.name == other.name
            && self.connected == other.connected
            && self.slots.len() == other.slots.len()
            && self
                .slots
                .iter()
                .zip(&other.slots)
                .all(|(a, b)| a.state_equals(b))
    }
}
