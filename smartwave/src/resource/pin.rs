//! Physical I/O pins.

use std::fmt;
use std::str::FromStr;

use super::{DriverHandle, ResourceKind, Role};
use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Bank {
    A,
    B,
}

/// Name of one pin in the fixed inventory: banks A and B, numbers 1-4 and
/// 7-10.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PinId {
    bank: Bank,
    number: u8,
}

const NUMBERS: [u8; 8] = [1, 2, 3, 4, 7, 8, 9, 10];

impl PinId {
    pub const COUNT: usize = 16;

    pub fn new(bank: Bank, number: u8) -> Option<Self> {
        NUMBERS
            .contains(&number)
            .then_some(Self { bank, number })
    }

    /// Pin at inventory position `index` (A1..A10, then B1..B10).
    pub fn from_index(index: usize) -> Option<Self> {
        let bank = match index / NUMBERS.len() {
            0 => Bank::A,
            1 => Bank::B,
            _ => return None,
        };
        Some(Self {
            bank,
            number: NUMBERS[index % NUMBERS.len()],
        })
    }

    pub fn all() -> impl Iterator<Item = PinId> {
        (0..Self::COUNT).filter_map(Self::from_index)
    }

    pub fn index(self) -> usize {
        let bank = match self.bank {
            Bank::A => 0,
            Bank::B => 1,
        };
        let pos = NUMBERS.iter().position(|&n| n == self.number).unwrap_or(0);
        bank * NUMBERS.len() + pos
    }

    pub fn bank(self) -> Bank {
        self.bank
    }

    pub fn number(self) -> u8 {
        self.number
    }

    /// Id the device uses for this pin: `((bank - 'A' + 0xA) << 4) + number`.
    pub fn wire_id(self) -> u8 {
        let bank = match self.bank {
            Bank::A => 0xA,
            Bank::B => 0xB,
        };
        (bank << 4) + self.number
    }
}

impl fmt::Display for PinId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}{}", self.bank, self.number)
    }
}

impl FromStr for PinId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let not_found = || Error::NotFound {
            kind: ResourceKind::Pin,
            id: s.to_string(),
        };
        let mut chars = s.trim().chars();
        let bank = match chars.next().map(|c| c.to_ascii_uppercase()) {
            Some('A') => Bank::A,
            Some('B') => Bank::B,
            _ => return Err(not_found()),
        };
        let number = chars.as_str().parse::<u8>().map_err(|_| not_found())?;
        PinId::new(bank, number).ok_or_else(not_found)
    }
}

/// Driver and role a pin is wired to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PinBinding {
    pub driver: DriverHandle,
    pub role: Role,
}

/// Host-side mirror of one pin's configuration.
#[derive(Debug, Clone)]
pub struct Pin {
    id: PinId,
    pub(crate) pullup: bool,
    pub(crate) binding: Option<PinBinding>,
    pub(crate) dirty: bool,
}

impl Pin {
    pub(crate) fn new(id: PinId) -> Self {
        Self {
            id,
            pullup: false,
            binding: None,
            dirty: false,
        }
    }

    pub fn id(&self) -> PinId {
        self.id
    }

    pub fn pullup(&self) -> bool {
        self.pullup
    }

    pub fn binding(&self) -> Option<PinBinding> {
        self.binding
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Payload of the Pin request: `[pin id, input enable, pullup]`.
    pub(crate) fn payload(&self) -> Vec<u8> {
        vec![self.id.wire_id(), 1, self.pullup as u8]
    }

    pub(crate) fn reset(&mut self) {
        self.pullup = false;
        self.binding = None;
        self.dirty = false;
    }
}
