//! USB type definitions
//!
//! Small value types shared by every layer of the host stack: transfer
//! direction, transfer type, bus speed and data toggle PIDs.

use serde::{Deserialize, Serialize};

/// Descriptor type codes (USB 2.0 table 9-5)
pub const DESC_DEVICE: u8 = 0x01;
pub const DESC_CONFIGURATION: u8 = 0x02;
pub const DESC_STRING: u8 = 0x03;
pub const DESC_INTERFACE: u8 = 0x04;
pub const DESC_ENDPOINT: u8 = 0x05;
pub const DESC_HUB: u8 = 0x29;

/// Device class code for hubs
pub const CLASS_HUB: u8 = 0x09;

/// Default language used for string descriptors (US English)
pub const LANG_EN_US: u16 = 0x0409;

/// Transfer direction, as seen from the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Host to device
    Out,
    /// Device to host
    In,
}

impl Direction {
    /// Direction encoded in bit 7 of an endpoint address or bmRequestType
    pub fn from_bit7(value: u8) -> Self {
        if value & 0x80 != 0 { Self::In } else { Self::Out }
    }

    /// Index used for per-direction state such as data toggles
    pub fn index(self) -> usize {
        match self {
            Self::Out => 0,
            Self::In => 1,
        }
    }

    pub fn is_in(self) -> bool {
        self == Self::In
    }
}

/// The four USB transfer types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransferKind {
    Control,
    Isochronous,
    Bulk,
    Interrupt,
}

impl TransferKind {
    /// Decode bits 1:0 of an endpoint's bmAttributes
    pub fn from_attributes(attributes: u8) -> Self {
        match attributes & 0x03 {
            0 => Self::Control,
            1 => Self::Isochronous,
            2 => Self::Bulk,
            _ => Self::Interrupt,
        }
    }

    pub fn to_attributes(self) -> u8 {
        match self {
            Self::Control => 0,
            Self::Isochronous => 1,
            Self::Bulk => 2,
            Self::Interrupt => 3,
        }
    }

    /// Interrupt and isochronous transfers are scheduled per frame
    pub fn is_periodic(self) -> bool {
        matches!(self, Self::Interrupt | Self::Isochronous)
    }
}

/// Bus speed of an attached device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceSpeed {
    /// Low speed - 1.5 Mbps
    Low,
    /// Full speed - 12 Mbps
    Full,
}

/// Data toggle PID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataPid {
    Data0,
    Data1,
}

impl DataPid {
    pub fn toggled(self) -> Self {
        match self {
            Self::Data0 => Self::Data1,
            Self::Data1 => Self::Data0,
        }
    }

    /// Advance the toggle by `packets` successfully transferred packets
    pub fn advanced(self, packets: usize) -> Self {
        if packets % 2 == 1 { self.toggled() } else { self }
    }
}
