//! Hub class wire structures
//!
//! Hub descriptor, hub/port status words and the feature selectors used with
//! SET_FEATURE / CLEAR_FEATURE (USB 2.0 chapter 11).

use crate::error::{ProtocolError, Result};
use crate::types::{DESC_HUB, DeviceSpeed};
use byteorder::{ByteOrder, LittleEndian};
use bytes::BufMut;
use serde::{Deserialize, Serialize};

/// Hub feature selectors
pub const C_HUB_LOCAL_POWER: u16 = 0;
pub const C_HUB_OVER_CURRENT: u16 = 1;

/// Port feature selectors
pub const PORT_CONNECTION: u16 = 0;
pub const PORT_ENABLE: u16 = 1;
pub const PORT_SUSPEND: u16 = 2;
pub const PORT_OVER_CURRENT: u16 = 3;
pub const PORT_RESET: u16 = 4;
pub const PORT_POWER: u16 = 8;
pub const PORT_LOW_SPEED: u16 = 9;
pub const C_PORT_CONNECTION: u16 = 16;
pub const C_PORT_ENABLE: u16 = 17;
pub const C_PORT_SUSPEND: u16 = 18;
pub const C_PORT_OVER_CURRENT: u16 = 19;
pub const C_PORT_RESET: u16 = 20;

/// Minimum length of a hub descriptor with up to 7 ports
pub const HUB_DESC_MIN_LEN: usize = 9;

/// Largest hub descriptor the stack asks for (255 ports worth of bitmaps)
pub const HUB_DESC_MAX_LEN: u16 = 71;

/// wPortStatus bits
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortStatus(pub u16);

impl PortStatus {
    pub const CONNECTION: u16 = 1 << 0;
    pub const ENABLE: u16 = 1 << 1;
    pub const SUSPEND: u16 = 1 << 2;
    pub const OVER_CURRENT: u16 = 1 << 3;
    pub const RESET: u16 = 1 << 4;
    pub const POWER: u16 = 1 << 8;
    pub const LOW_SPEED: u16 = 1 << 9;

    pub fn connected(self) -> bool {
        self.0 & Self::CONNECTION != 0
    }

    pub fn enabled(self) -> bool {
        self.0 & Self::ENABLE != 0
    }

    pub fn over_current(self) -> bool {
        self.0 & Self::OVER_CURRENT != 0
    }

    pub fn resetting(self) -> bool {
        self.0 & Self::RESET != 0
    }

    pub fn powered(self) -> bool {
        self.0 & Self::POWER != 0
    }

    pub fn speed(self) -> DeviceSpeed {
        if self.0 & Self::LOW_SPEED != 0 {
            DeviceSpeed::Low
        } else {
            DeviceSpeed::Full
        }
    }
}

/// wPortChange bits
///
/// Only five change bits are defined; each one is acknowledged with the
/// matching C_PORT_* feature selector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortChange(pub u16);

impl PortChange {
    pub const CONNECTION: u16 = 1 << 0;
    pub const ENABLE: u16 = 1 << 1;
    pub const SUSPEND: u16 = 1 << 2;
    pub const OVER_CURRENT: u16 = 1 << 3;
    pub const RESET: u16 = 1 << 4;

    /// Change bits paired with the feature selector that clears them, in
    /// the order the stack acknowledges them
    pub const ACK_ORDER: [(u16, u16); 5] = [
        (Self::CONNECTION, C_PORT_CONNECTION),
        (Self::ENABLE, C_PORT_ENABLE),
        (Self::SUSPEND, C_PORT_SUSPEND),
        (Self::OVER_CURRENT, C_PORT_OVER_CURRENT),
        (Self::RESET, C_PORT_RESET),
    ];

    pub fn is_empty(self) -> bool {
        self.0 & 0x1f == 0
    }

    pub fn contains(self, bit: u16) -> bool {
        self.0 & bit != 0
    }

    /// First pending change bit and its feature selector
    pub fn next_pending(self) -> Option<(u16, u16)> {
        Self::ACK_ORDER
            .iter()
            .copied()
            .find(|(bit, _)| self.contains(*bit))
    }

    pub fn clear(&mut self, bit: u16) {
        self.0 &= !bit;
    }
}

/// Hub-level status change bits
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HubChange(pub u16);

impl HubChange {
    pub const LOCAL_POWER: u16 = 1 << 0;
    pub const OVER_CURRENT: u16 = 1 << 1;

    pub fn next_pending(self) -> Option<(u16, u16)> {
        [
            (Self::LOCAL_POWER, C_HUB_LOCAL_POWER),
            (Self::OVER_CURRENT, C_HUB_OVER_CURRENT),
        ]
        .into_iter()
        .find(|(bit, _)| self.0 & bit != 0)
    }
}

/// Split a 4-byte GET_STATUS response into (status, change)
pub fn parse_status_words(bytes: &[u8]) -> Result<(u16, u16)> {
    if bytes.len() < 4 {
        return Err(ProtocolError::Truncated {
            needed: 4,
            available: bytes.len(),
        });
    }
    Ok((
        LittleEndian::read_u16(&bytes[0..2]),
        LittleEndian::read_u16(&bytes[2..4]),
    ))
}

pub fn encode_status_words(status: u16, change: u16) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4);
    buf.put_u16_le(status);
    buf.put_u16_le(change);
    buf
}

/// Hub descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HubDescriptor {
    pub num_ports: u8,
    pub characteristics: u16,
    /// bPwrOn2PwrGood in 2ms units
    pub power_on_to_good: u8,
    pub control_current: u8,
    /// DeviceRemovable bitmap, bit N for port N
    pub removable: Vec<u8>,
}

impl HubDescriptor {
    fn bitmap_len(num_ports: u8) -> usize {
        (num_ports as usize + 1).div_ceil(8)
    }

    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HUB_DESC_MIN_LEN - 2 {
            return Err(ProtocolError::Truncated {
                needed: HUB_DESC_MIN_LEN - 2,
                available: bytes.len(),
            });
        }
        if bytes[1] != DESC_HUB {
            return Err(ProtocolError::UnexpectedType {
                expected: DESC_HUB,
                found: bytes[1],
            });
        }
        let num_ports = bytes[2];
        let map_len = Self::bitmap_len(num_ports);
        let removable_end = (7 + map_len).min(bytes.len());
        Ok(Self {
            num_ports,
            characteristics: LittleEndian::read_u16(&bytes[3..5]),
            power_on_to_good: bytes[5],
            control_current: bytes[6],
            removable: bytes[7..removable_end].to_vec(),
        })
    }

    /// Power-on-to-power-good time in milliseconds
    pub fn power_good_ms(&self) -> u32 {
        self.power_on_to_good as u32 * 2
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let map_len = Self::bitmap_len(self.num_ports);
        let mut buf = Vec::with_capacity(7 + 2 * map_len);
        buf.put_u8((7 + 2 * map_len) as u8);
        buf.put_u8(DESC_HUB);
        buf.put_u8(self.num_ports);
        buf.put_u16_le(self.characteristics);
        buf.put_u8(self.power_on_to_good);
        buf.put_u8(self.control_current);
        for i in 0..map_len {
            buf.put_u8(self.removable.get(i).copied().unwrap_or(0));
        }
        // PortPwrCtrlMask: all ones for USB 1.1 compatibility
        for _ in 0..map_len {
            buf.put_u8(0xff);
        }
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hub_descriptor() {
        let desc = HubDescriptor {
            num_ports: 4,
            characteristics: 0x0009,
            power_on_to_good: 50,
            control_current: 100,
            removable: vec![0],
        };
        let bytes = desc.to_bytes();
        assert_eq!(bytes.len(), 9);
        assert_eq!(bytes[0], 9);
        let parsed = HubDescriptor::parse(&bytes).unwrap();
        assert_eq!(parsed, desc);
        assert_eq!(parsed.power_good_ms(), 100);
    }

    #[test]
    fn test_port_status_bits() {
        let status = PortStatus(PortStatus::CONNECTION | PortStatus::POWER | PortStatus::LOW_SPEED);
        assert!(status.connected());
        assert!(status.powered());
        assert!(!status.enabled());
        assert_eq!(status.speed(), DeviceSpeed::Low);
    }

    #[test]
    fn test_change_ack_order() {
        let change = PortChange(PortChange::RESET | PortChange::CONNECTION);
        assert_eq!(
            change.next_pending(),
            Some((PortChange::CONNECTION, C_PORT_CONNECTION))
        );
        let mut change = change;
        change.clear(PortChange::CONNECTION);
        assert_eq!(change.next_pending(), Some((PortChange::RESET, C_PORT_RESET)));
        change.clear(PortChange::RESET);
        assert!(change.is_empty());
    }

    #[test]
    fn test_status_words() {
        let bytes = encode_status_words(0x0103, 0x0001);
        assert_eq!(bytes, vec![0x03, 0x01, 0x01, 0x00]);
        assert_eq!(parse_status_words(&bytes).unwrap(), (0x0103, 0x0001));
        assert!(parse_status_words(&bytes[..3]).is_err());
    }
}
