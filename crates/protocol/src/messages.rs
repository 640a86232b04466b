//! Control setup packets and standard requests
//!
//! Every control transfer starts with an 8-byte SETUP packet. This module
//! defines the packet layout and constructors for the standard and hub class
//! requests the host stack issues during enumeration and hub management.

use crate::error::{ProtocolError, Result};
use crate::types::{DESC_CONFIGURATION, DESC_DEVICE, DESC_HUB, DESC_STRING, Direction};
use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};

/// Standard request codes (USB 2.0 table 9-4)
pub const REQ_GET_STATUS: u8 = 0x00;
pub const REQ_CLEAR_FEATURE: u8 = 0x01;
pub const REQ_SET_FEATURE: u8 = 0x03;
pub const REQ_SET_ADDRESS: u8 = 0x05;
pub const REQ_GET_DESCRIPTOR: u8 = 0x06;
pub const REQ_SET_CONFIGURATION: u8 = 0x09;
pub const REQ_SET_INTERFACE: u8 = 0x0b;

/// bmRequestType values used by the stack
pub const RT_DEVICE_OUT: u8 = 0x00;
pub const RT_DEVICE_IN: u8 = 0x80;
pub const RT_INTERFACE_OUT: u8 = 0x01;
pub const RT_HUB_OUT: u8 = 0x20;
pub const RT_HUB_IN: u8 = 0xa0;
pub const RT_PORT_OUT: u8 = 0x23;
pub const RT_PORT_IN: u8 = 0xa3;

/// Size of a SETUP packet on the wire
pub const SETUP_PACKET_LEN: usize = 8;

/// Standard device descriptor length
pub const DEVICE_DESCRIPTOR_LEN: u16 = 18;

/// A control transfer SETUP packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetupPacket {
    /// bmRequestType
    pub request_type: u8,
    /// bRequest
    pub request: u8,
    /// wValue
    pub value: u16,
    /// wIndex
    pub index: u16,
    /// wLength
    pub length: u16,
}

impl SetupPacket {
    pub fn new(request_type: u8, request: u8, value: u16, index: u16, length: u16) -> Self {
        Self {
            request_type,
            request,
            value,
            index,
            length,
        }
    }

    /// Direction of the data stage, from bit 7 of bmRequestType
    pub fn direction(&self) -> Direction {
        Direction::from_bit7(self.request_type)
    }

    /// True when the transfer has a data stage
    pub fn has_data_stage(&self) -> bool {
        self.length != 0
    }

    /// Descriptor type addressed by a GET_DESCRIPTOR request
    pub fn descriptor_type(&self) -> u8 {
        (self.value >> 8) as u8
    }

    /// Descriptor index addressed by a GET_DESCRIPTOR request
    pub fn descriptor_index(&self) -> u8 {
        (self.value & 0xff) as u8
    }

    pub fn to_bytes(&self) -> [u8; SETUP_PACKET_LEN] {
        let mut buf = [0u8; SETUP_PACKET_LEN];
        buf[0] = self.request_type;
        buf[1] = self.request;
        LittleEndian::write_u16(&mut buf[2..4], self.value);
        LittleEndian::write_u16(&mut buf[4..6], self.index);
        LittleEndian::write_u16(&mut buf[6..8], self.length);
        buf
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < SETUP_PACKET_LEN {
            return Err(ProtocolError::Truncated {
                needed: SETUP_PACKET_LEN,
                available: bytes.len(),
            });
        }
        Ok(Self {
            request_type: bytes[0],
            request: bytes[1],
            value: LittleEndian::read_u16(&bytes[2..4]),
            index: LittleEndian::read_u16(&bytes[4..6]),
            length: LittleEndian::read_u16(&bytes[6..8]),
        })
    }

    // Standard device requests

    pub fn set_address(address: u8) -> Self {
        Self::new(RT_DEVICE_OUT, REQ_SET_ADDRESS, address as u16, 0, 0)
    }

    pub fn get_device_descriptor(length: u16) -> Self {
        Self::new(
            RT_DEVICE_IN,
            REQ_GET_DESCRIPTOR,
            (DESC_DEVICE as u16) << 8,
            0,
            length,
        )
    }

    pub fn get_configuration_descriptor(index: u8, length: u16) -> Self {
        Self::new(
            RT_DEVICE_IN,
            REQ_GET_DESCRIPTOR,
            ((DESC_CONFIGURATION as u16) << 8) | index as u16,
            0,
            length,
        )
    }

    pub fn get_string_descriptor(index: u8, language: u16, length: u16) -> Self {
        Self::new(
            RT_DEVICE_IN,
            REQ_GET_DESCRIPTOR,
            ((DESC_STRING as u16) << 8) | index as u16,
            language,
            length,
        )
    }

    pub fn set_configuration(value: u8) -> Self {
        Self::new(RT_DEVICE_OUT, REQ_SET_CONFIGURATION, value as u16, 0, 0)
    }

    pub fn set_interface(interface: u8, alternate: u8) -> Self {
        Self::new(
            RT_INTERFACE_OUT,
            REQ_SET_INTERFACE,
            alternate as u16,
            interface as u16,
            0,
        )
    }

    // Hub class requests (USB 2.0 table 11-15)

    pub fn get_hub_descriptor(length: u16) -> Self {
        Self::new(
            RT_HUB_IN,
            REQ_GET_DESCRIPTOR,
            (DESC_HUB as u16) << 8,
            0,
            length,
        )
    }

    pub fn get_hub_status() -> Self {
        Self::new(RT_HUB_IN, REQ_GET_STATUS, 0, 0, 4)
    }

    pub fn clear_hub_feature(feature: u16) -> Self {
        Self::new(RT_HUB_OUT, REQ_CLEAR_FEATURE, feature, 0, 0)
    }

    pub fn get_port_status(port: u8) -> Self {
        Self::new(RT_PORT_IN, REQ_GET_STATUS, 0, port as u16, 4)
    }

    pub fn set_port_feature(port: u8, feature: u16) -> Self {
        Self::new(RT_PORT_OUT, REQ_SET_FEATURE, feature, port as u16, 0)
    }

    pub fn clear_port_feature(port: u8, feature: u16) -> Self {
        Self::new(RT_PORT_OUT, REQ_CLEAR_FEATURE, feature, port as u16, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_setup_packet_layout() {
        let setup = SetupPacket::get_configuration_descriptor(1, 64);
        let bytes = setup.to_bytes();
        assert_eq!(bytes, [0x80, 0x06, 0x01, 0x02, 0x00, 0x00, 0x40, 0x00]);
        assert_eq!(SetupPacket::from_bytes(&bytes).unwrap(), setup);
    }

    #[test]
    fn test_setup_direction() {
        assert_eq!(
            SetupPacket::get_device_descriptor(8).direction(),
            Direction::In
        );
        assert_eq!(SetupPacket::set_address(3).direction(), Direction::Out);
        assert!(!SetupPacket::set_address(3).has_data_stage());
    }

    #[test]
    fn test_string_request_carries_language() {
        let setup = SetupPacket::get_string_descriptor(2, 0x0409, 255);
        assert_eq!(setup.descriptor_type(), DESC_STRING);
        assert_eq!(setup.descriptor_index(), 2);
        assert_eq!(setup.index, 0x0409);
    }

    #[test]
    fn test_port_requests() {
        let reset = SetupPacket::set_port_feature(3, 4);
        assert_eq!(reset.request_type, RT_PORT_OUT);
        assert_eq!(reset.request, REQ_SET_FEATURE);
        assert_eq!(reset.index, 3);
        assert_eq!(reset.value, 4);
    }

    #[test]
    fn test_truncated_setup() {
        let err = SetupPacket::from_bytes(&[0x80, 0x06]).unwrap_err();
        assert_eq!(
            err,
            ProtocolError::Truncated {
                needed: 8,
                available: 2
            }
        );
    }
}
