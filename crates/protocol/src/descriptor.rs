//! Standard USB descriptors
//!
//! Parsing and encoding of the Device, Configuration, Interface, Endpoint and
//! String descriptor layouts from chapter 9 of the USB 2.0 specification.
//! Parsing never reinterprets the byte buffer in place: every field is read
//! explicitly in little-endian order.

use crate::error::{ProtocolError, Result};
use crate::types::{
    DESC_CONFIGURATION, DESC_DEVICE, DESC_ENDPOINT, DESC_INTERFACE, DESC_STRING, Direction,
    TransferKind,
};
use byteorder::{ByteOrder, LittleEndian};
use bytes::BufMut;
use serde::{Deserialize, Serialize};

pub const DEVICE_DESC_LEN: usize = 18;
pub const CONFIGURATION_DESC_LEN: usize = 9;
pub const INTERFACE_DESC_LEN: usize = 9;
pub const ENDPOINT_DESC_LEN: usize = 7;

/// Offset of bMaxPacketSize0 inside the device descriptor
const MAX_PACKET0_OFFSET: usize = 7;

fn require(bytes: &[u8], needed: usize) -> Result<()> {
    if bytes.len() < needed {
        return Err(ProtocolError::Truncated {
            needed,
            available: bytes.len(),
        });
    }
    Ok(())
}

fn expect_type(bytes: &[u8], expected: u8) -> Result<()> {
    if bytes[1] != expected {
        return Err(ProtocolError::UnexpectedType {
            expected,
            found: bytes[1],
        });
    }
    Ok(())
}

/// Standard device descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub usb_version: u16,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
    pub max_packet_size0: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    pub device_version: u16,
    pub manufacturer_index: u8,
    pub product_index: u8,
    pub serial_index: u8,
    pub num_configurations: u8,
}

impl DeviceDescriptor {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        require(bytes, DEVICE_DESC_LEN)?;
        expect_type(bytes, DESC_DEVICE)?;
        Ok(Self {
            usb_version: LittleEndian::read_u16(&bytes[2..4]),
            class: bytes[4],
            subclass: bytes[5],
            protocol: bytes[6],
            max_packet_size0: bytes[7],
            vendor_id: LittleEndian::read_u16(&bytes[8..10]),
            product_id: LittleEndian::read_u16(&bytes[10..12]),
            device_version: LittleEndian::read_u16(&bytes[12..14]),
            manufacturer_index: bytes[14],
            product_index: bytes[15],
            serial_index: bytes[16],
            num_configurations: bytes[17],
        })
    }

    /// Read bMaxPacketSize0 from the first 8 bytes of a device descriptor
    ///
    /// This is all the host can rely on before it knows the real packet size
    /// of the default endpoint.
    pub fn parse_max_packet_size0(bytes: &[u8]) -> Result<u8> {
        require(bytes, MAX_PACKET0_OFFSET + 1)?;
        expect_type(bytes, DESC_DEVICE)?;
        Ok(bytes[MAX_PACKET0_OFFSET])
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(DEVICE_DESC_LEN);
        buf.put_u8(DEVICE_DESC_LEN as u8);
        buf.put_u8(DESC_DEVICE);
        buf.put_u16_le(self.usb_version);
        buf.put_u8(self.class);
        buf.put_u8(self.subclass);
        buf.put_u8(self.protocol);
        buf.put_u8(self.max_packet_size0);
        buf.put_u16_le(self.vendor_id);
        buf.put_u16_le(self.product_id);
        buf.put_u16_le(self.device_version);
        buf.put_u8(self.manufacturer_index);
        buf.put_u8(self.product_index);
        buf.put_u8(self.serial_index);
        buf.put_u8(self.num_configurations);
        buf
    }
}

/// Configuration descriptor header
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigurationDescriptor {
    /// wTotalLength: size of the configuration including all sub-descriptors
    pub total_length: u16,
    pub num_interfaces: u8,
    pub value: u8,
    pub string_index: u8,
    pub attributes: u8,
    /// bMaxPower in 2mA units
    pub max_power: u8,
}

impl ConfigurationDescriptor {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        require(bytes, CONFIGURATION_DESC_LEN)?;
        expect_type(bytes, DESC_CONFIGURATION)?;
        Ok(Self {
            total_length: LittleEndian::read_u16(&bytes[2..4]),
            num_interfaces: bytes[4],
            value: bytes[5],
            string_index: bytes[6],
            attributes: bytes[7],
            max_power: bytes[8],
        })
    }

    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.put_u8(CONFIGURATION_DESC_LEN as u8);
        buf.put_u8(DESC_CONFIGURATION);
        buf.put_u16_le(self.total_length);
        buf.put_u8(self.num_interfaces);
        buf.put_u8(self.value);
        buf.put_u8(self.string_index);
        buf.put_u8(self.attributes);
        buf.put_u8(self.max_power);
    }
}

/// Interface descriptor (one per alternate setting)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceDescriptor {
    pub number: u8,
    pub alternate_setting: u8,
    pub num_endpoints: u8,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
    pub string_index: u8,
}

impl InterfaceDescriptor {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        require(bytes, INTERFACE_DESC_LEN)?;
        expect_type(bytes, DESC_INTERFACE)?;
        Ok(Self {
            number: bytes[2],
            alternate_setting: bytes[3],
            num_endpoints: bytes[4],
            class: bytes[5],
            subclass: bytes[6],
            protocol: bytes[7],
            string_index: bytes[8],
        })
    }

    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.put_u8(INTERFACE_DESC_LEN as u8);
        buf.put_u8(DESC_INTERFACE);
        buf.put_u8(self.number);
        buf.put_u8(self.alternate_setting);
        buf.put_u8(self.num_endpoints);
        buf.put_u8(self.class);
        buf.put_u8(self.subclass);
        buf.put_u8(self.protocol);
        buf.put_u8(self.string_index);
    }
}

/// Endpoint descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointDescriptor {
    /// bEndpointAddress, direction in bit 7
    pub address: u8,
    pub attributes: u8,
    pub max_packet_size: u16,
    /// bInterval, in frames for full/low-speed interrupt endpoints
    pub interval: u8,
}

impl EndpointDescriptor {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        require(bytes, ENDPOINT_DESC_LEN)?;
        expect_type(bytes, DESC_ENDPOINT)?;
        Ok(Self {
            address: bytes[2],
            attributes: bytes[3],
            max_packet_size: LittleEndian::read_u16(&bytes[4..6]) & 0x07ff,
            interval: bytes[6],
        })
    }

    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.put_u8(ENDPOINT_DESC_LEN as u8);
        buf.put_u8(DESC_ENDPOINT);
        buf.put_u8(self.address);
        buf.put_u8(self.attributes);
        buf.put_u16_le(self.max_packet_size);
        buf.put_u8(self.interval);
    }

    pub fn number(&self) -> u8 {
        self.address & 0x0f
    }

    pub fn direction(&self) -> Direction {
        Direction::from_bit7(self.address)
    }

    pub fn kind(&self) -> TransferKind {
        TransferKind::from_attributes(self.attributes)
    }
}

/// Decode a string descriptor into a Rust string
pub fn decode_string(bytes: &[u8]) -> Result<String> {
    require(bytes, 2)?;
    expect_type(bytes, DESC_STRING)?;
    let declared = bytes[0] as usize;
    if declared < 2 {
        return Err(ProtocolError::InvalidLength {
            length: bytes[0],
            offset: 0,
        });
    }
    // Devices sometimes return fewer bytes than bLength claims.
    let end = declared.min(bytes.len()) & !1;
    let units: Vec<u16> = bytes[2..end.max(2)]
        .chunks_exact(2)
        .map(LittleEndian::read_u16)
        .collect();
    String::from_utf16(&units).map_err(|_| ProtocolError::InvalidString)
}

/// Encode a Rust string as a string descriptor
pub fn encode_string(text: &str) -> Vec<u8> {
    let units: Vec<u16> = text.encode_utf16().collect();
    let length = (2 + units.len() * 2).min(u8::MAX as usize & !1);
    let mut buf = Vec::with_capacity(length);
    buf.put_u8(length as u8);
    buf.put_u8(DESC_STRING);
    for unit in units.iter().take((length - 2) / 2) {
        buf.put_u16_le(*unit);
    }
    buf
}
