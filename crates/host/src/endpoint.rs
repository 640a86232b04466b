//! Endpoints owned by a device

use protocol::{DataPid, Direction, EndpointDescriptor, TransferKind};

/// One live endpoint of a device, with its data toggles
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    address: u8,
    kind: TransferKind,
    max_packet_size: u16,
    interval: u8,
    /// Interface that instantiated the endpoint; `None` for the default pipe
    interface: Option<u8>,
    toggles: [DataPid; 2],
}

impl Endpoint {
    /// The default control pipe, before the real max packet size is known
    pub fn control(max_packet_size: u16) -> Self {
        Self {
            address: 0,
            kind: TransferKind::Control,
            max_packet_size,
            interval: 0,
            interface: None,
            toggles: [DataPid::Data0; 2],
        }
    }

    pub fn from_descriptor(descriptor: &EndpointDescriptor, interface: u8) -> Self {
        Self {
            address: descriptor.address,
            kind: descriptor.kind(),
            max_packet_size: descriptor.max_packet_size & 0x07ff,
            interval: descriptor.interval,
            interface: Some(interface),
            toggles: [DataPid::Data0; 2],
        }
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    pub fn number(&self) -> u8 {
        self.address & 0x0f
    }

    pub fn direction(&self) -> Direction {
        Direction::from_bit7(self.address)
    }

    pub fn kind(&self) -> TransferKind {
        self.kind
    }

    pub fn max_packet_size(&self) -> u16 {
        self.max_packet_size
    }

    /// Polling interval in frames, at least one
    pub fn interval(&self) -> u16 {
        (self.interval as u16).max(1)
    }

    pub fn interface(&self) -> Option<u8> {
        self.interface
    }

    pub fn toggle(&self, direction: Direction) -> DataPid {
        self.toggles[direction.index()]
    }

    pub fn set_toggle(&mut self, direction: Direction, pid: DataPid) {
        self.toggles[direction.index()] = pid;
    }

    pub(crate) fn set_max_packet_size(&mut self, max_packet_size: u16) {
        self.max_packet_size = max_packet_size;
    }
}
