//! USB Request Blocks
//!
//! A [`Urb`] describes one transfer: the target endpoint, the setup packet
//! for control transfers, the data buffer and who to tell when it is done.
//! Submitting hands the URB to the host's arena; the returned [`UrbId`] is
//! the only way to refer to it afterwards.

use crate::UsbHost;
use crate::device::DeviceId;
use protocol::messages::SETUP_PACKET_LEN;
use protocol::{Direction, SetupPacket, TransferKind};
use std::fmt;

/// Handle for a submitted URB
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UrbId(pub u64);

/// Endpoint a URB targets, by device and endpoint address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EndpointRef {
    pub device: DeviceId,
    pub address: u8,
}

impl EndpointRef {
    pub fn default_pipe(device: DeviceId) -> Self {
        Self { device, address: 0 }
    }
}

/// Final result of a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UrbStatus {
    Ok,
    Stall,
    TransactionError,
    BabbleError,
    DataToggleError,
    FrameOverrun,
}

impl UrbStatus {
    pub fn is_ok(self) -> bool {
        self == Self::Ok
    }
}

impl fmt::Display for UrbStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Ok => "ok",
            Self::Stall => "stall",
            Self::TransactionError => "transaction error",
            Self::BabbleError => "babble",
            Self::DataToggleError => "data toggle error",
            Self::FrameOverrun => "frame overrun",
        };
        f.write_str(name)
    }
}

/// What a completion callback sees
#[derive(Debug)]
pub struct UrbCompletion<'a> {
    pub id: UrbId,
    pub status: UrbStatus,
    /// Bytes actually transferred; for IN transfers, the received data
    pub data: &'a [u8],
}

pub type UrbCallback = Box<dyn FnMut(&mut UsbHost, UrbCompletion<'_>)>;

/// Completion target of a URB
pub enum Completion {
    /// Enumeration and configuration traffic of a device
    Device(DeviceId),
    /// Control traffic of the built-in hub logic
    Hub(DeviceId),
    /// The hub's status change interrupt endpoint
    HubStatus(DeviceId),
    /// A class driver
    Callback(UrbCallback),
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Device(id) => f.debug_tuple("Device").field(id).finish(),
            Self::Hub(id) => f.debug_tuple("Hub").field(id).finish(),
            Self::HubStatus(id) => f.debug_tuple("HubStatus").field(id).finish(),
            Self::Callback(_) => f.write_str("Callback(..)"),
        }
    }
}

#[derive(Debug)]
pub struct Urb {
    pub endpoint: EndpointRef,
    pub setup: Option<SetupPacket>,
    /// OUT data to send, or the receive area for IN transfers
    pub buffer: Vec<u8>,
    /// Bytes transferred so far
    pub actual: usize,
    /// Polling interval in frames for periodic endpoints; zero means the
    /// endpoint's bInterval
    pub interval: u16,
    pub completion: Completion,
    pub(crate) kind: TransferKind,
    pub(crate) channel: Option<usize>,
}

impl Urb {
    /// Control transfer on the default pipe. For IN requests the buffer is
    /// sized from wLength; for OUT requests `data` is sent, cut to wLength.
    pub fn control(
        device: DeviceId,
        setup: SetupPacket,
        mut data: Vec<u8>,
        completion: Completion,
    ) -> Self {
        let length = setup.length as usize;
        if setup.direction() == Direction::In {
            data = vec![0; length];
        } else {
            data.resize(length, 0);
        }
        Self {
            endpoint: EndpointRef::default_pipe(device),
            setup: Some(setup),
            buffer: data,
            actual: 0,
            interval: 0,
            completion,
            kind: TransferKind::Control,
            channel: None,
        }
    }

    /// IN transfer of up to `length` bytes on a bulk/interrupt/iso endpoint
    pub fn transfer_in(endpoint: EndpointRef, length: usize, completion: Completion) -> Self {
        Self::transfer(endpoint, vec![0; length], completion)
    }

    /// OUT transfer of `data` on a bulk/interrupt/iso endpoint
    pub fn transfer_out(endpoint: EndpointRef, data: Vec<u8>, completion: Completion) -> Self {
        Self::transfer(endpoint, data, completion)
    }

    fn transfer(endpoint: EndpointRef, buffer: Vec<u8>, completion: Completion) -> Self {
        Self {
            endpoint,
            setup: None,
            buffer,
            actual: 0,
            interval: 0,
            completion,
            kind: TransferKind::Bulk,
            channel: None,
        }
    }

    /// Override the endpoint's polling interval
    pub fn with_interval(mut self, frames: u16) -> Self {
        self.interval = frames;
        self
    }

    pub fn length(&self) -> usize {
        self.buffer.len()
    }

    pub fn kind(&self) -> TransferKind {
        self.kind
    }

    pub fn is_periodic(&self) -> bool {
        self.kind.is_periodic()
    }

    /// Direction of the data stage (control) or of the endpoint
    pub fn direction(&self) -> Direction {
        match &self.setup {
            Some(setup) => setup.direction(),
            None => Direction::from_bit7(self.endpoint.address),
        }
    }

    pub(crate) fn setup_bytes(&self) -> [u8; SETUP_PACKET_LEN] {
        self.setup.map(|s| s.to_bytes()).unwrap_or_default()
    }

    /// Bytes handed to the completion
    pub fn data(&self) -> &[u8] {
        &self.buffer[..self.actual.min(self.buffer.len())]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_in_sizes_buffer_from_setup() {
        let urb = Urb::control(
            DeviceId(1),
            SetupPacket::get_device_descriptor(18),
            vec![1, 2, 3],
            Completion::Device(DeviceId(1)),
        );
        assert_eq!(urb.length(), 18);
        assert_eq!(urb.direction(), Direction::In);
        assert!(urb.buffer.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_control_out_without_data_stage() {
        let urb = Urb::control(
            DeviceId(1),
            SetupPacket::set_address(5),
            Vec::new(),
            Completion::Device(DeviceId(1)),
        );
        assert_eq!(urb.length(), 0);
        assert_eq!(urb.setup_bytes()[1], 0x05);
    }

    #[test]
    fn test_transfer_direction_follows_endpoint() {
        let ep = EndpointRef {
            device: DeviceId(2),
            address: 0x81,
        };
        let urb = Urb::transfer_in(ep, 8, Completion::HubStatus(DeviceId(2))).with_interval(4);
        assert_eq!(urb.direction(), Direction::In);
        assert_eq!(urb.interval, 4);
        assert_eq!(urb.data(), &[] as &[u8]);
    }

    #[test]
    fn test_completion_debug_hides_closure() {
        let completion = Completion::Callback(Box::new(|_, _| {}));
        assert_eq!(format!("{:?}", completion), "Callback(..)");
    }
}
