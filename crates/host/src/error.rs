//! Host stack error types

use crate::device::DeviceId;
use crate::urb::UrbId;
use protocol::ProtocolError;
use thiserror::Error;

/// Errors returned by the public host operations
///
/// Wire-level failures of a transfer are not errors here: they are reported
/// through the URB's completion as a nonzero [`UrbStatus`](crate::UrbStatus).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HostError {
    #[error("No such device: {0:?}")]
    NoSuchDevice(DeviceId),

    #[error("Device {device:?} has no endpoint {address:#04x}")]
    NoSuchEndpoint { device: DeviceId, address: u8 },

    #[error("No such URB: {0:?}")]
    NoSuchUrb(UrbId),

    #[error("Endpoint {address:#04x} of device {device:?} already has a control transfer pending")]
    EndpointBusy { device: DeviceId, address: u8 },

    #[error("Operation not allowed in device state {0}")]
    InvalidState(&'static str),

    #[error("Device {device:?} has no configuration {value}")]
    NoSuchConfiguration { device: DeviceId, value: u8 },

    #[error("Device {device:?} has no interface {interface} alternate {alternate}")]
    NoSuchInterface {
        device: DeviceId,
        interface: u8,
        alternate: u8,
    },

    #[error("Interface {interface} of device {device:?} is already claimed")]
    AlreadyClaimed { device: DeviceId, interface: u8 },

    #[error("Device {0:?} is already claimed")]
    DeviceClaimed(DeviceId),

    #[error("Transfer of {length} bytes exceeds the {max}-byte limit of the endpoint")]
    TransferTooLarge { length: usize, max: usize },

    #[error("Invalid host configuration: {0}")]
    Config(String),

    #[error("Control URB without a setup packet")]
    MissingSetup,

    #[error("Descriptor error: {0}")]
    Descriptor(#[from] ProtocolError),
}

/// Type alias for host results
pub type Result<T> = std::result::Result<T, HostError>;
