//! USB 2.0 wire formats for the host stack
//!
//! This crate defines the bit-exact structures exchanged with devices over
//! the default control pipe: SETUP packets, the standard descriptors, the
//! configuration descriptor tree and the hub class structures. Nothing here
//! touches hardware; the host crate builds on these types.
//!
//! # Example
//!
//! ```
//! use protocol::{Configuration, SetupPacket};
//!
//! let setup = SetupPacket::get_configuration_descriptor(0, 64);
//! assert_eq!(setup.to_bytes()[1], 0x06);
//!
//! let blob = [9, 2, 18, 0, 1, 1, 0, 0x80, 50, 9, 4, 0, 0, 0, 0xff, 0, 0, 0];
//! let config = Configuration::parse(&blob).unwrap();
//! assert_eq!(config.interfaces.len(), 1);
//! ```

pub mod descriptor;
pub mod error;
pub mod hub;
pub mod messages;
pub mod tree;
pub mod types;

pub use descriptor::{
    ConfigurationDescriptor, DeviceDescriptor, EndpointDescriptor, InterfaceDescriptor,
    decode_string, encode_string,
};
pub use error::{ProtocolError, Result};
pub use hub::{HubChange, HubDescriptor, PortChange, PortStatus};
pub use messages::SetupPacket;
pub use tree::{
    AlternateSetting, Configuration, DescriptorToken, DescriptorWalker, ExtraDescriptor, Interface,
};
pub use types::{DataPid, DeviceSpeed, Direction, TransferKind};
