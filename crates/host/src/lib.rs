//! USB 2.0 full/low-speed host stack for DesignWare-style OTG cores
//!
//! The stack runs entirely inside one [`UsbHost`] context. Platform code
//! supplies the controller registers, a one-shot timer and an interrupt
//! mask through the traits in [`hal`], then calls
//! [`UsbHost::handle_interrupt`] and [`UsbHost::handle_timer`] as events
//! arrive. Devices plugged into the root port or any hub are enumerated
//! automatically and offered to registered [`Driver`]s.
//!
//! # Example
//!
//! ```no_run
//! use host::{HostConfig, UsbHost};
//! # fn platform() -> (Box<dyn host::HostController>, Box<dyn host::OneshotTimer>, std::rc::Rc<dyn host::InterruptMask>) { unimplemented!() }
//!
//! # fn main() -> host::Result<()> {
//! let (hw, timer, irq) = platform();
//! let mut usb = UsbHost::new(HostConfig::default(), hw, timer, irq)?;
//! usb.start();
//! // from the interrupt handler:
//! usb.handle_interrupt();
//! # Ok(())
//! # }
//! ```

pub mod activation;
pub mod channel;
pub mod config;
pub mod device;
pub mod driver;
pub mod endpoint;
pub mod error;
pub mod frame;
pub mod hal;
pub mod host;
pub mod hub;
pub mod root;
pub mod scheduler;
pub mod urb;

pub use activation::ActivationRequester;
pub use channel::{Channel, ChannelState};
pub use config::{HostConfig, load_config};
pub use device::{Attachment, Device, DeviceId, DeviceState};
pub use driver::{Driver, DriverDevice, DriverDeviceRef};
pub use endpoint::Endpoint;
pub use error::{HostError, Result};
pub use hal::{
    ChannelConfig, ChannelInterrupts, ChannelPid, CoreInterrupts, HostController, InterruptMask,
    OneshotTimer, RootPortStatus, RxPacketStatus, RxStatus, TimerEvent, TimerHandle, TxQueue,
};
pub use host::UsbHost;
pub use hub::{Hub, HubPort, HubState};
pub use root::{RootPort, RootPortState};
pub use urb::{Completion, EndpointRef, Urb, UrbCallback, UrbCompletion, UrbId, UrbStatus};
