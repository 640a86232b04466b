//! Class driver capabilities
//!
//! A [`Driver`] is offered every device that finishes enumeration. When it
//! wants the device it creates its own per-device state, wraps it in a
//! [`DriverDeviceRef`] and claims interfaces or the whole device with it.
//! The host keeps the handle and reports progress and removal through the
//! [`DriverDevice`] callbacks.

use crate::UsbHost;
use crate::device::DeviceId;
use std::cell::RefCell;
use std::rc::Rc;

pub trait Driver {
    fn name(&self) -> &str;

    /// Offered a newly enumerated, still unconfigured device
    fn probe(&mut self, host: &mut UsbHost, device: DeviceId);
}

pub trait DriverDevice {
    /// The claimed interface now runs the requested alternate setting and
    /// its endpoints exist
    fn interface_claimed(&mut self, _host: &mut UsbHost, _device: DeviceId, _interface: u8) {}

    /// The claimed device reached the Configured state
    fn device_claimed(&mut self, _host: &mut UsbHost, _device: DeviceId) {}

    /// The device is gone; its URBs are already retired
    fn disconnected(&mut self, host: &mut UsbHost, device: DeviceId);
}

/// Shared handle to a driver's per-device state
pub type DriverDeviceRef = Rc<RefCell<dyn DriverDevice>>;

/// A [`DriverDevice`] callback that could not run yet because the driver
/// was already borrowed further up the stack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DriverNotice {
    InterfaceClaimed(u8),
    DeviceClaimed,
    Disconnected,
}

impl DriverNotice {
    pub(crate) fn deliver(self, driver: &mut dyn DriverDevice, host: &mut UsbHost, device: DeviceId) {
        match self {
            DriverNotice::InterfaceClaimed(interface) => {
                driver.interface_claimed(host, device, interface)
            }
            DriverNotice::DeviceClaimed => driver.device_claimed(host, device),
            DriverNotice::Disconnected => driver.disconnected(host, device),
        }
    }
}
