//! Class drivers used by the simulator

use host::{
    Completion, DeviceId, Driver, DriverDevice, DriverDeviceRef, EndpointRef, Urb, UrbId,
    UsbHost,
};
use protocol::{Direction, TransferKind};
use std::cell::RefCell;
use std::rc::Rc;
use tracing::{debug, info, warn};

/// bInterfaceClass of HID
pub const CLASS_HID: u8 = 0x03;

/// Reports seen by every keyboard the driver runs, oldest first
pub type ReportLog = Rc<RefCell<Vec<(DeviceId, Vec<u8>)>>>;

/// Claims interface 0 of HID devices with an interrupt IN endpoint and
/// polls it for reports
pub struct KeyboardDriver {
    reports: ReportLog,
    bound: Rc<RefCell<Vec<DeviceId>>>,
}

impl KeyboardDriver {
    pub fn new() -> Self {
        Self {
            reports: Rc::new(RefCell::new(Vec::new())),
            bound: Rc::new(RefCell::new(Vec::new())),
        }
    }

    pub fn reports(&self) -> ReportLog {
        Rc::clone(&self.reports)
    }

    /// Devices currently driven
    pub fn bound(&self) -> Rc<RefCell<Vec<DeviceId>>> {
        Rc::clone(&self.bound)
    }
}

impl Default for KeyboardDriver {
    fn default() -> Self {
        Self::new()
    }
}

/// Interface and configuration of the first HID interface with an
/// interrupt IN endpoint
fn find_keyboard(host: &UsbHost, device: DeviceId) -> Option<(u8, u8)> {
    let device = host.device(device)?;
    device.configurations().iter().find_map(|config| {
        config.interfaces.iter().find_map(|interface| {
            let alt = interface.alternate(0)?;
            let has_in = alt.endpoints.iter().any(|ep| {
                Direction::from_bit7(ep.address).is_in()
                    && TransferKind::from_attributes(ep.attributes) == TransferKind::Interrupt
            });
            (alt.descriptor.class == CLASS_HID && has_in).then_some((config.value(), interface.number))
        })
    })
}

impl Driver for KeyboardDriver {
    fn name(&self) -> &str {
        "keyboard"
    }

    fn probe(&mut self, host: &mut UsbHost, device: DeviceId) {
        let Some((configuration, interface)) = find_keyboard(host, device) else {
            return;
        };
        let state: DriverDeviceRef = Rc::new(RefCell::new(KeyboardDevice {
            interface,
            urb: None,
            reports: Rc::clone(&self.reports),
            bound: Rc::clone(&self.bound),
        }));
        if let Err(e) = host.claim_interface(device, interface, 0, Rc::clone(&state)) {
            warn!(device = device.0, "Failed to claim keyboard interface: {}", e);
            return;
        }
        if let Err(e) = host.claim_device(device, state) {
            warn!(device = device.0, "Failed to claim keyboard: {}", e);
            return;
        }
        if let Err(e) = host.select_configuration(device, configuration) {
            warn!(device = device.0, "Failed to configure keyboard: {}", e);
        }
    }
}

struct KeyboardDevice {
    interface: u8,
    urb: Option<UrbId>,
    reports: ReportLog,
    bound: Rc<RefCell<Vec<DeviceId>>>,
}

impl DriverDevice for KeyboardDevice {
    fn interface_claimed(&mut self, host: &mut UsbHost, device: DeviceId, interface: u8) {
        if interface != self.interface || self.urb.is_some() {
            return;
        }
        let Some(endpoint) = host.device(device).and_then(|d| {
            d.endpoints().iter().find(|ep| {
                ep.interface() == Some(interface)
                    && ep.direction().is_in()
                    && ep.kind() == TransferKind::Interrupt
            })
        }) else {
            warn!(device = device.0, interface, "Keyboard has no interrupt IN endpoint");
            return;
        };
        let target = EndpointRef {
            device,
            address: endpoint.address(),
        };
        let length = endpoint.max_packet_size() as usize;

        let reports = Rc::clone(&self.reports);
        let urb = Urb::transfer_in(
            target,
            length,
            Completion::Callback(Box::new(move |_host, done| {
                if done.status.is_ok() && !done.data.is_empty() {
                    debug!(device = device.0, report = ?done.data, "Keyboard report");
                    reports.borrow_mut().push((device, done.data.to_vec()));
                }
            })),
        );
        match host.submit_urb(urb) {
            Ok(id) => {
                self.urb = Some(id);
                info!(device = device.0, "Keyboard polling started");
            }
            Err(e) => warn!(device = device.0, "Failed to start keyboard polling: {}", e),
        }
    }

    fn device_claimed(&mut self, _host: &mut UsbHost, device: DeviceId) {
        self.bound.borrow_mut().push(device);
    }

    fn disconnected(&mut self, _host: &mut UsbHost, device: DeviceId) {
        info!(device = device.0, "Keyboard disconnected");
        self.urb = None;
        self.bound.borrow_mut().retain(|d| *d != device);
    }
}
