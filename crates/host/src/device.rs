//! Attached devices and their enumeration
//!
//! Enumeration is a chain of control transfers on the default pipe; each
//! completion moves the device one state further:
//!
//! ```text
//! None -> Address -> DescDevice8 -> DescDevice -> [FetchManuString]
//!      -> [FetchProdString] -> FetchConfigurations (per index) -> Unconfigured
//! ```
//!
//! From Unconfigured a driver (or the built-in hub logic) selects a
//! configuration, which runs Configuring -> Configured and then one
//! SET_INTERFACE per claimed interface that wants a non-default alternate
//! setting. A failed request is simply sent again.

use crate::UsbHost;
use crate::activation::ActivationRequester;
use crate::driver::{DriverDeviceRef, DriverNotice};
use crate::endpoint::Endpoint;
use crate::error::{HostError, Result};
use crate::hal::CriticalSection;
use crate::hub::Hub;
use crate::urb::{Completion, Urb, UrbId, UrbStatus};
use protocol::messages::DEVICE_DESCRIPTOR_LEN;
use protocol::types::CLASS_HUB;
use protocol::{
    Configuration, ConfigurationDescriptor, DeviceDescriptor, DeviceSpeed, ProtocolError,
    SetupPacket, decode_string,
};
use std::rc::Rc;
use tracing::{debug, error, info, warn};

/// Request lengths tried in turn while a device STALLs the first
/// GET_DESCRIPTOR(DEVICE)
pub const PROBE_LENGTHS: [u16; 4] = [8, 16, 32, 64];

/// Handle for a device known to the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceState {
    None,
    Address,
    DescDevice8,
    DescDevice,
    FetchManuString,
    FetchProdString,
    FetchConfigurations,
    Unconfigured,
    Configuring,
    Configured,
    ConfiguringInterfaces,
}

impl DeviceState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "None",
            Self::Address => "Address",
            Self::DescDevice8 => "DescDevice8",
            Self::DescDevice => "DescDevice",
            Self::FetchManuString => "FetchManuString",
            Self::FetchProdString => "FetchProdString",
            Self::FetchConfigurations => "FetchConfigurations",
            Self::Unconfigured => "Unconfigured",
            Self::Configuring => "Configuring",
            Self::Configured => "Configured",
            Self::ConfiguringInterfaces => "ConfiguringInterfaces",
        }
    }

    /// Enumeration has finished and the device has been registered
    pub fn is_enumerated(self) -> bool {
        matches!(
            self,
            Self::Unconfigured | Self::Configuring | Self::Configured | Self::ConfiguringInterfaces
        )
    }
}

/// Where a device is plugged in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Attachment {
    RootPort,
    HubPort { hub: DeviceId, port: u8 },
}

impl Attachment {
    pub(crate) fn requester(self) -> ActivationRequester {
        match self {
            Self::RootPort => ActivationRequester::RootPort,
            Self::HubPort { hub, port } => ActivationRequester::HubPort { hub, port },
        }
    }
}

struct InterfaceClaim {
    interface: u8,
    alternate: u8,
    driver: DriverDeviceRef,
    /// The alternate setting is active and its endpoints exist
    applied: bool,
    notified: bool,
}

pub struct Device {
    id: DeviceId,
    state: DeviceState,
    speed: DeviceSpeed,
    attachment: Attachment,
    address: u8,
    requested_address: u8,
    /// Index 0 is always the default control pipe
    endpoints: Vec<Endpoint>,
    descriptor: Option<DeviceDescriptor>,
    manufacturer: Option<String>,
    product: Option<String>,
    configurations: Vec<Configuration>,
    active_configuration: Option<u8>,
    pending_configuration: Option<u8>,
    probe_attempt: usize,
    config_index: u8,
    /// Request the current enumeration step is waiting on
    request: Option<SetupPacket>,
    device_claim: Option<DriverDeviceRef>,
    device_claim_notified: bool,
    claims: Vec<InterfaceClaim>,
    interface_in_progress: Option<u8>,
    pub(crate) hub: Option<Hub>,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("speed", &self.speed)
            .field("attachment", &self.attachment)
            .field("address", &self.address)
            .field("endpoints", &self.endpoints.len())
            .finish_non_exhaustive()
    }
}

impl Device {
    fn new(id: DeviceId, speed: DeviceSpeed, attachment: Attachment) -> Self {
        Self {
            id,
            state: DeviceState::None,
            speed,
            attachment,
            address: 0,
            requested_address: 0,
            endpoints: vec![Endpoint::control(PROBE_LENGTHS[0])],
            descriptor: None,
            manufacturer: None,
            product: None,
            configurations: Vec::new(),
            active_configuration: None,
            pending_configuration: None,
            probe_attempt: 0,
            config_index: 0,
            request: None,
            device_claim: None,
            device_claim_notified: false,
            claims: Vec::new(),
            interface_in_progress: None,
            hub: None,
        }
    }

    pub fn id(&self) -> DeviceId {
        self.id
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    pub fn speed(&self) -> DeviceSpeed {
        self.speed
    }

    /// Where the device is attached
    pub fn parent(&self) -> Attachment {
        self.attachment
    }

    /// Address the device currently answers on
    pub fn address(&self) -> u8 {
        self.address
    }

    pub fn descriptor(&self) -> Option<&DeviceDescriptor> {
        self.descriptor.as_ref()
    }

    pub fn manufacturer(&self) -> Option<&str> {
        self.manufacturer.as_deref()
    }

    pub fn product(&self) -> Option<&str> {
        self.product.as_deref()
    }

    pub fn configurations(&self) -> &[Configuration] {
        &self.configurations
    }

    pub fn configuration(&self, value: u8) -> Option<&Configuration> {
        self.configurations.iter().find(|c| c.value() == value)
    }

    pub fn active_configuration(&self) -> Option<&Configuration> {
        self.active_configuration.and_then(|v| self.configuration(v))
    }

    pub fn get_endpoint(&self, address: u8) -> Option<&Endpoint> {
        self.endpoints.iter().find(|ep| ep.address() == address)
    }

    pub(crate) fn endpoint_mut(&mut self, address: u8) -> Option<&mut Endpoint> {
        self.endpoints.iter_mut().find(|ep| ep.address() == address)
    }

    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    pub fn is_hub(&self) -> bool {
        self.descriptor.as_ref().is_some_and(|d| d.class == CLASS_HUB)
    }

    pub fn hub(&self) -> Option<&Hub> {
        self.hub.as_ref()
    }

    pub fn is_claimed(&self) -> bool {
        self.device_claim.is_some()
    }

    pub fn is_interface_claimed(&self, interface: u8) -> bool {
        self.claims.iter().any(|c| c.interface == interface)
    }

    /// Configuration that claims are checked against
    fn target_configuration(&self) -> Option<&Configuration> {
        self.pending_configuration
            .or(self.active_configuration)
            .and_then(|v| self.configuration(v))
            .or_else(|| self.configurations.first())
    }

    /// Replace the endpoints of `interface` with those of `alternate`
    fn instantiate_alternate(&mut self, interface: u8, alternate: u8) {
        self.endpoints.retain(|ep| ep.interface() != Some(interface));
        let endpoints: Vec<Endpoint> = self
            .active_configuration()
            .and_then(|c| c.interface(interface))
            .and_then(|i| i.alternate(alternate))
            .map(|alt| {
                alt.endpoints
                    .iter()
                    .map(|desc| Endpoint::from_descriptor(desc, interface))
                    .collect()
            })
            .unwrap_or_default();
        self.endpoints.extend(endpoints);
    }
}

impl UsbHost {
    /// Create a device for a port that has just been reset
    pub(crate) fn create_device(&mut self, speed: DeviceSpeed, attachment: Attachment) -> DeviceId {
        let id = self.allocate_device_id();
        self.devices.insert(id, Device::new(id, speed, attachment));
        info!(device = id.0, ?speed, ?attachment, "Device attached");
        id
    }

    /// Start enumerating `device` as soon as it holds the activation slot
    pub fn queue_device_activation(&mut self, device: DeviceId) {
        let granted = {
            let _cs = CriticalSection::enter(&self.irq);
            self.activation
                .try_acquire(ActivationRequester::Device(device))
        };
        if granted {
            self.activate(device);
        } else {
            debug!(device = device.0, "Waiting for the activation slot");
        }
    }

    /// None -> Address; the caller holds the activation slot for `device`
    pub(crate) fn activate(&mut self, id: DeviceId) {
        let Some(address) = self.addresses.allocate() else {
            error!(device = id.0, "No free device address, device left unaddressed");
            return;
        };
        let Some(device) = self.devices.get_mut(&id) else {
            self.addresses.release(address);
            return;
        };
        device.requested_address = address;
        device.state = DeviceState::Address;
        debug!(device = id.0, address, "Activating device");
        self.device_request(id, SetupPacket::set_address(address));
    }

    /// The device has left address 0; pass the slot on
    fn activation_complete(&mut self, id: DeviceId) {
        let next = {
            let _cs = CriticalSection::enter(&self.irq);
            self.activation.release(ActivationRequester::Device(id))
        };
        if let Some(Attachment::HubPort { hub, port }) = self.devices.get(&id).map(|d| d.attachment)
        {
            self.hub_port_activated(hub, port);
        }
        if let Some(next) = next {
            self.wake_activation(next);
        }
    }

    /// The activation slot has been reserved for `requester`
    pub(crate) fn wake_activation(&mut self, requester: ActivationRequester) {
        debug!(?requester, "Activation slot granted");
        match requester {
            ActivationRequester::RootPort => self.root_activation_granted(),
            ActivationRequester::HubPort { hub, .. } => self.hub_check_status(hub),
            ActivationRequester::Device(id) => self.queue_device_activation(id),
        }
    }

    /// Send one enumeration/configuration request on the default pipe
    fn device_request(&mut self, id: DeviceId, setup: SetupPacket) {
        let Some(device) = self.devices.get_mut(&id) else {
            return;
        };
        device.request = Some(setup);
        let urb = Urb::control(id, setup, Vec::new(), Completion::Device(id));
        if let Err(e) = self.submit_urb(urb) {
            error!(device = id.0, "Failed to submit enumeration request: {}", e);
        }
    }

    /// Completion of a `Completion::Device` URB
    pub(crate) fn device_transfer_complete(&mut self, id: DeviceId, status: UrbStatus, data: &[u8]) {
        let Some(device) = self.devices.get_mut(&id) else {
            return;
        };
        let Some(request) = device.request else {
            warn!(device = id.0, "Unexpected default pipe completion");
            return;
        };

        if !status.is_ok() {
            if device.state == DeviceState::DescDevice8 && status == UrbStatus::Stall {
                device.probe_attempt = (device.probe_attempt + 1) % PROBE_LENGTHS.len();
                let length = PROBE_LENGTHS[device.probe_attempt];
                warn!(device = id.0, length, "Device descriptor probe stalled, retrying");
                self.device_request(id, SetupPacket::get_device_descriptor(length));
            } else {
                warn!(
                    device = id.0,
                    state = device.state.as_str(),
                    %status,
                    "Request failed, resubmitting"
                );
                self.device_request(id, request);
            }
            return;
        }

        if let Err(e) = self.advance_enumeration(id, request, data) {
            warn!(device = id.0, "Malformed response ({}), resubmitting", e);
            self.device_request(id, request);
        }
    }

    fn advance_enumeration(&mut self, id: DeviceId, request: SetupPacket, data: &[u8]) -> Result<()> {
        let probe_len = self.config.config_probe_len;
        let device = self.devices.get_mut(&id).ok_or(HostError::NoSuchDevice(id))?;

        match device.state {
            DeviceState::Address => {
                device.address = device.requested_address;
                device.state = DeviceState::DescDevice8;
                info!(device = id.0, address = device.address, "Address assigned");
                self.activation_complete(id);
                self.device_request(id, SetupPacket::get_device_descriptor(PROBE_LENGTHS[0]));
            }
            DeviceState::DescDevice8 => {
                let mps = DeviceDescriptor::parse_max_packet_size0(data)?;
                if mps == 0 {
                    return Err(ProtocolError::InvalidLength { length: 0, offset: 7 }.into());
                }
                device.endpoints[0].set_max_packet_size(mps as u16);
                device.state = DeviceState::DescDevice;
                debug!(device = id.0, mps, "Default pipe max packet size");
                self.device_request(id, SetupPacket::get_device_descriptor(DEVICE_DESCRIPTOR_LEN));
            }
            DeviceState::DescDevice => {
                device.descriptor = Some(DeviceDescriptor::parse(data)?);
                self.fetch_next_string(id);
            }
            DeviceState::FetchManuString => {
                device.manufacturer = Some(decode_string(data)?);
                self.fetch_next_string(id);
            }
            DeviceState::FetchProdString => {
                device.product = Some(decode_string(data)?);
                self.fetch_next_string(id);
            }
            DeviceState::FetchConfigurations => {
                let header = ConfigurationDescriptor::parse(data)?;
                let total = header.total_length;
                if total as usize > data.len() && request.length < total {
                    debug!(device = id.0, total, "Fetching full configuration");
                    let index = device.config_index;
                    self.device_request(id, SetupPacket::get_configuration_descriptor(index, total));
                    return Ok(());
                }
                let end = (total as usize).min(data.len());
                device.configurations.push(Configuration::parse(&data[..end])?);
                device.config_index += 1;

                let count = device.descriptor.as_ref().map_or(0, |d| d.num_configurations);
                if device.config_index < count {
                    let index = device.config_index;
                    self.device_request(
                        id,
                        SetupPacket::get_configuration_descriptor(index, probe_len),
                    );
                } else {
                    self.register_device(id);
                }
            }
            DeviceState::Configuring => {
                device.active_configuration = device.pending_configuration.take();
                device.endpoints.truncate(1);
                let interfaces: Vec<u8> = device
                    .active_configuration()
                    .map(|c| c.interfaces.iter().map(|i| i.number).collect())
                    .unwrap_or_default();
                for interface in interfaces {
                    device.instantiate_alternate(interface, 0);
                }
                for claim in device.claims.iter_mut() {
                    claim.applied = claim.alternate == 0;
                }
                device.state = DeviceState::Configured;
                info!(
                    device = id.0,
                    configuration = ?device.active_configuration,
                    "Device configured"
                );
                self.on_configured(id);
            }
            DeviceState::ConfiguringInterfaces => {
                if let Some(interface) = device.interface_in_progress.take() {
                    let alternate = device
                        .claims
                        .iter()
                        .find(|c| c.interface == interface)
                        .map_or(0, |c| c.alternate);
                    device.instantiate_alternate(interface, alternate);
                    if let Some(claim) = device.claims.iter_mut().find(|c| c.interface == interface) {
                        claim.applied = true;
                    }
                    debug!(device = id.0, interface, alternate, "Alternate setting selected");
                }
                device.state = DeviceState::Configured;
                self.on_configured(id);
            }
            state => {
                warn!(device = id.0, state = state.as_str(), "Unexpected completion");
            }
        }
        Ok(())
    }

    /// Ask for the next string the device advertises, or move on to the
    /// configurations
    fn fetch_next_string(&mut self, id: DeviceId) {
        let language = self.config.string_language;
        let Some(device) = self.devices.get_mut(&id) else {
            return;
        };
        let (manufacturer, product) = device
            .descriptor
            .as_ref()
            .map_or((0, 0), |d| (d.manufacturer_index, d.product_index));

        let next = match device.state {
            DeviceState::DescDevice if manufacturer != 0 => {
                Some((DeviceState::FetchManuString, manufacturer))
            }
            DeviceState::DescDevice | DeviceState::FetchManuString if product != 0 => {
                Some((DeviceState::FetchProdString, product))
            }
            _ => None,
        };
        match next {
            Some((state, index)) => {
                device.state = state;
                self.device_request(id, SetupPacket::get_string_descriptor(index, language, 255));
            }
            None => self.fetch_configurations(id),
        }
    }

    fn fetch_configurations(&mut self, id: DeviceId) {
        let probe_len = self.config.config_probe_len;
        let Some(device) = self.devices.get_mut(&id) else {
            return;
        };
        let count = device.descriptor.as_ref().map_or(0, |d| d.num_configurations);
        if count == 0 {
            self.register_device(id);
            return;
        }
        device.state = DeviceState::FetchConfigurations;
        device.config_index = 0;
        self.device_request(id, SetupPacket::get_configuration_descriptor(0, probe_len));
    }

    /// Enumeration is done: make the device visible and offer it around
    fn register_device(&mut self, id: DeviceId) {
        let Some(device) = self.devices.get_mut(&id) else {
            return;
        };
        device.state = DeviceState::Unconfigured;
        device.request = None;
        self.registered.push(id);
        self.stats.record_enumeration();

        let device = &self.devices[&id];
        if let Some(desc) = device.descriptor() {
            info!(
                device = id.0,
                address = device.address,
                "Enumerated {:04x}:{:04x} {} {}",
                desc.vendor_id,
                desc.product_id,
                device.manufacturer().unwrap_or(""),
                device.product().unwrap_or("")
            );
        }
        self.probe_drivers(id);
    }

    fn probe_drivers(&mut self, id: DeviceId) {
        if self.devices.get(&id).is_some_and(|d| d.is_hub()) {
            self.attach_hub(id);
            return;
        }
        let mut drivers = std::mem::take(&mut self.drivers);
        for driver in drivers.iter_mut() {
            match self.devices.get(&id) {
                Some(device) if !device.is_claimed() => {}
                _ => break,
            }
            debug!(device = id.0, driver = driver.name(), "Probing");
            driver.probe(self, id);
        }
        // Keep drivers registered from inside a probe
        drivers.append(&mut self.drivers);
        self.drivers = drivers;
    }

    /// Send SET_CONFIGURATION; endpoints of the new configuration exist once
    /// the device reaches Configured
    pub fn select_configuration(&mut self, id: DeviceId, value: u8) -> Result<()> {
        let device = self.devices.get_mut(&id).ok_or(HostError::NoSuchDevice(id))?;
        match device.state {
            DeviceState::Unconfigured | DeviceState::Configured => {}
            state => return Err(HostError::InvalidState(state.as_str())),
        }
        if device.configuration(value).is_none() {
            return Err(HostError::NoSuchConfiguration { device: id, value });
        }
        device.pending_configuration = Some(value);
        device.state = DeviceState::Configuring;
        for claim in device.claims.iter_mut() {
            claim.applied = false;
            claim.notified = false;
        }
        device.device_claim_notified = false;

        // URBs on endpoints of the old configuration go away with them
        let stale: Vec<UrbId> = self
            .urbs
            .iter()
            .filter(|(_, urb)| urb.endpoint.device == id && urb.endpoint.address != 0)
            .map(|(urb_id, _)| *urb_id)
            .collect();
        for urb in stale {
            self.cancel_urb(urb);
        }

        debug!(device = id.0, value, "Selecting configuration");
        self.device_request(id, SetupPacket::set_configuration(value));
        Ok(())
    }

    /// Claim one interface in the given alternate setting for a driver.
    /// A non-default alternate setting is selected with SET_INTERFACE once
    /// the device is configured; `interface_claimed` follows.
    pub fn claim_interface(
        &mut self,
        id: DeviceId,
        interface: u8,
        alternate: u8,
        driver: DriverDeviceRef,
    ) -> Result<()> {
        let device = self.devices.get_mut(&id).ok_or(HostError::NoSuchDevice(id))?;
        if !device.state.is_enumerated() {
            return Err(HostError::InvalidState(device.state.as_str()));
        }
        let exists = device
            .target_configuration()
            .and_then(|c| c.interface(interface))
            .and_then(|i| i.alternate(alternate))
            .is_some();
        if !exists {
            return Err(HostError::NoSuchInterface {
                device: id,
                interface,
                alternate,
            });
        }
        if device.is_interface_claimed(interface) {
            return Err(HostError::AlreadyClaimed {
                device: id,
                interface,
            });
        }
        let configured = matches!(
            device.state,
            DeviceState::Configured | DeviceState::ConfiguringInterfaces
        );
        device.claims.push(InterfaceClaim {
            interface,
            alternate,
            driver,
            applied: configured && alternate == 0,
            notified: false,
        });
        debug!(device = id.0, interface, alternate, "Interface claimed");
        if device.state == DeviceState::Configured {
            self.on_configured(id);
        }
        Ok(())
    }

    /// Claim the whole device; `device_claimed` fires once it is configured
    pub fn claim_device(&mut self, id: DeviceId, driver: DriverDeviceRef) -> Result<()> {
        let device = self.devices.get_mut(&id).ok_or(HostError::NoSuchDevice(id))?;
        if device.device_claim.is_some() {
            return Err(HostError::DeviceClaimed(id));
        }
        device.device_claim = Some(driver);
        device.device_claim_notified = false;
        if device.state == DeviceState::Configured {
            self.on_configured(id);
        }
        Ok(())
    }

    /// Work to do each time a device settles in Configured: notify claims,
    /// then run the next pending SET_INTERFACE
    fn on_configured(&mut self, id: DeviceId) {
        // Interfaces whose alternate setting is in place
        while let Some((driver, interface)) = self.devices.get_mut(&id).and_then(|device| {
            let claim = device.claims.iter_mut().find(|c| c.applied && !c.notified)?;
            claim.notified = true;
            Some((Rc::clone(&claim.driver), claim.interface))
        }) {
            self.notify_driver(driver, id, DriverNotice::InterfaceClaimed(interface));
        }

        let Some(device) = self.devices.get_mut(&id) else {
            return;
        };
        if device.state != DeviceState::Configured {
            return;
        }
        if let Some((interface, alternate)) = device
            .claims
            .iter()
            .find(|c| !c.applied)
            .map(|c| (c.interface, c.alternate))
        {
            device.state = DeviceState::ConfiguringInterfaces;
            device.interface_in_progress = Some(interface);
            self.device_request(id, SetupPacket::set_interface(interface, alternate));
            return;
        }

        if !device.device_claim_notified {
            if let Some(driver) = device.device_claim.clone() {
                device.device_claim_notified = true;
                self.notify_driver(driver, id, DriverNotice::DeviceClaimed);
            }
        }

        if self.devices.get(&id).is_some_and(|d| d.hub.is_some()) {
            self.hub_configured(id);
        }
    }

    /// Tear down a device and everything below it
    pub(crate) fn destroy_device(&mut self, id: DeviceId) {
        let children: Vec<DeviceId> = match self.devices.get(&id) {
            Some(device) => device.hub.as_ref().map(Hub::children).unwrap_or_default(),
            None => return,
        };
        for child in children {
            self.destroy_device(child);
        }
        self.hub_teardown(id);

        let urbs: Vec<UrbId> = self
            .urbs
            .iter()
            .filter(|(_, urb)| urb.endpoint.device == id)
            .map(|(urb_id, _)| *urb_id)
            .collect();
        for urb in urbs {
            self.cancel_urb(urb);
        }
        self.cancel_completing_for(id);

        let Some(device) = self.devices.remove(&id) else {
            return;
        };
        self.addresses.release(device.requested_address);
        self.registered.retain(|d| *d != id);
        let next = {
            let _cs = CriticalSection::enter(&self.irq);
            self.activation.cancel(ActivationRequester::Device(id))
        };
        info!(device = id.0, address = device.address, "Device detached");

        let mut drivers: Vec<DriverDeviceRef> = Vec::new();
        for driver in device
            .device_claim
            .iter()
            .chain(device.claims.iter().map(|c| &c.driver))
        {
            if !drivers
                .iter()
                .any(|d| std::ptr::addr_eq(Rc::as_ptr(d), Rc::as_ptr(driver)))
            {
                drivers.push(Rc::clone(driver));
            }
        }
        for driver in drivers {
            self.notify_driver(driver, id, DriverNotice::Disconnected);
        }

        if let Some(next) = next {
            self.wake_activation(next);
        }
    }

    /// Run a driver callback, or hold it back until the driver is no longer
    /// inside another call
    fn notify_driver(&mut self, driver: DriverDeviceRef, device: DeviceId, notice: DriverNotice) {
        let delivered = match driver.try_borrow_mut() {
            Ok(mut guard) => {
                notice.deliver(&mut *guard, self, device);
                true
            }
            Err(_) => false,
        };
        if !delivered {
            debug!(device = device.0, ?notice, "Driver busy, deferring callback");
            self.deferred_notices.push((driver, device, notice));
        }
    }

    /// Retry callbacks held back by [`notify_driver`](Self::notify_driver)
    pub(crate) fn deliver_deferred_notices(&mut self) {
        if self.deferred_notices.is_empty() {
            return;
        }
        for (driver, device, notice) in std::mem::take(&mut self.deferred_notices) {
            self.notify_driver(driver, device, notice);
        }
    }

    pub fn device(&self, id: DeviceId) -> Option<&Device> {
        self.devices.get(&id)
    }

    /// Devices that finished enumeration, in registration order
    pub fn registered_devices(&self) -> impl Iterator<Item = &Device> {
        self.registered.iter().filter_map(|id| self.devices.get(id))
    }

    pub fn devices(&self) -> impl Iterator<Item = &Device> {
        self.devices.values()
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::DriverDevice;
    use crate::host::tests::host_with_channels;
    use std::cell::RefCell;

    #[derive(Default)]
    struct Recorder {
        disconnected: Vec<DeviceId>,
    }

    impl DriverDevice for Recorder {
        fn disconnected(&mut self, _host: &mut UsbHost, device: DeviceId) {
            self.disconnected.push(device);
        }
    }

    #[test]
    fn test_new_device_starts_at_address_zero() {
        let device = Device::new(DeviceId(1), DeviceSpeed::Low, Attachment::RootPort);
        assert_eq!(device.state(), DeviceState::None);
        assert_eq!(device.address(), 0);
        assert_eq!(device.get_endpoint(0).map(|e| e.max_packet_size()), Some(8));
        assert!(!device.is_hub());
    }

    #[test]
    fn test_instantiate_alternate_swaps_endpoints() {
        let mut device = Device::new(DeviceId(1), DeviceSpeed::Full, Attachment::RootPort);
        device.configurations = vec![common::test_utils::create_alternate_setting_configuration(1)];
        device.active_configuration = Some(1);

        device.instantiate_alternate(0, 0);
        assert_eq!(device.endpoints().len(), 1);

        device.instantiate_alternate(0, 1);
        assert!(device.get_endpoint(0x82).is_some());
        assert!(device.get_endpoint(0x02).is_some());

        device.instantiate_alternate(0, 0);
        assert!(device.get_endpoint(0x82).is_none());
    }

    #[test]
    fn test_state_names() {
        assert_eq!(DeviceState::DescDevice8.as_str(), "DescDevice8");
        assert!(DeviceState::Configured.is_enumerated());
        assert!(!DeviceState::FetchConfigurations.is_enumerated());
    }

    #[test]
    fn test_disconnect_reaches_busy_driver_later() {
        let mut host = host_with_channels(2);
        let id = host.create_device(DeviceSpeed::Full, Attachment::RootPort);
        let recorder = Rc::new(RefCell::new(Recorder::default()));
        let driver: DriverDeviceRef = recorder.clone();
        host.claim_device(id, driver).unwrap();

        {
            let _inside_callback = recorder.borrow_mut();
            host.destroy_device(id);
        }
        assert!(host.device(id).is_none());
        assert!(recorder.borrow().disconnected.is_empty());
        assert_eq!(host.deferred_notices.len(), 1);

        host.handle_timer(crate::hal::TimerEvent::RootDebounce);
        assert_eq!(recorder.borrow().disconnected, vec![id]);
        assert!(host.deferred_notices.is_empty());
    }

    #[test]
    fn test_idle_driver_is_told_at_once() {
        let mut host = host_with_channels(2);
        let id = host.create_device(DeviceSpeed::Full, Attachment::RootPort);
        let recorder = Rc::new(RefCell::new(Recorder::default()));
        host.claim_device(id, recorder.clone()).unwrap();

        host.destroy_device(id);
        assert_eq!(recorder.borrow().disconnected, vec![id]);
        assert!(host.deferred_notices.is_empty());
    }
}
