//! Simulated USB devices
//!
//! Devices see the bus one transaction at a time, the way a real function
//! does: a SETUP packet, then IN or OUT tokens on an endpoint. The control
//! pipe answers the standard requests enumeration needs. [`SimHub`] adds
//! the hub class requests and a status change endpoint on top.

use common::test_utils::{
    create_hub_configuration, create_hub_device_descriptor, create_keyboard_configuration,
    create_mock_device_descriptor,
};
use protocol::hub::{
    PORT_ENABLE, PORT_POWER, PORT_RESET, PortChange, PortStatus, encode_status_words,
};
use protocol::messages::{
    REQ_CLEAR_FEATURE, REQ_GET_DESCRIPTOR, REQ_GET_STATUS, REQ_SET_ADDRESS,
    REQ_SET_CONFIGURATION, REQ_SET_FEATURE, REQ_SET_INTERFACE, RT_DEVICE_IN, RT_DEVICE_OUT,
    RT_HUB_IN, RT_HUB_OUT, RT_INTERFACE_OUT, RT_PORT_IN, RT_PORT_OUT,
};
use protocol::types::{DESC_CONFIGURATION, DESC_DEVICE, DESC_HUB, DESC_STRING, LANG_EN_US};
use protocol::{
    Configuration, DataPid, DeviceDescriptor, DeviceSpeed, HubDescriptor, SetupPacket,
    encode_string,
};
use std::collections::{HashMap, VecDeque};
use tracing::trace;

/// Device answer to a SETUP or OUT packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handshake {
    Ack,
    Nak,
    Stall,
}

/// Device answer to an IN token
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InResponse {
    Data(Vec<u8>),
    Nak,
    Stall,
}

pub trait SimDevice {
    fn speed(&self) -> DeviceSpeed;

    /// Address the device currently answers to
    fn address(&self) -> u8;

    /// Bus reset: back to address 0, unconfigured
    fn reset(&mut self);

    fn setup(&mut self, packet: &[u8]) -> Handshake;

    fn data_out(&mut self, endpoint: u8, pid: DataPid, data: &[u8]) -> Handshake;

    fn data_in(&mut self, endpoint: u8, max_len: usize) -> InResponse;

    fn as_function(&self) -> &FunctionDevice;

    fn as_function_mut(&mut self) -> &mut FunctionDevice;

    fn as_hub(&self) -> Option<&SimHub> {
        None
    }

    fn as_hub_mut(&mut self) -> Option<&mut SimHub> {
        None
    }
}

#[derive(Debug, Default)]
struct ControlPipe {
    setup: Option<SetupPacket>,
    response: Vec<u8>,
    sent: usize,
    stalled: bool,
}

/// A plain function device with fixed descriptors
#[derive(Debug)]
pub struct FunctionDevice {
    speed: DeviceSpeed,
    address: u8,
    pending_address: Option<u8>,
    descriptor: DeviceDescriptor,
    configurations: Vec<Configuration>,
    strings: Vec<String>,
    configuration: u8,
    alternates: HashMap<u8, u8>,
    control: ControlPipe,
    in_queues: HashMap<u8, VecDeque<Vec<u8>>>,
    received: HashMap<u8, Vec<Vec<u8>>>,
    out_toggles: HashMap<u8, DataPid>,
    min_descriptor_probe: u16,
    requests: Vec<SetupPacket>,
    toggle_mismatches: u32,
}

impl FunctionDevice {
    pub fn new(
        speed: DeviceSpeed,
        descriptor: DeviceDescriptor,
        configurations: Vec<Configuration>,
    ) -> Self {
        let descriptor = DeviceDescriptor {
            num_configurations: configurations.len() as u8,
            ..descriptor
        };
        Self {
            speed,
            address: 0,
            pending_address: None,
            descriptor,
            configurations,
            strings: Vec::new(),
            configuration: 0,
            alternates: HashMap::new(),
            control: ControlPipe::default(),
            in_queues: HashMap::new(),
            received: HashMap::new(),
            out_toggles: HashMap::new(),
            min_descriptor_probe: 0,
            requests: Vec::new(),
            toggle_mismatches: 0,
        }
    }

    /// Low-speed boot keyboard with an 8-byte interrupt IN endpoint
    pub fn keyboard(speed: DeviceSpeed) -> Self {
        let descriptor = DeviceDescriptor {
            max_packet_size0: 8,
            ..create_mock_device_descriptor(0x046d, 0xc31c)
        };
        Self::new(speed, descriptor, vec![create_keyboard_configuration(1)])
    }

    /// Attach manufacturer and product strings
    pub fn with_strings(mut self, manufacturer: &str, product: &str) -> Self {
        self.strings = vec![manufacturer.to_string(), product.to_string()];
        self.descriptor.manufacturer_index = 1;
        self.descriptor.product_index = 2;
        self
    }

    /// STALL configuration descriptor requests shorter than `length`
    pub fn with_min_descriptor_probe(mut self, length: u16) -> Self {
        self.min_descriptor_probe = length;
        self
    }

    /// Queue a packet for an IN endpoint
    pub fn push_in(&mut self, endpoint: u8, data: Vec<u8>) {
        self.in_queues.entry(endpoint).or_default().push_back(data);
    }

    /// Packets received on an OUT endpoint
    pub fn received(&self, endpoint: u8) -> &[Vec<u8>] {
        self.received.get(&endpoint).map_or(&[], Vec::as_slice)
    }

    pub fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    pub fn configuration(&self) -> u8 {
        self.configuration
    }

    pub fn alternate(&self, interface: u8) -> u8 {
        self.alternates.get(&interface).copied().unwrap_or(0)
    }

    /// Every SETUP packet this device accepted, oldest first
    pub fn requests(&self) -> &[SetupPacket] {
        &self.requests
    }

    pub fn toggle_mismatches(&self) -> u32 {
        self.toggle_mismatches
    }

    fn standard_request(&mut self, setup: &SetupPacket) -> Option<Vec<u8>> {
        match (setup.request_type, setup.request) {
            (RT_DEVICE_IN, REQ_GET_DESCRIPTOR) => {
                let index = setup.descriptor_index() as usize;
                match setup.descriptor_type() {
                    DESC_DEVICE if setup.length < self.min_descriptor_probe => None,
                    DESC_DEVICE => Some(self.descriptor.to_bytes()),
                    DESC_CONFIGURATION => self.configurations.get(index).map(|c| c.to_bytes()),
                    DESC_STRING if index == 0 => {
                        let [lo, hi] = LANG_EN_US.to_le_bytes();
                        Some(vec![4, DESC_STRING, lo, hi])
                    }
                    DESC_STRING => self.strings.get(index - 1).map(|s| encode_string(s)),
                    _ => None,
                }
            }
            (RT_DEVICE_IN, REQ_GET_STATUS) => Some(vec![0, 0]),
            (RT_DEVICE_OUT, REQ_SET_ADDRESS) => {
                self.pending_address = Some(setup.value as u8);
                Some(Vec::new())
            }
            (RT_DEVICE_OUT, REQ_SET_CONFIGURATION) => {
                let value = setup.value as u8;
                let known = value == 0 || self.configurations.iter().any(|c| c.value() == value);
                known.then(|| {
                    self.configuration = value;
                    self.alternates.clear();
                    self.out_toggles.clear();
                    Vec::new()
                })
            }
            (RT_INTERFACE_OUT, REQ_SET_INTERFACE) => {
                self.alternates
                    .insert(setup.index as u8, setup.value as u8);
                Some(Vec::new())
            }
            _ => None,
        }
    }

    /// Latch a SETUP packet with the answer the data stage will carry
    fn accept_setup(&mut self, setup: SetupPacket, response: Option<Vec<u8>>) {
        trace!(address = self.address, ?setup, stalled = response.is_none(), "SETUP");
        self.requests.push(setup);
        self.control = ControlPipe {
            setup: Some(setup),
            stalled: response.is_none(),
            response: response
                .map(|mut r| {
                    r.truncate(setup.length as usize);
                    r
                })
                .unwrap_or_default(),
            sent: 0,
        };
    }

    fn control_in(&mut self, max_len: usize) -> InResponse {
        let Some(setup) = self.control.setup else {
            return InResponse::Stall;
        };
        if self.control.stalled {
            return InResponse::Stall;
        }
        if setup.direction().is_in() {
            let start = self.control.sent.min(self.control.response.len());
            let end = (start + max_len).min(self.control.response.len());
            self.control.sent = end;
            return InResponse::Data(self.control.response[start..end].to_vec());
        }
        // Status stage of an OUT request
        if let Some(address) = self.pending_address.take() {
            self.address = address;
        }
        self.control.setup = None;
        InResponse::Data(Vec::new())
    }

    fn control_out(&mut self) -> Handshake {
        match self.control.setup {
            None => Handshake::Stall,
            Some(_) if self.control.stalled => Handshake::Stall,
            Some(setup) => {
                if setup.direction().is_in() {
                    self.control.setup = None;
                }
                Handshake::Ack
            }
        }
    }
}

impl SimDevice for FunctionDevice {
    fn speed(&self) -> DeviceSpeed {
        self.speed
    }

    fn address(&self) -> u8 {
        self.address
    }

    fn reset(&mut self) {
        self.address = 0;
        self.pending_address = None;
        self.configuration = 0;
        self.alternates.clear();
        self.out_toggles.clear();
        self.control = ControlPipe::default();
    }

    fn setup(&mut self, packet: &[u8]) -> Handshake {
        let Ok(setup) = SetupPacket::from_bytes(packet) else {
            return Handshake::Stall;
        };
        let response = self.standard_request(&setup);
        self.accept_setup(setup, response);
        Handshake::Ack
    }

    fn data_out(&mut self, endpoint: u8, pid: DataPid, data: &[u8]) -> Handshake {
        if endpoint & 0x0f == 0 {
            return self.control_out();
        }
        let expected = self.out_toggles.entry(endpoint).or_insert(DataPid::Data0);
        if pid != *expected {
            // Retransmission of a packet we already have
            self.toggle_mismatches += 1;
            return Handshake::Ack;
        }
        *expected = expected.toggled();
        self.received
            .entry(endpoint)
            .or_default()
            .push(data.to_vec());
        Handshake::Ack
    }

    fn data_in(&mut self, endpoint: u8, max_len: usize) -> InResponse {
        if endpoint & 0x0f == 0 {
            return self.control_in(max_len);
        }
        match self
            .in_queues
            .get_mut(&(endpoint | 0x80))
            .and_then(VecDeque::pop_front)
        {
            Some(data) => InResponse::Data(data),
            None => InResponse::Nak,
        }
    }

    fn as_function(&self) -> &FunctionDevice {
        self
    }

    fn as_function_mut(&mut self) -> &mut FunctionDevice {
        self
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct SimHubPort {
    status: u16,
    change: u16,
    attached: Option<DeviceSpeed>,
}

/// A full-speed hub; children live in the bus and are reached through the
/// port's enable bit
#[derive(Debug)]
pub struct SimHub {
    function: FunctionDevice,
    ports: Vec<SimHubPort>,
    hub_change: u16,
    pending_resets: Vec<u8>,
}

impl SimHub {
    pub fn new(ports: u8) -> Self {
        Self {
            function: FunctionDevice::new(
                DeviceSpeed::Full,
                create_hub_device_descriptor(),
                vec![create_hub_configuration()],
            ),
            ports: vec![SimHubPort::default(); ports as usize],
            hub_change: 0,
            pending_resets: Vec::new(),
        }
    }

    pub fn num_ports(&self) -> u8 {
        self.ports.len() as u8
    }

    fn port(&self, number: u8) -> Option<&SimHubPort> {
        self.ports.get((number as usize).checked_sub(1)?)
    }

    fn port_mut(&mut self, number: u8) -> Option<&mut SimHubPort> {
        self.ports.get_mut((number as usize).checked_sub(1)?)
    }

    /// (wPortStatus, wPortChange) of a port
    pub fn port_status(&self, number: u8) -> Option<(PortStatus, PortChange)> {
        self.port(number)
            .map(|p| (PortStatus(p.status), PortChange(p.change)))
    }

    pub fn port_enabled(&self, number: u8) -> bool {
        self.port(number).is_some_and(|p| {
            let status = PortStatus(p.status);
            status.powered() && status.enabled()
        })
    }

    pub(crate) fn attach(&mut self, number: u8, speed: DeviceSpeed) {
        if let Some(port) = self.port_mut(number) {
            port.attached = Some(speed);
            if port.status & PortStatus::POWER != 0 {
                port.connect(speed);
            }
        }
    }

    pub(crate) fn detach(&mut self, number: u8) {
        if let Some(port) = self.port_mut(number) {
            port.attached = None;
            if port.status & PortStatus::CONNECTION != 0 {
                port.status &= !(PortStatus::CONNECTION | PortStatus::ENABLE | PortStatus::LOW_SPEED);
                port.change |= PortChange::CONNECTION;
            }
        }
    }

    /// Signal over-current on a port; it loses power and its device
    pub fn over_current(&mut self, number: u8) {
        if let Some(port) = self.port_mut(number) {
            port.status = PortStatus::OVER_CURRENT;
            port.change |= PortChange::OVER_CURRENT;
        }
    }

    /// Ports whose reset finished since the last call
    pub(crate) fn take_resets(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.pending_resets)
    }

    fn descriptor(&self) -> HubDescriptor {
        HubDescriptor {
            num_ports: self.num_ports(),
            characteristics: 0,
            power_on_to_good: 50,
            control_current: 100,
            removable: vec![0; (self.ports.len() + 1).div_ceil(8)],
        }
    }

    /// Answer a hub class request; `None` when it is not one
    fn class_request(&mut self, setup: &SetupPacket) -> Option<Option<Vec<u8>>> {
        let number = setup.index as u8;
        let feature = setup.value;
        let response = match (setup.request_type, setup.request) {
            (RT_HUB_IN, REQ_GET_DESCRIPTOR) if setup.descriptor_type() == DESC_HUB => {
                Some(self.descriptor().to_bytes())
            }
            (RT_HUB_IN, REQ_GET_STATUS) => Some(encode_status_words(0, self.hub_change)),
            (RT_HUB_OUT, REQ_CLEAR_FEATURE) => {
                self.hub_change &= !(1 << feature);
                Some(Vec::new())
            }
            (RT_PORT_IN, REQ_GET_STATUS) => self
                .port(number)
                .map(|p| encode_status_words(p.status, p.change)),
            (RT_PORT_OUT, REQ_SET_FEATURE) => {
                let Some(port) = self.port_mut(number) else {
                    return Some(None);
                };
                let mut reset = false;
                match feature {
                    PORT_POWER => {
                        port.status |= PortStatus::POWER;
                        port.status &= !PortStatus::OVER_CURRENT;
                        if let Some(speed) = port.attached {
                            port.connect(speed);
                        }
                    }
                    PORT_RESET if port.status & PortStatus::CONNECTION != 0 => {
                        port.status |= PortStatus::ENABLE;
                        port.change |= PortChange::RESET;
                        reset = true;
                    }
                    _ => {}
                }
                if reset {
                    self.pending_resets.push(number);
                }
                Some(Vec::new())
            }
            (RT_PORT_OUT, REQ_CLEAR_FEATURE) => {
                let Some(port) = self.port_mut(number) else {
                    return Some(None);
                };
                match feature {
                    16..=u16::MAX => port.change &= !(1 << (feature - 16)),
                    PORT_ENABLE => port.status &= !PortStatus::ENABLE,
                    PORT_POWER => port.status = 0,
                    _ => {}
                }
                Some(Vec::new())
            }
            _ => return None,
        };
        Some(response)
    }

    fn status_bitmap(&self) -> Option<Vec<u8>> {
        let mut bitmap = vec![0u8; (self.ports.len() + 1).div_ceil(8)];
        if self.hub_change != 0 {
            bitmap[0] |= 1;
        }
        for (i, port) in self.ports.iter().enumerate() {
            if port.change != 0 {
                let bit = i + 1;
                bitmap[bit / 8] |= 1 << (bit % 8);
            }
        }
        bitmap.iter().any(|b| *b != 0).then_some(bitmap)
    }
}

impl SimHubPort {
    fn connect(&mut self, speed: DeviceSpeed) {
        self.status |= PortStatus::CONNECTION;
        if speed == DeviceSpeed::Low {
            self.status |= PortStatus::LOW_SPEED;
        }
        self.change |= PortChange::CONNECTION;
    }
}

impl SimDevice for SimHub {
    fn speed(&self) -> DeviceSpeed {
        DeviceSpeed::Full
    }

    fn address(&self) -> u8 {
        self.function.address
    }

    fn reset(&mut self) {
        self.function.reset();
        for port in &mut self.ports {
            let attached = port.attached;
            *port = SimHubPort {
                attached,
                ..SimHubPort::default()
            };
        }
        self.hub_change = 0;
        self.pending_resets.clear();
    }

    fn setup(&mut self, packet: &[u8]) -> Handshake {
        let Ok(setup) = SetupPacket::from_bytes(packet) else {
            return Handshake::Stall;
        };
        let response = match self.class_request(&setup) {
            Some(response) => response,
            None => self.function.standard_request(&setup),
        };
        self.function.accept_setup(setup, response);
        Handshake::Ack
    }

    fn data_out(&mut self, endpoint: u8, pid: DataPid, data: &[u8]) -> Handshake {
        self.function.data_out(endpoint, pid, data)
    }

    fn data_in(&mut self, endpoint: u8, max_len: usize) -> InResponse {
        if endpoint & 0x0f == 0 {
            return self.function.control_in(max_len);
        }
        match self.status_bitmap() {
            Some(mut bitmap) => {
                bitmap.truncate(max_len);
                InResponse::Data(bitmap)
            }
            None => InResponse::Nak,
        }
    }

    fn as_function(&self) -> &FunctionDevice {
        &self.function
    }

    fn as_function_mut(&mut self) -> &mut FunctionDevice {
        &mut self.function
    }

    fn as_hub(&self) -> Option<&SimHub> {
        Some(self)
    }

    fn as_hub_mut(&mut self) -> Option<&mut SimHub> {
        Some(self)
    }
}
