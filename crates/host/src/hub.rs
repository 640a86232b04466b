//! Built-in hub support
//!
//! A hub is an ordinary device whose class is HUB. Once configured it is
//! driven by one control request at a time; [`UsbHost::hub_check_status`]
//! picks the next request from the pending work in fixed priority:
//!
//! 1. hub status refresh
//! 2. port status refresh
//! 3. a debounced port reset, if the activation slot can be had
//! 4. port power-up
//! 5. acknowledging one change bit, hub-level bits before port bits
//!
//! The status change interrupt endpoint only flags ports as needing a
//! check. A connection change starts the debounce timer; the reset that
//! follows ends in PortInitFetchStatus, which creates the child device.

use crate::UsbHost;
use crate::activation::ActivationRequester;
use crate::device::{Attachment, DeviceId};
use crate::hal::{CriticalSection, TimerEvent, TimerHandle};
use crate::urb::{Completion, EndpointRef, Urb, UrbStatus};
use protocol::hub::{HUB_DESC_MAX_LEN, PORT_POWER, PORT_RESET, parse_status_words};
use protocol::{Direction, HubChange, HubDescriptor, PortChange, PortStatus, SetupPacket, TransferKind};
use tracing::{debug, info, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HubState {
    /// Waiting for the hub device to be configured
    Attached,
    FetchHubDescriptor,
    /// Idle; no request outstanding
    Configured,
    CheckingHubStatus,
    CheckingPortStatus(u8),
    PoweringPort(u8),
    /// Clearing one change bit; port 0 is the hub itself
    ChangeAck { port: u8, bit: u16 },
    PortInitReset(u8),
    PortInitResetAck(u8),
    PortInitFetchStatus(u8),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PortFlags {
    pub needs_check: bool,
    pub needs_reset: bool,
    pub powered: bool,
    pub activating: bool,
}

#[derive(Debug, Clone)]
pub struct HubPort {
    number: u8,
    flags: PortFlags,
    status: PortStatus,
    change: PortChange,
    child: Option<DeviceId>,
    debounce: Option<TimerHandle>,
}

impl HubPort {
    fn new(number: u8) -> Self {
        Self {
            number,
            flags: PortFlags::default(),
            status: PortStatus::default(),
            change: PortChange::default(),
            child: None,
            debounce: None,
        }
    }

    pub fn number(&self) -> u8 {
        self.number
    }

    pub fn flags(&self) -> PortFlags {
        self.flags
    }

    pub fn status(&self) -> PortStatus {
        self.status
    }

    pub fn change(&self) -> PortChange {
        self.change
    }

    pub fn child(&self) -> Option<DeviceId> {
        self.child
    }

    pub fn is_debouncing(&self) -> bool {
        self.debounce.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct Hub {
    state: HubState,
    descriptor: Option<HubDescriptor>,
    ports: Vec<HubPort>,
    needs_check: bool,
    change: HubChange,
    request: Option<SetupPacket>,
}

impl Hub {
    pub(crate) fn new() -> Self {
        Self {
            state: HubState::Attached,
            descriptor: None,
            ports: Vec::new(),
            needs_check: false,
            change: HubChange::default(),
            request: None,
        }
    }

    pub fn state(&self) -> HubState {
        self.state
    }

    pub fn descriptor(&self) -> Option<&HubDescriptor> {
        self.descriptor.as_ref()
    }

    pub fn ports(&self) -> &[HubPort] {
        &self.ports
    }

    pub fn port(&self, number: u8) -> Option<&HubPort> {
        self.ports.iter().find(|p| p.number == number)
    }

    fn port_mut(&mut self, number: u8) -> Option<&mut HubPort> {
        self.ports.iter_mut().find(|p| p.number == number)
    }

    pub fn children(&self) -> Vec<DeviceId> {
        self.ports.iter().filter_map(|p| p.child).collect()
    }

    /// Apply a status change bitmap from the interrupt endpoint
    fn mark_changes(&mut self, bitmap: &[u8]) {
        for (byte_index, byte) in bitmap.iter().enumerate() {
            for bit in 0..8 {
                if byte & (1 << bit) == 0 {
                    continue;
                }
                match byte_index * 8 + bit {
                    0 => self.needs_check = true,
                    n => {
                        if let Some(port) = self.port_mut(n as u8) {
                            port.flags.needs_check = true;
                        }
                    }
                }
            }
        }
    }
}

impl UsbHost {
    fn hub_mut(&mut self, id: DeviceId) -> Option<&mut Hub> {
        self.devices.get_mut(&id).and_then(|d| d.hub.as_mut())
    }

    /// Take over a freshly enumerated hub device
    pub(crate) fn attach_hub(&mut self, id: DeviceId) {
        let Some(device) = self.devices.get_mut(&id) else {
            return;
        };
        device.hub = Some(Hub::new());
        let Some(value) = device.configurations().first().map(|c| c.value()) else {
            warn!(device = id.0, "Hub without configurations");
            return;
        };
        info!(device = id.0, "Hub attached");
        if let Err(e) = self.select_configuration(id, value) {
            warn!(device = id.0, "Failed to configure hub: {}", e);
        }
    }

    /// The hub device reached Configured
    pub(crate) fn hub_configured(&mut self, id: DeviceId) {
        let Some(hub) = self.hub_mut(id) else {
            return;
        };
        if hub.state != HubState::Attached {
            return;
        }
        hub.state = HubState::FetchHubDescriptor;
        self.hub_request(id, SetupPacket::get_hub_descriptor(HUB_DESC_MAX_LEN));
    }

    fn hub_request(&mut self, id: DeviceId, setup: SetupPacket) {
        let Some(hub) = self.hub_mut(id) else {
            return;
        };
        hub.request = Some(setup);
        trace!(hub = id.0, state = ?hub.state, "Hub request");
        let urb = Urb::control(id, setup, Vec::new(), Completion::Hub(id));
        if let Err(e) = self.submit_urb(urb) {
            warn!(hub = id.0, "Failed to submit hub request: {}", e);
        }
    }

    /// Submit the status change interrupt transfer
    fn start_hub_status(&mut self, id: DeviceId) {
        let Some(device) = self.devices.get(&id) else {
            return;
        };
        let Some(address) = device
            .endpoints()
            .iter()
            .find(|ep| ep.kind() == TransferKind::Interrupt && ep.direction() == Direction::In)
            .map(|ep| ep.address())
        else {
            warn!(hub = id.0, "Hub has no status change endpoint");
            return;
        };
        let ports = device.hub().map_or(0, |h| h.ports.len());
        let urb = Urb::transfer_in(
            EndpointRef { device: id, address },
            (ports + 1).div_ceil(8),
            Completion::HubStatus(id),
        );
        if let Err(e) = self.submit_urb(urb) {
            warn!(hub = id.0, "Failed to start status change polling: {}", e);
        }
    }

    /// Completion of the status change interrupt transfer
    pub(crate) fn hub_status_change(&mut self, id: DeviceId, status: UrbStatus, data: &[u8]) {
        if !status.is_ok() {
            warn!(hub = id.0, %status, "Status change transfer failed");
            return;
        }
        let Some(hub) = self.hub_mut(id) else {
            return;
        };
        trace!(hub = id.0, ?data, "Status change");
        hub.mark_changes(data);
        self.hub_check_status(id);
    }

    /// Completion of a hub control request
    pub(crate) fn hub_transfer_complete(&mut self, id: DeviceId, status: UrbStatus, data: &[u8]) {
        let Some(hub) = self.hub_mut(id) else {
            return;
        };
        let Some(request) = hub.request.take() else {
            return;
        };
        if !status.is_ok() {
            warn!(hub = id.0, state = ?hub.state, %status, "Hub request failed, resubmitting");
            self.hub_request(id, request);
            return;
        }

        match hub.state {
            HubState::FetchHubDescriptor => {
                let descriptor = match HubDescriptor::parse(data) {
                    Ok(descriptor) => descriptor,
                    Err(e) => {
                        warn!(hub = id.0, "Bad hub descriptor ({}), resubmitting", e);
                        self.hub_request(id, request);
                        return;
                    }
                };
                hub.ports = (1..=descriptor.num_ports).map(HubPort::new).collect();
                info!(hub = id.0, ports = descriptor.num_ports, "Hub ready");
                hub.descriptor = Some(descriptor);
                hub.state = HubState::Configured;
                self.start_hub_status(id);
            }
            HubState::CheckingHubStatus => {
                let Ok((_, change)) = parse_status_words(data) else {
                    self.hub_request(id, request);
                    return;
                };
                hub.change = HubChange(change);
                hub.needs_check = false;
                hub.state = HubState::Configured;
            }
            HubState::CheckingPortStatus(number) => {
                let Ok((port_status, port_change)) = parse_status_words(data) else {
                    self.hub_request(id, request);
                    return;
                };
                hub.state = HubState::Configured;
                if let Some(port) = hub.port_mut(number) {
                    port.status = PortStatus(port_status);
                    port.change = PortChange(port_change);
                    port.flags.needs_check = false;
                    debug!(hub = id.0, port = number, status = port_status, change = port_change, "Port status");
                }
            }
            HubState::PoweringPort(number) => {
                hub.state = HubState::Configured;
                if let Some(port) = hub.port_mut(number) {
                    port.flags.powered = true;
                    port.flags.needs_check = true;
                    debug!(hub = id.0, port = number, "Port powered");
                }
            }
            HubState::ChangeAck { port: 0, bit } => {
                hub.change.0 &= !bit;
                hub.state = HubState::Configured;
                if bit == HubChange::OVER_CURRENT {
                    warn!(hub = id.0, "Hub over-current change");
                }
            }
            HubState::ChangeAck { port, bit } => {
                hub.state = HubState::Configured;
                if let Some(p) = hub.port_mut(port) {
                    p.change.clear(bit);
                }
                self.port_change_acked(id, port, bit);
            }
            HubState::PortInitReset(_) => {
                // Reset-complete arrives as C_PORT_RESET
                hub.state = HubState::Configured;
            }
            HubState::PortInitResetAck(number) => {
                if let Some(port) = hub.port_mut(number) {
                    port.change.clear(PortChange::RESET);
                }
                hub.state = HubState::PortInitFetchStatus(number);
                self.hub_request(id, SetupPacket::get_port_status(number));
                return;
            }
            HubState::PortInitFetchStatus(number) => {
                let Ok((port_status, port_change)) = parse_status_words(data) else {
                    self.hub_request(id, request);
                    return;
                };
                hub.state = HubState::Configured;
                if let Some(port) = hub.port_mut(number) {
                    port.status = PortStatus(port_status);
                    port.change.0 |= port_change & !PortChange::RESET;
                }
                self.port_reset_complete(id, number);
            }
            state @ (HubState::Attached | HubState::Configured) => {
                warn!(hub = id.0, ?state, "Unexpected hub completion");
            }
        }
        self.hub_check_status(id);
    }

    /// Issue the single most urgent pending hub request, if any
    pub(crate) fn hub_check_status(&mut self, id: DeviceId) {
        let setup = {
            let Some(hub) = self.devices.get_mut(&id).and_then(|d| d.hub.as_mut()) else {
                return;
            };
            if hub.state != HubState::Configured {
                return;
            }

            if hub.needs_check {
                hub.state = HubState::CheckingHubStatus;
                SetupPacket::get_hub_status()
            } else if let Some(number) = hub.ports.iter().find(|p| p.flags.needs_check).map(|p| p.number) {
                hub.state = HubState::CheckingPortStatus(number);
                SetupPacket::get_port_status(number)
            } else if let Some(number) = {
                let _cs = CriticalSection::enter(&self.irq);
                let activation = &mut self.activation;
                hub.ports
                    .iter()
                    .filter(|p| p.flags.needs_reset && p.status.connected())
                    .map(|p| p.number)
                    .find(|&port| activation.try_acquire(ActivationRequester::HubPort { hub: id, port }))
            } {
                if let Some(port) = hub.port_mut(number) {
                    port.flags.needs_reset = false;
                    port.flags.activating = true;
                }
                debug!(hub = id.0, port = number, "Resetting port");
                hub.state = HubState::PortInitReset(number);
                SetupPacket::set_port_feature(number, PORT_RESET)
            } else if let Some(number) = hub
                .ports
                .iter()
                .find(|p| !p.flags.powered && !p.status.over_current())
                .map(|p| p.number)
            {
                hub.state = HubState::PoweringPort(number);
                SetupPacket::set_port_feature(number, PORT_POWER)
            } else if let Some((bit, feature)) = hub.change.next_pending() {
                hub.state = HubState::ChangeAck { port: 0, bit };
                SetupPacket::clear_hub_feature(feature)
            } else if let Some((number, activating, bit, feature)) = hub.ports.iter().find_map(|p| {
                p.change
                    .next_pending()
                    .map(|(bit, feature)| (p.number, p.flags.activating, bit, feature))
            }) {
                hub.state = if bit == PortChange::RESET && activating {
                    HubState::PortInitResetAck(number)
                } else {
                    HubState::ChangeAck { port: number, bit }
                };
                SetupPacket::clear_port_feature(number, feature)
            } else {
                return;
            }
        };
        self.hub_request(id, setup);
    }

    /// React to a change bit that has just been cleared on the hub
    fn port_change_acked(&mut self, id: DeviceId, number: u8, bit: u16) {
        let debounce_ms = self.config.debounce_ms;
        let Some(port) = self.hub_mut(id).and_then(|h| h.port_mut(number)) else {
            return;
        };
        let status = port.status;
        match bit {
            PortChange::CONNECTION => {
                self.hub_port_detach(id, number);
                if status.connected() {
                    let handle = self.timer.oneshot(
                        debounce_ms,
                        TimerEvent::HubDebounce {
                            hub: id,
                            port: number,
                        },
                    );
                    if let Some(port) = self.hub_mut(id).and_then(|h| h.port_mut(number)) {
                        port.debounce = Some(handle);
                    }
                    debug!(hub = id.0, port = number, "Connection, debouncing");
                } else {
                    info!(hub = id.0, port = number, "Port disconnected");
                }
            }
            PortChange::ENABLE if !status.enabled() => {
                if port.child.is_some() {
                    warn!(hub = id.0, port = number, "Port disabled by hub");
                    self.hub_port_detach(id, number);
                }
            }
            PortChange::OVER_CURRENT if status.over_current() => {
                warn!(hub = id.0, port = number, "Port over-current");
                port.flags.powered = false;
                self.hub_port_detach(id, number);
            }
            _ => {}
        }
    }

    /// Drop whatever hangs off a port: debounce timer, activation request
    /// and child device
    fn hub_port_detach(&mut self, id: DeviceId, number: u8) {
        let Some(port) = self.hub_mut(id).and_then(|h| h.port_mut(number)) else {
            return;
        };
        let debounce = port.debounce.take();
        let child = port.child.take();
        port.flags.needs_reset = false;
        port.flags.activating = false;

        if let Some(handle) = debounce {
            self.timer.cancel(handle);
        }
        let next = {
            let _cs = CriticalSection::enter(&self.irq);
            self.activation
                .cancel(ActivationRequester::HubPort { hub: id, port: number })
        };
        if let Some(child) = child {
            self.destroy_device(child);
        }
        if let Some(next) = next {
            self.wake_activation(next);
        }
    }

    /// Debounce timer of a hub port fired
    pub(crate) fn hub_debounce_expired(&mut self, id: DeviceId, number: u8) {
        let Some(port) = self.hub_mut(id).and_then(|h| h.port_mut(number)) else {
            return;
        };
        port.debounce = None;
        if !port.status.connected() {
            return;
        }
        port.flags.needs_reset = true;
        debug!(hub = id.0, port = number, "Debounce done");
        self.hub_check_status(id);
    }

    /// The post-reset status is in; create the child if it is still there
    fn port_reset_complete(&mut self, id: DeviceId, number: u8) {
        let Some(port) = self.hub_mut(id).and_then(|h| h.port_mut(number)) else {
            return;
        };
        let status = port.status;
        if !(status.connected() && status.enabled()) || port.child.is_some() {
            debug!(hub = id.0, port = number, "Device gone after reset");
            port.flags.activating = false;
            let next = {
                let _cs = CriticalSection::enter(&self.irq);
                self.activation
                    .cancel(ActivationRequester::HubPort { hub: id, port: number })
            };
            if let Some(next) = next {
                self.wake_activation(next);
            }
            return;
        }

        let attachment = Attachment::HubPort { hub: id, port: number };
        let child = self.create_device(status.speed(), attachment);
        if let Some(port) = self.hub_mut(id).and_then(|h| h.port_mut(number)) {
            port.child = Some(child);
        }
        let handed = {
            let _cs = CriticalSection::enter(&self.irq);
            self.activation.hand_over(attachment.requester(), child)
        };
        if handed {
            self.activate(child);
        } else {
            self.queue_device_activation(child);
        }
    }

    /// The child of a port finished SET_ADDRESS
    pub(crate) fn hub_port_activated(&mut self, id: DeviceId, number: u8) {
        if let Some(port) = self.hub_mut(id).and_then(|h| h.port_mut(number)) {
            port.flags.activating = false;
        }
    }

    /// Release everything a hub holds before it is removed
    pub(crate) fn hub_teardown(&mut self, id: DeviceId) {
        let Some(hub) = self.hub_mut(id) else {
            return;
        };
        let mut timers = Vec::new();
        let mut numbers = Vec::new();
        for port in hub.ports.iter_mut() {
            timers.extend(port.debounce.take());
            port.child = None;
            numbers.push(port.number);
        }
        for handle in timers {
            self.timer.cancel(handle);
        }

        let mut woken = Vec::new();
        {
            let _cs = CriticalSection::enter(&self.irq);
            for port in numbers {
                woken.extend(
                    self.activation
                        .cancel(ActivationRequester::HubPort { hub: id, port }),
                );
            }
        }
        // Only the last grant is still standing; it may be one of our ports
        let next = woken.last().copied().filter(
            |next| !matches!(next, ActivationRequester::HubPort { hub, .. } if *hub == id),
        );
        if let Some(next) = next {
            self.wake_activation(next);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::tests::host_with_channels;
    use protocol::DeviceSpeed;

    fn hub_with_ports(n: u8) -> Hub {
        let mut hub = Hub::new();
        hub.ports = (1..=n).map(HubPort::new).collect();
        hub
    }

    /// A host holding one idle hub with a pending hub-level over-current
    /// change and powered ports
    fn host_with_idle_hub(ports: u8) -> (UsbHost, DeviceId) {
        let mut host = host_with_channels(2);
        let id = host.create_device(DeviceSpeed::Full, Attachment::RootPort);
        let mut hub = hub_with_ports(ports);
        hub.state = HubState::Configured;
        hub.change = HubChange(HubChange::OVER_CURRENT);
        for port in &mut hub.ports {
            port.flags.powered = true;
        }
        host.devices.get_mut(&id).unwrap().hub = Some(hub);
        (host, id)
    }

    fn hub_state(host: &UsbHost, id: DeviceId) -> HubState {
        host.device(id).unwrap().hub().unwrap().state()
    }

    #[test]
    fn test_mark_changes_bitmap() {
        let mut hub = hub_with_ports(9);
        hub.mark_changes(&[0b0000_0101, 0b0000_0010]);
        assert!(hub.needs_check);
        assert!(hub.port(2).unwrap().flags().needs_check);
        assert!(!hub.port(1).unwrap().flags().needs_check);
        assert!(hub.port(9).unwrap().flags().needs_check);
    }

    #[test]
    fn test_mark_changes_ignores_unknown_ports() {
        let mut hub = hub_with_ports(2);
        hub.mark_changes(&[0b1000_0000]);
        assert!(hub.ports().iter().all(|p| !p.flags().needs_check));
        assert!(!hub.needs_check);
    }

    #[test]
    fn test_children() {
        let mut hub = hub_with_ports(3);
        hub.ports[1].child = Some(DeviceId(7));
        assert_eq!(hub.children(), vec![DeviceId(7)]);
        assert_eq!(hub.state(), HubState::Attached);
    }

    #[test]
    fn test_port_status_refresh_before_hub_change_ack() {
        let (mut host, id) = host_with_idle_hub(2);
        host.hub_mut(id).unwrap().ports[1].flags.needs_check = true;

        host.hub_check_status(id);
        assert_eq!(hub_state(&host, id), HubState::CheckingPortStatus(2));
    }

    #[test]
    fn test_port_power_before_hub_change_ack() {
        let (mut host, id) = host_with_idle_hub(2);
        host.hub_mut(id).unwrap().ports[0].flags.powered = false;

        host.hub_check_status(id);
        assert_eq!(hub_state(&host, id), HubState::PoweringPort(1));
    }

    #[test]
    fn test_hub_change_ack_before_port_change_ack() {
        let (mut host, id) = host_with_idle_hub(2);
        host.hub_mut(id).unwrap().ports[0].change = PortChange(PortChange::CONNECTION);

        host.hub_check_status(id);
        assert_eq!(
            hub_state(&host, id),
            HubState::ChangeAck {
                port: 0,
                bit: HubChange::OVER_CURRENT
            }
        );
    }

    #[test]
    fn test_hub_status_refresh_comes_first() {
        let (mut host, id) = host_with_idle_hub(2);
        {
            let hub = host.hub_mut(id).unwrap();
            hub.needs_check = true;
            hub.ports[0].flags.needs_check = true;
        }

        host.hub_check_status(id);
        assert_eq!(hub_state(&host, id), HubState::CheckingHubStatus);
    }
}
