//! The host context
//!
//! [`UsbHost`] owns every piece of stack state: channels, the URB arena, the
//! scheduler queues, devices and the root port. Platform code hands it the
//! controller, a one-shot timer and the interrupt mask, then forwards the
//! controller interrupt to [`UsbHost::handle_interrupt`] and timer expiries
//! to [`UsbHost::handle_timer`].
//!
//! Interrupt dispatch order within one call:
//!
//! 1. root port (PRTINT)
//! 2. RX FIFO level (RXFLVL), draining every queued packet
//! 3. channel interrupts (HCINT), lowest channel first
//! 4. TX FIFO empty (NPTXFE, PTXFE)
//! 5. start of frame (SOF)

use crate::activation::{Activation, ActivationRequester, AddressPool};
use crate::channel::{Channel, ChannelEvent, ChannelState, TransferTarget};
use crate::config::HostConfig;
use crate::device::{Device, DeviceId};
use crate::driver::{Driver, DriverDeviceRef, DriverNotice};
use crate::error::{HostError, Result};
use crate::frame::{FrameBudget, urb_bit_time};
use crate::hal::{
    ChannelInterrupts, CoreInterrupts, CriticalSection, HostController, InterruptMask,
    MAX_PACKET_COUNT, OneshotTimer, RxPacketStatus, TimerEvent, TxQueue,
};
use crate::root::RootPort;
use crate::scheduler::Scheduler;
use crate::urb::{Completion, Urb, UrbCompletion, UrbId, UrbStatus};
use common::{StatsSnapshot, TransferStats};
use protocol::TransferKind;
use std::collections::HashMap;
use std::rc::Rc;
use tracing::{debug, info, trace, warn};

/// The URB whose completion handler is running right now
#[derive(Debug, Clone, Copy)]
pub(crate) struct Completing {
    urb: UrbId,
    device: DeviceId,
    retired: bool,
}

pub struct UsbHost {
    pub(crate) config: HostConfig,
    pub(crate) hw: Box<dyn HostController>,
    pub(crate) timer: Box<dyn OneshotTimer>,
    pub(crate) irq: Rc<dyn InterruptMask>,
    pub(crate) budget: FrameBudget,
    pub(crate) channels: Vec<Channel>,
    pub(crate) urbs: HashMap<UrbId, Urb>,
    pub(crate) scheduler: Scheduler,
    pub(crate) devices: HashMap<DeviceId, Device>,
    pub(crate) activation: Activation,
    pub(crate) addresses: AddressPool,
    /// Enumerated devices in registration order
    pub(crate) registered: Vec<DeviceId>,
    pub(crate) drivers: Vec<Box<dyn Driver>>,
    pub(crate) root: RootPort,
    pub(crate) stats: TransferStats,
    pub(crate) completing: Option<Completing>,
    /// Driver callbacks waiting for their driver to be released
    pub(crate) deferred_notices: Vec<(DriverDeviceRef, DeviceId, DriverNotice)>,
    next_urb: u64,
    next_device: u32,
}

/// Borrow what a channel needs to service one event of URB `id`
fn transfer_target<'a>(
    urbs: &'a mut HashMap<UrbId, Urb>,
    devices: &'a mut HashMap<DeviceId, Device>,
    id: UrbId,
) -> Option<TransferTarget<'a>> {
    let urb = urbs.get_mut(&id)?;
    let device = devices.get_mut(&urb.endpoint.device)?;
    let device_address = device.address();
    let speed = device.speed();
    let endpoint = device.endpoint_mut(urb.endpoint.address)?;
    Some(TransferTarget {
        urb,
        endpoint,
        device_address,
        speed,
    })
}

/// Worst-case bus time the next packet of URB `id` needs
fn urb_cost(
    urbs: &HashMap<UrbId, Urb>,
    devices: &HashMap<DeviceId, Device>,
    id: UrbId,
) -> Option<u32> {
    let urb = urbs.get(&id)?;
    let device = devices.get(&urb.endpoint.device)?;
    let endpoint = device.get_endpoint(urb.endpoint.address)?;
    let remaining = urb.length().saturating_sub(urb.actual);
    Some(urb_bit_time(
        urb.kind(),
        remaining,
        endpoint.max_packet_size(),
        device.speed(),
    ))
}

impl UsbHost {
    /// Build the stack over `hw`. Fails if `config` does not validate or
    /// the controller has no channels.
    pub fn new(
        config: HostConfig,
        hw: Box<dyn HostController>,
        timer: Box<dyn OneshotTimer>,
        irq: Rc<dyn InterruptMask>,
    ) -> Result<Self> {
        config
            .validate()
            .map_err(|e| HostError::Config(e.to_string()))?;
        let count = hw.channel_count().min(config.channels);
        if count == 0 {
            return Err(HostError::Config("Controller has no channels".to_string()));
        }
        info!(
            channels = count,
            guard_band = config.guard_band_bit_times,
            "Host stack initialised"
        );
        Ok(Self {
            budget: FrameBudget::new(config.guard_band_bit_times),
            channels: (0..count).map(Channel::new).collect(),
            config,
            hw,
            timer,
            irq,
            urbs: HashMap::new(),
            scheduler: Scheduler::new(),
            devices: HashMap::new(),
            activation: Activation::new(),
            addresses: AddressPool::new(),
            registered: Vec::new(),
            drivers: Vec::new(),
            root: RootPort::default(),
            stats: TransferStats::new(),
            completing: None,
            deferred_notices: Vec::new(),
            next_urb: 1,
            next_device: 1,
        })
    }

    /// Power the root port and start watching for devices
    pub fn start(&mut self) {
        info!("Starting host");
        self.root_power_on();
    }

    /// Add a class driver. Devices that are already enumerated and still
    /// unclaimed are offered to it straight away.
    pub fn register_driver(&mut self, mut driver: Box<dyn Driver>) {
        info!(driver = driver.name(), "Registering driver");
        let candidates: Vec<DeviceId> = self
            .registered_devices()
            .filter(|d| !d.is_hub() && !d.is_claimed() && d.active_configuration().is_none())
            .map(Device::id)
            .collect();
        for id in candidates {
            if self.devices.get(&id).is_some_and(|d| !d.is_claimed()) {
                driver.probe(self, id);
            }
        }
        self.drivers.push(driver);
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Frames seen since start
    pub fn current_frame(&self) -> u64 {
        self.budget.current_frame()
    }

    /// Bit times left for new work in the current frame
    pub fn frame_time_remaining(&self) -> u32 {
        self.budget.remaining(self.hw.as_ref())
    }

    pub fn channels(&self) -> &[Channel] {
        &self.channels
    }

    pub fn channel_state(&self, channel: usize) -> Option<ChannelState> {
        self.channels.get(channel).map(Channel::state)
    }

    /// Whether URB `id` is still alive (queued, in flight or periodic)
    pub fn is_urb_pending(&self, id: UrbId) -> bool {
        self.urbs.contains_key(&id)
    }

    pub fn activation_holder(&self) -> Option<ActivationRequester> {
        self.activation.holder()
    }

    pub(crate) fn allocate_device_id(&mut self) -> DeviceId {
        let id = DeviceId(self.next_device);
        self.next_device += 1;
        id
    }

    /// Queue a URB for its endpoint. The URB is owned by the stack until its
    /// completion runs or it is retired.
    pub fn submit_urb(&mut self, mut urb: Urb) -> Result<UrbId> {
        let target = urb.endpoint;
        let device = self
            .devices
            .get(&target.device)
            .ok_or(HostError::NoSuchDevice(target.device))?;
        let endpoint =
            device
                .get_endpoint(target.address)
                .ok_or(HostError::NoSuchEndpoint {
                    device: target.device,
                    address: target.address,
                })?;

        let max = MAX_PACKET_COUNT * endpoint.max_packet_size().max(1) as usize;
        if urb.length() > max {
            return Err(HostError::TransferTooLarge {
                length: urb.length(),
                max,
            });
        }

        let kind = endpoint.kind();
        if kind == TransferKind::Control {
            if urb.setup.is_none() {
                return Err(HostError::MissingSetup);
            }
            if self.urbs.values().any(|u| u.endpoint == target) {
                return Err(HostError::EndpointBusy {
                    device: target.device,
                    address: target.address,
                });
            }
        }
        urb.kind = kind;
        urb.actual = 0;
        urb.channel = None;
        if kind.is_periodic() && urb.interval == 0 {
            urb.interval = endpoint.interval();
        }
        let cost = urb_bit_time(
            kind,
            urb.length(),
            endpoint.max_packet_size(),
            device.speed(),
        );

        let id = UrbId(self.next_urb);
        self.next_urb += 1;
        self.stats.record_submit();
        trace!(urb = id.0, device = target.device.0, endpoint = target.address, ?kind, len = urb.length(), "Submit");

        let _cs = CriticalSection::enter(&self.irq);
        let now = self.budget.current_frame();
        let periodic = kind.is_periodic();
        let interval = urb.interval;
        let free = self.channels.iter().position(Channel::is_free).filter(|_| {
            self.budget.admits(self.hw.as_ref(), cost)
                && (periodic
                    || (self.scheduler.nonperiodic_len() == 0 && !self.has_runnable_periodic(now)))
        });
        self.urbs.insert(id, urb);

        match free {
            Some(channel) => {
                if periodic {
                    self.scheduler
                        .register_periodic(id, now + interval as u64, interval);
                    self.budget.reserve(cost);
                }
                self.bind(channel, id);
                self.update_tx_interrupts();
            }
            None if periodic => self.scheduler.register_periodic(id, now, interval),
            None => self.scheduler.enqueue_nonperiodic(id),
        }
        Ok(id)
    }

    /// Withdraw a URB. Its completion will not run, even if the transfer
    /// has already finished on the bus.
    pub fn retire_urb(&mut self, id: UrbId) -> Result<()> {
        if self.cancel_urb(id) {
            self.stats.record_retire();
            debug!(urb = id.0, "Retired");
            Ok(())
        } else {
            Err(HostError::NoSuchUrb(id))
        }
    }

    pub(crate) fn cancel_urb(&mut self, id: UrbId) -> bool {
        let _cs = CriticalSection::enter(&self.irq);
        self.scheduler.remove(id);
        let mut found = false;
        if let Some(completing) = self.completing.as_mut().filter(|c| c.urb == id) {
            completing.retired = true;
            found = true;
        }
        if let Some(urb) = self.urbs.remove(&id) {
            if let Some(channel) = urb.channel {
                self.channels[channel].abort(self.hw.as_mut());
            }
            found = true;
        }
        found
    }

    /// Stop a periodic URB of a vanishing device from being put back
    pub(crate) fn cancel_completing_for(&mut self, device: DeviceId) {
        if let Some(completing) = self.completing.as_mut().filter(|c| c.device == device) {
            completing.retired = true;
        }
    }

    fn has_runnable_periodic(&self, now: u64) -> bool {
        self.scheduler.has_due_periodic(now, |id| {
            self.urbs.get(&id).is_some_and(|u| u.channel.is_none())
        })
    }

    fn bind(&mut self, channel: usize, id: UrbId) {
        let Some(mut target) = transfer_target(&mut self.urbs, &mut self.devices, id) else {
            warn!(urb = id.0, "URB lost its endpoint before binding");
            return;
        };
        target.urb.channel = Some(channel);
        self.channels[channel].setup_for_urb(self.hw.as_mut(), id, &mut target);
    }

    /// Earliest due periodic URB that fits the frame; reserves its time
    fn next_periodic_urb(&mut self, now: u64) -> Option<UrbId> {
        let remaining = self.budget.remaining(self.hw.as_ref());
        let urbs = &self.urbs;
        let devices = &self.devices;
        let id = self.scheduler.next_periodic(now, |id| {
            urbs.get(&id).is_some_and(|u| u.channel.is_none())
                && urb_cost(urbs, devices, id).is_some_and(|bits| bits < remaining)
        })?;
        if let Some(bits) = urb_cost(&self.urbs, &self.devices, id) {
            self.budget.reserve(bits);
        }
        Some(id)
    }

    fn next_nonperiodic_urb(&mut self) -> Option<UrbId> {
        let remaining = self.budget.remaining(self.hw.as_ref());
        let urbs = &self.urbs;
        let devices = &self.devices;
        self.scheduler.next_nonperiodic(|id| {
            urb_cost(urbs, devices, id).is_none_or(|bits| bits < remaining)
        })
    }

    /// Hand queued work to idle channels, periodic URBs first
    fn fill_free_channels(&mut self) {
        let _cs = CriticalSection::enter(&self.irq);
        let now = self.budget.current_frame();
        for channel in 0..self.channels.len() {
            if !self.channels[channel].is_free() {
                continue;
            }
            match self.next_periodic_urb(now) {
                Some(id) => self.bind(channel, id),
                None => break,
            }
        }
        for channel in 0..self.channels.len() {
            if !self.channels[channel].is_free() {
                continue;
            }
            let Some(id) = self.next_nonperiodic_urb() else {
                break;
            };
            if self.urbs.contains_key(&id) {
                self.bind(channel, id);
            }
        }
        self.update_tx_interrupts();
    }

    fn update_tx_interrupts(&mut self) {
        for queue in [TxQueue::NonPeriodic, TxQueue::Periodic] {
            let waiting = self.channels.iter().any(|c| c.waiting_for_fifo(queue));
            self.hw.set_tx_empty_interrupt(queue, waiting);
        }
    }

    /// Run the completion of a finished URB and put periodic URBs back
    fn complete_urb(&mut self, id: UrbId, status: UrbStatus) {
        let Some(mut urb) = self.urbs.remove(&id) else {
            return;
        };
        urb.channel = None;
        let periodic = urb.is_periodic();
        let length = urb.actual.min(urb.length());
        self.stats.record_completion(status.is_ok(), length);
        trace!(urb = id.0, %status, bytes = length, "Complete");

        let previous = self.completing.replace(Completing {
            urb: id,
            device: urb.endpoint.device,
            retired: false,
        });
        match &mut urb.completion {
            Completion::Device(device) => {
                let device = *device;
                self.device_transfer_complete(device, status, &urb.buffer[..length]);
            }
            Completion::Hub(hub) => {
                let hub = *hub;
                self.hub_transfer_complete(hub, status, &urb.buffer[..length]);
            }
            Completion::HubStatus(hub) => {
                let hub = *hub;
                self.hub_status_change(hub, status, &urb.buffer[..length]);
            }
            Completion::Callback(callback) => callback(
                self,
                UrbCompletion {
                    id,
                    status,
                    data: &urb.buffer[..length],
                },
            ),
        }
        let finished = std::mem::replace(&mut self.completing, previous);
        self.deliver_deferred_notices();

        let retired = finished.is_some_and(|c| c.retired);
        if periodic && !retired && self.scheduler.contains(id) {
            urb.actual = 0;
            self.urbs.insert(id, urb);
        }
    }

    /// Entry point for the controller interrupt
    pub fn handle_interrupt(&mut self) {
        let ints = self.hw.core_interrupts();
        if ints.is_empty() {
            return;
        }
        if ints.contains(CoreInterrupts::PRTINT) {
            self.root_port_interrupt();
        }
        if ints.contains(CoreInterrupts::RXFLVL) {
            self.drain_rx_fifo();
        }
        if ints.contains(CoreInterrupts::HCINT) {
            let pending = self.hw.pending_channels();
            for channel in 0..self.channels.len() {
                if pending & (1 << channel) != 0 {
                    let channel_ints = self.hw.channel_interrupts(channel);
                    self.channel_interrupt(channel, channel_ints);
                }
            }
        }
        if ints.contains(CoreInterrupts::NPTXFE) {
            self.service_tx(TxQueue::NonPeriodic);
        }
        if ints.contains(CoreInterrupts::PTXFE) {
            self.service_tx(TxQueue::Periodic);
        }
        if ints.contains(CoreInterrupts::SOF) {
            self.start_of_frame();
        }
        self.update_tx_interrupts();
        self.deliver_deferred_notices();
    }

    /// Entry point for one-shot timer expiry
    pub fn handle_timer(&mut self, event: TimerEvent) {
        trace!(?event, "Timer");
        match event {
            TimerEvent::RootDebounce => self.root_debounce_expired(),
            TimerEvent::RootResetDone => self.root_reset_done(),
            TimerEvent::HubDebounce { hub, port } => self.hub_debounce_expired(hub, port),
        }
        self.deliver_deferred_notices();
    }

    fn drain_rx_fifo(&mut self) {
        while let Some(status) = self.hw.pop_rx_status() {
            if status.status != RxPacketStatus::InData {
                continue;
            }
            let urb = self.channels.get(status.channel).and_then(Channel::urb);
            match urb.and_then(|id| transfer_target(&mut self.urbs, &mut self.devices, id)) {
                Some(mut target) => self.channels[status.channel].rx_data(
                    self.hw.as_mut(),
                    &mut target,
                    status.byte_count,
                    status.pid,
                ),
                None => {
                    // Late data for an aborted transfer
                    for _ in 0..status.byte_count.div_ceil(4) {
                        self.hw.read_rx_word();
                    }
                    trace!(channel = status.channel, bytes = status.byte_count, "Discarded RX data");
                }
            }
        }
    }

    fn channel_interrupt(&mut self, channel: usize, ints: ChannelInterrupts) {
        let state = self.channels[channel].state();
        if !matches!(state, ChannelState::Unused | ChannelState::Halting) {
            if ints.contains(ChannelInterrupts::NAK) {
                self.stats.record_nak();
            }
            if ints.contains(ChannelInterrupts::STALL) {
                self.stats.record_stall();
            }
            if ints.contains(ChannelInterrupts::TXERR) {
                self.stats.record_transaction_error();
            }
        }

        let event = {
            let urb = self.channels[channel].urb();
            let mut target =
                urb.and_then(|id| transfer_target(&mut self.urbs, &mut self.devices, id));
            self.channels[channel].interrupt(self.hw.as_mut(), target.as_mut(), ints)
        };

        match event {
            ChannelEvent::Pending => {}
            ChannelEvent::Completed(id, status) => {
                self.fill_free_channels();
                self.complete_urb(id, status);
            }
            ChannelEvent::Deferred(id) => {
                if let Some(urb) = self.urbs.get_mut(&id) {
                    urb.channel = None;
                    urb.actual = 0;
                }
            }
            ChannelEvent::Halted => self.fill_free_channels(),
        }
    }

    fn service_tx(&mut self, queue: TxQueue) {
        for channel in 0..self.channels.len() {
            if !self.channels[channel].waiting_for_fifo(queue) {
                continue;
            }
            let Some(id) = self.channels[channel].urb() else {
                continue;
            };
            if let Some(target) = transfer_target(&mut self.urbs, &mut self.devices, id) {
                self.channels[channel].tx_possible(self.hw.as_mut(), &target);
            }
        }
    }

    fn start_of_frame(&mut self) {
        self.stats.record_sof();
        let frame = {
            let _cs = CriticalSection::enter(&self.irq);
            self.budget.start_of_frame()
        };
        trace!(frame, "SOF");
        self.fill_free_channels();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::device::Attachment;
    use crate::hal::mock::MockController;
    use crate::hal::TimerHandle;
    use crate::urb::EndpointRef;
    use protocol::{DeviceSpeed, SetupPacket};
    use std::cell::{Cell, RefCell};

    struct NoTimer;

    impl OneshotTimer for NoTimer {
        fn oneshot(&mut self, _delay_ms: u32, _event: TimerEvent) -> TimerHandle {
            TimerHandle(0)
        }

        fn cancel(&mut self, _handle: TimerHandle) {}
    }

    #[derive(Default)]
    struct CountingMask {
        depth: Cell<u32>,
    }

    impl InterruptMask for CountingMask {
        fn save(&self) -> bool {
            self.depth.set(self.depth.get() + 1);
            true
        }

        fn restore(&self, _was_enabled: bool) {
            self.depth.set(self.depth.get() - 1);
        }
    }

    pub(crate) fn host_with_channels(channels: usize) -> UsbHost {
        UsbHost::new(
            HostConfig::default(),
            Box::new(MockController::new(channels)),
            Box::new(NoTimer),
            Rc::new(CountingMask::default()),
        )
        .unwrap()
    }

    #[test]
    fn test_channel_count_is_clamped_to_hardware() {
        let host = host_with_channels(4);
        assert_eq!(host.channels().len(), 4);
        assert!(host.channels().iter().all(Channel::is_free));
    }

    #[test]
    fn test_empty_channel_pool_is_rejected() {
        let config = HostConfig {
            channels: 0,
            ..HostConfig::default()
        };
        let result = UsbHost::new(
            config,
            Box::new(MockController::new(4)),
            Box::new(NoTimer),
            Rc::new(CountingMask::default()),
        );
        assert!(matches!(result, Err(HostError::Config(_))));

        let result = UsbHost::new(
            HostConfig::default(),
            Box::new(MockController::new(0)),
            Box::new(NoTimer),
            Rc::new(CountingMask::default()),
        );
        assert!(matches!(result, Err(HostError::Config(_))));
    }

    #[test]
    fn test_short_debounce_is_rejected() {
        let config = HostConfig {
            debounce_ms: 20,
            ..HostConfig::default()
        };
        let result = UsbHost::new(
            config,
            Box::new(MockController::new(4)),
            Box::new(NoTimer),
            Rc::new(CountingMask::default()),
        );
        assert!(matches!(result, Err(HostError::Config(msg)) if msg.contains("20ms")));
    }

    #[test]
    fn test_submit_to_unknown_device_fails() {
        let mut host = host_with_channels(2);
        let urb = Urb::control(
            DeviceId(42),
            SetupPacket::get_device_descriptor(18),
            Vec::new(),
            Completion::Device(DeviceId(42)),
        );
        assert_eq!(host.submit_urb(urb).unwrap_err(), HostError::NoSuchDevice(DeviceId(42)));
    }

    #[test]
    fn test_second_control_urb_on_default_pipe_is_busy() {
        let mut host = host_with_channels(2);
        let device = host.create_device(DeviceSpeed::Full, Attachment::RootPort);
        let setup = SetupPacket::get_device_descriptor(18);
        let first = host
            .submit_urb(Urb::control(device, setup, Vec::new(), Completion::Device(device)))
            .unwrap();
        let second = host.submit_urb(Urb::control(device, setup, Vec::new(), Completion::Device(device)));
        assert_eq!(
            second.unwrap_err(),
            HostError::EndpointBusy {
                device,
                address: 0
            }
        );
        assert_eq!(host.channel_state(0), Some(ChannelState::CtlSetupTXResult));
        assert!(host.is_urb_pending(first));
    }

    #[test]
    fn test_bulk_urb_needs_an_endpoint() {
        let mut host = host_with_channels(2);
        let device = host.create_device(DeviceSpeed::Full, Attachment::RootPort);
        let urb = Urb::transfer_in(
            EndpointRef {
                device,
                address: 0x81,
            },
            64,
            Completion::Device(device),
        );
        assert_eq!(
            host.submit_urb(urb).unwrap_err(),
            HostError::NoSuchEndpoint {
                device,
                address: 0x81
            }
        );
    }

    #[test]
    fn test_transfer_beyond_packet_count_limit_is_rejected() {
        let mut host = host_with_channels(2);
        let device = host.create_device(DeviceSpeed::Full, Attachment::RootPort);
        // The default pipe starts at 8-byte packets
        let limit = (MAX_PACKET_COUNT * 8) as u16;

        let too_long = Urb::control(
            device,
            SetupPacket::get_device_descriptor(limit + 1),
            Vec::new(),
            Completion::Device(device),
        );
        assert_eq!(
            host.submit_urb(too_long).unwrap_err(),
            HostError::TransferTooLarge {
                length: limit as usize + 1,
                max: limit as usize
            }
        );

        let at_limit = Urb::control(
            device,
            SetupPacket::get_device_descriptor(limit),
            Vec::new(),
            Completion::Device(device),
        );
        let id = host.submit_urb(at_limit).unwrap();
        assert!(host.is_urb_pending(id));
    }

    #[test]
    fn test_retire_queued_urb_suppresses_completion() {
        let mut host = host_with_channels(1);
        let device = host.create_device(DeviceSpeed::Full, Attachment::RootPort);
        let other = host.create_device(DeviceSpeed::Full, Attachment::RootPort);
        let called = Rc::new(RefCell::new(false));

        host.submit_urb(Urb::control(
            device,
            SetupPacket::get_device_descriptor(18),
            Vec::new(),
            Completion::Device(device),
        ))
        .unwrap();
        let flag = Rc::clone(&called);
        let queued = host
            .submit_urb(Urb::control(
                other,
                SetupPacket::get_device_descriptor(18),
                Vec::new(),
                Completion::Callback(Box::new(move |_, _| *flag.borrow_mut() = true)),
            ))
            .unwrap();
        assert_eq!(host.scheduler.nonperiodic_len(), 1);

        host.retire_urb(queued).unwrap();
        assert_eq!(host.scheduler.nonperiodic_len(), 0);
        assert!(!host.is_urb_pending(queued));
        assert_eq!(host.retire_urb(queued), Err(HostError::NoSuchUrb(queued)));
        assert!(!*called.borrow());
        assert_eq!(host.stats().urbs_retired, 1);
    }

    #[test]
    fn test_retire_in_flight_urb_aborts_channel() {
        let mut host = host_with_channels(1);
        let device = host.create_device(DeviceSpeed::Low, Attachment::RootPort);
        let id = host
            .submit_urb(Urb::control(
                device,
                SetupPacket::get_device_descriptor(8),
                Vec::new(),
                Completion::Device(device),
            ))
            .unwrap();
        assert_eq!(host.channels()[0].urb(), Some(id));

        host.retire_urb(id).unwrap();
        assert_eq!(host.channel_state(0), Some(ChannelState::Halting));
        assert_eq!(host.channels()[0].urb(), None);
    }
}
