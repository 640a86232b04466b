//! Transfer channels
//!
//! A channel executes one URB at a time and walks it through its wire-level
//! phases. Control transfers run SETUP, an optional DATA stage and STATUS;
//! bulk, interrupt and isochronous transfers run a single TX or RX phase.
//!
//! The channel never owns the URB or the endpoint. The host lends both for
//! the duration of a single event through [`TransferTarget`], and the
//! channel reports what the host must do next as a [`ChannelEvent`].

use crate::endpoint::Endpoint;
use crate::hal::{
    ChannelConfig, ChannelInterrupts, ChannelPid, HostController, MAX_PACKET_COUNT, TxQueue,
};
use crate::urb::{Urb, UrbId, UrbStatus};
use protocol::messages::SETUP_PACKET_LEN;
use protocol::{DataPid, DeviceSpeed, Direction, TransferKind};
use tracing::{debug, error, trace, warn};

/// Consecutive transaction errors absorbed before a transfer fails
pub const MAX_TRANSACTION_ERRORS: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelState {
    Unused,
    CtlSetupTXWait,
    CtlSetupTXResult,
    CtlDataTXWait,
    CtlDataTXResult,
    CtlDataRXWait,
    CtlStatusRXWait,
    CtlStatusTXWait,
    CtlStatusTXResult,
    TXWait,
    TXResult,
    RXWait,
    /// Disabled by software, waiting for CHH
    Halting,
}

impl ChannelState {
    /// Armed and waiting for TX FIFO space
    pub fn is_tx_wait(self) -> bool {
        matches!(
            self,
            Self::CtlSetupTXWait | Self::CtlDataTXWait | Self::CtlStatusTXWait | Self::TXWait
        )
    }

    fn is_rx(self) -> bool {
        matches!(
            self,
            Self::CtlDataRXWait | Self::CtlStatusRXWait | Self::RXWait
        )
    }

    fn result(self) -> Self {
        match self {
            Self::CtlSetupTXWait => Self::CtlSetupTXResult,
            Self::CtlDataTXWait => Self::CtlDataTXResult,
            Self::CtlStatusTXWait => Self::CtlStatusTXResult,
            Self::TXWait => Self::TXResult,
            other => other,
        }
    }

    /// The armed state a phase returns to when it is retried
    fn wait(self) -> Self {
        match self {
            Self::CtlSetupTXResult => Self::CtlSetupTXWait,
            Self::CtlDataTXResult => Self::CtlDataTXWait,
            Self::CtlStatusTXResult => Self::CtlStatusTXWait,
            Self::TXResult => Self::TXWait,
            other => other,
        }
    }

    fn direction(self) -> Direction {
        if self.is_rx() {
            Direction::In
        } else {
            Direction::Out
        }
    }
}

/// What a channel borrows while it services one event
pub struct TransferTarget<'a> {
    pub urb: &'a mut Urb,
    pub endpoint: &'a mut Endpoint,
    pub device_address: u8,
    pub speed: DeviceSpeed,
}

/// Follow-up work for the host after a channel event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelEvent {
    Pending,
    /// The URB is finished. The channel is Unused on success and Halting
    /// after an error.
    Completed(UrbId, UrbStatus),
    /// A periodic endpoint NAKed. The URB is unbound and waits for its next
    /// due frame; the channel is Halting.
    Deferred(UrbId),
    /// CHH arrived; the channel is Unused
    Halted,
}

#[derive(Debug)]
pub struct Channel {
    index: usize,
    state: ChannelState,
    urb: Option<UrbId>,
    /// Offset of the armed TX phase within the URB buffer
    cursor: usize,
    /// Bytes of the armed phase already pushed into the FIFO
    written: usize,
    phase_len: usize,
    packets: u16,
    errors: u8,
    queue: TxQueue,
}

fn uses_toggle(kind: TransferKind) -> bool {
    matches!(kind, TransferKind::Bulk | TransferKind::Interrupt)
}

impl Channel {
    pub fn new(index: usize) -> Self {
        Self {
            index,
            state: ChannelState::Unused,
            urb: None,
            cursor: 0,
            written: 0,
            phase_len: 0,
            packets: 0,
            errors: 0,
            queue: TxQueue::NonPeriodic,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn urb(&self) -> Option<UrbId> {
        self.urb
    }

    pub fn is_free(&self) -> bool {
        self.state == ChannelState::Unused
    }

    /// Whether the channel is armed and waiting for space in `queue`
    pub fn waiting_for_fifo(&self, queue: TxQueue) -> bool {
        self.state.is_tx_wait() && self.queue == queue
    }

    /// Bind an Unused channel to a URB and arm its first phase
    pub fn setup_for_urb(
        &mut self,
        hw: &mut dyn HostController,
        id: UrbId,
        target: &mut TransferTarget<'_>,
    ) {
        if self.state != ChannelState::Unused {
            self.defect("bind");
        }
        self.urb = Some(id);
        self.cursor = 0;
        self.errors = 0;
        self.queue = TxQueue::for_kind(target.urb.kind());
        target.urb.actual = 0;

        let first = match target.urb.kind() {
            TransferKind::Control => ChannelState::CtlSetupTXWait,
            _ if target.urb.direction().is_in() => ChannelState::RXWait,
            _ => ChannelState::TXWait,
        };
        debug!(
            channel = self.index,
            urb = id.0,
            address = target.device_address,
            endpoint = target.endpoint.address(),
            "Channel bound, entering {:?}",
            first
        );
        self.arm(hw, first, target);
    }

    fn max_packet(target: &TransferTarget<'_>) -> usize {
        (target.endpoint.max_packet_size() as usize).max(1)
    }

    /// PID for the first packet still to be sent in the given phase
    fn phase_pid(&self, state: ChannelState, target: &TransferTarget<'_>) -> ChannelPid {
        let mps = Self::max_packet(target);
        match state {
            ChannelState::CtlSetupTXWait => ChannelPid::Setup,
            ChannelState::CtlDataTXWait => DataPid::Data1.advanced(self.cursor / mps).into(),
            ChannelState::CtlDataRXWait => DataPid::Data1.advanced(target.urb.actual / mps).into(),
            ChannelState::CtlStatusRXWait | ChannelState::CtlStatusTXWait => ChannelPid::Data1,
            _ if target.urb.kind() == TransferKind::Isochronous => ChannelPid::Data0,
            _ => target.endpoint.toggle(state.direction()).into(),
        }
    }

    /// Program the hardware for `state` and start it
    fn arm(
        &mut self,
        hw: &mut dyn HostController,
        state: ChannelState,
        target: &mut TransferTarget<'_>,
    ) {
        let mps = Self::max_packet(target);
        let len = match state {
            ChannelState::CtlSetupTXWait => SETUP_PACKET_LEN,
            ChannelState::CtlDataTXWait | ChannelState::TXWait => {
                target.urb.length().saturating_sub(self.cursor)
            }
            ChannelState::CtlDataRXWait | ChannelState::RXWait => {
                target.urb.length().saturating_sub(target.urb.actual)
            }
            ChannelState::CtlStatusRXWait | ChannelState::CtlStatusTXWait => 0,
            _ => self.defect("arm"),
        };
        let direction = state.direction();
        // submit_urb keeps every transfer within MAX_PACKET_COUNT packets
        let packets = len.div_ceil(mps).clamp(1, MAX_PACKET_COUNT);
        let pid = self.phase_pid(state, target);
        let kind = target.urb.kind();

        self.state = state;
        self.phase_len = len;
        self.written = 0;
        self.packets = packets as u16;

        let config = ChannelConfig {
            device_address: target.device_address,
            endpoint: target.endpoint.number(),
            direction,
            kind,
            max_packet_size: mps as u16,
            low_speed: target.speed == DeviceSpeed::Low,
            pid,
            // IN transfers are sized in whole packets
            transfer_len: if direction.is_in() { packets * mps } else { len },
            packet_count: packets as u16,
            odd_frame: kind.is_periodic() && hw.frame_number() & 1 == 0,
        };
        trace!(channel = self.index, ?state, ?pid, len, "Arming channel");
        hw.start_channel(self.index, &config);

        if direction == Direction::Out {
            self.tx_possible(hw, target);
        }
    }

    /// Called when the channel's TX FIFO gains space. Writes at most one
    /// packet; returns true while the phase still has bytes to write.
    pub fn tx_possible(&mut self, hw: &mut dyn HostController, target: &TransferTarget<'_>) -> bool {
        if !self.state.is_tx_wait() {
            return false;
        }
        let remaining = self.phase_len - self.written;
        if remaining > 0 {
            let chunk = remaining.min(Self::max_packet(target));
            if hw.tx_fifo_space(self.queue) < chunk {
                return true;
            }
            if self.state == ChannelState::CtlSetupTXWait {
                let setup = target.urb.setup_bytes();
                hw.write_tx_fifo(self.index, &setup[self.written..self.written + chunk]);
            } else {
                let start = self.cursor + self.written;
                hw.write_tx_fifo(self.index, &target.urb.buffer[start..start + chunk]);
            }
            self.written += chunk;
            trace!(channel = self.index, bytes = chunk, "TX FIFO write");
        }
        if self.written < self.phase_len {
            return true;
        }
        self.state = self.state.result();
        false
    }

    /// An IN packet of `byte_count` bytes is waiting in the RX FIFO
    pub fn rx_data(
        &mut self,
        hw: &mut dyn HostController,
        target: &mut TransferTarget<'_>,
        byte_count: usize,
        pid: DataPid,
    ) {
        if !self.state.is_rx() {
            self.defect("RX data");
        }
        let urb = &mut *target.urb;
        let base = urb.actual;
        for word_index in 0..byte_count.div_ceil(4) {
            let word = hw.read_rx_word().to_le_bytes();
            for (i, byte) in word.into_iter().enumerate() {
                let offset = word_index * 4 + i;
                if offset >= byte_count {
                    break;
                }
                if let Some(slot) = urb.buffer.get_mut(base + offset) {
                    *slot = byte;
                }
            }
        }
        urb.actual += byte_count.min(urb.length() - base);
        if uses_toggle(urb.kind()) {
            target.endpoint.set_toggle(Direction::In, pid.toggled());
        }
        trace!(channel = self.index, bytes = byte_count, ?pid, "RX data");
    }

    /// Service the channel's interrupt status
    pub fn interrupt(
        &mut self,
        hw: &mut dyn HostController,
        target: Option<&mut TransferTarget<'_>>,
        ints: ChannelInterrupts,
    ) -> ChannelEvent {
        match self.state {
            ChannelState::Unused => {
                if ints.0 & !(ChannelInterrupts::CHH | ChannelInterrupts::ACK) != 0 {
                    self.defect("interrupt");
                }
                return ChannelEvent::Pending;
            }
            ChannelState::Halting => {
                if ints.contains(ChannelInterrupts::CHH) {
                    trace!(channel = self.index, "Channel halted");
                    self.state = ChannelState::Unused;
                    self.urb = None;
                    return ChannelEvent::Halted;
                }
                return ChannelEvent::Pending;
            }
            _ => {}
        }
        let Some(target) = target else {
            self.defect("interrupt without a transfer");
        };

        if ints.contains(ChannelInterrupts::STALL) {
            return self.fail(hw, UrbStatus::Stall);
        }
        if ints.contains(ChannelInterrupts::BBERR) {
            return self.fail(hw, UrbStatus::BabbleError);
        }
        if ints.contains(ChannelInterrupts::FRMOR) {
            return self.fail(hw, UrbStatus::FrameOverrun);
        }
        if ints.contains(ChannelInterrupts::DTERR) {
            return self.fail(hw, UrbStatus::DataToggleError);
        }
        if ints.contains(ChannelInterrupts::TXERR) {
            self.errors += 1;
            if self.errors >= MAX_TRANSACTION_ERRORS {
                return self.fail(hw, UrbStatus::TransactionError);
            }
            warn!(
                channel = self.index,
                errors = self.errors,
                "Transaction error, retrying phase"
            );
            self.retry(hw, target);
            return ChannelEvent::Pending;
        }
        if ints.contains(ChannelInterrupts::NAK) {
            return self.nak(hw, target);
        }
        if ints.contains(ChannelInterrupts::XFRC) {
            self.errors = 0;
            return self.transfer_complete(hw, target);
        }
        if ints.contains(ChannelInterrupts::ACK) {
            self.errors = 0;
        }
        ChannelEvent::Pending
    }

    /// Cancel whatever the channel is doing; no event will name the URB
    pub fn abort(&mut self, hw: &mut dyn HostController) {
        match self.state {
            ChannelState::Unused | ChannelState::Halting => {}
            _ => {
                debug!(channel = self.index, state = ?self.state, "Aborting channel");
                hw.disable_channel(self.index);
                self.state = ChannelState::Halting;
            }
        }
        self.urb = None;
    }

    fn nak(&mut self, hw: &mut dyn HostController, target: &mut TransferTarget<'_>) -> ChannelEvent {
        self.errors = 0;
        if target.urb.is_periodic() {
            // Nothing to do until the endpoint is due again
            hw.disable_channel(self.index);
            self.state = ChannelState::Halting;
            return match self.urb.take() {
                Some(id) => ChannelEvent::Deferred(id),
                None => self.defect("NAK without a URB"),
            };
        }
        trace!(channel = self.index, state = ?self.state, "NAK, re-arming");
        self.retry(hw, target);
        ChannelEvent::Pending
    }

    /// Re-arm the current phase from the first unacknowledged byte
    fn retry(&mut self, hw: &mut dyn HostController, target: &mut TransferTarget<'_>) {
        let wait = self.state.wait();
        if wait.direction() == Direction::Out && wait != ChannelState::CtlSetupTXWait {
            let remaining = hw.channel_packets_remaining(self.index).min(self.packets);
            let acked = (self.packets - remaining) as usize * Self::max_packet(target);
            self.cursor += acked.min(self.phase_len);
            if uses_toggle(target.urb.kind()) {
                target
                    .endpoint
                    .set_toggle(Direction::Out, hw.channel_data_pid(self.index));
            }
        }
        self.arm(hw, wait, target);
    }

    fn transfer_complete(
        &mut self,
        hw: &mut dyn HostController,
        target: &mut TransferTarget<'_>,
    ) -> ChannelEvent {
        match self.state {
            ChannelState::CtlSetupTXResult => {
                let next = match target.urb.setup {
                    Some(setup) if !setup.has_data_stage() => ChannelState::CtlStatusRXWait,
                    Some(setup) if setup.direction().is_in() => ChannelState::CtlDataRXWait,
                    Some(_) => ChannelState::CtlDataTXWait,
                    None => self.defect("control transfer without setup"),
                };
                self.cursor = 0;
                debug!(channel = self.index, "SETUP done, entering {:?}", next);
                self.arm(hw, next, target);
                ChannelEvent::Pending
            }
            ChannelState::CtlDataTXResult => {
                self.cursor += self.phase_len;
                target.urb.actual = self.cursor;
                self.arm(hw, ChannelState::CtlStatusRXWait, target);
                ChannelEvent::Pending
            }
            ChannelState::CtlDataRXWait => {
                self.arm(hw, ChannelState::CtlStatusTXWait, target);
                ChannelEvent::Pending
            }
            ChannelState::CtlStatusRXWait | ChannelState::CtlStatusTXResult => {
                self.finish(UrbStatus::Ok)
            }
            ChannelState::TXResult => {
                self.cursor += self.phase_len;
                target.urb.actual = self.cursor;
                if uses_toggle(target.urb.kind()) {
                    target
                        .endpoint
                        .set_toggle(Direction::Out, hw.channel_data_pid(self.index));
                }
                self.finish(UrbStatus::Ok)
            }
            ChannelState::RXWait => self.finish(UrbStatus::Ok),
            _ => self.defect("transfer complete"),
        }
    }

    fn finish(&mut self, status: UrbStatus) -> ChannelEvent {
        self.state = ChannelState::Unused;
        match self.urb.take() {
            Some(id) => ChannelEvent::Completed(id, status),
            None => self.defect("completion without a URB"),
        }
    }

    fn fail(&mut self, hw: &mut dyn HostController, status: UrbStatus) -> ChannelEvent {
        warn!(channel = self.index, state = ?self.state, %status, "Transfer failed");
        hw.disable_channel(self.index);
        self.state = ChannelState::Halting;
        match self.urb.take() {
            Some(id) => ChannelEvent::Completed(id, status),
            None => self.defect("failure without a URB"),
        }
    }

    fn defect(&self, what: &str) -> ! {
        error!(channel = self.index, state = ?self.state, "{} in illegal channel state", what);
        panic!(
            "channel {} got {} in state {:?}",
            self.index, what, self.state
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceId;
    use crate::hal::mock::MockController;
    use crate::urb::{Completion, EndpointRef};
    use protocol::{EndpointDescriptor, SetupPacket};

    const DEV: DeviceId = DeviceId(1);

    fn control_urb(setup: SetupPacket, data: Vec<u8>) -> Urb {
        Urb::control(DEV, setup, data, Completion::Device(DEV))
    }

    fn bulk_endpoint(address: u8) -> Endpoint {
        Endpoint::from_descriptor(
            &EndpointDescriptor {
                address,
                attributes: 0x02,
                max_packet_size: 64,
                interval: 0,
            },
            0,
        )
    }

    fn target<'a>(urb: &'a mut Urb, endpoint: &'a mut Endpoint) -> TransferTarget<'a> {
        TransferTarget {
            urb,
            endpoint,
            device_address: 3,
            speed: DeviceSpeed::Full,
        }
    }

    fn ints(bits: u32) -> ChannelInterrupts {
        ChannelInterrupts(bits)
    }

    #[test]
    fn test_control_in_phase_sequence() {
        let mut hw = MockController::new(1);
        let mut urb = control_urb(SetupPacket::get_device_descriptor(18), Vec::new());
        let mut ep0 = Endpoint::control(64);
        let mut ch = Channel::new(0);

        ch.setup_for_urb(&mut hw, UrbId(1), &mut target(&mut urb, &mut ep0));
        assert_eq!(ch.state(), ChannelState::CtlSetupTXResult);
        assert_eq!(hw.last_started().pid, ChannelPid::Setup);
        assert_eq!(hw.written[0].1.len(), 8);

        let ev = ch.interrupt(&mut hw, Some(&mut target(&mut urb, &mut ep0)), ints(ChannelInterrupts::XFRC));
        assert_eq!(ev, ChannelEvent::Pending);
        assert_eq!(ch.state(), ChannelState::CtlDataRXWait);
        assert_eq!(hw.last_started().direction, Direction::In);
        assert_eq!(hw.last_started().pid, ChannelPid::Data1);
        assert_eq!(hw.last_started().transfer_len, 64);

        let descriptor: Vec<u8> = (0..18).collect();
        hw.push_rx_bytes(&descriptor);
        ch.rx_data(&mut hw, &mut target(&mut urb, &mut ep0), 18, DataPid::Data1);
        ch.interrupt(&mut hw, Some(&mut target(&mut urb, &mut ep0)), ints(ChannelInterrupts::XFRC));
        assert_eq!(ch.state(), ChannelState::CtlStatusTXResult);
        assert_eq!(hw.last_started().direction, Direction::Out);
        assert_eq!(hw.last_started().transfer_len, 0);

        let ev = ch.interrupt(&mut hw, Some(&mut target(&mut urb, &mut ep0)), ints(ChannelInterrupts::XFRC));
        assert_eq!(ev, ChannelEvent::Completed(UrbId(1), UrbStatus::Ok));
        assert!(ch.is_free());
        assert_eq!(urb.data(), descriptor.as_slice());
    }

    #[test]
    fn test_control_no_data_goes_straight_to_status_in() {
        let mut hw = MockController::new(1);
        let mut urb = control_urb(SetupPacket::set_address(4), Vec::new());
        let mut ep0 = Endpoint::control(8);
        let mut ch = Channel::new(0);

        ch.setup_for_urb(&mut hw, UrbId(7), &mut target(&mut urb, &mut ep0));
        ch.interrupt(&mut hw, Some(&mut target(&mut urb, &mut ep0)), ints(ChannelInterrupts::XFRC));
        assert_eq!(ch.state(), ChannelState::CtlStatusRXWait);
        assert_eq!(hw.last_started().direction, Direction::In);

        let ev = ch.interrupt(&mut hw, Some(&mut target(&mut urb, &mut ep0)), ints(ChannelInterrupts::XFRC));
        assert_eq!(ev, ChannelEvent::Completed(UrbId(7), UrbStatus::Ok));
        assert_eq!(hw.started.len(), 2);
    }

    #[test]
    fn test_control_out_data_then_status_in() {
        let mut hw = MockController::new(1);
        let setup = SetupPacket::new(0x21, 0x09, 0x0200, 0, 3);
        let mut urb = control_urb(setup, vec![1, 2, 3]);
        let mut ep0 = Endpoint::control(8);
        let mut ch = Channel::new(0);

        ch.setup_for_urb(&mut hw, UrbId(2), &mut target(&mut urb, &mut ep0));
        ch.interrupt(&mut hw, Some(&mut target(&mut urb, &mut ep0)), ints(ChannelInterrupts::XFRC));
        assert_eq!(ch.state(), ChannelState::CtlDataTXResult);
        assert_eq!(hw.written.last().unwrap().1, vec![1, 2, 3]);
        assert_eq!(hw.last_started().pid, ChannelPid::Data1);

        ch.interrupt(&mut hw, Some(&mut target(&mut urb, &mut ep0)), ints(ChannelInterrupts::XFRC));
        assert_eq!(ch.state(), ChannelState::CtlStatusRXWait);
        let ev = ch.interrupt(&mut hw, Some(&mut target(&mut urb, &mut ep0)), ints(ChannelInterrupts::XFRC));
        assert_eq!(ev, ChannelEvent::Completed(UrbId(2), UrbStatus::Ok));
        assert_eq!(urb.actual, 3);
    }

    #[test]
    fn test_tx_waits_for_fifo_space() {
        let mut hw = MockController::new(1);
        hw.fifo_space = 0;
        let mut urb = Urb::transfer_out(
            EndpointRef { device: DEV, address: 0x02 },
            vec![0xaa; 100],
            Completion::Device(DEV),
        );
        let mut ep = bulk_endpoint(0x02);
        let mut ch = Channel::new(0);

        ch.setup_for_urb(&mut hw, UrbId(3), &mut target(&mut urb, &mut ep));
        assert_eq!(ch.state(), ChannelState::TXWait);
        assert!(ch.waiting_for_fifo(TxQueue::NonPeriodic));
        assert!(hw.written.is_empty());

        hw.fifo_space = 1024;
        assert!(ch.tx_possible(&mut hw, &target(&mut urb, &mut ep)));
        assert_eq!(hw.written[0].1.len(), 64);
        assert!(!ch.tx_possible(&mut hw, &target(&mut urb, &mut ep)));
        assert_eq!(hw.written[1].1.len(), 36);
        assert_eq!(ch.state(), ChannelState::TXResult);

        hw.data_pid = DataPid::Data0;
        let ev = ch.interrupt(&mut hw, Some(&mut target(&mut urb, &mut ep)), ints(ChannelInterrupts::XFRC));
        assert_eq!(ev, ChannelEvent::Completed(UrbId(3), UrbStatus::Ok));
        assert_eq!(urb.actual, 100);
    }

    #[test]
    fn test_bulk_out_nak_resumes_after_acked_packets() {
        let mut hw = MockController::new(1);
        let data: Vec<u8> = (0..128u8).collect();
        let mut urb = Urb::transfer_out(
            EndpointRef { device: DEV, address: 0x02 },
            data.clone(),
            Completion::Device(DEV),
        );
        let mut ep = bulk_endpoint(0x02);
        let mut ch = Channel::new(0);

        ch.setup_for_urb(&mut hw, UrbId(4), &mut target(&mut urb, &mut ep));
        ch.tx_possible(&mut hw, &target(&mut urb, &mut ep));
        assert_eq!(ch.state(), ChannelState::TXResult);

        // First packet acknowledged, second NAKed
        hw.packets_remaining = 1;
        hw.data_pid = DataPid::Data1;
        hw.written.clear();
        let ev = ch.interrupt(&mut hw, Some(&mut target(&mut urb, &mut ep)), ints(ChannelInterrupts::NAK));
        assert_eq!(ev, ChannelEvent::Pending);
        assert_eq!(ep.toggle(Direction::Out), DataPid::Data1);
        assert_eq!(hw.last_started().pid, ChannelPid::Data1);
        assert_eq!(hw.last_started().transfer_len, 64);
        assert_eq!(hw.written[0].1, data[64..].to_vec());
    }

    #[test]
    fn test_periodic_nak_defers_and_releases() {
        let mut hw = MockController::new(1);
        let mut urb = Urb::transfer_in(
            EndpointRef { device: DEV, address: 0x81 },
            8,
            Completion::Device(DEV),
        );
        urb.kind = TransferKind::Interrupt;
        let mut ep = Endpoint::from_descriptor(
            &EndpointDescriptor {
                address: 0x81,
                attributes: 0x03,
                max_packet_size: 8,
                interval: 10,
            },
            0,
        );
        let mut ch = Channel::new(0);

        ch.setup_for_urb(&mut hw, UrbId(5), &mut target(&mut urb, &mut ep));
        assert_eq!(ch.state(), ChannelState::RXWait);
        let ev = ch.interrupt(&mut hw, Some(&mut target(&mut urb, &mut ep)), ints(ChannelInterrupts::NAK));
        assert_eq!(ev, ChannelEvent::Deferred(UrbId(5)));
        assert_eq!(ch.state(), ChannelState::Halting);
        assert_eq!(ch.urb(), None);
        assert_eq!(hw.disabled, vec![0]);

        assert_eq!(ch.interrupt(&mut hw, None, ints(ChannelInterrupts::CHH)), ChannelEvent::Halted);
        assert!(ch.is_free());
    }

    #[test]
    fn test_stall_waits_for_halt() {
        let mut hw = MockController::new(1);
        let mut urb = control_urb(SetupPacket::get_device_descriptor(8), Vec::new());
        let mut ep0 = Endpoint::control(8);
        let mut ch = Channel::new(0);

        ch.setup_for_urb(&mut hw, UrbId(6), &mut target(&mut urb, &mut ep0));
        ch.interrupt(&mut hw, Some(&mut target(&mut urb, &mut ep0)), ints(ChannelInterrupts::XFRC));
        let ev = ch.interrupt(&mut hw, Some(&mut target(&mut urb, &mut ep0)), ints(ChannelInterrupts::STALL));
        assert_eq!(ev, ChannelEvent::Completed(UrbId(6), UrbStatus::Stall));
        assert_eq!(ch.state(), ChannelState::Halting);
        assert!(!ch.is_free());

        // A late XFRC while halting is swallowed
        assert_eq!(ch.interrupt(&mut hw, None, ints(ChannelInterrupts::XFRC)), ChannelEvent::Pending);
        assert_eq!(ch.interrupt(&mut hw, None, ints(ChannelInterrupts::CHH)), ChannelEvent::Halted);
        assert!(ch.is_free());
    }

    #[test]
    fn test_transaction_errors_retry_then_fail() {
        let mut hw = MockController::new(1);
        let mut urb = Urb::transfer_in(
            EndpointRef { device: DEV, address: 0x82 },
            64,
            Completion::Device(DEV),
        );
        let mut ep = bulk_endpoint(0x82);
        let mut ch = Channel::new(0);

        ch.setup_for_urb(&mut hw, UrbId(8), &mut target(&mut urb, &mut ep));
        for _ in 1..MAX_TRANSACTION_ERRORS {
            let ev = ch.interrupt(&mut hw, Some(&mut target(&mut urb, &mut ep)), ints(ChannelInterrupts::TXERR));
            assert_eq!(ev, ChannelEvent::Pending);
        }
        let ev = ch.interrupt(&mut hw, Some(&mut target(&mut urb, &mut ep)), ints(ChannelInterrupts::TXERR));
        assert_eq!(ev, ChannelEvent::Completed(UrbId(8), UrbStatus::TransactionError));
    }

    #[test]
    fn test_rx_updates_toggle_from_observed_pid() {
        let mut hw = MockController::new(1);
        let mut urb = Urb::transfer_in(
            EndpointRef { device: DEV, address: 0x82 },
            64,
            Completion::Device(DEV),
        );
        let mut ep = bulk_endpoint(0x82);
        let mut ch = Channel::new(0);

        ch.setup_for_urb(&mut hw, UrbId(9), &mut target(&mut urb, &mut ep));
        hw.push_rx_bytes(&[9, 8, 7, 6, 5]);
        ch.rx_data(&mut hw, &mut target(&mut urb, &mut ep), 5, DataPid::Data0);
        assert_eq!(ep.toggle(Direction::In), DataPid::Data1);
        assert_eq!(urb.data(), &[9, 8, 7, 6, 5]);
    }

    #[test]
    fn test_abort_suppresses_events() {
        let mut hw = MockController::new(1);
        let mut urb = control_urb(SetupPacket::get_device_descriptor(18), Vec::new());
        let mut ep0 = Endpoint::control(64);
        let mut ch = Channel::new(0);

        ch.setup_for_urb(&mut hw, UrbId(10), &mut target(&mut urb, &mut ep0));
        ch.abort(&mut hw);
        assert_eq!(ch.state(), ChannelState::Halting);
        assert_eq!(ch.urb(), None);
        assert_eq!(
            ch.interrupt(&mut hw, None, ints(ChannelInterrupts::XFRC | ChannelInterrupts::CHH)),
            ChannelEvent::Halted
        );
    }

    #[test]
    #[should_panic(expected = "channel 0 got interrupt")]
    fn test_interrupt_on_unused_channel_is_a_defect() {
        let mut hw = MockController::new(1);
        let mut ch = Channel::new(0);
        ch.interrupt(&mut hw, None, ints(ChannelInterrupts::XFRC));
    }
}
