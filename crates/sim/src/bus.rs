//! Simulated bus and controller core
//!
//! [`SimBus`] plays the part of the OTG core plus the wires: it keeps the
//! channel registers, both FIFOs and the root port, and moves packets
//! between enabled channels and the device tree one transaction at a time.
//! [`SimController`] is the register view the host stack drives.

use crate::model::{Handshake, InResponse, SimDevice};
use host::config::FULL_SPEED_FRAME_BITS;
use host::frame::transaction_bit_time;
use host::{
    ChannelConfig, ChannelInterrupts, ChannelPid, CoreInterrupts, HostController,
    RootPortStatus, RxPacketStatus, RxStatus, TxQueue,
};
use protocol::{DataPid, DeviceSpeed, Direction, SetupPacket};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use tracing::{debug, trace, warn};

/// Bytes each TX FIFO holds
pub const TX_FIFO_BYTES: usize = 2048;

/// Handle of a device in the bus arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct NodeId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Parent {
    Detached,
    Root,
    HubPort(NodeId, u8),
}

struct SimNode {
    model: Box<dyn SimDevice>,
    parent: Parent,
}

#[derive(Debug, Default)]
struct SimChannel {
    config: Option<ChannelConfig>,
    enabled: bool,
    ints: u32,
    fifo: VecDeque<Vec<u8>>,
    pid: Option<DataPid>,
    packets_remaining: u16,
    bytes_done: usize,
}

impl SimChannel {
    fn queue(&self) -> Option<TxQueue> {
        self.config.as_ref().map(|c| TxQueue::for_kind(c.kind))
    }

    fn is_periodic(&self) -> bool {
        self.config.as_ref().is_some_and(|c| c.kind.is_periodic())
    }

    /// Stop and raise `bits`; the host has to act before the next packet
    fn raise(&mut self, bits: u32) {
        self.ints |= bits;
        self.enabled = false;
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct RootPortModel {
    powered: bool,
    enabled: bool,
    resetting: bool,
    over_current: bool,
    connect_changed: bool,
    enable_changed: bool,
    over_current_changed: bool,
}

/// One SETUP packet as it crossed the bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SetupRecord {
    pub frame: u64,
    pub address: u8,
    pub setup: SetupPacket,
}

/// Bus-level counters
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BusStats {
    pub transactions: u64,
    pub naks: u64,
    pub stalls: u64,
    pub injected_naks: u64,
    pub injected_errors: u64,
    /// Transactions more than one device answered
    pub collisions: u64,
    /// Transactions nobody answered
    pub timeouts: u64,
}

pub struct SimBus {
    nodes: Vec<SimNode>,
    root: Option<NodeId>,
    port: RootPortModel,
    channels: Vec<SimChannel>,
    rx_status: VecDeque<RxStatus>,
    rx_words: VecDeque<u32>,
    sof_pending: bool,
    frame: u64,
    frame_remaining: u32,
    tx_empty_enabled: [bool; 2],
    rng: StdRng,
    nak_rate: f64,
    error_rate: f64,
    stats: BusStats,
    setups: Vec<SetupRecord>,
}

fn queue_index(queue: TxQueue) -> usize {
    match queue {
        TxQueue::NonPeriodic => 0,
        TxQueue::Periodic => 1,
    }
}

impl SimBus {
    pub fn new(channels: usize, seed: u64) -> Self {
        Self {
            nodes: Vec::new(),
            root: None,
            port: RootPortModel::default(),
            channels: (0..channels).map(|_| SimChannel::default()).collect(),
            rx_status: VecDeque::new(),
            rx_words: VecDeque::new(),
            sof_pending: false,
            frame: 0,
            frame_remaining: FULL_SPEED_FRAME_BITS,
            tx_empty_enabled: [false; 2],
            rng: StdRng::seed_from_u64(seed),
            nak_rate: 0.0,
            error_rate: 0.0,
            stats: BusStats::default(),
            setups: Vec::new(),
        }
    }

    /// Randomly NAK or corrupt data packets at the given rates
    pub fn with_fault_injection(mut self, nak_rate: f64, error_rate: f64) -> Self {
        self.nak_rate = nak_rate.clamp(0.0, 1.0);
        self.error_rate = error_rate.clamp(0.0, 1.0);
        self
    }

    /// Add a device to the arena, not yet plugged anywhere
    pub fn add_device(&mut self, model: Box<dyn SimDevice>) -> NodeId {
        self.nodes.push(SimNode {
            model,
            parent: Parent::Detached,
        });
        NodeId(self.nodes.len() - 1)
    }

    pub fn plug_root(&mut self, node: NodeId) {
        if self.root.is_some() {
            self.unplug_root();
        }
        let Some(entry) = self.nodes.get_mut(node.0) else {
            return;
        };
        entry.parent = Parent::Root;
        self.root = Some(node);
        if self.port.powered {
            self.port.connect_changed = true;
        }
        debug!(node = node.0, "Plugged into root port");
    }

    pub fn unplug_root(&mut self) -> Option<NodeId> {
        let node = self.root.take()?;
        self.nodes[node.0].parent = Parent::Detached;
        if self.port.powered {
            self.port.connect_changed = true;
        }
        if self.port.enabled {
            self.port.enabled = false;
            self.port.enable_changed = true;
        }
        debug!(node = node.0, "Unplugged from root port");
        Some(node)
    }

    pub fn plug_hub_port(&mut self, hub: NodeId, port: u8, node: NodeId) -> bool {
        let Some(speed) = self.nodes.get(node.0).map(|n| n.model.speed()) else {
            return false;
        };
        if self.child_of(hub, port).is_some() {
            return false;
        }
        let Some(model) = self.nodes.get_mut(hub.0).and_then(|n| n.model.as_hub_mut()) else {
            return false;
        };
        if port == 0 || port > model.num_ports() {
            return false;
        }
        model.attach(port, speed);
        self.nodes[node.0].parent = Parent::HubPort(hub, port);
        debug!(hub = hub.0, port, node = node.0, "Plugged into hub port");
        true
    }

    pub fn unplug_hub_port(&mut self, hub: NodeId, port: u8) -> Option<NodeId> {
        let node = self.child_of(hub, port)?;
        if let Some(model) = self.nodes[hub.0].model.as_hub_mut() {
            model.detach(port);
        }
        self.nodes[node.0].parent = Parent::Detached;
        debug!(hub = hub.0, port, node = node.0, "Unplugged from hub port");
        Some(node)
    }

    /// Raise over-current on the root port
    pub fn root_over_current(&mut self) {
        self.port.over_current = true;
        self.port.over_current_changed = true;
        self.port.enabled = false;
    }

    fn child_of(&self, hub: NodeId, port: u8) -> Option<NodeId> {
        self.nodes
            .iter()
            .position(|n| n.parent == Parent::HubPort(hub, port))
            .map(NodeId)
    }

    pub fn device(&self, node: NodeId) -> Option<&dyn SimDevice> {
        self.nodes.get(node.0).map(|n| n.model.as_ref())
    }

    pub fn device_mut(&mut self, node: NodeId) -> Option<&mut (dyn SimDevice + 'static)> {
        self.nodes.get_mut(node.0).map(|n| n.model.as_mut())
    }

    pub fn stats(&self) -> BusStats {
        self.stats
    }

    /// Every SETUP packet the bus delivered, oldest first
    pub fn setup_log(&self) -> &[SetupRecord] {
        &self.setups
    }

    pub fn frame(&self) -> u64 {
        self.frame
    }

    pub fn root_port_enabled(&self) -> bool {
        self.port.enabled
    }

    pub fn root_port_powered(&self) -> bool {
        self.port.powered
    }

    /// Whether a node can currently see bus traffic
    pub fn is_reachable(&self, node: NodeId) -> bool {
        let Some(entry) = self.nodes.get(node.0) else {
            return false;
        };
        match entry.parent {
            Parent::Detached => false,
            Parent::Root => self.port.enabled && !self.port.resetting,
            Parent::HubPort(hub, port) => {
                self.is_reachable(hub)
                    && self.nodes[hub.0]
                        .model
                        .as_hub()
                        .is_some_and(|h| h.port_enabled(port))
            }
        }
    }

    /// Reachable devices currently answering at `address`
    pub fn devices_at(&self, address: u8) -> Vec<NodeId> {
        (0..self.nodes.len())
            .map(NodeId)
            .filter(|n| self.is_reachable(*n) && self.nodes[n.0].model.address() == address)
            .collect()
    }

    /// Begin a new frame
    pub(crate) fn start_frame(&mut self) {
        self.frame += 1;
        self.frame_remaining = FULL_SPEED_FRAME_BITS;
        self.sof_pending = true;
    }

    pub(crate) fn interrupt_pending(&self) -> bool {
        !self.core_status().is_empty()
    }

    fn core_status(&self) -> CoreInterrupts {
        let mut bits = 0;
        if self.sof_pending {
            bits |= CoreInterrupts::SOF;
        }
        if !self.rx_status.is_empty() {
            bits |= CoreInterrupts::RXFLVL;
        }
        if self.channels.iter().any(|c| c.ints != 0) {
            bits |= CoreInterrupts::HCINT;
        }
        if self.port.connect_changed || self.port.enable_changed || self.port.over_current_changed
        {
            bits |= CoreInterrupts::PRTINT;
        }
        for (queue, bit) in [
            (TxQueue::NonPeriodic, CoreInterrupts::NPTXFE),
            (TxQueue::Periodic, CoreInterrupts::PTXFE),
        ] {
            if self.tx_empty_enabled[queue_index(queue)] && self.queued_bytes(queue) < TX_FIFO_BYTES / 2
            {
                bits |= bit;
            }
        }
        CoreInterrupts(bits)
    }

    fn queued_bytes(&self, queue: TxQueue) -> usize {
        self.channels
            .iter()
            .filter(|c| c.queue() == Some(queue))
            .flat_map(|c| c.fifo.iter())
            .map(Vec::len)
            .sum()
    }

    /// Run one transaction on every enabled channel that can make
    /// progress, periodic channels first. Returns whether anything moved.
    pub(crate) fn run_transactions(&mut self) -> bool {
        let mut order: Vec<usize> = (0..self.channels.len()).collect();
        order.sort_by_key(|&i| !self.channels[i].is_periodic());
        let mut progress = false;
        for index in order {
            progress |= self.transact(index);
        }
        progress
    }

    fn transact(&mut self, index: usize) -> bool {
        let channel = &self.channels[index];
        if !channel.enabled {
            return false;
        }
        let Some(config) = channel.config.clone() else {
            return false;
        };
        let speed = if config.low_speed {
            DeviceSpeed::Low
        } else {
            DeviceSpeed::Full
        };
        let mps = (config.max_packet_size as usize).max(1);

        // OUT packets need their data in the FIFO first
        let out_packet = match config.direction {
            Direction::Out => {
                let left = config.transfer_len.saturating_sub(channel.bytes_done);
                if left == 0 {
                    Some(Vec::new())
                } else {
                    match channel.fifo.front() {
                        Some(packet) => Some(packet.clone()),
                        None => return false,
                    }
                }
            }
            Direction::In => None,
        };
        let cost = transaction_bit_time(out_packet.as_ref().map_or(mps, Vec::len), speed);
        if cost > self.frame_remaining {
            return false;
        }
        self.frame_remaining -= cost;
        self.stats.transactions += 1;

        let is_setup = config.pid == ChannelPid::Setup;
        if !is_setup && self.nak_rate > 0.0 && self.rng.random_bool(self.nak_rate) {
            self.stats.injected_naks += 1;
            self.channels[index].raise(ChannelInterrupts::NAK);
            return true;
        }
        if self.error_rate > 0.0 && self.rng.random_bool(self.error_rate) {
            self.stats.injected_errors += 1;
            self.channels[index].raise(ChannelInterrupts::TXERR);
            return true;
        }

        let targets = self.devices_at(config.device_address);
        let node = match targets.as_slice() {
            [node] => *node,
            [] => {
                trace!(address = config.device_address, "No device answered");
                self.stats.timeouts += 1;
                self.channels[index].raise(ChannelInterrupts::TXERR);
                return true;
            }
            _ => {
                warn!(
                    address = config.device_address,
                    devices = targets.len(),
                    "Bus collision"
                );
                self.stats.collisions += 1;
                self.channels[index].raise(ChannelInterrupts::TXERR);
                return true;
            }
        };

        match out_packet {
            Some(packet) => self.transact_out(index, node, &config, packet),
            None => self.transact_in(index, node, &config, mps),
        }
        self.apply_hub_resets(node);
        true
    }

    fn transact_out(&mut self, index: usize, node: NodeId, config: &ChannelConfig, packet: Vec<u8>) {
        let pid = self.channels[index].pid;
        let model = &mut self.nodes[node.0].model;
        let handshake = match pid {
            None => {
                let handshake = model.setup(&packet);
                if let Ok(setup) = SetupPacket::from_bytes(&packet) {
                    self.setups.push(SetupRecord {
                        frame: self.frame,
                        address: config.device_address,
                        setup,
                    });
                }
                handshake
            }
            Some(pid) => model.data_out(config.endpoint, pid, &packet),
        };

        let channel = &mut self.channels[index];
        match handshake {
            Handshake::Ack => {
                if !packet.is_empty() {
                    channel.fifo.pop_front();
                }
                channel.bytes_done += packet.len();
                channel.packets_remaining = channel.packets_remaining.saturating_sub(1);
                channel.pid = Some(channel.pid.map_or(DataPid::Data1, DataPid::toggled));
                if channel.packets_remaining == 0 || channel.bytes_done >= config.transfer_len {
                    channel.raise(ChannelInterrupts::XFRC | ChannelInterrupts::ACK);
                }
            }
            Handshake::Nak => {
                self.stats.naks += 1;
                channel.raise(ChannelInterrupts::NAK);
            }
            Handshake::Stall => {
                self.stats.stalls += 1;
                channel.raise(ChannelInterrupts::STALL);
            }
        }
    }

    fn transact_in(&mut self, index: usize, node: NodeId, config: &ChannelConfig, mps: usize) {
        let response = self.nodes[node.0].model.data_in(config.endpoint, mps);
        let channel = &mut self.channels[index];
        match response {
            InResponse::Data(data) if data.len() > mps => {
                channel.raise(ChannelInterrupts::BBERR);
            }
            InResponse::Data(data) => {
                let pid = channel.pid.unwrap_or(DataPid::Data1);
                self.rx_status.push_back(RxStatus {
                    channel: index,
                    byte_count: data.len(),
                    pid,
                    status: RxPacketStatus::InData,
                });
                for chunk in data.chunks(4) {
                    let mut word = [0u8; 4];
                    word[..chunk.len()].copy_from_slice(chunk);
                    self.rx_words.push_back(u32::from_le_bytes(word));
                }
                channel.pid = Some(pid.toggled());
                channel.bytes_done += data.len();
                channel.packets_remaining = channel.packets_remaining.saturating_sub(1);
                if data.len() < mps || channel.packets_remaining == 0 {
                    channel.raise(ChannelInterrupts::XFRC | ChannelInterrupts::ACK);
                }
            }
            InResponse::Nak => {
                self.stats.naks += 1;
                channel.raise(ChannelInterrupts::NAK);
            }
            InResponse::Stall => {
                self.stats.stalls += 1;
                channel.raise(ChannelInterrupts::STALL);
            }
        }
    }

    /// A hub that just reset a port resets the device behind it
    fn apply_hub_resets(&mut self, node: NodeId) {
        let ports = match self.nodes[node.0].model.as_hub_mut() {
            Some(hub) => hub.take_resets(),
            None => return,
        };
        for port in ports {
            if let Some(child) = self.child_of(node, port) {
                trace!(hub = node.0, port, child = child.0, "Port reset");
                self.nodes[child.0].model.reset();
            }
        }
    }
}

/// The host stack's view of the simulated core
pub struct SimController {
    bus: Rc<RefCell<SimBus>>,
}

impl SimController {
    pub fn new(bus: Rc<RefCell<SimBus>>) -> Self {
        Self { bus }
    }
}

impl HostController for SimController {
    fn channel_count(&self) -> usize {
        self.bus.borrow().channels.len()
    }

    fn frame_number(&self) -> u16 {
        (self.bus.borrow().frame & 0x7ff) as u16
    }

    fn frame_remaining(&self) -> u32 {
        self.bus.borrow().frame_remaining
    }

    fn frame_interval(&self) -> u32 {
        FULL_SPEED_FRAME_BITS
    }

    fn core_interrupts(&mut self) -> CoreInterrupts {
        let mut bus = self.bus.borrow_mut();
        let status = bus.core_status();
        bus.sof_pending = false;
        status
    }

    fn pending_channels(&self) -> u32 {
        self.bus
            .borrow()
            .channels
            .iter()
            .enumerate()
            .filter(|(_, c)| c.ints != 0)
            .fold(0, |mask, (i, _)| mask | 1 << i)
    }

    fn channel_interrupts(&mut self, channel: usize) -> ChannelInterrupts {
        let mut bus = self.bus.borrow_mut();
        ChannelInterrupts(
            bus.channels
                .get_mut(channel)
                .map_or(0, |c| std::mem::take(&mut c.ints)),
        )
    }

    fn start_channel(&mut self, channel: usize, config: &ChannelConfig) {
        let mut bus = self.bus.borrow_mut();
        let Some(ch) = bus.channels.get_mut(channel) else {
            return;
        };
        *ch = SimChannel {
            config: Some(config.clone()),
            enabled: true,
            ints: 0,
            fifo: VecDeque::new(),
            pid: match config.pid {
                ChannelPid::Setup => None,
                ChannelPid::Data0 => Some(DataPid::Data0),
                ChannelPid::Data1 => Some(DataPid::Data1),
            },
            packets_remaining: config.packet_count,
            bytes_done: 0,
        };
    }

    fn disable_channel(&mut self, channel: usize) {
        let mut bus = self.bus.borrow_mut();
        if let Some(ch) = bus.channels.get_mut(channel) {
            ch.fifo.clear();
            ch.raise(ChannelInterrupts::CHH);
        }
    }

    fn channel_data_pid(&self, channel: usize) -> DataPid {
        self.bus
            .borrow()
            .channels
            .get(channel)
            .and_then(|c| c.pid)
            .unwrap_or(DataPid::Data0)
    }

    fn channel_packets_remaining(&self, channel: usize) -> u16 {
        self.bus
            .borrow()
            .channels
            .get(channel)
            .map_or(0, |c| c.packets_remaining)
    }

    fn tx_fifo_space(&self, queue: TxQueue) -> usize {
        TX_FIFO_BYTES.saturating_sub(self.bus.borrow().queued_bytes(queue))
    }

    fn write_tx_fifo(&mut self, channel: usize, data: &[u8]) {
        let mut bus = self.bus.borrow_mut();
        if let Some(ch) = bus.channels.get_mut(channel) {
            ch.fifo.push_back(data.to_vec());
        }
    }

    fn set_tx_empty_interrupt(&mut self, queue: TxQueue, enabled: bool) {
        self.bus.borrow_mut().tx_empty_enabled[queue_index(queue)] = enabled;
    }

    fn pop_rx_status(&mut self) -> Option<RxStatus> {
        self.bus.borrow_mut().rx_status.pop_front()
    }

    fn read_rx_word(&mut self) -> u32 {
        self.bus.borrow_mut().rx_words.pop_front().unwrap_or(0)
    }

    fn root_port(&mut self) -> RootPortStatus {
        let mut bus = self.bus.borrow_mut();
        let connected = bus.root.is_some() && bus.port.powered;
        let low_speed = bus
            .root
            .and_then(|n| bus.nodes.get(n.0))
            .is_some_and(|n| n.model.speed() == DeviceSpeed::Low);
        let port = bus.port;
        bus.port.connect_changed = false;
        bus.port.enable_changed = false;
        bus.port.over_current_changed = false;
        RootPortStatus {
            connected,
            enabled: port.enabled,
            powered: port.powered,
            over_current: port.over_current,
            low_speed,
            connect_changed: port.connect_changed,
            enable_changed: port.enable_changed,
            over_current_changed: port.over_current_changed,
        }
    }

    fn set_port_power(&mut self, on: bool) {
        let mut bus = self.bus.borrow_mut();
        bus.port.powered = on;
        if on {
            bus.port.over_current = false;
            if bus.root.is_some() {
                bus.port.connect_changed = true;
            }
        } else {
            bus.port.enabled = false;
        }
    }

    fn set_port_reset(&mut self, asserted: bool) {
        let mut bus = self.bus.borrow_mut();
        let was_resetting = bus.port.resetting;
        bus.port.resetting = asserted;
        if asserted || !was_resetting {
            return;
        }
        if let Some(node) = bus.root {
            bus.nodes[node.0].model.reset();
            bus.port.enabled = true;
            bus.port.enable_changed = true;
        }
    }
}
