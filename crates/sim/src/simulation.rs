//! Frame-stepped simulation of host, bus and devices
//!
//! Every simulated millisecond runs one frame:
//!
//! 1. the bus starts a frame and raises SOF
//! 2. pending interrupts are delivered to the host
//! 3. transaction rounds run until the bus is idle or the frame is full,
//!    with interrupts delivered after each round
//! 4. timers that fell due are delivered

use crate::bus::{NodeId, SimBus, SimController};
use crate::config::DeviceSpec;
use crate::model::{FunctionDevice, SimDevice, SimHub};
use crate::timer::{SimIrq, SimTimer, TimerQueue};
use host::{HostConfig, InterruptMask, UsbHost};
use std::cell::{Ref, RefCell, RefMut};
use std::rc::Rc;
use tracing::{debug, warn};

/// Back-to-back interrupt calls before the loop gives up on a level that
/// never clears
const MAX_INTERRUPT_PASSES: usize = 256;

pub struct Simulation {
    host: UsbHost,
    bus: Rc<RefCell<SimBus>>,
    timers: Rc<RefCell<TimerQueue>>,
    irq: Rc<SimIrq>,
    storms: u64,
}

impl Simulation {
    /// Wire a host stack to `bus`; the host is not started yet
    pub fn new(config: HostConfig, bus: SimBus) -> host::Result<Self> {
        let bus = Rc::new(RefCell::new(bus));
        let timers = Rc::new(RefCell::new(TimerQueue::default()));
        let irq = Rc::new(SimIrq::default());
        let mask: Rc<dyn InterruptMask> = irq.clone();
        let host = UsbHost::new(
            config,
            Box::new(SimController::new(Rc::clone(&bus))),
            Box::new(SimTimer::new(Rc::clone(&timers))),
            mask,
        )?;
        Ok(Self {
            host,
            bus,
            timers,
            irq,
            storms: 0,
        })
    }

    pub fn host(&self) -> &UsbHost {
        &self.host
    }

    pub fn host_mut(&mut self) -> &mut UsbHost {
        &mut self.host
    }

    pub fn bus(&self) -> Ref<'_, SimBus> {
        self.bus.borrow()
    }

    pub fn bus_mut(&self) -> RefMut<'_, SimBus> {
        self.bus.borrow_mut()
    }

    pub fn irq(&self) -> &SimIrq {
        &self.irq
    }

    /// Simulated milliseconds since creation
    pub fn now_ms(&self) -> u64 {
        self.timers.borrow().now_ms()
    }

    /// Times the interrupt loop hit its pass limit
    pub fn interrupt_storms(&self) -> u64 {
        self.storms
    }

    /// Power up the root port
    pub fn start(&mut self) {
        self.host.start();
        self.service_interrupts();
    }

    pub fn run_frames(&mut self, frames: u64) {
        for _ in 0..frames {
            self.run_frame();
        }
    }

    /// Run frames until `done` holds, at most `max_frames` of them.
    /// Returns whether `done` was reached.
    pub fn run_until(&mut self, max_frames: u64, mut done: impl FnMut(&Simulation) -> bool) -> bool {
        for _ in 0..max_frames {
            if done(self) {
                return true;
            }
            self.run_frame();
        }
        done(self)
    }

    pub fn run_frame(&mut self) {
        self.bus.borrow_mut().start_frame();
        self.service_interrupts();

        loop {
            let progress = self.bus.borrow_mut().run_transactions();
            self.service_interrupts();
            if !progress {
                break;
            }
        }

        let due = self.timers.borrow_mut().advance(1);
        for event in due {
            self.host.handle_timer(event);
            self.service_interrupts();
        }
    }

    /// Deliver the controller interrupt until the core goes quiet
    fn service_interrupts(&mut self) {
        for _ in 0..MAX_INTERRUPT_PASSES {
            if !self.bus.borrow().interrupt_pending() {
                return;
            }
            self.host.handle_interrupt();
        }
        self.storms += 1;
        warn!(frame = self.bus.borrow().frame(), "Interrupt still pending after {} passes", MAX_INTERRUPT_PASSES);
    }

    pub fn plug_root(&mut self, device: Box<dyn SimDevice>) -> NodeId {
        let node = {
            let mut bus = self.bus.borrow_mut();
            let node = bus.add_device(device);
            bus.plug_root(node);
            node
        };
        self.service_interrupts();
        node
    }

    pub fn unplug_root(&mut self) -> Option<NodeId> {
        let node = self.bus.borrow_mut().unplug_root();
        self.service_interrupts();
        node
    }

    /// Plug a device into a simulated hub's port; the hub reports it on its
    /// status change endpoint
    pub fn plug_hub_port(&mut self, hub: NodeId, port: u8, device: Box<dyn SimDevice>) -> Option<NodeId> {
        let mut bus = self.bus.borrow_mut();
        let node = bus.add_device(device);
        bus.plug_hub_port(hub, port, node).then_some(node)
    }

    pub fn unplug_hub_port(&mut self, hub: NodeId, port: u8) -> Option<NodeId> {
        self.bus.borrow_mut().unplug_hub_port(hub, port)
    }

    /// Build the device tree described by `spec` behind the root port
    pub fn plug_spec(&mut self, spec: &DeviceSpec) -> NodeId {
        let root = self.plug_root(build_device(spec));
        self.plug_children(root, spec);
        root
    }

    fn plug_children(&mut self, node: NodeId, spec: &DeviceSpec) {
        let DeviceSpec::Hub { children, .. } = spec else {
            return;
        };
        for child in children {
            match self.plug_hub_port(node, child.port, build_device(&child.device)) {
                Some(child_node) => self.plug_children(child_node, &child.device),
                None => warn!(hub = node.0, port = child.port, "Port does not exist or is taken"),
            }
        }
    }
}

/// Instantiate the simulated device a spec describes
pub fn build_device(spec: &DeviceSpec) -> Box<dyn SimDevice> {
    debug!(?spec, "Building simulated device");
    match spec {
        DeviceSpec::Hub { ports, .. } => Box::new(SimHub::new(*ports)),
        DeviceSpec::Keyboard { low_speed } => Box::new(FunctionDevice::keyboard(speed(*low_speed))),
        DeviceSpec::Function {
            vendor_id,
            product_id,
            low_speed,
            manufacturer,
            product,
            configurations,
        } => {
            let descriptor = common::test_utils::create_mock_device_descriptor(*vendor_id, *product_id);
            let configurations = (1..=*configurations)
                .map(common::test_utils::create_keyboard_configuration)
                .collect();
            let mut device = FunctionDevice::new(speed(*low_speed), descriptor, configurations);
            if let (Some(manufacturer), Some(product)) = (manufacturer, product) {
                device = device.with_strings(manufacturer, product);
            }
            Box::new(device)
        }
    }
}

fn speed(low_speed: bool) -> protocol::DeviceSpeed {
    if low_speed {
        protocol::DeviceSpeed::Low
    } else {
        protocol::DeviceSpeed::Full
    }
}
