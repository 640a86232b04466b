//! End-of-run summary

use crate::bus::BusStats;
use crate::simulation::Simulation;
use common::StatsSnapshot;
use host::{Attachment, Device};
use protocol::DeviceSpeed;
use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Serialize)]
pub struct DeviceReport {
    pub id: u32,
    pub address: u8,
    pub state: &'static str,
    pub speed: DeviceSpeed,
    /// "root" or "hub <id> port <n>"
    pub attachment: String,
    pub vendor_id: Option<u16>,
    pub product_id: Option<u16>,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub configuration: Option<u8>,
    pub hub_ports: Option<u8>,
}

impl DeviceReport {
    fn new(device: &Device) -> Self {
        let attachment = match device.parent() {
            Attachment::RootPort => "root".to_string(),
            Attachment::HubPort { hub, port } => format!("hub {} port {}", hub.0, port),
        };
        Self {
            id: device.id().0,
            address: device.address(),
            state: device.state().as_str(),
            speed: device.speed(),
            attachment,
            vendor_id: device.descriptor().map(|d| d.vendor_id),
            product_id: device.descriptor().map(|d| d.product_id),
            manufacturer: device.manufacturer().map(str::to_string),
            product: device.product().map(str::to_string),
            configuration: device.active_configuration().map(|c| c.value()),
            hub_ports: device.hub().and_then(|h| h.descriptor()).map(|d| d.num_ports),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SimReport {
    pub frames: u64,
    pub devices: Vec<DeviceReport>,
    pub host: StatsSnapshot,
    pub bus: BusStats,
    pub keyboard_reports: usize,
    pub interrupt_storms: u64,
}

impl SimReport {
    pub fn collect(sim: &Simulation, keyboard_reports: usize) -> Self {
        let mut devices: Vec<DeviceReport> = sim.host().devices().map(DeviceReport::new).collect();
        devices.sort_by_key(|d| d.id);
        Self {
            frames: sim.host().current_frame(),
            devices,
            host: sim.host().stats(),
            bus: sim.bus().stats(),
            keyboard_reports,
            interrupt_storms: sim.interrupt_storms(),
        }
    }
}

impl fmt::Display for SimReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Simulated {} frames, {} device(s)", self.frames, self.devices.len())?;
        for device in &self.devices {
            write!(
                f,
                "  [{}] addr {:>3} {:<22} {:?} speed, {}",
                device.id, device.address, device.state, device.speed, device.attachment
            )?;
            if let (Some(vid), Some(pid)) = (device.vendor_id, device.product_id) {
                write!(f, " {:04x}:{:04x}", vid, pid)?;
            }
            if let Some(product) = &device.product {
                write!(f, " \"{}\"", product)?;
            }
            if let Some(ports) = device.hub_ports {
                write!(f, " hub with {} ports", ports)?;
            }
            writeln!(f)?;
        }
        writeln!(
            f,
            "URBs: {} submitted, {} completed, {} failed, {} retired",
            self.host.urbs_submitted,
            self.host.urbs_completed,
            self.host.urbs_failed,
            self.host.urbs_retired
        )?;
        writeln!(
            f,
            "Bus: {} transactions, {} NAKs, {} stalls, {} collisions",
            self.bus.transactions, self.bus.naks, self.bus.stalls, self.bus.collisions
        )?;
        write!(f, "Keyboard reports: {}", self.keyboard_reports)
    }
}
