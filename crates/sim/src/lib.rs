//! Software model of an OTG host controller core and a USB device tree
//!
//! The simulator implements the host stack's hardware traits on top of a
//! transaction-level bus model, so enumeration, hub handling and the
//! scheduler can be exercised without hardware.
//!
//! # Example
//!
//! ```
//! use host::HostConfig;
//! use protocol::DeviceSpeed;
//! use sim::{FunctionDevice, SimBus, Simulation};
//!
//! let mut sim = Simulation::new(HostConfig::default(), SimBus::new(8, 0)).unwrap();
//! sim.start();
//! sim.plug_root(Box::new(FunctionDevice::keyboard(DeviceSpeed::Low)));
//! assert!(sim.run_until(500, |s| s.host().registered_devices().count() == 1));
//! ```

pub mod bus;
pub mod config;
pub mod drivers;
pub mod model;
pub mod report;
pub mod simulation;
pub mod timer;

pub use bus::{BusStats, NodeId, SetupRecord, SimBus, SimController};
pub use config::{DeviceSpec, PortSpec, SimConfig, load_config};
pub use drivers::{KeyboardDriver, ReportLog};
pub use model::{FunctionDevice, Handshake, InResponse, SimDevice, SimHub};
pub use report::{DeviceReport, SimReport};
pub use simulation::{Simulation, build_device};
pub use timer::{SimIrq, SimTimer, TimerQueue};
