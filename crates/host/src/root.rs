//! The controller's own root port
//!
//! ```text
//! Unpowered -> Disconnected -> Debouncing -> [WaitingForSlot] -> Resetting
//!           -> Enabling -> Enabled
//! ```
//!
//! Port events are handled by level: a PRTINT only tells us to look at the
//! port again, so a missed or merged change flag does no harm.

use crate::UsbHost;
use crate::activation::ActivationRequester;
use crate::device::{Attachment, DeviceId};
use crate::hal::{CriticalSection, TimerEvent, TimerHandle};
use protocol::DeviceSpeed;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RootPortState {
    Unpowered,
    Disconnected,
    Debouncing,
    WaitingForSlot,
    Resetting,
    Enabling,
    Enabled,
}

#[derive(Debug)]
pub struct RootPort {
    state: RootPortState,
    device: Option<DeviceId>,
    timer: Option<TimerHandle>,
}

impl Default for RootPort {
    fn default() -> Self {
        Self {
            state: RootPortState::Unpowered,
            device: None,
            timer: None,
        }
    }
}

impl RootPort {
    pub fn state(&self) -> RootPortState {
        self.state
    }

    pub fn device(&self) -> Option<DeviceId> {
        self.device
    }
}

impl UsbHost {
    pub(crate) fn root_power_on(&mut self) {
        if self.root.state != RootPortState::Unpowered {
            return;
        }
        self.hw.set_port_power(true);
        self.root.state = RootPortState::Disconnected;
        info!("Root port powered");
        // A device may already be plugged in
        self.root_port_interrupt();
    }

    /// PRTINT: re-read the port and move the state machine to match
    pub(crate) fn root_port_interrupt(&mut self) {
        let status = self.hw.root_port();
        debug!(?status, state = ?self.root.state, "Root port event");

        if self.root.state == RootPortState::Unpowered {
            return;
        }
        if status.over_current {
            warn!("Root port over-current, powering down");
            self.root_detach();
            self.hw.set_port_power(false);
            self.root.state = RootPortState::Unpowered;
            return;
        }
        if !status.connected {
            if self.root.state != RootPortState::Disconnected {
                info!("Root port disconnected");
                self.root_detach();
            }
            return;
        }

        match self.root.state {
            RootPortState::Disconnected => self.root_start_debounce(),
            RootPortState::Enabled if status.connect_changed => {
                // Replugged faster than we could see the disconnect
                self.root_detach();
                self.root_start_debounce();
            }
            RootPortState::Enabled if !status.enabled => {
                warn!("Root port disabled by hardware");
                self.root_detach();
                self.root_start_debounce();
            }
            RootPortState::Enabling if status.enabled => {
                let speed = if status.low_speed {
                    DeviceSpeed::Low
                } else {
                    DeviceSpeed::Full
                };
                self.root_enable(speed);
            }
            _ => {}
        }
    }

    fn root_start_debounce(&mut self) {
        let handle = self
            .timer
            .oneshot(self.config.debounce_ms, TimerEvent::RootDebounce);
        self.root.timer = Some(handle);
        self.root.state = RootPortState::Debouncing;
        debug!("Root port connection, debouncing");
    }

    /// Forget the attached device and any pending timer or slot request
    fn root_detach(&mut self) {
        if let Some(handle) = self.root.timer.take() {
            self.timer.cancel(handle);
        }
        if self.root.state == RootPortState::Resetting {
            self.hw.set_port_reset(false);
        }
        self.root.state = RootPortState::Disconnected;
        let next = {
            let _cs = CriticalSection::enter(&self.irq);
            self.activation.cancel(ActivationRequester::RootPort)
        };
        if let Some(device) = self.root.device.take() {
            self.destroy_device(device);
        }
        if let Some(next) = next {
            self.wake_activation(next);
        }
    }

    pub(crate) fn root_debounce_expired(&mut self) {
        self.root.timer = None;
        if self.root.state != RootPortState::Debouncing {
            return;
        }
        if !self.hw.root_port().connected {
            debug!("Root port connection bounced");
            self.root_detach();
            return;
        }
        let granted = {
            let _cs = CriticalSection::enter(&self.irq);
            self.activation.try_acquire(ActivationRequester::RootPort)
        };
        if granted {
            self.root_begin_reset();
        } else {
            debug!("Root port waiting for the activation slot");
            self.root.state = RootPortState::WaitingForSlot;
        }
    }

    /// The activation slot has been reserved for the root port
    pub(crate) fn root_activation_granted(&mut self) {
        let granted = {
            let _cs = CriticalSection::enter(&self.irq);
            if self.root.state == RootPortState::WaitingForSlot {
                Ok(self.activation.try_acquire(ActivationRequester::RootPort))
            } else {
                Err(self.activation.cancel(ActivationRequester::RootPort))
            }
        };
        match granted {
            Ok(true) => self.root_begin_reset(),
            Ok(false) => {}
            // No longer interested; pass the slot on
            Err(Some(next)) => self.wake_activation(next),
            Err(None) => {}
        }
    }

    fn root_begin_reset(&mut self) {
        self.hw.set_port_reset(true);
        let handle = self
            .timer
            .oneshot(self.config.port_reset_ms, TimerEvent::RootResetDone);
        self.root.timer = Some(handle);
        self.root.state = RootPortState::Resetting;
        debug!("Root port reset asserted");
    }

    pub(crate) fn root_reset_done(&mut self) {
        self.root.timer = None;
        if self.root.state != RootPortState::Resetting {
            return;
        }
        self.hw.set_port_reset(false);
        self.root.state = RootPortState::Enabling;
        debug!("Root port reset released");
        self.root_port_interrupt();
    }

    fn root_enable(&mut self, speed: DeviceSpeed) {
        let attachment = Attachment::RootPort;
        let id = self.create_device(speed, attachment);
        self.root.device = Some(id);
        self.root.state = RootPortState::Enabled;
        let handed = {
            let _cs = CriticalSection::enter(&self.irq);
            self.activation.hand_over(attachment.requester(), id)
        };
        if handed {
            self.activate(id);
        } else {
            self.queue_device_activation(id);
        }
    }

    pub fn root_port(&self) -> &RootPort {
        &self.root
    }
}
