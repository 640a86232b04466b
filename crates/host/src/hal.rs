//! Hardware abstraction for the host controller core
//!
//! The stack drives a DesignWare-style OTG core in host mode: a small pool of
//! host channels, shared periodic and non-periodic TX FIFOs, one RX FIFO
//! drained 32 bits at a time, and a single root port. Platform code
//! implements [`HostController`], [`OneshotTimer`] and [`InterruptMask`];
//! the `sim` crate provides software versions of all three.

use crate::device::DeviceId;
use protocol::{DataPid, Direction, TransferKind};
use std::rc::Rc;

/// The two TX request queues of the core
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TxQueue {
    NonPeriodic,
    Periodic,
}

impl TxQueue {
    pub fn for_kind(kind: TransferKind) -> Self {
        if kind.is_periodic() {
            Self::Periodic
        } else {
            Self::NonPeriodic
        }
    }
}

/// PID programmed into a channel for the first packet of a phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelPid {
    Setup,
    Data0,
    Data1,
}

impl From<DataPid> for ChannelPid {
    fn from(pid: DataPid) -> Self {
        match pid {
            DataPid::Data0 => Self::Data0,
            DataPid::Data1 => Self::Data1,
        }
    }
}

/// Largest HCTSIZ packet count (PKTCNT is 10 bits wide)
pub const MAX_PACKET_COUNT: usize = 1023;

/// Everything written to HCCHAR/HCTSIZ before a channel is enabled
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelConfig {
    pub device_address: u8,
    pub endpoint: u8,
    pub direction: Direction,
    pub kind: TransferKind,
    pub max_packet_size: u16,
    pub low_speed: bool,
    pub pid: ChannelPid,
    pub transfer_len: usize,
    pub packet_count: u16,
    /// Periodic transfers only: run in the odd frame
    pub odd_frame: bool,
}

/// Core interrupt status (GINTSTS subset)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CoreInterrupts(pub u32);

impl CoreInterrupts {
    pub const SOF: u32 = 1 << 3;
    pub const RXFLVL: u32 = 1 << 4;
    pub const NPTXFE: u32 = 1 << 5;
    pub const PRTINT: u32 = 1 << 24;
    pub const HCINT: u32 = 1 << 25;
    pub const PTXFE: u32 = 1 << 26;

    pub fn contains(self, bit: u32) -> bool {
        self.0 & bit != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

/// Per-channel interrupt status (HCINT)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelInterrupts(pub u32);

impl ChannelInterrupts {
    pub const XFRC: u32 = 1 << 0;
    pub const CHH: u32 = 1 << 1;
    pub const STALL: u32 = 1 << 3;
    pub const NAK: u32 = 1 << 4;
    pub const ACK: u32 = 1 << 5;
    pub const TXERR: u32 = 1 << 7;
    pub const BBERR: u32 = 1 << 8;
    pub const FRMOR: u32 = 1 << 9;
    pub const DTERR: u32 = 1 << 10;

    pub fn contains(self, bit: u32) -> bool {
        self.0 & bit != 0
    }
}

/// Packet status field of a popped RX status entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxPacketStatus {
    /// An IN data packet sits in the RX FIFO
    InData,
    /// The IN transfer finished; no data attached
    InComplete,
    DataToggleError,
    ChannelHalted,
}

/// One entry popped from the RX status queue (GRXSTSP)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RxStatus {
    pub channel: usize,
    pub byte_count: usize,
    pub pid: DataPid,
    pub status: RxPacketStatus,
}

/// Root port register view (HPRT); change flags are cleared by reading
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RootPortStatus {
    pub connected: bool,
    pub enabled: bool,
    pub powered: bool,
    pub over_current: bool,
    pub low_speed: bool,
    pub connect_changed: bool,
    pub enable_changed: bool,
    pub over_current_changed: bool,
}

/// Register-level access to the host controller core
pub trait HostController {
    /// Number of host channels implemented by the core
    fn channel_count(&self) -> usize;

    /// Current (micro)frame number, HFNUM.FRNUM
    fn frame_number(&self) -> u16;

    /// Bit times left in the current frame, HFNUM.FTREM
    fn frame_remaining(&self) -> u32;

    /// Bit times in one frame, HFIR
    fn frame_interval(&self) -> u32;

    /// Read and clear the pending core interrupts
    fn core_interrupts(&mut self) -> CoreInterrupts;

    /// Bitmap of channels with pending interrupts, HAINT
    fn pending_channels(&self) -> u32;

    /// Read and clear one channel's interrupt status
    fn channel_interrupts(&mut self, channel: usize) -> ChannelInterrupts;

    /// Program and enable a channel
    fn start_channel(&mut self, channel: usize, config: &ChannelConfig);

    /// Request a channel halt; completion is signalled with CHH
    fn disable_channel(&mut self, channel: usize);

    /// PID the channel will use for its next packet, HCTSIZ.DPID
    fn channel_data_pid(&self, channel: usize) -> DataPid;

    /// Packets of the programmed transfer not yet acknowledged, HCTSIZ.PKTCNT
    fn channel_packets_remaining(&self, channel: usize) -> u16;

    /// Free space in bytes in the given TX FIFO
    fn tx_fifo_space(&self, queue: TxQueue) -> usize;

    /// Push packet bytes for `channel` into its TX FIFO
    fn write_tx_fifo(&mut self, channel: usize, data: &[u8]);

    /// Unmask or mask the FIFO-empty interrupt of a TX queue
    fn set_tx_empty_interrupt(&mut self, queue: TxQueue, enabled: bool);

    /// Pop the next RX status entry, if any
    fn pop_rx_status(&mut self) -> Option<RxStatus>;

    /// Pop one 32-bit word of packet data from the RX FIFO
    fn read_rx_word(&mut self) -> u32;

    /// Read the root port, clearing its change flags
    fn root_port(&mut self) -> RootPortStatus;

    fn set_port_power(&mut self, on: bool);

    fn set_port_reset(&mut self, asserted: bool);
}

/// Handle for a pending one-shot timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle(pub u32);

/// What a timer expiry means to the stack
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerEvent {
    /// Root port connection debounce elapsed
    RootDebounce,
    /// Root port reset has been held long enough
    RootResetDone,
    /// Hub port connection debounce elapsed
    HubDebounce { hub: DeviceId, port: u8 },
}

/// One-shot timer facility; expiry is reported through
/// [`UsbHost::handle_timer`](crate::UsbHost::handle_timer)
pub trait OneshotTimer {
    fn oneshot(&mut self, delay_ms: u32, event: TimerEvent) -> TimerHandle;

    fn cancel(&mut self, handle: TimerHandle);
}

/// Interrupt-disable primitive; the only synchronization the stack uses
pub trait InterruptMask {
    /// Disable interrupts, returning whether they were enabled
    fn save(&self) -> bool;

    /// Restore the state returned by [`save`](Self::save)
    fn restore(&self, was_enabled: bool);
}

/// Interrupts stay disabled while this guard is alive
pub struct CriticalSection {
    mask: Rc<dyn InterruptMask>,
    was_enabled: bool,
}

impl CriticalSection {
    pub fn enter(mask: &Rc<dyn InterruptMask>) -> Self {
        let was_enabled = mask.save();
        Self {
            mask: Rc::clone(mask),
            was_enabled,
        }
    }
}

impl Drop for CriticalSection {
    fn drop(&mut self) {
        self.mask.restore(self.was_enabled);
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    struct CountingMask {
        enabled: Cell<bool>,
        saves: Cell<u32>,
    }

    impl InterruptMask for CountingMask {
        fn save(&self) -> bool {
            self.saves.set(self.saves.get() + 1);
            self.enabled.replace(false)
        }

        fn restore(&self, was_enabled: bool) {
            self.enabled.set(was_enabled);
        }
    }

    #[test]
    fn test_critical_section_nests() {
        let concrete = Rc::new(CountingMask {
            enabled: Cell::new(true),
            saves: Cell::new(0),
        });
        let mask: Rc<dyn InterruptMask> = concrete.clone();
        {
            let _outer = CriticalSection::enter(&mask);
            assert!(!concrete.enabled.get());
            {
                let _inner = CriticalSection::enter(&mask);
                assert!(!concrete.enabled.get());
            }
            // Inner guard restores "disabled", not "enabled"
            assert!(!concrete.enabled.get());
        }
        assert!(concrete.enabled.get());
        assert_eq!(concrete.saves.get(), 2);
    }

    #[test]
    fn test_tx_queue_for_kind() {
        assert_eq!(TxQueue::for_kind(TransferKind::Interrupt), TxQueue::Periodic);
        assert_eq!(TxQueue::for_kind(TransferKind::Isochronous), TxQueue::Periodic);
        assert_eq!(TxQueue::for_kind(TransferKind::Bulk), TxQueue::NonPeriodic);
        assert_eq!(TxQueue::for_kind(TransferKind::Control), TxQueue::NonPeriodic);
    }
}
