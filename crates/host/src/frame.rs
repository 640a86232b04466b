//! Frame budget tracking
//!
//! Each 1ms full-speed frame carries 12000 bit times. The tracker combines
//! the hardware's live frame-remaining counter with the time already
//! promised to periodic transfers in this frame, less an end-of-frame
//! guard band. Bus time estimates follow the worst-case formulas of USB 2.0
//! section 5.11.3, expressed in full-speed bit times.

use crate::hal::HostController;
use protocol::messages::SETUP_PACKET_LEN;
use protocol::{DeviceSpeed, TransferKind};

/// Token, handshake, inter-packet gaps and host delay of one transaction
pub const TRANSACTION_OVERHEAD_BITS: u32 = 112;

/// A low-speed bit lasts eight full-speed bit times
pub const LOW_SPEED_FACTOR: u32 = 8;

/// Worst-case bus time of one transaction carrying `bytes` of payload
pub fn transaction_bit_time(bytes: usize, speed: DeviceSpeed) -> u32 {
    // 7/6 covers worst-case bit stuffing
    let data_bits = (bytes as u32 * 8 * 7).div_ceil(6);
    let bits = TRANSACTION_OVERHEAD_BITS + data_bits;
    match speed {
        DeviceSpeed::Full => bits,
        DeviceSpeed::Low => bits * LOW_SPEED_FACTOR,
    }
}

/// Worst-case time a URB can take out of the current frame: one packet of
/// its remaining data, plus the SETUP transaction for control transfers
pub fn urb_bit_time(
    kind: TransferKind,
    remaining: usize,
    max_packet_size: u16,
    speed: DeviceSpeed,
) -> u32 {
    let packet = remaining.min(max_packet_size as usize);
    let mut bits = transaction_bit_time(packet, speed);
    if kind == TransferKind::Control {
        bits += transaction_bit_time(SETUP_PACKET_LEN, speed);
    }
    bits
}

/// Software frame counter plus the time reserved in the current frame
#[derive(Debug, Clone)]
pub struct FrameBudget {
    frame: u64,
    reserved: u32,
    guard_band: u32,
}

impl FrameBudget {
    pub fn new(guard_band: u32) -> Self {
        Self {
            frame: 0,
            reserved: 0,
            guard_band,
        }
    }

    /// Frames seen since the host started
    pub fn current_frame(&self) -> u64 {
        self.frame
    }

    /// Bit times still available to new work in this frame
    pub fn remaining(&self, hw: &dyn HostController) -> u32 {
        hw.frame_remaining()
            .saturating_sub(self.reserved)
            .saturating_sub(self.guard_band)
    }

    /// Whether a transfer costing `bits` can still start this frame
    pub fn admits(&self, hw: &dyn HostController, bits: u32) -> bool {
        self.remaining(hw) > bits
    }

    /// Promise `bits` of this frame to a periodic transfer
    pub fn reserve(&mut self, bits: u32) {
        self.reserved = self.reserved.saturating_add(bits);
    }

    pub fn reserved(&self) -> u32 {
        self.reserved
    }

    /// Advance to the next frame, dropping all reservations
    pub fn start_of_frame(&mut self) -> u64 {
        self.frame += 1;
        self.reserved = 0;
        self.frame
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::mock::MockController;
    use proptest::prelude::*;

    #[test]
    fn test_transaction_bit_time() {
        assert_eq!(transaction_bit_time(0, DeviceSpeed::Full), 112);
        // 64 bytes: 512 bits stuffed to 598
        assert_eq!(transaction_bit_time(64, DeviceSpeed::Full), 112 + 598);
        assert_eq!(
            transaction_bit_time(8, DeviceSpeed::Low),
            transaction_bit_time(8, DeviceSpeed::Full) * 8
        );
    }

    #[test]
    fn test_control_adds_setup_transaction() {
        let bulk = urb_bit_time(TransferKind::Bulk, 18, 64, DeviceSpeed::Full);
        let control = urb_bit_time(TransferKind::Control, 18, 64, DeviceSpeed::Full);
        assert_eq!(control - bulk, transaction_bit_time(8, DeviceSpeed::Full));
    }

    #[test]
    fn test_cost_capped_at_one_packet() {
        assert_eq!(
            urb_bit_time(TransferKind::Bulk, 4096, 64, DeviceSpeed::Full),
            urb_bit_time(TransferKind::Bulk, 64, 64, DeviceSpeed::Full)
        );
    }

    #[test]
    fn test_remaining_clamps_to_zero() {
        let mut hw = MockController::new(1);
        hw.remaining = 500;
        let mut budget = FrameBudget::new(1200);
        assert_eq!(budget.remaining(&hw), 0);
        budget.reserve(u32::MAX);
        assert_eq!(budget.remaining(&hw), 0);
        assert!(!budget.admits(&hw, 0));
    }

    #[test]
    fn test_start_of_frame_resets_reservations() {
        let hw = MockController::new(1);
        let mut budget = FrameBudget::new(1200);
        budget.reserve(3000);
        assert_eq!(budget.remaining(&hw), 7800);
        assert_eq!(budget.start_of_frame(), 1);
        assert_eq!(budget.remaining(&hw), 10_800);
    }

    proptest! {
        #[test]
        fn prop_remaining_non_increasing_within_frame(
            steps in prop::collection::vec((0u32..2000, 0u32..3000), 1..40),
            guard in 0u32..2000,
        ) {
            let mut hw = MockController::new(1);
            let mut budget = FrameBudget::new(guard);
            let maximum = budget.remaining(&hw);
            let mut last = maximum;
            for (elapsed, reservation) in steps {
                hw.remaining = hw.remaining.saturating_sub(elapsed);
                budget.reserve(reservation);
                let now = budget.remaining(&hw);
                prop_assert!(now <= last);
                last = now;
            }
            hw.remaining = 12_000;
            budget.start_of_frame();
            prop_assert_eq!(budget.remaining(&hw), maximum);
        }
    }
}
