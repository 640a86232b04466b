//! Address-0 activation slot and the address pool
//!
//! Only one device on the whole bus may answer at address 0. A port takes
//! the slot before it starts a reset, hands it to the device it creates,
//! and the device gives it back once SET_ADDRESS completes. Everybody else
//! waits in arrival order.

use crate::device::DeviceId;
use std::collections::VecDeque;

/// Who asked for the activation slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActivationRequester {
    RootPort,
    HubPort { hub: DeviceId, port: u8 },
    Device(DeviceId),
}

#[derive(Debug, Default)]
pub struct Activation {
    holder: Option<ActivationRequester>,
    /// Granted to the head waiter but not yet taken
    reserved: Option<ActivationRequester>,
    waiting: VecDeque<ActivationRequester>,
}

impl Activation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn holder(&self) -> Option<ActivationRequester> {
        self.holder
    }

    pub fn is_held_by(&self, requester: ActivationRequester) -> bool {
        self.holder == Some(requester)
    }

    /// Take the slot if it is free for `requester`; otherwise join the
    /// queue (once) and return false
    pub fn try_acquire(&mut self, requester: ActivationRequester) -> bool {
        if self.holder == Some(requester) {
            return true;
        }
        let free = self.holder.is_none()
            && self.reserved.is_none_or(|reserved| reserved == requester);
        if free {
            self.holder = Some(requester);
            self.reserved = None;
            self.waiting.retain(|w| *w != requester);
            return true;
        }
        if !self.waiting.contains(&requester) {
            self.waiting.push_back(requester);
        }
        false
    }

    /// Move the slot from the port that reset a device to the device itself
    pub fn hand_over(&mut self, from: ActivationRequester, device: DeviceId) -> bool {
        if self.holder == Some(from) {
            self.holder = Some(ActivationRequester::Device(device));
            true
        } else {
            false
        }
    }

    /// Give the slot back. Returns the waiter it is now reserved for, which
    /// the caller has to wake.
    pub fn release(&mut self, requester: ActivationRequester) -> Option<ActivationRequester> {
        if self.holder != Some(requester) {
            return None;
        }
        self.holder = None;
        self.grant_next()
    }

    /// Drop every trace of `requester`: queued, reserved or holding
    pub fn cancel(&mut self, requester: ActivationRequester) -> Option<ActivationRequester> {
        self.waiting.retain(|w| *w != requester);
        if self.holder == Some(requester) {
            return self.release(requester);
        }
        if self.reserved == Some(requester) {
            self.reserved = None;
            return self.grant_next();
        }
        None
    }

    fn grant_next(&mut self) -> Option<ActivationRequester> {
        let next = self.waiting.pop_front()?;
        self.reserved = Some(next);
        Some(next)
    }

    pub fn waiting(&self) -> impl Iterator<Item = &ActivationRequester> {
        self.waiting.iter()
    }
}

/// Highest assignable device address
pub const MAX_ADDRESS: u8 = 127;

/// Device addresses 1..=127, lowest free first
#[derive(Debug, Clone)]
pub struct AddressPool {
    used: u128,
}

impl Default for AddressPool {
    fn default() -> Self {
        // Address 0 is never handed out
        Self { used: 1 }
    }
}

impl AddressPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate(&mut self) -> Option<u8> {
        let free = (!self.used).trailing_zeros();
        if free > MAX_ADDRESS as u32 {
            return None;
        }
        self.used |= 1 << free;
        Some(free as u8)
    }

    pub fn release(&mut self, address: u8) {
        if address != 0 && address <= MAX_ADDRESS {
            self.used &= !(1u128 << address);
        }
    }

    pub fn in_use(&self) -> u32 {
        self.used.count_ones() - 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: ActivationRequester = ActivationRequester::RootPort;
    const B: ActivationRequester = ActivationRequester::HubPort {
        hub: DeviceId(1),
        port: 2,
    };
    const C: ActivationRequester = ActivationRequester::HubPort {
        hub: DeviceId(1),
        port: 3,
    };

    #[test]
    fn test_single_holder() {
        let mut slot = Activation::new();
        assert!(slot.try_acquire(A));
        assert!(!slot.try_acquire(B));
        assert!(!slot.try_acquire(B));
        assert_eq!(slot.waiting().count(), 1);
        assert!(slot.is_held_by(A));
    }

    #[test]
    fn test_release_reserves_for_next_waiter() {
        let mut slot = Activation::new();
        assert!(slot.try_acquire(A));
        assert!(!slot.try_acquire(B));
        assert!(!slot.try_acquire(C));

        assert_eq!(slot.release(A), Some(B));
        // C may not jump ahead of the reserved waiter
        assert!(!slot.try_acquire(C));
        assert!(slot.try_acquire(B));
        assert_eq!(slot.release(B), Some(C));
    }

    #[test]
    fn test_hand_over_to_device() {
        let mut slot = Activation::new();
        assert!(slot.try_acquire(B));
        assert!(slot.hand_over(B, DeviceId(9)));
        assert!(slot.is_held_by(ActivationRequester::Device(DeviceId(9))));
        assert_eq!(slot.release(B), None);
        assert_eq!(slot.release(ActivationRequester::Device(DeviceId(9))), None);
        assert_eq!(slot.holder(), None);
    }

    #[test]
    fn test_cancel_reserved_passes_slot_on() {
        let mut slot = Activation::new();
        assert!(slot.try_acquire(A));
        slot.try_acquire(B);
        slot.try_acquire(C);
        assert_eq!(slot.release(A), Some(B));
        assert_eq!(slot.cancel(B), Some(C));
        assert!(slot.try_acquire(C));
    }

    #[test]
    fn test_address_pool_lowest_first() {
        let mut pool = AddressPool::new();
        assert_eq!(pool.allocate(), Some(1));
        assert_eq!(pool.allocate(), Some(2));
        assert_eq!(pool.allocate(), Some(3));
        pool.release(2);
        assert_eq!(pool.allocate(), Some(2));
        assert_eq!(pool.in_use(), 3);
    }

    #[test]
    fn test_address_pool_exhaustion() {
        let mut pool = AddressPool::new();
        for expected in 1..=MAX_ADDRESS {
            assert_eq!(pool.allocate(), Some(expected));
        }
        assert_eq!(pool.allocate(), None);
        pool.release(64);
        assert_eq!(pool.allocate(), Some(64));
    }
}
