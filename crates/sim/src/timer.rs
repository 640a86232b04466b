//! Millisecond timer wheel and interrupt mask for the simulation

use host::{InterruptMask, OneshotTimer, TimerEvent, TimerHandle};
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use tracing::trace;

#[derive(Debug, Clone, Copy)]
struct Pending {
    due_ms: u64,
    handle: TimerHandle,
    event: TimerEvent,
}

/// Pending one-shot timers against simulated time
#[derive(Debug, Default)]
pub struct TimerQueue {
    now_ms: u64,
    next_handle: u32,
    pending: Vec<Pending>,
}

impl TimerQueue {
    pub fn now_ms(&self) -> u64 {
        self.now_ms
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Move time forward and return the events that fell due, in due order
    pub fn advance(&mut self, ms: u64) -> Vec<TimerEvent> {
        self.now_ms += ms;
        let now = self.now_ms;
        let mut due: Vec<Pending> = Vec::new();
        self.pending.retain(|p| {
            if p.due_ms <= now {
                due.push(*p);
                false
            } else {
                true
            }
        });
        due.sort_by_key(|p| (p.due_ms, p.handle.0));
        due.into_iter().map(|p| p.event).collect()
    }
}

/// [`OneshotTimer`] backed by a shared [`TimerQueue`]
pub struct SimTimer {
    queue: Rc<RefCell<TimerQueue>>,
}

impl SimTimer {
    pub fn new(queue: Rc<RefCell<TimerQueue>>) -> Self {
        Self { queue }
    }
}

impl OneshotTimer for SimTimer {
    fn oneshot(&mut self, delay_ms: u32, event: TimerEvent) -> TimerHandle {
        let mut queue = self.queue.borrow_mut();
        queue.next_handle = queue.next_handle.wrapping_add(1);
        let handle = TimerHandle(queue.next_handle);
        let due_ms = queue.now_ms + u64::from(delay_ms);
        trace!(?event, due_ms, "Timer armed");
        queue.pending.push(Pending {
            due_ms,
            handle,
            event,
        });
        handle
    }

    fn cancel(&mut self, handle: TimerHandle) {
        self.queue.borrow_mut().pending.retain(|p| p.handle != handle);
    }
}

/// Interrupt mask that records how the stack used it
#[derive(Debug)]
pub struct SimIrq {
    enabled: Cell<bool>,
    sections: Cell<u64>,
}

impl Default for SimIrq {
    fn default() -> Self {
        Self {
            enabled: Cell::new(true),
            sections: Cell::new(0),
        }
    }
}

impl SimIrq {
    pub fn enabled(&self) -> bool {
        self.enabled.get()
    }

    /// Critical sections entered so far
    pub fn sections(&self) -> u64 {
        self.sections.get()
    }
}

impl InterruptMask for SimIrq {
    fn save(&self) -> bool {
        self.sections.set(self.sections.get() + 1);
        self.enabled.replace(false)
    }

    fn restore(&self, was_enabled: bool) {
        self.enabled.set(was_enabled);
    }
}
