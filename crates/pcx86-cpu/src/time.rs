//! Cycle budget and timer callbacks.
//!
//! The scheduler hands the CPU a slice of cycles through a [`CycleCounter`]
//! that counts down as instructions retire (`CLOCK_CYCLES(n)`). Device timers
//! (PIT, RTC) are not threads: they register periodic callbacks in a
//! [`TimerQueue`] keyed on the time-stamp counter, and the scheduler fires the
//! due ones between instructions or blocks.

use std::fmt;

/// Decrementing cycle budget for one scheduling slice.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleCounter {
    remaining: i64,
    consumed: u64,
}

impl CycleCounter {
    pub fn new(budget: u64) -> Self {
        let mut c = Self::default();
        c.reload(budget);
        c
    }

    /// Start a new slice. Overshoot from the previous slice is forgiven.
    pub fn reload(&mut self, budget: u64) {
        self.remaining = i64::try_from(budget).unwrap_or(i64::MAX);
    }

    /// `CLOCK_CYCLES(n)`.
    #[inline]
    pub fn clock_cycles(&mut self, n: u32) {
        self.remaining -= i64::from(n);
        self.consumed += u64::from(n);
    }

    /// Cycles left in the slice; negative after an overshoot.
    #[inline]
    pub fn remaining(&self) -> i64 {
        self.remaining
    }

    #[inline]
    pub fn expired(&self) -> bool {
        self.remaining <= 0
    }

    /// Total cycles charged since creation.
    #[inline]
    pub fn consumed(&self) -> u64 {
        self.consumed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u32);

/// Timer callback. Receives the current cycle count and may return an IRQ
/// vector to assert.
pub type TimerCallback = Box<dyn FnMut(u64) -> Option<u8>>;

struct Timer {
    id: TimerId,
    period: u64,
    deadline: u64,
    callback: TimerCallback,
}

/// Periodic callbacks scheduled against the time-stamp counter.
#[derive(Default)]
pub struct TimerQueue {
    timers: Vec<Timer>,
    next_id: u32,
}

impl fmt::Debug for TimerQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerQueue")
            .field("timers", &self.timers.len())
            .field("next_deadline", &self.next_deadline())
            .finish()
    }
}

impl TimerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire `callback` every `period` cycles, first at `now + period`.
    /// A zero period is treated as one cycle.
    pub fn add_periodic(&mut self, now: u64, period: u64, callback: TimerCallback) -> TimerId {
        let id = TimerId(self.next_id);
        self.next_id = self.next_id.wrapping_add(1);
        let period = period.max(1);
        self.timers.push(Timer {
            id,
            period,
            deadline: now.saturating_add(period),
            callback,
        });
        id
    }

    pub fn remove(&mut self, id: TimerId) -> bool {
        let before = self.timers.len();
        self.timers.retain(|t| t.id != id);
        self.timers.len() != before
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }

    /// Earliest pending deadline.
    pub fn next_deadline(&self) -> Option<u64> {
        self.timers.iter().map(|t| t.deadline).min()
    }

    /// Run every callback whose deadline is at or before `now`, catching up
    /// on missed periods one call at a time. Returns the IRQ vectors raised,
    /// in firing order.
    pub fn run_due(&mut self, now: u64) -> Vec<u8> {
        let mut irqs = Vec::new();
        loop {
            let Some(timer) = self
                .timers
                .iter_mut()
                .filter(|t| t.deadline <= now)
                .min_by_key(|t| t.deadline)
            else {
                break;
            };
            let at = timer.deadline;
            timer.deadline = at.saturating_add(timer.period);
            if let Some(vector) = (timer.callback)(at) {
                irqs.push(vector);
            }
        }
        irqs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn counter_goes_negative_on_overshoot() {
        let mut c = CycleCounter::new(10);
        c.clock_cycles(4);
        assert!(!c.expired());
        c.clock_cycles(9);
        assert_eq!(c.remaining(), -3);
        assert!(c.expired());
        c.reload(5);
        assert_eq!(c.remaining(), 5);
        assert_eq!(c.consumed(), 13);
    }

    #[test]
    fn periodic_timers_catch_up_in_order() {
        let mut q = TimerQueue::new();
        let ticks = Rc::new(Cell::new(0));
        let t = ticks.clone();
        q.add_periodic(0, 100, Box::new(move |_: u64| {
            t.set(t.get() + 1);
            Some(0x08)
        }));
        q.add_periodic(0, 250, Box::new(|_: u64| Some(0x70)));

        assert!(q.run_due(99).is_empty());
        assert_eq!(q.run_due(300), vec![0x08, 0x08, 0x70, 0x08]);
        assert_eq!(ticks.get(), 3);
        assert_eq!(q.next_deadline(), Some(400));
    }

    #[test]
    fn removed_timers_stop_firing() {
        let mut q = TimerQueue::new();
        let id = q.add_periodic(0, 10, Box::new(|_: u64| Some(1)));
        assert!(q.remove(id));
        assert!(!q.remove(id));
        assert!(q.run_due(1000).is_empty());
        assert!(q.is_empty());
    }
}
