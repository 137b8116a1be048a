//! Host-driven tick counter with timer deadlines.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

/// A timer-driven interrupt that becomes pending once the counter reaches `at_tick`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Deadline {
    pub at_tick: u64,
    /// Insertion order; breaks ties so equal deadlines fire FIFO.
    pub seq: u64,
    pub vector: u8,
}

/// The core's only notion of time. Each step advances it by one tick; the
/// host may advance it further to model idle time.
#[derive(Debug, Clone, Default)]
pub struct TimeSource {
    ticks: u64,
    next_seq: u64,
    deadlines: BinaryHeap<Reverse<Deadline>>,
}

impl TimeSource {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Overwrite the counter (WRMSR to the TSC). Deadlines keep their absolute ticks.
    pub fn set_ticks(&mut self, ticks: u64) {
        self.ticks = ticks;
    }

    pub fn schedule_interrupt(&mut self, at_tick: u64, vector: u8) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.deadlines.push(Reverse(Deadline {
            at_tick,
            seq,
            vector,
        }));
    }

    /// Advance by `ticks` and return the vectors that became due, earliest first.
    pub fn advance(&mut self, ticks: u64) -> Vec<u8> {
        self.ticks = self.ticks.wrapping_add(ticks);
        let mut due = Vec::new();
        while let Some(Reverse(next)) = self.deadlines.peek() {
            if next.at_tick > self.ticks {
                break;
            }
            due.push(next.vector);
            self.deadlines.pop();
        }
        due
    }

    pub fn pending_deadlines(&self) -> usize {
        self.deadlines.len()
    }

    /// Deadlines in firing order.
    pub fn deadlines(&self) -> Vec<Deadline> {
        let mut all: Vec<Deadline> = self.deadlines.iter().map(|Reverse(d)| *d).collect();
        all.sort_unstable();
        all
    }

    /// Rebuild from saved state.
    pub fn restore(ticks: u64, next_seq: u64, deadlines: impl IntoIterator<Item = Deadline>) -> Self {
        Self {
            ticks,
            next_seq,
            deadlines: deadlines.into_iter().map(Reverse).collect(),
        }
    }

    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }
}

#[cfg(test)]
mod tests {
    use super::TimeSource;

    #[test]
    fn deadlines_fire_in_order_once_due() {
        let mut time = TimeSource::new();
        time.schedule_interrupt(10, 0x21);
        time.schedule_interrupt(5, 0x20);
        time.schedule_interrupt(10, 0x22);

        assert!(time.advance(4).is_empty());
        assert_eq!(time.advance(1), vec![0x20]);
        assert_eq!(time.advance(100), vec![0x21, 0x22]);
        assert_eq!(time.ticks(), 105);
        assert_eq!(time.pending_deadlines(), 0);
    }

    #[test]
    fn restore_preserves_order() {
        let mut time = TimeSource::new();
        time.schedule_interrupt(3, 1);
        time.schedule_interrupt(3, 2);
        let mut copy = TimeSource::restore(time.ticks(), time.next_seq(), time.deadlines());
        assert_eq!(copy.advance(3), vec![1, 2]);
    }
}
