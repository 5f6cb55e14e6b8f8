use std::{cell::Cell, rc::Rc};

use crate::machine::bridge::hal::Timing;

/// Virtual microsecond clock. Clones share the same time, so the wire and
/// the firmware see one timeline.
#[derive(Debug, Default, Clone)]
pub struct SimClock {
    now: Rc<Cell<u64>>,
}

impl SimClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn now(&self) -> u64 {
        self.now.get()
    }

    pub fn advance(&self, us: u64) {
        self.now.set(self.now.get().saturating_add(us));
    }
}

impl Timing for SimClock {
    fn now_us(&self) -> u64 {
        self.now()
    }

    fn delay_us(&mut self, us: u32) {
        self.advance(us as u64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_time() {
        let mut clock = SimClock::new();
        let other = clock.clone();
        clock.delay_us(250);
        other.advance(50);
        assert_eq!(clock.now_us(), 300);
        assert_eq!(other.now(), 300);
    }
}
