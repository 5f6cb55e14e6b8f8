//! Capabilities the bridge firmware needs from the board: the PS/2 clock and
//! data lines with their edge interrupt, the parallel host bus, a clock with
//! busy-wait delays, and the external watchdog.

/// Level of an open-collector line. `High` is the released state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Low,
    High,
}

impl Level {
    pub fn is_high(self) -> bool {
        self == Level::High
    }

    pub fn is_low(self) -> bool {
        self == Level::Low
    }

    /// Wired-AND of two drivers sharing an open-collector line.
    pub fn wired_and(self, other: Level) -> Level {
        if self.is_low() || other.is_low() {
            Level::Low
        } else {
            Level::High
        }
    }
}

impl From<bool> for Level {
    fn from(value: bool) -> Self {
        if value { Level::High } else { Level::Low }
    }
}

impl From<Level> for bool {
    fn from(level: Level) -> bool {
        level.is_high()
    }
}

/// The keyboard-side clock and data lines.
///
/// `poll_edge` is the dispatch point of the falling-edge interrupt: it hands
/// back the data level latched at the next due clock edge, and `None` when
/// no edge is pending or the interrupt is masked. Callers spin on it.
pub trait Ps2Port {
    fn poll_edge(&mut self) -> Option<Level>;
    fn set_clock(&mut self, level: Level);
    fn set_data(&mut self, level: Level);
    fn set_edge_interrupt(&mut self, enabled: bool);
    /// Drop an edge latched while the interrupt was masked.
    fn clear_pending_edge(&mut self);
}

/// Parallel output towards the host: 8 data lines, strobe, and the host
/// reset output.
pub trait HostBus {
    fn write_data(&mut self, byte: u8);
    fn set_strobe(&mut self, high: bool);
    /// `true` drives the host reset output to its active (low) level.
    fn set_host_reset(&mut self, asserted: bool);
}

/// Monotonic microsecond clock with blocking delays.
pub trait Timing {
    fn now_us(&self) -> u64;
    fn delay_us(&mut self, us: u32);
}

/// Deadline bookkeeping for the external watchdog timer. The timer itself
/// resets the device when the deadline passes without a feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Watchdog {
    timeout_us: u64,
    deadline_us: u64,
}

impl Watchdog {
    pub fn new(timeout_us: u64, now_us: u64) -> Self {
        Self {
            timeout_us,
            deadline_us: now_us.saturating_add(timeout_us),
        }
    }

    pub fn feed(&mut self, now_us: u64) {
        self.deadline_us = now_us.saturating_add(self.timeout_us);
    }

    pub fn deadline_us(&self) -> u64 {
        self.deadline_us
    }

    pub fn expired(&self, now_us: u64) -> bool {
        now_us >= self.deadline_us
    }
}
