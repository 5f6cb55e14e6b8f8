use std::fmt;

use super::hal::{Ps2Port, Timing};

/// Resend-last-byte command, asked of the keyboard after a parity fault.
pub const RESEND: u8 = 0xFE;

/// Fault tallies kept for the lifetime of one boot.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ErrorCounters {
    pub parity: u32,
    pub framing: u32,
    pub mailbox_overruns: u32,
    pub command_failures: u32,
    pub counter_resets: u32,
}

impl ErrorCounters {
    pub fn total(&self) -> u32 {
        self.parity
            .saturating_add(self.framing)
            .saturating_add(self.mailbox_overruns)
            .saturating_add(self.command_failures)
            .saturating_add(self.counter_resets)
    }
}

impl fmt::Display for ErrorCounters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "parity={} framing={} overruns={} command_failures={} counter_resets={}",
            self.parity,
            self.framing,
            self.mailbox_overruns,
            self.command_failures,
            self.counter_resets
        )
    }
}

#[derive(Debug)]
pub struct ErrorRecovery {
    guard_us: u32,
    counters: ErrorCounters,
}

impl ErrorRecovery {
    pub fn new(guard_us: u32) -> Self {
        Self {
            guard_us,
            counters: ErrorCounters::default(),
        }
    }

    pub fn counters(&self) -> ErrorCounters {
        self.counters
    }

    /// Let the rest of a broken frame go by with the edge interrupt masked,
    /// then drop the edge that latched meanwhile so the next start bit is
    /// seen cleanly.
    pub fn on_framing_fault<P: Ps2Port + ?Sized, T: Timing + ?Sized>(
        &mut self,
        port: &mut P,
        timing: &mut T,
    ) {
        port.set_edge_interrupt(false);
        timing.delay_us(self.guard_us);
        port.clear_pending_edge();
        port.set_edge_interrupt(true);
        self.counters.framing = self.counters.framing.saturating_add(1);
    }

    /// Returns the byte to send back to the keyboard.
    pub fn on_parity_fault(&mut self) -> u8 {
        self.counters.parity = self.counters.parity.saturating_add(1);
        RESEND
    }

    pub fn on_overrun(&mut self) {
        self.counters.mailbox_overruns = self.counters.mailbox_overruns.saturating_add(1);
    }

    pub fn on_counter_reset(&mut self) {
        self.counters.counter_resets = self.counters.counter_resets.saturating_add(1);
    }

    pub fn on_command_failure(&mut self) {
        self.counters.command_failures = self.counters.command_failures.saturating_add(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::bridge::hal::Level;

    #[derive(Debug, PartialEq, Eq)]
    enum Call {
        Interrupt(bool),
        Clear,
        Delay(u32),
    }

    #[derive(Default)]
    struct Recorder {
        calls: Vec<Call>,
    }

    impl Ps2Port for Recorder {
        fn poll_edge(&mut self) -> Option<Level> {
            None
        }
        fn set_clock(&mut self, _level: Level) {}
        fn set_data(&mut self, _level: Level) {}
        fn set_edge_interrupt(&mut self, enabled: bool) {
            self.calls.push(Call::Interrupt(enabled));
        }
        fn clear_pending_edge(&mut self) {
            self.calls.push(Call::Clear);
        }
    }

    impl Timing for Recorder {
        fn now_us(&self) -> u64 {
            0
        }
        fn delay_us(&mut self, us: u32) {
            self.calls.push(Call::Delay(us));
        }
    }

    #[test]
    fn test_framing_guard_sequence() {
        let mut recovery = ErrorRecovery::new(8_000);
        let mut port = Recorder::default();
        let mut timing = Recorder::default();
        recovery.on_framing_fault(&mut port, &mut timing);

        assert_eq!(
            port.calls,
            vec![Call::Interrupt(false), Call::Clear, Call::Interrupt(true)]
        );
        assert_eq!(timing.calls, vec![Call::Delay(8_000)]);
        assert_eq!(recovery.counters().framing, 1);
    }

    #[test]
    fn test_counters() {
        let mut recovery = ErrorRecovery::new(0);
        assert_eq!(recovery.on_parity_fault(), RESEND);
        recovery.on_parity_fault();
        recovery.on_overrun();
        recovery.on_counter_reset();
        recovery.on_command_failure();

        let counters = recovery.counters();
        assert_eq!(counters.parity, 2);
        assert_eq!(counters.total(), 5);
        assert_eq!(
            counters.to_string(),
            "parity=2 framing=0 overruns=1 command_failures=1 counter_resets=1"
        );
    }
}
