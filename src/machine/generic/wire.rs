use tracing::trace;

use super::clock::SimClock;
use super::ps2kbd::{Outgoing, SimKeyboard};
use crate::machine::bridge::hal::{Level, Ps2Port};

/// Keyboard clock period (12.5 kHz).
pub const CLOCK_PERIOD_US: u64 = 80;
/// Shortest clock-low hold the keyboard takes as a request to send.
pub const RTS_MIN_HOLD_US: u64 = 100;

#[derive(Debug)]
enum Phase {
    Idle,
    /// Keyboard to host. `index` is the next bit to clock out.
    Sending {
        out: Outgoing,
        index: u8,
        next_us: u64,
    },
    /// Host to keyboard. `bits` holds what was sampled on each rising edge:
    /// data LSB first, then parity and stop.
    Receiving { index: u8, next_us: u64, bits: u16 },
}

/// The open-collector clock and data pair between the bridge and a
/// [`SimKeyboard`].
///
/// Edges are produced lazily against the shared [`SimClock`]: an edge is due
/// once the clock has passed its time. With the edge interrupt enabled,
/// `poll_edge` hands due edges out one at a time. While it is masked, due
/// edges are consumed as they would be on hardware: the first one latches as
/// pending and the rest are lost.
pub struct SimWire {
    clock: SimClock,
    keyboard: SimKeyboard,
    phase: Phase,
    host_clock: Level,
    host_data: Level,
    clock_low_since: u64,
    released_at: u64,
    irq_enabled: bool,
    pending: Option<Level>,
    requests_to_send: u32,
}

impl SimWire {
    pub fn new(clock: SimClock, keyboard: SimKeyboard) -> Self {
        Self {
            clock,
            keyboard,
            phase: Phase::Idle,
            host_clock: Level::High,
            host_data: Level::High,
            clock_low_since: 0,
            released_at: 0,
            irq_enabled: false,
            pending: None,
            requests_to_send: 0,
        }
    }

    pub fn keyboard(&self) -> &SimKeyboard {
        &self.keyboard
    }

    #[cfg(test)]
    pub fn keyboard_mut(&mut self) -> &mut SimKeyboard {
        &mut self.keyboard
    }

    /// Host request-to-send conditions the keyboard accepted.
    pub fn requests_to_send(&self) -> u32 {
        self.requests_to_send
    }

    /// No frame on the wire and nothing the keyboard wants to send.
    pub fn is_idle(&mut self) -> bool {
        matches!(self.phase, Phase::Idle) && self.pending.is_none() && self.keyboard.is_quiet()
    }

    fn next_edge_at(&mut self) -> Option<u64> {
        match self.phase {
            Phase::Idle => {
                if self.host_clock.is_low() || self.host_data.is_low() {
                    return None;
                }
                let at = self.keyboard.next_frame_at()?;
                Some(at.max(self.released_at))
            }
            Phase::Sending { next_us, .. } => Some(next_us),
            Phase::Receiving { next_us, .. } => Some(next_us),
        }
    }

    /// Produce the edge at `at` and return the data level latched with it.
    fn edge(&mut self, at: u64) -> Level {
        match std::mem::replace(&mut self.phase, Phase::Idle) {
            Phase::Idle => {
                let Some(out) = self.keyboard.start_frame() else {
                    return self.host_data;
                };
                trace!("PS2: keyboard sending {:02X}", out.byte);
                self.sending(out, 0, at)
            }
            Phase::Sending { out, index, .. } => self.sending(out, index, at),
            Phase::Receiving {
                index, mut bits, ..
            } => {
                if index > 0 {
                    bits |= (self.host_data.is_high() as u16) << (index - 1);
                }
                if index < 10 {
                    self.phase = Phase::Receiving {
                        index: index + 1,
                        next_us: at + CLOCK_PERIOD_US,
                        bits,
                    };
                    return self.host_data;
                }

                let byte = bits as u8;
                let parity = Level::from(bits & 0x100 != 0);
                let stop = Level::from(bits & 0x200 != 0);
                self.keyboard.receive(byte, parity, stop, at);
                // The keyboard pulls data low for one clock as the line ack
                if stop.is_high() {
                    Level::Low
                } else {
                    self.host_data
                }
            }
        }
    }

    fn sending(&mut self, out: Outgoing, index: u8, at: u64) -> Level {
        let level = out.frame[index as usize].wired_and(self.host_data);
        if index as usize == out.frame.len() - 1 {
            self.keyboard.frame_sent(out.byte, at);
        } else {
            self.phase = Phase::Sending {
                out,
                index: index + 1,
                next_us: at + CLOCK_PERIOD_US,
            };
        }
        level
    }

    /// Run the edges that went by while the interrupt was masked.
    fn catch_up(&mut self) {
        if self.irq_enabled {
            return;
        }
        let now = self.clock.now();
        while let Some(at) = self.next_edge_at() {
            if at > now {
                break;
            }
            let level = self.edge(at);
            if self.pending.is_none() {
                self.pending = Some(level);
            }
        }
    }
}

impl Ps2Port for SimWire {
    fn poll_edge(&mut self) -> Option<Level> {
        if !self.irq_enabled {
            self.catch_up();
            return None;
        }
        if let Some(level) = self.pending.take() {
            return Some(level);
        }
        let at = self.next_edge_at()?;
        (at <= self.clock.now()).then(|| self.edge(at))
    }

    fn set_clock(&mut self, level: Level) {
        self.catch_up();
        let now = self.clock.now();
        match (self.host_clock, level) {
            (Level::High, Level::Low) => {
                self.clock_low_since = now;
                match std::mem::replace(&mut self.phase, Phase::Idle) {
                    Phase::Sending { out, .. } => self.keyboard.frame_aborted(out),
                    Phase::Receiving { .. } => trace!("PS2: host abandoned its frame"),
                    Phase::Idle => {}
                }
            }
            (Level::Low, Level::High) => {
                self.released_at = now;
                let held = now - self.clock_low_since;
                if self.host_data.is_low() {
                    if held >= RTS_MIN_HOLD_US {
                        self.requests_to_send += 1;
                        self.phase = Phase::Receiving {
                            index: 0,
                            next_us: now + CLOCK_PERIOD_US,
                            bits: 0,
                        };
                    } else {
                        trace!("PS2: clock held low only {held}us, ignored");
                    }
                }
            }
            _ => {}
        }
        self.host_clock = level;
    }

    fn set_data(&mut self, level: Level) {
        self.catch_up();
        self.host_data = level;
    }

    fn set_edge_interrupt(&mut self, enabled: bool) {
        self.catch_up();
        self.irq_enabled = enabled;
    }

    fn clear_pending_edge(&mut self) {
        self.catch_up();
        self.pending = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::bridge::framer::{BitFramer, FrameEvent, encode_frame};
    use crate::machine::bridge::hal::Timing;
    use crate::machine::generic::ps2kbd::{KeySender, SimKeyboardConfig};

    fn wire() -> (SimWire, SimClock, KeySender) {
        let clock = SimClock::new();
        let (keyboard, keys) = SimKeyboard::new(SimKeyboardConfig::default());
        let mut wire = SimWire::new(clock.clone(), keyboard);
        wire.set_edge_interrupt(true);
        (wire, clock, keys)
    }

    fn levels(wire: &mut SimWire) -> Vec<Level> {
        let mut levels = vec![];
        while let Some(level) = wire.poll_edge() {
            levels.push(level);
        }
        levels
    }

    #[test]
    fn test_keyboard_frame_timing() {
        let (mut wire, clock, keys) = wire();
        keys.send_raw(0x1C);
        assert_eq!(levels(&mut wire), encode_frame(0x1C)[..1]);

        clock.advance(CLOCK_PERIOD_US * 5);
        assert_eq!(levels(&mut wire).len(), 5);
        clock.advance(CLOCK_PERIOD_US * 5);
        assert_eq!(levels(&mut wire), encode_frame(0x1C)[6..]);
        assert!(wire.is_idle());
    }

    #[test]
    fn test_masked_edges_latch_one_pending() {
        let (mut wire, clock, keys) = wire();
        keys.send_raw(0x1C);
        wire.set_edge_interrupt(false);
        clock.advance(CLOCK_PERIOD_US * 3);
        assert_eq!(wire.poll_edge(), None);
        wire.set_edge_interrupt(true);

        // Start bit latched, the three data bits after it are gone
        assert_eq!(wire.poll_edge(), Some(Level::Low));
        assert_eq!(wire.poll_edge(), None);
        clock.advance(CLOCK_PERIOD_US * 7);
        assert_eq!(levels(&mut wire).len(), 7);

        wire.set_edge_interrupt(false);
        clock.advance(1_000);
        wire.clear_pending_edge();
        wire.set_edge_interrupt(true);
        assert_eq!(wire.poll_edge(), None);
    }

    fn request_to_send(wire: &mut SimWire, clock: &SimClock, hold_us: u64) {
        wire.set_edge_interrupt(false);
        wire.set_clock(Level::Low);
        clock.advance(hold_us);
        wire.set_data(Level::Low);
        wire.set_clock(Level::High);
        wire.clear_pending_edge();
        wire.set_edge_interrupt(true);
    }

    #[test]
    fn test_short_hold_is_not_a_request() {
        let (mut wire, clock, _keys) = wire();
        request_to_send(&mut wire, &clock, 50);
        assert_eq!(wire.requests_to_send(), 0);
        clock.advance(CLOCK_PERIOD_US * 20);
        assert_eq!(wire.poll_edge(), None);
    }

    #[test]
    fn test_host_frame_clocks_in_with_line_ack() {
        let (mut wire, mut clock, _keys) = wire();
        request_to_send(&mut wire, &clock, 200);
        assert_eq!(wire.requests_to_send(), 1);

        let mut framer = BitFramer::new();
        framer.begin_transmit(0xEE);
        let mut event = None;
        while event.is_none() {
            match wire.poll_edge() {
                Some(level) => event = framer.on_clock_edge(level, &mut wire),
                None => clock.delay_us(10),
            }
        }
        wire.set_data(Level::High);
        assert_eq!(event, Some(FrameEvent::Transmitted { line_ack: true }));
        assert_eq!(wire.keyboard().received(), &[0xEE]);

        // Echo comes back after the reply delay
        clock.advance(2_000);
        let mut framer = BitFramer::new();
        let events: Vec<_> = levels(&mut wire)
            .into_iter()
            .filter_map(|level| framer.on_clock_edge(level, &mut wire))
            .collect();
        assert_eq!(events, vec![FrameEvent::Received(0xEE)]);
    }

    #[test]
    fn test_inhibit_aborts_and_resends_frame() {
        let (mut wire, clock, keys) = wire();
        keys.send_raw(0x1C);
        clock.advance(CLOCK_PERIOD_US * 4);
        assert_eq!(levels(&mut wire).len(), 5);

        // Inhibit without a request to send
        wire.set_clock(Level::Low);
        clock.advance(500);
        assert_eq!(wire.poll_edge(), None);
        wire.set_clock(Level::High);

        clock.advance(CLOCK_PERIOD_US * 10);
        assert_eq!(levels(&mut wire), encode_frame(0x1C));
    }
}
