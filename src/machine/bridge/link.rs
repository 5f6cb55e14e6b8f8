use tracing::{debug, info, trace, warn};

use super::BridgeConfig;
use super::framer::{BitFramer, FrameEvent, FrameFault};
use super::hal::{Level, Ps2Port, Timing, Watchdog};
use super::mailbox::Mailbox;
use super::recovery::{ErrorCounters, ErrorRecovery};

pub const ACK: u8 = 0xFA;

pub mod commands {
    pub const RESET: u8 = 0xFF;
    pub const RESEND: u8 = 0xFE;
    pub const SCANCODE_SET: u8 = 0xF0;
    pub const ECHO: u8 = 0xEE;
    pub const SET_LEDS: u8 = 0xED;
    pub const SELF_TEST_PASSED: u8 = 0xAA;
    pub const SELF_TEST_FAILED: u8 = 0xFC;
}

/// Spin interval of the mainline while it waits on the keyboard.
pub const POLL_US: u32 = 10;

/// What the keyboard is expected to answer to a command byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expect {
    Nothing,
    Ack,
    /// An ACK followed by one more byte, which is returned.
    AckThenResponse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum LinkError {
    #[error("command {command:02X} not acknowledged after {attempts} attempts (last reply {last_reply:02X?})")]
    NoAck {
        command: u8,
        attempts: u8,
        last_reply: Option<u8>,
    },
    #[error("no response after acknowledged command {command:02X}")]
    NoResponse { command: u8 },
    #[error("keyboard did not clock in {command:02X}")]
    TransmitTimeout { command: u8 },
    #[error("watchdog deadline reached")]
    WatchdogExpired,
}

/// State shared between the clock-edge handler and the mainline.
///
/// The edge handler is [`Link::dispatch_edge`]; everything else runs in the
/// mainline. Bytes cross over through the single-slot [`Mailbox`].
pub struct Link<P, T> {
    port: P,
    timing: T,
    framer: BitFramer,
    mailbox: Mailbox,
    recovery: ErrorRecovery,
    watchdog: Watchdog,
    config: BridgeConfig,
    /// Set by a parity fault, sent at the next service point.
    resend: Option<u8>,
}

impl<P: Ps2Port, T: Timing> Link<P, T> {
    pub fn new(mut port: P, timing: T, config: BridgeConfig) -> Self {
        port.set_clock(Level::High);
        port.set_data(Level::High);
        port.set_edge_interrupt(true);
        let watchdog = Watchdog::new(config.watchdog_timeout_us, timing.now_us());
        Self {
            port,
            timing,
            framer: BitFramer::new(),
            mailbox: Mailbox::default(),
            recovery: ErrorRecovery::new(config.framing_guard_us),
            watchdog,
            config,
            resend: None,
        }
    }

    pub fn into_parts(self) -> (P, T) {
        (self.port, self.timing)
    }

    pub fn port(&self) -> &P {
        &self.port
    }

    pub fn port_mut(&mut self) -> &mut P {
        &mut self.port
    }

    pub fn timing(&self) -> &T {
        &self.timing
    }

    pub fn timing_mut(&mut self) -> &mut T {
        &mut self.timing
    }

    pub fn counters(&self) -> ErrorCounters {
        self.recovery.counters()
    }

    pub fn try_recv(&mut self) -> Option<u8> {
        self.mailbox.try_recv()
    }

    /// Nothing buffered, nothing owed to the keyboard and no frame in flight.
    pub fn is_idle(&self) -> bool {
        self.framer.is_idle() && !self.mailbox.is_full() && self.resend.is_none()
    }

    pub fn feed_watchdog(&mut self) {
        self.watchdog.feed(self.timing.now_us());
    }

    /// Spin without feeding the watchdog until it bites.
    pub fn stall_until_watchdog(&mut self) {
        loop {
            let now = self.timing.now_us();
            if self.watchdog.expired(now) {
                break;
            }
            let remaining = self.watchdog.deadline_us() - now;
            self.timing.delay_us(remaining.min(u32::MAX as u64) as u32);
        }
    }

    /// Edge interrupt entry: run the framer over one pending clock edge and
    /// act on what it reports. Returns false when no edge was pending.
    pub fn dispatch_edge(&mut self) -> bool {
        let Some(level) = self.port.poll_edge() else {
            return false;
        };
        match self.framer.on_clock_edge(level, &mut self.port) {
            None => {}
            Some(FrameEvent::Received(byte)) => {
                trace!("PS2: received {byte:02X}");
                if let Err(overrun) = self.mailbox.try_send(byte) {
                    warn!("PS2: {overrun}");
                    self.recovery.on_overrun();
                }
            }
            Some(FrameEvent::Fault(fault @ FrameFault::Framing { .. })) => {
                warn!("PS2: {fault}, resynchronising");
                self.recovery.on_framing_fault(&mut self.port, &mut self.timing);
            }
            Some(FrameEvent::Fault(fault @ FrameFault::Parity { .. })) => {
                warn!("PS2: {fault}, requesting resend");
                self.resend = Some(self.recovery.on_parity_fault());
            }
            Some(FrameEvent::Transmitted { line_ack }) => {
                if line_ack {
                    trace!("PS2: frame clocked in");
                } else {
                    debug!("PS2: no line-level ack from keyboard");
                }
            }
            Some(FrameEvent::CounterReset { index }) => {
                warn!("PS2: bit counter at {index}, reset");
                self.recovery.on_counter_reset();
            }
        }
        true
    }

    fn drain_edges(&mut self) {
        while self.dispatch_edge() {}
    }

    /// Mainline service point: take in edges until a byte is waiting, then
    /// send any resend request raised by a parity fault. Returns whether
    /// anything happened.
    pub fn service(&mut self) -> Result<bool, LinkError> {
        let mut progressed = false;
        while !self.mailbox.is_full() && self.dispatch_edge() {
            progressed = true;
        }
        if self.resend.is_some() {
            self.send_resend()?;
            progressed = true;
        }
        Ok(progressed)
    }

    fn send_resend(&mut self) -> Result<(), LinkError> {
        if let Some(byte) = self.resend.take() {
            debug!("LINK: asking keyboard to resend");
            self.transmit(byte)?;
        }
        Ok(())
    }

    /// Spin until `ready` holds, servicing edges meanwhile. `Ok(false)` on
    /// timeout.
    fn wait_for(
        &mut self,
        timeout_us: u64,
        mut ready: impl FnMut(&mut Self) -> bool,
    ) -> Result<bool, LinkError> {
        let deadline = self.timing.now_us().saturating_add(timeout_us);
        loop {
            if ready(self) {
                return Ok(true);
            }
            let now = self.timing.now_us();
            if self.watchdog.expired(now) {
                warn!("LINK: watchdog deadline reached while waiting");
                return Err(LinkError::WatchdogExpired);
            }
            if now >= deadline {
                return Ok(false);
            }
            if self.dispatch_edge() {
                continue;
            }
            if self.resend.is_some() && !self.framer.is_transmitting() {
                self.send_resend()?;
                continue;
            }
            self.timing.delay_us(POLL_US);
        }
    }

    fn wait_reply(&mut self, timeout_us: u64) -> Result<Option<u8>, LinkError> {
        let mut reply = None;
        self.wait_for(timeout_us, |link| {
            reply = link.mailbox.try_recv();
            reply.is_some()
        })?;
        Ok(reply)
    }

    /// Clock one byte out to the keyboard and wait for the frame to finish.
    fn transmit(&mut self, byte: u8) -> Result<(), LinkError> {
        self.drain_edges();
        trace!("LINK: request to send {byte:02X}");

        self.port.set_edge_interrupt(false);
        self.port.set_clock(Level::Low);
        self.timing.delay_us(self.config.rts_hold_us);
        self.port.set_data(Level::Low);
        self.port.set_clock(Level::High);
        self.port.clear_pending_edge();
        self.framer.begin_transmit(byte);
        self.port.set_edge_interrupt(true);

        let done = self.wait_for(self.config.transmit_timeout_us, |link| {
            !link.framer.is_transmitting()
        });
        self.port.set_data(Level::High);
        match done {
            Ok(true) => Ok(()),
            Ok(false) => {
                warn!("LINK: keyboard did not clock in {byte:02X}");
                self.framer.reset();
                self.recovery.on_command_failure();
                Err(LinkError::TransmitTimeout { command: byte })
            }
            Err(err) => {
                self.framer.reset();
                Err(err)
            }
        }
    }

    /// Send a command byte with bounded retries.
    pub fn send_command(&mut self, command: u8, expect: Expect) -> Result<Option<u8>, LinkError> {
        let mut last_reply = None;
        for attempt in 1..=self.config.max_attempts {
            self.drain_edges();
            if let Some(stale) = self.mailbox.try_recv() {
                debug!("LINK: discarding stale {stale:02X}");
            }
            debug!("LINK: sending {command:02X} (attempt {attempt})");
            self.transmit(command)?;
            if expect == Expect::Nothing {
                return Ok(None);
            }

            match self.wait_reply(self.config.reply_timeout_us)? {
                Some(ACK) => {
                    if expect == Expect::Ack {
                        return Ok(None);
                    }
                    return match self.wait_reply(self.config.response_timeout_us)? {
                        Some(response) => {
                            debug!("LINK: {command:02X} answered {response:02X}");
                            Ok(Some(response))
                        }
                        None => {
                            warn!("LINK: no response to {command:02X}");
                            self.recovery.on_command_failure();
                            Err(LinkError::NoResponse { command })
                        }
                    };
                }
                reply => {
                    warn!("LINK: {command:02X} attempt {attempt} answered {reply:02X?}");
                    last_reply = reply;
                }
            }
        }
        self.recovery.on_command_failure();
        Err(LinkError::NoAck {
            command,
            attempts: self.config.max_attempts,
            last_reply,
        })
    }

    /// Reset the keyboard and return its self-test result.
    pub fn reset_keyboard(&mut self) -> Result<u8, LinkError> {
        info!("LINK: resetting keyboard");
        self.send_command(commands::RESET, Expect::AckThenResponse)?
            .ok_or(LinkError::NoResponse {
                command: commands::RESET,
            })
    }

    pub fn select_codeset(&mut self, set: u8) -> Result<(), LinkError> {
        self.send_command(commands::SCANCODE_SET, Expect::Ack)?;
        self.send_command(set, Expect::Ack)?;
        debug!("LINK: scancode set {set} selected");
        Ok(())
    }

    pub fn query_codeset(&mut self) -> Result<u8, LinkError> {
        self.send_command(commands::SCANCODE_SET, Expect::Ack)?;
        self.send_command(0, Expect::AckThenResponse)?
            .ok_or(LinkError::NoResponse { command: 0 })
    }

    /// Bit 0 Scroll Lock, bit 1 Num Lock, bit 2 Caps Lock.
    pub fn set_leds(&mut self, mask: u8) -> Result<(), LinkError> {
        self.send_command(commands::SET_LEDS, Expect::Ack)?;
        self.send_command(mask, Expect::Ack)?;
        debug!("LINK: LEDs set to {mask:03b}");
        Ok(())
    }

    /// True when the keyboard echoed.
    pub fn echo(&mut self) -> Result<bool, LinkError> {
        self.send_command(commands::ECHO, Expect::Nothing)?;
        Ok(self.wait_reply(self.config.reply_timeout_us)? == Some(commands::ECHO))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::generic::clock::SimClock;
    use crate::machine::generic::ps2kbd::{KeySender, SimKeyboard, SimKeyboardConfig};
    use crate::machine::generic::wire::SimWire;
    use hex_literal::hex;

    fn rig(config: SimKeyboardConfig) -> (Link<SimWire, SimClock>, KeySender) {
        let clock = SimClock::new();
        let (keyboard, keys) = SimKeyboard::new(config);
        let wire = SimWire::new(clock.clone(), keyboard);
        (Link::new(wire, clock, BridgeConfig::default()), keys)
    }

    #[test]
    fn test_led_exchange() {
        let (mut link, _keys) = rig(SimKeyboardConfig::default());
        link.set_leds(0x05).unwrap();
        assert_eq!(link.port().keyboard().received(), &hex!("ED 05"));
        assert_eq!(link.port().keyboard().leds(), 0x05);
        assert_eq!(link.port().requests_to_send(), 2);
        assert!(link.is_idle());
    }

    #[test]
    fn test_codeset_select_and_query() {
        let (mut link, _keys) = rig(SimKeyboardConfig::default());
        link.select_codeset(3).unwrap();
        assert_eq!(link.query_codeset(), Ok(3));
        link.select_codeset(2).unwrap();
        assert_eq!(link.query_codeset(), Ok(2));
    }

    #[test]
    fn test_reset_returns_self_test() {
        let (mut link, _keys) = rig(SimKeyboardConfig::default());
        assert_eq!(link.reset_keyboard(), Ok(commands::SELF_TEST_PASSED));

        let (mut link, _keys) = rig(SimKeyboardConfig {
            self_test_passes: false,
            ..Default::default()
        });
        assert_eq!(link.reset_keyboard(), Ok(commands::SELF_TEST_FAILED));
    }

    #[test]
    fn test_echo() {
        let (mut link, _keys) = rig(SimKeyboardConfig::default());
        assert_eq!(link.echo(), Ok(true));
    }

    #[test]
    fn test_corrupted_ack_is_resent_inline() {
        let (mut link, _keys) = rig(SimKeyboardConfig {
            reply_parity_fault: Some(ACK),
            ..Default::default()
        });
        assert_eq!(link.send_command(commands::SET_LEDS, Expect::Ack), Ok(None));
        assert_eq!(link.port().keyboard().received(), &hex!("ED FE"));
        assert_eq!(link.port().requests_to_send(), 2);
        assert_eq!(link.counters().parity, 1);
        assert_eq!(link.counters().command_failures, 0);

        // The keyboard is still waiting for the LED mask
        assert_eq!(link.send_command(0x02, Expect::Ack), Ok(None));
        assert_eq!(link.port().keyboard().leds(), 0x02);
    }

    #[test]
    fn test_corrupted_self_test_result_is_resent_inline() {
        let (mut link, _keys) = rig(SimKeyboardConfig {
            reply_parity_fault: Some(commands::SELF_TEST_PASSED),
            ..Default::default()
        });
        assert_eq!(link.reset_keyboard(), Ok(commands::SELF_TEST_PASSED));
        assert_eq!(link.port().keyboard().received(), &hex!("FF FE"));
        assert_eq!(link.port().requests_to_send(), 2);
        assert_eq!(link.counters().parity, 1);
        assert!(link.is_idle());
    }

    #[test]
    fn test_refused_command_retries_three_times() {
        let (mut link, _keys) = rig(SimKeyboardConfig {
            refused_commands: 3,
            ..Default::default()
        });
        assert_eq!(
            link.send_command(commands::SET_LEDS, Expect::Ack),
            Err(LinkError::NoAck {
                command: commands::SET_LEDS,
                attempts: 3,
                last_reply: Some(commands::RESEND),
            })
        );
        assert_eq!(link.port().requests_to_send(), 3);
        assert_eq!(link.counters().command_failures, 1);
    }

    #[test]
    fn test_refusals_within_retry_budget() {
        let (mut link, _keys) = rig(SimKeyboardConfig {
            refused_commands: 2,
            ..Default::default()
        });
        assert_eq!(link.send_command(commands::SET_LEDS, Expect::Ack), Ok(None));
        assert_eq!(link.port().requests_to_send(), 3);
        assert_eq!(link.counters().command_failures, 0);
    }

    #[test]
    fn test_silent_keyboard_retries_three_times() {
        let (mut link, _keys) = rig(SimKeyboardConfig {
            silent: true,
            ..Default::default()
        });
        let start = link.timing().now_us();
        assert_eq!(
            link.reset_keyboard(),
            Err(LinkError::NoAck {
                command: commands::RESET,
                attempts: 3,
                last_reply: None,
            })
        );
        assert_eq!(link.port().requests_to_send(), 3);
        assert_eq!(link.port().keyboard().received(), &hex!("FF FF FF"));
        assert!(link.timing().now_us() - start >= 3 * link.config.reply_timeout_us);
    }

    #[test]
    fn test_waits_stop_at_watchdog_deadline() {
        let clock = SimClock::new();
        let (keyboard, _keys) = SimKeyboard::new(SimKeyboardConfig {
            silent: true,
            ..Default::default()
        });
        let config = BridgeConfig {
            watchdog_timeout_us: 30_000,
            ..Default::default()
        };
        let mut link = Link::new(SimWire::new(clock.clone(), keyboard), clock, config);
        assert_eq!(link.set_leds(0), Err(LinkError::WatchdogExpired));
        // Second attempt was under way when the deadline hit
        assert_eq!(link.port().requests_to_send(), 2);
        assert!(link.watchdog.expired(link.timing.now_us()));
    }

    struct DeadPort;

    impl Ps2Port for DeadPort {
        fn poll_edge(&mut self) -> Option<Level> {
            None
        }
        fn set_clock(&mut self, _level: Level) {}
        fn set_data(&mut self, _level: Level) {}
        fn set_edge_interrupt(&mut self, _enabled: bool) {}
        fn clear_pending_edge(&mut self) {}
    }

    #[test]
    fn test_transmit_timeout() {
        let clock = SimClock::new();
        let mut link = Link::new(DeadPort, clock, BridgeConfig::default());
        assert_eq!(
            link.send_command(commands::ECHO, Expect::Nothing),
            Err(LinkError::TransmitTimeout {
                command: commands::ECHO
            })
        );
        assert!(link.is_idle());
        assert_eq!(link.counters().command_failures, 1);
    }

    #[test]
    fn test_back_to_back_frames() {
        let (mut link, keys) = rig(SimKeyboardConfig::default());
        let sent = hex!("1C F0 1C 12 32 F0 32 F0 12");
        for byte in sent {
            keys.send_raw(byte);
        }
        let mut received = vec![];
        while received.len() < sent.len() {
            link.service().unwrap();
            match link.try_recv() {
                Some(byte) => received.push(byte),
                None => link.timing_mut().delay_us(POLL_US),
            }
        }
        assert_eq!(received, sent);
        assert_eq!(link.counters().total(), 0);
    }

    #[test]
    fn test_undrained_mailbox_overruns() {
        let (mut link, keys) = rig(SimKeyboardConfig::default());
        for byte in hex!("1C F0 1C") {
            keys.send_raw(byte);
        }
        link.timing_mut().delay_us(10_000);
        while link.dispatch_edge() {}

        assert_eq!(link.counters().mailbox_overruns, 2);
        assert_eq!(link.try_recv(), Some(0x1C));
        assert_eq!(link.try_recv(), None);
    }
}
