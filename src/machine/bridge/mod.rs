//! Firmware core of the PS/2 to parallel bus bridge.

pub mod framer;
pub mod hal;
pub mod host_output;
pub mod keymap;
pub mod link;
pub mod mailbox;
pub mod recovery;
pub mod supervisor;
pub mod translator;

/// Protocol timing. All values are microseconds unless noted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BridgeConfig {
    /// How long the clock is held low before a host-to-device frame.
    pub rts_hold_us: u32,
    /// Masked interval after a framing fault.
    pub framing_guard_us: u32,
    pub strobe_us: u32,
    /// Time allowed for the keyboard to clock in a command byte.
    pub transmit_timeout_us: u64,
    /// Time allowed for the ACK after a command byte.
    pub reply_timeout_us: u64,
    /// Time allowed for the byte following an ACK (self-test, scancode set).
    pub response_timeout_us: u64,
    pub watchdog_timeout_us: u64,
    /// Sends per command before giving up.
    pub max_attempts: u8,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            rts_hold_us: 200,
            framing_guard_us: 8_000,
            strobe_us: 10,
            transmit_timeout_us: 15_000,
            reply_timeout_us: 20_000,
            response_timeout_us: 1_000_000,
            watchdog_timeout_us: 2_000_000,
            max_attempts: 3,
        }
    }
}
