use std::collections::VecDeque;
use std::sync::mpsc;

use tracing::{debug, trace, warn};

use crate::machine::bridge::framer::{FRAME_BITS, encode_frame, odd_parity_bit};
use crate::machine::bridge::hal::Level;
use crate::machine::bridge::keymap::{self, PAUSE_SEQUENCE, keycodes};
use crate::machine::bridge::link::{ACK, commands};

const KEYBOARD_ID: [u8; 2] = [0xAB, 0x83];

/// Commands sent from the host to the keyboard
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ps2Command {
    /// Bit 0 Scroll Lock, bit 1 Num Lock, bit 2 Caps Lock
    SetLeds(u8),
    Echo,
    /// 0 queries the current set
    ScancodeSet(u8),
    Identify,
    SetTypematic(u8),
    EnableScanning,
    DisableScanning,
    SetDefaults,
    Resend,
    Reset,
    Unknown(u8),
}

impl Ps2Command {
    /// Returns the number of bytes this command occupies
    pub fn len(&self) -> usize {
        match self {
            Ps2Command::SetLeds(_) => 2,
            Ps2Command::ScancodeSet(_) => 2,
            Ps2Command::SetTypematic(_) => 2,
            Ps2Command::Echo
            | Ps2Command::Identify
            | Ps2Command::EnableScanning
            | Ps2Command::DisableScanning
            | Ps2Command::SetDefaults
            | Ps2Command::Resend
            | Ps2Command::Reset
            | Ps2Command::Unknown(_) => 1,
        }
    }
}

impl TryFrom<&VecDeque<u8>> for Ps2Command {
    type Error = ();

    fn try_from(value: &VecDeque<u8>) -> Result<Self, Self::Error> {
        let Some(&byte0) = value.front() else {
            return Err(());
        };
        let argument = || value.get(1).copied().ok_or(());

        Ok(match byte0 {
            0xED => Ps2Command::SetLeds(argument()?),
            0xEE => Ps2Command::Echo,
            0xF0 => Ps2Command::ScancodeSet(argument()?),
            0xF2 => Ps2Command::Identify,
            0xF3 => Ps2Command::SetTypematic(argument()?),
            0xF4 => Ps2Command::EnableScanning,
            0xF5 => Ps2Command::DisableScanning,
            0xF6 => Ps2Command::SetDefaults,
            0xFE => Ps2Command::Resend,
            0xFF => Ps2Command::Reset,
            other => Ps2Command::Unknown(other),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimKeyboardConfig {
    /// Delay between the end of a host command and the keyboard's answer.
    pub reply_delay_us: u64,
    /// Idle time between consecutive frames from the keyboard.
    pub byte_gap_us: u64,
    /// Time from the reset command to the self-test result.
    pub self_test_us: u64,
    pub self_test_passes: bool,
    /// Scancode frames to send with a wrong parity bit.
    pub parity_faults: u32,
    /// Scancode frames to send with a low stop bit.
    pub framing_faults: u32,
    /// Reply byte whose next frame goes out with a wrong parity bit.
    pub reply_parity_fault: Option<u8>,
    /// Host bytes to answer with a resend request instead of executing.
    pub refused_commands: u32,
    /// Clock host bytes in but never answer.
    pub silent: bool,
}

impl Default for SimKeyboardConfig {
    fn default() -> Self {
        Self {
            reply_delay_us: 500,
            byte_gap_us: 200,
            self_test_us: 300_000,
            self_test_passes: true,
            parity_faults: 0,
            framing_faults: 0,
            reply_parity_fault: None,
            refused_commands: 0,
            silent: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    Reply,
    Key,
}

/// A frame the keyboard is putting on the wire.
#[derive(Debug, Clone, Copy)]
pub struct Outgoing {
    pub byte: u8,
    pub frame: [Level; FRAME_BITS],
    origin: Origin,
}

impl Outgoing {
    fn new(byte: u8, origin: Origin) -> Self {
        Self {
            byte,
            frame: encode_frame(byte),
            origin,
        }
    }

    fn corrupt_parity(&mut self) {
        debug!("KBD: corrupting parity of {:02X}", self.byte);
        self.frame[9] = Level::from(self.frame[9].is_low());
    }
}

/// Queues scancodes for the keyboard to send, as if keys were pressed.
#[derive(Debug, Clone)]
pub struct KeySender {
    send: mpsc::Sender<u8>,
}

impl KeySender {
    pub fn new(send: mpsc::Sender<u8>) -> Self {
        Self { send }
    }

    pub fn send_raw(&self, byte: u8) {
        _ = self.send.send(byte);
    }

    pub fn send_make(&self, code: u8) {
        self.send_raw(code);
    }

    pub fn send_break(&self, code: u8) {
        self.send_raw(keycodes::RELEASE);
        self.send_raw(code);
    }

    /// Press and release.
    pub fn send_key(&self, code: u8) {
        self.send_make(code);
        self.send_break(code);
    }

    pub fn send_extended_make(&self, code: u8) {
        self.send_raw(keycodes::EXTENDED);
        self.send_raw(code);
    }

    pub fn send_pause(&self) {
        for byte in PAUSE_SEQUENCE {
            self.send_raw(byte);
        }
    }

    /// Ctrl plus a letter key.
    pub fn send_ctrl_char(&self, letter: u8) -> Result<(), ()> {
        let Some((code, _)) = keymap::key_for(letter.to_ascii_lowercase()) else {
            return Err(());
        };
        self.send_make(keycodes::CTRL);
        self.send_key(code);
        self.send_break(keycodes::CTRL);
        Ok(())
    }

    pub fn send_char(&self, c: u8) -> Result<(), ()> {
        match c {
            b'\r' | b'\n' => self.send_key(keycodes::ENTER),
            b'\t' => self.send_key(keycodes::TAB),
            0x08 | 0x7F => self.send_key(keycodes::BACKSPACE),
            0x1B => self.send_key(keycodes::ESCAPE),
            0x01..=0x1A => return self.send_ctrl_char(c + 0x60),
            _ => {
                let Some((code, shift)) = keymap::key_for(c) else {
                    return Err(());
                };
                if shift {
                    self.send_make(keycodes::LEFT_SHIFT);
                    self.send_key(code);
                    self.send_break(keycodes::LEFT_SHIFT);
                } else {
                    self.send_key(code);
                }
            }
        }
        Ok(())
    }

    /// Characters without a key are skipped and returned.
    pub fn send_text(&self, text: &str) -> Vec<char> {
        let mut skipped = vec![];
        for c in text.chars() {
            let sent = u8::try_from(c).map_or(Err(()), |byte| self.send_char(byte));
            if sent.is_err() {
                skipped.push(c);
            }
        }
        skipped
    }
}

/// A PS/2 keyboard speaking scancode set 2.
///
/// Only the byte level lives here; [`super::wire::SimWire`] turns frames
/// into clock edges.
pub struct SimKeyboard {
    config: SimKeyboardConfig,
    recv: mpsc::Receiver<u8>,
    kbd_queue: VecDeque<u8>,
    /// Answers to host commands, with the time each becomes ready.
    replies: VecDeque<(u8, u64)>,
    /// Host command bytes still waiting for their argument.
    command: VecDeque<u8>,
    ready_at: u64,
    last_sent: u8,
    leds: u8,
    codeset: u8,
    scanning: bool,
    received: Vec<u8>,
}

impl SimKeyboard {
    pub fn new(config: SimKeyboardConfig) -> (Self, KeySender) {
        let (send, recv) = mpsc::channel();
        (
            Self {
                config,
                recv,
                kbd_queue: VecDeque::new(),
                replies: VecDeque::new(),
                command: VecDeque::new(),
                ready_at: 0,
                last_sent: 0,
                leds: 0,
                codeset: 2,
                scanning: true,
                received: vec![],
            },
            KeySender::new(send),
        )
    }

    /// Every byte the host has clocked in, in order.
    pub fn received(&self) -> &[u8] {
        &self.received
    }

    pub fn leds(&self) -> u8 {
        self.leds
    }

    pub fn codeset(&self) -> u8 {
        self.codeset
    }

    #[cfg(test)]
    pub fn refuse_next(&mut self, count: u32) {
        self.config.refused_commands = count;
    }

    #[cfg(test)]
    pub fn inject_parity_faults(&mut self, count: u32) {
        self.config.parity_faults = count;
    }

    #[cfg(test)]
    pub fn inject_framing_faults(&mut self, count: u32) {
        self.config.framing_faults = count;
    }

    #[cfg(test)]
    pub fn set_silent(&mut self, silent: bool) {
        self.config.silent = silent;
    }

    fn pull_keys(&mut self) {
        while let Ok(byte) = self.recv.try_recv() {
            self.kbd_queue.push_back(byte);
        }
    }

    fn may_send_keys(&self) -> bool {
        self.scanning && self.command.is_empty()
    }

    /// When the next frame may start, if there is anything to send.
    pub fn next_frame_at(&mut self) -> Option<u64> {
        self.pull_keys();
        if let Some(&(_, at)) = self.replies.front() {
            return Some(at.max(self.ready_at));
        }
        (self.may_send_keys() && !self.kbd_queue.is_empty()).then_some(self.ready_at)
    }

    pub fn is_quiet(&mut self) -> bool {
        self.next_frame_at().is_none()
    }

    pub fn start_frame(&mut self) -> Option<Outgoing> {
        self.pull_keys();
        if let Some((byte, _)) = self.replies.pop_front() {
            let mut out = Outgoing::new(byte, Origin::Reply);
            if self.config.reply_parity_fault == Some(byte) {
                self.config.reply_parity_fault = None;
                out.corrupt_parity();
            }
            return Some(out);
        }
        if !self.may_send_keys() {
            return None;
        }
        let byte = self.kbd_queue.pop_front()?;
        let mut out = Outgoing::new(byte, Origin::Key);
        if self.config.parity_faults > 0 {
            self.config.parity_faults -= 1;
            out.corrupt_parity();
        } else if self.config.framing_faults > 0 {
            self.config.framing_faults -= 1;
            out.frame[10] = Level::Low;
            debug!("KBD: corrupting stop bit of {byte:02X}");
        }
        Some(out)
    }

    /// The host inhibited the clock before the frame completed; send it again
    /// later.
    pub fn frame_aborted(&mut self, out: Outgoing) {
        trace!("KBD: frame {:02X} aborted", out.byte);
        match out.origin {
            Origin::Reply => self.replies.push_front((out.byte, self.ready_at)),
            Origin::Key => self.kbd_queue.push_front(out.byte),
        }
    }

    pub fn frame_sent(&mut self, byte: u8, at: u64) {
        trace!("KBD: sent {byte:02X}");
        self.last_sent = byte;
        self.ready_at = at + self.config.byte_gap_us;
    }

    fn reply(&mut self, byte: u8, at: u64) {
        self.replies.push_back((byte, at + self.config.reply_delay_us));
    }

    /// A host-to-device frame finished clocking in at time `at`.
    pub fn receive(&mut self, byte: u8, parity: Level, stop: Level, at: u64) {
        trace!("KBD: received {byte:02X}");
        self.received.push(byte);
        if self.config.silent {
            return;
        }
        if byte != commands::RESEND {
            self.replies.clear();
        }
        if stop.is_low() || parity != odd_parity_bit(byte) {
            warn!("KBD: bad frame from host ({byte:02X})");
            self.reply(commands::RESEND, at);
            return;
        }
        // Resend never interrupts a command waiting for its argument
        if byte == commands::RESEND {
            self.execute(Ps2Command::Resend, at);
            return;
        }
        if self.config.refused_commands > 0 {
            self.config.refused_commands -= 1;
            debug!("KBD: refusing {byte:02X}");
            self.reply(commands::RESEND, at);
            return;
        }

        // A new opcode abandons a command still waiting for its argument
        if byte >= 0xED && !self.command.is_empty() {
            debug!("KBD: abandoning {:02X?}", self.command);
            self.command.clear();
        }
        self.command.push_back(byte);
        let Ok(command) = Ps2Command::try_from(&self.command) else {
            self.reply(ACK, at);
            return;
        };
        for _ in 0..command.len() {
            self.command.pop_front();
        }
        self.execute(command, at);
    }

    fn execute(&mut self, command: Ps2Command, at: u64) {
        debug!("KBD: Command {command:?}");
        match command {
            Ps2Command::SetLeds(mask) => {
                self.leds = mask & 0x07;
                self.reply(ACK, at);
            }
            Ps2Command::Echo => self.reply(commands::ECHO, at),
            Ps2Command::ScancodeSet(0) => {
                self.reply(ACK, at);
                self.reply(self.codeset, at);
            }
            Ps2Command::ScancodeSet(set @ 1..=3) => {
                self.codeset = set;
                self.reply(ACK, at);
            }
            Ps2Command::ScancodeSet(_) => self.reply(commands::RESEND, at),
            Ps2Command::Identify => {
                self.reply(ACK, at);
                for byte in KEYBOARD_ID {
                    self.reply(byte, at);
                }
            }
            Ps2Command::SetTypematic(_) | Ps2Command::SetDefaults => self.reply(ACK, at),
            Ps2Command::EnableScanning => {
                self.scanning = true;
                self.reply(ACK, at);
            }
            Ps2Command::DisableScanning => {
                self.scanning = false;
                self.reply(ACK, at);
            }
            Ps2Command::Resend => self
                .replies
                .push_front((self.last_sent, at + self.config.reply_delay_us)),
            Ps2Command::Reset => {
                self.pull_keys();
                self.kbd_queue.clear();
                self.leds = 0;
                self.codeset = 2;
                self.scanning = true;
                self.reply(ACK, at);
                let result = if self.config.self_test_passes {
                    commands::SELF_TEST_PASSED
                } else {
                    commands::SELF_TEST_FAILED
                };
                self.replies.push_back((result, at + self.config.self_test_us));
            }
            Ps2Command::Unknown(byte) => {
                warn!("KBD: unknown command {byte:02X}");
                self.reply(commands::RESEND, at);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    fn test_parse(input: &[u8], expected: Ps2Command) {
        let queue = VecDeque::from_iter(input.iter().copied());
        let command = Ps2Command::try_from(&queue).unwrap();
        assert_eq!(command, expected);
        assert_eq!(input.len(), command.len());
    }

    #[test]
    fn test_commands() {
        test_parse(&[0xED, 0x04], Ps2Command::SetLeds(0x04));
        test_parse(&[0xF0, 0x00], Ps2Command::ScancodeSet(0));
        test_parse(&[0xF3, 0x20], Ps2Command::SetTypematic(0x20));
        test_parse(&[0xEE], Ps2Command::Echo);
        test_parse(&[0xFE], Ps2Command::Resend);
        test_parse(&[0xFF], Ps2Command::Reset);
        test_parse(&[0x42], Ps2Command::Unknown(0x42));
        assert_eq!(Ps2Command::try_from(&VecDeque::from([0xEDu8])), Err(()));
        assert_eq!(Ps2Command::try_from(&VecDeque::<u8>::new()), Err(()));
    }

    fn sent_keys(text: &str) -> Vec<u8> {
        let (mut keyboard, keys) = SimKeyboard::new(SimKeyboardConfig::default());
        assert!(keys.send_text(text).is_empty());
        keyboard.pull_keys();
        keyboard.kbd_queue.into()
    }

    #[test]
    fn test_typing() {
        assert_eq!(sent_keys("a"), hex!("1C F0 1C"));
        assert_eq!(sent_keys("A"), hex!("12 1C F0 1C F0 12"));
        assert_eq!(sent_keys("\n"), hex!("5A F0 5A"));
        assert_eq!(sent_keys("\x03"), hex!("14 21 F0 21 F0 14"));

        let (_keyboard, keys) = SimKeyboard::new(SimKeyboardConfig::default());
        assert_eq!(keys.send_text("a\u{e9}b"), vec!['\u{e9}']);
    }

    /// Drain every pending reply, ignoring timing.
    fn replies(keyboard: &mut SimKeyboard) -> Vec<u8> {
        let mut bytes = vec![];
        while keyboard.next_frame_at().is_some() {
            let Some(out) = keyboard.start_frame() else {
                break;
            };
            keyboard.frame_sent(out.byte, 0);
            bytes.push(out.byte);
        }
        bytes
    }

    fn host_sends(keyboard: &mut SimKeyboard, bytes: &[u8]) -> Vec<u8> {
        let mut answers = vec![];
        for &byte in bytes {
            keyboard.receive(byte, odd_parity_bit(byte), Level::High, 0);
            answers.extend(replies(keyboard));
        }
        answers
    }

    #[test]
    fn test_command_responses() {
        let (mut keyboard, _keys) = SimKeyboard::new(SimKeyboardConfig::default());
        assert_eq!(host_sends(&mut keyboard, &hex!("ED 06")), hex!("FA FA"));
        assert_eq!(keyboard.leds(), 0x06);
        assert_eq!(host_sends(&mut keyboard, &hex!("F0 03 F0 00")), hex!("FA FA FA FA 03"));
        assert_eq!(host_sends(&mut keyboard, &hex!("EE")), hex!("EE"));
        assert_eq!(host_sends(&mut keyboard, &hex!("F2")), hex!("FA AB 83"));
        assert_eq!(host_sends(&mut keyboard, &hex!("FE")), hex!("83"));
        assert_eq!(host_sends(&mut keyboard, &hex!("42")), hex!("FE"));
        assert_eq!(host_sends(&mut keyboard, &hex!("FF")), hex!("FA AA"));
        assert_eq!(keyboard.leds(), 0);
        assert_eq!(keyboard.codeset(), 2);
    }

    #[test]
    fn test_new_opcode_abandons_partial_command() {
        let (mut keyboard, _keys) = SimKeyboard::new(SimKeyboardConfig::default());
        assert_eq!(host_sends(&mut keyboard, &hex!("ED EE")), hex!("FA EE"));
        assert_eq!(keyboard.leds(), 0);
    }

    #[test]
    fn test_keys_wait_for_command_argument() {
        let (mut keyboard, keys) = SimKeyboard::new(SimKeyboardConfig::default());
        keys.send_key(0x1C);
        assert_eq!(host_sends(&mut keyboard, &hex!("ED")), hex!("FA"));
        assert!(keyboard.is_quiet());
        assert_eq!(host_sends(&mut keyboard, &hex!("02")), hex!("FA 1C F0 1C"));
    }

    #[test]
    fn test_bad_host_frame_and_refusals() {
        let (mut keyboard, _keys) = SimKeyboard::new(SimKeyboardConfig {
            refused_commands: 1,
            ..Default::default()
        });
        keyboard.receive(0xED, Level::Low, Level::High, 0);
        assert_eq!(replies(&mut keyboard), hex!("FE"));
        assert_eq!(host_sends(&mut keyboard, &hex!("ED ED 00")), hex!("FE FA FA"));
    }

    #[test]
    fn test_corrupted_reply_resent_mid_command() {
        let (mut keyboard, _keys) = SimKeyboard::new(SimKeyboardConfig {
            reply_parity_fault: Some(ACK),
            ..Default::default()
        });
        keyboard.receive(0xED, odd_parity_bit(0xED), Level::High, 0);
        let out = keyboard.start_frame().unwrap();
        assert_eq!(out.byte, ACK);
        assert_ne!(out.frame, encode_frame(ACK));
        keyboard.frame_sent(out.byte, 0);

        // Only the first frame of that byte is corrupted
        assert_eq!(host_sends(&mut keyboard, &hex!("FE")), hex!("FA"));
        assert_eq!(host_sends(&mut keyboard, &hex!("04")), hex!("FA"));
        assert_eq!(keyboard.leds(), 0x04);
    }

    #[test]
    fn test_fault_injection() {
        let (mut keyboard, keys) = SimKeyboard::new(SimKeyboardConfig {
            parity_faults: 1,
            framing_faults: 1,
            ..Default::default()
        });
        keys.send_key(0x1C);
        let first = keyboard.start_frame().unwrap();
        assert_eq!(first.frame[9], Level::High);
        let second = keyboard.start_frame().unwrap();
        assert_eq!(second.frame[10], Level::Low);
        let third = keyboard.start_frame().unwrap();
        assert_eq!(third.frame, encode_frame(0x1C));
    }
}
