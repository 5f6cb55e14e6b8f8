use bitflags::bitflags;
use tracing::{debug, trace, warn};

use super::keymap::{self, keycodes};

bitflags! {
    /// Transient modifiers currently held down.
    #[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct Held: u8 {
        const LEFT_SHIFT = 1 << 0;
        const RIGHT_SHIFT = 1 << 1;
        const LEFT_CTRL = 1 << 2;
        const RIGHT_CTRL = 1 << 3;
        const LEFT_ALT = 1 << 4;
        const RIGHT_ALT = 1 << 5;
    }
}

bitflags! {
    /// Toggled locks, laid out as the keyboard's LED mask.
    #[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct Locks: u8 {
        const SCROLL = 1 << 0;
        const NUM = 1 << 1;
        const CAPS = 1 << 2;
    }
}

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct ModifierRegister {
    pub held: Held,
    pub locks: Locks,
}

impl ModifierRegister {
    const HOST_RESET: Held = Held::LEFT_ALT.union(Held::RIGHT_ALT).union(Held::LEFT_CTRL);

    pub fn shift(&self) -> bool {
        self.held.intersects(Held::LEFT_SHIFT | Held::RIGHT_SHIFT)
    }

    pub fn ctrl(&self) -> bool {
        self.held.intersects(Held::LEFT_CTRL | Held::RIGHT_CTRL)
    }

    pub fn led_mask(&self) -> u8 {
        self.locks.bits()
    }

    /// Left Alt, right Alt and left Ctrl all held.
    pub fn is_host_reset_combo(&self) -> bool {
        self.held.contains(Self::HOST_RESET)
    }
}

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub enum TranslationState {
    #[default]
    Normal,
    /// After `E0`.
    Extended,
    /// Inside the Pause sequence, with this many bytes still to swallow.
    Pause { remaining: u8 },
    /// An LED update is being sent to the keyboard.
    AwaitingCommandResponse,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Action {
    None,
    Char(u8),
    /// The modifier register changed.
    Modifiers,
    /// Send this mask to the keyboard LEDs, then call
    /// [`ScancodeTranslator::command_complete`].
    SetLeds(u8),
}

#[derive(Debug, Default)]
pub struct ScancodeTranslator {
    state: TranslationState,
    release: bool,
    modifiers: ModifierRegister,
}

impl ScancodeTranslator {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn state(&self) -> TranslationState {
        self.state
    }

    pub fn modifiers(&self) -> ModifierRegister {
        self.modifiers
    }

    pub fn command_complete(&mut self) {
        if self.state == TranslationState::AwaitingCommandResponse {
            self.state = TranslationState::Normal;
        }
    }

    pub fn process(&mut self, code: u8) -> Action {
        trace!("KBD: scancode {code:02X} in {:?}", self.state);
        match self.state {
            TranslationState::AwaitingCommandResponse => {
                warn!("KBD: dropping {code:02X} during LED update");
                Action::None
            }
            TranslationState::Pause { remaining } => {
                self.state = match remaining.saturating_sub(1) {
                    0 => TranslationState::Normal,
                    remaining => TranslationState::Pause { remaining },
                };
                Action::None
            }
            TranslationState::Normal | TranslationState::Extended => match code {
                0x00 | 0xFF => {
                    debug!("KBD: keyboard error code {code:02X}");
                    self.drop_prefixes()
                }
                0xAA | 0xEE | 0xFA | 0xFE => {
                    debug!("KBD: stray protocol byte {code:02X}");
                    self.drop_prefixes()
                }
                keycodes::RELEASE => {
                    self.release = true;
                    Action::None
                }
                keycodes::EXTENDED => {
                    self.state = TranslationState::Extended;
                    Action::None
                }
                keycodes::PAUSE if self.state == TranslationState::Normal => {
                    self.release = false;
                    self.state = TranslationState::Pause {
                        remaining: keymap::PAUSE_SEQUENCE.len() as u8 - 1,
                    };
                    Action::None
                }
                _ => {
                    let release = std::mem::take(&mut self.release);
                    let extended = self.state == TranslationState::Extended;
                    self.state = TranslationState::Normal;
                    if extended {
                        self.extended_key(code, release)
                    } else if release {
                        self.key_up(code)
                    } else {
                        self.key_down(code)
                    }
                }
            },
        }
    }

    /// A byte that is not a scancode ends any `E0`/`F0` prefix in progress.
    fn drop_prefixes(&mut self) -> Action {
        self.state = TranslationState::Normal;
        self.release = false;
        Action::None
    }

    fn modifier(&mut self, flag: Held, release: bool) -> Action {
        self.modifiers.held.set(flag, !release);
        debug!("KBD: modifiers {:?}", self.modifiers.held);
        Action::Modifiers
    }

    fn extended_key(&mut self, code: u8, release: bool) -> Action {
        match code {
            keycodes::CTRL => self.modifier(Held::RIGHT_CTRL, release),
            keycodes::ALT => self.modifier(Held::RIGHT_ALT, release),
            _ => Action::None,
        }
    }

    fn key_up(&mut self, code: u8) -> Action {
        match code {
            keycodes::LEFT_SHIFT => self.modifier(Held::LEFT_SHIFT, true),
            keycodes::RIGHT_SHIFT => self.modifier(Held::RIGHT_SHIFT, true),
            keycodes::CTRL => self.modifier(Held::LEFT_CTRL, true),
            keycodes::ALT => self.modifier(Held::LEFT_ALT, true),
            _ => Action::None,
        }
    }

    fn toggle_lock(&mut self, lock: Locks) -> Action {
        self.modifiers.locks.toggle(lock);
        self.state = TranslationState::AwaitingCommandResponse;
        debug!("KBD: locks {:?}", self.modifiers.locks);
        Action::SetLeds(self.modifiers.led_mask())
    }

    fn key_down(&mut self, code: u8) -> Action {
        match code {
            keycodes::LEFT_SHIFT => self.modifier(Held::LEFT_SHIFT, false),
            keycodes::RIGHT_SHIFT => self.modifier(Held::RIGHT_SHIFT, false),
            keycodes::CTRL => self.modifier(Held::LEFT_CTRL, false),
            keycodes::ALT => self.modifier(Held::LEFT_ALT, false),
            keycodes::CAPS_LOCK => self.toggle_lock(Locks::CAPS),
            keycodes::NUM_LOCK => self.toggle_lock(Locks::NUM),
            keycodes::SCROLL_LOCK => self.toggle_lock(Locks::SCROLL),
            keycodes::BACKSPACE => Action::Char(0x7F),
            keycodes::ENTER => Action::Char(b'\r'),
            keycodes::TAB => Action::Char(b'\t'),
            keycodes::ESCAPE => Action::Char(0x1B),
            _ => match self.resolve(code) {
                Some(c) => Action::Char(c),
                None => {
                    debug!("KBD: unmapped scancode {code:02X}");
                    Action::None
                }
            },
        }
    }

    fn resolve(&self, code: u8) -> Option<u8> {
        let modifiers = &self.modifiers;
        if modifiers.ctrl() {
            keymap::shifted(code)
                .filter(u8::is_ascii_uppercase)
                .map(|c| c - 0x40)
        } else if modifiers.shift() {
            keymap::shifted(code)
        } else if modifiers.locks.contains(Locks::CAPS) {
            keymap::plain(code).map(|c| c.to_ascii_uppercase())
        } else {
            keymap::plain(code)
        }
    }
}
