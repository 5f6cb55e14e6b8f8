use ratatui::crossterm::event::{Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};

use crate::machine::bridge::keymap::keycodes;
use crate::machine::generic::ps2kbd::KeySender;

/// Turns terminal key events into scancodes for the simulated keyboard.
///
/// Ctrl-G starts a compose sequence for keys a terminal can't deliver on
/// their own: `c`/`n`/`s` toggle caps, num and scroll lock, `p` sends
/// Pause, `r` holds the host reset combination and `q` quits.
#[derive(Default)]
pub struct CrosstermKeyboard {
    compose_special_key: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyboardCommand {
    Quit,
}

impl CrosstermKeyboard {
    pub fn update_keyboard(
        &mut self,
        event: &Event,
        sender: &KeySender,
    ) -> Option<KeyboardCommand> {
        let Event::Key(key) = event else {
            return None;
        };
        if key.kind == KeyEventKind::Release {
            return None;
        }
        if self.compose_special_key {
            self.compose_special_key = false;
            return self.compose(key, sender);
        }

        if key.modifiers == KeyModifiers::CONTROL {
            match key.code {
                KeyCode::Char('g') => {
                    self.compose_special_key = true;
                }
                KeyCode::Char(c) => {
                    if let Ok(c) = u8::try_from(c) {
                        _ = sender.send_ctrl_char(c);
                    }
                }
                _ => {}
            }
        }
        if key.modifiers.is_empty() || key.modifiers == KeyModifiers::SHIFT {
            let c = match key.code {
                KeyCode::Char(c) => u8::try_from(c).ok(),
                KeyCode::Enter => Some(b'\r'),
                KeyCode::Tab => Some(b'\t'),
                KeyCode::Backspace => Some(0x08),
                KeyCode::Esc => Some(0x1B),
                _ => None,
            };
            if let Some(c) = c {
                _ = sender.send_char(c);
            }
        }
        None
    }

    fn compose(&self, key: &KeyEvent, sender: &KeySender) -> Option<KeyboardCommand> {
        if !key.modifiers.is_empty() {
            return None;
        }
        match key.code {
            KeyCode::Char('q') => return Some(KeyboardCommand::Quit),
            KeyCode::Char('c') => sender.send_key(keycodes::CAPS_LOCK),
            KeyCode::Char('n') => sender.send_key(keycodes::NUM_LOCK),
            KeyCode::Char('s') => sender.send_key(keycodes::SCROLL_LOCK),
            KeyCode::Char('p') => sender.send_pause(),
            KeyCode::Char('r') => {
                sender.send_make(keycodes::CTRL);
                sender.send_make(keycodes::ALT);
                sender.send_extended_make(keycodes::ALT);
            }
            _ => {}
        }
        None
    }
}
