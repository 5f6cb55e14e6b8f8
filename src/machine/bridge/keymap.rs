//! US layout for scancode set 2.

use hex_literal::hex;

pub mod keycodes {
    pub const LEFT_SHIFT: u8 = 0x12;
    pub const RIGHT_SHIFT: u8 = 0x59;
    /// Left Ctrl, or right Ctrl behind [`EXTENDED`].
    pub const CTRL: u8 = 0x14;
    /// Left Alt, or right Alt behind [`EXTENDED`].
    pub const ALT: u8 = 0x11;
    pub const CAPS_LOCK: u8 = 0x58;
    pub const NUM_LOCK: u8 = 0x77;
    pub const SCROLL_LOCK: u8 = 0x7E;
    pub const BACKSPACE: u8 = 0x66;
    pub const ENTER: u8 = 0x5A;
    pub const TAB: u8 = 0x0D;
    pub const ESCAPE: u8 = 0x76;
    pub const EXTENDED: u8 = 0xE0;
    pub const RELEASE: u8 = 0xF0;
    pub const PAUSE: u8 = 0xE1;
}

/// The complete Pause/Break make sequence. It has no break sequence.
pub const PAUSE_SEQUENCE: [u8; 8] = hex!("E1 14 77 E1 F0 14 F0 77");

const TABLE_LEN: usize = 0x90;

macro_rules! def_keymap {
    ($($code:literal => $plain:literal $shifted:literal;)*) => {
        /// `(scancode, plain, shifted)` for every printable key.
        pub const KEYS: &[(u8, u8, u8)] = &[
            $( ($code, $plain, $shifted), )*
        ];
    };
}

def_keymap!(
0x0E => b'`' b'~';
0x15 => b'q' b'Q';
0x16 => b'1' b'!';
0x1A => b'z' b'Z';
0x1B => b's' b'S';
0x1C => b'a' b'A';
0x1D => b'w' b'W';
0x1E => b'2' b'@';
0x21 => b'c' b'C';
0x22 => b'x' b'X';
0x23 => b'd' b'D';
0x24 => b'e' b'E';
0x25 => b'4' b'$';
0x26 => b'3' b'#';
0x29 => b' ' b' ';
0x2A => b'v' b'V';
0x2B => b'f' b'F';
0x2C => b't' b'T';
0x2D => b'r' b'R';
0x2E => b'5' b'%';
0x31 => b'n' b'N';
0x32 => b'b' b'B';
0x33 => b'h' b'H';
0x34 => b'g' b'G';
0x35 => b'y' b'Y';
0x36 => b'6' b'^';
0x3A => b'm' b'M';
0x3B => b'j' b'J';
0x3C => b'u' b'U';
0x3D => b'7' b'&';
0x3E => b'8' b'*';
0x41 => b',' b'<';
0x42 => b'k' b'K';
0x43 => b'i' b'I';
0x44 => b'o' b'O';
0x45 => b'0' b')';
0x46 => b'9' b'(';
0x49 => b'.' b'>';
0x4A => b'/' b'?';
0x4B => b'l' b'L';
0x4C => b';' b':';
0x4D => b'p' b'P';
0x4E => b'-' b'_';
0x52 => b'\'' b'"';
0x54 => b'[' b'{';
0x55 => b'=' b'+';
0x5B => b']' b'}';
0x5D => b'\\' b'|';
// Keypad, unaffected by shift
0x69 => b'1' b'1';
0x6B => b'4' b'4';
0x6C => b'7' b'7';
0x70 => b'0' b'0';
0x71 => b'.' b'.';
0x72 => b'2' b'2';
0x73 => b'5' b'5';
0x74 => b'6' b'6';
0x75 => b'8' b'8';
0x79 => b'+' b'+';
0x7A => b'3' b'3';
0x7B => b'-' b'-';
0x7C => b'*' b'*';
0x7D => b'9' b'9';
);

const fn build(shifted: bool) -> [u8; TABLE_LEN] {
    let mut table = [0; TABLE_LEN];
    let mut i = 0;
    while i < KEYS.len() {
        let (code, plain, shift) = KEYS[i];
        table[code as usize] = if shifted { shift } else { plain };
        i += 1;
    }
    table
}

static PLAIN: [u8; TABLE_LEN] = build(false);
static SHIFTED: [u8; TABLE_LEN] = build(true);

fn lookup(table: &[u8; TABLE_LEN], code: u8) -> Option<u8> {
    match table.get(code as usize) {
        Some(0) | None => None,
        Some(&c) => Some(c),
    }
}

pub fn plain(code: u8) -> Option<u8> {
    lookup(&PLAIN, code)
}

pub fn shifted(code: u8) -> Option<u8> {
    lookup(&SHIFTED, code)
}

/// Reverse lookup: the scancode producing `ch`, and whether shift is needed.
/// The main block wins over the keypad.
pub fn key_for(ch: u8) -> Option<(u8, bool)> {
    KEYS.iter().find_map(|&(code, plain, shifted)| {
        if plain == ch {
            Some((code, false))
        } else if shifted == ch {
            Some((code, true))
        } else {
            None
        }
    })
}
