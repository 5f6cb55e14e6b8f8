/// Single-slot handoff from the edge handler to the mainline.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Mailbox {
    #[default]
    Empty,
    Full(u8),
}

/// A byte arrived while the slot was still occupied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("mailbox overrun: holding {held:02X}, dropped {dropped:02X}")]
pub struct Overrun {
    pub held: u8,
    pub dropped: u8,
}

impl Mailbox {
    /// Fill the slot. A full slot keeps its byte and the new one is dropped.
    pub fn try_send(&mut self, byte: u8) -> Result<(), Overrun> {
        match *self {
            Mailbox::Empty => {
                *self = Mailbox::Full(byte);
                Ok(())
            }
            Mailbox::Full(held) => Err(Overrun {
                held,
                dropped: byte,
            }),
        }
    }

    pub fn try_recv(&mut self) -> Option<u8> {
        match std::mem::take(self) {
            Mailbox::Empty => None,
            Mailbox::Full(byte) => Some(byte),
        }
    }

    pub fn is_full(&self) -> bool {
        matches!(self, Mailbox::Full(_))
    }
}
