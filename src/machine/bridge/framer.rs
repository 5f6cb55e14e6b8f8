use super::hal::{Level, Ps2Port};

/// start + 8 data + parity + stop
pub const FRAME_BITS: usize = 11;

/// Index of the stop bit on receive, and of the device's acknowledge clock
/// on transmit.
const LAST_INDEX: u8 = 10;

/// True when `byte` has an odd number of set bits.
pub fn parity(byte: u8) -> bool {
    let mut x = byte ^ (byte >> 4);
    x ^= x >> 2;
    x ^= x >> 1;
    x & 1 == 1
}

/// The parity bit that makes the nine transmitted bits odd.
pub fn odd_parity_bit(byte: u8) -> Level {
    Level::from(!parity(byte))
}

/// Line levels of a complete device-to-host frame, in wire order.
pub fn encode_frame(byte: u8) -> [Level; FRAME_BITS] {
    let mut frame = [Level::High; FRAME_BITS];
    frame[0] = Level::Low;
    for bit in 0..8 {
        frame[1 + bit] = Level::from((byte >> bit) & 1 != 0);
    }
    frame[9] = odd_parity_bit(byte);
    frame[10] = Level::High;
    frame
}

fn validate(start: Level, parity_bit: Level, stop: Level, byte: u8) -> Result<u8, FrameFault> {
    if start != Level::Low || stop != Level::High {
        return Err(FrameFault::Framing { start, stop });
    }
    if parity_bit != odd_parity_bit(byte) {
        return Err(FrameFault::Parity { byte });
    }
    Ok(byte)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FrameFault {
    #[error("framing fault (start {start:?}, stop {stop:?})")]
    Framing { start: Level, stop: Level },
    #[error("parity fault on {byte:02X}")]
    Parity { byte: u8 },
}

/// What a clock edge produced, reported back to the edge dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameEvent {
    Received(u8),
    Fault(FrameFault),
    /// A host-to-device frame finished. `line_ack` is whether the device
    /// pulled data low on the acknowledge clock.
    Transmitted { line_ack: bool },
    /// The bit counter left its valid range and was reset.
    CounterReset { index: u8 },
}

/// Link direction together with the bit position inside the current frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Receive {
        index: u8,
        shift: u8,
        start: Level,
        parity: Level,
    },
    Transmit {
        index: u8,
        byte: u8,
    },
}

impl Direction {
    const IDLE: Direction = Direction::Receive {
        index: 0,
        shift: 0,
        start: Level::High,
        parity: Level::High,
    };
}

/// Bit-level PS/2 codec, advanced once per falling clock edge.
///
/// This runs in the edge interrupt: every call is a handful of branches, it
/// never blocks and never logs. Policy lives with whoever handles the
/// returned [`FrameEvent`].
#[derive(Debug)]
pub struct BitFramer {
    direction: Direction,
}

impl Default for BitFramer {
    fn default() -> Self {
        Self::new()
    }
}

impl BitFramer {
    pub fn new() -> Self {
        Self {
            direction: Direction::IDLE,
        }
    }

    pub fn is_transmitting(&self) -> bool {
        matches!(self.direction, Direction::Transmit { .. })
    }

    /// True between frames in the receive direction.
    pub fn is_idle(&self) -> bool {
        self.direction == Direction::IDLE
    }

    /// Arm a host-to-device frame. The caller has already produced the
    /// request-to-send condition on the lines.
    pub fn begin_transmit(&mut self, byte: u8) {
        self.direction = Direction::Transmit { index: 0, byte };
    }

    /// Abandon whatever frame is in progress and wait for a new start bit.
    pub fn reset(&mut self) {
        self.direction = Direction::IDLE;
    }

    pub fn on_clock_edge<P: Ps2Port + ?Sized>(
        &mut self,
        level: Level,
        port: &mut P,
    ) -> Option<FrameEvent> {
        match self.direction {
            Direction::Receive {
                index,
                shift,
                start,
                parity,
            } => self.receive(index, shift, start, parity, level),
            Direction::Transmit { index, byte } => self.transmit(index, byte, level, port),
        }
    }

    fn receive(
        &mut self,
        index: u8,
        mut shift: u8,
        mut start: Level,
        mut parity: Level,
        level: Level,
    ) -> Option<FrameEvent> {
        match index {
            0 => start = level,
            1..=8 => shift |= (level.is_high() as u8) << (index - 1),
            9 => parity = level,
            LAST_INDEX => {
                self.direction = Direction::IDLE;
                return Some(match validate(start, parity, level, shift) {
                    Ok(byte) => FrameEvent::Received(byte),
                    Err(fault) => FrameEvent::Fault(fault),
                });
            }
            _ => {
                self.direction = Direction::IDLE;
                return Some(FrameEvent::CounterReset { index });
            }
        }
        self.direction = Direction::Receive {
            index: index + 1,
            shift,
            start,
            parity,
        };
        None
    }

    fn transmit<P: Ps2Port + ?Sized>(
        &mut self,
        index: u8,
        byte: u8,
        level: Level,
        port: &mut P,
    ) -> Option<FrameEvent> {
        match index {
            0..=7 => port.set_data(Level::from((byte >> index) & 1 != 0)),
            8 => port.set_data(odd_parity_bit(byte)),
            9 => port.set_data(Level::High),
            LAST_INDEX => {
                self.direction = Direction::IDLE;
                return Some(FrameEvent::Transmitted {
                    line_ack: level.is_low(),
                });
            }
            _ => {
                self.direction = Direction::IDLE;
                return Some(FrameEvent::CounterReset { index });
            }
        }
        self.direction = Direction::Transmit {
            index: index + 1,
            byte,
        };
        None
    }
}
