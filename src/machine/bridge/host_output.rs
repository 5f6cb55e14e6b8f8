use tracing::debug;

use super::hal::{HostBus, Timing};

/// Strobed byte output onto the parallel host bus.
#[derive(Debug, Clone, Copy)]
pub struct HostOutput {
    strobe_us: u32,
}

impl HostOutput {
    pub fn new(strobe_us: u32) -> Self {
        Self { strobe_us }
    }

    pub fn emit<H: HostBus + ?Sized, T: Timing + ?Sized>(&self, bus: &mut H, timing: &mut T, byte: u8) {
        debug!("HOST: emit {byte:02X}");
        bus.write_data(byte);
        bus.set_strobe(true);
        timing.delay_us(self.strobe_us);
        bus.set_strobe(false);
        bus.write_data(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Debug, PartialEq, Eq)]
    enum Signal {
        Data(u8),
        Strobe(bool),
        Delay(u32),
    }

    #[derive(Default, Clone)]
    struct Recorder(Rc<RefCell<Vec<Signal>>>);

    impl HostBus for Recorder {
        fn write_data(&mut self, byte: u8) {
            self.0.borrow_mut().push(Signal::Data(byte));
        }
        fn set_strobe(&mut self, high: bool) {
            self.0.borrow_mut().push(Signal::Strobe(high));
        }
        fn set_host_reset(&mut self, _asserted: bool) {}
    }

    impl Timing for Recorder {
        fn now_us(&self) -> u64 {
            0
        }
        fn delay_us(&mut self, us: u32) {
            self.0.borrow_mut().push(Signal::Delay(us));
        }
    }

    #[test]
    fn test_strobe_sequence() {
        let mut bus = Recorder::default();
        let mut timing = bus.clone();
        HostOutput::new(10).emit(&mut bus, &mut timing, b'a');

        assert_eq!(
            *bus.0.borrow(),
            vec![
                Signal::Data(b'a'),
                Signal::Strobe(true),
                Signal::Delay(10),
                Signal::Strobe(false),
                Signal::Data(0),
            ]
        );
    }
}
