use std::sync::mpsc;

use tracing::{info, trace};

use crate::machine::bridge::hal::HostBus;

/// Parallel bus as seen by the host: a byte is latched on every rising
/// strobe and forwarded over the channel.
pub struct SimHostBus {
    data: u8,
    strobe: bool,
    reset: bool,
    send: mpsc::Sender<u8>,
}

impl SimHostBus {
    pub fn new() -> (Self, mpsc::Receiver<u8>) {
        let (send, recv) = mpsc::channel();
        (
            Self {
                data: 0,
                strobe: false,
                reset: false,
                send,
            },
            recv,
        )
    }

    #[cfg(test)]
    pub fn host_reset_asserted(&self) -> bool {
        self.reset
    }
}

impl HostBus for SimHostBus {
    fn write_data(&mut self, byte: u8) {
        self.data = byte;
    }

    fn set_strobe(&mut self, high: bool) {
        if high && !self.strobe {
            trace!("HOST: latched {:02X}", self.data);
            _ = self.send.send(self.data);
        }
        self.strobe = high;
    }

    fn set_host_reset(&mut self, asserted: bool) {
        if asserted != self.reset {
            info!("HOST: reset line {}", if asserted { "asserted" } else { "released" });
        }
        self.reset = asserted;
    }
}
