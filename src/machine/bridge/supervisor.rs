use tracing::{error, info, warn};

use super::BridgeConfig;
use super::hal::{HostBus, Ps2Port, Timing};
use super::host_output::HostOutput;
use super::link::{Link, LinkError, POLL_US, commands};
use super::recovery::ErrorCounters;
use super::translator::{Action, ScancodeTranslator};

/// Scancode set the translator tables are written for.
const CODESET: u8 = 2;

/// Why the bridge stopped feeding the watchdog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ResetCause {
    #[error("keyboard self-test failed ({0:02X})")]
    SelfTestFailed(u8),
    #[error("keyboard reset handshake failed: {0}")]
    ResetHandshake(LinkError),
    #[error("host reset key combination")]
    HostResetCombo,
    #[error("watchdog timeout")]
    WatchdogTimeout,
}

/// The bridge firmware: boot sequence and mainline loop around the link,
/// translator and host bus.
pub struct Supervisor<P, H, T> {
    link: Link<P, T>,
    translator: ScancodeTranslator,
    output: HostOutput,
    bus: H,
}

impl<P: Ps2Port, H: HostBus, T: Timing> Supervisor<P, H, T> {
    pub fn new(port: P, mut bus: H, timing: T, config: BridgeConfig) -> Self {
        bus.write_data(0);
        bus.set_strobe(false);
        bus.set_host_reset(false);
        Self {
            link: Link::new(port, timing, config),
            translator: ScancodeTranslator::new(),
            output: HostOutput::new(config.strobe_us),
            bus,
        }
    }

    /// Take the hardware back, as a watchdog reset would, so a fresh
    /// instance can boot on it.
    pub fn into_parts(self) -> (P, H, T) {
        let (port, timing) = self.link.into_parts();
        (port, self.bus, timing)
    }

    pub fn port(&self) -> &P {
        self.link.port()
    }

    #[cfg(test)]
    pub fn port_mut(&mut self) -> &mut P {
        self.link.port_mut()
    }

    #[cfg(test)]
    pub fn bus(&self) -> &H {
        &self.bus
    }

    #[cfg(test)]
    pub fn translator(&self) -> &ScancodeTranslator {
        &self.translator
    }

    pub fn counters(&self) -> ErrorCounters {
        self.link.counters()
    }

    pub fn boot(&mut self) -> Result<(), ResetCause> {
        self.link.feed_watchdog();
        info!("HOST: bridge booting");
        match self.link.reset_keyboard() {
            Ok(commands::SELF_TEST_PASSED) => info!("KBD: self-test passed"),
            Ok(code) => {
                error!("KBD: self-test failed with {code:02X}");
                return Err(self.stall(ResetCause::SelfTestFailed(code)));
            }
            Err(LinkError::WatchdogExpired) => return Err(ResetCause::WatchdogTimeout),
            Err(err) => {
                error!("KBD: reset failed: {err}");
                return Err(self.stall(ResetCause::ResetHandshake(err)));
            }
        }
        self.link.feed_watchdog();

        let result = self.link.select_codeset(CODESET);
        self.non_fatal(result, "scancode set selection")?;
        let result = self.link.query_codeset().map(|set| {
            if set != CODESET {
                warn!("KBD: keyboard reports scancode set {set}");
            }
        });
        self.non_fatal(result, "scancode set query")?;
        let result = self.link.set_leds(0);
        self.non_fatal(result, "LED reset")?;
        info!("HOST: bridge ready");
        Ok(())
    }

    fn non_fatal(&mut self, result: Result<(), LinkError>, what: &str) -> Result<(), ResetCause> {
        match result {
            Ok(()) => Ok(()),
            Err(LinkError::WatchdogExpired) => Err(ResetCause::WatchdogTimeout),
            Err(err) => {
                warn!("HOST: {what} failed: {err}");
                Ok(())
            }
        }
    }

    /// One pass of the mainline. Returns whether anything happened.
    pub fn step(&mut self) -> Result<bool, ResetCause> {
        self.link.feed_watchdog();
        let mut progressed = match self.link.service() {
            Ok(progressed) => progressed,
            Err(LinkError::WatchdogExpired) => return Err(ResetCause::WatchdogTimeout),
            Err(err) => {
                warn!("HOST: resend request failed: {err}");
                true
            }
        };

        let Some(code) = self.link.try_recv() else {
            return Ok(progressed);
        };
        progressed = true;
        match self.translator.process(code) {
            Action::None => {}
            Action::Char(c) => self.output.emit(&mut self.bus, self.link.timing_mut(), c),
            Action::SetLeds(mask) => {
                let result = self.link.set_leds(mask);
                self.translator.command_complete();
                self.non_fatal(result, "LED update")?;
            }
            Action::Modifiers => {
                if self.translator.modifiers().is_host_reset_combo() {
                    warn!("HOST: reset combination held");
                    self.host_reset();
                    return Err(self.stall(ResetCause::HostResetCombo));
                }
            }
        }
        Ok(progressed)
    }

    /// Check the keyboard answers an echo. Failure is only logged.
    pub fn diagnose(&mut self) -> Result<bool, ResetCause> {
        self.link.feed_watchdog();
        match self.link.echo() {
            Ok(true) => {
                info!("KBD: echo answered");
                Ok(true)
            }
            Ok(false) => {
                warn!("KBD: no echo from keyboard");
                Ok(false)
            }
            Err(LinkError::WatchdogExpired) => Err(ResetCause::WatchdogTimeout),
            Err(err) => {
                warn!("KBD: echo failed: {err}");
                Ok(false)
            }
        }
    }

    pub fn host_reset(&mut self) {
        self.bus.set_host_reset(true);
    }

    /// Stop feeding the watchdog and spin until it expires.
    pub fn stall(&mut self, cause: ResetCause) -> ResetCause {
        error!("HOST: {cause}, waiting for watchdog");
        self.link.stall_until_watchdog();
        cause
    }

    /// Run the mainline until nothing has happened for `quiet_us` and
    /// `idle` reports the port quiet.
    pub fn run_until_quiet(
        &mut self,
        quiet_us: u64,
        mut idle: impl FnMut(&mut P) -> bool,
    ) -> Result<(), ResetCause> {
        let mut quiet_since = self.link.timing().now_us();
        loop {
            let progressed = self.step()?;
            let now = self.link.timing().now_us();
            if progressed || !self.link.is_idle() || !idle(self.link.port_mut()) {
                quiet_since = now;
            } else if now - quiet_since >= quiet_us {
                return Ok(());
            }
            if !progressed {
                self.link.timing_mut().delay_us(POLL_US);
            }
        }
    }

    /// Run the mainline for `duration_us` of bridge time.
    pub fn run_for(&mut self, duration_us: u64) -> Result<(), ResetCause> {
        let until = self.link.timing().now_us() + duration_us;
        while self.link.timing().now_us() < until {
            if !self.step()? {
                self.link.timing_mut().delay_us(POLL_US);
            }
        }
        Ok(())
    }
}
