use clap::Parser;
use std::io::{self, Write, stdout};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use tracing::{Level, error, info, warn};

mod host;
mod machine;

use crate::host::logging::{setup_logging_file, setup_logging_stdio};
use crate::host::script::{load_scancodes, parse_hex_byte};
use crate::machine::bridge::BridgeConfig;
use crate::machine::bridge::supervisor::{ResetCause, Supervisor};
use crate::machine::generic::clock::SimClock;
use crate::machine::generic::host_bus::SimHostBus;
use crate::machine::generic::ps2kbd::{KeySender, SimKeyboard, SimKeyboardConfig};
use crate::machine::generic::wire::SimWire;

type Bridge = Supervisor<SimWire, SimHostBus, SimClock>;

/// Quiet time after which a batch run is considered finished.
const QUIET_US: u64 = 50_000;

/// PS/2 keyboard bridge
/// Runs the bridge firmware against a simulated keyboard and prints what
/// reaches the host bus
#[derive(Parser)]
#[command(name = "ps2-bridge")]
#[command(about = "PS/2 keyboard to parallel host bus bridge simulator")]
struct Args {
    /// Text to type on the simulated keyboard
    #[arg(long = "type", value_name = "TEXT")]
    text: Option<String>,

    /// Raw scancodes to send after the text, repeatable, parsed as hex
    #[arg(value_parser = parse_scancode_arg, long = "scancode")]
    scancodes: Vec<u8>,

    /// File of hex scancodes to send after the text
    #[arg(long)]
    script: Option<PathBuf>,

    /// Ask the keyboard for an echo after every boot
    #[arg(long)]
    diagnose: bool,

    /// Forward terminal key presses to the simulated keyboard
    #[arg(long)]
    interactive: bool,

    /// Key frames to corrupt with a bad parity bit
    #[arg(long, default_value_t = 0)]
    parity_faults: u32,

    /// Key frames to corrupt with a bad stop bit
    #[arg(long, default_value_t = 0)]
    framing_faults: u32,

    /// Commands the keyboard answers with a resend request
    #[arg(long, default_value_t = 0)]
    refuse_commands: u32,

    /// Make the keyboard self-test fail
    #[arg(long)]
    fail_self_test: bool,

    /// Keyboard clocks commands in but never answers
    #[arg(long)]
    silent_keyboard: bool,

    /// Watchdog timeout in milliseconds
    #[arg(
        long,
        default_value_t = 2000,
        value_parser = clap::value_parser!(u64).range(1..=3_600_000)
    )]
    watchdog_ms: u64,

    /// Watchdog restarts allowed before giving up
    #[arg(long, default_value_t = 1)]
    max_restarts: u32,

    /// Write logs to a file instead of stderr
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn parse_scancode_arg(s: &str) -> Result<u8, String> {
    parse_hex_byte(s).ok_or_else(|| format!("{s:?} is not a hex byte"))
}

/// Host bytes as text: CR becomes a newline and other control bytes are
/// shown in hex.
fn write_host_byte(out: &mut impl Write, byte: u8, raw_mode: bool) -> io::Result<()> {
    match byte {
        b'\r' if raw_mode => out.write_all(b"\r\n"),
        b'\r' => out.write_all(b"\n"),
        b'\t' | 0x20..=0x7E => out.write_all(&[byte]),
        _ => write!(out, "<{byte:02X}>"),
    }
}

fn drain_host(host: &mpsc::Receiver<u8>, raw_mode: bool) -> io::Result<()> {
    let mut out = stdout().lock();
    for byte in host.try_iter() {
        write_host_byte(&mut out, byte, raw_mode)?;
    }
    out.flush()
}

fn queue_input(keys: &KeySender, text: Option<&str>, scancodes: &[u8]) {
    if let Some(text) = text {
        let skipped = keys.send_text(text);
        if !skipped.is_empty() {
            warn!("KBD: no key for {skipped:?}, skipped");
        }
    }
    for &code in scancodes {
        keys.send_raw(code);
    }
}

#[cfg(feature = "tui")]
fn run_interactive(
    bridge: &mut Bridge,
    keys: &KeySender,
    host: &mpsc::Receiver<u8>,
) -> Result<Option<ResetCause>, Box<dyn std::error::Error>> {
    use crate::host::keyboard::{CrosstermKeyboard, KeyboardCommand};
    use ratatui::crossterm::event;
    use std::time::Duration;

    let mut keyboard = CrosstermKeyboard::default();
    loop {
        if event::poll(Duration::from_millis(10))? {
            let event = event::read()?;
            if let Some(KeyboardCommand::Quit) = keyboard.update_keyboard(&event, keys) {
                return Ok(None);
            }
        }
        let result = bridge.run_for(10_000);
        drain_host(host, true)?;
        if let Err(cause) = result {
            return Ok(Some(cause));
        }
    }
}

#[cfg(feature = "tui")]
fn set_raw_mode(enabled: bool) -> io::Result<()> {
    use ratatui::crossterm::terminal;
    if enabled {
        terminal::enable_raw_mode()
    } else {
        terminal::disable_raw_mode()
    }
}

#[cfg(not(feature = "tui"))]
fn run_interactive(
    _bridge: &mut Bridge,
    _keys: &KeySender,
    _host: &mpsc::Receiver<u8>,
) -> Result<Option<ResetCause>, Box<dyn std::error::Error>> {
    Err("built without the tui feature".into())
}

#[cfg(not(feature = "tui"))]
fn set_raw_mode(_enabled: bool) -> io::Result<()> {
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let level = if args.verbose {
        Level::TRACE
    } else {
        Level::INFO
    };
    let interactive = args.interactive;
    match &args.log_file {
        Some(path) => setup_logging_file(level, path)?,
        None if interactive => setup_logging_file(level, Path::new("/tmp/ps2-bridge.log"))?,
        None => setup_logging_stdio(level),
    }

    let mut scancodes = args.scancodes.clone();
    if let Some(path) = &args.script {
        scancodes.extend(load_scancodes(path)?);
    }

    let keyboard_config = SimKeyboardConfig {
        parity_faults: args.parity_faults,
        framing_faults: args.framing_faults,
        refused_commands: args.refuse_commands,
        self_test_passes: !args.fail_self_test,
        silent: args.silent_keyboard,
        ..Default::default()
    };
    let config = BridgeConfig {
        watchdog_timeout_us: args.watchdog_ms * 1000,
        ..Default::default()
    };

    let clock = SimClock::new();
    let (keyboard, keys) = SimKeyboard::new(keyboard_config);
    let (bus, host) = SimHostBus::new();
    let wire = SimWire::new(clock.clone(), keyboard);
    let mut bridge: Bridge = Supervisor::new(wire, bus, clock, config);

    if interactive {
        set_raw_mode(true)?;
    }

    let mut restarts = 0;
    let mut input_queued = false;
    let outcome = loop {
        let booted = bridge.boot().and_then(|()| {
            if args.diagnose {
                bridge.diagnose().map(|_| ())
            } else {
                Ok(())
            }
        });
        let cause = match booted {
            Ok(()) => {
                if !input_queued {
                    queue_input(&keys, args.text.as_deref(), &scancodes);
                    input_queued = true;
                }
                let result = if interactive {
                    run_interactive(&mut bridge, &keys, &host)
                } else {
                    Ok(bridge
                        .run_until_quiet(QUIET_US, |wire| wire.is_idle())
                        .err())
                };
                drain_host(&host, interactive)?;
                match result {
                    Ok(None) => break Ok(()),
                    Ok(Some(cause)) => cause,
                    Err(err) => break Err(err),
                }
            }
            Err(cause) => cause,
        };

        info!("HOST: errors {}", bridge.counters());
        if restarts >= args.max_restarts {
            error!("HOST: giving up after {restarts} restarts: {cause}");
            break Err(cause.into());
        }
        restarts += 1;
        warn!("HOST: watchdog reset ({cause}), restart {restarts}");
        let (wire, bus, clock) = bridge.into_parts();
        bridge = Supervisor::new(wire, bus, clock, config);
    };

    if interactive {
        set_raw_mode(false)?;
    }

    let counters = bridge.counters();
    if counters.total() > 0 {
        warn!("HOST: errors {counters}");
    } else {
        info!("HOST: no errors");
    }
    let keyboard = bridge.port().keyboard();
    info!(
        "HOST: keyboard took {} command bytes over {} requests, scancode set {}, LEDs {:02X}",
        keyboard.received().len(),
        bridge.port().requests_to_send(),
        keyboard.codeset(),
        keyboard.leds()
    );
    outcome
}
