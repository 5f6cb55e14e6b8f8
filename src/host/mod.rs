#[cfg(feature = "tui")]
pub mod keyboard;
pub mod logging;
pub mod script;
