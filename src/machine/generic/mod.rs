pub mod clock;
pub mod host_bus;
pub mod ps2kbd;
pub mod wire;
