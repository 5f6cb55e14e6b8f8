pub mod bridge;
pub mod generic;
