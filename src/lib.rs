pub mod commands;
pub mod comms;
pub mod config;
pub mod proxy;
pub mod security;
pub mod utils;

// Crate version exposed for runtime queries
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
