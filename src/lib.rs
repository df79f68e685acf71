pub mod app;
pub mod collector;
pub mod config;
pub mod dsn;
pub mod errors;
pub mod exporter;
pub mod prometheus;
pub mod server;
pub mod utils;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
