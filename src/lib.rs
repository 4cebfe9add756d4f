pub mod checker;
pub mod config;
pub mod errors;
pub mod telemetry;
