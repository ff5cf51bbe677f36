pub mod call;
pub mod cli;
pub mod config;
pub mod session;
pub mod telemetry;
