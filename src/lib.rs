pub mod config;
pub mod editorial;
pub mod errors;
pub mod orchestrator;
pub mod server;
pub mod telemetry;
