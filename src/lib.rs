pub mod audit;
pub mod cache;
pub mod conductor_config;
pub mod config;
pub mod errors;
pub mod orchestrator;
pub mod phase;
pub mod state;
pub mod telemetry;
pub mod tracker;
pub mod ui;
pub mod util;
