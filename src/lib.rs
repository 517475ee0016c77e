pub mod adapters;
pub mod config;
pub mod deploy;
pub mod errors;
pub mod gates;
pub mod orchestrator;
pub mod phase;
pub mod pipeline_config;
pub mod profile;
pub mod review;
pub mod sandbox;
pub mod signoff;
pub mod ui;
