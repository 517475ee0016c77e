pub mod collaborators;
pub mod machine;
pub mod runner;
pub mod state;

pub use machine::Orchestrator;
pub use runner::{RunOptions, RunOutcome, Runner};
pub use state::{PipelineState, StateStore};
