pub mod pipeline;
pub mod runner;
pub mod state;

pub use pipeline::Orchestrator;
pub use runner::{AgentRunner, PhaseRunner, RawResult};
pub use state::{PhaseStatus, ProgressTracker, RunProgress};
