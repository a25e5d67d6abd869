//! Phase execution engine and the shutdown coordinator wrapped around it.

pub mod executor;
pub mod runner;
pub mod shutdown;

pub use executor::{BatchResult, IssueJob, IssueResult, PhaseEvent, PhaseExecutor, QualityLoop};
pub use runner::{AgentRunner, PhaseResult};
pub use shutdown::{CleanupFn, ExitHandler, ShutdownCoordinator, ShutdownState, TerminationSignal};
