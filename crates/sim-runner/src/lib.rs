//! Batch execution of a simulation engine over a set of scenario runs.
//!
//! A [`Runner`] stages runs (maps of argument key to value) against the
//! argument schema inferred from the control files under a project root,
//! resolves each run to one control file, and dispatches the engine with
//! bounded concurrency.

pub mod command;
pub mod config;
pub mod error;
pub mod resolver;
pub mod run;
pub mod runner;
pub mod schema;
pub mod store;
pub mod supervisor;

pub use command::{CommandBuilder, DirectBuilder, EngineKind, Invocation, TuflowBuilder};
pub use config::{BatchFile, Precision, RunnerConfig};
pub use error::{Result, RunnerError};
pub use resolver::FileResolver;
pub use run::Run;
pub use runner::{PlannedRun, Runner};
pub use schema::ArgumentSchema;
pub use store::{MatchMode, RunStore};
pub use supervisor::{BatchReport, RunEvent, RunOutcome, RunState, StopHandle};
