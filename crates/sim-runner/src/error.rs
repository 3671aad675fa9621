use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while staging, resolving or dispatching runs.
///
/// Staging-time variants are returned synchronously to the caller. Dispatch-time
/// variants (`Resolution`, `AmbiguousResolution`, `ProcessExit`, `Spawn`) are
/// recorded against the affected run and never abort the rest of a batch.
#[derive(Debug, Error)]
pub enum RunnerError {
    /// A run, or a control file, does not carry the key set of its group.
    #[error("schema_mismatch: {subject} has keys [{}], expected [{}]", .found.join(", "), .expected.join(", "))]
    SchemaMismatch {
        subject: String,
        expected: Vec<String>,
        found: Vec<String>,
    },

    #[error("no_control_files: no .{extension} files{} under {}", group_suffix(.group), .root.display())]
    NoControlFiles {
        root: PathBuf,
        group: Option<String>,
        extension: String,
    },

    #[error("resolution_failed: no control file matches {run} (run number: {})", .run_number.as_deref().unwrap_or("none"))]
    Resolution {
        run: String,
        run_number: Option<String>,
    },

    #[error(
        "ambiguous_resolution: {} control files match {run} (run number: {}): {}",
        .candidates.len(),
        .run_number.as_deref().unwrap_or("none"),
        display_paths(.candidates)
    )]
    AmbiguousResolution {
        run: String,
        run_number: Option<String>,
        candidates: Vec<PathBuf>,
    },

    #[error("process_exit: {label} exited with {}", .code.map(|c| c.to_string()).unwrap_or_else(|| "signal".to_string()))]
    ProcessExit { label: String, code: Option<i32> },

    #[error("spawn_failed: executable \"{}\" could not be started: {source}", .program.display())]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid_config: {0}")]
    Config(String),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("walk: {0}")]
    Walk(#[from] walkdir::Error),

    #[error("yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

pub type Result<T> = std::result::Result<T, RunnerError>;

impl RunnerError {
    /// Stable snake_case code, used for machine-readable output.
    pub fn code(&self) -> &'static str {
        match self {
            RunnerError::SchemaMismatch { .. } => "schema_mismatch",
            RunnerError::NoControlFiles { .. } => "no_control_files",
            RunnerError::Resolution { .. } => "resolution_failed",
            RunnerError::AmbiguousResolution { .. } => "ambiguous_resolution",
            RunnerError::ProcessExit { .. } => "process_exit",
            RunnerError::Spawn { .. } => "spawn_failed",
            RunnerError::Config(_) => "invalid_config",
            RunnerError::Io(_) => "io",
            RunnerError::Walk(_) => "walk",
            RunnerError::Yaml(_) => "yaml",
        }
    }

    pub fn is_schema_mismatch(&self) -> bool {
        matches!(self, RunnerError::SchemaMismatch { .. })
    }

    /// True for errors that map a run onto the wrong number of control files.
    pub fn is_resolution(&self) -> bool {
        matches!(
            self,
            RunnerError::Resolution { .. } | RunnerError::AmbiguousResolution { .. }
        )
    }
}

fn group_suffix(group: &Option<String>) -> String {
    match group {
        Some(g) => format!(" for group {}", g),
        None => String::new(),
    }
}

fn display_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
