use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::command::EngineKind;
use crate::error::{Result, RunnerError};
use crate::run::Run;

/// Floating-point build of the engine executable. Read case-insensitively,
/// written as `SP`/`DP`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Precision {
    Single,
    #[default]
    Double,
}

impl Precision {
    pub fn tag(self) -> &'static str {
        match self {
            Precision::Single => "SP",
            Precision::Double => "DP",
        }
    }
}

impl fmt::Display for Precision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for Precision {
    type Err = RunnerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "SP" => Ok(Precision::Single),
            "DP" => Ok(Precision::Double),
            other => Err(RunnerError::Config(format!(
                "invalid precision '{}': must be 'SP' or 'DP'",
                other
            ))),
        }
    }
}

impl TryFrom<String> for Precision {
    type Error = RunnerError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Precision> for String {
    fn from(value: Precision) -> Self {
        value.tag().to_string()
    }
}

fn default_async_runs() -> usize {
    1
}

fn default_extension() -> String {
    "tcf".to_string()
}

/// Settings read when a batch is dispatched.
///
/// A [`Runner`](crate::Runner) clones this at the start of every batch, so
/// edits made between two `run` calls apply to the next batch only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Directory holding the engine builds, or the executable itself for
    /// engines that do not follow a versioned layout.
    pub exec_path: PathBuf,
    /// Project directory searched for control files.
    pub root: PathBuf,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub precision: Precision,
    /// Passed to the executable ahead of the run arguments, in order.
    #[serde(default)]
    pub flags: Vec<String>,
    #[serde(default = "default_async_runs")]
    pub async_runs: usize,
    /// Where per-run output files are written. Defaults to the working
    /// directory.
    #[serde(default, alias = "stdout")]
    pub output_dir: Option<PathBuf>,
    #[serde(default)]
    pub group: Option<String>,
    /// Explicit argument keys; skips inference from control-file names.
    #[serde(default)]
    pub run_args: Option<Vec<String>>,
    #[serde(default = "default_extension")]
    pub extension: String,
}

impl RunnerConfig {
    pub fn new(
        exec_path: impl Into<PathBuf>,
        root: impl Into<PathBuf>,
        version: impl Into<String>,
        precision: Precision,
    ) -> Self {
        Self {
            exec_path: exec_path.into(),
            root: root.into(),
            version: version.into(),
            precision,
            flags: Vec::new(),
            async_runs: default_async_runs(),
            output_dir: None,
            group: None,
            run_args: None,
            extension: default_extension(),
        }
    }

    pub fn with_flags<I, S>(mut self, flags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.flags = flags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_async_runs(mut self, async_runs: usize) -> Self {
        self.async_runs = async_runs;
        self
    }

    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = Some(dir.into());
        self
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    pub fn with_run_args<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.run_args = Some(keys.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = extension.into();
        self
    }

    /// Output directory, falling back to the current working directory.
    pub fn output_dir(&self) -> Result<PathBuf> {
        match &self.output_dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(std::env::current_dir()?),
        }
    }

    /// Checks the settings a batch cannot start without.
    pub fn validate(&self) -> Result<()> {
        if self.async_runs == 0 {
            return Err(RunnerError::Config(
                "async_runs must be at least 1".to_string(),
            ));
        }
        if !self.root.is_dir() {
            return Err(RunnerError::Config(format!(
                "root directory does not exist: {}",
                self.root.display()
            )));
        }
        let out = self.output_dir()?;
        if !out.is_dir() {
            return Err(RunnerError::Config(format!(
                "output directory does not exist: {}",
                out.display()
            )));
        }
        if self.extension.trim_start_matches('.').is_empty() {
            return Err(RunnerError::Config(
                "extension must not be empty".to_string(),
            ));
        }
        if let Some(group) = &self.group {
            if group.is_empty() {
                return Err(RunnerError::Config("group must not be empty".to_string()));
            }
        }
        Ok(())
    }

    pub(crate) fn extension(&self) -> &str {
        self.extension.trim_start_matches('.')
    }

    /// Rebases relative paths onto `base`. A bare program name in `exec_path`
    /// is left alone so it is still looked up on `PATH`.
    pub fn resolve_relative(&mut self, base: &Path) {
        fn rebase(base: &Path, path: &mut PathBuf) {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        }
        if self.exec_path.components().count() > 1 {
            rebase(base, &mut self.exec_path);
        }
        rebase(base, &mut self.root);
        if let Some(out) = self.output_dir.as_mut() {
            rebase(base, out);
        }
    }
}

/// A batch description loaded from YAML: engine, configuration and runs.
///
/// ```yaml
/// engine: tuflow
/// exec_path: C:/TUFLOW
/// root: model/runs
/// version: 2023-03-AD
/// precision: DP
/// async_runs: 2
/// group: EG16
/// runs:
///   - { s1: Exg, e1: Q100 }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchFile {
    #[serde(default)]
    pub engine: EngineKind,
    #[serde(flatten)]
    pub config: RunnerConfig,
    #[serde(default)]
    pub runs: Vec<Run>,
}

impl BatchFile {
    pub fn from_yaml(raw: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(raw)?)
    }

    /// Reads `path`; relative paths inside are taken from the file's directory.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).map_err(|e| {
            RunnerError::Config(format!("cannot read batch file {}: {}", path.display(), e))
        })?;
        let mut batch = Self::from_yaml(&raw)?;
        let base = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        batch.config.resolve_relative(base);
        Ok(batch)
    }
}
