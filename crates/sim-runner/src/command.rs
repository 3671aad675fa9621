//! Engine-specific translation of a run into a process invocation.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Command;

use serde::{Deserialize, Serialize};

use crate::config::RunnerConfig;
use crate::error::{Result, RunnerError};
use crate::run::Run;

/// Builds the executable path and argument vector for one engine family.
///
/// Implementations must be pure: the same configuration, run and control file
/// always give the same invocation.
pub trait CommandBuilder: Send + Sync {
    fn name(&self) -> &str;

    fn executable(&self, config: &RunnerConfig) -> Result<PathBuf>;

    /// Scenario arguments rendered as engine flags, in `keys` order.
    fn run_arguments(&self, run: &Run, keys: &[String]) -> Vec<String>;

    /// `[flags…, run arguments…, control file]`.
    fn arguments(
        &self,
        config: &RunnerConfig,
        run: &Run,
        keys: &[String],
        control_file: &Path,
    ) -> Vec<OsString> {
        let mut args: Vec<OsString> = config
            .flags
            .iter()
            .filter(|f| !f.is_empty())
            .map(OsString::from)
            .collect();
        args.extend(self.run_arguments(run, keys).into_iter().map(OsString::from));
        args.push(control_file.as_os_str().to_os_string());
        args
    }
}

/// TUFLOW layout: `exec_path/version/TUFLOW_i{SP|DP}_w64.exe`, scenario and
/// event arguments passed as `-s1 value -e1 value`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TuflowBuilder;

impl CommandBuilder for TuflowBuilder {
    fn name(&self) -> &str {
        "tuflow"
    }

    fn executable(&self, config: &RunnerConfig) -> Result<PathBuf> {
        if config.version.is_empty() {
            return Err(RunnerError::Config(
                "version is required for the tuflow engine".to_string(),
            ));
        }
        let exe = format!("TUFLOW_i{}_w64.exe", config.precision.tag());
        Ok(config.exec_path.join(&config.version).join(exe))
    }

    fn run_arguments(&self, run: &Run, keys: &[String]) -> Vec<String> {
        run.pairs_for(keys)
            .flat_map(|(k, v)| [format!("-{}", k), v.to_string()])
            .collect()
    }
}

/// `exec_path` is the executable itself; arguments are `{prefix}{key} value`.
#[derive(Debug, Clone)]
pub struct DirectBuilder {
    pub flag_prefix: String,
}

impl Default for DirectBuilder {
    fn default() -> Self {
        Self {
            flag_prefix: "-".to_string(),
        }
    }
}

impl CommandBuilder for DirectBuilder {
    fn name(&self) -> &str {
        "direct"
    }

    fn executable(&self, config: &RunnerConfig) -> Result<PathBuf> {
        if config.exec_path.as_os_str().is_empty() {
            return Err(RunnerError::Config("exec_path must not be empty".to_string()));
        }
        Ok(config.exec_path.clone())
    }

    fn run_arguments(&self, run: &Run, keys: &[String]) -> Vec<String> {
        run.pairs_for(keys)
            .flat_map(|(k, v)| [format!("{}{}", self.flag_prefix, k), v.to_string()])
            .collect()
    }
}

/// Engine families selectable from a batch file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    #[default]
    Tuflow,
    Direct,
}

impl EngineKind {
    pub fn builder(self) -> Box<dyn CommandBuilder> {
        match self {
            EngineKind::Tuflow => Box::new(TuflowBuilder),
            EngineKind::Direct => Box::new(DirectBuilder::default()),
        }
    }
}

/// A fully resolved process invocation for one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub control_file: PathBuf,
    pub output_file: PathBuf,
}

impl Invocation {
    pub fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        cmd
    }

    /// Program and arguments as display strings.
    pub fn argv(&self) -> Vec<String> {
        std::iter::once(self.program.as_os_str())
            .chain(self.args.iter().map(OsString::as_os_str))
            .map(|s| s.to_string_lossy().into_owned())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Precision;

    fn keys() -> Vec<String> {
        vec!["s1".to_string(), "e1".to_string()]
    }

    #[test]
    fn tuflow_executable_follows_version_and_precision() {
        let config = RunnerConfig::new("/opt/tuflow", "/model", "2023-03-AD", Precision::Single);
        let exe = TuflowBuilder.executable(&config).expect("exe");
        assert_eq!(
            exe,
            PathBuf::from("/opt/tuflow/2023-03-AD/TUFLOW_iSP_w64.exe")
        );

        let mut no_version = config;
        no_version.version.clear();
        assert!(TuflowBuilder.executable(&no_version).is_err());
    }

    #[test]
    fn arguments_put_flags_first_and_control_file_last() {
        let config = RunnerConfig::new("/opt/tuflow", "/model", "v1", Precision::Double)
            .with_flags(["-b", "", "-nmb"]);
        let run = Run::from_pairs([("e1", "Q100"), ("s1", "Exg")]);
        let args = TuflowBuilder.arguments(
            &config,
            &run,
            &keys(),
            Path::new("/model/EG16_~s1~_~e1~_006.tcf"),
        );
        let args: Vec<String> = args
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            args,
            vec![
                "-b",
                "-nmb",
                "-s1",
                "Exg",
                "-e1",
                "Q100",
                "/model/EG16_~s1~_~e1~_006.tcf"
            ]
        );
    }

    #[test]
    fn builders_are_pure() {
        let config = RunnerConfig::new("/opt/tuflow", "/model", "v1", Precision::Double);
        let run = Run::from_pairs([("s1", "Exg"), ("e1", "Q100")]);
        let control = Path::new("/model/a.tcf");
        let first = TuflowBuilder.arguments(&config, &run, &keys(), control);
        let second = TuflowBuilder.arguments(&config, &run, &keys(), control);
        assert_eq!(first, second);
    }

    #[test]
    fn direct_builder_uses_exec_path_and_prefix() {
        let config = RunnerConfig::new("sim-engine", "/model", "", Precision::Double);
        let builder = DirectBuilder {
            flag_prefix: "--".to_string(),
        };
        assert_eq!(
            builder.executable(&config).expect("exe"),
            PathBuf::from("sim-engine")
        );
        let run = Run::from_pairs([("s1", "Exg"), ("e1", "Q100")]);
        assert_eq!(
            builder.run_arguments(&run, &keys()),
            vec!["--s1", "Exg", "--e1", "Q100"]
        );
    }

    #[test]
    fn engine_kind_selects_a_builder() {
        assert_eq!(EngineKind::Tuflow.builder().name(), "tuflow");
        assert_eq!(EngineKind::Direct.builder().name(), "direct");
    }

    #[test]
    fn invocation_argv_starts_with_the_program() {
        let inv = Invocation {
            program: PathBuf::from("/bin/engine"),
            args: vec![OsString::from("-b"), OsString::from("model.tcf")],
            control_file: PathBuf::from("model.tcf"),
            output_file: PathBuf::from("run_NA.out"),
        };
        assert_eq!(inv.argv(), vec!["/bin/engine", "-b", "model.tcf"]);
        assert_eq!(inv.command().get_program(), "/bin/engine");
    }
}
