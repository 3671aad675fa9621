use std::path::{Path, PathBuf};

use crate::error::{Result, RunnerError};
use crate::run::Run;
use crate::schema::{list_control_files, ControlFileName, Fragment};

/// Maps a run and run number onto exactly one control file under a root.
///
/// The directory is scanned once when the resolver is built, so a resolver
/// should live for a single batch.
#[derive(Debug, Clone)]
pub struct FileResolver {
    group: Option<String>,
    keys: Vec<String>,
    files: Vec<PathBuf>,
}

impl FileResolver {
    pub fn scan(
        root: &Path,
        group: Option<&str>,
        keys: &[String],
        extension: &str,
    ) -> Result<Self> {
        Ok(Self::from_files(
            list_control_files(root, extension)?,
            group,
            keys,
        ))
    }

    pub fn from_files(files: Vec<PathBuf>, group: Option<&str>, keys: &[String]) -> Self {
        Self {
            group: group.map(str::to_string),
            keys: keys.to_vec(),
            files,
        }
    }

    /// Finds the control file for `run`.
    ///
    /// Each argument position must hold either the run's value or the key's
    /// `~key~` placeholder. With a run number the name must end in
    /// `_RUNNUMBER`; without one it must have no run-number token at all.
    pub fn resolve(&self, run: &Run, run_number: Option<&str>) -> Result<PathBuf> {
        let mut expected = Vec::with_capacity(self.keys.len());
        for key in &self.keys {
            match run.get(key) {
                Some(value) => expected.push((key.as_str(), value)),
                None => {
                    return Err(RunnerError::Resolution {
                        run: run.to_string(),
                        run_number: run_number.map(str::to_string),
                    })
                }
            }
        }

        let matches: Vec<&PathBuf> = self
            .files
            .iter()
            .filter(|path| self.file_matches(path, &expected, run_number))
            .collect();

        match matches.as_slice() {
            [single] => Ok((*single).clone()),
            [] => Err(RunnerError::Resolution {
                run: run.to_string(),
                run_number: run_number.map(str::to_string),
            }),
            many => Err(RunnerError::AmbiguousResolution {
                run: run.to_string(),
                run_number: run_number.map(str::to_string),
                candidates: many.iter().map(|p| (*p).clone()).collect(),
            }),
        }
    }

    fn file_matches(
        &self,
        path: &Path,
        expected: &[(&str, &str)],
        run_number: Option<&str>,
    ) -> bool {
        let Some(name) = ControlFileName::parse(path, self.group.as_deref()) else {
            return false;
        };
        let args = match run_number {
            Some(rn) => match name.tokens.split_last() {
                Some((Fragment::Literal(last), rest)) if last == rn => rest,
                _ => return false,
            },
            None => name.tokens.as_slice(),
        };
        args.len() == expected.len()
            && args
                .iter()
                .zip(expected)
                .all(|(token, (key, value))| token.matches(key, value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys() -> Vec<String> {
        vec!["s1".to_string(), "e1".to_string()]
    }

    fn resolver(files: &[&str], group: Option<&str>) -> FileResolver {
        FileResolver::from_files(files.iter().map(PathBuf::from).collect(), group, &keys())
    }

    #[test]
    fn resolves_the_literal_control_file_and_nothing_else() {
        let r = resolver(
            &[
                "model/EG16_Exg_Q100_006.tcf",
                "model/EG16_Exg_Q100_007.tcf",
                "model/EG16_Exg_Q200_006.tcf",
                "model/EG16_Dev_Q100_006.tcf",
                "model/EG16_Exg_Q100_0061.tcf",
                "model/EG16_Exg_Q100.tcf",
                "model/EG17_Exg_Q100_006.tcf",
            ],
            Some("EG16"),
        );
        let run = Run::from_pairs([("s1", "Exg"), ("e1", "Q100")]);
        let path = r.resolve(&run, Some("006")).expect("resolved");
        assert_eq!(path, PathBuf::from("model/EG16_Exg_Q100_006.tcf"));
    }

    #[test]
    fn placeholders_stand_in_for_any_value() {
        let r = resolver(
            &["EG16_~s1~_~e1~_001.tcf", "EG16_~s1~_~e1~_002.tcf"],
            Some("EG16"),
        );
        let run = Run::from_pairs([("s1", "Dev"), ("e1", "Q020")]);
        assert_eq!(
            r.resolve(&run, Some("002")).expect("resolved"),
            PathBuf::from("EG16_~s1~_~e1~_002.tcf")
        );
    }

    #[test]
    fn missing_run_number_requires_an_unnumbered_file() {
        let r = resolver(&["model_~s1~_~e1~.tcf", "model_~s1~_~e1~_001.tcf"], None);
        let run = Run::from_pairs([("s1", "Exg"), ("e1", "Q100")]);
        assert_eq!(
            r.resolve(&run, None).expect("resolved"),
            PathBuf::from("model_~s1~_~e1~.tcf")
        );
        assert_eq!(
            r.resolve(&run, Some("001")).expect("resolved"),
            PathBuf::from("model_~s1~_~e1~_001.tcf")
        );
    }

    #[test]
    fn zero_matches_is_a_resolution_error() {
        let r = resolver(&["EG16_~s1~_~e1~_001.tcf"], Some("EG16"));
        let run = Run::from_pairs([("s1", "Exg"), ("e1", "Q100")]);
        let err = r.resolve(&run, Some("009")).expect_err("no file");
        assert_eq!(err.code(), "resolution_failed");

        // a run missing a schema key cannot be rendered at all
        let partial = Run::from_pairs([("s1", "Exg")]);
        assert_eq!(
            r.resolve(&partial, Some("001")).expect_err("missing key").code(),
            "resolution_failed"
        );
    }

    #[test]
    fn several_matches_is_ambiguous() {
        let r = resolver(
            &["a/EG16_~s1~_~e1~_001.tcf", "b/EG16_Exg_Q100_001.tcf"],
            Some("EG16"),
        );
        let run = Run::from_pairs([("s1", "Exg"), ("e1", "Q100")]);
        match r.resolve(&run, Some("001")) {
            Err(RunnerError::AmbiguousResolution { candidates, .. }) => {
                assert_eq!(candidates.len(), 2)
            }
            other => panic!("expected ambiguous resolution, got {:?}", other),
        }
    }

    #[test]
    fn scan_walks_the_root_recursively() {
        let dir = tempfile::tempdir().expect("tempdir");
        let nested = dir.path().join("runs").join("deep");
        std::fs::create_dir_all(&nested).expect("dirs");
        std::fs::write(nested.join("EG16_Exg_Q100_006.tcf"), b"").expect("tcf");
        std::fs::write(nested.join("EG16_Exg_Q100_006.tgc"), b"").expect("tgc");

        let r = FileResolver::scan(dir.path(), Some("EG16"), &keys(), "tcf").expect("scan");
        let run = Run::from_pairs([("s1", "Exg"), ("e1", "Q100")]);
        assert_eq!(
            r.resolve(&run, Some("006")).expect("resolved"),
            nested.join("EG16_Exg_Q100_006.tcf")
        );
    }
}
