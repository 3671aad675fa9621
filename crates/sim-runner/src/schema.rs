//! Argument schema inference from control-file names.
//!
//! Control files follow `GROUPID(_FRAGMENT)*[_RUNNUMBER].ext`. A fragment of
//! the form `~key~` names a scenario argument the engine substitutes at run
//! time; any other fragment is literal text. A trailing literal fragment is
//! the run number.

use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::debug;

use crate::error::{Result, RunnerError};
use crate::run::Run;

/// One `_`-separated token of a control-file stem, after the group prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fragment {
    Placeholder(String),
    Literal(String),
}

impl Fragment {
    fn parse(token: &str) -> Self {
        match token
            .strip_prefix('~')
            .and_then(|rest| rest.strip_suffix('~'))
        {
            Some(key) if !key.is_empty() && !key.contains('~') => {
                Fragment::Placeholder(key.to_string())
            }
            _ => Fragment::Literal(token.to_string()),
        }
    }

    /// True when this token stands for `key` carrying `value`.
    pub fn matches(&self, key: &str, value: &str) -> bool {
        match self {
            Fragment::Placeholder(k) => k == key,
            Fragment::Literal(v) => v == value,
        }
    }
}

/// Parsed form of a control-file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlFileName {
    pub group: String,
    /// Every token after the group, run-number token included.
    pub tokens: Vec<Fragment>,
}

impl ControlFileName {
    /// Parses the stem of `path`. With `group` set, the stem must be the group
    /// itself or continue it with `_`; otherwise the first token is taken as
    /// the group.
    pub fn parse(path: &Path, group: Option<&str>) -> Option<Self> {
        let stem = path.file_stem()?.to_str()?;
        let (group, rest) = match group {
            Some(g) => {
                let rest = stem.strip_prefix(g)?;
                if rest.is_empty() {
                    (g.to_string(), "")
                } else {
                    (g.to_string(), rest.strip_prefix('_')?)
                }
            }
            None => match stem.split_once('_') {
                Some((g, rest)) => (g.to_string(), rest),
                None => (stem.to_string(), ""),
            },
        };
        if group.is_empty() {
            return None;
        }
        let tokens = if rest.is_empty() {
            Vec::new()
        } else {
            rest.split('_').map(Fragment::parse).collect()
        };
        Some(Self { group, tokens })
    }

    /// Placeholder keys in file order.
    pub fn keys(&self) -> Vec<String> {
        self.tokens
            .iter()
            .filter_map(|t| match t {
                Fragment::Placeholder(k) => Some(k.clone()),
                Fragment::Literal(_) => None,
            })
            .collect()
    }

    pub fn run_number(&self) -> Option<&str> {
        match self.tokens.last() {
            Some(Fragment::Literal(rn)) => Some(rn.as_str()),
            _ => None,
        }
    }
}

/// Files under `root` (recursively) with the given extension, sorted by path.
pub fn list_control_files(root: &Path, extension: &str) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in walkdir::WalkDir::new(root).sort_by_file_name() {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let matches_ext = entry
            .path()
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.eq_ignore_ascii_case(extension))
            .unwrap_or(false);
        if matches_ext {
            files.push(entry.into_path());
        }
    }
    Ok(files)
}

/// The canonical ordered argument keys for one group of control files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArgumentSchema {
    pub group: Option<String>,
    pub keys: Vec<String>,
    pub files: Vec<PathBuf>,
    pub run_numbers: BTreeSet<String>,
    /// Keys were supplied by the caller rather than inferred.
    pub declared: bool,
}

impl ArgumentSchema {
    /// Scans `root` for control files of `group` and infers their key order.
    ///
    /// Every file in the group must carry the same key set; the first file
    /// (in path order) that disagrees with the first-seen set fails the scan.
    pub fn infer(root: &Path, group: Option<&str>, extension: &str) -> Result<Self> {
        let mut keys: Vec<String> = Vec::new();
        let mut reference: Option<(PathBuf, BTreeSet<String>)> = None;
        let mut files = Vec::new();
        let mut run_numbers = BTreeSet::new();

        for path in list_control_files(root, extension)? {
            let Some(name) = ControlFileName::parse(&path, group) else {
                continue;
            };
            let file_keys = name.keys();
            let key_set: BTreeSet<String> = file_keys.iter().cloned().collect();
            match &reference {
                None => reference = Some((path.clone(), key_set)),
                Some((_, expected)) if *expected != key_set => {
                    return Err(RunnerError::SchemaMismatch {
                        subject: format!("control file {}", path.display()),
                        expected: keys,
                        found: file_keys,
                    });
                }
                Some(_) => {}
            }
            for key in file_keys {
                if !keys.contains(&key) {
                    keys.push(key);
                }
            }
            if let Some(rn) = name.run_number() {
                run_numbers.insert(rn.to_string());
            }
            files.push(path);
        }

        if files.is_empty() {
            return Err(RunnerError::NoControlFiles {
                root: root.to_path_buf(),
                group: group.map(str::to_string),
                extension: extension.to_string(),
            });
        }
        debug!(
            group = group.unwrap_or("*"),
            files = files.len(),
            keys = ?keys,
            "inferred argument schema"
        );
        Ok(Self {
            group: group.map(str::to_string),
            keys,
            files,
            run_numbers,
            declared: false,
        })
    }

    /// A schema taken on faith from the caller; nothing on disk is checked.
    pub fn declared(keys: Vec<String>, group: Option<&str>) -> Self {
        Self {
            group: group.map(str::to_string),
            keys,
            files: Vec::new(),
            run_numbers: BTreeSet::new(),
            declared: true,
        }
    }

    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    /// Fails unless `run` uses exactly this schema's key set.
    pub fn validate(&self, run: &Run) -> Result<()> {
        let expected: HashSet<&str> = self.keys.iter().map(String::as_str).collect();
        let found: HashSet<&str> = run.keys().collect();
        if expected == found {
            return Ok(());
        }
        Err(RunnerError::SchemaMismatch {
            subject: format!("run {}", run),
            expected: self.keys.clone(),
            found: run.sorted_keys(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn touch(dir: &Path, rel: &str) {
        let path = dir.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("parent dir");
        }
        fs::write(path, b"").expect("touch");
    }

    #[test]
    fn fragments_distinguish_placeholders_from_literals() {
        assert_eq!(Fragment::parse("~s1~"), Fragment::Placeholder("s1".to_string()));
        assert_eq!(Fragment::parse("Q100"), Fragment::Literal("Q100".to_string()));
        assert_eq!(Fragment::parse("~~"), Fragment::Literal("~~".to_string()));
        assert!(Fragment::parse("~e1~").matches("e1", "anything"));
        assert!(Fragment::parse("Q100").matches("e1", "Q100"));
        assert!(!Fragment::parse("Q100").matches("e1", "Q200"));
    }

    #[test]
    fn control_file_name_respects_group_token_boundary() {
        let name = ControlFileName::parse(Path::new("EG16_~s1~_~e1~_006.tcf"), Some("EG16"))
            .expect("parsed");
        assert_eq!(name.keys(), vec!["s1", "e1"]);
        assert_eq!(name.run_number(), Some("006"));

        assert!(ControlFileName::parse(Path::new("EG16b_~s1~_006.tcf"), Some("EG16")).is_none());

        let implicit = ControlFileName::parse(Path::new("model_~s1~_~e1~_~e2~.tcf"), None)
            .expect("parsed");
        assert_eq!(implicit.group, "model");
        assert_eq!(implicit.run_number(), None);
    }

    #[test]
    fn infer_collects_keys_in_first_seen_order_and_run_numbers() {
        let dir = tempfile::tempdir().expect("tempdir");
        touch(dir.path(), "EG16_~s1~_~e1~_001.tcf");
        touch(dir.path(), "nested/EG16_~s1~_~e1~_002.tcf");
        touch(dir.path(), "OTHER_~x~_001.tcf");
        touch(dir.path(), "EG16_notes.txt");

        let schema = ArgumentSchema::infer(dir.path(), Some("EG16"), "tcf").expect("schema");
        assert_eq!(schema.keys(), &["s1".to_string(), "e1".to_string()]);
        assert_eq!(schema.files.len(), 2);
        assert_eq!(
            schema.run_numbers.iter().cloned().collect::<Vec<_>>(),
            vec!["001".to_string(), "002".to_string()]
        );
        assert!(!schema.declared);
    }

    #[test]
    fn infer_fails_when_a_group_disagrees_on_its_keys() {
        let dir = tempfile::tempdir().expect("tempdir");
        touch(dir.path(), "G_~s1~_~e1~_001.tcf");
        touch(dir.path(), "G_~s1~_~e1~_~e2~_002.tcf");

        let err = ArgumentSchema::infer(dir.path(), Some("G"), "tcf").expect_err("mismatch");
        assert!(err.is_schema_mismatch(), "unexpected error: {}", err);
        assert!(err.to_string().contains("G_~s1~_~e1~_~e2~_002.tcf"), "{}", err);
    }

    #[test]
    fn implicit_group_spans_every_control_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        touch(dir.path(), "a_~s1~_001.tcf");
        touch(dir.path(), "b_~e1~_001.tcf");

        let err = ArgumentSchema::infer(dir.path(), None, "tcf").expect_err("mismatch");
        assert!(err.is_schema_mismatch());
    }

    #[test]
    fn infer_reports_missing_control_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        touch(dir.path(), "G_~s1~_001.txt");
        let err = ArgumentSchema::infer(dir.path(), Some("G"), "tcf").expect_err("empty");
        assert_eq!(err.code(), "no_control_files");
    }

    #[test]
    fn validate_requires_the_exact_key_set() {
        let schema = ArgumentSchema::declared(vec!["s1".to_string(), "e1".to_string()], None);
        assert!(schema.declared);
        schema
            .validate(&Run::from_pairs([("e1", "Q100"), ("s1", "Exg")]))
            .expect("exact match");

        let subset = schema.validate(&Run::from_pairs([("s1", "Exg")]));
        assert!(subset.expect_err("subset").is_schema_mismatch());

        let superset =
            schema.validate(&Run::from_pairs([("s1", "Exg"), ("e1", "Q100"), ("e2", "x")]));
        assert!(superset.expect_err("superset").is_schema_mismatch());
    }
}
