use std::collections::HashSet;
use std::ops::Index;
use std::slice::SliceIndex;

use crate::error::Result;
use crate::run::Run;
use crate::schema::ArgumentSchema;

/// How filter values are combined in [`RunStore::filter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MatchMode {
    /// Keep runs carrying at least one of the values.
    #[default]
    Any,
    /// Keep runs carrying every one of the values.
    All,
}

impl From<bool> for MatchMode {
    fn from(any: bool) -> Self {
        if any {
            MatchMode::Any
        } else {
            MatchMode::All
        }
    }
}

/// Ordered, duplicate-free collection of staged runs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunStore {
    runs: Vec<Run>,
}

impl RunStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Union of `sources` in order. A run already taken from an earlier source
    /// is skipped.
    pub fn merge<'a, I>(sources: I) -> Self
    where
        I: IntoIterator<Item = &'a RunStore>,
    {
        let mut store = Self::new();
        for source in sources {
            for run in source.iter() {
                store.push_unique(run.clone());
            }
        }
        store
    }

    /// Validates every candidate against `schema`, then appends the ones not
    /// already present. On a validation failure nothing is added.
    ///
    /// Returns the number of runs actually appended.
    pub fn stage<I>(&mut self, runs: I, schema: &ArgumentSchema) -> Result<usize>
    where
        I: IntoIterator<Item = Run>,
    {
        let candidates: Vec<Run> = runs.into_iter().collect();
        for run in &candidates {
            schema.validate(run)?;
        }
        let mut added = 0;
        for run in candidates {
            if self.push_unique(run) {
                added += 1;
            }
        }
        Ok(added)
    }

    fn push_unique(&mut self, run: Run) -> bool {
        if self.runs.contains(&run) {
            return false;
        }
        self.runs.push(run);
        true
    }

    /// Runs whose values intersect (`Any`) or include all of (`All`) `values`,
    /// compared against every argument value regardless of key. An empty
    /// filter returns every run.
    pub fn filter<S: AsRef<str>>(&self, values: &[S], mode: MatchMode) -> Vec<&Run> {
        if values.is_empty() {
            return self.runs.iter().collect();
        }
        let wanted: HashSet<&str> = values.iter().map(AsRef::as_ref).collect();
        self.runs
            .iter()
            .filter(|run| {
                let present = wanted.iter().filter(|v| run.contains_value(v)).count();
                match mode {
                    MatchMode::Any => present > 0,
                    MatchMode::All => present == wanted.len(),
                }
            })
            .collect()
    }

    /// Removes every run value-equal to one of `runs`. Returns how many were
    /// removed; runs that are not staged are ignored.
    pub fn remove<'a, I>(&mut self, runs: I) -> usize
    where
        I: IntoIterator<Item = &'a Run>,
    {
        let doomed: Vec<&Run> = runs.into_iter().collect();
        let before = self.runs.len();
        self.runs.retain(|r| !doomed.contains(&r));
        before - self.runs.len()
    }

    pub fn get(&self, index: usize) -> Option<&Run> {
        self.runs.get(index)
    }

    /// A detached store holding the runs in `range`, or `None` when the range
    /// is out of bounds.
    pub fn slice<R>(&self, range: R) -> Option<RunStore>
    where
        R: SliceIndex<[Run], Output = [Run]>,
    {
        self.runs.get(range).map(|runs| RunStore {
            runs: runs.to_vec(),
        })
    }

    pub fn contains(&self, run: &Run) -> bool {
        self.runs.contains(run)
    }

    pub fn len(&self) -> usize {
        self.runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Run> {
        self.runs.iter()
    }

    pub fn as_slice(&self) -> &[Run] {
        &self.runs
    }
}

impl Index<usize> for RunStore {
    type Output = Run;

    fn index(&self, index: usize) -> &Run {
        &self.runs[index]
    }
}

impl<'a> IntoIterator for &'a RunStore {
    type Item = &'a Run;
    type IntoIter = std::slice::Iter<'a, Run>;

    fn into_iter(self) -> Self::IntoIter {
        self.runs.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn abc_schema() -> ArgumentSchema {
        ArgumentSchema::declared(vec!["a".into(), "b".into(), "c".into()], None)
    }

    fn run(a: &str, b: &str, c: &str) -> Run {
        Run::from_pairs([("a", a), ("b", b), ("c", c)])
    }

    fn staged(runs: &[Run]) -> RunStore {
        let mut store = RunStore::new();
        store
            .stage(runs.iter().cloned(), &abc_schema())
            .expect("stage");
        store
    }

    #[test]
    fn staging_the_same_run_twice_keeps_one_copy() {
        let schema = abc_schema();
        let mut store = RunStore::new();
        assert_eq!(store.stage([run("1", "2", "3")], &schema).expect("stage"), 1);
        assert_eq!(store.stage([run("1", "2", "3")], &schema).expect("stage"), 0);
        assert_eq!(
            store
                .stage([run("1", "2", "3"), run("1", "2", "3")], &schema)
                .expect("stage"),
            0
        );
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn staging_is_all_or_nothing() {
        let schema = abc_schema();
        let mut store = staged(&[run("1", "2", "3")]);
        let bad = Run::from_pairs([("a", "1"), ("b", "2"), ("c", "3"), ("d", "4")]);
        let err = store
            .stage([run("4", "5", "6"), bad], &schema)
            .expect_err("bad run");
        assert!(err.is_schema_mismatch());
        assert_eq!(store.as_slice(), &[run("1", "2", "3")]);
    }

    #[test]
    fn filter_matches_values_across_keys() {
        let schema = ArgumentSchema::declared(vec!["s1".into(), "e1".into()], None);
        let ax = Run::from_pairs([("s1", "A"), ("e1", "X")]);
        let by = Run::from_pairs([("s1", "B"), ("e1", "Y")]);
        let mut store = RunStore::new();
        store.stage([ax.clone(), by.clone()], &schema).expect("stage");

        assert_eq!(store.filter(&["A"], MatchMode::Any), vec![&ax]);
        assert_eq!(store.filter(&["A", "B"], MatchMode::Any), vec![&ax, &by]);
        assert!(store.filter(&["A", "B"], MatchMode::All).is_empty());
        assert_eq!(store.filter(&["X", "A"], MatchMode::All), vec![&ax]);
        assert_eq!(store.filter::<&str>(&[], MatchMode::All), vec![&ax, &by]);
    }

    #[test]
    fn filter_preserves_staging_order() {
        let r1 = run("1", "2", "3");
        let r2 = run("4", "5", "6");
        let r3 = run("7", "8", "9");
        let r4 = run("1", "10", "11");
        let store = staged(&[r1.clone(), r2, r3.clone(), r4.clone()]);

        assert_eq!(store.filter(&["1"], true.into()), vec![&r1, &r4]);
        assert_eq!(store.filter(&["1", "3"], true.into()), vec![&r1, &r4]);
        assert_eq!(store.filter(&["9", "1", "3"], true.into()), vec![&r1, &r3, &r4]);
        assert_eq!(store.filter(&["1", "2"], false.into()), vec![&r1]);
        assert_eq!(store.filter(&["10"], false.into()), vec![&r4]);
        assert!(store.filter(&["15"], false.into()).is_empty());
    }

    #[test]
    fn remove_ignores_runs_that_are_not_staged() {
        let r1 = run("1", "2", "3");
        let r2 = run("4", "5", "6");
        let r3 = run("7", "8", "9");
        let mut store = staged(&[r1.clone(), r2.clone(), r3.clone()]);

        let stranger = run("1", "10", "11");
        assert_eq!(store.remove([&r1, &r3, &stranger]), 2);
        assert_eq!(store.as_slice(), &[r2.clone()]);
        assert_eq!(store.remove([&stranger]), 0);
        assert_eq!(store.as_slice(), &[r2]);
    }

    #[test]
    fn remove_accepts_a_filter_result() {
        let r1 = run("1", "2", "3");
        let r2 = run("4", "5", "6");
        let r4 = run("1", "10", "11");
        let mut store = staged(&[r1, r2.clone(), r4]);

        let doomed: Vec<Run> = store
            .filter(&["1"], MatchMode::Any)
            .into_iter()
            .cloned()
            .collect();
        store.remove(&doomed);
        assert_eq!(store.as_slice(), &[r2]);
    }

    #[test]
    fn merge_unions_sources_without_duplicates() {
        let r1 = run("1", "2", "3");
        let r2 = run("4", "5", "6");
        let r3 = run("7", "8", "9");
        let s1 = staged(&[r1.clone()]);
        let s2 = staged(&[r2.clone()]);
        let s3 = staged(&[r3.clone()]);

        let merged = RunStore::merge([&s1, &s2, &s3]);
        assert_eq!(merged.as_slice(), &[r1.clone(), r2.clone(), r3.clone()]);

        let again = RunStore::merge([&merged, &s1, &s2, &s3]);
        assert_eq!(again.len(), 3);
        assert_eq!(again, merged);
    }

    #[test]
    fn slices_are_detached_copies() {
        let r1 = run("1", "2", "3");
        let r2 = run("4", "5", "6");
        let r3 = run("7", "8", "9");
        let mut store = staged(&[r1.clone(), r2.clone(), r3.clone()]);

        let tail = store.slice(1..).expect("in range");
        assert_eq!(tail.as_slice(), &[r2.clone(), r3.clone()]);
        store.remove([&r2]);
        assert_eq!(tail.len(), 2);
        assert_eq!(store[1], r3);
        assert!(store.slice(1..5).is_none());
        assert_eq!(store.get(0), Some(&r1));
        assert_eq!(store.iter().count(), 2);
    }
}
