//! The query and execution surface: configuration, staged runs, schema and
//! dispatch behind one handle.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::mpsc::Sender;
use std::sync::Mutex;

use serde::Serialize;
use tracing::info;

use crate::command::{CommandBuilder, Invocation};
use crate::config::RunnerConfig;
use crate::error::{Result, RunnerError};
use crate::resolver::FileResolver;
use crate::run::Run;
use crate::schema::ArgumentSchema;
use crate::store::{MatchMode, RunStore};
use crate::supervisor::{BatchReport, Job, RunEvent, StopHandle, Supervisor};

/// A dry-run view of one job: what would be executed and where its output
/// would go.
#[derive(Debug, Clone, Serialize)]
pub struct PlannedRun {
    pub index: usize,
    pub label: String,
    pub run: Run,
    pub run_number: Option<String>,
    pub control_file: Option<PathBuf>,
    pub argv: Vec<String>,
    pub output_file: Option<PathBuf>,
    pub error: Option<String>,
}

pub struct Runner {
    config: RunnerConfig,
    builder: Box<dyn CommandBuilder>,
    store: RunStore,
    schema: Mutex<Option<ArgumentSchema>>,
    stop: StopHandle,
}

impl Runner {
    pub fn new(config: RunnerConfig, builder: Box<dyn CommandBuilder>) -> Self {
        Self {
            config,
            builder,
            store: RunStore::new(),
            schema: Mutex::new(None),
            stop: StopHandle::new(),
        }
    }

    /// A runner whose staged runs are the union of `sources`, in order.
    pub fn merged(
        config: RunnerConfig,
        builder: Box<dyn CommandBuilder>,
        sources: &[&Runner],
    ) -> Self {
        let mut runner = Self::new(config, builder);
        runner.store = RunStore::merge(sources.iter().map(|r| &r.store));
        runner
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Mutable configuration. The cached schema is dropped since root, group
    /// or extension may change.
    pub fn config_mut(&mut self) -> &mut RunnerConfig {
        *self.schema.get_mut().unwrap_or_else(|e| e.into_inner()) = None;
        &mut self.config
    }

    pub fn builder(&self) -> &dyn CommandBuilder {
        self.builder.as_ref()
    }

    /// The argument schema for the configured group, inferred on first use.
    pub fn schema(&self) -> Result<ArgumentSchema> {
        let mut cached = self.schema.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(schema) = cached.as_ref() {
            return Ok(schema.clone());
        }
        let schema = infer_schema(&self.config)?;
        *cached = Some(schema.clone());
        Ok(schema)
    }

    /// Stages one run. Returns false when an equal run is already staged.
    pub fn stage(&mut self, run: Run) -> Result<bool> {
        Ok(self.stage_all([run])? == 1)
    }

    /// Stages `runs` in order; nothing is staged if any run fails validation.
    pub fn stage_all<I>(&mut self, runs: I) -> Result<usize>
    where
        I: IntoIterator<Item = Run>,
    {
        let schema = self.schema()?;
        self.store.stage(runs, &schema)
    }

    pub fn remove(&mut self, run: &Run) -> bool {
        self.store.remove([run]) == 1
    }

    pub fn remove_all<'a, I>(&mut self, runs: I) -> usize
    where
        I: IntoIterator<Item = &'a Run>,
    {
        self.store.remove(runs)
    }

    pub fn filter<S: AsRef<str>>(&self, values: &[S], mode: MatchMode) -> Vec<&Run> {
        self.store.filter(values, mode)
    }

    pub fn runs(&self) -> &RunStore {
        &self.store
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    /// Executes every staged run and blocks until each one is terminal, or
    /// until the batch drains after [`stop`](Self::stop).
    ///
    /// With no run numbers, unnumbered control files are used. With several,
    /// the run at staged index `i` uses `run_numbers[i % n]`.
    pub fn run(&self, run_numbers: &[&str]) -> Result<BatchReport> {
        self.dispatch(run_numbers, None)
    }

    pub fn run_with_events(
        &self,
        run_numbers: &[&str],
        events: &Sender<RunEvent>,
    ) -> Result<BatchReport> {
        self.dispatch(run_numbers, Some(events))
    }

    /// Resolves and builds every invocation without spawning anything.
    /// Per-run resolution failures are reported in the plan, not returned.
    pub fn plan(&self, run_numbers: &[&str]) -> Result<Vec<PlannedRun>> {
        let config = self.config.clone();
        config.validate()?;
        let jobs = self.jobs(run_numbers)?;
        let batch = Batch::prepare(&config, self.builder.as_ref(), self.schema()?, &jobs)?;
        Ok(jobs
            .into_iter()
            .map(|job| {
                let label = job.label();
                match batch.invocation(&job) {
                    Ok(inv) => PlannedRun {
                        index: job.index,
                        label,
                        argv: inv.argv(),
                        control_file: Some(inv.control_file),
                        output_file: Some(inv.output_file),
                        run: job.run,
                        run_number: job.run_number,
                        error: None,
                    },
                    Err(e) => PlannedRun {
                        index: job.index,
                        label,
                        run: job.run,
                        run_number: job.run_number,
                        control_file: None,
                        argv: Vec::new(),
                        output_file: None,
                        error: Some(e.to_string()),
                    },
                }
            })
            .collect())
    }

    /// Interrupts the running batch and waits for it to drain. Safe to call
    /// repeatedly, from any thread, with or without a batch in progress.
    pub fn stop(&self) {
        self.stop.stop();
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    fn dispatch(
        &self,
        run_numbers: &[&str],
        events: Option<&Sender<RunEvent>>,
    ) -> Result<BatchReport> {
        // A stop from here on cancels this batch, even before anything spawns.
        let _active = self.stop.begin();
        let config = self.config.clone();
        config.validate()?;
        let jobs = self.jobs(run_numbers)?;
        let batch = Batch::prepare(&config, self.builder.as_ref(), self.schema()?, &jobs)?;

        info!(
            runs = jobs.len(),
            async_runs = config.async_runs,
            engine = self.builder.name(),
            program = %batch.program.display(),
            "starting batch"
        );
        let supervisor = Supervisor::new(config.async_runs, self.stop.clone());
        Ok(supervisor.execute(jobs, |job| batch.invocation(job), events))
    }

    fn jobs(&self, run_numbers: &[&str]) -> Result<Vec<Job>> {
        if run_numbers.iter().any(|rn| rn.is_empty()) {
            return Err(RunnerError::Config(
                "run numbers must not be empty".to_string(),
            ));
        }
        Ok(self
            .store
            .iter()
            .enumerate()
            .map(|(index, run)| Job {
                index,
                run: run.clone(),
                run_number: match run_numbers {
                    [] => None,
                    rns => Some(rns[index % rns.len()].to_string()),
                },
            })
            .collect())
    }
}

fn infer_schema(config: &RunnerConfig) -> Result<ArgumentSchema> {
    match &config.run_args {
        Some(keys) => Ok(ArgumentSchema::declared(
            keys.clone(),
            config.group.as_deref(),
        )),
        None => ArgumentSchema::infer(&config.root, config.group.as_deref(), config.extension()),
    }
}

/// Everything fixed for the lifetime of one batch.
struct Batch<'a> {
    config: &'a RunnerConfig,
    builder: &'a dyn CommandBuilder,
    keys: Vec<String>,
    resolver: FileResolver,
    program: PathBuf,
    output_files: HashMap<usize, PathBuf>,
}

impl<'a> Batch<'a> {
    fn prepare(
        config: &'a RunnerConfig,
        builder: &'a dyn CommandBuilder,
        schema: ArgumentSchema,
        jobs: &[Job],
    ) -> Result<Self> {
        let program = builder.executable(config)?;
        let resolver = FileResolver::scan(
            &config.root,
            config.group.as_deref(),
            schema.keys(),
            config.extension(),
        )?;
        let output_dir = config.output_dir()?;
        let output_files = output_file_names(jobs, schema.keys())
            .into_iter()
            .map(|(index, name)| (index, output_dir.join(name)))
            .collect();
        Ok(Self {
            config,
            builder,
            keys: schema.keys,
            resolver,
            program,
            output_files,
        })
    }

    fn invocation(&self, job: &Job) -> Result<Invocation> {
        let control_file = self
            .resolver
            .resolve(&job.run, job.run_number.as_deref())?;
        let args = self
            .builder
            .arguments(self.config, &job.run, &self.keys, &control_file);
        let output_file = self.output_files.get(&job.index).cloned().ok_or_else(|| {
            RunnerError::Config(format!("no output file planned for run {}", job.label()))
        })?;
        Ok(Invocation {
            program: self.program.clone(),
            args,
            output_file,
            control_file,
        })
    }
}

/// `run_{RUNNUMBER|NA}_{v1}_{v2}….out`, values in schema order.
fn output_stem(job: &Job, keys: &[String]) -> String {
    let mut name = format!("run_{}", sanitize(job.run_number.as_deref().unwrap_or("NA")));
    for value in job.run.values_for(keys) {
        name.push('_');
        name.push_str(&sanitize(value));
    }
    name
}

/// Output file name per job index. Distinct runs can flatten to the same
/// stem (`A_B`+`C` and `A`+`B_C`); every job in such a group gets its staged
/// index appended so no two jobs share a file.
fn output_file_names(jobs: &[Job], keys: &[String]) -> Vec<(usize, String)> {
    let stems: Vec<String> = jobs.iter().map(|job| output_stem(job, keys)).collect();
    let mut seen: HashMap<&str, usize> = HashMap::new();
    for stem in &stems {
        *seen.entry(stem.as_str()).or_default() += 1;
    }
    jobs.iter()
        .zip(&stems)
        .map(|(job, stem)| {
            let name = if seen[stem.as_str()] > 1 {
                format!("{}_{}.out", stem, job.index)
            } else {
                format!("{}.out", stem)
            };
            (job.index, name)
        })
        .collect()
}

fn sanitize(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '+') {
                c
            } else {
                '_'
            }
        })
        .collect()
}
