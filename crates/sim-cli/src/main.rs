use anyhow::{bail, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use sim_runner::{
    ArgumentSchema, BatchFile, BatchReport, PlannedRun, RunState, Runner, RunnerError, StopHandle,
};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "sim", version = "0.3.0", about = "Batch runner for simulation engines")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Stage every run of a batch file and execute it.
    Run {
        batch: PathBuf,
        #[arg(long = "run-number")]
        run_numbers: Vec<String>,
        #[arg(long)]
        async_runs: Option<usize>,
        /// Also write the JSON report to this path.
        #[arg(long)]
        report: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// Show the schema and the resolved plan without starting anything.
    Describe {
        batch: PathBuf,
        #[arg(long = "run-number")]
        run_numbers: Vec<String>,
        #[arg(long)]
        json: bool,
    },
    /// Infer the argument schema of a directory of control files.
    Schema {
        #[arg(long)]
        root: PathBuf,
        #[arg(long)]
        group: Option<String>,
        #[arg(long, default_value = "tcf")]
        ext: String,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    let result = run_command(cli.command);
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            if payload.get("ok") == Some(&Value::Bool(false)) {
                std::process::exit(1);
            }
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                let code = err
                    .downcast_ref::<RunnerError>()
                    .map(RunnerError::code)
                    .unwrap_or("command_failed");
                emit_json(&json_error(code, err.to_string(), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Run {
            batch,
            run_numbers,
            async_runs,
            report,
            json,
        } => {
            let mut runner = load_runner(&batch)?;
            if let Some(n) = async_runs {
                runner.config_mut().async_runs = n;
            }
            let rns: Vec<&str> = run_numbers.iter().map(String::as_str).collect();
            let _interrupts = InterruptWatcher::install(runner.stop_handle())?;
            let result = runner.run(&rns)?;
            let payload = report_to_json(&result);
            if let Some(path) = &report {
                atomic_write_json_pretty(path, &payload)?;
            }
            if json {
                return Ok(Some(json!({
                    "ok": result.all_succeeded(),
                    "command": "run",
                    "batch": batch.display().to_string(),
                    "report": payload
                })));
            }
            print_report(&result);
            if result.failed() > 0 {
                bail!("{} of {} runs failed", result.failed(), result.outcomes.len());
            }
            if result.cancelled {
                bail!("batch interrupted");
            }
        }
        Commands::Describe {
            batch,
            run_numbers,
            json,
        } => {
            let runner = load_runner(&batch)?;
            let schema = runner.schema()?;
            let rns: Vec<&str> = run_numbers.iter().map(String::as_str).collect();
            let plan = runner.plan(&rns)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "describe",
                    "engine": runner.builder().name(),
                    "schema": schema_to_json(&schema),
                    "plan": plan
                })));
            }
            println!("engine: {}", runner.builder().name());
            print_schema(&schema);
            print_plan(&plan);
        }
        Commands::Schema {
            root,
            group,
            ext,
            json,
        } => {
            let schema = ArgumentSchema::infer(&root, group.as_deref(), ext.trim_start_matches('.'))?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "schema",
                    "schema": schema_to_json(&schema)
                })));
            }
            print_schema(&schema);
        }
    }
    Ok(None)
}

fn load_runner(batch: &Path) -> Result<Runner> {
    let file = BatchFile::load(batch)?;
    let mut runner = Runner::new(file.config, file.engine.builder());
    let staged = runner.stage_all(file.runs)?;
    tracing::debug!(staged, batch = %batch.display(), "loaded batch file");
    Ok(runner)
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Run { json, .. }
        | Commands::Describe { json, .. }
        | Commands::Schema { json, .. } => *json,
    }
}

fn report_to_json(report: &BatchReport) -> Value {
    json!({
        "completed": report.completed(),
        "failed": report.failed(),
        "cancelled": report.count(RunState::Cancelled),
        "not_started": report.count(RunState::Queued),
        "interrupted": report.cancelled,
        "peak_running": report.peak_running,
        "started_at": report.started_at.to_rfc3339(),
        "finished_at": report.finished_at.to_rfc3339(),
        "outcomes": serde_json::to_value(&report.outcomes).unwrap_or(Value::Null)
    })
}

fn schema_to_json(schema: &ArgumentSchema) -> Value {
    json!({
        "group": schema.group,
        "keys": schema.keys,
        "declared": schema.declared,
        "run_numbers": schema.run_numbers,
        "files": schema.files.iter().map(|p| p.display().to_string()).collect::<Vec<_>>()
    })
}

fn print_schema(schema: &ArgumentSchema) {
    println!("group: {}", schema.group.as_deref().unwrap_or("*"));
    println!("keys: {}", schema.keys.join(", "));
    if schema.declared {
        println!("keys_source: run_args");
    } else {
        println!("control_files: {}", schema.files.len());
        let rns: Vec<&str> = schema.run_numbers.iter().map(String::as_str).collect();
        println!(
            "run_numbers: {}",
            if rns.is_empty() { "none".to_string() } else { rns.join(", ") }
        );
    }
}

fn print_plan(plan: &[PlannedRun]) {
    println!("runs: {}", plan.len());
    for step in plan {
        match &step.error {
            Some(err) => println!("  [{}] {} -> error: {}", step.index, step.label, err),
            None => {
                println!("  [{}] {}", step.index, step.label);
                println!("      argv: {}", step.argv.join(" "));
                if let Some(out) = &step.output_file {
                    println!("      output: {}", out.display());
                }
            }
        }
    }
}

fn print_report(report: &BatchReport) {
    for outcome in &report.outcomes {
        let state = match outcome.state {
            RunState::Queued => "not_started",
            RunState::Running => "running",
            RunState::Completed => "completed",
            RunState::Failed => "failed",
            RunState::Cancelled => "cancelled",
        };
        println!("{:<12} {}", state, outcome.label);
        if let Some(err) = &outcome.error {
            println!("             {}", err);
        }
    }
    println!(
        "completed: {}  failed: {}  cancelled: {}  not_started: {}",
        report.completed(),
        report.failed(),
        report.count(RunState::Cancelled),
        report.count(RunState::Queued)
    );
}

fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let ts = Utc::now().timestamp_micros();
    let pid = std::process::id();
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("report");
    let tmp = path.with_file_name(format!(".{}.tmp.{}.{}", name, pid, ts));
    let mut file = fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    Ok(())
}

fn atomic_write_json_pretty(path: &Path, value: &Value) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    atomic_write_bytes(path, &bytes)
}

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

#[cfg(unix)]
extern "C" fn on_sigint(_: std::os::raw::c_int) {
    INTERRUPTED.store(true, Ordering::SeqCst);
}

#[cfg(windows)]
unsafe extern "system" fn on_console_ctrl(_: u32) -> i32 {
    INTERRUPTED.store(true, Ordering::SeqCst);
    1
}

/// Forwards Ctrl-C to a stop handle. The signal handler only sets a flag;
/// a watcher thread turns it into a stop request.
struct InterruptWatcher {
    done: std::sync::Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl InterruptWatcher {
    fn install(stop: StopHandle) -> Result<Self> {
        INTERRUPTED.store(false, Ordering::SeqCst);
        #[cfg(unix)]
        {
            use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
            let action = SigAction::new(
                SigHandler::Handler(on_sigint),
                SaFlags::SA_RESTART,
                SigSet::empty(),
            );
            // SAFETY: the handler only stores to an atomic.
            unsafe { sigaction(Signal::SIGINT, &action) }?;
        }
        #[cfg(windows)]
        {
            use windows_sys::Win32::System::Console::SetConsoleCtrlHandler;
            // SAFETY: the handler only stores to an atomic.
            if unsafe { SetConsoleCtrlHandler(Some(on_console_ctrl), 1) } == 0 {
                return Err(std::io::Error::last_os_error().into());
            }
        }
        let done = std::sync::Arc::new(AtomicBool::new(false));
        let finished = done.clone();
        let thread = thread::spawn(move || {
            while !finished.load(Ordering::SeqCst) {
                if INTERRUPTED.swap(false, Ordering::SeqCst) {
                    tracing::warn!("interrupt received, stopping running jobs");
                    stop.request();
                }
                thread::sleep(Duration::from_millis(50));
            }
        });
        Ok(Self {
            done,
            thread: Some(thread),
        })
    }
}

impl Drop for InterruptWatcher {
    fn drop(&mut self) {
        self.done.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
