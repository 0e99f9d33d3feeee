// Upgrade installer
// Library entry point: logging, CLI options and the orchestration pass.

pub mod database;
pub mod installation;
pub mod models;
pub mod security;
pub mod tasks;
pub mod utils;

use log::{error, info};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::database::connection::RealDbConnector;
use crate::models::responses::{PassReport, PlanEntry};
use crate::models::settings::SetupSettings;
use crate::models::state::SetupContext;
use crate::tasks::database::DatabaseTask;
use crate::tasks::environment::EnvironmentTask;
use crate::tasks::runner::{
    AnswersFile, AutoConfirm, FieldDefaults, InputSource, Prompter, StdinPrompter, TaskRunner,
};
use crate::tasks::Task;
use crate::utils::logging::LogLine;

pub const EXIT_OK: i32 = 0;
pub const EXIT_FAILED: i32 = 1;
pub const EXIT_CONFIG: i32 = 2;

pub const USAGE: &str = "Usage: upgrade-installer [--config <path>] [--check] [--yes] [--answers <path>] [--json] [--quiet]

  --config <path>   installer settings file (default: ./installer.toml when present)
  --check           report what a pass would do; change nothing
  --yes             confirm every prompt; unanswered fields take their defaults
  --answers <path>  TOML answers for input fields, one table per task
  --json            print the report as JSON
  --quiet           no log output on stdout";

fn local_timestamp() -> String {
    chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f").to_string()
}

/// Dispatch writing human-readable lines.
fn text_output() -> fern::Dispatch {
    fern::Dispatch::new().format(|out, message, record| {
        let line = LogLine::new(
            local_timestamp(),
            record.level(),
            record.target(),
            &message.to_string(),
        );
        out.finish(format_args!("{}", line.to_text()))
    })
}

/// Dispatch writing one JSON object per line.
fn json_output() -> fern::Dispatch {
    fern::Dispatch::new().format(|out, message, record| {
        let line = LogLine::new(
            chrono::Utc::now().to_rfc3339(),
            record.level(),
            record.target(),
            &message.to_string(),
        );
        out.finish(format_args!("{}", line.to_json()))
    })
}

/// Install the global logger: `installer-<ts>.log` (JSON lines) and `installer-<ts>.txt`
/// in `log_dir`, plus info-level text on stdout when `with_stdout` is set.
pub fn init_logging(log_dir: &Path, with_stdout: bool) -> Result<(), Box<dyn std::error::Error>> {
    std::fs::create_dir_all(log_dir)?;
    let stamp = chrono::Utc::now().format("%Y-%m-%d-%H%M%S");

    let mut dispatch = fern::Dispatch::new()
        .level(log::LevelFilter::Debug)
        .level_for("sqlx", log::LevelFilter::Warn)
        .chain(json_output().chain(fern::log_file(
            log_dir.join(format!("installer-{}.log", stamp)),
        )?))
        .chain(text_output().chain(fern::log_file(
            log_dir.join(format!("installer-{}.txt", stamp)),
        )?));

    if with_stdout {
        dispatch = dispatch.chain(
            text_output()
                .level(log::LevelFilter::Info)
                .chain(std::io::stdout()),
        );
    }

    dispatch.apply()?;
    info!(
        "[PHASE: initialization] Logging initialized (log_dir={:?})",
        log_dir
    );
    Ok(())
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CliOptions {
    pub config: Option<PathBuf>,
    pub check: bool,
    pub yes: bool,
    pub answers: Option<PathBuf>,
    pub json: bool,
    pub quiet: bool,
    pub help: bool,
}

impl CliOptions {
    pub fn parse(args: &[String]) -> Result<Self, String> {
        let mut opts = CliOptions::default();
        let mut iter = args.iter();
        while let Some(arg) = iter.next() {
            let (flag, inline) = match arg.split_once('=') {
                Some((f, v)) if f.starts_with("--") => (f, Some(v.to_string())),
                _ => (arg.as_str(), None),
            };
            let mut value = |name: &str| -> Result<PathBuf, String> {
                inline
                    .clone()
                    .or_else(|| iter.next().cloned())
                    .filter(|v| !v.trim().is_empty())
                    .map(PathBuf::from)
                    .ok_or_else(|| format!("{} requires a path", name))
            };
            match flag {
                "--config" => opts.config = Some(value("--config")?),
                "--answers" => opts.answers = Some(value("--answers")?),
                "--check" => opts.check = true,
                "--yes" | "-y" => opts.yes = true,
                "--json" => opts.json = true,
                "--quiet" | "-q" => opts.quiet = true,
                "--help" | "-h" => opts.help = true,
                other => return Err(format!("Unknown argument: {}", other)),
            }
        }
        Ok(opts)
    }
}

/// The pass: environment first, then the database.
pub fn default_tasks(ctx: &Arc<SetupContext>) -> Vec<Arc<dyn Task>> {
    vec![
        Arc::new(EnvironmentTask::new(ctx.clone())),
        Arc::new(DatabaseTask::new(ctx.clone())),
    ]
}

fn input_source(opts: &CliOptions) -> anyhow::Result<Arc<dyn InputSource>> {
    Ok(match (&opts.answers, opts.yes) {
        (Some(path), _) => Arc::new(AnswersFile::load(path)?),
        (None, true) => Arc::new(FieldDefaults),
        (None, false) => Arc::new(StdinPrompter),
    })
}

fn prompter(opts: &CliOptions) -> Arc<dyn Prompter> {
    if opts.yes {
        Arc::new(AutoConfirm(true))
    } else {
        Arc::new(StdinPrompter)
    }
}

fn print_report(report: &PassReport) {
    println!(
        "Setup {:?} (correlation id {})",
        report.outcome, report.correlation_id
    );
    for step in &report.steps {
        println!("  {:<14} {:?}", step.title, step.status);
        for message in &step.errors {
            println!("      - {}", message);
        }
        for (field, message) in &step.field_errors {
            println!("      - {}: {}", field, message);
        }
    }
}

fn print_plan(entries: &[PlanEntry]) {
    for entry in entries {
        let state = match (&entry.error, entry.skip, entry.in_desired_state) {
            (Some(e), _, _) => format!("error: {}", e),
            (None, true, _) => "skip".to_string(),
            (None, false, true) => "up to date".to_string(),
            (None, false, false) => "action needed".to_string(),
        };
        println!("  {:<14} {}", entry.title, state);
        if entry.needs_input {
            println!("      - input required");
        }
        if let Some(prompt) = &entry.verification {
            println!("      - {}", prompt);
        }
    }
}

async fn run_async(opts: &CliOptions, settings: SetupSettings) -> i32 {
    let connector = Arc::new(RealDbConnector::new(
        settings.database.timeout(),
        settings.database.max_retries,
    ));
    let ctx = match SetupContext::load(settings, connector).await {
        Ok(ctx) => Arc::new(ctx),
        Err(e) => {
            error!("[PHASE: initialization] [STEP: context] {:#}", e);
            eprintln!("Installer error: {:#}", e);
            return EXIT_CONFIG;
        }
    };

    let input = match input_source(opts) {
        Ok(input) => input,
        Err(e) => {
            eprintln!("Installer error: {:#}", e);
            return EXIT_CONFIG;
        }
    };
    let runner = TaskRunner::new(default_tasks(&ctx), prompter(opts), input);

    if opts.check {
        let entries = runner.plan().await;
        if opts.json {
            match serde_json::to_string_pretty(&entries) {
                Ok(s) => println!("{}", s),
                Err(e) => eprintln!("Failed to serialize plan: {}", e),
            }
        } else {
            print_plan(&entries);
        }
        return if entries.iter().any(|e| e.error.is_some()) {
            EXIT_CONFIG
        } else {
            EXIT_OK
        };
    }

    let report = runner.run_pass().await;
    if opts.json {
        match serde_json::to_string_pretty(&report) {
            Ok(s) => println!("{}", s),
            Err(e) => eprintln!("Failed to serialize report: {}", e),
        }
    } else {
        print_report(&report);
    }
    report.outcome.exit_code()
}

/// Load settings, start logging and run one pass (or a check). Returns the exit code.
pub fn run_cli(opts: &CliOptions) -> i32 {
    let settings = match SetupSettings::load(opts.config.as_deref()) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Installer error: {:#}", e);
            return EXIT_CONFIG;
        }
    };

    let with_stdout = !opts.quiet && !opts.json;
    match utils::path_resolver::resolve_log_folder(settings.log_dir.as_deref()) {
        Ok(dir) => {
            if let Err(e) = init_logging(&dir, with_stdout) {
                eprintln!("Failed to initialize logging: {}", e);
            }
        }
        Err(e) => eprintln!("Failed to resolve log folder: {}", e),
    }

    info!(
        "[PHASE: initialization] Installer starting at {} (name={}, version={}, check={})",
        chrono::Utc::now(),
        settings.name,
        settings.version,
        opts.check
    );

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build();
    match rt {
        Ok(rt) => rt.block_on(run_async(opts, settings)),
        Err(e) => {
            eprintln!("Failed to create async runtime: {}", e);
            EXIT_FAILED
        }
    }
}
