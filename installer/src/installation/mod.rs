// Installation plumbing
//
// Running the external migrator (command gateway), template discovery/writing helpers, and
// environment materialization.
//
// IMPORTANT:
// - Never log secrets (connection strings, generated salts, cookie keys).
// - All I/O should be async.

pub mod files;
pub mod templates;

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, info, warn};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Instant;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::time::{timeout, Duration};

use crate::models::settings::MigratorSettings;
use crate::tasks::TaskError;

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u128,
}

/// Runs the migration-capable process with an argument list and buffers its output.
#[async_trait]
pub trait CommandGateway: Send + Sync {
    async fn invoke(&self, args: &[String], operation: &str) -> Result<CommandOutput>;
}

fn mask_arg_for_log(arg: &str) -> String {
    // Heuristic masking: treat anything that looks like a secret as sensitive.
    let lower = arg.to_ascii_lowercase();
    if lower.contains("password=")
        || lower.contains("pwd=")
        || lower.contains("secret")
        || lower.contains("token")
        || lower.contains("salt")
    {
        return "***".to_string();
    }

    if lower.contains("://") {
        return crate::utils::logging::mask_connection_url(arg);
    }

    arg.to_string()
}

/// Gateway backed by a real subprocess: `<program> <base args…> <args…>`.
#[derive(Debug, Clone)]
pub struct ProcessGateway {
    program: PathBuf,
    base_args: Vec<String>,
    working_dir: Option<PathBuf>,
    timeout: Option<Duration>,
}

impl ProcessGateway {
    /// Resolve the migrator from settings. The program must exist on disk or on `PATH`; a
    /// missing migrator is a configuration error.
    pub fn resolve(settings: &MigratorSettings) -> Result<Self, TaskError> {
        let program = settings.program.trim();
        if program.is_empty() {
            return Err(TaskError::Configuration(
                "Migrator program is not configured".to_string(),
            ));
        }

        let candidate = Path::new(program);
        let resolved = if candidate.components().count() > 1 || candidate.is_absolute() {
            if !candidate.is_file() {
                return Err(TaskError::Configuration(format!(
                    "Invalid migrator path: {}",
                    candidate.display()
                )));
            }
            candidate.to_path_buf()
        } else {
            which::which(program).map_err(|e| {
                TaskError::Configuration(format!(
                    "Migrator program '{}' not found on PATH: {}",
                    program, e
                ))
            })?
        };

        if let Some(dir) = &settings.working_dir {
            if !dir.is_dir() {
                return Err(TaskError::Configuration(format!(
                    "Invalid migrator working directory: {}",
                    dir.display()
                )));
            }
        }

        info!(
            "[PHASE: database] [STEP: migrator] Resolved migrator (program={:?}, base_args={})",
            resolved,
            settings.args.len()
        );

        Ok(Self {
            program: resolved,
            base_args: settings.args.clone(),
            working_dir: settings.working_dir.clone(),
            timeout: settings.timeout_secs.map(Duration::from_secs),
        })
    }
}

#[async_trait]
impl CommandGateway for ProcessGateway {
    async fn invoke(&self, args: &[String], operation: &str) -> Result<CommandOutput> {
        let mut full_args = self.base_args.clone();
        full_args.extend_from_slice(args);
        run_cmd(
            &self.program,
            &full_args,
            self.working_dir.as_deref(),
            self.timeout,
            operation,
        )
        .await
    }
}

/// Run an external command once, capturing stdout/stderr.
///
/// Without a timeout the call blocks until the process exits. Returns captured output even
/// when the exit code is non-zero (caller decides success).
pub async fn run_cmd(
    program: &Path,
    args: &[String],
    working_dir: Option<&Path>,
    timeout_dur: Option<Duration>,
    operation: &str,
) -> Result<CommandOutput> {
    let started = Instant::now();

    debug!(
        "[PHASE: installation] [STEP: cmd] run_cmd entered (operation={}, program={:?}, args=[{}], timeout_ms={:?})",
        operation,
        program,
        args.iter().map(|a| mask_arg_for_log(a)).collect::<Vec<_>>().join(", "),
        timeout_dur.map(|d| d.as_millis())
    );

    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = working_dir {
        cmd.current_dir(dir);
    }

    let mut child = cmd.spawn().with_context(|| {
        format!(
            "Failed to spawn command {:?} (operation={})",
            program, operation
        )
    })?;

    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow::anyhow!("Failed to capture stdout (operation={})", operation))?;
    let mut stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow::anyhow!("Failed to capture stderr (operation={})", operation))?;

    let stdout_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        stdout.read_to_end(&mut buf).await?;
        Ok::<String, std::io::Error>(String::from_utf8_lossy(&buf).to_string())
    });
    let stderr_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        stderr.read_to_end(&mut buf).await?;
        Ok::<String, std::io::Error>(String::from_utf8_lossy(&buf).to_string())
    });

    let status = match timeout_dur {
        None => child
            .wait()
            .await
            .with_context(|| format!("Command wait failed (operation={})", operation))?,
        Some(limit) => match timeout(limit, child.wait()).await {
            Ok(waited) => waited
                .with_context(|| format!("Command wait failed (operation={})", operation))?,
            Err(_) => {
                warn!(
                    "[PHASE: installation] [STEP: cmd] Timeout reached (operation={}, program={:?}, timeout_ms={}); attempting to kill process",
                    operation,
                    program,
                    limit.as_millis()
                );
                if let Err(e) = child.kill().await {
                    warn!(
                        "[PHASE: installation] [STEP: cmd] Failed to kill timed-out process (operation={}): {}",
                        operation, e
                    );
                }
                return Err(anyhow::anyhow!(
                    "Command timed out after {}ms (operation={})",
                    limit.as_millis(),
                    operation
                ));
            }
        },
    };

    let stdout_str = stdout_task
        .await
        .context("stdout join failed")?
        .context("stdout read failed")?;
    let stderr_str = stderr_task
        .await
        .context("stderr join failed")?
        .context("stderr read failed")?;

    let out = CommandOutput {
        exit_code: status.code(),
        stdout: stdout_str,
        stderr: stderr_str,
        duration_ms: started.elapsed().as_millis(),
    };

    debug!(
        "[PHASE: installation] [STEP: cmd] run_cmd exit (operation={}, exit_code={:?}, duration_ms={}, stdout_len={}, stderr_len={})",
        operation,
        out.exit_code,
        out.duration_ms,
        out.stdout.len(),
        out.stderr.len()
    );

    Ok(out)
}
