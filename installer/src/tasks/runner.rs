// Task runner
//
// Runs an ordered list of tasks one at a time:
//   skip? -> collect input (if fields) -> verification prompt -> run -> test
// The first task that does not finish cleanly ends the pass. A task with `skip_complete`
// whose skip holds ends the pass successfully.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use log::{error, info, warn};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use crate::models::bindings::BindingTree;
use crate::models::fields::FieldSchema;
use crate::models::responses::{PassOutcome, PassReport, PlanEntry, StepReport, StepStatus};
use crate::tasks::{InputTree, Task, TaskError};

/// Answers verification prompts.
#[async_trait]
pub trait Prompter: Send + Sync {
    async fn confirm(&self, task_title: &str, prompt: &str) -> Result<bool>;
}

/// Supplies values for a task's input fields.
#[async_trait]
pub trait InputSource: Send + Sync {
    /// `None` when this source has nothing to offer for the task.
    async fn collect(&self, task_id: &str, schema: &FieldSchema) -> Result<Option<InputTree>>;
}

/// Answers every prompt the same way.
#[derive(Debug, Clone, Copy)]
pub struct AutoConfirm(pub bool);

#[async_trait]
impl Prompter for AutoConfirm {
    async fn confirm(&self, task_title: &str, prompt: &str) -> Result<bool> {
        info!(
            "[PHASE: runner] [STEP: verification] Auto-answered prompt (task={}, answer={}, prompt={})",
            task_title, self.0, prompt
        );
        Ok(self.0)
    }
}

/// Interactive terminal prompts.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdinPrompter;

async fn read_line(question: String) -> Result<String> {
    tokio::task::spawn_blocking(move || -> Result<String> {
        let mut stdout = std::io::stdout();
        write!(stdout, "{}", question)?;
        stdout.flush()?;
        let mut line = String::new();
        std::io::stdin()
            .read_line(&mut line)
            .context("Failed to read from stdin")?;
        Ok(line.trim().to_string())
    })
    .await
    .context("stdin reader join failed")?
}

#[async_trait]
impl Prompter for StdinPrompter {
    async fn confirm(&self, task_title: &str, prompt: &str) -> Result<bool> {
        let answer = read_line(format!("[{}] {} [y/N]: ", task_title, prompt)).await?;
        Ok(matches!(answer.to_ascii_lowercase().as_str(), "y" | "yes"))
    }
}

#[async_trait]
impl InputSource for StdinPrompter {
    async fn collect(&self, _task_id: &str, schema: &FieldSchema) -> Result<Option<InputTree>> {
        let mut input = InputTree::new();
        for (section, field) in schema.iter_fields() {
            let default = field.default_value().unwrap_or_default();
            let question = if default.is_empty() {
                format!("{} / {}: ", section.label, field.label)
            } else {
                format!("{} / {} [{}]: ", section.label, field.label, default)
            };
            let answer = read_line(question).await?;
            let value = if answer.is_empty() { default } else { answer };
            input.set(&format!("{}.{}", section.name, field.name), value);
        }
        Ok(Some(input))
    }
}

/// Field defaults only.
#[derive(Debug, Default, Clone, Copy)]
pub struct FieldDefaults;

#[async_trait]
impl InputSource for FieldDefaults {
    async fn collect(&self, _task_id: &str, schema: &FieldSchema) -> Result<Option<InputTree>> {
        Ok(Some(fill(schema, None)))
    }
}

/// Answers read from a TOML file with one table per task id:
///
/// ```toml
/// [environment.db]
/// host = "10.0.0.5"
/// ```
///
/// Fields without an answer fall back to their default value.
#[derive(Debug, Clone, Default)]
pub struct AnswersFile {
    answers: BindingTree,
}

impl AnswersFile {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read answers file: {:?}", path))?;
        Self::parse(&content).with_context(|| format!("Invalid answers file: {:?}", path))
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(Self {
            answers: BindingTree::from_toml_str(content)?,
        })
    }
}

#[async_trait]
impl InputSource for AnswersFile {
    async fn collect(&self, task_id: &str, schema: &FieldSchema) -> Result<Option<InputTree>> {
        Ok(Some(fill(schema, self.answers.section(task_id))))
    }
}

fn fill(schema: &FieldSchema, answers: Option<&BindingTree>) -> InputTree {
    let mut input = InputTree::new();
    for (section, field) in schema.iter_fields() {
        let path = format!("{}.{}", section.name, field.name);
        let value = answers
            .and_then(|a| a.get_str(&path))
            .or_else(|| field.default_value());
        if let Some(value) = value {
            input.set(&path, value);
        }
    }
    input
}

/// No input available; tasks needing input are rejected.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoInput;

#[async_trait]
impl InputSource for NoInput {
    async fn collect(&self, _task_id: &str, _schema: &FieldSchema) -> Result<Option<InputTree>> {
        Ok(None)
    }
}

pub struct TaskRunner {
    tasks: Vec<Arc<dyn Task>>,
    prompter: Arc<dyn Prompter>,
    input: Arc<dyn InputSource>,
}

enum StepEnd {
    Continue(StepStatus),
    Stop(StepStatus, PassOutcome),
    Complete(StepStatus),
}

impl TaskRunner {
    pub fn new(
        tasks: Vec<Arc<dyn Task>>,
        prompter: Arc<dyn Prompter>,
        input: Arc<dyn InputSource>,
    ) -> Self {
        Self {
            tasks,
            prompter,
            input,
        }
    }

    pub fn tasks(&self) -> &[Arc<dyn Task>] {
        &self.tasks
    }

    /// One orchestration pass.
    pub async fn run_pass(&self) -> PassReport {
        let correlation_id = uuid::Uuid::new_v4().to_string();
        let started_at = Utc::now();
        let started = Instant::now();
        info!(
            "[PHASE: runner] [STEP: pass] Pass started (correlation_id={}, tasks={})",
            correlation_id,
            self.tasks.len()
        );

        let mut steps = Vec::with_capacity(self.tasks.len());
        let mut outcome = PassOutcome::Complete;
        let mut halted_early = false;

        for task in &self.tasks {
            let step_started = Instant::now();
            task.base().clear_errors();
            let mut verification = None;

            let end = match self.drive(task.as_ref(), &mut verification).await {
                Ok(end) => end,
                Err(e) => {
                    error!(
                        "[PHASE: runner] [STEP: {}] Configuration error: {}",
                        task.id(),
                        e
                    );
                    task.base().push_error(e.to_string());
                    StepEnd::Stop(StepStatus::Error, PassOutcome::ConfigurationError)
                }
            };

            let status = match &end {
                StepEnd::Continue(s) | StepEnd::Stop(s, _) | StepEnd::Complete(s) => *s,
            };
            info!(
                "[PHASE: runner] [STEP: {}] Task finished (status={:?}, duration_ms={})",
                task.id(),
                status,
                step_started.elapsed().as_millis()
            );
            steps.push(StepReport {
                task_id: task.id(),
                title: task.title().to_string(),
                status,
                duration_ms: step_started.elapsed().as_millis() as i64,
                verification,
                errors: task.errors(),
                field_errors: task.field_errors(),
            });

            match end {
                StepEnd::Continue(_) => {}
                StepEnd::Stop(_, stop) => {
                    outcome = stop;
                    break;
                }
                StepEnd::Complete(_) => {
                    halted_early = true;
                    break;
                }
            }
        }

        info!(
            "[PHASE: runner] [STEP: pass] Pass finished (correlation_id={}, outcome={:?}, duration_ms={})",
            correlation_id,
            outcome,
            started.elapsed().as_millis()
        );
        PassReport {
            correlation_id,
            started_at,
            duration_ms: started.elapsed().as_millis() as i64,
            outcome,
            halted_early,
            steps,
        }
    }

    async fn drive(
        &self,
        task: &dyn Task,
        verification: &mut Option<String>,
    ) -> Result<StepEnd, TaskError> {
        let id = task.id();

        if task.skip().await? {
            info!("[PHASE: runner] [STEP: {}] Skipped", id);
            return Ok(if task.skip_complete() {
                StepEnd::Complete(StepStatus::Skipped)
            } else {
                StepEnd::Continue(StepStatus::Skipped)
            });
        }

        if let Some(schema) = task.fields().await? {
            let Some(input) = self.input.collect(&id, &schema).await? else {
                warn!("[PHASE: runner] [STEP: {}] Input required but none supplied", id);
                task.base()
                    .push_error("Input is required for this step but none was supplied");
                return Ok(StepEnd::Stop(
                    StepStatus::InputRejected,
                    PassOutcome::InputRejected,
                ));
            };
            if !task.load_input(input).await? {
                warn!(
                    "[PHASE: runner] [STEP: {}] Input rejected (field_errors={})",
                    id,
                    task.field_errors().len()
                );
                return Ok(StepEnd::Stop(
                    StepStatus::InputRejected,
                    PassOutcome::InputRejected,
                ));
            }
        }

        if let Some(prompt) = task.verification().await? {
            *verification = Some(prompt.clone());
            if !self.prompter.confirm(task.title(), &prompt).await? {
                info!("[PHASE: runner] [STEP: {}] Operator declined", id);
                return Ok(StepEnd::Stop(StepStatus::Declined, PassOutcome::Declined));
            }
        }

        let ran = task.run().await?;
        let passed = ran && task.test().await?;
        if !passed {
            warn!(
                "[PHASE: runner] [STEP: {}] Step did not succeed (run={}, errors={:?})",
                id,
                ran,
                task.errors()
            );
            return Ok(StepEnd::Stop(StepStatus::Failed, PassOutcome::Failed));
        }
        Ok(StepEnd::Continue(StepStatus::Completed))
    }

    /// Report what a pass would do without running anything.
    pub async fn plan(&self) -> Vec<PlanEntry> {
        let mut entries = Vec::with_capacity(self.tasks.len());
        for task in &self.tasks {
            task.base().clear_errors();
            let mut entry = PlanEntry {
                task_id: task.id(),
                title: task.title().to_string(),
                skip: false,
                skip_complete: task.skip_complete(),
                in_desired_state: false,
                needs_input: false,
                verification: None,
                error: None,
            };

            let probed = async {
                entry.skip = task.skip().await?;
                entry.in_desired_state = task.test().await?;
                entry.needs_input = task.fields().await?.is_some();
                entry.verification = task.verification().await?;
                Ok::<(), TaskError>(())
            }
            .await;
            if let Err(e) = probed {
                entry.error = Some(e.to_string());
            }

            info!(
                "[PHASE: runner] [STEP: plan] Planned task (task={}, skip={}, in_desired_state={}, needs_input={}, verification={})",
                entry.task_id,
                entry.skip,
                entry.in_desired_state,
                entry.needs_input,
                entry.verification.is_some()
            );
            entries.push(entry);
        }
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::migrations::tests::ScriptedMigrator;
    use crate::models::fields::{FieldDefinition, FieldSection};
    use crate::models::state::tests::{context_at, write_env};
    use crate::models::state::SetupContext;
    use crate::tasks::database::{DatabaseTask, UPGRADE_PROMPT};
    use crate::tasks::{TaskBase, TaskResult};
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Task with scripted answers that counts calls.
    struct Scripted {
        base: TaskBase,
        title: &'static str,
        skip: bool,
        skip_complete: bool,
        run_ok: bool,
        prompt: Option<&'static str>,
        with_fields: bool,
        runs: AtomicU32,
    }

    impl Scripted {
        fn new(ctx: &Arc<SetupContext>, title: &'static str) -> Self {
            Self {
                base: TaskBase::new(ctx.clone()),
                title,
                skip: false,
                skip_complete: false,
                run_ok: true,
                prompt: None,
                with_fields: false,
                runs: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl Task for Scripted {
        fn title(&self) -> &str {
            self.title
        }

        fn base(&self) -> &TaskBase {
            &self.base
        }

        fn skip_complete(&self) -> bool {
            self.skip_complete
        }

        async fn skip(&self) -> TaskResult<bool> {
            Ok(self.skip)
        }

        async fn test(&self) -> TaskResult<bool> {
            Ok(self.runs.load(Ordering::SeqCst) > 0 && self.run_ok)
        }

        async fn run(&self) -> TaskResult<bool> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if !self.run_ok {
                self.base.push_error("boom");
            }
            Ok(self.run_ok)
        }

        async fn verification(&self) -> TaskResult<Option<String>> {
            Ok(self.prompt.map(str::to_string))
        }

        async fn fields(&self) -> TaskResult<Option<FieldSchema>> {
            if !self.with_fields {
                return Ok(None);
            }
            Ok(Some(FieldSchema::new().section(
                FieldSection::new("app", "General")
                    .field(FieldDefinition::text("name", "Application Name"))
                    .field(FieldDefinition::text("mode", "Mode").with_value(|| "fast".to_string())),
            )))
        }
    }

    fn ctx(root: &Path) -> Arc<SetupContext> {
        Arc::new(context_at(root, &[]))
    }

    fn runner(tasks: Vec<Arc<dyn Task>>, confirm: bool, input: Arc<dyn InputSource>) -> TaskRunner {
        TaskRunner::new(tasks, Arc::new(AutoConfirm(confirm)), input)
    }

    #[tokio::test]
    async fn runs_every_task_in_order() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = ctx(tmp.path());
        let first = Arc::new(Scripted::new(&ctx, "First"));
        let second = Arc::new(Scripted::new(&ctx, "Second"));

        let report = runner(vec![first.clone(), second.clone()], true, Arc::new(NoInput))
            .run_pass()
            .await;
        assert_eq!(report.outcome, PassOutcome::Complete);
        assert!(!report.halted_early);
        assert_eq!(report.steps.len(), 2);
        assert_eq!(report.steps[0].task_id, "first");
        assert!(report
            .steps
            .iter()
            .all(|s| s.status == StepStatus::Completed));
        assert_eq!(first.runs.load(Ordering::SeqCst), 1);
        assert_eq!(second.runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn skip_complete_ends_the_pass() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = ctx(tmp.path());
        let mut first = Scripted::new(&ctx, "First");
        first.skip = true;
        first.skip_complete = true;
        let second = Arc::new(Scripted::new(&ctx, "Second"));

        let report = runner(vec![Arc::new(first), second.clone()], true, Arc::new(NoInput))
            .run_pass()
            .await;
        assert_eq!(report.outcome, PassOutcome::Complete);
        assert!(report.halted_early);
        assert_eq!(report.steps.len(), 1);
        assert_eq!(report.steps[0].status, StepStatus::Skipped);
        assert_eq!(second.runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn plain_skip_moves_on() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = ctx(tmp.path());
        let mut first = Scripted::new(&ctx, "First");
        first.skip = true;
        let first = Arc::new(first);
        let second = Arc::new(Scripted::new(&ctx, "Second"));

        let report = runner(vec![first.clone(), second.clone()], true, Arc::new(NoInput))
            .run_pass()
            .await;
        assert_eq!(report.steps[0].status, StepStatus::Skipped);
        assert_eq!(report.steps[1].status, StepStatus::Completed);
        assert_eq!(first.runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn declined_prompt_stops_before_run() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = ctx(tmp.path());
        let mut task = Scripted::new(&ctx, "Upgrade");
        task.prompt = Some("Proceed?");
        let task = Arc::new(task);

        let report = runner(vec![task.clone()], false, Arc::new(NoInput))
            .run_pass()
            .await;
        assert_eq!(report.outcome, PassOutcome::Declined);
        assert_eq!(report.steps[0].verification.as_deref(), Some("Proceed?"));
        assert_eq!(task.runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failed_run_halts_with_errors() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = ctx(tmp.path());
        let mut failing = Scripted::new(&ctx, "First");
        failing.run_ok = false;
        let second = Arc::new(Scripted::new(&ctx, "Second"));

        let report = runner(vec![Arc::new(failing), second.clone()], true, Arc::new(NoInput))
            .run_pass()
            .await;
        assert_eq!(report.outcome, PassOutcome::Failed);
        assert_eq!(report.steps.len(), 1);
        assert_eq!(report.steps[0].errors, vec!["boom".to_string()]);
        assert_eq!(second.runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn missing_input_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = ctx(tmp.path());
        let mut task = Scripted::new(&ctx, "Environment");
        task.with_fields = true;

        let report = runner(vec![Arc::new(task)], true, Arc::new(NoInput))
            .run_pass()
            .await;
        assert_eq!(report.outcome, PassOutcome::InputRejected);

        let mut task = Scripted::new(&ctx, "Environment");
        task.with_fields = true;
        let report = runner(vec![Arc::new(task)], true, Arc::new(FieldDefaults))
            .run_pass()
            .await;
        assert_eq!(report.outcome, PassOutcome::InputRejected);
        assert!(report.steps[0]
            .field_errors
            .contains_key("field_environment_app_name"));
    }

    #[tokio::test]
    async fn answers_file_fills_fields_and_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = ctx(tmp.path());
        let mut task = Scripted::new(&ctx, "Environment");
        task.with_fields = true;
        let task = Arc::new(task);
        let answers = AnswersFile::parse("[environment.app]\nname = \"My Cool App\"\n").unwrap();

        let report = runner(vec![task.clone()], true, Arc::new(answers))
            .run_pass()
            .await;
        assert_eq!(report.outcome, PassOutcome::Complete);
        let input = task.base().input().unwrap();
        assert_eq!(input.get_str("app.name").as_deref(), Some("My Cool App"));
        assert_eq!(input.get_str("app.mode").as_deref(), Some("fast"));
    }

    #[tokio::test]
    async fn database_upgrade_pass_prompts_and_applies() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = Arc::new(context_at(tmp.path(), &["migration", "user"]));
        write_env(tmp.path(), "1.4.0");
        ctx.refresh().await.unwrap();
        let migrator = Arc::new(ScriptedMigrator::with_pending(2));
        let task: Arc<dyn Task> = Arc::new(DatabaseTask::with_gateway(ctx.clone(), migrator.clone()));
        let runner = runner(vec![task], true, Arc::new(NoInput));

        let plan = runner.plan().await;
        assert_eq!(plan[0].verification.as_deref(), Some(UPGRADE_PROMPT));
        assert!(!plan[0].in_desired_state);
        assert_eq!(migrator.apply_calls(), 0);

        let report = runner.run_pass().await;
        assert_eq!(report.outcome, PassOutcome::Complete);
        assert_eq!(report.steps[0].status, StepStatus::Completed);
        assert_eq!(migrator.apply_calls(), 1);

        // Second pass: nothing pending, the task skips and ends the pass.
        let report = runner.run_pass().await;
        assert!(report.halted_early);
        assert_eq!(report.steps[0].status, StepStatus::Skipped);
        assert_eq!(migrator.apply_calls(), 1);
    }

    #[tokio::test]
    async fn configuration_error_is_reported() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = Arc::new(context_at(tmp.path(), &["migration", "user"]));
        write_env(tmp.path(), "1.4.0");
        ctx.refresh().await.unwrap();
        let mut settings = ctx.settings().clone();
        settings.migrator.program = "/no/such/migrator".to_string();
        let ctx = Arc::new(SetupContext::new(settings, ctx.connector()));
        ctx.refresh().await.unwrap();

        let task: Arc<dyn Task> = Arc::new(DatabaseTask::new(ctx));
        let report = runner(vec![task], true, Arc::new(NoInput)).run_pass().await;
        assert_eq!(report.outcome, PassOutcome::ConfigurationError);
        assert_eq!(report.steps[0].status, StepStatus::Error);
        assert!(report.steps[0].errors[0].contains("/no/such/migrator"));
    }
}
