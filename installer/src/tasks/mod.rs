// Setup tasks
//
// Every step of an orchestration pass implements `Task`. The runner drives each task through
// skip -> input -> verification -> run -> test; see `runner.rs`.
//
// Ordinary failures are `Ok(false)` plus messages in `errors()` / `field_errors()`.
// `Err(TaskError)` is reserved for configuration problems that stop the pass.

pub mod database;
pub mod environment;
pub mod runner;

use async_trait::async_trait;
use log::debug;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::models::bindings::BindingTree;
use crate::models::fields::{field_error_key, FieldSchema, FieldType};
use crate::models::state::SetupContext;
use crate::utils::validation::generate_id;

/// Submitted form input, keyed `<section>.<field>`.
pub type InputTree = BindingTree;

#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("{0}")]
    Configuration(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type TaskResult<T> = std::result::Result<T, TaskError>;

/// State every task carries: the shared context, collected input and accumulated messages.
pub struct TaskBase {
    ctx: Arc<SetupContext>,
    input: Mutex<Option<InputTree>>,
    errors: Mutex<Vec<String>>,
    field_errors: Mutex<BTreeMap<String, String>>,
}

fn locked<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl TaskBase {
    pub fn new(ctx: Arc<SetupContext>) -> Self {
        Self {
            ctx,
            input: Mutex::new(None),
            errors: Mutex::new(Vec::new()),
            field_errors: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn context(&self) -> &Arc<SetupContext> {
        &self.ctx
    }

    /// Input accepted by the last successful `load_input`, if any.
    pub fn input(&self) -> Option<InputTree> {
        locked(&self.input).clone()
    }

    pub fn push_error(&self, message: impl Into<String>) {
        locked(&self.errors).push(message.into());
    }

    pub fn set_field_error(&self, key: impl Into<String>, message: impl Into<String>) {
        locked(&self.field_errors).insert(key.into(), message.into());
    }

    pub fn errors(&self) -> Vec<String> {
        locked(&self.errors).clone()
    }

    pub fn field_errors(&self) -> BTreeMap<String, String> {
        locked(&self.field_errors).clone()
    }

    pub fn clear_errors(&self) {
        locked(&self.errors).clear();
        locked(&self.field_errors).clear();
    }

    /// Generic validation: required fields must be non-blank and select values must be one
    /// of the listed options. Valid input is stored; invalid input is dropped and each
    /// problem is recorded under its field key.
    pub fn accept_input(
        &self,
        task_id: &str,
        schema: Option<&FieldSchema>,
        input: InputTree,
    ) -> bool {
        locked(&self.field_errors).clear();

        let mut valid = true;
        if let Some(schema) = schema {
            for (section, field) in schema.iter_fields() {
                let path = format!("{}.{}", section.name, field.name);
                let value = input.get_str(&path).unwrap_or_default();
                let key = field_error_key(task_id, &section.name, &field.name);

                if value.trim().is_empty() {
                    if field.required {
                        self.set_field_error(key, format!("{} is required", field.label));
                        valid = false;
                    }
                    continue;
                }

                if let FieldType::Select { options } = &field.field_type {
                    if !options.contains_key(value.trim()) {
                        self.set_field_error(
                            key,
                            format!("{} must be one of: {}", field.label, option_list(options)),
                        );
                        valid = false;
                    }
                }
            }
        }

        debug!(
            "[PHASE: setup] [STEP: input] Input validated (task={}, valid={})",
            task_id, valid
        );
        *locked(&self.input) = if valid { Some(input) } else { None };
        valid
    }
}

fn option_list(options: &BTreeMap<String, String>) -> String {
    options.keys().cloned().collect::<Vec<_>>().join(", ")
}

/// One unit of setup work.
#[async_trait]
pub trait Task: Send + Sync {
    fn title(&self) -> &str;

    fn base(&self) -> &TaskBase;

    /// Slug of the title; prefixes this task's field error keys.
    fn id(&self) -> String {
        generate_id(self.title())
    }

    /// A positive `skip()` on this task ends the whole pass.
    fn skip_complete(&self) -> bool {
        false
    }

    fn context(&self) -> &Arc<SetupContext> {
        self.base().context()
    }

    /// Must be monotonic for a given persisted state.
    async fn skip(&self) -> TaskResult<bool> {
        Ok(false)
    }

    /// Fewer than two tables in the application's schema, or no application at all.
    async fn is_new_install(&self) -> TaskResult<bool> {
        let Some(app) = self.context().app().await else {
            return Ok(true);
        };
        let tables = app.table_names().await?;
        Ok(tables.len() < 2)
    }

    /// Side-effect free post-condition probe; callable before `run()`.
    async fn test(&self) -> TaskResult<bool>;

    /// The mutating action. Safe to repeat.
    async fn run(&self) -> TaskResult<bool>;

    /// Confirmation prompt when action is needed.
    async fn verification(&self) -> TaskResult<Option<String>> {
        Ok(None)
    }

    async fn load_input(&self, input: InputTree) -> TaskResult<bool> {
        let schema = self.fields().await?;
        Ok(self.base().accept_input(&self.id(), schema.as_ref(), input))
    }

    /// `None` when no input is needed.
    async fn fields(&self) -> TaskResult<Option<FieldSchema>> {
        Ok(None)
    }

    fn errors(&self) -> Vec<String> {
        self.base().errors()
    }

    fn field_errors(&self) -> BTreeMap<String, String> {
        self.base().field_errors()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::application::tests::StubApplication;
    use crate::models::fields::{FieldDefinition, FieldSection};
    use crate::models::state::tests::context_at;

    struct Probe {
        base: TaskBase,
    }

    #[async_trait]
    impl Task for Probe {
        fn title(&self) -> &str {
            "Cache Warmup!"
        }

        fn base(&self) -> &TaskBase {
            &self.base
        }

        async fn test(&self) -> TaskResult<bool> {
            Ok(true)
        }

        async fn run(&self) -> TaskResult<bool> {
            Ok(true)
        }

        async fn fields(&self) -> TaskResult<Option<FieldSchema>> {
            let options = BTreeMap::from([
                ("development".to_string(), "Development".to_string()),
                ("production".to_string(), "Production".to_string()),
            ]);
            Ok(Some(
                FieldSchema::new().section(
                    FieldSection::new("app", "General")
                        .field(FieldDefinition::select("template", "Environment", options))
                        .field(FieldDefinition::text("name", "Application Name"))
                        .field(FieldDefinition::text("note", "Note").optional()),
                ),
            ))
        }
    }

    fn probe(root: &std::path::Path, tables: &[&str]) -> Probe {
        Probe {
            base: TaskBase::new(Arc::new(context_at(root, tables))),
        }
    }

    #[test]
    fn id_is_slug_of_title() {
        let tmp = tempfile::tempdir().unwrap();
        assert_eq!(probe(tmp.path(), &[]).id(), "cache-warmup");
    }

    #[tokio::test]
    async fn defaults_do_not_skip_or_prompt() {
        let tmp = tempfile::tempdir().unwrap();
        let task = probe(tmp.path(), &[]);
        assert!(!task.skip().await.unwrap());
        assert!(!task.skip_complete());
        assert!(task.verification().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn new_install_follows_table_count() {
        let tmp = tempfile::tempdir().unwrap();
        let task = probe(tmp.path(), &[]);
        assert!(task.is_new_install().await.unwrap());

        for (tables, expected) in [
            (vec![], true),
            (vec!["migration"], true),
            (vec!["migration", "user"], false),
        ] {
            task.context()
                .set_application(Some(Arc::new(StubApplication::with_tables(&tables))))
                .await;
            assert_eq!(task.is_new_install().await.unwrap(), expected);
        }
    }

    #[tokio::test]
    async fn required_and_select_validation() {
        let tmp = tempfile::tempdir().unwrap();
        let task = probe(tmp.path(), &[]);

        let mut input = InputTree::new();
        input.set("app.template", "staging");
        input.set("app.name", "  ");
        assert!(!task.load_input(input).await.unwrap());
        let errors = task.field_errors();
        assert_eq!(
            errors.get("field_cache-warmup_app_name").map(String::as_str),
            Some("Application Name is required")
        );
        assert!(errors["field_cache-warmup_app_template"].contains("development, production"));
        assert!(!errors.contains_key("field_cache-warmup_app_note"));
        assert!(task.base().input().is_none());

        let mut input = InputTree::new();
        input.set("app.template", "production");
        input.set("app.name", "My Cool App");
        assert!(task.load_input(input).await.unwrap());
        assert!(task.field_errors().is_empty());
        assert_eq!(
            task.base().input().unwrap().get_str("app.name").as_deref(),
            Some("My Cool App")
        );
    }
}
