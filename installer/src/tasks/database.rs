// Database task: keeps the schema in step with the application's migrations.

use async_trait::async_trait;
use log::{info, warn};
use std::sync::Arc;
use tokio::sync::OnceCell;

use crate::database::migrations::{MigrationDriver, MigrationState};
use crate::installation::{CommandGateway, ProcessGateway};
use crate::models::state::SetupContext;
use crate::tasks::{Task, TaskBase, TaskResult};

pub const UPGRADE_PROMPT: &str =
    "There are database upgrades available. Would you like to upgrade the database now?";

pub struct DatabaseTask {
    base: TaskBase,
    gateway: OnceCell<Arc<dyn CommandGateway>>,
}

impl DatabaseTask {
    /// The migrator is resolved from settings on first use.
    pub fn new(ctx: Arc<SetupContext>) -> Self {
        Self {
            base: TaskBase::new(ctx),
            gateway: OnceCell::new(),
        }
    }

    pub fn with_gateway(ctx: Arc<SetupContext>, gateway: Arc<dyn CommandGateway>) -> Self {
        Self {
            base: TaskBase::new(ctx),
            gateway: OnceCell::new_with(Some(gateway)),
        }
    }

    async fn driver(&self) -> TaskResult<MigrationDriver> {
        let gateway = self
            .gateway
            .get_or_try_init(|| async {
                let gateway = ProcessGateway::resolve(&self.context().settings().migrator)?;
                Ok::<Arc<dyn CommandGateway>, crate::tasks::TaskError>(Arc::new(gateway))
            })
            .await?;
        Ok(MigrationDriver::new(gateway.clone()))
    }

    /// Raw plan-mode state, keeping "unrecognised output" distinct from "nothing pending".
    pub async fn probe(&self) -> TaskResult<MigrationState> {
        Ok(self.driver().await?.probe().await?)
    }
}

#[async_trait]
impl Task for DatabaseTask {
    fn title(&self) -> &str {
        "Database"
    }

    fn base(&self) -> &TaskBase {
        &self.base
    }

    fn skip_complete(&self) -> bool {
        true
    }

    async fn skip(&self) -> TaskResult<bool> {
        Ok(self.test().await? && self.context().mark_db_ready().await)
    }

    async fn test(&self) -> TaskResult<bool> {
        match self.is_new_install().await {
            Ok(true) => {
                info!("[PHASE: database] [STEP: test] New install; nothing to migrate");
                return Ok(true);
            }
            Ok(false) => {}
            Err(e) => {
                warn!(
                    "[PHASE: database] [STEP: test] Unable to list tables: {}",
                    e
                );
                self.base.push_error(format!("Unable to inspect the database schema: {}", e));
                return Ok(false);
            }
        }

        let driver = self.driver().await?;
        match driver.probe().await {
            Ok(MigrationState::InSync) => Ok(true),
            Ok(MigrationState::Pending { count }) => {
                info!(
                    "[PHASE: database] [STEP: test] Migrations pending (count={})",
                    count
                );
                Ok(false)
            }
            Ok(MigrationState::Unknown) => {
                warn!(
                    "[PHASE: database] [STEP: test] Migration state unknown; treating as in sync"
                );
                Ok(true)
            }
            Err(e) => {
                warn!(
                    "[PHASE: database] [STEP: test] Migration probe failed: {:#}",
                    e
                );
                self.base.push_error(format!("Unable to check migrations: {}", e));
                Ok(false)
            }
        }
    }

    async fn run(&self) -> TaskResult<bool> {
        let driver = self.driver().await?;
        match driver.apply().await {
            Ok(true) => Ok(true),
            Ok(false) => {
                self.base
                    .push_error("The migrator did not report a successful upgrade");
                Ok(false)
            }
            Err(e) => {
                warn!(
                    "[PHASE: database] [STEP: run] Migration run failed: {:#}",
                    e
                );
                self.base.push_error(format!("Unable to run migrations: {}", e));
                Ok(false)
            }
        }
    }

    async fn verification(&self) -> TaskResult<Option<String>> {
        if !self.is_new_install().await.unwrap_or(false) && !self.test().await? {
            return Ok(Some(UPGRADE_PROMPT.to_string()));
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::migrations::tests::ScriptedMigrator;
    use crate::models::application::tests::StubApplication;
    use crate::models::settings::MigratorSettings;
    use crate::models::state::tests::{context_at, write_env};
    use crate::tasks::TaskError;

    const SCHEMA: &[&str] = &["migration", "user", "post"];

    async fn task_with(
        root: &std::path::Path,
        tables: &[&str],
        migrator: Arc<ScriptedMigrator>,
    ) -> DatabaseTask {
        let ctx = Arc::new(context_at(root, tables));
        write_env(root, "1.4.0");
        ctx.refresh().await.unwrap();
        DatabaseTask::with_gateway(ctx, migrator)
    }

    #[tokio::test]
    async fn pending_migrations_fail_test_and_prompt() {
        let tmp = tempfile::tempdir().unwrap();
        let migrator = Arc::new(ScriptedMigrator::with_pending(3));
        let task = task_with(tmp.path(), SCHEMA, migrator).await;

        assert!(!task.is_new_install().await.unwrap());
        assert!(!task.test().await.unwrap());
        assert!(!task.skip().await.unwrap());
        assert_eq!(
            task.verification().await.unwrap().as_deref(),
            Some(UPGRADE_PROMPT)
        );
    }

    #[tokio::test]
    async fn run_applies_then_test_passes() {
        let tmp = tempfile::tempdir().unwrap();
        let migrator = Arc::new(ScriptedMigrator::with_pending(2));
        let task = task_with(tmp.path(), SCHEMA, migrator.clone()).await;

        assert!(task.run().await.unwrap());
        assert!(task.test().await.unwrap());
        assert!(task.verification().await.unwrap().is_none());
        assert_eq!(migrator.apply_calls(), 1);
    }

    #[tokio::test]
    async fn run_when_in_sync_leaves_state_alone() {
        let tmp = tempfile::tempdir().unwrap();
        let migrator = Arc::new(ScriptedMigrator::with_pending(0));
        let task = task_with(tmp.path(), SCHEMA, migrator.clone()).await;

        assert!(task.test().await.unwrap());
        // The migrator's "up-to-date" output is not a success report.
        assert!(!task.run().await.unwrap());
        assert!(task.test().await.unwrap());
        assert_eq!(*migrator.pending.lock().unwrap(), Some(0));
    }

    #[tokio::test]
    async fn bootstrap_schema_is_treated_as_in_sync() {
        for tables in [&[][..], &["migration"][..]] {
            let tmp = tempfile::tempdir().unwrap();
            let migrator = Arc::new(ScriptedMigrator::with_pending(7));
            let task = task_with(tmp.path(), tables, migrator.clone()).await;

            assert!(task.is_new_install().await.unwrap());
            assert!(task.test().await.unwrap());
            assert!(task.verification().await.unwrap().is_none());
            assert!(migrator.calls.lock().unwrap().is_empty());
        }
    }

    #[tokio::test]
    async fn parsing_contract() {
        let tmp = tempfile::tempdir().unwrap();
        let migrator = Arc::new(ScriptedMigrator::with_pending(3));
        let task = task_with(tmp.path(), SCHEMA, migrator.clone()).await;
        assert_eq!(task.probe().await.unwrap(), MigrationState::Pending { count: 3 });
        assert!(!task.test().await.unwrap());

        *migrator.pending.lock().unwrap() = None;
        assert_eq!(task.probe().await.unwrap(), MigrationState::Unknown);
        assert!(task.test().await.unwrap());
    }

    #[tokio::test]
    async fn unrecognised_plan_output_counts_as_in_sync() {
        let tmp = tempfile::tempdir().unwrap();
        let migrator = Arc::new(ScriptedMigrator::silent());
        let task = task_with(tmp.path(), SCHEMA, migrator).await;

        assert_eq!(task.probe().await.unwrap(), MigrationState::Unknown);
        assert!(task.test().await.unwrap());
        assert!(task.verification().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unreadable_schema_fails_test_without_aborting() {
        let tmp = tempfile::tempdir().unwrap();
        let migrator = Arc::new(ScriptedMigrator::with_pending(0));
        let task = task_with(tmp.path(), SCHEMA, migrator.clone()).await;
        let mut app = StubApplication::with_tables(SCHEMA);
        app.listing_error = Some("Lost connection to server".to_string());
        task.context().set_application(Some(Arc::new(app))).await;

        assert!(!task.test().await.unwrap());
        assert!(task.errors()[0].starts_with("Unable to inspect the database schema: "));
        assert_eq!(
            task.verification().await.unwrap().as_deref(),
            Some(UPGRADE_PROMPT)
        );
        assert!(migrator.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn skip_is_monotonic_until_migrations_appear() {
        let tmp = tempfile::tempdir().unwrap();
        let migrator = Arc::new(ScriptedMigrator::with_pending(0));
        let task = task_with(tmp.path(), SCHEMA, migrator.clone()).await;

        for _ in 0..3 {
            assert!(task.skip().await.unwrap());
        }
        assert!(task.context().db_ready().await);

        *migrator.pending.lock().unwrap() = Some(1);
        assert!(!task.skip().await.unwrap());
    }

    #[tokio::test]
    async fn skip_needs_database_ready_flag() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = Arc::new(context_at(tmp.path(), SCHEMA));
        ctx.set_application(Some(Arc::new(StubApplication::with_tables(SCHEMA))))
            .await;
        // No environment file: the context cannot mark the database ready.
        let task = DatabaseTask::with_gateway(ctx, Arc::new(ScriptedMigrator::with_pending(0)));
        assert!(task.test().await.unwrap());
        assert!(!task.skip().await.unwrap());
    }

    #[tokio::test]
    async fn gateway_failure_degrades_to_false() {
        let tmp = tempfile::tempdir().unwrap();
        let migrator = Arc::new(ScriptedMigrator::broken("migrator timed out"));
        let task = task_with(tmp.path(), SCHEMA, migrator).await;

        assert!(!task.test().await.unwrap());
        assert!(!task.run().await.unwrap());
        assert_eq!(task.errors().len(), 2);
    }

    #[tokio::test]
    async fn missing_migrator_is_a_configuration_error() {
        let tmp = tempfile::tempdir().unwrap();
        let mut settings = crate::models::settings::SetupSettings::rooted_at(tmp.path());
        settings.migrator = MigratorSettings {
            program: "/no/such/migrator".to_string(),
            ..MigratorSettings::default()
        };
        let ctx = Arc::new(SetupContext::new(
            settings,
            Arc::new(crate::database::connection::tests::StubConnector::healthy(SCHEMA)),
        ));
        ctx.set_application(Some(Arc::new(StubApplication::with_tables(SCHEMA))))
            .await;

        let task = DatabaseTask::new(ctx);
        assert!(matches!(
            task.test().await,
            Err(TaskError::Configuration(_))
        ));
    }
}
