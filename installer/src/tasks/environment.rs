// Environment task: renders the configuration tree from the selected environment templates.
//
// Secrets (salt, cookie validation key) are issued once and carried over on every rerun.

use async_trait::async_trait;
use log::{info, warn};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::database::connection::{connect_with_retry, ConnectionParams};
use crate::installation::files::list_subdirectories;
use crate::installation::templates::{materialize, JinjaRenderer, Renderer};
use crate::models::bindings::BindingTree;
use crate::models::environment::EnvironmentSignals;
use crate::models::fields::{field_error_key, FieldDefinition, FieldSchema, FieldSection};
use crate::models::state::SetupContext;
use crate::security::crypto::{generate_secret, secret_fingerprint};
use crate::tasks::{InputTree, Task, TaskBase, TaskError, TaskResult};
use crate::utils::validation::{generate_id, title_case};

pub const DEFAULT_TEMPLATE: &str = "development";

const DEFAULT_DB_HOST: &str = "127.0.0.1";
const DEFAULT_DB_PORT: &str = "3306";
const DEFAULT_REDIS_HOST: &str = "127.0.0.1";
const DEFAULT_REDIS_PORT: &str = "6380";

pub struct EnvironmentTask {
    base: TaskBase,
    renderer: Arc<dyn Renderer>,
}

impl EnvironmentTask {
    pub fn new(ctx: Arc<SetupContext>) -> Self {
        Self::with_renderer(ctx, Arc::new(JinjaRenderer))
    }

    pub fn with_renderer(ctx: Arc<SetupContext>, renderer: Arc<dyn Renderer>) -> Self {
        Self {
            base: TaskBase::new(ctx),
            renderer,
        }
    }

    /// Template choices: every visible directory under the templates root, labelled in
    /// title case.
    async fn template_options(&self) -> TaskResult<BTreeMap<String, String>> {
        let root = self.context().environment_templates_path();
        let names = list_subdirectories(&root).await?;
        Ok(names
            .into_iter()
            .map(|name| {
                let label = title_case(&name);
                (name, label)
            })
            .collect())
    }

    /// Bindings rebuilt from the current environment when no input was collected.
    async fn configured_bindings(&self) -> TaskResult<BindingTree> {
        let ctx = self.context();
        let signals = ctx.signals().await.unwrap_or_default();
        let db = signals.database.as_ref().ok_or_else(|| {
            TaskError::Configuration(format!(
                "No database settings found in {}",
                ctx.environment_file_path().display()
            ))
        })?;

        let mut bindings = BindingTree::new();
        bindings.set("app.name", ctx.name().await);
        bindings.set(
            "app.template",
            signals
                .environment
                .clone()
                .filter(|e| !e.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_TEMPLATE.to_string()),
        );
        bindings.set("db.engine", db.engine.scheme());
        bindings.set("db.host", db.host.clone());
        bindings.set("db.port", db.port.to_string());
        bindings.set("db.username", db.username.clone());
        bindings.set("db.password", db.password.clone());
        bindings.set("db.dbname", db.dbname.clone());
        if let Some(redis) = &signals.redis {
            bindings.set("redis.host", redis.host.clone());
            bindings.set("redis.port", redis.port.to_string());
            bindings.set("redis.database", redis.database.to_string());
        }
        Ok(bindings)
    }

    /// Salt and cookie key: the running application's, else the environment file's, else
    /// freshly generated.
    async fn issue_secrets(&self, bindings: &mut BindingTree) -> TaskResult<()> {
        let ctx = self.context();
        let app = ctx.app().await;
        let signals = ctx.signals().await;

        let existing_salt = app
            .as_ref()
            .and_then(|a| a.salt())
            .or_else(|| signals.as_ref().and_then(|s| s.salt().map(str::to_string)));
        let existing_key = app
            .as_ref()
            .and_then(|a| a.cookie_validation_key())
            .or_else(|| {
                signals
                    .as_ref()
                    .and_then(|s| s.cookie_validation_key().map(str::to_string))
            });

        for (path, existing) in [("salt", existing_salt), ("cookieValidationString", existing_key)] {
            let (value, source) = match existing.filter(|v| !v.trim().is_empty()) {
                Some(v) => (v, "reused"),
                None => (generate_secret()?, "generated"),
            };
            info!(
                "[PHASE: environment] [STEP: secrets] Secret {} (name={}, fingerprint={})",
                source,
                path,
                secret_fingerprint(&value)
            );
            bindings.set(path, value);
        }
        Ok(())
    }

    fn record_setup_failure(&self) {
        self.base.push_error(format!(
            "Unable to set up environment (Env file: {})",
            self.context().environment_file_path().display()
        ));
    }
}

#[async_trait]
impl Task for EnvironmentTask {
    fn title(&self) -> &str {
        "Environment"
    }

    fn base(&self) -> &TaskBase {
        &self.base
    }

    async fn test(&self) -> TaskResult<bool> {
        let ctx = self.context();
        if !ctx.is_environmented().await {
            return Ok(false);
        }

        let env_file = ctx.environment_file_path();
        let unreachable = || {
            TaskError::Configuration(format!(
                "Unable to connect to db! Please verify your settings in {}",
                env_file.display()
            ))
        };
        let params = ctx
            .signals()
            .await
            .and_then(|s| s.database)
            .ok_or_else(unreachable)?;
        connect_with_retry(ctx.connector().as_ref(), &params)
            .await
            .map_err(|e| {
                warn!(
                    "[PHASE: environment] [STEP: test] Database unreachable (details={})",
                    e.internal_details
                );
                unreachable()
            })?;

        let current = match ctx.instance_version().await {
            Some(v) => ctx.version() <= v,
            None => false,
        };
        info!(
            "[PHASE: environment] [STEP: test] Environment checked (target={}, instance={:?}, current={})",
            ctx.version(),
            ctx.instance_version().await.map(|v| v.to_string()),
            current
        );
        Ok(current)
    }

    async fn run(&self) -> TaskResult<bool> {
        let ctx = self.context();
        let mut bindings = match self.base.input() {
            Some(input) => input,
            None => self.configured_bindings().await?,
        };

        let template = bindings
            .get_non_empty("app.template")
            .unwrap_or_else(|| DEFAULT_TEMPLATE.to_string());
        let name = bindings
            .get_non_empty("app.name")
            .unwrap_or_else(|| ctx.settings().name.clone());
        let template_dir = ctx.environment_templates_path().join(&template);

        bindings.set("app.template", template.clone());
        bindings.set("app.id", generate_id(&name));
        bindings.set("templateDirectory", template_dir.to_string_lossy().to_string());
        bindings.set("version", ctx.version().to_string());
        self.issue_secrets(&mut bindings).await?;

        let result = materialize(
            self.renderer.as_ref(),
            &template_dir,
            &ctx.environment_path(),
            &ctx.settings().template_suffix,
            &bindings.to_json(),
        )
        .await;
        if let Err(e) = result {
            warn!(
                "[PHASE: environment] [STEP: run] Materialization failed (template={}): {:#}",
                template, e
            );
            self.record_setup_failure();
            return Ok(false);
        }

        if !ctx.environment_file_path().is_file() {
            warn!(
                "[PHASE: environment] [STEP: run] Templates rendered but no environment file at {:?}",
                ctx.environment_file_path()
            );
            self.record_setup_failure();
            return Ok(false);
        }

        if let Err(e) = ctx.refresh().await {
            warn!(
                "[PHASE: environment] [STEP: run] Generated environment file is unreadable: {:#}",
                e
            );
            self.record_setup_failure();
            return Ok(false);
        }

        info!(
            "[PHASE: environment] [STEP: run] Environment ready (template={}, app_id={})",
            template,
            generate_id(&name)
        );
        Ok(true)
    }

    async fn load_input(&self, input: InputTree) -> TaskResult<bool> {
        let schema = self.fields().await?;
        if !self.base.accept_input(&self.id(), schema.as_ref(), input) {
            return Ok(false);
        }
        if schema.is_none() {
            return Ok(true);
        }

        let host_key = field_error_key(&self.id(), "db", "host");
        let db = self
            .base
            .input()
            .and_then(|i| i.section("db").cloned())
            .unwrap_or_default();
        let params = match ConnectionParams::from_bindings(&db) {
            Ok(p) => p,
            Err(e) => {
                self.base
                    .set_field_error(host_key, format!("Error connecting to db: {}", e));
                return Ok(false);
            }
        };

        if let Err(e) = connect_with_retry(self.context().connector().as_ref(), &params).await {
            self.base
                .set_field_error(host_key, format!("Error connecting to db: {}", e));
            return Ok(false);
        }
        Ok(true)
    }

    async fn fields(&self) -> TaskResult<Option<FieldSchema>> {
        let ctx = self.context();
        if ctx.is_environmented().await && ctx.app().await.is_some() {
            return Ok(None);
        }

        let signals: EnvironmentSignals = ctx.signals().await.unwrap_or_default();
        let profile = signals
            .environment
            .clone()
            .filter(|e| !e.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_TEMPLATE.to_string());
        let name = ctx.name().await;
        let db = signals.database.clone();
        let or_default = |value: Option<String>, fallback: &str| {
            let value = value
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| fallback.to_string());
            move || value.clone()
        };

        let mut schema = FieldSchema::new()
            .section(
                FieldSection::new("app", "General")
                    .field(
                        FieldDefinition::select(
                            "template",
                            "Environment",
                            self.template_options().await?,
                        )
                        .with_value(move || profile.clone()),
                    )
                    .field(
                        FieldDefinition::text("name", "Application Name")
                            .with_value(move || name.clone()),
                    ),
            )
            .section(
                FieldSection::new("db", "Database")
                    .field(FieldDefinition::text("host", "Host").with_value(or_default(
                        db.as_ref().map(|d| d.host.clone()),
                        DEFAULT_DB_HOST,
                    )))
                    .field(FieldDefinition::text("port", "Port").with_value(or_default(
                        db.as_ref().map(|d| d.port.to_string()),
                        DEFAULT_DB_PORT,
                    )))
                    .field(FieldDefinition::text("username", "Username").with_value(
                        or_default(db.as_ref().map(|d| d.username.clone()), ""),
                    ))
                    .field(FieldDefinition::text("password", "Password").with_value(String::new))
                    .field(FieldDefinition::text("dbname", "Database Name").with_value(
                        or_default(db.as_ref().map(|d| d.dbname.clone()), ""),
                    )),
            );

        if let Some(redis) = &signals.redis {
            schema = schema.section(
                FieldSection::new("redis", "Redis Cache")
                    .field(FieldDefinition::text("host", "Host").with_value(or_default(
                        Some(redis.host.clone()),
                        DEFAULT_REDIS_HOST,
                    )))
                    .field(FieldDefinition::text("port", "Port").with_value(or_default(
                        Some(redis.port.to_string()),
                        DEFAULT_REDIS_PORT,
                    ))),
            );
        }

        Ok(Some(schema))
    }
}
