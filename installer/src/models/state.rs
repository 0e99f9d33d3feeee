// Setup context (in-memory)
//
// NOTE: This is NOT persisted; it is rebuilt from the environment file at the start of every
// orchestration pass and refreshed after the environment is regenerated. Tasks share one
// instance and run strictly one after another.

use anyhow::Result;
use log::{debug, info};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::database::connection::DbConnector;
use crate::models::application::{ApplicationHandle, InstalledApplication};
use crate::models::environment::EnvironmentSignals;
use crate::models::settings::SetupSettings;

pub struct SetupContext {
    settings: SetupSettings,
    connector: Arc<dyn DbConnector>,
    inner: Mutex<SetupContextInner>,
}

#[derive(Default)]
struct SetupContextInner {
    signals: Option<EnvironmentSignals>,
    app: Option<Arc<dyn ApplicationHandle>>,
    db_ready: bool,
}

impl SetupContext {
    pub fn new(settings: SetupSettings, connector: Arc<dyn DbConnector>) -> Self {
        Self {
            settings,
            connector,
            inner: Mutex::new(SetupContextInner::default()),
        }
    }

    /// Build a context and load whatever environment already exists.
    pub async fn load(settings: SetupSettings, connector: Arc<dyn DbConnector>) -> Result<Self> {
        let ctx = Self::new(settings, connector);
        ctx.refresh().await?;
        Ok(ctx)
    }

    /// Re-read the environment file and rebuild the application accessor.
    pub async fn refresh(&self) -> Result<()> {
        let path = self.environment_file_path();
        let signals = EnvironmentSignals::load(&path)?;

        let mut inner = self.inner.lock().await;
        inner.app = signals.clone().map(|s| {
            Arc::new(InstalledApplication::new(
                s,
                self.settings.name.clone(),
                self.connector.clone(),
            )) as Arc<dyn ApplicationHandle>
        });
        info!(
            "[PHASE: setup] [STEP: context] Context refreshed (env_file={:?}, environmented={})",
            path,
            signals.is_some()
        );
        inner.signals = signals;
        Ok(())
    }

    /// Replace the application accessor.
    pub async fn set_application(&self, app: Option<Arc<dyn ApplicationHandle>>) {
        self.inner.lock().await.app = app;
    }

    pub async fn is_environmented(&self) -> bool {
        self.inner.lock().await.signals.is_some()
    }

    /// Version this installer brings.
    pub fn version(&self) -> semver::Version {
        self.settings.version.clone()
    }

    /// Version recorded in the environment file.
    pub async fn instance_version(&self) -> Option<semver::Version> {
        self.inner
            .lock()
            .await
            .signals
            .as_ref()
            .and_then(EnvironmentSignals::instance_version)
    }

    pub fn environment_path(&self) -> PathBuf {
        self.settings.environment_path.clone()
    }

    pub fn environment_file_path(&self) -> PathBuf {
        self.settings.environment_file_path()
    }

    pub fn environment_templates_path(&self) -> PathBuf {
        self.settings.templates_path.clone()
    }

    pub async fn signals(&self) -> Option<EnvironmentSignals> {
        self.inner.lock().await.signals.clone()
    }

    pub async fn app(&self) -> Option<Arc<dyn ApplicationHandle>> {
        self.inner.lock().await.app.clone()
    }

    /// Application display name: the resolved application's, else the configured one.
    pub async fn name(&self) -> String {
        match self.app().await {
            Some(app) => app.name(),
            None => self.settings.name.clone(),
        }
    }

    /// Mark the database ready once the environment is in place and an application is
    /// resolvable. Returns the resulting flag.
    pub async fn mark_db_ready(&self) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.signals.is_some() && inner.app.is_some() {
            if !inner.db_ready {
                debug!("[PHASE: setup] [STEP: context] Database marked ready");
            }
            inner.db_ready = true;
        }
        inner.db_ready
    }

    pub async fn db_ready(&self) -> bool {
        self.inner.lock().await.db_ready
    }

    pub fn settings(&self) -> &SetupSettings {
        &self.settings
    }

    pub fn connector(&self) -> Arc<dyn DbConnector> {
        self.connector.clone()
    }
}
