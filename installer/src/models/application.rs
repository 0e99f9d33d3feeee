// Running application accessor
//
// Only the slice of the hosted application the installer needs: its name, the tables in its
// schema and the secrets it was issued.

use anyhow::Result;
use async_trait::async_trait;
use log::debug;
use std::sync::Arc;

use crate::database::connection::DbConnector;
use crate::models::environment::EnvironmentSignals;

#[async_trait]
pub trait ApplicationHandle: Send + Sync {
    fn name(&self) -> String;

    /// Tables in the application's schema.
    async fn table_names(&self) -> Result<Vec<String>>;

    fn salt(&self) -> Option<String>;

    fn cookie_validation_key(&self) -> Option<String>;
}

/// Application described by an existing environment file.
pub struct InstalledApplication {
    signals: EnvironmentSignals,
    fallback_name: String,
    connector: Arc<dyn DbConnector>,
}

impl InstalledApplication {
    pub fn new(
        signals: EnvironmentSignals,
        fallback_name: impl Into<String>,
        connector: Arc<dyn DbConnector>,
    ) -> Self {
        Self {
            signals,
            fallback_name: fallback_name.into(),
            connector,
        }
    }
}

#[async_trait]
impl ApplicationHandle for InstalledApplication {
    fn name(&self) -> String {
        self.signals
            .app
            .name
            .clone()
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| self.fallback_name.clone())
    }

    async fn table_names(&self) -> Result<Vec<String>> {
        let Some(params) = &self.signals.database else {
            debug!("[PHASE: database] [STEP: schema] No database configured; schema is empty");
            return Ok(Vec::new());
        };

        let tables = self
            .connector
            .list_tables(params)
            .await
            .map_err(|e| anyhow::anyhow!("{} ({})", e.user_message, e.internal_details))?;
        debug!(
            "[PHASE: database] [STEP: schema] Listed tables (target={}, count={})",
            params.masked_url(),
            tables.len()
        );
        Ok(tables)
    }

    fn salt(&self) -> Option<String> {
        self.signals.salt().map(str::to_string)
    }

    fn cookie_validation_key(&self) -> Option<String> {
        self.signals.cookie_validation_key().map(str::to_string)
    }
}
