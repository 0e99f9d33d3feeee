// Database connection management
//
// DbConnector trait keeps connection probing and schema introspection behind a seam so the
// tasks can be exercised deterministically without a real database.

use anyhow::Result;
use async_trait::async_trait;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use sqlx::mysql::MySqlConnectOptions;
use sqlx::postgres::PgConnectOptions;
use sqlx::{MySql, Pool, Postgres};
use std::time::Duration;
use tokio::time::timeout;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;

use crate::models::bindings::BindingTree;
use crate::utils::logging::mask_connection_url;
use crate::utils::validation::{validate_database_name, validate_port};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseEngine {
    #[default]
    Mysql,
    #[serde(alias = "postgresql", alias = "pgsql")]
    Postgres,
}

impl DatabaseEngine {
    pub fn scheme(&self) -> &'static str {
        match self {
            DatabaseEngine::Mysql => "mysql",
            DatabaseEngine::Postgres => "postgres",
        }
    }
}

/// Connection parameters as collected in the `db` section / written to the environment file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionParams {
    #[serde(default)]
    pub engine: DatabaseEngine,
    pub host: String,
    pub port: u16,
    pub username: String,
    #[serde(default)]
    pub password: String,
    pub dbname: String,
}

impl ConnectionParams {
    /// Build from a `db` binding section (`host`, `port`, `username`, `password`, `dbname`,
    /// optional `engine`).
    pub fn from_bindings(section: &BindingTree) -> Result<Self> {
        let host = section
            .get_non_empty("host")
            .ok_or_else(|| anyhow::anyhow!("Database host is required"))?;
        let port = validate_port(&section.get_str("port").unwrap_or_default())?;
        let dbname = section.get_str("dbname").unwrap_or_default();
        validate_database_name(&dbname)?;
        let engine = match section.get_str("engine").as_deref().map(str::trim) {
            None | Some("") | Some("mysql") => DatabaseEngine::Mysql,
            Some("postgres") | Some("postgresql") | Some("pgsql") => DatabaseEngine::Postgres,
            Some(other) => anyhow::bail!("Unsupported database engine '{}'", other),
        };

        Ok(Self {
            engine,
            host: host.trim().to_string(),
            port,
            username: section.get_str("username").unwrap_or_default(),
            password: section.get_str("password").unwrap_or_default(),
            dbname,
        })
    }

    /// Credential-masked URL for logs.
    pub fn masked_url(&self) -> String {
        mask_connection_url(&format!(
            "{}://{}:{}@{}:{}/{}",
            self.engine.scheme(),
            self.username,
            if self.password.is_empty() { "" } else { "x" },
            self.host,
            self.port,
            self.dbname
        ))
    }
}

/// Error returned by connection attempts.
/// Keeps user-friendly messages separate from internal details.
#[derive(Debug, Clone)]
pub struct ConnectError {
    /// User-friendly message (safe to show in UI)
    pub user_message: String,
    /// Internal details for logging (may contain masked info)
    pub internal_details: String,
}

impl std::fmt::Display for ConnectError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.user_message)
    }
}

impl std::error::Error for ConnectError {}

impl ConnectError {
    fn is_transient(&self) -> bool {
        let msg = self.internal_details.to_ascii_lowercase();
        msg.contains("timed out")
            || msg.contains("timeout")
            || msg.contains("network")
            || msg.contains("i/o")
            || msg.contains("reset")
            || msg.contains("refused")
    }
}

/// Trait for database connection attempts and schema introspection.
/// Production code uses RealDbConnector; tests use stubs.
#[async_trait]
pub trait DbConnector: Send + Sync {
    /// Attempt to connect. Returns Ok(()) on success, or ConnectError with a user-friendly
    /// message.
    async fn connect(&self, params: &ConnectionParams) -> Result<(), ConnectError>;

    /// Names of the tables in the target schema.
    async fn list_tables(&self, params: &ConnectionParams) -> Result<Vec<String>, ConnectError>;

    /// Get the timeout duration for connection attempts.
    fn timeout_duration(&self) -> Duration {
        Duration::from_secs(20)
    }

    /// Get the maximum number of attempts.
    fn max_retries(&self) -> u32 {
        3
    }

    /// Base delay for the exponential backoff between attempts.
    fn retry_base_millis(&self) -> u64 {
        100
    }
}

/// Production connector that actually connects to databases.
pub struct RealDbConnector {
    timeout: Duration,
    max_retries: u32,
}

impl RealDbConnector {
    pub fn new(timeout: Duration, max_retries: u32) -> Self {
        Self {
            timeout,
            max_retries: max_retries.max(1),
        }
    }
}

impl Default for RealDbConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(20), 3)
    }
}

fn classify_failure(result: Result<Result<DatabaseConnection>, tokio::time::error::Elapsed>) -> Result<DatabaseConnection, ConnectError> {
    match result {
        Ok(Ok(conn)) => Ok(conn),
        Ok(Err(e)) => Err(ConnectError {
            user_message: "Unable to connect. Verify host, credentials, and network access."
                .to_string(),
            internal_details: format!("Connection error: {}", e),
        }),
        Err(_) => Err(ConnectError {
            user_message: "Connection timed out. Check network connectivity and firewall."
                .to_string(),
            internal_details: "Connection attempt timed out".to_string(),
        }),
    }
}

#[async_trait]
impl DbConnector for RealDbConnector {
    async fn connect(&self, params: &ConnectionParams) -> Result<(), ConnectError> {
        let conn = classify_failure(timeout(self.timeout, DatabaseConnection::open(params)).await)?;
        conn.close().await;
        Ok(())
    }

    async fn list_tables(&self, params: &ConnectionParams) -> Result<Vec<String>, ConnectError> {
        let conn = classify_failure(timeout(self.timeout, DatabaseConnection::open(params)).await)?;
        let tables = conn.table_names().await.map_err(|e| ConnectError {
            user_message: "Unable to read the database schema.".to_string(),
            internal_details: format!("Schema query failed: {}", e),
        });
        conn.close().await;
        tables
    }

    fn timeout_duration(&self) -> Duration {
        self.timeout
    }

    fn max_retries(&self) -> u32 {
        self.max_retries
    }
}

/// Connect with the connector's timeout, retrying transient failures with exponential
/// backoff. Makes at most `max_retries()` attempts.
pub async fn connect_with_retry(
    connector: &dyn DbConnector,
    params: &ConnectionParams,
) -> Result<(), ConnectError> {
    info!(
        "[PHASE: database] [STEP: connect] Connecting (target={})",
        params.masked_url()
    );

    let attempt = || async {
        match timeout(connector.timeout_duration(), connector.connect(params)).await {
            Ok(result) => result,
            Err(_) => Err(ConnectError {
                user_message: "Connection timed out. Check network connectivity and firewall."
                    .to_string(),
                internal_details: "Connection attempt timed out".to_string(),
            }),
        }
    };

    let retry_strategy = ExponentialBackoff::from_millis(connector.retry_base_millis())
        .factor(2)
        .max_delay(Duration::from_secs(2))
        .map(jitter)
        .take(connector.max_retries().saturating_sub(1) as usize);

    let result = RetryIf::spawn(retry_strategy, attempt, |e: &ConnectError| {
        let transient = e.is_transient();
        if transient {
            warn!(
                "[PHASE: database] [STEP: connect] Transient connection failure; will retry (details={})",
                e.internal_details
            );
        }
        transient
    })
    .await;

    if let Err(e) = &result {
        warn!(
            "[PHASE: database] [STEP: connect] Connection failed (target={}, details={})",
            params.masked_url(),
            e.internal_details
        );
    }
    result
}

/// Database connection enum supporting both MySQL and PostgreSQL
#[derive(Clone)]
pub enum DatabaseConnection {
    Mysql(Pool<MySql>),
    Postgres(Pool<Postgres>),
}

impl DatabaseConnection {
    pub async fn open(params: &ConnectionParams) -> Result<Self> {
        match params.engine {
            DatabaseEngine::Mysql => {
                let options = MySqlConnectOptions::new()
                    .host(&params.host)
                    .port(params.port)
                    .username(&params.username)
                    .password(&params.password)
                    .database(&params.dbname);
                let pool = Pool::<MySql>::connect_with(options).await?;
                Ok(DatabaseConnection::Mysql(pool))
            }
            DatabaseEngine::Postgres => {
                let options = PgConnectOptions::new()
                    .host(&params.host)
                    .port(params.port)
                    .username(&params.username)
                    .password(&params.password)
                    .database(&params.dbname);
                let pool = Pool::<Postgres>::connect_with(options).await?;
                Ok(DatabaseConnection::Postgres(pool))
            }
        }
    }

    /// Tables in the connection's current schema.
    pub async fn table_names(&self) -> Result<Vec<String>> {
        let names = match self {
            DatabaseConnection::Mysql(pool) => {
                sqlx::query_scalar::<_, String>(
                    r#"
                    SELECT CAST(table_name AS CHAR)
                    FROM information_schema.tables
                    WHERE table_schema = DATABASE()
                    "#,
                )
                .fetch_all(pool)
                .await?
            }
            DatabaseConnection::Postgres(pool) => {
                sqlx::query_scalar::<_, String>(
                    r#"
                    SELECT tablename::text
                    FROM pg_tables
                    WHERE schemaname = current_schema()
                    "#,
                )
                .fetch_all(pool)
                .await?
            }
        };
        Ok(names)
    }

    pub async fn close(&self) {
        match self {
            DatabaseConnection::Mysql(pool) => pool.close().await,
            DatabaseConnection::Postgres(pool) => pool.close().await,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use std::time::Instant;

    /// Programmable connector: fails the first `failures` connects, reports `tables`.
    pub struct StubConnector {
        pub failures: u32,
        pub failure_details: String,
        pub tables: Mutex<Vec<String>>,
        pub connect_calls: AtomicU32,
        pub list_calls: AtomicU32,
    }

    impl StubConnector {
        pub fn healthy(tables: &[&str]) -> Self {
            Self {
                failures: 0,
                failure_details: String::new(),
                tables: Mutex::new(tables.iter().map(|s| s.to_string()).collect()),
                connect_calls: AtomicU32::new(0),
                list_calls: AtomicU32::new(0),
            }
        }

        pub fn failing(failures: u32, details: &str) -> Self {
            Self {
                failures,
                failure_details: details.to_string(),
                ..Self::healthy(&[])
            }
        }
    }

    #[async_trait]
    impl DbConnector for StubConnector {
        async fn connect(&self, _params: &ConnectionParams) -> Result<(), ConnectError> {
            let count = self.connect_calls.fetch_add(1, Ordering::SeqCst);
            if count < self.failures {
                return Err(ConnectError {
                    user_message: "Unable to connect. Verify host, credentials, and network access."
                        .to_string(),
                    internal_details: self.failure_details.clone(),
                });
            }
            Ok(())
        }

        async fn list_tables(
            &self,
            _params: &ConnectionParams,
        ) -> Result<Vec<String>, ConnectError> {
            self.list_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.tables.lock().unwrap().clone())
        }

        fn timeout_duration(&self) -> Duration {
            Duration::from_millis(100)
        }

        fn retry_base_millis(&self) -> u64 {
            1
        }
    }

    /// Stub that hangs forever (for timeout testing).
    struct HangingStub;

    #[async_trait]
    impl DbConnector for HangingStub {
        async fn connect(&self, _params: &ConnectionParams) -> Result<(), ConnectError> {
            std::future::pending::<()>().await;
            unreachable!()
        }

        async fn list_tables(
            &self,
            _params: &ConnectionParams,
        ) -> Result<Vec<String>, ConnectError> {
            std::future::pending::<()>().await;
            unreachable!()
        }

        fn timeout_duration(&self) -> Duration {
            Duration::from_millis(50)
        }

        fn max_retries(&self) -> u32 {
            2
        }

        fn retry_base_millis(&self) -> u64 {
            1
        }
    }

    pub fn sample_params() -> ConnectionParams {
        ConnectionParams {
            engine: DatabaseEngine::Mysql,
            host: "127.0.0.1".to_string(),
            port: 3306,
            username: "app".to_string(),
            password: "PASSWORD_SHOULD_BE_REDACTED".to_string(),
            dbname: "app".to_string(),
        }
    }

    #[tokio::test]
    async fn transient_failures_are_retried_until_success() {
        let stub = StubConnector::failing(2, "Connection refused (os error 111)");
        let result = connect_with_retry(&stub, &sample_params()).await;
        assert!(result.is_ok(), "Should succeed after 2 failures");
        assert_eq!(stub.connect_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_failures_are_not_retried() {
        let stub = StubConnector::failing(10, "Access denied for user 'app'");
        let err = connect_with_retry(&stub, &sample_params()).await.unwrap_err();
        assert_eq!(stub.connect_calls.load(Ordering::SeqCst), 1);
        assert!(err.user_message.contains("Unable to connect"));
        assert!(!err.user_message.contains("Access denied"));
    }

    #[tokio::test]
    async fn retries_are_bounded() {
        let stub = StubConnector::failing(10, "network unreachable");
        let result = connect_with_retry(&stub, &sample_params()).await;
        assert!(result.is_err());
        assert_eq!(stub.connect_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn hanging_connect_times_out_within_budget() {
        let started = Instant::now();
        let err = connect_with_retry(&HangingStub, &sample_params())
            .await
            .unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(3));
        assert!(err.user_message.contains("timed out"));
    }

    #[test]
    fn params_from_bindings_validate_fields() {
        let mut section = BindingTree::new();
        section.set("host", " db.local ");
        section.set("port", "3307");
        section.set("username", "app");
        section.set("password", "pw");
        section.set("dbname", "app_prod");
        let params = ConnectionParams::from_bindings(&section).unwrap();
        assert_eq!(params.host, "db.local");
        assert_eq!(params.port, 3307);
        assert_eq!(params.engine, DatabaseEngine::Mysql);

        section.set("port", "not-a-port");
        assert!(ConnectionParams::from_bindings(&section).is_err());

        section.set("port", "5432");
        section.set("engine", "postgresql");
        assert_eq!(
            ConnectionParams::from_bindings(&section).unwrap().engine,
            DatabaseEngine::Postgres
        );
    }

    #[test]
    fn masked_url_never_contains_password() {
        let masked = sample_params().masked_url();
        assert!(!masked.contains("PASSWORD_SHOULD_BE_REDACTED"));
        assert!(masked.contains("127.0.0.1:3306/app"));
    }

    #[test]
    fn connect_error_display_is_user_friendly() {
        let err = ConnectError {
            user_message: "Connection refused by server.".to_string(),
            internal_details: "tcp connect failed: errno=111".to_string(),
        };
        assert_eq!(format!("{}", err), "Connection refused by server.");
    }
}
