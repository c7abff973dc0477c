//! SurrealDB connection settings and setup.

use surrealdb::Surreal;
use surrealdb::engine::any::{Any, connect as connect_any};
use surrealdb::opt::auth::Root;

use crate::store::StoreError;

/// Connection shared by every store handle.
pub type Database = Surreal<Any>;

/// Where and how to connect.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Connection endpoint: "mem://", "file://path", "rocksdb://path" or a
    /// remote "ws://host:port".
    pub endpoint: String,
    pub namespace: String,
    pub database: String,
    /// Root user and password, if the server requires sign-in.
    pub credentials: Option<(String, String)>,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            endpoint: "mem://".to_string(),
            namespace: "jobqueue".to_string(),
            database: "main".to_string(),
            credentials: None,
        }
    }
}

impl DbConfig {
    /// Ephemeral in-process database.
    pub fn memory() -> Self {
        Self::default()
    }

    /// On-disk database at `path`.
    pub fn file(path: impl Into<String>) -> Self {
        Self {
            endpoint: format!("file://{}", path.into()),
            ..Default::default()
        }
    }

    /// RocksDB database at `path`. Needs the `rocksdb` feature.
    pub fn rocksdb(path: impl Into<String>) -> Self {
        Self {
            endpoint: format!("rocksdb://{}", path.into()),
            ..Default::default()
        }
    }

    /// Read the configuration from `QUEUE_DB_*` environment variables,
    /// falling back to the in-memory defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let credentials = match (env_value("QUEUE_DB_USER"), env_value("QUEUE_DB_PASS")) {
            (Some(user), Some(pass)) => Some((user, pass)),
            _ => None,
        };
        Self {
            endpoint: env_value("QUEUE_DB_ENDPOINT").unwrap_or(defaults.endpoint),
            namespace: env_value("QUEUE_DB_NAMESPACE").unwrap_or(defaults.namespace),
            database: env_value("QUEUE_DB_DATABASE").unwrap_or(defaults.database),
            credentials,
        }
    }

    /// SurrealDB namespace to use.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// SurrealDB database to use.
    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = database.into();
        self
    }

    /// Sign in as a root user after connecting.
    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.credentials = Some((username.into(), password.into()));
        self
    }
}

fn env_value(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Connect, sign in when credentials are set, and select the namespace and
/// database.
pub async fn connect(config: &DbConfig) -> Result<Database, StoreError> {
    tracing::info!("Opening queue store at {}", config.endpoint);
    let db = connect_any(config.endpoint.as_str()).await?;

    if let Some((username, password)) = &config.credentials {
        db.signin(Root { username, password }).await?;
    }
    db.use_ns(&config.namespace).use_db(&config.database).await?;

    tracing::info!(
        "Queue store ready: {}/{}",
        config.namespace,
        config.database
    );
    Ok(db)
}
