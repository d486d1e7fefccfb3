//! SurrealDB connection setup
//!
//! Resolves where the learner's state lives and returns a connected,
//! schema-initialised client. Supports in-memory, local file (SurrealKV),
//! plain URL and authenticated remote (WebSocket) connections.

use crate::error::StateError;
use crate::migrations;
use crate::Result;
use surrealdb::engine::any::Any;
use surrealdb::opt::auth::{Database, Root};
use surrealdb::Surreal;
use tracing::{info, instrument};

const DEFAULT_NAMESPACE: &str = "transit";
const DEFAULT_DATABASE: &str = "pulse";

/// Default on-disk location when no connection settings are given
pub const DEFAULT_LOCAL_PATH: &str = ".pulse/db";

/// Credentials for an authenticated endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub endpoint: String,
    pub username: String,
    pub password: String,
    pub namespace: String,
    pub database: String,
    /// Sign in as a root user instead of a database user
    pub root: bool,
}

/// Where the learner's state lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DbTarget {
    Remote(Credentials),
    Url(String),
    Local,
}

impl DbTarget {
    /// Pick a target from `SURREALDB_*` variables read through `var`.
    ///
    /// `SURREALDB_ENDPOINT` with `SURREALDB_USERNAME` and `SURREALDB_PASSWORD`
    /// wins; then `SURREALDB_URL`; otherwise local persistence.
    pub fn resolve(var: impl Fn(&str) -> Option<String>) -> Self {
        let remote = (
            var("SURREALDB_ENDPOINT"),
            var("SURREALDB_USERNAME"),
            var("SURREALDB_PASSWORD"),
        );
        if let (Some(endpoint), Some(username), Some(password)) = remote {
            return DbTarget::Remote(Credentials {
                endpoint,
                username,
                password,
                namespace: var("SURREALDB_NAMESPACE")
                    .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string()),
                database: var("SURREALDB_DATABASE")
                    .unwrap_or_else(|| DEFAULT_DATABASE.to_string()),
                root: var("SURREALDB_ROOT").is_some_and(|v| v.eq_ignore_ascii_case("true")),
            });
        }
        match var("SURREALDB_URL") {
            Some(url) => DbTarget::Url(url),
            None => DbTarget::Local,
        }
    }
}

/// Connect to an unauthenticated URL (`mem://`, `surrealkv://path`, `ws://...`).
#[instrument(skip_all, fields(url = %url))]
pub async fn connect_url(url: &str) -> Result<Surreal<Any>> {
    let db = surrealdb::engine::any::connect(url)
        .await
        .map_err(|e| StateError::Connection(format!("Failed to connect to {}: {}", url, e)))?;

    db.use_ns(DEFAULT_NAMESPACE)
        .use_db(DEFAULT_DATABASE)
        .await
        .map_err(|e| StateError::Connection(e.to_string()))?;

    migrations::init_schema(&db).await?;
    info!("SurrealDB connected ({})", url);
    Ok(db)
}

/// Connect with credentials.
#[instrument(skip(creds), fields(endpoint = %creds.endpoint, namespace = %creds.namespace))]
async fn connect_remote(creds: &Credentials) -> Result<Surreal<Any>> {
    let db = surrealdb::engine::any::connect(&creds.endpoint)
        .await
        .map_err(|e| {
            StateError::Connection(format!("Failed to connect to {}: {}", creds.endpoint, e))
        })?;

    let signed_in = if creds.root {
        db.signin(Root {
            username: &creds.username,
            password: &creds.password,
        })
        .await
    } else {
        db.signin(Database {
            namespace: &creds.namespace,
            database: &creds.database,
            username: &creds.username,
            password: &creds.password,
        })
        .await
    };
    signed_in.map_err(|e| StateError::Connection(format!("sign-in failed: {e}")))?;

    db.use_ns(&creds.namespace)
        .use_db(&creds.database)
        .await
        .map_err(|e| StateError::Connection(e.to_string()))?;

    migrations::init_schema(&db).await?;
    info!(root = creds.root, "SurrealDB connected (remote)");
    Ok(db)
}

/// Connect to `target`, creating the local database directory if needed.
pub async fn connect(target: &DbTarget) -> Result<Surreal<Any>> {
    match target {
        DbTarget::Remote(creds) => connect_remote(creds).await,
        DbTarget::Url(url) => connect_url(url).await,
        DbTarget::Local => {
            std::fs::create_dir_all(DEFAULT_LOCAL_PATH).map_err(|e| {
                StateError::Connection(format!(
                    "Failed to create database directory {DEFAULT_LOCAL_PATH}: {e}"
                ))
            })?;
            info!(path = DEFAULT_LOCAL_PATH, "no SurrealDB settings; using local persistence");
            connect_url(&format!("surrealkv://{DEFAULT_LOCAL_PATH}")).await
        }
    }
}

/// Connect to the target named by the process environment.
pub async fn connect_from_env() -> Result<Surreal<Any>> {
    connect(&DbTarget::resolve(|key| std::env::var(key).ok())).await
}
