//! SurrealDB schema migrations and initialization
//!
//! Sets up every Transit Pulse table with its indexes. Safe to call on each
//! connection; all statements are idempotent.

use crate::error::StateError;
use crate::Result;
use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::{debug, info};

/// Initialize all Transit Pulse tables in SurrealDB
pub async fn init_schema(db: &Surreal<Any>) -> Result<()> {
    info!("Initializing Transit Pulse SurrealDB schema");

    init_disruptions_table(db).await?;
    init_severity_levels_table(db).await?;
    init_delay_samples_table(db).await?;
    init_stop_lines_table(db).await?;

    info!("Transit Pulse schema initialization complete");
    Ok(())
}

async fn run(db: &Surreal<Any>, table: &str, sql: &'static str) -> Result<()> {
    db.query(sql)
        .await
        .and_then(|res| res.check())
        .map_err(|e| StateError::SchemaSetup(format!("{table}: {e}")))?;
    info!("✓ {table} table initialized");
    Ok(())
}

/// Initialize `disruptions` table
///
/// Schema:
/// ```text
/// TABLE disruptions {
///   disruption_id:  STRING (record id, unique)
///   line_id:        STRING (indexed)
///   state:          STRING (new | active | updated | resolved, indexed)
///   resolved_at:    DATETIME? (indexed)
///   ...             remaining DisruptionRow columns
/// }
/// ```
///
/// Resolved rows are immutable; enforced by the store before each upsert.
async fn init_disruptions_table(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing disruptions table");

    let sql = r#"
        DEFINE TABLE IF NOT EXISTS disruptions SCHEMALESS;

        DEFINE INDEX IF NOT EXISTS idx_disruption_id ON TABLE disruptions COLUMNS disruption_id UNIQUE;
        DEFINE INDEX IF NOT EXISTS idx_disruption_state ON TABLE disruptions COLUMNS state;
        DEFINE INDEX IF NOT EXISTS idx_disruption_line ON TABLE disruptions COLUMNS line_id;
        DEFINE INDEX IF NOT EXISTS idx_disruption_resolved_at ON TABLE disruptions COLUMNS resolved_at;
    "#;

    run(db, "disruptions", sql).await
}

/// Initialize `severity_levels` table
///
/// One row per (mode, level). Rows are seeded once and never deleted.
async fn init_severity_levels_table(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing severity_levels table");

    let sql = r#"
        DEFINE TABLE IF NOT EXISTS severity_levels SCHEMALESS
            PERMISSIONS
                FOR create FULL
                FOR select FULL
                FOR update FULL
                FOR delete NONE;

        DEFINE INDEX IF NOT EXISTS idx_severity_key ON TABLE severity_levels COLUMNS mode, level UNIQUE;
    "#;

    run(db, "severity_levels", sql).await
}

/// Initialize `delay_samples` table
///
/// Append-only: samples are never updated or deleted.
async fn init_delay_samples_table(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing delay_samples table");

    let sql = r#"
        DEFINE TABLE IF NOT EXISTS delay_samples SCHEMALESS
            PERMISSIONS
                FOR create FULL
                FOR select FULL
                FOR update NONE
                FOR delete NONE;

        DEFINE INDEX IF NOT EXISTS idx_sample_id ON TABLE delay_samples COLUMNS sample_id UNIQUE;
        DEFINE INDEX IF NOT EXISTS idx_sample_key_time ON TABLE delay_samples COLUMNS mode, level, sampled_at;
    "#;

    run(db, "delay_samples", sql).await
}

/// Initialize `stop_lines` table
///
/// One row per (stop, line) pair from the static topology.
async fn init_stop_lines_table(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing stop_lines table");

    let sql = r#"
        DEFINE TABLE IF NOT EXISTS stop_lines SCHEMALESS;

        DEFINE INDEX IF NOT EXISTS idx_stop_line ON TABLE stop_lines COLUMNS stop_id, line_id UNIQUE;
    "#;

    run(db, "stop_lines", sql).await
}
