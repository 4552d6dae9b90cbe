use crate::error::StoreError;
use crate::models::LabelSet;
use rusqlite::{Connection, TransactionBehavior};
use std::collections::HashSet;

pub const SCHEMA_VERSION: i32 = 1;

pub const TABLE_NAME: &str = "observations";

/// Column holding the probability of `label`
pub fn probability_column(label: &str) -> String {
    format!("p_{}", label.to_ascii_lowercase())
}

fn create_table_sql(labels: &LabelSet) -> String {
    let probability_columns: String = labels
        .iter()
        .map(|label| format!("    \"{}\" REAL NOT NULL,\n", probability_column(label)))
        .collect();

    format!(
        "CREATE TABLE IF NOT EXISTS {table} (
    date TEXT NOT NULL,
    lat_e6 INTEGER NOT NULL,
    lon_e6 INTEGER NOT NULL,
    latitude REAL NOT NULL,
    longitude REAL NOT NULL,
{probability_columns}    model TEXT NOT NULL,
    source_url TEXT,
    recorded_at TEXT NOT NULL,
    PRIMARY KEY (date, lat_e6, lon_e6)
);
CREATE INDEX IF NOT EXISTS idx_{table}_site ON {table} (lat_e6, lon_e6, date);",
        table = TABLE_NAME,
        probability_columns = probability_columns,
    )
}

/// Create the table if needed and check it carries every label column
///
/// Runs under `BEGIN IMMEDIATE`, so concurrent processes opening a fresh file
/// serialise here and `IF NOT EXISTS` makes the losers no-ops.
pub(crate) fn ensure_schema(conn: &mut Connection, labels: &LabelSet) -> Result<(), StoreError> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let version: i32 = tx.pragma_query_value(None, "user_version", |row| row.get(0))?;
    if version > SCHEMA_VERSION {
        return Err(StoreError::SchemaMismatch(format!(
            "database version ({}) is newer than supported schema ({})",
            version, SCHEMA_VERSION
        )));
    }

    tx.execute_batch(&create_table_sql(labels))?;
    if version < SCHEMA_VERSION {
        tx.pragma_update(None, "user_version", SCHEMA_VERSION)?;
    }
    tx.commit()?;

    verify_columns(conn, labels)
}

fn verify_columns(conn: &Connection, labels: &LabelSet) -> Result<(), StoreError> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", TABLE_NAME))?;
    let existing: HashSet<String> = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<Result<_, _>>()?;

    let missing: Vec<String> = labels
        .iter()
        .map(probability_column)
        .filter(|column| !existing.contains(column))
        .collect();

    if missing.is_empty() {
        Ok(())
    } else {
        Err(StoreError::SchemaMismatch(format!(
            "missing column(s) {}; the store was created with a different label set",
            missing.join(", ")
        )))
    }
}
