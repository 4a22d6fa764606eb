//! Acquisition database schema

use common::sqlite::SqlitePool;
use tracing::debug;

use crate::error::HvResult;

/// Columns of `data` after `id`, in insert order
pub const DATA_COLUMNS: [&str; 12] = [
    "run_id",
    "ts_ms",
    "time_text",
    "hv_voltage",
    "cathode",
    "gate",
    "anode",
    "backup",
    "vacuum",
    "keithley_voltage",
    "gate_plus_anode",
    "anode_cathode_ratio",
];

pub async fn init_schema(pool: &SqlitePool) -> HvResult<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS runs (
            run_id TEXT PRIMARY KEY,
            start_ms INTEGER NOT NULL,
            end_ms INTEGER,
            params_json TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS data (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            run_id TEXT NOT NULL,
            ts_ms INTEGER NOT NULL,
            time_text TEXT,
            hv_voltage REAL,
            cathode REAL,
            gate REAL,
            anode REAL,
            backup REAL,
            vacuum REAL,
            keithley_voltage REAL,
            gate_plus_anode REAL,
            anode_cathode_ratio REAL,
            FOREIGN KEY(run_id) REFERENCES runs(run_id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_data_run_ts ON data(run_id, ts_ms)")
        .execute(pool)
        .await?;

    debug!("Acquisition schema initialized");
    Ok(())
}
