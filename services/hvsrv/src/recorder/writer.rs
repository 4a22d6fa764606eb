//! Single writer task draining the recorder queue

use std::sync::Arc;
use std::time::Duration;

use common::sqlite::SqlitePool;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, warn};

use super::row::AcquisitionRow;
use super::RecorderStats;
use crate::error::HvResult;

pub(super) enum WriterCommand {
    StartRun {
        run_id: String,
        start_ms: i64,
        params_json: String,
    },
    StopRun {
        run_id: String,
        end_ms: i64,
    },
    Row {
        run_id: String,
        ts_ms: i64,
        row: AcquisitionRow,
    },
    Flush(oneshot::Sender<HvResult<()>>),
    Shutdown(oneshot::Sender<()>),
}

struct PendingRow {
    run_id: String,
    ts_ms: i64,
    row: AcquisitionRow,
}

pub(super) struct Writer {
    pub pool: SqlitePool,
    pub commit_every_rows: usize,
    pub commit_every: Duration,
    pub stats: Arc<RecorderStats>,
}

impl Writer {
    pub async fn run(self, mut rx: mpsc::Receiver<WriterCommand>) {
        let mut batch: Vec<PendingRow> = Vec::with_capacity(self.commit_every_rows);
        let mut last_commit = Instant::now();
        let mut shutdown_reply = None;

        loop {
            let cmd = if batch.is_empty() {
                rx.recv().await
            } else {
                let deadline = last_commit + self.commit_every;
                tokio::select! {
                    cmd = rx.recv() => cmd,
                    _ = tokio::time::sleep_until(deadline) => {
                        let _ = self.commit(&mut batch).await;
                        last_commit = Instant::now();
                        continue;
                    }
                }
            };
            let Some(cmd) = cmd else { break };

            match cmd {
                WriterCommand::Row { run_id, ts_ms, row } => {
                    batch.push(PendingRow { run_id, ts_ms, row });
                    if batch.len() >= self.commit_every_rows {
                        let _ = self.commit(&mut batch).await;
                        last_commit = Instant::now();
                    }
                },
                WriterCommand::StartRun {
                    run_id,
                    start_ms,
                    params_json,
                } => {
                    let _ = self.commit(&mut batch).await;
                    last_commit = Instant::now();
                    let result = sqlx::query(
                        "INSERT INTO runs(run_id, start_ms, end_ms, params_json) VALUES (?, ?, NULL, ?) \
                         ON CONFLICT(run_id) DO UPDATE SET start_ms = excluded.start_ms, \
                         end_ms = NULL, params_json = excluded.params_json",
                    )
                    .bind(&run_id)
                    .bind(start_ms)
                    .bind(&params_json)
                    .execute(&self.pool)
                    .await;
                    if let Err(e) = result {
                        self.stats.record_error(format!("start_run {run_id} failed: {e}"));
                    }
                },
                WriterCommand::StopRun { run_id, end_ms } => {
                    let _ = self.commit(&mut batch).await;
                    last_commit = Instant::now();
                    let result = sqlx::query("UPDATE runs SET end_ms = ? WHERE run_id = ?")
                        .bind(end_ms)
                        .bind(&run_id)
                        .execute(&self.pool)
                        .await;
                    if let Err(e) = result {
                        self.stats.record_error(format!("stop_run {run_id} failed: {e}"));
                    }
                },
                WriterCommand::Flush(reply) => {
                    let result = self.commit(&mut batch).await;
                    last_commit = Instant::now();
                    let _ = reply.send(result);
                },
                WriterCommand::Shutdown(reply) => {
                    shutdown_reply = Some(reply);
                    break;
                },
            }
        }

        let _ = self.commit(&mut batch).await;
        debug!("Recorder writer stopped");
        if let Some(reply) = shutdown_reply {
            let _ = reply.send(());
        }
    }

    /// Insert the batch in one transaction. A failed batch is dropped and
    /// counted; the error is kept as `last_error`.
    async fn commit(&self, batch: &mut Vec<PendingRow>) -> HvResult<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let count = batch.len() as u64;
        let result = self.insert(batch).await;
        batch.clear();

        match result {
            Ok(()) => {
                self.stats.committed(count);
                debug!("Committed {} rows", count);
                Ok(())
            },
            Err(e) => {
                warn!("Insert of {} rows failed: {}", count, e);
                self.stats.record_error(format!("insert failed: {e}"));
                self.stats.add_dropped(count);
                Err(e)
            },
        }
    }

    async fn insert(&self, batch: &[PendingRow]) -> HvResult<()> {
        let mut tx = self.pool.begin().await?;
        for item in batch {
            let r = &item.row;
            sqlx::query(
                r#"
                INSERT INTO data(
                    run_id, ts_ms, time_text, hv_voltage, cathode, gate, anode, backup, vacuum,
                    keithley_voltage, gate_plus_anode, anode_cathode_ratio
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&item.run_id)
            .bind(item.ts_ms)
            .bind(&r.time_text)
            .bind(r.hv_voltage)
            .bind(r.cathode)
            .bind(r.gate)
            .bind(r.anode)
            .bind(r.backup)
            .bind(r.vacuum)
            .bind(r.keithley_voltage)
            .bind(r.gate_plus_anode)
            .bind(r.anode_cathode_ratio)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}
