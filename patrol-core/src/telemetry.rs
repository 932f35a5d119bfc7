use std::fs::{create_dir_all, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use rusqlite::{params, Connection, OpenFlags};
use thiserror::Error;
use tracing::warn;

use crate::engine::{EngineEvent, EventSink};

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Persistent event sink: failure-shaped events are appended to a JSONL
/// log, everything of record lands in a SQLite database for later
/// reporting. Sink errors are logged and swallowed; telemetry must never
/// fail a run.
#[derive(Debug)]
pub struct RunTelemetry {
    log: Mutex<File>,
    db_path: PathBuf,
    flags: OpenFlags,
}

impl RunTelemetry {
    pub fn new(
        log_path: impl AsRef<Path>,
        db_path: impl AsRef<Path>,
    ) -> Result<Self, TelemetryError> {
        let log_path = log_path.as_ref().to_path_buf();
        if let Some(parent) = log_path.parent() {
            create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)?;
        let db_path = db_path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent() {
            create_dir_all(parent)?;
        }
        let telemetry = Self {
            log: Mutex::new(file),
            db_path,
            flags: OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
        };
        telemetry.initialize_db()?;
        Ok(telemetry)
    }

    pub fn database_path(&self) -> &Path {
        &self.db_path
    }

    fn initialize_db(&self) -> Result<(), TelemetryError> {
        let conn = self.open_db()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS attempts (
                ts DATETIME DEFAULT CURRENT_TIMESTAMP,
                target TEXT,
                attempt INTEGER,
                success INTEGER,
                elapsed_ms INTEGER,
                error TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_attempts_ts ON attempts(ts DESC);
            CREATE TABLE IF NOT EXISTS circuit_transitions (
                ts DATETIME DEFAULT CURRENT_TIMESTAMP,
                target TEXT,
                from_state TEXT,
                to_state TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_circuit_transitions_ts
                ON circuit_transitions(ts DESC);
            CREATE TABLE IF NOT EXISTS target_results (
                ts DATETIME DEFAULT CURRENT_TIMESTAMP,
                target TEXT,
                success INTEGER,
                attempts INTEGER,
                elapsed_ms INTEGER
            );
            CREATE INDEX IF NOT EXISTS idx_target_results_ts ON target_results(ts DESC);",
        )?;
        Ok(())
    }

    fn open_db(&self) -> Result<Connection, TelemetryError> {
        Ok(Connection::open_with_flags(&self.db_path, self.flags)?)
    }

    fn append_log(&self, event: &EngineEvent) -> Result<(), TelemetryError> {
        let json = serde_json::to_string(event)?;
        if let Ok(mut guard) = self.log.lock() {
            writeln!(guard, "{json}")?;
            guard.flush()?;
        }
        Ok(())
    }

    fn persist(&self, event: &EngineEvent) -> Result<(), TelemetryError> {
        match event {
            EngineEvent::AttemptFinished {
                target,
                attempt,
                success,
                elapsed_ms,
                error,
            } => {
                if !success {
                    self.append_log(event)?;
                }
                let conn = self.open_db()?;
                conn.execute(
                    "INSERT INTO attempts (target, attempt, success, elapsed_ms, error)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        target,
                        *attempt as i64,
                        if *success { 1 } else { 0 },
                        *elapsed_ms as i64,
                        error.clone().unwrap_or_default(),
                    ],
                )?;
            }
            EngineEvent::CircuitTransition { target, from, to } => {
                self.append_log(event)?;
                let conn = self.open_db()?;
                conn.execute(
                    "INSERT INTO circuit_transitions (target, from_state, to_state)
                     VALUES (?1, ?2, ?3)",
                    params![target, from, to],
                )?;
            }
            EngineEvent::TargetFinished {
                target,
                success,
                attempts,
                elapsed_ms,
            } => {
                if !success {
                    self.append_log(event)?;
                }
                let conn = self.open_db()?;
                conn.execute(
                    "INSERT INTO target_results (target, success, attempts, elapsed_ms)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![
                        target,
                        if *success { 1 } else { 0 },
                        *attempts as i64,
                        *elapsed_ms as i64,
                    ],
                )?;
            }
            // High-frequency events stay in the tracing stream only.
            EngineEvent::AttemptStarted { .. }
            | EngineEvent::RetryScheduled { .. }
            | EngineEvent::RateLimitWait { .. }
            | EngineEvent::SessionOpened { .. }
            | EngineEvent::SessionDiscarded { .. } => {}
        }
        Ok(())
    }
}

impl EventSink for RunTelemetry {
    fn record(&self, event: &EngineEvent) {
        if let Err(err) = self.persist(event) {
            warn!(error = %err, "telemetry write failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn persists_failures_and_results() {
        let dir = tempdir().unwrap();
        let log_path = dir.path().join("failures.log");
        let db_path = dir.path().join("metrics.sqlite");
        let telemetry = RunTelemetry::new(&log_path, &db_path).unwrap();

        telemetry.record(&EngineEvent::AttemptFinished {
            target: "shop".into(),
            attempt: 1,
            success: false,
            elapsed_ms: 420,
            error: Some("step 'grab' timed out".into()),
        });
        telemetry.record(&EngineEvent::CircuitTransition {
            target: "shop".into(),
            from: "closed".into(),
            to: "open".into(),
        });
        telemetry.record(&EngineEvent::TargetFinished {
            target: "shop".into(),
            success: true,
            attempts: 2,
            elapsed_ms: 900,
        });

        let log_contents = std::fs::read_to_string(&log_path).unwrap();
        assert!(log_contents.contains("timed out"));
        assert!(log_contents.contains("circuit_transition"));

        let conn = Connection::open(&db_path).unwrap();
        let attempts: i64 = conn
            .query_row("SELECT COUNT(*) FROM attempts", [], |row| row.get(0))
            .unwrap();
        assert_eq!(attempts, 1);
        let transitions: i64 = conn
            .query_row("SELECT COUNT(*) FROM circuit_transitions", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(transitions, 1);
        let results: i64 = conn
            .query_row("SELECT COUNT(*) FROM target_results", [], |row| row.get(0))
            .unwrap();
        assert_eq!(results, 1);
    }
}
