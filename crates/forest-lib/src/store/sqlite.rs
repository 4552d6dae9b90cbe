//! SQLite-backed result store
//!
//! The connection lives on a dedicated thread; async callers send it closures
//! and await the reply on a oneshot channel.

use super::schema::{ensure_schema, probability_column, TABLE_NAME};
use super::{async_trait, ConflictPolicy, ResultStore, SaveOutcome, StoreConfig};
use crate::error::StoreError;
use crate::models::{ClassificationResult, Coordinate, LabelSet, ObservationKey, StoredRecord};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, OptionalExtension, Row, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, error, info};

type DbTask = Box<dyn FnOnce(&mut Connection) + Send + 'static>;

enum DbCommand {
    Execute(DbTask),
    Shutdown,
}

struct StoreInner {
    sender: Mutex<mpsc::Sender<DbCommand>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for StoreInner {
    fn drop(&mut self) {
        let mut guard = match self.worker.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if let Some(handle) = guard.take() {
            let sent = match self.sender.lock() {
                Ok(sender) => sender.send(DbCommand::Shutdown),
                Err(poisoned) => poisoned.into_inner().send(DbCommand::Shutdown),
            };
            if let Err(err) = sent {
                error!("Failed to send shutdown to store thread: {err}");
            }
            if let Err(join_err) = handle.join() {
                error!("Failed to join store thread: {join_err:?}");
            }
        }
    }
}

/// Row as read from SQLite, before validation
struct RawRow {
    date: String,
    lat_e6: i64,
    lon_e6: i64,
    model: String,
    source_url: Option<String>,
    recorded_at: String,
    probabilities: Vec<f64>,
}

/// Result store in an embedded SQLite file
#[derive(Clone)]
pub struct SqliteResultStore {
    inner: Arc<StoreInner>,
    path: Arc<PathBuf>,
    labels: LabelSet,
    policy: ConflictPolicy,
}

impl SqliteResultStore {
    /// Open (creating if needed) the store and make sure its schema exists
    pub fn open(config: &StoreConfig, labels: LabelSet) -> Result<Self, StoreError> {
        let path = config.path.clone();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Open(format!("failed to create directory {}: {}", parent.display(), e))
            })?;
        }

        let (command_tx, command_rx) = mpsc::channel::<DbCommand>();
        let (ready_tx, ready_rx) = mpsc::channel::<Result<(), StoreError>>();
        let path_for_thread = path.clone();
        let labels_for_thread = labels.clone();
        let busy_timeout = Duration::from_millis(config.busy_timeout_ms);

        let worker = thread::Builder::new()
            .name("forest-store".into())
            .spawn(move || {
                let mut conn = match open_connection(&path_for_thread, busy_timeout) {
                    Ok(conn) => conn,
                    Err(err) => {
                        let _ = ready_tx.send(Err(err));
                        return;
                    }
                };

                let init = ensure_schema(&mut conn, &labels_for_thread);
                let failed = init.is_err();
                if ready_tx.send(init).is_err() || failed {
                    return;
                }

                while let Ok(command) = command_rx.recv() {
                    match command {
                        DbCommand::Execute(task) => task(&mut conn),
                        DbCommand::Shutdown => break,
                    }
                }

                debug!("Store thread shutting down");
            })
            .map_err(|e| StoreError::Open(format!("failed to spawn store thread: {}", e)))?;

        let init = ready_rx.recv().map_err(|_| StoreError::WorkerGone);
        if let Err(err) | Ok(Err(err)) = init {
            let _ = worker.join();
            return Err(err);
        }

        info!(
            path = %path.display(),
            policy = ?config.conflict_policy,
            labels = labels.len(),
            "Result store ready"
        );

        Ok(Self {
            inner: Arc::new(StoreInner {
                sender: Mutex::new(command_tx),
                worker: Mutex::new(Some(worker)),
            }),
            path: Arc::new(path),
            labels,
            policy: config.conflict_policy,
        })
    }

    pub fn path(&self) -> &Path {
        self.path.as_path()
    }

    pub fn labels(&self) -> &LabelSet {
        &self.labels
    }

    /// Run `task` on the store thread
    async fn execute<F, T>(&self, task: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();

        let command = DbCommand::Execute(Box::new(move |conn| {
            let result = task(conn);
            if reply_tx.send(result).is_err() {
                debug!("Store caller dropped before receiving result");
            }
        }));

        self.inner
            .sender
            .lock()
            .map_err(|_| StoreError::WorkerGone)?
            .send(command)
            .map_err(|_| StoreError::WorkerGone)?;

        reply_rx.await.map_err(|_| StoreError::WorkerGone)?
    }

    /// Number of stored records
    pub async fn count(&self) -> Result<u64, StoreError> {
        self.execute(|conn| {
            let n: i64 = conn.query_row(
                &format!("SELECT COUNT(*) FROM {}", TABLE_NAME),
                [],
                |row| row.get(0),
            )?;
            Ok(n.max(0) as u64)
        })
        .await
    }

    fn select_sql(&self) -> String {
        let probability_columns: Vec<String> = self
            .labels
            .iter()
            .map(|l| format!("\"{}\"", probability_column(l)))
            .collect();
        format!(
            "SELECT date, lat_e6, lon_e6, model, source_url, recorded_at, {} FROM {}",
            probability_columns.join(", "),
            TABLE_NAME
        )
    }

    fn to_record(&self, raw: RawRow) -> Result<StoredRecord, StoreError> {
        let date = NaiveDate::parse_from_str(&raw.date, "%Y-%m-%d")
            .map_err(|e| StoreError::Corrupt(format!("bad date {:?}: {}", raw.date, e)))?;
        let coordinate = Coordinate::from_key(raw.lat_e6, raw.lon_e6)
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;
        let recorded_at = DateTime::parse_from_rfc3339(&raw.recorded_at)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| StoreError::Corrupt(format!("bad recorded_at {:?}: {}", raw.recorded_at, e)))?;
        let result = ClassificationResult::new(
            date,
            coordinate,
            self.labels.clone(),
            raw.probabilities,
            raw.model,
        )
        .map_err(|e| StoreError::Corrupt(e.to_string()))?;

        Ok(StoredRecord {
            result,
            source_url: raw.source_url,
            recorded_at,
        })
    }
}

fn open_connection(path: &Path, busy_timeout: Duration) -> Result<Connection, StoreError> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(busy_timeout)?;
    let mode: String =
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
    debug!(journal_mode = %mode, "Opened SQLite connection");
    Ok(conn)
}

fn read_raw(row: &Row<'_>, label_count: usize) -> rusqlite::Result<RawRow> {
    let probabilities = (0..label_count)
        .map(|i| row.get::<_, f64>(6 + i))
        .collect::<rusqlite::Result<Vec<f64>>>()?;
    Ok(RawRow {
        date: row.get(0)?,
        lat_e6: row.get(1)?,
        lon_e6: row.get(2)?,
        model: row.get(3)?,
        source_url: row.get(4)?,
        recorded_at: row.get(5)?,
        probabilities,
    })
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

#[async_trait]
impl ResultStore for SqliteResultStore {
    async fn save(&self, record: &StoredRecord) -> Result<SaveOutcome, StoreError> {
        if record.result.labels() != &self.labels {
            return Err(StoreError::SchemaMismatch(format!(
                "record labels {:?} differ from store labels {:?}",
                record.result.labels(),
                self.labels
            )));
        }

        let key = record.key();
        let columns: Vec<String> = self.labels.iter().map(probability_column).collect();
        let mut values: Vec<Value> = vec![
            Value::Text(key.date.format("%Y-%m-%d").to_string()),
            Value::Integer(key.lat_e6),
            Value::Integer(key.lon_e6),
            Value::Real(record.result.coordinate().latitude()),
            Value::Real(record.result.coordinate().longitude()),
        ];
        values.extend(record.result.probabilities().iter().map(|p| Value::Real(*p)));
        values.push(Value::Text(record.result.model().to_string()));
        values.push(match &record.source_url {
            Some(url) => Value::Text(url.clone()),
            None => Value::Null,
        });
        values.push(Value::Text(record.recorded_at.to_rfc3339()));

        let mut all_columns = vec![
            "date".to_string(),
            "lat_e6".to_string(),
            "lon_e6".to_string(),
            "latitude".to_string(),
            "longitude".to_string(),
        ];
        all_columns.extend(columns.iter().cloned());
        all_columns.extend(["model", "source_url", "recorded_at"].map(String::from));

        let quoted: Vec<String> = all_columns.iter().map(|c| format!("\"{}\"", c)).collect();
        let placeholders: Vec<String> = (1..=all_columns.len()).map(|i| format!("?{}", i)).collect();
        let insert = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            TABLE_NAME,
            quoted.join(", "),
            placeholders.join(", ")
        );
        let policy = self.policy;

        let outcome = self
            .execute(move |conn| match policy {
                ConflictPolicy::Reject => match conn.execute(&insert, params_from_iter(values.iter())) {
                    Ok(_) => Ok(SaveOutcome::Inserted),
                    Err(e) if is_constraint_violation(&e) => Err(StoreError::DuplicateKey { key }),
                    Err(e) => Err(e.into()),
                },
                ConflictPolicy::Replace => {
                    let updates: Vec<String> = quoted[3..]
                        .iter()
                        .map(|c| format!("{c} = excluded.{c}"))
                        .collect();
                    let upsert = format!(
                        "{} ON CONFLICT (date, lat_e6, lon_e6) DO UPDATE SET {}",
                        insert,
                        updates.join(", ")
                    );

                    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                    let existed: bool = tx.query_row(
                        &format!(
                            "SELECT EXISTS(SELECT 1 FROM {} WHERE date = ?1 AND lat_e6 = ?2 AND lon_e6 = ?3)",
                            TABLE_NAME
                        ),
                        rusqlite::params![key.date.format("%Y-%m-%d").to_string(), key.lat_e6, key.lon_e6],
                        |row| row.get(0),
                    )?;
                    tx.execute(&upsert, params_from_iter(values.iter()))?;
                    tx.commit()?;
                    Ok(if existed {
                        SaveOutcome::Replaced
                    } else {
                        SaveOutcome::Inserted
                    })
                }
            })
            .await?;

        debug!(key = %key, outcome = ?outcome, "Saved observation");
        Ok(outcome)
    }

    async fn read(
        &self,
        date: NaiveDate,
        coordinate: Coordinate,
    ) -> Result<Option<StoredRecord>, StoreError> {
        let key = ObservationKey::new(date, coordinate);
        let sql = format!(
            "{} WHERE date = ?1 AND lat_e6 = ?2 AND lon_e6 = ?3",
            self.select_sql()
        );
        let label_count = self.labels.len();

        let raw = self
            .execute(move |conn| {
                Ok(conn
                    .query_row(
                        &sql,
                        rusqlite::params![key.date.format("%Y-%m-%d").to_string(), key.lat_e6, key.lon_e6],
                        |row| read_raw(row, label_count),
                    )
                    .optional()?)
            })
            .await?;

        raw.map(|r| self.to_record(r)).transpose()
    }

    async fn history(
        &self,
        coordinate: Coordinate,
        from: Option<NaiveDate>,
        to: Option<NaiveDate>,
    ) -> Result<Vec<StoredRecord>, StoreError> {
        let (lat_e6, lon_e6) = coordinate.key();
        let sql = format!(
            "{} WHERE lat_e6 = ?1 AND lon_e6 = ?2 \
             AND (?3 IS NULL OR date >= ?3) AND (?4 IS NULL OR date <= ?4) \
             ORDER BY date",
            self.select_sql()
        );
        let from = from.map(|d| d.format("%Y-%m-%d").to_string());
        let to = to.map(|d| d.format("%Y-%m-%d").to_string());
        let label_count = self.labels.len();

        let rows = self
            .execute(move |conn| {
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map(rusqlite::params![lat_e6, lon_e6, from, to], |row| {
                        read_raw(row, label_count)
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await?;

        rows.into_iter().map(|r| self.to_record(r)).collect()
    }

    fn conflict_policy(&self) -> ConflictPolicy {
        self.policy
    }
}
