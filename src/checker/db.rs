use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use serde::Serialize;

use super::models::*;
use crate::errors::CheckerError;

/// Async-safe handle to the checker database.
///
/// Wraps `CheckerDb` behind `Arc<Mutex>` and runs every access on tokio's
/// blocking pool via `spawn_blocking`, so SQLite I/O never stalls the
/// workers that are waiting on containers.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<CheckerDb>>,
}

impl DbHandle {
    pub fn new(db: CheckerDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with exclusive access to the database on a blocking thread.
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut CheckerDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = db.lock().map_err(|_| CheckerError::LockPoisoned)?;
            f(&mut guard)
        })
        .await
        .context("DB task panicked")?
    }

    /// Synchronous access for startup code and tests.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, CheckerDb>> {
        self.inner
            .lock()
            .map_err(|_| CheckerError::LockPoisoned.into())
    }
}

pub struct CheckerDb {
    conn: Connection,
}

impl CheckerDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        conn.busy_timeout(Duration::from_secs(5))
            .context("Failed to set busy timeout")?;
        let _mode: String = conn
            .query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))
            .context("Failed to enable WAL journal")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        let mut ddl = String::new();
        for kind in QueueKind::ALL {
            ddl.push_str(&format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    submitter_id INTEGER NOT NULL,
                    channel_id INTEGER NOT NULL,
                    data TEXT NOT NULL,
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );\n",
                kind.table()
            ));
        }
        ddl.push_str(
            "
            CREATE TABLE IF NOT EXISTS disciplines (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                full_name TEXT NOT NULL,
                short_name TEXT NOT NULL,
                path_to_test TEXT NOT NULL,
                path_to_answer TEXT NOT NULL,
                language TEXT NOT NULL DEFAULT 'python',
                max_tasks INTEGER NOT NULL,
                max_home_works INTEGER NOT NULL,
                works TEXT NOT NULL DEFAULT '[]'
            );

            CREATE TABLE IF NOT EXISTS homeworks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                student_id INTEGER NOT NULL,
                discipline_id INTEGER NOT NULL REFERENCES disciplines(id) ON DELETE CASCADE,
                points REAL NOT NULL DEFAULT 0,
                home_work TEXT NOT NULL,
                UNIQUE(student_id, discipline_id)
            );

            CREATE INDEX IF NOT EXISTS idx_homeworks_student ON homeworks(student_id);
            ",
        );
        self.conn
            .execute_batch(&ddl)
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Queues ────────────────────────────────────────────────────────

    pub fn push(
        &self,
        kind: QueueKind,
        submitter_id: i64,
        channel_id: i64,
        data: &str,
    ) -> Result<i64> {
        self.conn
            .execute(
                &format!(
                    "INSERT INTO {} (submitter_id, channel_id, data) VALUES (?1, ?2, ?3)",
                    kind.table()
                ),
                params![submitter_id, channel_id, data],
            )
            .with_context(|| format!("Failed to insert into {} queue", kind.as_str()))?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Serialize `payload` as JSON and append it to the queue.
    pub fn push_json<T: Serialize>(
        &self,
        kind: QueueKind,
        submitter_id: i64,
        channel_id: i64,
        payload: &T,
    ) -> Result<i64> {
        let data = serde_json::to_string(payload).context("Failed to serialize queue payload")?;
        self.push(kind, submitter_id, channel_id, &data)
    }

    pub fn count(&self, kind: QueueKind) -> Result<i64> {
        self.conn
            .query_row(&format!("SELECT COUNT(*) FROM {}", kind.table()), [], |row| {
                row.get(0)
            })
            .with_context(|| format!("Failed to count {} queue", kind.as_str()))
    }

    /// Read the oldest record and delete it in the same immediate transaction.
    /// A record returned here is never returned to any other caller.
    pub fn claim_oldest(&mut self, kind: QueueKind) -> Result<Option<QueueRecord>> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("Failed to begin claim transaction")?;
        let record = tx
            .query_row(
                &format!(
                    "SELECT id, submitter_id, channel_id, data FROM {} ORDER BY id LIMIT 1",
                    kind.table()
                ),
                [],
                |row| {
                    Ok(QueueRecord {
                        id: row.get(0)?,
                        submitter_id: row.get(1)?,
                        channel_id: row.get(2)?,
                        data: row.get(3)?,
                    })
                },
            )
            .optional()
            .with_context(|| format!("Failed to read {} queue head", kind.as_str()))?;
        if let Some(ref r) = record {
            tx.execute(
                &format!("DELETE FROM {} WHERE id = ?1", kind.table()),
                params![r.id],
            )
            .with_context(|| format!("Failed to delete claimed record {}", r.id))?;
        }
        tx.commit().context("Failed to commit claim")?;
        Ok(record)
    }

    /// List records without claiming them, oldest first.
    pub fn peek(&self, kind: QueueKind, limit: usize) -> Result<Vec<QueueRecord>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT id, submitter_id, channel_id, data FROM {} ORDER BY id LIMIT ?1",
                kind.table()
            ))
            .context("Failed to prepare peek")?;
        let rows = stmt
            .query_map(params![limit as i64], |row| {
                Ok(QueueRecord {
                    id: row.get(0)?,
                    submitter_id: row.get(1)?,
                    channel_id: row.get(2)?,
                    data: row.get(3)?,
                })
            })
            .context("Failed to query queue")?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row.context("Failed to read queue row")?);
        }
        Ok(records)
    }

    // ── Disciplines ───────────────────────────────────────────────────

    pub fn insert_discipline(&self, config: &DisciplineConfig) -> Result<Discipline> {
        let works = serde_json::to_string(&config.works).context("Failed to serialize works")?;
        self.conn
            .execute(
                "INSERT INTO disciplines (full_name, short_name, path_to_test, path_to_answer, language, max_tasks, max_home_works, works)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    config.full_name,
                    config.short_name,
                    config.path_to_test,
                    config.path_to_answer,
                    config.language,
                    config.max_tasks(),
                    config.max_home_works(),
                    works
                ],
            )
            .context("Failed to insert discipline")?;
        let id = self.conn.last_insert_rowid();
        self.get_discipline(id)?
            .context("Discipline not found after insert")
    }

    pub fn get_discipline(&self, id: i64) -> Result<Option<Discipline>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, full_name, short_name, path_to_test, path_to_answer, language, max_tasks, max_home_works, works
                 FROM disciplines WHERE id = ?1",
                params![id],
                |row| {
                    Ok((
                        Discipline {
                            id: row.get(0)?,
                            full_name: row.get(1)?,
                            short_name: row.get(2)?,
                            path_to_test: row.get(3)?,
                            path_to_answer: row.get(4)?,
                            language: row.get(5)?,
                            max_tasks: row.get(6)?,
                            max_home_works: row.get(7)?,
                            works: Vec::new(),
                        },
                        row.get::<_, String>(8)?,
                    ))
                },
            )
            .optional()
            .context("Failed to query discipline")?;
        match row {
            Some((mut discipline, works)) => {
                discipline.works =
                    serde_json::from_str(&works).map_err(|source| CheckerError::CorruptRecord {
                        what: format!("works JSON for discipline {}", id),
                        source,
                    })?;
                Ok(Some(discipline))
            }
            None => Ok(None),
        }
    }

    pub fn list_disciplines(&self) -> Result<Vec<Discipline>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id FROM disciplines ORDER BY id")
            .context("Failed to prepare list_disciplines")?;
        let ids = stmt
            .query_map([], |row| row.get::<_, i64>(0))
            .context("Failed to query disciplines")?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read discipline row")?;
        let mut disciplines = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(d) = self.get_discipline(id)? {
                disciplines.push(d);
            }
        }
        Ok(disciplines)
    }

    // ── Homework records ──────────────────────────────────────────────

    /// Create the homework record of a student from the discipline's works.
    pub fn enroll(&self, student_id: i64, discipline_id: i64) -> Result<HomeworkRecord> {
        let discipline = self
            .get_discipline(discipline_id)?
            .ok_or(CheckerError::DisciplineNotFound { id: discipline_id })?;
        let record = HomeworkRecord::new(student_id, &discipline);
        let labs = serde_json::to_string(&record.labs).context("Failed to serialize labs")?;
        self.conn
            .execute(
                "INSERT INTO homeworks (student_id, discipline_id, points, home_work) VALUES (?1, ?2, ?3, ?4)",
                params![student_id, discipline_id, record.points, labs],
            )
            .with_context(|| {
                format!(
                    "Failed to enroll student {} in discipline {}",
                    student_id, discipline_id
                )
            })?;
        Ok(record)
    }

    pub fn get_homework(
        &self,
        student_id: i64,
        discipline_id: i64,
    ) -> Result<Option<HomeworkRecord>> {
        read_homework(&self.conn, student_id, discipline_id)
    }

    pub fn list_homeworks(&self, student_id: i64) -> Result<Vec<HomeworkRecord>> {
        let mut stmt = self
            .conn
            .prepare("SELECT discipline_id FROM homeworks WHERE student_id = ?1 ORDER BY discipline_id")
            .context("Failed to prepare list_homeworks")?;
        let ids = stmt
            .query_map(params![student_id], |row| row.get::<_, i64>(0))
            .context("Failed to query homeworks")?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read homework row")?;
        let mut records = Vec::with_capacity(ids.len());
        for discipline_id in ids {
            if let Some(r) = read_homework(&self.conn, student_id, discipline_id)? {
                records.push(r);
            }
        }
        Ok(records)
    }

    /// Read-modify-write of one homework record inside an immediate
    /// transaction. Nothing is written if `f` fails.
    pub fn update_homework<F, R>(&mut self, student_id: i64, discipline_id: i64, f: F) -> Result<R>
    where
        F: FnOnce(&mut HomeworkRecord) -> Result<R>,
    {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("Failed to begin homework transaction")?;
        let mut record = read_homework(&tx, student_id, discipline_id)?.ok_or(
            CheckerError::HomeworkNotFound {
                student_id,
                discipline_id,
            },
        )?;
        let out = f(&mut record)?;
        let labs = serde_json::to_string(&record.labs).context("Failed to serialize labs")?;
        tx.execute(
            "UPDATE homeworks SET points = ?1, home_work = ?2 WHERE student_id = ?3 AND discipline_id = ?4",
            params![record.points, labs, student_id, discipline_id],
        )
        .context("Failed to update homework record")?;
        tx.commit().context("Failed to commit homework update")?;
        Ok(out)
    }
}

fn read_homework(
    conn: &Connection,
    student_id: i64,
    discipline_id: i64,
) -> Result<Option<HomeworkRecord>> {
    let row = conn
        .query_row(
            "SELECT points, home_work FROM homeworks WHERE student_id = ?1 AND discipline_id = ?2",
            params![student_id, discipline_id],
            |row| Ok((row.get::<_, f64>(0)?, row.get::<_, String>(1)?)),
        )
        .optional()
        .context("Failed to query homework")?;
    match row {
        Some((points, labs)) => Ok(Some(HomeworkRecord {
            student_id,
            discipline_id,
            points,
            labs: serde_json::from_str(&labs).map_err(|source| CheckerError::CorruptRecord {
                what: format!(
                    "homework JSON for student {} in discipline {}",
                    student_id, discipline_id
                ),
                source,
            })?,
        })),
        None => Ok(None),
    }
}
