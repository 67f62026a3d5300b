use crate::error::{CoreError, Result};
use crate::schema::{Alarm, AlarmTime, AnalysisData};
use rusqlite::types::Type;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::warn;

mod embedded {
    use refinery::embed_migrations;
    embed_migrations!("migrations");
}

/// Record store handle shared between the alarm loop, the recorder and the HTTP handlers.
pub type SharedDatabase = Arc<Mutex<Database>>;

pub struct Database {
    conn: Connection,
}

const ALARM_COLUMNS: &str = "id, time, label, is_active, days";
const SESSION_COLUMNS: &str = "date, sleep_score, summary, events, stages, duration";

impl Database {
    /// Open a database at the given path, apply PRAGMAs and run migrations.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        let mut db = Self { conn };
        db.apply_pragmas()?;
        db.run_migrations()?;
        Ok(db)
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let mut db = Self { conn };
        db.apply_pragmas()?;
        db.run_migrations()?;
        Ok(db)
    }

    /// Close the underlying connection, surfacing any error from SQLite.
    pub fn close(self) -> Result<()> {
        self.conn.close().map_err(|(_, e)| CoreError::Database(e))
    }

    pub fn into_shared(self) -> SharedDatabase {
        Arc::new(Mutex::new(self))
    }

    #[cfg(test)]
    pub(crate) fn connection(&self) -> &Connection {
        &self.conn
    }

    fn apply_pragmas(&self) -> Result<()> {
        self.conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA busy_timeout = 5000;",
        )?;
        Ok(())
    }

    fn run_migrations(&mut self) -> Result<()> {
        embedded::migrations::runner()
            .run(&mut self.conn)
            .map_err(|e| CoreError::Migration(e.to_string()))?;
        Ok(())
    }

    // -- Alarms --

    /// All alarms, ordered by time of day ascending.
    pub fn get_all_alarms(&self) -> Result<Vec<Alarm>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {ALARM_COLUMNS} FROM alarms ORDER BY time ASC, id ASC"
        ))?;
        let rows = stmt.query_map([], alarm_from_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>().map_err(Into::into)
    }

    pub fn get_alarm(&self, id: &str) -> Result<Option<Alarm>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {ALARM_COLUMNS} FROM alarms WHERE id = ?1"))?;
        Ok(stmt.query_row(params![id], alarm_from_row).optional()?)
    }

    /// Insert or replace an alarm by id.
    pub fn put_alarm(&self, alarm: &Alarm) -> Result<()> {
        let days = serde_json::to_string(&alarm.days)?;
        self.conn.execute(
            "INSERT OR REPLACE INTO alarms (id, time, label, is_active, days)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                alarm.id,
                alarm.time.to_string(),
                alarm.label,
                alarm.is_active,
                days
            ],
        )?;
        Ok(())
    }

    /// Insert an alarm; fails with [`CoreError::Duplicate`] if the id exists.
    pub fn add_alarm(&self, alarm: &Alarm) -> Result<()> {
        let days = serde_json::to_string(&alarm.days)?;
        self.conn
            .execute(
                "INSERT INTO alarms (id, time, label, is_active, days)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    alarm.id,
                    alarm.time.to_string(),
                    alarm.label,
                    alarm.is_active,
                    days
                ],
            )
            .map_err(|e| duplicate_or(e, &alarm.id))?;
        Ok(())
    }

    /// Delete an alarm. Returns whether a row was removed.
    pub fn delete_alarm(&self, id: &str) -> Result<bool> {
        let count = self
            .conn
            .execute("DELETE FROM alarms WHERE id = ?1", params![id])?;
        Ok(count > 0)
    }

    // -- Sleep sessions --

    /// All sessions, newest first.
    pub fn get_all_sessions(&self) -> Result<Vec<AnalysisData>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {SESSION_COLUMNS} FROM sleep_sessions ORDER BY date DESC"
        ))?;
        let rows = stmt.query_map([], session_from_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>().map_err(Into::into)
    }

    pub fn get_session(&self, date: &str) -> Result<Option<AnalysisData>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {SESSION_COLUMNS} FROM sleep_sessions WHERE date = ?1"
        ))?;
        Ok(stmt.query_row(params![date], session_from_row).optional()?)
    }

    /// Insert or replace a session by completion date.
    pub fn put_session(&self, session: &AnalysisData) -> Result<()> {
        let events = serde_json::to_string(&session.events)?;
        let stages = serde_json::to_string(&session.stages)?;
        self.conn.execute(
            "INSERT OR REPLACE INTO sleep_sessions (date, sleep_score, summary, events, stages, duration)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                session.date,
                session.sleep_score,
                session.summary,
                events,
                stages,
                session.duration
            ],
        )?;
        Ok(())
    }

    /// Insert a session; fails with [`CoreError::Duplicate`] if the date exists.
    pub fn add_session(&self, session: &AnalysisData) -> Result<()> {
        let events = serde_json::to_string(&session.events)?;
        let stages = serde_json::to_string(&session.stages)?;
        self.conn
            .execute(
                "INSERT INTO sleep_sessions (date, sleep_score, summary, events, stages, duration)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    session.date,
                    session.sleep_score,
                    session.summary,
                    events,
                    stages,
                    session.duration
                ],
            )
            .map_err(|e| duplicate_or(e, &session.date))?;
        Ok(())
    }

    pub fn delete_session(&self, date: &str) -> Result<bool> {
        let count = self
            .conn
            .execute("DELETE FROM sleep_sessions WHERE date = ?1", params![date])?;
        Ok(count > 0)
    }
}

fn duplicate_or(err: rusqlite::Error, key: &str) -> CoreError {
    match err {
        rusqlite::Error::SqliteFailure(ref e, _) if e.code == ErrorCode::ConstraintViolation => {
            CoreError::Duplicate(key.to_string())
        }
        other => CoreError::Database(other),
    }
}

fn json_column<T: serde::de::DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn alarm_from_row(row: &Row<'_>) -> rusqlite::Result<Alarm> {
    let time: String = row.get(1)?;
    let time: AlarmTime = time
        .parse()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(1, Type::Text, Box::new(e)))?;
    Ok(Alarm {
        id: row.get(0)?,
        time,
        label: row.get(2)?,
        is_active: row.get(3)?,
        days: json_column(row, 4)?,
    })
}

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<AnalysisData> {
    Ok(AnalysisData {
        date: row.get(0)?,
        sleep_score: row.get(1)?,
        summary: row.get(2)?,
        events: json_column(row, 3)?,
        stages: json_column(row, 4)?,
        duration: row.get(5)?,
    })
}

/// Lock the shared store, recovering from a poisoned mutex.
pub fn lock_db(db: &Mutex<Database>) -> MutexGuard<'_, Database> {
    db.lock().unwrap_or_else(|e| {
        warn!("database mutex was poisoned, recovering");
        e.into_inner()
    })
}

/// Run a store operation on the blocking pool.
pub async fn with_db<T, F>(db: &SharedDatabase, f: F) -> Result<T>
where
    F: FnOnce(&Database) -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    let db = db.clone();
    tokio::task::spawn_blocking(move || {
        let guard = lock_db(&db);
        f(&guard)
    })
    .await
    .map_err(|e| CoreError::Task(format!("database task panicked: {e}")))?
}
