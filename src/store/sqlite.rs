//! SQLite-backed hit store.
//!
//! Hits are kept as JSON rows ordered by an autoincrement id, so a removing
//! fetch always takes the oldest rows and re-added hits go to the back.

use super::HitStore;
use crate::hit::Hit;
use anyhow::{anyhow, Result};
use log::{debug, warn};
use sqlite::{Connection, State};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

/// How long a statement waits on another connection's lock before failing
const BUSY_TIMEOUT_MS: usize = 5_000;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS pending_hits (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        hit_type TEXT NOT NULL,
        payload TEXT NOT NULL,
        recorded_at TEXT NOT NULL
    );
";

pub struct SqliteHitStore {
    path: PathBuf,
    connection: Mutex<Option<Connection>>,
}

impl SqliteHitStore {
    /// Create a store for the database at `path`. Nothing is touched on disk
    /// until [`HitStore::open`] is called.
    pub fn new(path: impl AsRef<Path>) -> Self {
        SqliteHitStore {
            path: path.as_ref().to_path_buf(),
            connection: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> Result<MutexGuard<'_, Option<Connection>>> {
        self.connection
            .lock()
            .map_err(|_| anyhow!("sqlite hit store lock poisoned"))
    }

    /// Run `f` against the open connection
    fn with_connection<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let guard = self.lock()?;
        let connection = guard
            .as_ref()
            .ok_or_else(|| anyhow!("hit store is closed"))?;
        f(connection)
    }
}

/// Run `f` inside a write transaction, rolling back on error
fn in_transaction<T>(connection: &Connection, f: impl FnOnce() -> Result<T>) -> Result<T> {
    connection.execute("BEGIN IMMEDIATE")?;
    match f() {
        Ok(value) => {
            connection.execute("COMMIT")?;
            Ok(value)
        }
        Err(e) => {
            if let Err(rollback) = connection.execute("ROLLBACK") {
                warn!("Failed to roll back hit store transaction: {rollback}");
            }
            Err(e)
        }
    }
}

fn insert_hit(connection: &Connection, hit: &Hit) -> Result<()> {
    let payload = serde_json::to_string(hit)?;
    let recorded_at = hit.timestamp.to_rfc3339();

    let mut statement = connection
        .prepare("INSERT INTO pending_hits (hit_type, payload, recorded_at) VALUES (?, ?, ?)")?;
    statement.bind((1, hit.kind.as_str()))?;
    statement.bind((2, payload.as_str()))?;
    statement.bind((3, recorded_at.as_str()))?;
    statement.next()?;
    Ok(())
}

impl HitStore for SqliteHitStore {
    fn open(&self) -> Result<()> {
        let mut guard = self.lock()?;
        if guard.is_some() {
            return Ok(());
        }

        let mut connection = sqlite::open(&self.path)?;
        connection.set_busy_timeout(BUSY_TIMEOUT_MS)?;
        connection.execute(SCHEMA)?;
        debug!("Opened hit store at {}", self.path.display());
        *guard = Some(connection);
        Ok(())
    }

    fn close(&self) {
        if let Ok(mut guard) = self.connection.lock() {
            if guard.take().is_some() {
                debug!("Closed hit store at {}", self.path.display());
            }
        }
    }

    fn is_open(&self) -> bool {
        self.connection
            .lock()
            .map(|guard| guard.is_some())
            .unwrap_or(false)
    }

    fn add_hit(&self, hit: &Hit) -> Result<()> {
        self.with_connection(|connection| insert_hit(connection, hit))
    }

    fn add_hits(&self, hits: Vec<Hit>) -> Result<()> {
        if hits.is_empty() {
            return Ok(());
        }
        self.with_connection(|connection| {
            in_transaction(connection, || {
                for hit in &hits {
                    insert_hit(connection, hit)?;
                }
                Ok(())
            })
        })
    }

    fn fetch_hits(&self, max_count: usize, remove: bool) -> Result<Vec<Hit>> {
        self.with_connection(|connection| {
            in_transaction(connection, || {
                let mut rows: Vec<(i64, String)> = Vec::new();
                {
                    let mut statement = connection
                        .prepare("SELECT id, payload FROM pending_hits ORDER BY id LIMIT ?")?;
                    statement.bind((1, max_count as i64))?;
                    while let State::Row = statement.next()? {
                        let id = statement.read::<i64, _>("id")?;
                        let payload = statement.read::<String, _>("payload")?;
                        rows.push((id, payload));
                    }
                }

                if remove {
                    if let Some(&(last_id, _)) = rows.last() {
                        let mut statement =
                            connection.prepare("DELETE FROM pending_hits WHERE id <= ?")?;
                        statement.bind((1, last_id))?;
                        statement.next()?;
                    }
                }

                let hits = rows
                    .into_iter()
                    .filter_map(|(id, payload)| match serde_json::from_str::<Hit>(&payload) {
                        Ok(hit) => Some(hit),
                        Err(e) => {
                            warn!("Dropping unreadable hit row {id}: {e}");
                            None
                        }
                    })
                    .collect();
                Ok(hits)
            })
        })
    }

    fn len(&self) -> Result<usize> {
        self.with_connection(|connection| {
            let mut statement = connection.prepare("SELECT COUNT(*) AS pending FROM pending_hits")?;
            match statement.next()? {
                State::Row => Ok(statement.read::<i64, _>("pending")? as usize),
                State::Done => Ok(0),
            }
        })
    }
}
