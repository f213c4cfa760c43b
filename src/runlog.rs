// SQLite-backed run log: per-epoch metric history across training runs,
// so separate invocations can be compared after the fact.

use anyhow::Result;
use rusqlite::{params, Connection};

/// Append-only metric store keyed by (run, epoch, key).
pub struct RunLog {
    conn: Connection,
}

impl RunLog {
    /// Open (or create) a run log at the given path.
    /// Use ":memory:" for in-memory testing.
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS metrics (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                run TEXT NOT NULL,
                epoch INTEGER NOT NULL,
                key TEXT NOT NULL,
                value REAL NOT NULL,
                logged_at TEXT NOT NULL DEFAULT (datetime('now'))
            );
            CREATE INDEX IF NOT EXISTS idx_metrics_run_key ON metrics(run, key);",
        )?;
        Ok(Self { conn })
    }

    /// Record one metric value for an epoch of a run.
    pub fn log(&self, run: &str, epoch: usize, key: &str, value: f64) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO metrics (run, epoch, key, value) VALUES (?1, ?2, ?3, ?4)",
            params![run, epoch as i64, key, value],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Full history of one metric for a run, in epoch order.
    pub fn history(&self, run: &str, key: &str) -> Result<Vec<(usize, f64)>> {
        let mut stmt = self.conn.prepare(
            "SELECT epoch, value FROM metrics WHERE run = ?1 AND key = ?2 ORDER BY epoch ASC, id ASC",
        )?;
        let rows = stmt
            .query_map(params![run, key], |row| {
                let epoch: i64 = row.get(0)?;
                let value: f64 = row.get(1)?;
                Ok((epoch as usize, value))
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    /// Names of every run with at least one metric, sorted.
    pub fn runs(&self) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT DISTINCT run FROM metrics ORDER BY run ASC")?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    /// Epoch and value of the minimum recorded value, if any.
    pub fn best(&self, run: &str, key: &str) -> Result<Option<(usize, f64)>> {
        let mut stmt = self.conn.prepare(
            "SELECT epoch, value FROM metrics WHERE run = ?1 AND key = ?2
             ORDER BY value ASC, id ASC LIMIT 1",
        )?;
        let mut rows = stmt.query_map(params![run, key], |row| {
            let epoch: i64 = row.get(0)?;
            let value: f64 = row.get(1)?;
            Ok((epoch as usize, value))
        })?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }
}
