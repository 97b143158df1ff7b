//! Database schema and migrations.

use anyhow::Result;
use rusqlite::Connection;

pub const SCHEMA_VERSION: i64 = 1;

/// Run all pending migrations.
///
/// Instants are stored as integer microseconds since the Unix epoch so range
/// queries compare numerically.
pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS anomaly_events (
            id TEXT PRIMARY KEY,
            resource_id TEXT NOT NULL,
            metric_name TEXT NOT NULL,
            start_us INTEGER NOT NULL,
            end_us INTEGER NOT NULL,
            peak_score REAL NOT NULL,
            peak_us INTEGER NOT NULL,
            peak_value REAL NOT NULL,
            average_score REAL NOT NULL,
            point_count INTEGER NOT NULL,
            contributing_method TEXT NOT NULL,
            priority TEXT NOT NULL,
            priority_score REAL NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS detection_history (
            id INTEGER PRIMARY KEY,
            resource_id TEXT NOT NULL,
            metric_name TEXT NOT NULL,
            method TEXT NOT NULL,
            sensitivity TEXT NOT NULL,
            total_points INTEGER NOT NULL,
            anomaly_count INTEGER NOT NULL,
            event_count INTEGER NOT NULL,
            detection_time_ms INTEGER NOT NULL,
            detected_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_events_stream_end ON anomaly_events(resource_id, metric_name, end_us);
        CREATE INDEX IF NOT EXISTS idx_events_end ON anomaly_events(end_us);
        CREATE INDEX IF NOT EXISTS idx_history_detected ON detection_history(detected_at);",
    )?;

    conn.execute(
        "INSERT OR IGNORE INTO schema_version (version) VALUES (?1)",
        [SCHEMA_VERSION],
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrate_creates_tables() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM anomaly_events", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM detection_history", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_migrate_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        migrate(&conn).unwrap();

        let version: i64 = conn
            .query_row("SELECT MAX(version) FROM schema_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }
}
