//! SQLite storage layer -- schema, queries, migrations.

pub mod schema;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use r2d2::Pool as R2D2Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::types::Type;
use rusqlite::{params, OptionalExtension, Row};
use tracing::info;
use uuid::Uuid;

use crate::config::{StorageBackend, StorageConfig};
use crate::events::{AnomalyEvent, DetectionSummary, EventStore, MemoryEventStore, StreamKey};

/// Connection Pool type
pub type Pool = R2D2Pool<SqliteConnectionManager>;

/// Open (or create) the SQLite database and return a connection pool.
pub fn open_pool(path: &Path, max_size: u32) -> Result<Pool> {
    let manager = SqliteConnectionManager::file(path).with_init(|c| {
        c.execute_batch(
            "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA temp_store = MEMORY;
                 PRAGMA foreign_keys = ON;
                 PRAGMA busy_timeout = 5000;",
        )
    });

    let pool = R2D2Pool::builder()
        .max_size(max_size.max(1))
        .build(manager)
        .with_context(|| format!("failed to open database {}", path.display()))?;

    // Run migrations on a single connection
    let conn = pool.get()?;
    schema::migrate(&conn)?;

    Ok(pool)
}

/// Build the configured event store.
pub fn open_store(cfg: &StorageConfig) -> Result<Arc<dyn EventStore>> {
    match cfg.backend {
        StorageBackend::Memory => {
            info!("using in-memory event store");
            Ok(Arc::new(MemoryEventStore::new()))
        }
        StorageBackend::Sqlite => {
            if let Some(dir) = cfg.path.parent().filter(|d| !d.as_os_str().is_empty()) {
                std::fs::create_dir_all(dir)
                    .with_context(|| format!("failed to create {}", dir.display()))?;
            }
            info!(path = %cfg.path.display(), "opening SQLite event store");
            Ok(Arc::new(SqliteEventStore::new(open_pool(&cfg.path, cfg.pool_size)?)))
        }
    }
}

const EVENT_COLUMNS: &str = "id, resource_id, metric_name, start_us, end_us, peak_score, peak_us, \
     peak_value, average_score, point_count, contributing_method, priority, priority_score";

fn to_us(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_micros()
}

fn from_us(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let us: i64 = row.get(idx)?;
    DateTime::from_timestamp_micros(us).ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, us))
}

fn event_from_row(row: &Row<'_>) -> rusqlite::Result<AnomalyEvent> {
    let id: String = row.get(0)?;
    let priority: String = row.get(11)?;
    Ok(AnomalyEvent {
        id: Uuid::parse_str(&id)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(e)))?,
        resource_id: row.get(1)?,
        metric_name: row.get(2)?,
        start_time: from_us(row, 3)?,
        end_time: from_us(row, 4)?,
        peak_score: row.get(5)?,
        peak_time: from_us(row, 6)?,
        peak_value: row.get(7)?,
        average_score: row.get(8)?,
        point_count: row.get(9)?,
        contributing_method: row.get(10)?,
        priority: priority
            .parse()
            .map_err(|e: anyhow::Error| rusqlite::Error::FromSqlConversionFailure(11, Type::Text, e.into()))?,
        priority_score: row.get(12)?,
    })
}

/// Event store backed by SQLite. Timestamps keep microsecond precision.
#[derive(Clone)]
pub struct SqliteEventStore {
    pool: Pool,
}

impl SqliteEventStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }
}

impl EventStore for SqliteEventStore {
    fn latest(&self, key: &StreamKey) -> Result<Option<AnomalyEvent>> {
        let conn = self.pool.get()?;
        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM anomaly_events
             WHERE resource_id = ?1 AND metric_name = ?2
             ORDER BY end_us DESC LIMIT 1"
        );
        let event = conn
            .query_row(&sql, params![key.resource_id, key.metric_name], event_from_row)
            .optional()?;
        Ok(event)
    }

    fn covering(&self, key: &StreamKey, ts: DateTime<Utc>) -> Result<Option<AnomalyEvent>> {
        let conn = self.pool.get()?;
        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM anomaly_events
             WHERE resource_id = ?1 AND metric_name = ?2 AND start_us <= ?3 AND end_us >= ?3
             ORDER BY start_us LIMIT 1"
        );
        let event = conn
            .query_row(
                &sql,
                params![key.resource_id, key.metric_name, to_us(ts)],
                event_from_row,
            )
            .optional()?;
        Ok(event)
    }

    fn preceding(&self, key: &StreamKey, ts: DateTime<Utc>) -> Result<Option<AnomalyEvent>> {
        let conn = self.pool.get()?;
        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM anomaly_events
             WHERE resource_id = ?1 AND metric_name = ?2 AND end_us < ?3
             ORDER BY end_us DESC LIMIT 1"
        );
        let event = conn
            .query_row(
                &sql,
                params![key.resource_id, key.metric_name, to_us(ts)],
                event_from_row,
            )
            .optional()?;
        Ok(event)
    }

    fn upsert(&self, event: &AnomalyEvent) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO anomaly_events (id, resource_id, metric_name, start_us, end_us, peak_score,
                 peak_us, peak_value, average_score, point_count, contributing_method, priority, priority_score)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
             ON CONFLICT(id) DO UPDATE SET
                 end_us = excluded.end_us,
                 peak_score = excluded.peak_score,
                 peak_us = excluded.peak_us,
                 peak_value = excluded.peak_value,
                 average_score = excluded.average_score,
                 point_count = excluded.point_count,
                 priority = excluded.priority,
                 priority_score = excluded.priority_score,
                 updated_at = datetime('now')",
            params![
                event.id.to_string(),
                event.resource_id,
                event.metric_name,
                to_us(event.start_time),
                to_us(event.end_time),
                event.peak_score,
                to_us(event.peak_time),
                event.peak_value,
                event.average_score,
                event.point_count,
                event.contributing_method,
                event.priority.as_str(),
                event.priority_score,
            ],
        )
        .with_context(|| format!("failed to store event {}", event.id))?;
        Ok(())
    }

    fn prior_count(&self, key: &StreamKey, before: DateTime<Utc>) -> Result<usize> {
        let conn = self.pool.get()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM anomaly_events
             WHERE resource_id = ?1 AND metric_name = ?2 AND end_us < ?3",
            params![key.resource_id, key.metric_name, to_us(before)],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as usize)
    }

    fn recent(&self, key: Option<&StreamKey>, limit: usize) -> Result<Vec<AnomalyEvent>> {
        let conn = self.pool.get()?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let events = match key {
            Some(k) => {
                let sql = format!(
                    "SELECT {EVENT_COLUMNS} FROM anomaly_events
                     WHERE resource_id = ?1 AND metric_name = ?2
                     ORDER BY end_us DESC, id LIMIT ?3"
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map(params![k.resource_id, k.metric_name, limit], event_from_row)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            }
            None => {
                let sql = format!(
                    "SELECT {EVENT_COLUMNS} FROM anomaly_events ORDER BY end_us DESC, id LIMIT ?1"
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map([limit], event_from_row)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            }
        };
        Ok(events)
    }

    fn record_detection(&self, summary: &DetectionSummary) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO detection_history (resource_id, metric_name, method, sensitivity, total_points,
                 anomaly_count, event_count, detection_time_ms, detected_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                summary.resource_id,
                summary.metric_name,
                summary.method,
                summary.sensitivity.to_string(),
                summary.total_points,
                summary.anomaly_count,
                summary.event_count,
                summary.detection_time_ms,
                summary.detected_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn ping(&self) -> Result<()> {
        let conn = self.pool.get()?;
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::Sensitivity;
    use crate::events::testing::*;
    use crate::events::Priority;

    fn store() -> (tempfile::TempDir, SqliteEventStore) {
        let dir = tempfile::TempDir::new().unwrap();
        let pool = open_pool(&dir.path().join("events.db"), 2).unwrap();
        (dir, SqliteEventStore::new(pool))
    }

    fn event(pts: &[(i64, f64)]) -> AnomalyEvent {
        let mut ev = AnomalyEvent::open(&key(), "isolation-forest", &point(pts[0].0, pts[0].1));
        for &(m, s) in &pts[1..] {
            ev.extend(&point(m, s));
        }
        ev.priority = Priority::High;
        ev.priority_score = 0.65;
        ev
    }

    #[test]
    fn test_event_roundtrip() {
        let (_dir, store) = store();
        let ev = event(&[(0, 0.6), (2, 0.9)]);
        store.upsert(&ev).unwrap();
        let back = store.latest(&key()).unwrap().unwrap();
        assert_eq!(back, ev);
    }

    #[test]
    fn test_upsert_updates_in_place() {
        let (_dir, store) = store();
        let mut ev = event(&[(0, 0.6)]);
        store.upsert(&ev).unwrap();
        ev.extend(&point(3, 0.8));
        ev.priority = Priority::Critical;
        store.upsert(&ev).unwrap();

        let all = store.recent(None, 10).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].point_count, 2);
        assert_eq!(all[0].end_time, at(3));
        assert_eq!(all[0].priority, Priority::Critical);
    }

    #[test]
    fn test_range_queries() {
        let (_dir, store) = store();
        let a = event(&[(0, 0.6), (4, 0.7)]);
        let b = event(&[(30, 0.6)]);
        store.upsert(&a).unwrap();
        store.upsert(&b).unwrap();

        assert_eq!(store.latest(&key()).unwrap().unwrap().id, b.id);
        assert_eq!(store.covering(&key(), at(4)).unwrap().unwrap().id, a.id);
        assert!(store.covering(&key(), at(5)).unwrap().is_none());
        assert_eq!(store.preceding(&key(), at(20)).unwrap().unwrap().id, a.id);
        assert!(store.preceding(&key(), at(0)).unwrap().is_none());
        assert_eq!(store.prior_count(&key(), at(30)).unwrap(), 1);
        assert_eq!(store.recent(Some(&key()), 1).unwrap()[0].id, b.id);
        assert!(store.recent(Some(&StreamKey::new("other", "cpu")), 5).unwrap().is_empty());
    }

    #[test]
    fn test_record_detection() {
        let (_dir, store) = store();
        store
            .record_detection(&DetectionSummary {
                resource_id: "pod-web-001".into(),
                metric_name: "cpu".into(),
                method: "z-score".into(),
                sensitivity: Sensitivity::High,
                total_points: 10,
                anomaly_count: 1,
                event_count: 1,
                detection_time_ms: 3,
                detected_at: t0(),
            })
            .unwrap();
        let conn = store.pool().get().unwrap();
        let (method, sensitivity): (String, String) = conn
            .query_row("SELECT method, sensitivity FROM detection_history", [], |r| {
                Ok((r.get(0)?, r.get(1)?))
            })
            .unwrap();
        assert_eq!(method, "z-score");
        assert_eq!(sensitivity, "high");
        store.ping().unwrap();
    }

    #[test]
    fn test_survives_reopen() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("events.db");
        let ev = event(&[(0, 0.6)]);
        SqliteEventStore::new(open_pool(&path, 1).unwrap()).upsert(&ev).unwrap();
        let reopened = SqliteEventStore::new(open_pool(&path, 1).unwrap());
        assert_eq!(reopened.latest(&key()).unwrap().unwrap().id, ev.id);
    }
}
