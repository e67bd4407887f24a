use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use fleet_common::NodeStatus;

use super::{Benchmark, BenchmarkRepository, MetricsStore, NodeStatusStore, StoreError};
use crate::gateway::metrics::MetricsIncrement;

/// SQLite-backed store for benchmarks, node status and node metrics.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn new(database_url: &str) -> Result<Self, StoreError> {
        let path = database_url.strip_prefix("sqlite:").unwrap_or(database_url);

        if path != ":memory:" {
            if let Some(parent) = Path::new(path).parent() {
                std::fs::create_dir_all(parent).map_err(|e| StoreError::Io(e.to_string()))?;
            }
        }

        let conn = Connection::open(path)?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS benchmarks (
                node_id TEXT NOT NULL,
                model TEXT NOT NULL,
                tokens_per_second REAL NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (node_id, model)
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS node_status (
                node_id TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                backend_host TEXT,
                connected_at TEXT,
                disconnected_at TEXT
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS node_metrics (
                node_id TEXT PRIMARY KEY,
                requests_served INTEGER NOT NULL DEFAULT 0,
                requests_successful INTEGER NOT NULL DEFAULT 0,
                requests_failed INTEGER NOT NULL DEFAULT 0,
                time_to_first_token REAL,
                inference_tokens_per_second REAL,
                rtt REAL,
                uptime INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_node_status_backend_host ON node_status(backend_host)",
            [],
        )?;

        tracing::info!("Node store initialized with database: {}", path);

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    /// Insert or replace the benchmark for a (node, model) pair.
    pub fn upsert_benchmark(&self, benchmark: &Benchmark) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO benchmarks (node_id, model, tokens_per_second, created_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(node_id, model) DO UPDATE SET
                tokens_per_second = excluded.tokens_per_second,
                created_at = excluded.created_at",
            params![
                benchmark.node_id,
                benchmark.model,
                benchmark.tokens_per_second,
                benchmark.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn metrics(&self, node_id: &str) -> Result<Option<super::NodeMetrics>, StoreError> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                "SELECT requests_served, requests_successful, requests_failed,
                        time_to_first_token, inference_tokens_per_second, rtt, uptime
                 FROM node_metrics WHERE node_id = ?1",
                params![node_id],
                |row| {
                    Ok(super::NodeMetrics {
                        requests_served: row.get::<_, i64>(0)? as u64,
                        requests_successful: row.get::<_, i64>(1)? as u64,
                        requests_failed: row.get::<_, i64>(2)? as u64,
                        time_to_first_token: row.get(3)?,
                        inference_tokens_per_second: row.get(4)?,
                        rtt: row.get(5)?,
                        uptime: row.get::<_, i64>(6)? as u64,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }
}

fn parse_timestamp(node_id: &str, raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt {
            node_id: node_id.to_string(),
            detail: e.to_string(),
        })
}

#[async_trait]
impl BenchmarkRepository for SqliteStore {
    async fn get(&self, node_id: &str, model: &str) -> Result<Option<Benchmark>, StoreError> {
        let row: Option<(f64, String)> = {
            let conn = self.lock()?;
            conn.query_row(
                "SELECT tokens_per_second, created_at FROM benchmarks
                 WHERE node_id = ?1 AND model = ?2",
                params![node_id, model],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?
        };

        match row {
            Some((tokens_per_second, created_at)) => Ok(Some(Benchmark {
                node_id: node_id.to_string(),
                model: model.to_string(),
                tokens_per_second,
                created_at: parse_timestamp(node_id, &created_at)?,
            })),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl NodeStatusStore for SqliteStore {
    async fn get_status(&self, node_id: &str) -> Result<Option<NodeStatus>, StoreError> {
        let raw: Option<String> = {
            let conn = self.lock()?;
            conn.query_row(
                "SELECT status FROM node_status WHERE node_id = ?1",
                params![node_id],
                |row| row.get(0),
            )
            .optional()?
        };

        raw.map(|s| {
            s.parse::<NodeStatus>().map_err(|detail| StoreError::Corrupt {
                node_id: node_id.to_string(),
                detail,
            })
        })
        .transpose()
    }

    async fn set_status(&self, node_id: &str, status: NodeStatus) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO node_status (node_id, status) VALUES (?1, ?2)
             ON CONFLICT(node_id) DO UPDATE SET status = excluded.status",
            params![node_id, status.as_str()],
        )?;
        tracing::debug!("Node {} status persisted as {}", node_id, status);
        Ok(())
    }

    async fn set_connection_timestamp(
        &self,
        node_id: &str,
        host: &str,
        status: NodeStatus,
    ) -> Result<(), StoreError> {
        let conn = self.lock()?;
        let now = Utc::now().to_rfc3339();
        if status.is_running() {
            conn.execute(
                "INSERT INTO node_status (node_id, status, backend_host, connected_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(node_id) DO UPDATE SET
                    status = excluded.status,
                    backend_host = excluded.backend_host,
                    connected_at = excluded.connected_at",
                params![node_id, status.as_str(), host, now],
            )?;
        } else {
            // Another replica may already own a reconnected node.
            conn.execute(
                "INSERT INTO node_status (node_id, status, disconnected_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(node_id) DO UPDATE SET
                    status = excluded.status,
                    disconnected_at = CASE WHEN backend_host = ?4
                        THEN excluded.disconnected_at ELSE disconnected_at END,
                    backend_host = CASE WHEN backend_host = ?4
                        THEN NULL ELSE backend_host END",
                params![node_id, status.as_str(), now, host],
            )?;
        }
        Ok(())
    }

    async fn nodes_connected_to_host(&self, host: &str) -> Result<Vec<String>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT node_id FROM node_status WHERE backend_host = ?1 ORDER BY node_id",
        )?;
        let ids = stmt
            .query_map(params![host], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    }
}

#[async_trait]
impl MetricsStore for SqliteStore {
    async fn increment(&self, increment: &MetricsIncrement) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO node_metrics (node_id, requests_served, requests_successful,
                requests_failed, time_to_first_token, inference_tokens_per_second, rtt,
                uptime, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(node_id) DO UPDATE SET
                requests_served = requests_served + excluded.requests_served,
                requests_successful = requests_successful + excluded.requests_successful,
                requests_failed = requests_failed + excluded.requests_failed,
                time_to_first_token = COALESCE(excluded.time_to_first_token, time_to_first_token),
                inference_tokens_per_second =
                    COALESCE(excluded.inference_tokens_per_second, inference_tokens_per_second),
                rtt = COALESCE(excluded.rtt, rtt),
                uptime = uptime + excluded.uptime,
                updated_at = excluded.updated_at",
            params![
                increment.node_id,
                increment.requests_served as i64,
                increment.requests_successful as i64,
                increment.requests_failed as i64,
                increment.time_to_first_token,
                increment.inference_tokens_per_second,
                increment.rtt,
                increment.uptime as i64,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open() -> (TempDir, SqliteStore) {
        let dir = TempDir::new().unwrap();
        let url = format!("sqlite:{}", dir.path().join("nested/broker.db").display());
        let store = SqliteStore::new(&url).unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn test_benchmark_upsert_and_get() {
        let (_dir, store) = open();
        assert!(store.get("user-1", "llama3").await.unwrap().is_none());

        let mut benchmark = Benchmark {
            node_id: "user-1".to_string(),
            model: "llama3".to_string(),
            tokens_per_second: 12.5,
            created_at: Utc::now(),
        };
        store.upsert_benchmark(&benchmark).unwrap();
        benchmark.tokens_per_second = 30.0;
        store.upsert_benchmark(&benchmark).unwrap();

        let found = store.get("user-1", "llama3").await.unwrap().unwrap();
        assert_eq!(found.tokens_per_second, 30.0);
    }

    #[tokio::test]
    async fn test_status_round_trip() {
        let (_dir, store) = open();
        assert!(store.get_status("user-1").await.unwrap().is_none());
        store
            .set_status("user-1", NodeStatus::RunningDegraded)
            .await
            .unwrap();
        assert_eq!(
            store.get_status("user-1").await.unwrap(),
            Some(NodeStatus::RunningDegraded)
        );
    }

    #[tokio::test]
    async fn test_connected_nodes_follow_connection_timestamps() {
        let (_dir, store) = open();
        store
            .set_connection_timestamp("a", "replica-1", NodeStatus::Running)
            .await
            .unwrap();
        store
            .set_connection_timestamp("b", "replica-1", NodeStatus::RunningBenchmarking)
            .await
            .unwrap();
        store
            .set_connection_timestamp("c", "replica-2", NodeStatus::Running)
            .await
            .unwrap();

        assert_eq!(
            store.nodes_connected_to_host("replica-1").await.unwrap(),
            vec!["a".to_string(), "b".to_string()]
        );

        store
            .set_connection_timestamp("a", "replica-1", NodeStatus::Stopped)
            .await
            .unwrap();
        assert_eq!(
            store.nodes_connected_to_host("replica-1").await.unwrap(),
            vec!["b".to_string()]
        );
        assert_eq!(
            store.get_status("a").await.unwrap(),
            Some(NodeStatus::Stopped)
        );

        // A stale disconnect from replica-1 does not steal c from replica-2.
        store
            .set_connection_timestamp("c", "replica-1", NodeStatus::Stopped)
            .await
            .unwrap();
        assert_eq!(
            store.nodes_connected_to_host("replica-2").await.unwrap(),
            vec!["c".to_string()]
        );
    }

    #[tokio::test]
    async fn test_metrics_increment_is_additive() {
        let (_dir, store) = open();

        let mut first = MetricsIncrement::new("user-1");
        first.requests_served = 2;
        first.requests_successful = 2;
        first.time_to_first_token = Some(0.4);
        first.rtt = Some(12.0);
        store.increment(&first).await.unwrap();

        let mut second = MetricsIncrement::new("user-1");
        second.requests_served = 1;
        second.requests_failed = 1;
        second.uptime = 5;
        store.increment(&second).await.unwrap();

        let metrics = store.metrics("user-1").unwrap().unwrap();
        assert_eq!(metrics.requests_served, 3);
        assert_eq!(metrics.requests_successful, 2);
        assert_eq!(metrics.requests_failed, 1);
        assert_eq!(metrics.uptime, 5);
        assert_eq!(metrics.time_to_first_token, Some(0.4));
        assert_eq!(metrics.rtt, Some(12.0));
    }

    #[tokio::test]
    async fn test_corrupt_status_is_reported() {
        let (_dir, store) = open();
        {
            let conn = store.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO node_status (node_id, status) VALUES ('x', 'EXPLODED')",
                [],
            )
            .unwrap();
        }
        let err = store.get_status("x").await.unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { .. }));
    }
}
