//! SQL-backed store. Records live in a single table with indexed
//! namespace/id/version columns and the full record as a JSON payload;
//! compare-and-set updates run as `UPDATE ... WHERE version = ?`.
//!
//! Change notification fans out from the writing client, which assumes the
//! deployment funnels writes through one manager process per store file.

use std::sync::Once;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use sqlx::{any::AnyPoolOptions, migrate::MigrateError, AnyPool, Row};
use tokio::sync::{broadcast, mpsc};

use crate::error::StoreError;
use crate::record::{LabelSelector, SandboxRecord};
use crate::{patched_record, spawn_watch_forwarder, SandboxStore, WatchEvent, WatchEventKind};

const EVENT_BUS_CAPACITY: usize = 1024;

/// Attempts for read-modify-write patches racing other local writers.
const PATCH_RETRIES: usize = 5;

/// Supported backends for the SQL store.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SqlDriver {
    Sqlite,
    Postgres,
}

#[derive(Clone)]
pub struct SqliteStore {
    pool: AnyPool,
    driver: SqlDriver,
    events: broadcast::Sender<WatchEvent>,
}

impl SqliteStore {
    /// Establishes (or creates) a connection pool for the given database URL
    /// and runs the embedded migrations.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        static DRIVERS: Once = Once::new();
        DRIVERS.call_once(|| {
            sqlx::any::install_default_drivers();
        });

        let driver = if database_url.starts_with("postgres://")
            || database_url.starts_with("postgresql://")
        {
            SqlDriver::Postgres
        } else {
            SqlDriver::Sqlite
        };

        let max_connections = match driver {
            SqlDriver::Sqlite if database_url.contains(":memory:") => 1,
            _ => 8,
        };

        let pool = AnyPoolOptions::new()
            .min_connections(1)
            .max_connections(max_connections)
            .connect(database_url)
            .await?;

        let migration_result = match driver {
            SqlDriver::Sqlite => sqlx::migrate!("./migrations").run(&pool).await,
            SqlDriver::Postgres => sqlx::migrate!("./migrations_postgres").run(&pool).await,
        };
        if let Err(err) = migration_result {
            match &err {
                MigrateError::Execute(sqlx::Error::Database(db_err))
                    if db_err.message().contains("_sqlx_migrations")
                        && db_err
                            .code()
                            .map(|code| matches!(code.as_ref(), "2067" | "1555" | "23505"))
                            .unwrap_or(false) => {}
                _ => return Err(err.into()),
            }
        }

        let (events, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Ok(Self {
            pool,
            driver,
            events,
        })
    }

    pub fn driver(&self) -> SqlDriver {
        self.driver
    }

    fn emit(&self, kind: WatchEventKind, record: SandboxRecord) {
        let _ = self.events.send(WatchEvent { kind, record });
    }

    async fn fetch(
        &self,
        namespace: &str,
        id: &str,
    ) -> Result<Option<SandboxRecord>, StoreError> {
        let select = match self.driver {
            SqlDriver::Sqlite => {
                "SELECT payload FROM sandbox_records WHERE namespace = ? AND id = ?"
            }
            SqlDriver::Postgres => {
                "SELECT payload FROM sandbox_records WHERE namespace = $1 AND id = $2"
            }
        };
        let row = sqlx::query(select)
            .bind(namespace)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| {
            let payload: String = row.get("payload");
            serde_json::from_str(&payload).map_err(StoreError::from)
        })
        .transpose()
    }

    /// Writes `record` in place of the revision carrying `expected_version`.
    /// Returns false when the row moved on (or vanished) underneath us.
    async fn cas_write(
        &self,
        record: &SandboxRecord,
        expected_version: u64,
    ) -> Result<bool, StoreError> {
        let update = match self.driver {
            SqlDriver::Sqlite => {
                "UPDATE sandbox_records SET payload = ?, version = ? \
                 WHERE namespace = ? AND id = ? AND version = ?"
            }
            SqlDriver::Postgres => {
                "UPDATE sandbox_records SET payload = $1, version = $2 \
                 WHERE namespace = $3 AND id = $4 AND version = $5"
            }
        };
        let payload = serde_json::to_string(record)?;
        let result = sqlx::query(update)
            .bind(payload)
            .bind(record.version as i64)
            .bind(&record.namespace)
            .bind(&record.id)
            .bind(expected_version as i64)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn conflict_for(
        &self,
        namespace: &str,
        id: &str,
        expected: u64,
    ) -> Result<StoreError, StoreError> {
        match self.fetch(namespace, id).await? {
            Some(current) => Ok(StoreError::Conflict {
                id: id.to_string(),
                expected,
                found: current.version,
            }),
            None => Ok(StoreError::not_found(namespace, id)),
        }
    }
}

#[async_trait]
impl SandboxStore for SqliteStore {
    async fn create(&self, mut record: SandboxRecord) -> Result<SandboxRecord, StoreError> {
        record.version = 1;
        record.deletion_timestamp = None;
        let insert = match self.driver {
            SqlDriver::Sqlite => {
                "INSERT INTO sandbox_records (namespace, id, version, payload) VALUES (?, ?, ?, ?)"
            }
            SqlDriver::Postgres => {
                "INSERT INTO sandbox_records (namespace, id, version, payload) \
                 VALUES ($1, $2, $3, $4)"
            }
        };
        let payload = serde_json::to_string(&record)?;
        let result = sqlx::query(insert)
            .bind(&record.namespace)
            .bind(&record.id)
            .bind(record.version as i64)
            .bind(payload)
            .execute(&self.pool)
            .await;
        match result {
            Ok(_) => {
                self.emit(WatchEventKind::Added, record.clone());
                Ok(record)
            }
            Err(sqlx::Error::Database(db_err))
                if db_err
                    .code()
                    .map(|code| matches!(code.as_ref(), "2067" | "1555" | "23505"))
                    .unwrap_or(false) =>
            {
                Err(StoreError::already_exists(&record.namespace, &record.id))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn update(&self, record: SandboxRecord) -> Result<SandboxRecord, StoreError> {
        let current = self
            .fetch(&record.namespace, &record.id)
            .await?
            .ok_or_else(|| StoreError::not_found(&record.namespace, &record.id))?;
        if current.version != record.version {
            return Err(StoreError::Conflict {
                id: record.id.clone(),
                expected: record.version,
                found: current.version,
            });
        }
        let expected = record.version;
        let mut updated = record;
        updated.status = current.status;
        updated.version = expected + 1;
        if !self.cas_write(&updated, expected).await? {
            return Err(self
                .conflict_for(&updated.namespace, &updated.id, expected)
                .await?);
        }
        self.emit(WatchEventKind::Modified, updated.clone());
        Ok(updated)
    }

    async fn update_status(&self, record: SandboxRecord) -> Result<SandboxRecord, StoreError> {
        let current = self
            .fetch(&record.namespace, &record.id)
            .await?
            .ok_or_else(|| StoreError::not_found(&record.namespace, &record.id))?;
        if current.version != record.version {
            return Err(StoreError::Conflict {
                id: record.id.clone(),
                expected: record.version,
                found: current.version,
            });
        }
        let expected = record.version;
        let mut updated = current;
        updated.status = record.status;
        updated.version = expected + 1;
        if !self.cas_write(&updated, expected).await? {
            return Err(self
                .conflict_for(&updated.namespace, &updated.id, expected)
                .await?);
        }
        self.emit(WatchEventKind::Modified, updated.clone());
        Ok(updated)
    }

    async fn patch(
        &self,
        namespace: &str,
        id: &str,
        patch: Value,
    ) -> Result<SandboxRecord, StoreError> {
        let mut last_seen = 0;
        for _ in 0..PATCH_RETRIES {
            let current = self
                .fetch(namespace, id)
                .await?
                .ok_or_else(|| StoreError::not_found(namespace, id))?;
            last_seen = current.version;
            let patched = patched_record(&current, &patch)?;
            if self.cas_write(&patched, current.version).await? {
                self.emit(WatchEventKind::Modified, patched.clone());
                return Ok(patched);
            }
        }
        Err(self.conflict_for(namespace, id, last_seen).await?)
    }

    async fn delete(&self, namespace: &str, id: &str) -> Result<(), StoreError> {
        let mut current = self
            .fetch(namespace, id)
            .await?
            .ok_or_else(|| StoreError::not_found(namespace, id))?;
        current.deletion_timestamp = Some(Utc::now());
        let expected = current.version;
        current.version += 1;
        // Best effort: the record is removed regardless of the marker write.
        let _ = self.cas_write(&current, expected).await?;

        let delete = match self.driver {
            SqlDriver::Sqlite => "DELETE FROM sandbox_records WHERE namespace = ? AND id = ?",
            SqlDriver::Postgres => {
                "DELETE FROM sandbox_records WHERE namespace = $1 AND id = $2"
            }
        };
        sqlx::query(delete)
            .bind(namespace)
            .bind(id)
            .execute(&self.pool)
            .await?;

        self.emit(WatchEventKind::Modified, current.clone());
        self.emit(WatchEventKind::Deleted, current);
        Ok(())
    }

    async fn get(&self, namespace: &str, id: &str) -> Result<SandboxRecord, StoreError> {
        self.fetch(namespace, id)
            .await?
            .ok_or_else(|| StoreError::not_found(namespace, id))
    }

    async fn list(
        &self,
        namespace: &str,
        selector: &LabelSelector,
    ) -> Result<Vec<SandboxRecord>, StoreError> {
        let select = match self.driver {
            SqlDriver::Sqlite => {
                "SELECT payload FROM sandbox_records WHERE namespace = ? ORDER BY id"
            }
            SqlDriver::Postgres => {
                "SELECT payload FROM sandbox_records WHERE namespace = $1 ORDER BY id"
            }
        };
        let rows = sqlx::query(select)
            .bind(namespace)
            .fetch_all(&self.pool)
            .await?;
        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let payload: String = row.get("payload");
            let record: SandboxRecord = serde_json::from_str(&payload)?;
            if selector.matches(&record.labels) {
                records.push(record);
            }
        }
        Ok(records)
    }

    async fn watch(&self, namespace: &str) -> Result<mpsc::Receiver<WatchEvent>, StoreError> {
        Ok(spawn_watch_forwarder(
            self.events.subscribe(),
            namespace.to_string(),
        ))
    }
}
