//! SQLite database implementation for persistent storage

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use tracing::{debug, error, info};

use crate::core::{
    ConfigStore, LifecycleObserver, OperationResult, ServiceConfig, ServiceId, Settings, Verb,
};

/// One row of the lifecycle history log
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HistoryEntry {
    pub service_id: ServiceId,
    pub event_type: String,
    pub event_time: DateTime<Utc>,
    pub details: Option<String>,
}

/// Database wrapper for SQLite operations
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open (or create) the database at `path`
    pub fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .context(format!("Failed to create data directory {:?}", parent))?;
        }

        let conn = Connection::open(path)
            .context(format!("Failed to open database at {:?}", path))?;

        // Enable WAL mode for better concurrency
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;

        info!("Database opened at {:?}", path);
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open the database in the default data directory
    pub fn open_default() -> Result<Self> {
        Self::open(&Settings::default().get_database_path())
    }

    /// Private in-memory database, used by tests and dry runs
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Database lock poisoned: {}", e))
    }

    /// Initialize database schema
    pub fn initialize(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            r#"
            -- Settings table
            CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );

            -- User-adjusted service configuration
            CREATE TABLE IF NOT EXISTS service_configs (
                service_id TEXT PRIMARY KEY,
                config TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            -- Lifecycle history
            CREATE TABLE IF NOT EXISTS service_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                service_id TEXT NOT NULL,
                event_type TEXT NOT NULL,
                event_time TEXT NOT NULL,
                details TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_service_history_service
                ON service_history (service_id, event_time);
            "#,
        )?;

        info!("Database schema initialized");
        Ok(())
    }

    // === Settings ===

    /// Load settings from database
    pub fn load_settings(&self) -> Result<Option<Settings>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT value FROM settings WHERE key = 'app_settings'")?;
        let result: Option<String> = stmt.query_row([], |row| row.get(0)).optional()?;

        match result {
            Some(json) => {
                let mut settings: Settings =
                    serde_json::from_str(&json).context("Failed to deserialize settings")?;
                // Validate and fix any invalid values after deserialization
                settings.validate();
                Ok(Some(settings))
            }
            None => Ok(None),
        }
    }

    /// Save settings to database
    pub fn save_settings(&self, settings: &Settings) -> Result<()> {
        let conn = self.conn()?;
        let json = serde_json::to_string(settings)?;
        conn.execute(
            "INSERT OR REPLACE INTO settings (key, value) VALUES ('app_settings', ?1)",
            params![json],
        )?;
        debug!("Settings saved");
        Ok(())
    }

    // === History ===

    /// Record a lifecycle event
    pub fn record_history(
        &self,
        service_id: &ServiceId,
        event_type: &str,
        details: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO service_history (service_id, event_type, event_time, details)
            VALUES (?1, ?2, ?3, ?4)
            "#,
            params![
                service_id.as_str(),
                event_type,
                Utc::now().to_rfc3339(),
                details,
            ],
        )?;
        Ok(())
    }

    /// Most recent events for a service, newest first
    pub fn load_history(&self, service_id: &ServiceId, limit: usize) -> Result<Vec<HistoryEntry>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT event_type, event_time, details FROM service_history WHERE service_id = ?1 ORDER BY id DESC LIMIT ?2",
        )?;

        let rows = stmt.query_map(params![service_id.as_str(), limit as i64], |row| {
            let event_type: String = row.get(0)?;
            let event_time: String = row.get(1)?;
            let details: Option<String> = row.get(2)?;
            Ok((event_type, event_time, details))
        })?;

        let mut result = Vec::new();
        for row in rows {
            let (event_type, event_time, details) = row?;
            let event_time = DateTime::parse_from_rfc3339(&event_time)
                .map(|t| t.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now());
            result.push(HistoryEntry {
                service_id: service_id.clone(),
                event_type,
                event_time,
                details,
            });
        }

        Ok(result)
    }

    /// Clean up old history entries
    pub fn prune_history(&self, retention_days: u32) -> Result<usize> {
        if retention_days == 0 {
            return Ok(0); // Keep forever
        }

        let conn = self.conn()?;
        let cutoff = Utc::now()
            - chrono::TimeDelta::try_days(retention_days as i64)
                .unwrap_or_else(|| chrono::TimeDelta::days(30));
        let count = conn.execute(
            "DELETE FROM service_history WHERE event_time < ?1",
            params![cutoff.to_rfc3339()],
        )?;

        debug!("Cleaned up {} old history entries", count);
        Ok(count)
    }
}

impl ConfigStore for Database {
    fn load_config(&self, service_id: &ServiceId) -> Result<Option<ServiceConfig>> {
        let conn = self.conn()?;
        let json: Option<String> = conn
            .query_row(
                "SELECT config FROM service_configs WHERE service_id = ?1",
                params![service_id.as_str()],
                |row| row.get(0),
            )
            .optional()?;

        json.map(|json| {
            serde_json::from_str(&json)
                .context(format!("Failed to deserialize config of {}", service_id))
        })
        .transpose()
    }

    fn save_config(&self, service_id: &ServiceId, config: &ServiceConfig) -> Result<()> {
        let conn = self.conn()?;
        let json = serde_json::to_string(config)?;
        conn.execute(
            "INSERT OR REPLACE INTO service_configs (service_id, config, updated_at) VALUES (?1, ?2, ?3)",
            params![service_id.as_str(), json, Utc::now().to_rfc3339()],
        )?;
        debug!("Config of {} saved", service_id);
        Ok(())
    }

    fn delete_config(&self, service_id: &ServiceId) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "DELETE FROM service_configs WHERE service_id = ?1",
            params![service_id.as_str()],
        )?;
        debug!("Config of {} deleted", service_id);
        Ok(())
    }
}

/// Writes completed operations to the history log
impl LifecycleObserver for Database {
    fn on_operation_complete(&self, service_id: &ServiceId, verb: Verb, result: &OperationResult) {
        let event_type = if result.success {
            verb.as_str().to_string()
        } else {
            format!("{} failed", verb)
        };
        let details = result.error.as_deref().or(result.message.as_deref());
        if let Err(e) = self.record_history(service_id, &event_type, details) {
            error!("Failed to record history for {}: {}", service_id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn db() -> Database {
        let db = Database::open_in_memory().unwrap();
        db.initialize().unwrap();
        db
    }

    #[test]
    fn test_settings_roundtrip_validates() {
        let db = db();
        assert!(db.load_settings().unwrap().is_none());

        let settings = Settings {
            status_poll_secs: 0,
            ..Default::default()
        };
        db.save_settings(&settings).unwrap();
        let loaded = db.load_settings().unwrap().unwrap();
        assert_eq!(loaded.status_poll_secs, 1);
    }

    #[test]
    fn test_config_store() {
        let db = db();
        let redis = ServiceId::from("redis");
        assert!(db.load_config(&redis).unwrap().is_none());

        let config = ServiceConfig::default()
            .with_port(16379, 6379)
            .with_env("REDIS_ARGS", "--appendonly yes");
        db.save_config(&redis, &config).unwrap();
        assert_eq!(db.load_config(&redis).unwrap(), Some(config));

        db.delete_config(&redis).unwrap();
        assert!(db.load_config(&redis).unwrap().is_none());
    }

    #[test]
    fn test_history_newest_first() {
        let db = db();
        let redis = ServiceId::from("redis");
        db.on_operation_complete(&redis, Verb::Install, &OperationResult::ok(None));
        db.on_operation_complete(
            &redis,
            Verb::Stop,
            &OperationResult {
                success: false,
                error: Some("No such container".into()),
                kind: None,
                message: None,
            },
        );
        db.record_history(&ServiceId::from("mysql"), "install", None).unwrap();

        let history = db.load_history(&redis, 10).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].event_type, "stop failed");
        assert_eq!(history[0].details.as_deref(), Some("No such container"));
        assert_eq!(history[1].event_type, "install");

        assert_eq!(db.load_history(&redis, 1).unwrap().len(), 1);
    }

    #[test]
    fn test_prune_keeps_recent() {
        let db = db();
        let redis = ServiceId::from("redis");
        db.record_history(&redis, "install", None).unwrap();
        assert_eq!(db.prune_history(30).unwrap(), 0);
        assert_eq!(db.prune_history(0).unwrap(), 0);
        assert_eq!(db.load_history(&redis, 10).unwrap().len(), 1);
    }
}
