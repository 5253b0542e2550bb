//! Persistence layer - SQLite storage for settings, service configuration and history

mod database;

pub use database::{Database, HistoryEntry};
