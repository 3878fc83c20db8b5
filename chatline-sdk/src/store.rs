//! SQLite persistence for reset timers and OAuth credentials.
//!
//! Both tables are tiny: one row per reset-timer key, one row per
//! credential name. Timestamps are stored as Unix milliseconds.

use std::path::Path;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params};

use crate::error::Result;
use crate::reset_timer::ResetTimerRepository;
use crate::token::{CredentialRepository, TokenPair};

pub struct Store {
    db: Mutex<Connection>,
}

impl Store {
    /// Open or create the database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        let db = Connection::open(path)?;
        Self::init(db)
    }

    /// Open an in-memory database (for testing).
    pub fn open_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(db: Connection) -> Result<Self> {
        db.execute_batch(
            "PRAGMA journal_mode = WAL;
            CREATE TABLE IF NOT EXISTS reset_timers (
                key TEXT PRIMARY KEY,
                reset_at INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS credentials (
                name TEXT PRIMARY KEY,
                access_token TEXT NOT NULL,
                refresh_token TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            );",
        )?;
        Ok(Self { db: Mutex::new(db) })
    }
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

impl ResetTimerRepository for Store {
    fn load_reset(&self, key: &str) -> Result<Option<DateTime<Utc>>> {
        let db = self.db.lock();
        let ms: Option<i64> = db
            .query_row(
                "SELECT reset_at FROM reset_timers WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(ms.map(from_millis))
    }

    fn save_reset(&self, key: &str, at: DateTime<Utc>) -> Result<()> {
        let db = self.db.lock();
        db.execute(
            "INSERT INTO reset_timers (key, reset_at) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET reset_at = excluded.reset_at",
            params![key, at.timestamp_millis()],
        )?;
        Ok(())
    }
}

impl CredentialRepository for Store {
    fn load_tokens(&self, name: &str) -> Result<Option<TokenPair>> {
        let db = self.db.lock();
        let pair = db
            .query_row(
                "SELECT access_token, refresh_token FROM credentials WHERE name = ?1",
                params![name],
                |row| {
                    Ok(TokenPair {
                        access_token: row.get(0)?,
                        refresh_token: row.get(1)?,
                    })
                },
            )
            .optional()?;
        Ok(pair)
    }

    fn save_tokens(&self, name: &str, tokens: &TokenPair) -> Result<()> {
        let db = self.db.lock();
        db.execute(
            "INSERT INTO credentials (name, access_token, refresh_token, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(name) DO UPDATE SET
                access_token = excluded.access_token,
                refresh_token = excluded.refresh_token,
                updated_at = excluded.updated_at",
            params![
                name,
                tokens.access_token,
                tokens.refresh_token,
                Utc::now().timestamp_millis()
            ],
        )?;
        Ok(())
    }
}
