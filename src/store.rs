//! Durable key-value storage for the PeerConnect collections.
//!
//! Every collection lives as one JSON document under a fixed key and is read
//! and rewritten whole. Writers inside one process are serialised by
//! [`Store::update`]; processes sharing one database file are not coordinated,
//! so the last writer wins there.

use std::{str::FromStr, sync::Arc};

use serde::{de::DeserializeOwned, Serialize};
use sqlx::{sqlite::{SqliteConnectOptions, SqlitePoolOptions}, SqlitePool};
use tokio::sync::Mutex;

use crate::{PeerError, PeerResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Key {
    Users,
    Connections,
    Conversations,
    Projects,
    Theme,
}

impl Key {
    pub fn as_str(&self) -> &'static str {
        use Key::*;
        match self {
            Users => "peerconnect-users",
            Connections => "peerconnect-connections",
            Conversations => "peerconnect-conversations",
            Projects => "peerconnect-projects",
            Theme => "peerconnect-theme",
        }
    }
}

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
    write_lock: Arc<Mutex<()>>,
}

impl Store {
    pub async fn connect(url: &str) -> PeerResult<Store> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(16)
            .connect_with(options)
            .await?;

        Store::with_pool(pool).await
    }

    /// A private database that lives as long as the store does.
    pub async fn open_in_memory() -> PeerResult<Store> {
        // one connection, never recycled: each sqlite memory connection is its own database
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(SqliteConnectOptions::from_str("sqlite::memory:")?)
            .await?;

        Store::with_pool(pool).await
    }

    async fn with_pool(pool: SqlitePool) -> PeerResult<Store> {
        sqlx::query("CREATE TABLE IF NOT EXISTS kv (key TEXT PRIMARY KEY NOT NULL, value TEXT NOT NULL)")
            .execute(&pool)
            .await?;

        Ok(Store {
            pool,
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    /// Missing or malformed data yields `default`; only database failures are errors.
    pub async fn get_or<T: DeserializeOwned>(&self, key: Key, default: T) -> PeerResult<T> {
        let Some(raw) = self.get_raw(key).await? else {
            return Ok(default);
        };

        match serde_json::from_str(&raw) {
            Ok(value) => Ok(value),
            Err(source) => {
                let err = PeerError::StoreCorrupt { key: key.as_str(), source };
                tracing::error!(%err, "using default value instead");
                Ok(default)
            }
        }
    }

    pub async fn load<T: DeserializeOwned + Default>(&self, key: Key) -> PeerResult<T> {
        self.get_or(key, T::default()).await
    }

    pub async fn set<T: Serialize + ?Sized>(&self, key: Key, value: &T) -> PeerResult<()> {
        let _guard = self.write_lock.lock().await;
        self.write(key, value).await
    }

    pub async fn remove(&self, key: Key) -> PeerResult<()> {
        let _guard = self.write_lock.lock().await;
        sqlx::query("DELETE FROM kv WHERE key=?")
            .bind(key.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Locked read-modify-write of a whole collection. Nothing is written if `f` fails.
    pub async fn update<T, R, F>(&self, key: Key, f: F) -> PeerResult<R>
    where
        T: Serialize + DeserializeOwned + Default,
        F: FnOnce(&mut T) -> PeerResult<R>,
    {
        let _guard = self.write_lock.lock().await;
        let mut value: T = self.load(key).await?;
        let out = f(&mut value)?;
        self.write(key, &value).await?;
        Ok(out)
    }

    async fn get_raw(&self, key: Key) -> PeerResult<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT value FROM kv WHERE key=?")
            .bind(key.as_str())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|(value,)| value))
    }

    async fn write<T: Serialize + ?Sized>(&self, key: Key, value: &T) -> PeerResult<()> {
        let json = serde_json::to_string(value)?;
        self.write_raw(key, &json).await
    }

    pub(crate) async fn write_raw(&self, key: Key, raw: &str) -> PeerResult<()> {
        sqlx::query("INSERT INTO kv (key,value) VALUES (?,?) ON CONFLICT(key) DO UPDATE SET value=excluded.value")
            .bind(key.as_str())
            .bind(raw)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) async fn test_store() -> Store {
    Store::open_in_memory().await.expect("in-memory store")
}
