//! Key-value configuration repository.

use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::Result;

/// Key under which `ProxySettings` is stored.
pub const PROXY_SETTINGS_KEY: &str = "proxy_settings";

/// Repository for configuration operations.
pub struct ConfigRepo;

impl ConfigRepo {
    /// Get a raw configuration value.
    pub fn get(conn: &Connection, key: &str) -> Result<Option<Value>> {
        let raw: Option<String> = conn
            .query_row("SELECT value FROM config WHERE key = ?1", [key], |row| {
                row.get(0)
            })
            .optional()?;

        Ok(raw.map(|s| serde_json::from_str(&s).unwrap_or(Value::Null)))
    }

    /// Set a configuration value (insert or update).
    pub fn set<T: Serialize>(conn: &Connection, key: &str, value: &T) -> Result<()> {
        let value_json = serde_json::to_string(value)?;

        conn.execute(
            "INSERT INTO config (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = ?2",
            params![key, value_json],
        )?;

        Ok(())
    }

    /// Delete a configuration value.
    pub fn delete(conn: &Connection, key: &str) -> Result<bool> {
        let deleted = conn.execute("DELETE FROM config WHERE key = ?1", [key])?;
        Ok(deleted > 0)
    }

    /// Get a typed configuration value, falling back to `default` when the
    /// key is missing or no longer deserializes.
    pub fn get_or_default<T: DeserializeOwned>(
        conn: &Connection,
        key: &str,
        default: T,
    ) -> Result<T> {
        match Self::get(conn, key)? {
            Some(value) => Ok(serde_json::from_value(value).unwrap_or(default)),
            None => Ok(default),
        }
    }
}
