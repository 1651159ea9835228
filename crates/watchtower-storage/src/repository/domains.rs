//! Domain registry repository.

use rusqlite::{params, Connection, OptionalExtension};

use watchtower_core::Domain;

use crate::error::Result;

/// Repository for domain operations.
pub struct DomainRepo;

impl DomainRepo {
    /// Insert a new domain, returning it with its assigned id.
    pub fn insert(conn: &Connection, url: &str) -> Result<Domain> {
        conn.execute("INSERT INTO domains (url) VALUES (?1)", [url])?;

        Ok(Domain {
            id: conn.last_insert_rowid(),
            url: url.to_string(),
        })
    }

    /// Get a domain by ID.
    pub fn get_by_id(conn: &Connection, id: i64) -> Result<Option<Domain>> {
        let domain = conn
            .query_row("SELECT id, url FROM domains WHERE id = ?1", [id], |row| {
                Ok(Domain {
                    id: row.get(0)?,
                    url: row.get(1)?,
                })
            })
            .optional()?;

        Ok(domain)
    }

    /// Get all domains in registration order.
    pub fn get_all(conn: &Connection) -> Result<Vec<Domain>> {
        let mut stmt = conn.prepare("SELECT id, url FROM domains ORDER BY id")?;

        let domains = stmt
            .query_map([], |row| {
                Ok(Domain {
                    id: row.get(0)?,
                    url: row.get(1)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(domains)
    }

    /// Change a domain's URL.
    pub fn update_url(conn: &Connection, id: i64, url: &str) -> Result<bool> {
        let updated = conn.execute(
            "UPDATE domains SET url = ?2 WHERE id = ?1",
            params![id, url],
        )?;
        Ok(updated > 0)
    }

    /// Delete a domain. Dependent links, schemas and test cases cascade.
    pub fn delete(conn: &Connection, id: i64) -> Result<bool> {
        let deleted = conn.execute("DELETE FROM domains WHERE id = ?1", [id])?;
        Ok(deleted > 0)
    }
}
