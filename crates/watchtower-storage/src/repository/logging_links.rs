//! Per-domain capture settings.

use rusqlite::{params, Connection, OptionalExtension, Row};

use watchtower_core::DomainApiLoggingLink;

use crate::error::Result;

/// Repository for domain logging links.
pub struct LoggingLinkRepo;

impl LoggingLinkRepo {
    /// Insert or replace the link for a domain.
    pub fn upsert(conn: &Connection, link: &DomainApiLoggingLink) -> Result<()> {
        conn.execute(
            "INSERT INTO api_logging_links (domain_id, logging_enabled, body_enabled, schema_url)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(domain_id) DO UPDATE SET
                 logging_enabled = ?2, body_enabled = ?3, schema_url = ?4",
            params![
                link.domain_id,
                link.logging_enabled as i32,
                link.body_enabled as i32,
                link.schema_url
            ],
        )?;
        Ok(())
    }

    /// Get the link for a domain.
    pub fn get(conn: &Connection, domain_id: i64) -> Result<Option<DomainApiLoggingLink>> {
        let link = conn
            .query_row(
                "SELECT domain_id, logging_enabled, body_enabled, schema_url
                 FROM api_logging_links WHERE domain_id = ?1",
                [domain_id],
                row_to_link,
            )
            .optional()?;
        Ok(link)
    }

    /// Get all links.
    pub fn get_all(conn: &Connection) -> Result<Vec<DomainApiLoggingLink>> {
        let mut stmt = conn.prepare(
            "SELECT domain_id, logging_enabled, body_enabled, schema_url
             FROM api_logging_links ORDER BY domain_id",
        )?;

        let links = stmt
            .query_map([], row_to_link)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(links)
    }

    /// Delete the link for a domain.
    pub fn delete(conn: &Connection, domain_id: i64) -> Result<bool> {
        let deleted = conn.execute(
            "DELETE FROM api_logging_links WHERE domain_id = ?1",
            [domain_id],
        )?;
        Ok(deleted > 0)
    }
}

fn row_to_link(row: &Row<'_>) -> rusqlite::Result<DomainApiLoggingLink> {
    Ok(DomainApiLoggingLink {
        domain_id: row.get(0)?,
        logging_enabled: row.get::<_, i32>(1)? != 0,
        body_enabled: row.get::<_, i32>(2)? != 0,
        schema_url: row.get(3)?,
    })
}
