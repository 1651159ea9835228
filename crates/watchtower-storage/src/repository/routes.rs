//! Local route repository.
//!
//! Rows are always read in id order; that order is what decides which route
//! wins when two enabled routes name the same host.

use rusqlite::{params, Connection, OptionalExtension, Row};

use watchtower_core::{LocalRoute, LocalRouteUpdate, NewLocalRoute};

use crate::error::Result;

const COLUMNS: &str = "id, domain, target_host, target_port, enabled";

/// Repository for local route operations.
pub struct RouteRepo;

impl RouteRepo {
    /// Insert a new, enabled route.
    pub fn insert(conn: &Connection, route: &NewLocalRoute) -> Result<LocalRoute> {
        conn.execute(
            "INSERT INTO local_routes (domain, target_host, target_port, enabled)
             VALUES (?1, ?2, ?3, 1)",
            params![
                route.domain.trim(),
                route.target_host.trim(),
                route.target_port
            ],
        )?;

        Ok(LocalRoute {
            id: conn.last_insert_rowid(),
            domain: route.domain.trim().to_string(),
            target_host: route.target_host.trim().to_string(),
            target_port: route.target_port,
            enabled: true,
        })
    }

    /// Get a route by ID.
    pub fn get_by_id(conn: &Connection, id: i64) -> Result<Option<LocalRoute>> {
        let route = conn
            .query_row(
                &format!("SELECT {} FROM local_routes WHERE id = ?1", COLUMNS),
                [id],
                row_to_route,
            )
            .optional()?;

        Ok(route)
    }

    /// Get all routes in insertion order.
    pub fn get_all(conn: &Connection) -> Result<Vec<LocalRoute>> {
        let mut stmt = conn.prepare(&format!("SELECT {} FROM local_routes ORDER BY id", COLUMNS))?;

        let routes = stmt
            .query_map([], row_to_route)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(routes)
    }

    /// Apply a partial update. Returns `None` when the id is unknown.
    pub fn update(conn: &Connection, update: &LocalRouteUpdate) -> Result<Option<LocalRoute>> {
        let Some(mut route) = Self::get_by_id(conn, update.id)? else {
            return Ok(None);
        };

        if let Some(domain) = &update.domain {
            route.domain = domain.trim().to_string();
        }
        if let Some(host) = &update.target_host {
            route.target_host = host.trim().to_string();
        }
        if let Some(port) = update.target_port {
            route.target_port = port;
        }
        if let Some(enabled) = update.enabled {
            route.enabled = enabled;
        }

        conn.execute(
            "UPDATE local_routes SET domain = ?2, target_host = ?3, target_port = ?4, enabled = ?5
             WHERE id = ?1",
            params![
                route.id,
                route.domain,
                route.target_host,
                route.target_port,
                route.enabled as i32
            ],
        )?;

        Ok(Some(route))
    }

    /// Delete a route, returning what was removed.
    pub fn delete(conn: &Connection, id: i64) -> Result<Option<LocalRoute>> {
        let existing = Self::get_by_id(conn, id)?;
        if existing.is_some() {
            conn.execute("DELETE FROM local_routes WHERE id = ?1", [id])?;
        }
        Ok(existing)
    }
}

fn row_to_route(row: &Row<'_>) -> rusqlite::Result<LocalRoute> {
    Ok(LocalRoute {
        id: row.get(0)?,
        domain: row.get(1)?,
        target_host: row.get(2)?,
        target_port: row.get(3)?,
        enabled: row.get::<_, i32>(4)? != 0,
    })
}
