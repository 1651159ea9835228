//! Mock rule repository.

use rusqlite::{params, Connection, OptionalExtension, Row};

use watchtower_core::ApiMock;

use crate::error::Result;

const COLUMNS: &str = "id, host, path, method, status_code, response_body, content_type, enabled";

/// Repository for mock operations. Rules are listed in creation order.
pub struct MockRepo;

impl MockRepo {
    /// Insert a mock. The caller assigns the id.
    pub fn insert(conn: &Connection, mock: &ApiMock) -> Result<()> {
        conn.execute(
            "INSERT INTO api_mocks (id, host, path, method, status_code, response_body, content_type, enabled)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                mock.id,
                mock.host,
                mock.path,
                mock.method,
                mock.status_code,
                mock.response_body,
                mock.content_type,
                mock.enabled as i32
            ],
        )?;
        Ok(())
    }

    /// Get a mock by ID.
    pub fn get_by_id(conn: &Connection, id: &str) -> Result<Option<ApiMock>> {
        let mock = conn
            .query_row(
                &format!("SELECT {} FROM api_mocks WHERE id = ?1", COLUMNS),
                [id],
                row_to_mock,
            )
            .optional()?;
        Ok(mock)
    }

    /// Get all mocks in creation order.
    pub fn get_all(conn: &Connection) -> Result<Vec<ApiMock>> {
        let mut stmt = conn.prepare(&format!("SELECT {} FROM api_mocks ORDER BY seq", COLUMNS))?;

        let mocks = stmt
            .query_map([], row_to_mock)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(mocks)
    }

    /// Replace a mock's fields in place, keeping its position.
    pub fn update(conn: &Connection, mock: &ApiMock) -> Result<bool> {
        let updated = conn.execute(
            "UPDATE api_mocks SET host = ?2, path = ?3, method = ?4, status_code = ?5,
                 response_body = ?6, content_type = ?7, enabled = ?8
             WHERE id = ?1",
            params![
                mock.id,
                mock.host,
                mock.path,
                mock.method,
                mock.status_code,
                mock.response_body,
                mock.content_type,
                mock.enabled as i32
            ],
        )?;
        Ok(updated > 0)
    }

    /// Delete a mock.
    pub fn delete(conn: &Connection, id: &str) -> Result<bool> {
        let deleted = conn.execute("DELETE FROM api_mocks WHERE id = ?1", [id])?;
        Ok(deleted > 0)
    }
}

fn row_to_mock(row: &Row<'_>) -> rusqlite::Result<ApiMock> {
    Ok(ApiMock {
        id: row.get(0)?,
        host: row.get(1)?,
        path: row.get(2)?,
        method: row.get(3)?,
        status_code: row.get(4)?,
        response_body: row.get(5)?,
        content_type: row.get(6)?,
        enabled: row.get::<_, i32>(7)? != 0,
    })
}
