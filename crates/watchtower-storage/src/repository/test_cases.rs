//! Saved regression requests.

use std::collections::HashMap;

use rusqlite::{params, Connection, OptionalExtension, Row};

use watchtower_core::ApiTestCase;

use crate::error::Result;

const COLUMNS: &str = "id, domain_id, name, method, url, headers, body, expected_status";

/// Repository for API test cases.
pub struct TestCaseRepo;

impl TestCaseRepo {
    /// Insert a test case. The caller assigns the id.
    pub fn insert(conn: &Connection, case: &ApiTestCase) -> Result<()> {
        let headers = serde_json::to_string(&case.headers)?;
        conn.execute(
            "INSERT INTO api_test_cases (id, domain_id, name, method, url, headers, body, expected_status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                case.id,
                case.domain_id,
                case.name,
                case.method,
                case.url,
                headers,
                case.body,
                case.expected_status
            ],
        )?;
        Ok(())
    }

    /// Get a test case by ID.
    pub fn get_by_id(conn: &Connection, id: &str) -> Result<Option<ApiTestCase>> {
        let case = conn
            .query_row(
                &format!("SELECT {} FROM api_test_cases WHERE id = ?1", COLUMNS),
                [id],
                row_to_case,
            )
            .optional()?;
        Ok(case)
    }

    /// All test cases in creation order.
    pub fn get_all(conn: &Connection) -> Result<Vec<ApiTestCase>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM api_test_cases ORDER BY seq",
            COLUMNS
        ))?;

        let cases = stmt
            .query_map([], row_to_case)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(cases)
    }

    /// Test cases for one domain in creation order.
    pub fn get_for_domain(conn: &Connection, domain_id: i64) -> Result<Vec<ApiTestCase>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM api_test_cases WHERE domain_id = ?1 ORDER BY seq",
            COLUMNS
        ))?;

        let cases = stmt
            .query_map([domain_id], row_to_case)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(cases)
    }

    /// Delete a test case.
    pub fn delete(conn: &Connection, id: &str) -> Result<bool> {
        let deleted = conn.execute("DELETE FROM api_test_cases WHERE id = ?1", [id])?;
        Ok(deleted > 0)
    }
}

fn row_to_case(row: &Row<'_>) -> rusqlite::Result<ApiTestCase> {
    let headers: String = row.get(5)?;
    Ok(ApiTestCase {
        id: row.get(0)?,
        domain_id: row.get(1)?,
        name: row.get(2)?,
        method: row.get(3)?,
        url: row.get(4)?,
        headers: serde_json::from_str::<HashMap<String, String>>(&headers).unwrap_or_default(),
        body: row.get(6)?,
        expected_status: row.get(7)?,
    })
}
