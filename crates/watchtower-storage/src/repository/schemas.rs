//! Schema version repository. Versions are append-only.

use rusqlite::{params, Connection, OptionalExtension, Row};

use watchtower_core::{ApiSchema, SchemaSource};

use crate::error::Result;

const COLUMNS: &str = "id, domain_id, version, spec, source, fetched_at";

/// Repository for stored API schema versions.
pub struct SchemaRepo;

impl SchemaRepo {
    /// Append a version.
    pub fn insert(conn: &Connection, schema: &ApiSchema) -> Result<()> {
        conn.execute(
            "INSERT INTO api_schemas (id, domain_id, version, spec, source, fetched_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                schema.id,
                schema.domain_id,
                schema.version,
                schema.spec,
                schema.source.as_str(),
                schema.fetched_at
            ],
        )?;
        Ok(())
    }

    /// Get a version by ID.
    pub fn get_by_id(conn: &Connection, id: &str) -> Result<Option<ApiSchema>> {
        let schema = conn
            .query_row(
                &format!("SELECT {} FROM api_schemas WHERE id = ?1", COLUMNS),
                [id],
                row_to_schema,
            )
            .optional()?;
        Ok(schema)
    }

    /// All versions for a domain, oldest first.
    pub fn get_for_domain(conn: &Connection, domain_id: i64) -> Result<Vec<ApiSchema>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM api_schemas WHERE domain_id = ?1 ORDER BY fetched_at, seq",
            COLUMNS
        ))?;

        let schemas = stmt
            .query_map([domain_id], row_to_schema)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(schemas)
    }

    /// Most recently fetched version for a domain.
    pub fn get_latest(conn: &Connection, domain_id: i64) -> Result<Option<ApiSchema>> {
        let schema = conn
            .query_row(
                &format!(
                    "SELECT {} FROM api_schemas WHERE domain_id = ?1
                     ORDER BY fetched_at DESC, seq DESC LIMIT 1",
                    COLUMNS
                ),
                [domain_id],
                row_to_schema,
            )
            .optional()?;
        Ok(schema)
    }

    /// Delete one version.
    pub fn delete(conn: &Connection, id: &str) -> Result<bool> {
        let deleted = conn.execute("DELETE FROM api_schemas WHERE id = ?1", [id])?;
        Ok(deleted > 0)
    }
}

fn row_to_schema(row: &Row<'_>) -> rusqlite::Result<ApiSchema> {
    let source: String = row.get(4)?;
    Ok(ApiSchema {
        id: row.get(0)?,
        domain_id: row.get(1)?,
        version: row.get(2)?,
        spec: row.get(3)?,
        source: SchemaSource::parse(&source).unwrap_or(SchemaSource::Import),
        fetched_at: row.get(5)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::DomainRepo;
    use crate::schema::run_migrations;

    fn setup_db() -> (Connection, i64) {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        let domain = DomainRepo::insert(&conn, "https://api.test").unwrap();
        (conn, domain.id)
    }

    fn schema(id: &str, domain_id: i64, fetched_at: i64) -> ApiSchema {
        ApiSchema {
            id: id.to_string(),
            domain_id,
            version: format!("v-{}", fetched_at),
            spec: "{\"openapi\":\"3.0.0\",\"paths\":{}}".to_string(),
            source: SchemaSource::Url,
            fetched_at,
        }
    }

    #[test]
    fn test_versions_ordered_by_fetch_time() {
        let (conn, domain_id) = setup_db();

        SchemaRepo::insert(&conn, &schema("s2", domain_id, 200)).unwrap();
        SchemaRepo::insert(&conn, &schema("s1", domain_id, 100)).unwrap();

        let ids: Vec<String> = SchemaRepo::get_for_domain(&conn, domain_id)
            .unwrap()
            .into_iter()
            .map(|s| s.id)
            .collect();
        assert_eq!(ids, vec!["s1", "s2"]);
        assert_eq!(
            SchemaRepo::get_latest(&conn, domain_id).unwrap().unwrap().id,
            "s2"
        );
    }

    #[test]
    fn test_spec_text_is_preserved() {
        let (conn, domain_id) = setup_db();

        let mut stored = schema("s1", domain_id, 1);
        stored.spec = "{\n  \"openapi\": \"3.1.0\",\n  \"paths\": {}\n}\n".to_string();
        SchemaRepo::insert(&conn, &stored).unwrap();

        assert_eq!(SchemaRepo::get_by_id(&conn, "s1").unwrap(), Some(stored));
    }

    #[test]
    fn test_delete() {
        let (conn, domain_id) = setup_db();

        SchemaRepo::insert(&conn, &schema("s1", domain_id, 1)).unwrap();
        assert!(SchemaRepo::delete(&conn, "s1").unwrap());
        assert!(SchemaRepo::get_latest(&conn, domain_id).unwrap().is_none());
    }
}
