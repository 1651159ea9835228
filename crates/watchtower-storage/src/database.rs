//! High-level database interface.

use std::path::PathBuf;

use directories::ProjectDirs;
use tracing::info;

use watchtower_core::{
    ApiMock, ApiSchema, ApiTestCase, Domain, DomainApiLoggingLink, LocalRoute, LocalRouteUpdate,
    NewLocalRoute, ProxySettings,
};

use crate::error::{Result, StorageError};
use crate::pool::ConnectionPool;
use crate::repository::{
    ConfigRepo, DomainRepo, LoggingLinkRepo, MockRepo, RouteRepo, SchemaRepo, TestCaseRepo,
    PROXY_SETTINGS_KEY,
};

/// Database file name inside the data directory.
pub const DB_FILE_NAME: &str = "watchtower.db";

/// High-level database interface for Watchtower.
#[derive(Clone)]
pub struct Database {
    pool: ConnectionPool,
}

impl Database {
    /// Open the database in the default app data directory.
    pub fn new() -> Result<Self> {
        Self::with_path(Self::default_data_dir()?.join(DB_FILE_NAME))
    }

    /// Open a database at a specific path.
    pub fn with_path(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        info!("Opening database at: {:?}", path);
        let pool = ConnectionPool::new(&path)?;

        Ok(Self { pool })
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let pool = ConnectionPool::in_memory()?;
        Ok(Self { pool })
    }

    /// Platform data directory for the application.
    pub fn default_data_dir() -> Result<PathBuf> {
        let proj_dirs = ProjectDirs::from("com", "watchtower", "Watchtower")
            .ok_or_else(|| StorageError::Config("Could not determine app data directory".into()))?;

        Ok(proj_dirs.data_dir().to_path_buf())
    }

    // === Domains ===

    /// Get all domains.
    pub fn get_domains(&self) -> Result<Vec<Domain>> {
        let conn = self.pool.get()?;
        DomainRepo::get_all(&conn)
    }

    /// Get a domain by ID.
    pub fn get_domain(&self, id: i64) -> Result<Option<Domain>> {
        let conn = self.pool.get()?;
        DomainRepo::get_by_id(&conn, id)
    }

    /// Register a domain.
    pub fn add_domain(&self, url: &str) -> Result<Domain> {
        let conn = self.pool.get()?;
        DomainRepo::insert(&conn, url)
    }

    /// Change a domain's URL.
    pub fn update_domain(&self, id: i64, url: &str) -> Result<Domain> {
        let conn = self.pool.get()?;
        if !DomainRepo::update_url(&conn, id, url)? {
            return Err(StorageError::NotFound(format!("domain {}", id)));
        }
        Ok(Domain {
            id,
            url: url.to_string(),
        })
    }

    /// Remove a domain together with its logging link, schemas and test cases.
    pub fn remove_domain(&self, id: i64) -> Result<bool> {
        let conn = self.pool.get()?;
        DomainRepo::delete(&conn, id)
    }

    // === Local routes ===

    /// Get all routes in insertion order.
    pub fn get_local_routes(&self) -> Result<Vec<LocalRoute>> {
        let conn = self.pool.get()?;
        RouteRepo::get_all(&conn)
    }

    /// Add an enabled route.
    pub fn add_local_route(&self, route: &NewLocalRoute) -> Result<LocalRoute> {
        let conn = self.pool.get()?;
        RouteRepo::insert(&conn, route)
    }

    /// Apply a partial update.
    pub fn update_local_route(&self, update: &LocalRouteUpdate) -> Result<Option<LocalRoute>> {
        let conn = self.pool.get()?;
        RouteRepo::update(&conn, update)
    }

    /// Remove a route, returning it.
    pub fn remove_local_route(&self, id: i64) -> Result<Option<LocalRoute>> {
        let conn = self.pool.get()?;
        RouteRepo::delete(&conn, id)
    }

    /// Toggle one route.
    pub fn set_local_route_enabled(&self, id: i64, enabled: bool) -> Result<Option<LocalRoute>> {
        self.update_local_route(&LocalRouteUpdate {
            id,
            enabled: Some(enabled),
            ..Default::default()
        })
    }

    // === Settings ===

    /// Load proxy settings, filling anything missing with defaults.
    pub fn get_proxy_settings(&self) -> Result<ProxySettings> {
        let conn = self.pool.get()?;
        ConfigRepo::get_or_default(&conn, PROXY_SETTINGS_KEY, ProxySettings::default())
    }

    /// Persist proxy settings.
    pub fn save_proxy_settings(&self, settings: &ProxySettings) -> Result<()> {
        let conn = self.pool.get()?;
        ConfigRepo::set(&conn, PROXY_SETTINGS_KEY, settings)
    }

    // === Mocks ===

    /// Get all mocks in creation order.
    pub fn get_api_mocks(&self) -> Result<Vec<ApiMock>> {
        let conn = self.pool.get()?;
        MockRepo::get_all(&conn)
    }

    /// Get a mock by ID.
    pub fn get_api_mock(&self, id: &str) -> Result<Option<ApiMock>> {
        let conn = self.pool.get()?;
        MockRepo::get_by_id(&conn, id)
    }

    /// Store a new mock. Its id must already be set.
    pub fn add_api_mock(&self, mock: &ApiMock) -> Result<()> {
        let conn = self.pool.get()?;
        MockRepo::insert(&conn, mock)
    }

    /// Replace an existing mock.
    pub fn update_api_mock(&self, mock: &ApiMock) -> Result<()> {
        let conn = self.pool.get()?;
        if !MockRepo::update(&conn, mock)? {
            return Err(StorageError::NotFound(format!("mock {}", mock.id)));
        }
        Ok(())
    }

    /// Remove a mock.
    pub fn remove_api_mock(&self, id: &str) -> Result<bool> {
        let conn = self.pool.get()?;
        MockRepo::delete(&conn, id)
    }

    // === Schemas ===

    /// Append a schema version.
    pub fn add_api_schema(&self, schema: &ApiSchema) -> Result<()> {
        let conn = self.pool.get()?;
        SchemaRepo::insert(&conn, schema)
    }

    /// All versions for a domain, oldest first.
    pub fn get_api_schemas(&self, domain_id: i64) -> Result<Vec<ApiSchema>> {
        let conn = self.pool.get()?;
        SchemaRepo::get_for_domain(&conn, domain_id)
    }

    /// Get a version by ID.
    pub fn get_api_schema(&self, id: &str) -> Result<Option<ApiSchema>> {
        let conn = self.pool.get()?;
        SchemaRepo::get_by_id(&conn, id)
    }

    /// Most recent version for a domain.
    pub fn get_latest_api_schema(&self, domain_id: i64) -> Result<Option<ApiSchema>> {
        let conn = self.pool.get()?;
        SchemaRepo::get_latest(&conn, domain_id)
    }

    /// Remove one version.
    pub fn remove_api_schema(&self, id: &str) -> Result<bool> {
        let conn = self.pool.get()?;
        SchemaRepo::delete(&conn, id)
    }

    // === Logging links ===

    /// All logging links.
    pub fn get_logging_links(&self) -> Result<Vec<DomainApiLoggingLink>> {
        let conn = self.pool.get()?;
        LoggingLinkRepo::get_all(&conn)
    }

    /// Logging link for one domain.
    pub fn get_logging_link(&self, domain_id: i64) -> Result<Option<DomainApiLoggingLink>> {
        let conn = self.pool.get()?;
        LoggingLinkRepo::get(&conn, domain_id)
    }

    /// Create or replace a domain's logging link.
    pub fn set_logging_link(&self, link: &DomainApiLoggingLink) -> Result<()> {
        let conn = self.pool.get()?;
        if DomainRepo::get_by_id(&conn, link.domain_id)?.is_none() {
            return Err(StorageError::NotFound(format!("domain {}", link.domain_id)));
        }
        LoggingLinkRepo::upsert(&conn, link)
    }

    /// Remove a domain's logging link.
    pub fn remove_logging_link(&self, domain_id: i64) -> Result<bool> {
        let conn = self.pool.get()?;
        LoggingLinkRepo::delete(&conn, domain_id)
    }

    // === Test cases ===

    /// Test cases, optionally limited to one domain.
    pub fn get_api_test_cases(&self, domain_id: Option<i64>) -> Result<Vec<ApiTestCase>> {
        let conn = self.pool.get()?;
        match domain_id {
            Some(id) => TestCaseRepo::get_for_domain(&conn, id),
            None => TestCaseRepo::get_all(&conn),
        }
    }

    /// Store a test case. Its id must already be set.
    pub fn add_api_test_case(&self, case: &ApiTestCase) -> Result<()> {
        let conn = self.pool.get()?;
        TestCaseRepo::insert(&conn, case)
    }

    /// Remove a test case.
    pub fn remove_api_test_case(&self, id: &str) -> Result<bool> {
        let conn = self.pool.get()?;
        TestCaseRepo::delete(&conn, id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use watchtower_core::SchemaSource;

    #[test]
    fn test_settings_roundtrip_through_config_table() {
        let db = Database::in_memory().unwrap();
        assert_eq!(db.get_proxy_settings().unwrap(), ProxySettings::default());

        let settings = ProxySettings {
            proxy_port: 9090,
            reverse_http_port: Some(8080),
            dns_server: Some("1.1.1.1".to_string()),
            ..Default::default()
        };
        db.save_proxy_settings(&settings).unwrap();
        assert_eq!(db.get_proxy_settings().unwrap(), settings);
    }

    #[test]
    fn test_remove_domain_cascades() {
        let db = Database::in_memory().unwrap();
        let domain = db.add_domain("https://shop.test").unwrap();

        db.set_logging_link(&DomainApiLoggingLink {
            domain_id: domain.id,
            logging_enabled: true,
            body_enabled: true,
            schema_url: None,
        })
        .unwrap();
        db.add_api_schema(&ApiSchema {
            id: "s1".to_string(),
            domain_id: domain.id,
            version: "1.0".to_string(),
            spec: "{}".to_string(),
            source: SchemaSource::Import,
            fetched_at: 1,
        })
        .unwrap();

        assert!(db.remove_domain(domain.id).unwrap());
        assert!(db.get_logging_links().unwrap().is_empty());
        assert!(db.get_api_schema("s1").unwrap().is_none());
    }

    #[test]
    fn test_logging_link_requires_domain() {
        let db = Database::in_memory().unwrap();
        let err = db
            .set_logging_link(&DomainApiLoggingLink {
                domain_id: 42,
                logging_enabled: true,
                body_enabled: false,
                schema_url: None,
            })
            .unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));
    }

    #[test]
    fn test_update_missing_records() {
        let db = Database::in_memory().unwrap();
        assert!(matches!(
            db.update_domain(7, "https://x.test"),
            Err(StorageError::NotFound(_))
        ));
        assert!(db.set_local_route_enabled(7, false).unwrap().is_none());
    }
}
