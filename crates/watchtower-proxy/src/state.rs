//! Live dispatch configuration shared with running listeners.
//!
//! Readers take an `Arc<ConfigSnapshot>` and keep it for the request they
//! are serving. Writers build a whole new snapshot and swap the pointer,
//! so an edit never shows up halfway through a request.

use std::sync::Arc;

use parking_lot::RwLock;

use watchtower_core::dispatch::build_capture_map;
use watchtower_core::ConfigSnapshot;
use watchtower_storage::Database;

use crate::error::Result;

#[derive(Debug, Clone, Default)]
pub struct SharedConfig {
    inner: Arc<RwLock<Arc<ConfigSnapshot>>>,
}

impl SharedConfig {
    pub fn new(snapshot: ConfigSnapshot) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(snapshot))),
        }
    }

    /// Builds the initial snapshot from persisted state.
    pub fn load(db: &Database) -> Result<Self> {
        Ok(Self::new(load_snapshot(db)?))
    }

    /// Current snapshot.
    pub fn snapshot(&self) -> Arc<ConfigSnapshot> {
        self.inner.read().clone()
    }

    /// Rebuilds routes, mocks and capture hosts from storage, keeping the
    /// current routing toggle.
    pub fn reload(&self, db: &Database) -> Result<()> {
        let mut snapshot = load_snapshot(db)?;
        let mut guard = self.inner.write();
        snapshot.local_routing_enabled = guard.local_routing_enabled;
        *guard = Arc::new(snapshot);
        Ok(())
    }

    /// Copy-on-write edit of the current snapshot.
    pub fn update(&self, edit: impl FnOnce(&mut ConfigSnapshot)) {
        let mut guard = self.inner.write();
        let mut next = ConfigSnapshot::clone(&guard);
        edit(&mut next);
        *guard = Arc::new(next);
    }

    pub fn local_routing_enabled(&self) -> bool {
        self.inner.read().local_routing_enabled
    }

    pub fn set_local_routing_enabled(&self, enabled: bool) {
        self.update(|s| s.local_routing_enabled = enabled);
    }
}

/// Reads everything dispatch needs from the database.
pub fn load_snapshot(db: &Database) -> Result<ConfigSnapshot> {
    let settings = db.get_proxy_settings()?;
    let domains = db.get_domains()?;
    let links = db.get_logging_links()?;

    Ok(ConfigSnapshot {
        local_routing_enabled: settings.local_routing_enabled,
        routes: db.get_local_routes()?,
        mocks: db.get_api_mocks()?,
        capture: build_capture_map(&domains, &links),
    })
}
