//! Watchtower Storage - persistence for the developer proxy.
//!
//! Two stores live here:
//!
//! - A SQLite database (domains, local routes, proxy settings, mock rules,
//!   schema versions, logging links and API test cases)
//! - A directory of per-day NDJSON files for captured traffic
//!
//! # Example
//!
//! ```no_run
//! use watchtower_storage::Database;
//! use watchtower_core::NewLocalRoute;
//!
//! let db = Database::in_memory().unwrap();
//! db.add_local_route(&NewLocalRoute {
//!     domain: "app.example.com".to_string(),
//!     target_host: "127.0.0.1".to_string(),
//!     target_port: 3000,
//! }).unwrap();
//! ```

mod database;
pub mod error;
mod pool;
pub mod repository;
mod schema;
pub mod traffic_log;

pub use database::{Database, DB_FILE_NAME};
pub use error::{Result, StorageError};
pub use pool::ConnectionPool;
pub use traffic_log::TrafficLogStore;
