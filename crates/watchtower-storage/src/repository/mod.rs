//! Database repositories for each table.

pub mod config;
pub mod domains;
pub mod logging_links;
pub mod mocks;
pub mod routes;
pub mod schemas;
pub mod test_cases;

pub use config::{ConfigRepo, PROXY_SETTINGS_KEY};
pub use domains::DomainRepo;
pub use logging_links::LoggingLinkRepo;
pub use mocks::MockRepo;
pub use routes::RouteRepo;
pub use schemas::SchemaRepo;
pub use test_cases::TestCaseRepo;
