pub mod approval;
pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod ingest;
pub mod repository;

pub use approval::{FakeReviewSubmitter, HttpReviewSubmitter, ReviewSubmitter};
pub use dispatcher::{Dispatcher, DispatcherConfig};
pub use engine::{HandleOutcome, SyncEngine};
pub use error::{EngineError, GatewayError, RepositoryError};
pub use gateway::{AlertGateway, AlertStatus, FakeAlertGateway, OpsgenieClient, OpsgenieConfig};
pub use repository::{InMemoryRepository, PluginDataRepository, SqliteRepository};

mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

/// Version reported in logs, the health endpoint and the client user agent.
pub fn get_version() -> String {
    built_info::PKG_VERSION.to_string()
}
