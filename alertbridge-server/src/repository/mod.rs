//! Repository abstraction for plugin data persistence.
//!
//! This module defines the `PluginDataRepository` trait that abstracts
//! storage of per-request synchronization state. Implementations provide
//! different backends (in-memory, SQLite).
//!
//! # Consistency
//!
//! Every implementation must give read-after-write consistency for a single
//! request id, and writes for different request ids must not interfere.
//! Nothing here serializes work for the *same* request id; that is the
//! dispatcher's job.

mod memory;
mod sqlite;

pub use memory::InMemoryRepository;
pub use sqlite::SqliteRepository;

use async_trait::async_trait;

use alertbridge_core::{PluginData, RequestId};

use crate::error::RepositoryError;

/// Repository trait for persisting plugin data.
#[async_trait]
pub trait PluginDataRepository: Send + Sync {
    /// Get plugin data for a request, returning None if nothing was stored yet.
    async fn get(&self, id: &RequestId) -> Result<Option<PluginData>, RepositoryError>;

    /// Store plugin data for a request (upsert semantics).
    async fn put(&self, id: &RequestId, data: PluginData) -> Result<(), RepositoryError>;

    /// Get every stored record, ordered by request id.
    async fn get_all(&self) -> Result<Vec<(RequestId, PluginData)>, RepositoryError>;
}
