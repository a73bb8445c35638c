//! In-memory implementation of `PluginDataRepository`.
//!
//! All state is held in memory and lost on restart. Used by tests and by
//! deployments that accept re-creating alerts after a restart.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use alertbridge_core::{PluginData, RequestId};

use super::PluginDataRepository;
use crate::error::RepositoryError;

/// Stores plugin data in a `HashMap` protected by a `RwLock`.
pub struct InMemoryRepository {
    records: RwLock<HashMap<RequestId, PluginData>>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PluginDataRepository for InMemoryRepository {
    async fn get(&self, id: &RequestId) -> Result<Option<PluginData>, RepositoryError> {
        let records = self.records.read().await;
        Ok(records.get(id).cloned())
    }

    async fn put(&self, id: &RequestId, data: PluginData) -> Result<(), RepositoryError> {
        let mut records = self.records.write().await;
        records.insert(id.clone(), data);
        Ok(())
    }

    async fn get_all(&self) -> Result<Vec<(RequestId, PluginData)>, RepositoryError> {
        let records = self.records.read().await;
        let mut all: Vec<_> = records
            .iter()
            .map(|(id, data)| (id.clone(), data.clone()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(all)
    }
}
