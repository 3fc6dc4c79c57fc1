//! In-process watermark store for tests. Nothing is persisted.

use std::collections::HashMap;

use async_trait::async_trait;
use convfeed_core::WatermarkPath;
use tokio::sync::Mutex;

use crate::{StoreError, WatermarkStore};

/// Counts every call so tests can assert which collaborators were touched.
#[derive(Debug, Default)]
pub struct MemoryWatermarkStore {
    state: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    documents: HashMap<WatermarkPath, Vec<String>>,
    reads: usize,
    writes: usize,
}

impl MemoryWatermarkStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn with_history(path: WatermarkPath, history: Vec<String>) -> Self {
        let store = Self::default();
        store.state.lock().await.documents.insert(path, history);
        store
    }

    pub async fn get(&self, path: &WatermarkPath) -> Option<Vec<String>> {
        self.state.lock().await.documents.get(path).cloned()
    }

    pub async fn reads(&self) -> usize {
        self.state.lock().await.reads
    }

    pub async fn writes(&self) -> usize {
        self.state.lock().await.writes
    }
}

#[async_trait]
impl WatermarkStore for MemoryWatermarkStore {
    async fn read(&self, path: &WatermarkPath) -> Result<Option<Vec<String>>, StoreError> {
        let mut state = self.state.lock().await;
        state.reads += 1;
        Ok(state.documents.get(path).cloned())
    }

    async fn write(&self, path: &WatermarkPath, history: &[String]) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.writes += 1;
        state.documents.insert(path.clone(), history.to_vec());
        Ok(())
    }
}
