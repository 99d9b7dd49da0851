use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use avi_core::{RawBatch, RequestParams};
use tokio::sync::Mutex;
use tracing::debug;

/// Session-scoped memo of raw fetches, keyed by normalized request params.
///
/// Unbounded for the life of the owning pipeline. Only successful fetches
/// are stored.
#[derive(Debug, Default)]
pub struct FetchCache {
    entries: Mutex<HashMap<RequestParams, Arc<RawBatch>>>,
    hits: AtomicUsize,
    misses: AtomicUsize,
}

impl FetchCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get_or_fetch<F, Fut, E>(
        &self,
        params: &RequestParams,
        fetch: F,
    ) -> Result<Arc<RawBatch>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<RawBatch, E>>,
    {
        let key = params.normalized();
        if let Some(batch) = self.entries.lock().await.get(&key).cloned() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            debug!(source_id = %key.source_id, range = %key.range, "cache hit");
            return Ok(batch);
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let batch = Arc::new(fetch().await?);
        self.entries.lock().await.insert(key, Arc::clone(&batch));
        Ok(batch)
    }

    pub async fn contains(&self, params: &RequestParams) -> bool {
        self.entries.lock().await.contains_key(&params.normalized())
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> usize {
        self.misses.load(Ordering::Relaxed)
    }
}
