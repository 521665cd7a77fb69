use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::key::CacheKey;

type Slots = Arc<Mutex<HashMap<CacheKey, Arc<AsyncMutex<()>>>>>;

/// Per-key gate so concurrent misses for one key share a single resolution.
#[derive(Clone, Default)]
pub struct Flight {
    inner: Slots,
}

pub struct FlightGuard {
    key: CacheKey,
    slot: Arc<AsyncMutex<()>>,
    guard: Option<OwnedMutexGuard<()>>,
    inner: Slots,
}

impl Flight {
    pub async fn acquire(&self, key: &CacheKey) -> FlightGuard {
        let slot = {
            let mut map = self.inner.lock();
            map.entry(key.clone())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        let guard = Arc::clone(&slot).lock_owned().await;
        FlightGuard {
            key: key.clone(),
            slot,
            guard: Some(guard),
            inner: Arc::clone(&self.inner),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.inner.lock().len()
    }
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        self.guard.take();
        let mut map = self.inner.lock();
        // Map entry plus this guard's clone: nobody else is waiting.
        if Arc::strong_count(&self.slot) <= 2 {
            map.remove(&self.key);
        }
    }
}
