use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::domain::request::RequestId;

const PRUNE_THRESHOLD: usize = 1024;

/// One async mutex per request id. Different ids never contend.
#[derive(Default)]
pub(crate) struct RequestLocks {
    locks: Mutex<HashMap<RequestId, Arc<AsyncMutex<()>>>>,
}

impl RequestLocks {
    pub(crate) async fn acquire(&self, id: &RequestId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = match self.locks.lock() {
                Ok(locks) => locks,
                Err(poisoned) => poisoned.into_inner(),
            };
            if locks.len() >= PRUNE_THRESHOLD {
                locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            }
            Arc::clone(locks.entry(id.clone()).or_default())
        };
        lock.lock_owned().await
    }
}
