// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::api_key::ApiKey;
use crate::errors::QueueError;
use crate::queue_store::QueueStore;
use crate::rate_limiter::WindowState;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::{Mutex, MutexGuard};
use tracing::debug;

const PENDING_SEGMENT: &str = "pending";
const DEAD_LETTER_SEGMENT: &str = "dead-letter";

/// Mutable per-tenant flush state. Only ever touched by the flush pass that
/// holds the tenant's lock.
#[derive(Debug, Default)]
pub struct TenantState {
    pub window: WindowState,
    pub consecutive_failures: u32,
}

#[derive(Debug)]
pub struct Tenant {
    api_key: ApiKey,
    queue_key: String,
    dead_letter_key: String,
    state: Mutex<TenantState>,
    /// Sequence number of the last send this tenant was granted, `0` if never.
    last_served: AtomicU64,
}

impl Tenant {
    fn new(prefix: &str, api_key: ApiKey) -> Self {
        Self {
            queue_key: pending_queue_key(prefix, &api_key),
            dead_letter_key: dead_letter_queue_key(prefix, &api_key),
            api_key,
            state: Mutex::new(TenantState::default()),
            last_served: AtomicU64::new(0),
        }
    }

    pub fn api_key(&self) -> &ApiKey {
        &self.api_key
    }

    pub fn queue_key(&self) -> &str {
        &self.queue_key
    }

    pub fn dead_letter_key(&self) -> &str {
        &self.dead_letter_key
    }

    /// Claims the tenant for a flush pass. Returns `None` while another pass
    /// holds it; the guard must be kept until the pass is over.
    pub fn try_begin_pass(&self) -> Option<MutexGuard<'_, TenantState>> {
        self.state.try_lock().ok()
    }

    pub fn last_served(&self) -> u64 {
        self.last_served.load(Ordering::Relaxed)
    }

    pub(crate) fn mark_served(&self, sequence: u64) {
        self.last_served.store(sequence, Ordering::Relaxed);
    }
}

fn pending_queue_key(prefix: &str, api_key: &ApiKey) -> String {
    format!("{prefix}:{PENDING_SEGMENT}:{}", api_key.as_str())
}

fn dead_letter_queue_key(prefix: &str, api_key: &ApiKey) -> String {
    format!("{prefix}:{DEAD_LETTER_SEGMENT}:{}", api_key.as_str())
}

/// Known tenants, created lazily and never evicted.
pub struct TenantRegistry {
    prefix: String,
    tenants: RwLock<HashMap<ApiKey, Arc<Tenant>>>,
}

impl TenantRegistry {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            tenants: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the tenant for `api_key`, creating it on first sight. Repeated
    /// calls with the same key return the same `Arc`.
    pub fn get_or_create(&self, api_key: &ApiKey) -> Arc<Tenant> {
        if let Some(tenant) = self
            .tenants
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(api_key)
        {
            return Arc::clone(tenant);
        }

        let mut tenants = self
            .tenants
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let tenant = tenants.entry(api_key.clone()).or_insert_with(|| {
            debug!("Registered tenant {api_key}");
            Arc::new(Tenant::new(&self.prefix, api_key.clone()))
        });
        Arc::clone(tenant)
    }

    /// Tenants known right now. Tenants registered after the call are not
    /// included.
    pub fn snapshot(&self) -> Vec<Arc<Tenant>> {
        self.tenants
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tenants
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Registers a tenant for every pending queue already in `store`, so a
    /// backlog left behind by a previous process gets flushed. Returns the
    /// number of tenants found.
    pub async fn restore(&self, store: &dyn QueueStore) -> Result<usize, QueueError> {
        let pending_prefix = format!("{}:{PENDING_SEGMENT}:", self.prefix);
        let queues = store.queues(&pending_prefix).await?;

        let mut restored = 0;
        for queue in queues {
            let Some(api_key) = queue
                .strip_prefix(&pending_prefix)
                .and_then(ApiKey::new)
            else {
                continue;
            };
            self.get_or_create(&api_key);
            restored += 1;
        }
        Ok(restored)
    }
}
