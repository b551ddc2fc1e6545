// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::batch::build_batch;
use crate::constants;
use crate::delivery::{DeliveryClient, DeliveryOutcome};
use crate::queue_store::QueueStore;
use crate::rate_limiter::{RateLimiter, WindowState};
use crate::tenant::{Tenant, TenantRegistry, TenantState};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, warn};

#[derive(Debug, Clone, Copy)]
pub struct FlusherConfig {
    /// Ceiling for a whole outbound request body, envelope included.
    pub max_body_size: usize,
    pub rate_window: Duration,
    pub max_requests_per_window: u32,
    /// `0` retries forever.
    pub max_consecutive_failures: u32,
}

impl Default for FlusherConfig {
    fn default() -> Self {
        Self {
            max_body_size: constants::DEFAULT_MAX_BODY_SIZE,
            rate_window: constants::DEFAULT_FLUSH_INTERVAL,
            max_requests_per_window: constants::DEFAULT_MAX_REQUESTS_PER_WINDOW,
            max_consecutive_failures: constants::DEFAULT_MAX_CONSECUTIVE_FAILURES,
        }
    }
}

/// What one flush pass did for one tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassOutcome {
    /// Another pass for the tenant was still running.
    Busy,
    /// No upstream URL is configured.
    Unconfigured,
    Empty,
    /// Rate budget exhausted; the queue was not touched.
    Deferred,
    Delivered { events: usize, bytes: usize },
    /// Delivery failed and the batch went back to the head of the queue.
    Requeued { events: usize },
    /// Delivery failed too many times in a row; the batch was moved to the
    /// dead-letter list.
    DeadLettered { events: usize },
    /// The queue store failed.
    Failed,
}

/// Totals over one round of passes.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FlushSummary {
    pub tenants: usize,
    pub delivered_events: usize,
    pub requeued_events: usize,
    pub dead_lettered_events: usize,
    pub deferred: usize,
    pub busy: usize,
    pub failed: usize,
}

impl FlushSummary {
    fn record(&mut self, outcome: PassOutcome) {
        self.tenants += 1;
        match outcome {
            PassOutcome::Delivered { events, .. } => self.delivered_events += events,
            PassOutcome::Requeued { events } => self.requeued_events += events,
            PassOutcome::DeadLettered { events } => self.dead_lettered_events += events,
            PassOutcome::Deferred => self.deferred += 1,
            PassOutcome::Busy => self.busy += 1,
            PassOutcome::Failed => self.failed += 1,
            PassOutcome::Unconfigured | PassOutcome::Empty => {}
        }
    }
}

/// Runs flush passes: pending check, rate limiting, batching, delivery and
/// re-queueing on failure.
pub struct Flusher {
    store: Arc<dyn QueueStore>,
    registry: Arc<TenantRegistry>,
    delivery: DeliveryClient,
    limiter: RateLimiter,
    upstream_window: Mutex<WindowState>,
    /// Source of the sequence numbers handed to tenants when they get a send.
    grants: AtomicU64,
    max_body_size: usize,
    max_consecutive_failures: u32,
}

impl Flusher {
    pub fn new(
        store: Arc<dyn QueueStore>,
        registry: Arc<TenantRegistry>,
        delivery: DeliveryClient,
        config: FlusherConfig,
    ) -> Self {
        Self {
            store,
            registry,
            delivery,
            limiter: RateLimiter::new(config.rate_window, config.max_requests_per_window),
            upstream_window: Mutex::new(WindowState::default()),
            grants: AtomicU64::new(0),
            max_body_size: config.max_body_size,
            max_consecutive_failures: config.max_consecutive_failures,
        }
    }

    /// Known tenants, least recently served first. A tenant turned away by a
    /// full upstream window keeps its place and is tried first on the next
    /// tick.
    fn tenants_in_turn(&self) -> Vec<Arc<Tenant>> {
        let mut tenants = self.registry.snapshot();
        tenants.sort_by_key(|tenant| tenant.last_served());
        tenants
    }

    fn is_configured(&self) -> bool {
        match self.delivery.url() {
            Ok(_) => true,
            Err(err) => {
                error!("Skipping flush: {err}");
                false
            }
        }
    }

    /// Spawns one pass per known tenant onto `tracker` without waiting for
    /// them. Used by the scheduler on every tick.
    pub fn dispatch(self: &Arc<Self>, tracker: &TaskTracker) {
        if !self.is_configured() {
            return;
        }
        for tenant in self.tenants_in_turn() {
            let flusher = Arc::clone(self);
            tracker.spawn(async move {
                flusher.flush_tenant(&tenant).await;
            });
        }
    }

    /// Runs one pass per known tenant concurrently and waits for all of them.
    pub async fn flush_all(self: &Arc<Self>) -> FlushSummary {
        let mut summary = FlushSummary::default();
        if !self.is_configured() {
            return summary;
        }

        let mut passes = JoinSet::new();
        for tenant in self.tenants_in_turn() {
            let flusher = Arc::clone(self);
            passes.spawn(async move { flusher.flush_tenant(&tenant).await });
        }
        while let Some(result) = passes.join_next().await {
            match result {
                Ok(outcome) => summary.record(outcome),
                Err(err) => error!("Flush pass did not complete: {err}"),
            }
        }
        debug!("Flushed {} tenants: {:?}", summary.tenants, summary);
        summary
    }

    /// One pass for one tenant. Skips when another pass for the same tenant
    /// is still running.
    pub async fn flush_tenant(&self, tenant: &Tenant) -> PassOutcome {
        let Some(mut state) = tenant.try_begin_pass() else {
            debug!("Flush already in progress for tenant {}", tenant.api_key());
            return PassOutcome::Busy;
        };
        self.run_pass(tenant, &mut state).await
    }

    async fn run_pass(&self, tenant: &Tenant, state: &mut TenantState) -> PassOutcome {
        if self.delivery.url().is_err() {
            return PassOutcome::Unconfigured;
        }

        match self.store.len(tenant.queue_key()).await {
            Ok(0) => return PassOutcome::Empty,
            Ok(_) => {}
            Err(err) => {
                error!("Failed to read queue for tenant {}: {}", tenant.api_key(), err);
                return PassOutcome::Failed;
            }
        }

        if !self.try_acquire(tenant, &mut state.window, Instant::now()) {
            debug!("Rate limit reached, deferring tenant {}", tenant.api_key());
            return PassOutcome::Deferred;
        }

        let limit = match DeliveryClient::envelope_overhead(tenant.api_key()) {
            Ok(overhead) => self.max_body_size.saturating_sub(overhead),
            Err(err) => {
                error!("Failed to size payload for tenant {}: {}", tenant.api_key(), err);
                return PassOutcome::Failed;
            }
        };

        let mut batch = match build_batch(self.store.as_ref(), tenant.queue_key(), limit).await {
            Ok(batch) => batch,
            Err(err) => {
                error!("Failed to build batch for tenant {}: {}", tenant.api_key(), err);
                return PassOutcome::Failed;
            }
        };

        if !batch.discarded.is_empty() {
            let discarded = std::mem::take(&mut batch.discarded);
            if !self.dead_letter(tenant, &discarded).await {
                self.push_back(tenant, discarded).await;
            }
        }
        if batch.is_empty() {
            return PassOutcome::Empty;
        }

        let events = batch.len();
        match self.delivery.deliver(tenant.api_key(), &batch.events).await {
            DeliveryOutcome::Success => {
                state.consecutive_failures = 0;
                PassOutcome::Delivered {
                    events,
                    bytes: batch.size_bytes,
                }
            }
            DeliveryOutcome::Failure(_) => {
                state.consecutive_failures = state.consecutive_failures.saturating_add(1);
                if self.max_consecutive_failures > 0
                    && state.consecutive_failures >= self.max_consecutive_failures
                {
                    warn!(
                        "Delivery for tenant {} failed {} times in a row, dead-lettering {} events",
                        tenant.api_key(),
                        state.consecutive_failures,
                        events
                    );
                    state.consecutive_failures = 0;
                    if self.dead_letter(tenant, &batch.raw).await {
                        return PassOutcome::DeadLettered { events };
                    }
                }
                if self.push_back(tenant, batch.raw).await {
                    PassOutcome::Requeued { events }
                } else {
                    PassOutcome::Failed
                }
            }
        }
    }

    /// Counts one attempt against both the tenant's window and the upstream
    /// window, or neither.
    fn try_acquire(
        &self,
        tenant: &Tenant,
        tenant_window: &mut WindowState,
        now: Instant,
    ) -> bool {
        let mut upstream = self
            .upstream_window
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !self.limiter.has_capacity(tenant_window, now)
            || !self.limiter.has_capacity(&mut upstream, now)
        {
            return false;
        }
        self.limiter.record(tenant_window, now);
        self.limiter.record(&mut upstream, now);
        tenant.mark_served(self.grants.fetch_add(1, Ordering::Relaxed) + 1);
        true
    }

    /// Puts items taken off the tenant's queue back at its head.
    async fn push_back(&self, tenant: &Tenant, raw: Vec<String>) -> bool {
        let count = raw.len();
        match self.store.push_head_many(tenant.queue_key(), raw).await {
            Ok(()) => true,
            Err(err) => {
                error!(
                    "Lost {} items for tenant {} while re-queueing: {}",
                    count,
                    tenant.api_key(),
                    err
                );
                false
            }
        }
    }

    async fn dead_letter(&self, tenant: &Tenant, raw: &[String]) -> bool {
        match self.store.push_tail_many(tenant.dead_letter_key(), raw).await {
            Ok(()) => true,
            Err(err) => {
                error!(
                    "Failed to dead-letter {} items for tenant {}: {}",
                    raw.len(),
                    tenant.api_key(),
                    err
                );
                false
            }
        }
    }
}
