// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::flusher::{FlushSummary, Flusher};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};

struct Ticker {
    cancel_token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Fires a flush pass for every known tenant once per interval.
///
/// Passes are spawned onto a [`TaskTracker`] and are not awaited by the
/// ticker, so a slow tenant never delays the next tick for the others.
pub struct FlushScheduler {
    flusher: Arc<Flusher>,
    period: Duration,
    tracker: TaskTracker,
    ticker: Mutex<Option<Ticker>>,
}

impl FlushScheduler {
    pub fn new(flusher: Arc<Flusher>, period: Duration) -> Self {
        Self {
            flusher,
            period,
            tracker: TaskTracker::new(),
            ticker: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.ticker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Starts ticking. Does nothing if already started. Must be called from
    /// within a tokio runtime.
    pub fn start(&self) {
        let mut ticker = self.ticker.lock().unwrap_or_else(PoisonError::into_inner);
        if ticker.is_some() {
            debug!("Flush scheduler already running");
            return;
        }

        let cancel_token = CancellationToken::new();
        let handle = tokio::spawn(run_ticker(
            Arc::clone(&self.flusher),
            self.period,
            self.tracker.clone(),
            cancel_token.clone(),
        ));
        *ticker = Some(Ticker {
            cancel_token,
            handle,
        });
        info!("Flush scheduler started, interval {:?}", self.period);
    }

    /// Stops ticking and waits for passes already dispatched to finish. No
    /// tick fires once this returns. Does nothing if not running.
    pub async fn stop(&self) {
        let ticker = self
            .ticker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(ticker) = ticker else {
            return;
        };

        ticker.cancel_token.cancel();
        if let Err(err) = ticker.handle.await {
            error!("Flush scheduler ticker did not stop cleanly: {err}");
        }

        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
        info!("Flush scheduler stopped");
    }

    /// Stops the scheduler, then runs one last pass for every tenant.
    pub async fn shutdown(&self) -> FlushSummary {
        self.stop().await;
        debug!("Running final flush");
        self.flusher.flush_all().await
    }
}

async fn run_ticker(
    flusher: Arc<Flusher>,
    period: Duration,
    tracker: TaskTracker,
    cancel_token: CancellationToken,
) {
    let mut flush_interval = interval(period);
    flush_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    flush_interval.tick().await; // discard first tick

    loop {
        tokio::select! {
            biased;
            () = cancel_token.cancelled() => break,
            _ = flush_interval.tick() => flusher.dispatch(&tracker),
        }
    }
}
