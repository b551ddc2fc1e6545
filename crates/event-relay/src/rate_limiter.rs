// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Fixed-window request counting.
//!
//! The limiter itself is stateless; each caller owns a [`WindowState`] so the
//! same policy can be applied per tenant and across the whole process.

use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
pub struct WindowState {
    requests_in_window: u32,
    window_started_at: Instant,
}

impl WindowState {
    pub fn new(now: Instant) -> Self {
        Self {
            requests_in_window: 0,
            window_started_at: now,
        }
    }
}

impl Default for WindowState {
    fn default() -> Self {
        Self::new(Instant::now())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RateLimiter {
    window: Duration,
    max_requests: u32,
}

impl RateLimiter {
    pub fn new(window: Duration, max_requests: u32) -> Self {
        Self {
            window,
            max_requests,
        }
    }

    /// Starts a new window in `state` once `window` has elapsed since the
    /// current one began.
    fn roll(&self, state: &mut WindowState, now: Instant) {
        if now.saturating_duration_since(state.window_started_at) >= self.window {
            state.window_started_at = now;
            state.requests_in_window = 0;
        }
    }

    /// Whether one more request fits in the current window. Rolls the window
    /// but does not count anything.
    pub fn has_capacity(&self, state: &mut WindowState, now: Instant) -> bool {
        self.roll(state, now);
        state.requests_in_window < self.max_requests
    }

    /// Counts one request against the current window.
    pub fn record(&self, state: &mut WindowState, now: Instant) {
        self.roll(state, now);
        state.requests_in_window = state.requests_in_window.saturating_add(1);
    }
}
