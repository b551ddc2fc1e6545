// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Multi-tenant analytics event relay.
//!
//! Events arrive on the intake endpoint, are appended to a per-tenant queue in
//! a [`queue_store::QueueStore`], and are periodically packed into size-bounded
//! batches and delivered to a single upstream collector.
//!
//! ```text
//!   intake ──► queue store ──► flusher ──► delivery ──► collector
//!                  ▲              │
//!                  └── re-queue ◄─┘ (on failure)
//! ```

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod api_key;
pub mod batch;
pub mod config;
pub mod constants;
pub mod delivery;
pub mod errors;
pub mod event;
pub mod flusher;
pub mod http_utils;
pub mod intake;
pub mod queue_store;
pub mod rate_limiter;
pub mod scheduler;
pub mod tenant;
