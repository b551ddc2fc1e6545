// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Default limits and intervals for the relay.

use std::time::Duration;

/// Period of the flush scheduler, and the length of every rate window.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(1_000);

/// Maximum size in bytes of one outbound request body.
pub const DEFAULT_MAX_BODY_SIZE: usize = 1_000_000;

/// Maximum delivery attempts per rate window, per tenant and across the process.
pub const DEFAULT_MAX_REQUESTS_PER_WINDOW: u32 = 100;

/// Consecutive failed deliveries after which a tenant's head batch is dead-lettered.
///
/// `0` disables the ceiling and retries forever.
pub const DEFAULT_MAX_CONSECUTIVE_FAILURES: u32 = 50;

/// Timeout for one outbound delivery request.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Largest inbound request body the intake accepts.
pub const DEFAULT_MAX_REQUEST_CONTENT_LENGTH: usize = 5 * 1_024 * 1_024;

pub const DEFAULT_INTAKE_HOST: &str = "0.0.0.0";
pub const DEFAULT_INTAKE_PORT: u16 = 8080;

/// Prefix of every key the relay writes to the queue store.
pub const DEFAULT_QUEUE_PREFIX: &str = "event-relay";

pub const EVENTS_ENDPOINT_PATH: &str = "/v1/events";
pub const INFO_ENDPOINT_PATH: &str = "/info";
