// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use reqwest::StatusCode;

/// Errors raised by a [`crate::queue_store::QueueStore`] backend.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Queue store unavailable: {0}")]
    Unavailable(String),

    #[error("Failed to encode queued item: {0}")]
    Encode(#[from] serde_json::Error),
}

impl From<redis::RedisError> for QueueError {
    fn from(err: redis::RedisError) -> Self {
        QueueError::Unavailable(err.to_string())
    }
}

/// Errors found while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("{0} is not configured")]
    Missing(&'static str),
}

/// Reasons a delivery attempt did not succeed.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("Collector responded with {status}: {body}")]
    Status { status: StatusCode, body: String },

    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Failed to encode payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Errors returned to callers of the intake endpoint.
#[derive(Debug, thiserror::Error)]
pub enum IntakeError {
    #[error("Invalid request body: {0}")]
    InvalidBody(String),

    #[error("`events` must be a non-empty array of events")]
    InvalidEvents,

    #[error("Missing api_key")]
    MissingApiKey,

    #[error(transparent)]
    Queue(#[from] QueueError),
}
