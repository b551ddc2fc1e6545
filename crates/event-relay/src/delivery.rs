// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::api_key::ApiKey;
use crate::errors::{ConfigError, DeliveryError};
use crate::event::Event;
use reqwest::header::CONTENT_TYPE;
use serde::Serialize;
use tracing::{debug, warn};

/// Body of one outbound request.
#[derive(Serialize)]
struct Payload<'a> {
    api_key: &'a str,
    events: &'a [Event],
}

#[derive(Debug)]
pub enum DeliveryOutcome {
    Success,
    Failure(DeliveryError),
}

impl DeliveryOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, DeliveryOutcome::Success)
    }
}

/// Posts batches to the upstream collector.
#[derive(Clone)]
pub struct DeliveryClient {
    client: reqwest::Client,
    url: Option<String>,
}

impl DeliveryClient {
    pub fn new(client: reqwest::Client, url: Option<String>) -> Self {
        Self { client, url }
    }

    pub fn url(&self) -> Result<&str, ConfigError> {
        self.url
            .as_deref()
            .ok_or(ConfigError::Missing("RELAY_UPSTREAM_URL"))
    }

    /// Bytes the request body adds around the serialized event array for
    /// `api_key`.
    pub fn envelope_overhead(api_key: &ApiKey) -> Result<usize, serde_json::Error> {
        let empty = serde_json::to_vec(&Payload {
            api_key: api_key.as_str(),
            events: &[],
        })?;
        Ok(empty.len() - 2)
    }

    /// Sends `events` in a single request. Any 2xx is a success; every other
    /// status and every transport error is a failure.
    pub async fn deliver(&self, api_key: &ApiKey, events: &[Event]) -> DeliveryOutcome {
        let url = match self.url() {
            Ok(url) => url,
            Err(err) => return DeliveryOutcome::Failure(err.into()),
        };
        let body = match serde_json::to_vec(&Payload {
            api_key: api_key.as_str(),
            events,
        }) {
            Ok(body) => body,
            Err(err) => return DeliveryOutcome::Failure(err.into()),
        };
        let bytes = body.len();

        let result = self
            .client
            .post(url)
            .basic_auth(api_key.as_str(), None::<&str>)
            .header(CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await;

        match result {
            Ok(response) if response.status().is_success() => {
                debug!(
                    "Delivered {} events ({} bytes) for tenant {}",
                    events.len(),
                    bytes,
                    api_key
                );
                DeliveryOutcome::Success
            }
            Ok(response) => {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                warn!(
                    "Failed to deliver {} events ({} bytes) for tenant {}: {}",
                    events.len(),
                    bytes,
                    api_key,
                    status
                );
                DeliveryOutcome::Failure(DeliveryError::Status { status, body })
            }
            Err(err) => {
                warn!(
                    "Failed to deliver {} events ({} bytes) for tenant {}: {}",
                    events.len(),
                    bytes,
                    api_key,
                    err
                );
                DeliveryOutcome::Failure(DeliveryError::Transport(err))
            }
        }
    }
}
