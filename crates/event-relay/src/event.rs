// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Event payloads and their queued representation.

use crate::api_key::ApiKey;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// An analytics event. The relay never looks inside `data`; only the
/// serialized size of the event matters for batching.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub data: Map<String, Value>,
}

impl Event {
    pub fn new(event_type: impl Into<String>, data: Map<String, Value>) -> Self {
        Self {
            event_type: event_type.into(),
            data,
        }
    }
}

/// The unit persisted in the queue store: an event attributed to its tenant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedItem {
    pub api_key: ApiKey,
    pub event: Event,
}

impl QueuedItem {
    pub fn new(api_key: ApiKey, event: Event) -> Self {
        Self { api_key, event }
    }

    /// Compact JSON form written to the queue store.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn decode(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}
