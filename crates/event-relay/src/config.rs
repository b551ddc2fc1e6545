// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::api_key::ApiKey;
use crate::constants;
use crate::errors::ConfigError;
use crate::flusher::FlusherConfig;
use std::env;
use std::str::FromStr;
use std::time::Duration;

const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Characters Redis treats as glob syntax in key patterns.
const GLOB_CHARS: &[char] = &['*', '?', '[', ']', '\\'];

/// Configuration for the relay
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Collector every batch is posted to. Flushing is skipped while unset.
    pub upstream_url: Option<String>,
    /// Tenant used for intake requests that carry no `api_key`
    pub api_key: Option<String>,
    /// Flush period, also the length of every rate window
    pub flush_interval: Duration,
    pub max_body_size: usize,
    pub max_requests_per_window: u32,
    /// Consecutive failures before a batch is dead-lettered, 0 for never
    pub max_consecutive_failures: u32,
    pub request_timeout: Duration,
    pub host: String,
    pub port: u16,
    pub max_request_content_length: usize,
    pub queue_prefix: String,
    /// Redis connection URL; the in-memory store is used when unset
    pub redis_url: Option<String>,
    /// HTTPS proxy URL
    pub https_proxy: Option<String>,
    /// Log level (e.g., trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            upstream_url: None,
            api_key: None,
            flush_interval: constants::DEFAULT_FLUSH_INTERVAL,
            max_body_size: constants::DEFAULT_MAX_BODY_SIZE,
            max_requests_per_window: constants::DEFAULT_MAX_REQUESTS_PER_WINDOW,
            max_consecutive_failures: constants::DEFAULT_MAX_CONSECUTIVE_FAILURES,
            request_timeout: constants::DEFAULT_REQUEST_TIMEOUT,
            host: constants::DEFAULT_INTAKE_HOST.to_string(),
            port: constants::DEFAULT_INTAKE_PORT,
            max_request_content_length: constants::DEFAULT_MAX_REQUEST_CONTENT_LENGTH,
            queue_prefix: constants::DEFAULT_QUEUE_PREFIX.to_string(),
            redis_url: None,
            https_proxy: None,
            log_level: "info".to_string(),
        }
    }
}

impl RelayConfig {
    /// Create configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Create configuration from an arbitrary variable source. Blank values
    /// count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            lookup(name)
                .map(|val| val.trim().to_string())
                .filter(|val| !val.is_empty())
        };
        let defaults = Self::default();

        let config = Self {
            upstream_url: get("RELAY_UPSTREAM_URL"),
            api_key: get("RELAY_API_KEY"),
            flush_interval: parse(&get, "RELAY_FLUSH_INTERVAL_MS")?
                .map_or(defaults.flush_interval, Duration::from_millis),
            max_body_size: parse(&get, "RELAY_MAX_BODY_SIZE")?.unwrap_or(defaults.max_body_size),
            max_requests_per_window: parse(&get, "RELAY_MAX_REQUESTS_PER_SECOND")?
                .unwrap_or(defaults.max_requests_per_window),
            max_consecutive_failures: parse(&get, "RELAY_MAX_CONSECUTIVE_FAILURES")?
                .unwrap_or(defaults.max_consecutive_failures),
            request_timeout: parse(&get, "RELAY_REQUEST_TIMEOUT_MS")?
                .map_or(defaults.request_timeout, Duration::from_millis),
            host: get("RELAY_HOST").unwrap_or(defaults.host),
            port: parse(&get, "RELAY_PORT")?.unwrap_or(defaults.port),
            max_request_content_length: parse(&get, "RELAY_MAX_REQUEST_CONTENT_LENGTH")?
                .unwrap_or(defaults.max_request_content_length),
            queue_prefix: get("RELAY_QUEUE_PREFIX").unwrap_or(defaults.queue_prefix),
            redis_url: get("RELAY_REDIS_URL"),
            https_proxy: get("RELAY_PROXY_HTTPS").or_else(|| get("HTTPS_PROXY")),
            log_level: get("RELAY_LOG_LEVEL")
                .map(|val| val.to_lowercase())
                .unwrap_or(defaults.log_level),
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.flush_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "flush interval must be greater than 0".to_string(),
            ));
        }
        if self.max_body_size == 0 {
            return Err(ConfigError::Invalid(
                "max body size must be greater than 0".to_string(),
            ));
        }
        if self.max_requests_per_window == 0 {
            return Err(ConfigError::Invalid(
                "max requests per second must be greater than 0".to_string(),
            ));
        }
        if self.port == 0 {
            return Err(ConfigError::Invalid(
                "port must be greater than 0".to_string(),
            ));
        }
        if self.queue_prefix.contains(char::is_whitespace) {
            return Err(ConfigError::Invalid(
                "queue prefix cannot contain whitespace".to_string(),
            ));
        }
        // The prefix ends up in a Redis `SCAN MATCH` pattern.
        if self.queue_prefix.contains(GLOB_CHARS) {
            return Err(ConfigError::Invalid(format!(
                "queue prefix '{}' cannot contain any of {:?}",
                self.queue_prefix, GLOB_CHARS
            )));
        }

        if let Some(url) = &self.upstream_url {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(ConfigError::Invalid(format!(
                    "upstream URL '{url}' must start with http:// or https://"
                )));
            }
        }

        if !VALID_LOG_LEVELS.contains(&self.log_level.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
                self.log_level
            )));
        }

        Ok(())
    }

    pub fn default_api_key(&self) -> Option<ApiKey> {
        self.api_key.as_deref().and_then(ApiKey::new)
    }

    pub fn flusher_config(&self) -> FlusherConfig {
        FlusherConfig {
            max_body_size: self.max_body_size,
            rate_window: self.flush_interval,
            max_requests_per_window: self.max_requests_per_window,
            max_consecutive_failures: self.max_consecutive_failures,
        }
    }

    pub fn intake_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse<T, G>(get: &G, name: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    G: Fn(&str) -> Option<String>,
{
    get(name)
        .map(|val| {
            val.parse::<T>()
                .map_err(|_| ConfigError::Invalid(format!("{name} has an invalid value '{val}'")))
        })
        .transpose()
}
