// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};
use std::fmt::{self, Debug, Display};

/// Number of characters left visible at each end of a redacted key.
const VISIBLE_CHARS: usize = 4;

/// A tenant credential.
///
/// The key is the only thing identifying a tenant, so it is printed redacted
/// everywhere: both `Display` and `Debug` go through [`ApiKey::redacted`].
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ApiKey(String);

impl ApiKey {
    /// Returns `None` for keys that are empty after trimming.
    pub fn new(api_key: &str) -> Option<Self> {
        let trimmed = api_key.trim();
        if trimmed.is_empty() {
            return None;
        }
        Some(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Keeps a short prefix and suffix and masks the rest. Keys too short to
    /// keep anything meaningful hidden are masked entirely.
    pub fn redacted(&self) -> String {
        let chars: Vec<char> = self.0.chars().collect();
        if chars.len() <= VISIBLE_CHARS * 3 {
            return "*".repeat(chars.len());
        }
        let prefix: String = chars[..VISIBLE_CHARS].iter().collect();
        let suffix: String = chars[chars.len() - VISIBLE_CHARS..].iter().collect();
        format!(
            "{prefix}{}{suffix}",
            "*".repeat(chars.len() - VISIBLE_CHARS * 2)
        )
    }
}

impl Display for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.redacted())
    }
}

impl Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ApiKey({})", self.redacted())
    }
}
