//! Credential wrapper for upstream API keys

use std::fmt;
use zeroize::Zeroize;

/// Upstream API key - redacted in Debug/Display/logs
pub struct ApiKey(String);

impl ApiKey {
    /// Wrap a raw key
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Expose the raw key (request construction only)
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Last four characters, enough to tell keys apart in logs
    pub fn last4(&self) -> &str {
        let start = self
            .0
            .char_indices()
            .rev()
            .nth(3)
            .map(|(i, _)| i)
            .unwrap_or(0);
        &self.0[start..]
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl fmt::Display for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl Drop for ApiKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl Clone for ApiKey {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}
