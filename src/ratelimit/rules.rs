//! Rate limit rules and limit resolution.
//!
//! A request is limited either by its client IP or, when it presents a
//! configured token, by that token. Working out which one applies is a pure
//! function of the configuration, kept apart from the stateful check.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use crate::error::{Result, TurnstileError};

fn default_ip_requests_per_second() -> u64 {
    5
}

fn default_ip_block_duration_minutes() -> u64 {
    5
}

/// Per-IP defaults plus per-token overrides.
///
/// Read-only once built; share it behind an `Arc`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Requests allowed per second for a client IP
    #[serde(default = "default_ip_requests_per_second")]
    pub ip_requests_per_second: u64,

    /// How long an IP stays blocked after exceeding its limit
    #[serde(default = "default_ip_block_duration_minutes")]
    pub ip_block_duration_minutes: u64,

    /// Limits for specific access tokens, keyed by token
    #[serde(default)]
    pub token_limits: HashMap<String, TokenLimit>,
}

/// Limit applied to requests presenting a specific token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenLimit {
    pub requests_per_second: u64,
    #[serde(default)]
    pub block_duration_minutes: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            ip_requests_per_second: default_ip_requests_per_second(),
            ip_block_duration_minutes: default_ip_block_duration_minutes(),
            token_limits: HashMap::new(),
        }
    }
}

/// The store key a request is counted and blocked under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LimitKey<'a> {
    Ip(&'a str),
    Token(&'a str),
}

impl<'a> LimitKey<'a> {
    pub fn as_str(&self) -> &'a str {
        match *self {
            LimitKey::Ip(key) | LimitKey::Token(key) => key,
        }
    }

    pub fn kind(&self) -> &'static str {
        match *self {
            LimitKey::Ip(_) => "ip",
            LimitKey::Token(_) => "token",
        }
    }
}

impl fmt::Display for LimitKey<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind(), self.as_str())
    }
}

/// The key and thresholds that govern one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedLimit<'a> {
    pub key: LimitKey<'a>,
    pub requests_per_second: u64,
    pub block_duration: Duration,
}

fn minutes(n: u64) -> Duration {
    Duration::from_secs(n.saturating_mul(60))
}

impl RateLimitConfig {
    /// Create a configuration with the given IP limits and no tokens.
    pub fn new(ip_requests_per_second: u64, ip_block_duration_minutes: u64) -> Self {
        Self {
            ip_requests_per_second,
            ip_block_duration_minutes,
            token_limits: HashMap::new(),
        }
    }

    /// Add or replace the limit for `token`.
    pub fn with_token(
        mut self,
        token: impl Into<String>,
        requests_per_second: u64,
        block_duration_minutes: u64,
    ) -> Self {
        self.token_limits.insert(
            token.into(),
            TokenLimit {
                requests_per_second,
                block_duration_minutes,
            },
        );
        self
    }

    /// Reject limits that would deny every request.
    pub fn validate(&self) -> Result<()> {
        if self.ip_requests_per_second == 0 {
            return Err(TurnstileError::InvalidConfiguration(
                "ip_requests_per_second must be greater than zero".to_string(),
            ));
        }

        for (token, limit) in &self.token_limits {
            if token.is_empty() {
                return Err(TurnstileError::InvalidConfiguration(
                    "token limits must not use an empty token".to_string(),
                ));
            }
            if limit.requests_per_second == 0 {
                return Err(TurnstileError::InvalidConfiguration(format!(
                    "requests_per_second for token '{}' must be greater than zero",
                    token
                )));
            }
        }

        Ok(())
    }

    /// Pick the limit for a request.
    ///
    /// A configured token is limited by its own thresholds. An empty or
    /// unrecognized token falls back to the IP limits, keyed by IP.
    pub fn resolve<'a>(&self, ip: &'a str, token: &'a str) -> ResolvedLimit<'a> {
        if !token.is_empty() {
            if let Some(limit) = self.token_limits.get(token) {
                return ResolvedLimit {
                    key: LimitKey::Token(token),
                    requests_per_second: limit.requests_per_second,
                    block_duration: minutes(limit.block_duration_minutes),
                };
            }
        }

        ResolvedLimit {
            key: LimitKey::Ip(ip),
            requests_per_second: self.ip_requests_per_second,
            block_duration: minutes(self.ip_block_duration_minutes),
        }
    }
}
