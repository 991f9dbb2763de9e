use std::{
    fmt,
    net::IpAddr,
    str::FromStr,
    sync::Arc,
    time::Duration,
};

use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use serde::Serialize;
use thiserror::Error;

use crate::context::RequestContext;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PolicyError {
    #[error("policy id must be non-empty and contain no whitespace, got {0:?}")]
    InvalidId(String),
    #[error("window duration must be greater than zero")]
    ZeroWindow,
    #[error("max requests must be greater than zero")]
    ZeroMaxRequests,
    #[error("token refill rate must be a positive finite number, got {0}")]
    InvalidRefillRate(f64),
    #[error("alert threshold must be within (0, 1], got {0}")]
    InvalidAlertThreshold(f64),
    #[error("store timeout must be greater than zero")]
    ZeroStoreTimeout,
    #[error("invalid address pattern {pattern:?}: {reason}")]
    InvalidAddressPattern { pattern: String, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    FixedWindow,
    SlidingWindow,
    TokenBucket,
}

impl Algorithm {
    pub const ALL: [Algorithm; 3] = [
        Algorithm::FixedWindow,
        Algorithm::SlidingWindow,
        Algorithm::TokenBucket,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FixedWindow => "fixed_window",
            Self::SlidingWindow => "sliding_window",
            Self::TokenBucket => "token_bucket",
        }
    }

    /// Suffix appended to a bucket key for this algorithm's state, so a
    /// policy reload that switches algorithm never reads a foreign type.
    pub fn key_suffix(&self) -> &'static str {
        match self {
            Self::FixedWindow => "fw",
            Self::SlidingWindow => "sw",
            Self::TokenBucket => "tb",
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Algorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "fixed_window" | "fixed" => Ok(Self::FixedWindow),
            "sliding_window" | "sliding" => Ok(Self::SlidingWindow),
            "token_bucket" | "bucket" => Ok(Self::TokenBucket),
            other => Err(format!("unsupported rate limit algorithm: {other}")),
        }
    }
}

pub type KeyFn = Arc<dyn Fn(&RequestContext) -> Option<String> + Send + Sync>;

#[derive(Clone)]
pub enum KeyStrategy {
    ByAddress,
    ByPrincipal,
    ByEndpoint,
    Custom(KeyFn),
}

impl fmt::Debug for KeyStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ByAddress => f.write_str("ByAddress"),
            Self::ByPrincipal => f.write_str("ByPrincipal"),
            Self::ByEndpoint => f.write_str("ByEndpoint"),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

impl FromStr for KeyStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ip" | "address" => Ok(Self::ByAddress),
            "user" | "principal" => Ok(Self::ByPrincipal),
            "endpoint" => Ok(Self::ByEndpoint),
            other => Err(format!("unsupported rate limit key strategy: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureMode {
    FailOpen,
    FailClosed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessCheck {
    Allowed,
    Denied,
    Continue,
}

/// Set of address patterns: single addresses or CIDR blocks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccessList {
    nets: Vec<IpNet>,
}

impl AccessList {
    pub fn parse<I, S>(patterns: I) -> Result<Self, PolicyError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut nets = Vec::new();
        for pattern in patterns {
            let pattern = pattern.as_ref().trim();
            if pattern.is_empty() {
                continue;
            }
            nets.push(parse_pattern(pattern)?);
        }
        Ok(Self { nets })
    }

    pub fn contains(&self, addr: IpAddr) -> bool {
        let addr = addr.to_canonical();
        self.nets.iter().any(|net| net.contains(&addr))
    }

    pub fn is_empty(&self) -> bool {
        self.nets.is_empty()
    }
}

fn parse_pattern(pattern: &str) -> Result<IpNet, PolicyError> {
    if let Ok(net) = pattern.parse::<IpNet>() {
        return Ok(net.trunc());
    }

    let invalid = |reason: String| PolicyError::InvalidAddressPattern {
        pattern: pattern.to_string(),
        reason,
    };

    let host = match pattern.parse::<IpAddr>() {
        Ok(IpAddr::V4(v4)) => Ipv4Net::new(v4, 32).map(IpNet::V4),
        Ok(IpAddr::V6(v6)) => Ipv6Net::new(v6, 128).map(IpNet::V6),
        Err(err) => return Err(invalid(err.to_string())),
    };
    host.map_err(|err| invalid(err.to_string()))
}

/// Immutable, validated rate-limit configuration.
///
/// Only obtainable through [`RateLimitPolicyBuilder::build`], so every
/// instance satisfies `window > 0` and `max_requests > 0`.
#[derive(Debug, Clone)]
pub struct RateLimitPolicy {
    id: String,
    window: Duration,
    max_requests: u64,
    algorithm: Algorithm,
    key_strategy: KeyStrategy,
    allow_list: AccessList,
    deny_list: AccessList,
    refill_rate: f64,
    failure_mode: FailureMode,
    store_timeout: Duration,
    alert_threshold: Option<f64>,
    message: String,
}

impl RateLimitPolicy {
    pub fn builder(id: impl Into<String>) -> RateLimitPolicyBuilder {
        RateLimitPolicyBuilder::new(id)
    }

    /// General purpose limit: 100 requests a minute per address, loopback
    /// exempt.
    pub fn standard(id: impl Into<String>) -> RateLimitPolicyBuilder {
        Self::builder(id).allow(["127.0.0.1", "::1"])
    }

    pub fn api() -> RateLimitPolicyBuilder {
        Self::builder("api")
            .window(Duration::from_secs(60))
            .max_requests(1_000)
            .key_strategy(KeyStrategy::ByPrincipal)
    }

    pub fn login() -> RateLimitPolicyBuilder {
        Self::builder("login")
            .window(Duration::from_secs(15 * 60))
            .max_requests(5)
            .key_strategy(KeyStrategy::ByAddress)
            .message("Too many login attempts, please try again in 15 minutes")
    }

    pub fn upload() -> RateLimitPolicyBuilder {
        Self::builder("upload")
            .window(Duration::from_secs(60))
            .max_requests(10)
            .key_strategy(KeyStrategy::ByPrincipal)
            .message("Too many uploads, please try again later")
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn max_requests(&self) -> u64 {
        self.max_requests
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    pub fn key_strategy(&self) -> &KeyStrategy {
        &self.key_strategy
    }

    /// Tokens per second; only meaningful for the token bucket.
    pub fn refill_rate(&self) -> f64 {
        self.refill_rate
    }

    pub fn failure_mode(&self) -> FailureMode {
        self.failure_mode
    }

    pub fn store_timeout(&self) -> Duration {
        self.store_timeout
    }

    pub fn alert_threshold(&self) -> Option<f64> {
        self.alert_threshold
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Deny-list wins over allow-list. A request without a known source
    /// address always continues to the algorithm.
    pub fn check(&self, source: Option<IpAddr>) -> AccessCheck {
        let Some(addr) = source else {
            return AccessCheck::Continue;
        };

        if self.deny_list.contains(addr) {
            AccessCheck::Denied
        } else if self.allow_list.contains(addr) {
            AccessCheck::Allowed
        } else {
            AccessCheck::Continue
        }
    }
}

#[derive(Debug, Clone)]
pub struct RateLimitPolicyBuilder {
    id: String,
    window: Duration,
    max_requests: u64,
    algorithm: Algorithm,
    key_strategy: KeyStrategy,
    allow: Vec<String>,
    deny: Vec<String>,
    refill_rate: Option<f64>,
    failure_mode: FailureMode,
    store_timeout: Duration,
    alert_threshold: Option<f64>,
    message: String,
}

impl RateLimitPolicyBuilder {
    fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            window: Duration::from_secs(60),
            max_requests: 100,
            algorithm: Algorithm::FixedWindow,
            key_strategy: KeyStrategy::ByAddress,
            allow: Vec::new(),
            deny: Vec::new(),
            refill_rate: None,
            failure_mode: FailureMode::FailOpen,
            store_timeout: Duration::from_millis(250),
            alert_threshold: Some(0.8),
            message: "Too many requests, please try again later".to_string(),
        }
    }

    pub fn window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    pub fn max_requests(mut self, max_requests: u64) -> Self {
        self.max_requests = max_requests;
        self
    }

    pub fn algorithm(mut self, algorithm: Algorithm) -> Self {
        self.algorithm = algorithm;
        self
    }

    pub fn key_strategy(mut self, key_strategy: KeyStrategy) -> Self {
        self.key_strategy = key_strategy;
        self
    }

    pub fn allow<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allow.extend(patterns.into_iter().map(Into::into));
        self
    }

    pub fn deny<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.deny.extend(patterns.into_iter().map(Into::into));
        self
    }

    /// Defaults to `max_requests / window` when unset.
    pub fn refill_rate(mut self, tokens_per_sec: f64) -> Self {
        self.refill_rate = Some(tokens_per_sec);
        self
    }

    pub fn failure_mode(mut self, failure_mode: FailureMode) -> Self {
        self.failure_mode = failure_mode;
        self
    }

    pub fn store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    pub fn alert_threshold(mut self, threshold: Option<f64>) -> Self {
        self.alert_threshold = threshold;
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn build(self) -> Result<RateLimitPolicy, PolicyError> {
        if self.id.is_empty() || self.id.chars().any(char::is_whitespace) {
            return Err(PolicyError::InvalidId(self.id));
        }
        if self.window.is_zero() {
            return Err(PolicyError::ZeroWindow);
        }
        if self.max_requests == 0 {
            return Err(PolicyError::ZeroMaxRequests);
        }
        if self.store_timeout.is_zero() {
            return Err(PolicyError::ZeroStoreTimeout);
        }

        let refill_rate = self
            .refill_rate
            .unwrap_or(self.max_requests as f64 / self.window.as_secs_f64());
        if !refill_rate.is_finite() || refill_rate <= 0.0 {
            return Err(PolicyError::InvalidRefillRate(refill_rate));
        }

        if let Some(threshold) = self.alert_threshold
            && !(threshold > 0.0 && threshold <= 1.0)
        {
            return Err(PolicyError::InvalidAlertThreshold(threshold));
        }

        Ok(RateLimitPolicy {
            allow_list: AccessList::parse(&self.allow)?,
            deny_list: AccessList::parse(&self.deny)?,
            id: self.id,
            window: self.window,
            max_requests: self.max_requests,
            algorithm: self.algorithm,
            key_strategy: self.key_strategy,
            refill_rate,
            failure_mode: self.failure_mode,
            store_timeout: self.store_timeout,
            alert_threshold: self.alert_threshold,
            message: self.message,
        })
    }
}
