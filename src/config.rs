use anyhow::{Context, Result, anyhow};
use axum::http::HeaderName;
use std::{
    env,
    net::SocketAddr,
    str::FromStr,
    time::Duration,
};

use crate::{
    middleware::login_guard::LoginGuardConfig,
    ratelimit::{Algorithm, FailureMode, KeyStrategy, RateLimitPolicy},
};

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub bind_addr: SocketAddr,
    pub upstream: UpstreamConfig,
    pub max_body_bytes: usize,
    pub trust_forwarded_for: bool,
    pub principal_header: HeaderName,
    pub rate_limit: RateLimitConfig,
    pub login_guard: Option<LoginGuardConfig>,
    pub log_format: LogFormat,
}

#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    pub base_url: String,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub backend: RateLimitBackendConfig,
    /// Already validated; a bad value aborts startup.
    pub policy: RateLimitPolicy,
    pub alert_webhook: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimitBackendConfig {
    InMemory,
    Redis { url: String, key_prefix: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Compact,
    Json,
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the configuration from any variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let vars = Vars(&lookup);

        let bind_addr = vars
            .string("BIND_ADDR", "0.0.0.0:8080")
            .parse::<SocketAddr>()
            .context("invalid BIND_ADDR")?;

        let upstream = UpstreamConfig {
            base_url: vars
                .string("UPSTREAM_URL", "http://127.0.0.1:9001")
                .trim_end_matches('/')
                .to_string(),
            timeout_ms: vars.at_least("UPSTREAM_TIMEOUT_MS", 3_000, 100)?,
        };
        if upstream.base_url.is_empty() {
            return Err(anyhow!("UPSTREAM_URL must not be empty"));
        }

        let store_timeout = Duration::from_millis(vars.parse("RATE_LIMIT_STORE_TIMEOUT_MS", 250u64)?);
        let rate_limit = RateLimitConfig {
            enabled: vars.parse("RATE_LIMIT_ENABLED", true)?,
            backend: backend(&vars)?,
            policy: policy(&vars, store_timeout)?,
            alert_webhook: vars.optional("ALERT_WEBHOOK_URL"),
        };

        let login_guard = if vars.parse("LOGIN_GUARD_ENABLED", true)? {
            Some(LoginGuardConfig {
                path: vars.string("LOGIN_PATH", "/api/auth/login"),
                max_failures: vars.at_least("LOGIN_MAX_FAILURES", 5, 1)?,
                window: Duration::from_secs(vars.at_least("LOGIN_WINDOW_SECONDS", 900, 1)?),
                store_timeout,
            })
        } else {
            None
        };

        let log_format = match vars.string("LOG_FORMAT", "compact").to_ascii_lowercase().as_str() {
            "json" => LogFormat::Json,
            "compact" | "text" => LogFormat::Compact,
            other => return Err(anyhow!("unsupported LOG_FORMAT: {other}")),
        };

        let principal_header = vars.string("PRINCIPAL_HEADER", "x-user-id");
        let principal_header = HeaderName::from_bytes(principal_header.as_bytes())
            .with_context(|| format!("invalid PRINCIPAL_HEADER: {principal_header}"))?;

        Ok(Self {
            bind_addr,
            upstream,
            max_body_bytes: vars.parse("MAX_BODY_BYTES", 1_048_576usize)?,
            trust_forwarded_for: vars.parse("TRUST_FORWARDED_FOR", false)?,
            principal_header,
            rate_limit,
            login_guard,
            log_format,
        })
    }
}

fn backend(vars: &Vars<'_>) -> Result<RateLimitBackendConfig> {
    match vars.string("RATE_LIMIT_BACKEND", "memory").to_ascii_lowercase().as_str() {
        "memory" | "in_memory" => Ok(RateLimitBackendConfig::InMemory),
        "redis" => Ok(RateLimitBackendConfig::Redis {
            url: vars.string("REDIS_URL", "redis://127.0.0.1:6379"),
            key_prefix: vars.string("REDIS_KEY_PREFIX", "ratelimit"),
        }),
        other => Err(anyhow!("unsupported RATE_LIMIT_BACKEND: {other}")),
    }
}

fn policy(vars: &Vars<'_>, store_timeout: Duration) -> Result<RateLimitPolicy> {
    let algorithm = vars
        .string("RATE_LIMIT_ALGORITHM", "fixed_window")
        .parse::<Algorithm>()
        .map_err(|err| anyhow!(err))
        .context("invalid RATE_LIMIT_ALGORITHM")?;
    let key_strategy = vars
        .string("RATE_LIMIT_KEY_STRATEGY", "ip")
        .parse::<KeyStrategy>()
        .map_err(|err| anyhow!(err))
        .context("invalid RATE_LIMIT_KEY_STRATEGY")?;
    let failure_mode = if vars.parse("RATE_LIMIT_FAIL_OPEN", true)? {
        FailureMode::FailOpen
    } else {
        FailureMode::FailClosed
    };
    let alert_threshold = match vars.optional("RATE_LIMIT_ALERT_THRESHOLD").as_deref() {
        None => Some(0.8),
        Some("off" | "none") => None,
        Some(raw) => Some(
            raw.parse::<f64>()
                .context("invalid RATE_LIMIT_ALERT_THRESHOLD")?,
        ),
    };

    let mut builder = RateLimitPolicy::builder(vars.string("RATE_LIMIT_POLICY_ID", "default"))
        .algorithm(algorithm)
        .window(Duration::from_secs(vars.parse("RATE_LIMIT_WINDOW_SECONDS", 60u64)?))
        .max_requests(vars.parse("RATE_LIMIT_MAX_REQUESTS", 100u64)?)
        .key_strategy(key_strategy)
        .allow(csv(&vars.string("RATE_LIMIT_ALLOW_LIST", "127.0.0.1,::1")))
        .deny(csv(&vars.string("RATE_LIMIT_DENY_LIST", "")))
        .failure_mode(failure_mode)
        .store_timeout(store_timeout)
        .alert_threshold(alert_threshold);

    if let Some(raw) = vars.optional("RATE_LIMIT_REFILL_TPS") {
        builder = builder.refill_rate(raw.parse().context("invalid RATE_LIMIT_REFILL_TPS")?);
    }

    builder.build().context("invalid rate limit policy")
}

/// Typed access to a variable source. Unset or blank means "use default";
/// a set but unparsable value is an error.
struct Vars<'a>(&'a dyn Fn(&str) -> Option<String>);

impl Vars<'_> {
    fn optional(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn string(&self, key: &str, default: &str) -> String {
        self.optional(key).unwrap_or_else(|| default.to_string())
    }

    fn parse<T>(&self, key: &str, default: T) -> Result<T>
    where
        T: FromStr,
        T::Err: std::error::Error + Send + Sync + 'static,
    {
        match self.optional(key) {
            None => Ok(default),
            Some(raw) => raw.parse::<T>().with_context(|| format!("invalid {key}: {raw}")),
        }
    }
}

impl Vars<'_> {
    fn at_least(&self, key: &str, default: u64, min: u64) -> Result<u64> {
        let value = self.parse(key, default)?;
        if value < min {
            return Err(anyhow!("{key} must be at least {min}, got {value}"));
        }
        Ok(value)
    }
}

fn csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .collect()
}
