use crate::{
    context::RequestContext,
    ratelimit::policy::{KeyStrategy, RateLimitPolicy},
};

/// Resolved key used when the strategy's source is missing.
pub const UNKNOWN_KEY: &str = "unknown";

/// Derives the per-client part of a bucket key. Never fails and never
/// returns an empty string.
pub fn resolve_key(ctx: &RequestContext, policy: &RateLimitPolicy) -> String {
    let resolved = match policy.key_strategy() {
        KeyStrategy::ByAddress => ctx.client_ip.map(|ip| format!("ip:{ip}")),
        KeyStrategy::ByPrincipal => ctx
            .principal
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(|p| format!("user:{p}")),
        KeyStrategy::ByEndpoint => Some(format!("endpoint:{}:{}", ctx.method, ctx.uri.path())),
        KeyStrategy::Custom(extract) => extract(ctx),
    };

    resolved
        .filter(|key| !key.trim().is_empty())
        .unwrap_or_else(|| UNKNOWN_KEY.to_string())
}

pub fn bucket_key(policy: &RateLimitPolicy, resolved: &str) -> String {
    format!("{}:{}", policy.id(), resolved)
}
