//! Rate-limiting HTTP gateway.
//!
//! Requests pass through a middleware chain ([`gateway::Gateway`]) whose
//! core stage is the decision pipeline in [`ratelimit`]: key resolution,
//! allow/deny lists, one of three admission algorithms evaluated against a
//! shared [`store::CounterStore`], and fire-and-forget observability.

pub mod clock;
pub mod config;
pub mod context;
pub mod error;
pub mod gateway;
pub mod middleware;
pub mod ratelimit;
pub mod server;
pub mod store;
pub mod upstream;

use tracing_subscriber::EnvFilter;

use crate::config::LogFormat;

pub fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,hyper=warn,reqwest=warn"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Compact => builder.compact().init(),
    }
}
