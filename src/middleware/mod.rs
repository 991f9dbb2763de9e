pub mod logging;
pub mod login_guard;
pub mod rate_limit;

use async_trait::async_trait;
use axum::{
    body::Body,
    response::Response,
};

use crate::{
    context::RequestContext,
    error::GatewayResult,
};

pub enum ControlFlow {
    Continue,
    ShortCircuit(Response<Body>),
}

/// One stage of the gateway chain. `on_response` hooks run in reverse
/// order, and only for stages whose `on_request` let the request through.
#[async_trait]
pub trait GatewayMiddleware: Send + Sync {
    fn name(&self) -> &'static str;

    async fn on_request(&self, ctx: &mut RequestContext) -> GatewayResult<ControlFlow>;

    async fn on_response(
        &self,
        _ctx: &RequestContext,
        _response: &mut Response<Body>,
    ) -> GatewayResult<()> {
        Ok(())
    }
}
