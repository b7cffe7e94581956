//! Case-insensitive routing.

use std::sync::Arc;

use biplex_core::Status;

use crate::context::ReadCtx;
use crate::plugin::Plugin;

/// Lowercases incoming service methods before routing, so `/HoMe/TesT`
/// reaches a handler registered as `/home/test`.
pub fn ignore_case() -> Arc<dyn Plugin> {
    Arc::new(IgnoreCase)
}

struct IgnoreCase;

impl Plugin for IgnoreCase {
    fn name(&self) -> &'static str {
        "ignoreCase"
    }

    fn post_read_call_header(&self, ctx: &mut ReadCtx<'_>) -> Result<(), Status> {
        let lowered = ctx.service_method().to_lowercase();
        ctx.reset_service_method(lowered);
        Ok(())
    }

    fn post_read_push_header(&self, ctx: &mut ReadCtx<'_>) -> Result<(), Status> {
        let lowered = ctx.service_method().to_lowercase();
        ctx.reset_service_method(lowered);
        Ok(())
    }
}
