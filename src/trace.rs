//! Begin/end markers around public entry points.
//!
//! Every API call runs inside a `tracing` span named after the call and emits a
//! `begin` event on entry and an `end` event carrying the numeric result code.
//! Nothing here influences control flow.

use crate::error::{ResultCode, UmdResult};
use tracing::{Level, span, trace};

/// Runs `f` between structured begin/end markers for the API entry `name`.
#[inline]
pub fn api_call<T>(name: &'static str, f: impl FnOnce() -> UmdResult<T>) -> UmdResult<T> {
    let span = span!(Level::TRACE, "api", call = name);
    let _entered = span.enter();
    trace!(call = name, "begin");
    let result = f();
    let code = match &result {
        Ok(_) => ResultCode::Success,
        Err(e) => e.code(),
    };
    trace!(call = name, code = code as u32, "end");
    result
}
