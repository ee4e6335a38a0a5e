//! User-facing handler contracts.
//!
//! Both handlers collapse to a single result-returning asynchronous
//! contract; fire-and-forget callers simply ignore the result.

use std::sync::Arc;

use anyhow::Result;

use crate::autoscaling::BoxFuture;
use crate::browser::PageHandle;
use crate::request::Request;
use crate::session::SessionHandle;

/// What a successful handler hands back to the engine.
#[derive(Debug, Clone, Default)]
pub struct HandlerResult {
    /// Final URL after redirects; recorded on the request before it is
    /// marked handled.
    pub loaded_url: Option<String>,
}

/// Everything a handler gets for one request.
///
/// The request is a working copy: retry bookkeeping lives in the engine's
/// own copy, so handlers can inspect freely without retaining it. The
/// page (when a browser pool is attached) is shared with the engine,
/// which recycles it after the handler settles.
#[derive(Clone)]
pub struct CrawlingContext {
    pub request: Request,
    pub session: Option<SessionHandle>,
    pub page: Option<Arc<PageHandle>>,
}

/// Context delivered to the failure handler after the retry budget is
/// exhausted.
#[derive(Clone)]
pub struct FailedRequestContext {
    /// The request, with its full `error_messages` history
    pub request: Request,
    /// The last error, verbatim
    pub error: String,
}

/// Processes one request; an `Err` counts against the retry budget.
pub type HandleRequestFn =
    Arc<dyn Fn(CrawlingContext) -> BoxFuture<Result<HandlerResult>> + Send + Sync>;

/// Invoked once per request whose retries are exhausted (or which opted
/// out of retrying). An `Err` here puts the crawler into an unknown state
/// and terminates the run.
pub type HandleFailedRequestFn =
    Arc<dyn Fn(FailedRequestContext) -> BoxFuture<Result<()>> + Send + Sync>;

/// Default failure handler: log at error level, nothing else.
#[must_use]
pub fn default_failed_request_handler() -> HandleFailedRequestFn {
    Arc::new(|context: FailedRequestContext| {
        Box::pin(async move {
            log::error!(
                "request {} failed after {} retries: {}",
                context.request.url,
                context.request.retry_count,
                context.error
            );
            Ok(())
        })
    })
}
