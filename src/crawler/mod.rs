//! Crawler engine: the composition of frontier, pools, and events.

pub mod core;
pub mod handlers;

pub use self::core::{Crawler, CrawlerBuilder, CrawlerStats};
pub use handlers::{
    CrawlingContext, FailedRequestContext, HandleFailedRequestFn, HandleRequestFn, HandlerResult,
    default_failed_request_handler,
};
