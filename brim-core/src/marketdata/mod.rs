//! Market data: freshness-aware cache, snapshot types, stream consumers.

pub mod cache;
pub mod feed;
pub mod types;

pub use cache::MdCache;
pub use feed::FeedStatus;
pub use types::{BookSnapshot, CacheHit, CacheMode, CacheResult, DepthLevel};
