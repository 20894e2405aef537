//! imbridge-attach: retrieves attachment binaries to local storage through
//! an ordered chain of fetch strategies, and ages out what it stored.

pub mod click;
pub mod direct;
pub mod error;
pub mod fetcher;
pub mod host_cache;
pub mod page_fetch;
pub mod strategy;

pub use click::ClickDownload;
pub use direct::DirectHttp;
pub use error::{AttachmentError, StrategyError};
pub use fetcher::AttachmentFetcher;
pub use host_cache::HostCache;
pub use page_fetch::PageFetch;
pub use strategy::{FetchRequest, FetchStrategy, local_file_name, sanitize_file_name};
