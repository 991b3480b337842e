// 子模組
pub mod config;
pub mod coordinator;
pub mod engine;
pub mod blocking;

// 重新導出
pub use config::{ClientConfig, DownloadPolicy, PayloadOptions, ServiceProfile};
pub use coordinator::{Coordinator, RateLimiter};
pub use engine::{CancelHandle, SearchClient, SearchInfo};
pub use blocking::BlockingSearchClient;
