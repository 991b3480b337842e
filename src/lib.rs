//! IQDB (www.iqdb.org / 3d.iqdb.org) 以圖搜圖客戶端
//!
//! 非同步入口為 [`SearchClient`]，同步入口為 [`BlockingSearchClient`]。

pub mod types;
pub mod error;
pub mod normalizer;
pub mod parser;
pub mod fetcher;
pub mod client;

pub use client::{BlockingSearchClient, CancelHandle, ClientConfig, SearchClient, SearchInfo, ServiceProfile};
pub use error::{Cancelled, ErrorKind, IqdbError, Result};
pub use normalizer::{ImageInput, MAX_FILE_SIZE, supported_image_formats};
pub use types::{Match, MatchKind, MoreResultsPointer, QueueStatus, Rating, Resolution, SearchResult, Source, YourImage};
