pub mod downloader;
pub mod error;
pub mod fetch;
pub mod hls;
pub mod store;
pub mod task;
pub mod util;

pub use downloader::{OfflineDownloader, OfflineDownloaderBuilder};
pub use error::{HozonError, HozonResult};
pub use fetch::{RetryPolicy, SegmentFetcher};
pub use task::{output_file_name, DownloadTask, TaskStatus};
pub use util::http::HttpClient;
