pub(crate) mod archive;
pub(crate) mod chunked;
pub(crate) mod dash;
pub(crate) mod encryption;
pub(crate) mod hls;

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;

use crate::structs::{DownloadOptions, RetryPolicy};
use crate::VideoError;

pub use archive::DownloadArchive;
pub use hls::{HlsStream, HlsStreamOptions};

/// Byte-chunk pull interface for in-memory streaming.
#[async_trait]
pub trait Stream {
    /// Stream a chunk of bytes. `None` once the source is exhausted.
    async fn chunk(&self) -> Result<Option<Vec<u8>>, VideoError>;
}

/// Range-aware chunked parallel downloader with resume and HLS/DASH
/// segment assembly. Retries are hand-rolled here (not middleware) so
/// chunk offsets, `Retry-After` and sibling cancellation stay in one
/// place.
pub(crate) struct DownloadEngine {
    pub(crate) http: reqwest::Client,
    pub(crate) options: DownloadOptions,
}

impl DownloadEngine {
    pub fn new(http: reqwest::Client, options: DownloadOptions) -> Self {
        Self { http, options }
    }
}

pub struct NonLiveStreamOptions {
    pub client: Option<reqwest::Client>,
    pub link: String,
    pub content_length: u64,
    pub dl_chunk_size: u64,
    pub retry: RetryPolicy,
}

/// Progressive HTTPS stream. Every `chunk()` pulls the next byte range
/// through the same retrying range fetch the download engine uses, so a
/// transient 429/5xx mid-stream backs off and recovers instead of
/// killing the stream.
pub struct NonLiveStream {
    link: String,
    content_length: u64,
    chunk_size: u64,
    retry: RetryPolicy,
    // Offset of the first byte not yet handed out. Advanced only after a
    // range arrives, so a failed pull can be retried by calling again.
    cursor: AtomicU64,
    client: reqwest::Client,
}

impl NonLiveStream {
    pub fn new(options: NonLiveStreamOptions) -> Result<Self, VideoError> {
        let client = match options.client {
            Some(client) => client,
            None => reqwest::Client::builder()
                .build()
                .map_err(VideoError::Reqwest)?,
        };

        Ok(Self {
            client,
            link: options.link,
            content_length: options.content_length,
            chunk_size: options.dl_chunk_size.max(1),
            retry: options.retry,
            cursor: AtomicU64::new(0),
        })
    }

    pub fn content_length(&self) -> u64 {
        self.content_length
    }
}

#[async_trait]
impl Stream for NonLiveStream {
    async fn chunk(&self) -> Result<Option<Vec<u8>>, VideoError> {
        loop {
            let start = self.cursor.load(Ordering::Acquire);
            if start >= self.content_length {
                return Ok(None);
            }
            let end = (start + self.chunk_size - 1).min(self.content_length - 1);

            let bytes =
                chunked::fetch_range(&self.client, &self.retry, &self.link, start, end).await?;

            // Commit the advance; losing the race means a concurrent
            // puller already delivered this range, so claim the next one.
            if self
                .cursor
                .compare_exchange(start, end + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Ok(Some(bytes.to_vec()));
            }
        }
    }
}
