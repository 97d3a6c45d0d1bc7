//! `ytfetch` extracts playable media from YouTube videos.
//!
//! Given a video id or watch URL, [`Client`] emulates one of several
//! first-party player clients, fetches and parses the current player
//! script to solve the URL signing challenges, normalizes progressive,
//! adaptive, DASH and HLS entries into one format list, and can stream or
//! download any of them.
//!
//! ```ignore
//! let client = ytfetch::Client::new()?;
//! let video = client.get_video("https://www.youtube.com/watch?v=jNQXAC9IVRw").await?;
//! println!("{} formats for {}", video.formats.len(), video.title);
//! ```

mod cache;
mod info;
mod utils;

pub mod constants;
pub mod errors;
pub mod events;
pub mod formats;
pub mod innertube;
pub mod player;
pub mod stream;
pub mod structs;

pub use errors::{attempt_details, AttemptDetail, InvalidInputReason, VideoError};
pub use events::{
    DownloadEvent, DownloadPhase, DownloadStage, EventPhase, ExtractionEvent, ExtractionStage,
};
pub use formats::select::{FormatPick, SelectionMode};
pub use formats::Format;
pub use info::Client;
pub use stream::{DownloadArchive, Stream};
pub use structs::{
    CacheOptions, DownloadOptions, DownloadOutcome, DownloadRequest, Hooks, InnertubeOptions,
    Mp3Transcoder, Muxer, PlayerJsOptions, PlayerSource, PoTokenFetchPolicy, PoTokenProvider,
    Protocol, RequestOptions, RetryPolicy, SubtitleTrack, TrackMetadata, VideoInfo, VideoOptions,
};
pub use utils::{parse_video_input, validate_id};

// Re-exported so callers can build proxies and custom clients against the
// same reqwest version.
pub use reqwest;
