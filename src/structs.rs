use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mime::Mime;
use serde::{
    de::{Error, Unexpected},
    Deserialize, Deserializer, Serialize, Serializer,
};

use crate::constants::{
    DEFAULT_CLIENT_HEDGE_DELAY, DEFAULT_DL_CHUNK_SIZE, DEFAULT_DL_CONCURRENCY,
    DEFAULT_DOWNLOAD_INITIAL_BACKOFF, DEFAULT_DOWNLOAD_MAX_BACKOFF, DEFAULT_MAX_RETRIES,
    DEFAULT_METADATA_INITIAL_BACKOFF, DEFAULT_METADATA_MAX_BACKOFF, DEFAULT_PLAYER_LOCALE,
    DEFAULT_SESSION_CACHE_MAX_ENTRIES, DEFAULT_SESSION_CACHE_TTL, RETRIABLE_STATUS_CODES,
};
use crate::errors::VideoError;
use crate::events::{DownloadHook, ExtractionHook};
use crate::formats::{select::FormatPick, Format};

/// Transfer protocol of a surfaced format.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, derive_more::Display,
)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[display("https")]
    Https,
    #[display("dash")]
    Dash,
    #[display("hls")]
    Hls,
}

/// Public metadata view returned by [`crate::Client::get_video`].
#[derive(Debug, Clone, Serialize)]
pub struct VideoInfo {
    pub id: String,
    pub title: String,
    pub author: String,
    pub description: String,
    #[serde(rename = "durationSec")]
    pub duration_sec: u64,
    #[serde(rename = "viewCount")]
    pub view_count: u64,
    #[serde(rename = "channelId")]
    pub channel_id: String,
    #[serde(rename = "publishDate")]
    pub publish_date: String,
    #[serde(rename = "uploadDate")]
    pub upload_date: String,
    pub category: String,
    pub keywords: Vec<String>,
    #[serde(rename = "dashManifestUrl")]
    pub dash_manifest_url: Option<String>,
    #[serde(rename = "hlsManifestUrl")]
    pub hls_manifest_url: Option<String>,
    pub formats: Vec<Format>,
}

/// One caption track as listed in the player response. Fetching and
/// serializing the transcript itself is delegated to the caller.
#[derive(Debug, Clone, Serialize)]
pub struct SubtitleTrack {
    #[serde(rename = "baseUrl")]
    pub base_url: String,
    #[serde(rename = "languageCode")]
    pub language_code: String,
    pub name: String,
    pub kind: Option<String>,
    #[serde(rename = "isAutoGenerated")]
    pub is_auto_generated: bool,
}

/// Outcome of [`crate::Client::download`].
#[derive(Debug, Clone)]
pub struct DownloadOutcome {
    pub video_id: String,
    pub itag: u64,
    pub output_path: PathBuf,
    pub bytes: u64,
}

/// Per-call download parameters.
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub pick: FormatPick,
    pub output_path: PathBuf,
    pub resume: bool,
    pub merge_output: bool,
    pub keep_intermediate_files: bool,
}

impl DownloadRequest {
    pub fn new(pick: FormatPick, output_path: impl Into<PathBuf>) -> Self {
        Self {
            pick,
            output_path: output_path.into(),
            resume: false,
            merge_output: true,
            keep_intermediate_files: false,
        }
    }
}

/// Track metadata handed to the muxer / transcoder.
#[derive(Debug, Clone, Default)]
pub struct TrackMetadata {
    pub title: String,
    pub author: String,
}

/// Supplies proof-of-origin tokens. An empty string means "no token".
#[async_trait]
pub trait PoTokenProvider: Send + Sync {
    async fn get_token(&self, client_id: &str) -> Result<String, VideoError>;
}

/// Merges a separately downloaded video and audio file. The default
/// download flow calls this when selection yields a pair.
#[async_trait]
pub trait Muxer: Send + Sync {
    fn available(&self) -> bool;
    async fn merge(
        &self,
        video_path: &Path,
        audio_path: &Path,
        output_path: &Path,
        metadata: &TrackMetadata,
    ) -> Result<(), VideoError>;
}

/// Transcodes a downloaded audio file to MP3. Returns bytes written.
#[async_trait]
pub trait Mp3Transcoder: Send + Sync {
    async fn transcode_to_mp3(
        &self,
        src: &Path,
        dst: &Path,
        metadata: &TrackMetadata,
    ) -> Result<u64, VideoError>;
}

/// Pluggable source of the player script, mainly for tests.
#[async_trait]
pub trait PlayerSource: Send + Sync {
    async fn get_player_url(&self, video_id: &str) -> Result<String, VideoError>;
    async fn get_player_js(&self, player_url: &str) -> Result<String, VideoError>;
}

/// Effective proof-of-origin fetch policy for one protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum PoTokenFetchPolicy {
    #[display("required")]
    Required,
    #[display("recommended")]
    Recommended,
    #[display("never")]
    Never,
}

#[derive(Clone, Default)]
pub struct RequestOptions {
    /// [`reqwest::Client`] to use. When provided, `proxy` and
    /// `request_headers` are ignored.
    pub client: Option<reqwest::Client>,
    /// [`reqwest::Proxy`] applied to the built-in client.
    pub proxy: Option<reqwest::Proxy>,
    /// Cookie header string, e.g. `"SAPISID=...; VISITOR_INFO1_LIVE=..."`.
    /// Presence of SAPISID-family cookies switches the client plan to the
    /// authenticated defaults and enables `Authorization` hashes.
    pub cookies: Option<String>,
    /// Extra headers attached to every request.
    pub request_headers: Option<reqwest::header::HeaderMap>,
    /// Deadline applied to each HTTP request.
    pub request_timeout: Option<Duration>,
    /// Retries for the metadata transport (player API, watch page,
    /// player JS, manifests).
    pub max_retries: Option<u32>,
}

#[derive(Clone)]
pub struct InnertubeOptions {
    /// Explicit ordered client ids, replacing the defaults.
    pub client_overrides: Option<Vec<String>>,
    /// Client ids that must never be attempted.
    pub client_skip: Vec<String>,
    /// Never run the fallback phase.
    pub disable_fallback_clients: bool,
    /// Append the fallback phase even when `client_overrides` is set.
    pub append_fallback_on_client_overrides: bool,
    /// Launch delay between hedged clients within a phase.
    pub client_hedge_delay: Duration,
    /// Explicit visitor data, taking precedence over cookies and the
    /// watch page.
    pub visitor_data: Option<String>,
    pub po_token_provider: Option<Arc<dyn PoTokenProvider>>,
    /// Per-protocol override of the profile policy tables.
    pub po_token_fetch_policy: HashMap<Protocol, PoTokenFetchPolicy>,
    /// Scrape `INNERTUBE_API_KEY` & friends from the watch page instead of
    /// the profile's embedded key.
    pub enable_dynamic_api_key_resolution: bool,
    /// Attach `adPlaybackContext` for profiles that support it.
    pub use_ad_playback_context: bool,
    /// Base URL of the Innertube API, e.g. for a mock server or proxy.
    pub api_base_url: Option<String>,
}

impl Default for InnertubeOptions {
    fn default() -> Self {
        Self {
            client_overrides: None,
            client_skip: Vec::new(),
            disable_fallback_clients: false,
            append_fallback_on_client_overrides: false,
            client_hedge_delay: DEFAULT_CLIENT_HEDGE_DELAY,
            visitor_data: None,
            po_token_provider: None,
            po_token_fetch_policy: HashMap::new(),
            enable_dynamic_api_key_resolution: false,
            use_ad_playback_context: false,
            api_base_url: None,
        }
    }
}

#[derive(Clone)]
pub struct PlayerJsOptions {
    /// Base URL the scraped player path is resolved against.
    pub base_url: Option<String>,
    pub user_agent: Option<String>,
    pub headers: Option<reqwest::header::HeaderMap>,
    /// Locale segment used for the canonical player key.
    pub preferred_locale: String,
    /// Pluggable player source; the built-in resolver when `None`.
    pub resolver: Option<Arc<dyn PlayerSource>>,
}

impl Default for PlayerJsOptions {
    fn default() -> Self {
        Self {
            base_url: None,
            user_agent: None,
            headers: None,
            preferred_locale: DEFAULT_PLAYER_LOCALE.to_string(),
            resolver: None,
        }
    }
}

/// Retry shape shared by the metadata and download transports.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub retry_status_codes: Vec<u16>,
}

impl RetryPolicy {
    pub fn metadata_default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            initial_backoff: DEFAULT_METADATA_INITIAL_BACKOFF,
            max_backoff: DEFAULT_METADATA_MAX_BACKOFF,
            retry_status_codes: RETRIABLE_STATUS_CODES.to_vec(),
        }
    }

    pub fn download_default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            initial_backoff: DEFAULT_DOWNLOAD_INITIAL_BACKOFF,
            max_backoff: DEFAULT_DOWNLOAD_MAX_BACKOFF,
            retry_status_codes: RETRIABLE_STATUS_CODES.to_vec(),
        }
    }

    pub(crate) fn is_retriable_status(&self, status: u16) -> bool {
        self.retry_status_codes.contains(&status)
    }
}

#[derive(Debug, Clone)]
pub struct DownloadOptions {
    pub retry: RetryPolicy,
    /// Probe for range support and download in parallel chunks.
    pub enable_chunked: bool,
    pub chunk_size: u64,
    pub max_concurrency: usize,
    /// Skip HLS/DASH fragments that keep failing instead of aborting.
    pub skip_unavailable_fragments: bool,
    pub max_skipped_fragments: u32,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::download_default(),
            enable_chunked: true,
            chunk_size: DEFAULT_DL_CHUNK_SIZE,
            max_concurrency: DEFAULT_DL_CONCURRENCY,
            skip_unavailable_fragments: false,
            max_skipped_fragments: 10,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheOptions {
    pub session_cache_ttl: Duration,
    pub session_cache_max_entries: usize,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            session_cache_ttl: DEFAULT_SESSION_CACHE_TTL,
            session_cache_max_entries: DEFAULT_SESSION_CACHE_MAX_ENTRIES,
        }
    }
}

#[derive(Clone, Default)]
pub struct Hooks {
    pub on_extraction_event: Option<ExtractionHook>,
    pub on_download_event: Option<DownloadHook>,
    pub muxer: Option<Arc<dyn Muxer>>,
    pub mp3_transcoder: Option<Arc<dyn Mp3Transcoder>>,
}

/// Everything a [`crate::Client`] can be configured with.
#[derive(Clone, Default)]
pub struct VideoOptions {
    pub request_options: RequestOptions,
    pub innertube: InnertubeOptions,
    pub player_js: PlayerJsOptions,
    pub metadata_retry: RetryPolicy,
    pub download: DownloadOptions,
    pub cache: CacheOptions,
    pub hooks: Hooks,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::metadata_default()
    }
}

/// Parsed `mimeType` field, e.g. `video/mp4; codecs="avc1.42001E, mp4a.40.2"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MimeType {
    pub mime: Mime,
    pub container: String,
    pub codecs: Vec<String>,
    pub video_codec: Option<String>,
    pub audio_codec: Option<String>,
}

impl Serialize for MimeType {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = format!(
            r#"{}/{}; codecs="{}""#,
            self.mime.type_(),
            self.mime.subtype(),
            self.codecs.join(", "),
        );

        s.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for MimeType {
    fn deserialize<D>(deserializer: D) -> Result<MimeType, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;

        let mime: Mime = Mime::from_str(&s).map_err(|_| {
            D::Error::invalid_value(
                Unexpected::Str(&s),
                &r#"valid mime type format must be `(\w+/\w+);\scodecs="([a-zA-Z-0-9.,\s]*)"`"#,
            )
        })?;

        let codecs: Vec<String> = mime
            .get_param("codecs")
            .map(|x| x.as_str().split(", ").map(str::to_string).collect())
            .unwrap_or_default();

        let container = mime.subtype().to_string();

        let video_codec = if mime.type_() == mime::VIDEO {
            codecs.first().cloned()
        } else {
            None
        };

        let audio_codec = if mime.type_() == mime::AUDIO {
            codecs.first().cloned()
        } else {
            codecs.get(1).cloned()
        };

        Ok(MimeType {
            mime,
            container,
            codecs,
            video_codec,
            audio_codec,
        })
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct PlayerResponse {
    #[serde(rename = "playabilityStatus")]
    pub playability_status: Option<PlayabilityStatus>,
    #[serde(rename = "streamingData")]
    pub streaming_data: Option<StreamingData>,
    #[serde(rename = "videoDetails")]
    pub video_details: Option<PlayerResponseVideoDetails>,
    #[serde(rename = "microformat")]
    pub micro_format: Option<MicroFormat>,
    pub captions: Option<Captions>,
}

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct PlayabilityStatus {
    pub status: Option<String>,
    pub reason: Option<String>,
    #[serde(rename = "liveStreamability")]
    pub live_streamability: Option<serde_json::Value>,
    #[serde(rename = "errorScreen")]
    pub error_screen: Option<serde_json::Value>,
}

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct StreamingData {
    #[serde(rename = "expiresInSeconds")]
    pub expires_in_seconds: Option<String>,
    pub formats: Option<Vec<StreamingDataFormat>>,
    #[serde(rename = "adaptiveFormats")]
    pub adaptive_formats: Option<Vec<StreamingDataFormat>>,
    #[serde(rename = "dashManifestUrl")]
    pub dash_manifest_url: Option<String>,
    #[serde(rename = "hlsManifestUrl")]
    pub hls_manifest_url: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StreamingDataFormat {
    pub itag: Option<u64>,
    #[serde(rename = "mimeType")]
    pub mime_type: Option<MimeType>,
    pub bitrate: Option<u64>,
    #[serde(rename = "averageBitrate")]
    pub average_bitrate: Option<u64>,
    pub width: Option<u64>,
    pub height: Option<u64>,
    pub fps: Option<u64>,
    pub quality: Option<String>,
    #[serde(rename = "qualityLabel")]
    pub quality_label: Option<String>,
    #[serde(rename = "initRange")]
    pub init_range: Option<RangeObject>,
    #[serde(rename = "indexRange")]
    pub index_range: Option<RangeObject>,
    #[serde(rename = "contentLength")]
    pub content_length: Option<String>,
    #[serde(rename = "audioQuality")]
    pub audio_quality: Option<String>,
    #[serde(rename = "audioSampleRate")]
    pub audio_sample_rate: Option<String>,
    #[serde(rename = "audioChannels")]
    pub audio_channels: Option<u8>,
    #[serde(rename = "approxDurationMs")]
    pub approx_duration_ms: Option<String>,
    #[serde(rename = "drmFamilies")]
    pub drm_families: Option<Vec<String>>,
    pub url: Option<String>,
    #[serde(rename = "signatureCipher")]
    pub signature_cipher: Option<String>,
    pub cipher: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeObject {
    pub start: Option<String>,
    pub end: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct PlayerResponseVideoDetails {
    #[serde(rename = "videoId")]
    pub video_id: Option<String>,
    pub title: Option<String>,
    pub author: Option<String>,
    #[serde(rename = "channelId")]
    pub channel_id: Option<String>,
    #[serde(rename = "lengthSeconds")]
    pub length_seconds: Option<String>,
    #[serde(rename = "viewCount")]
    pub view_count: Option<String>,
    pub keywords: Option<Vec<String>>,
    #[serde(rename = "shortDescription")]
    pub short_description: Option<String>,
    #[serde(rename = "isLiveContent")]
    pub is_live_content: Option<bool>,
    #[serde(rename = "isLive")]
    pub is_live: Option<bool>,
    #[serde(rename = "isPrivate")]
    pub is_private: Option<bool>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MicroFormat {
    #[serde(rename = "playerMicroformatRenderer")]
    pub player_micro_format_renderer: Option<PlayerMicroFormatRenderer>,
}

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct PlayerMicroFormatRenderer {
    #[serde(rename = "lengthSeconds")]
    pub length_seconds: Option<String>,
    #[serde(rename = "viewCount")]
    pub view_count: Option<String>,
    pub category: Option<String>,
    #[serde(rename = "publishDate")]
    pub publish_date: Option<String>,
    #[serde(rename = "uploadDate")]
    pub upload_date: Option<String>,
    #[serde(rename = "ownerChannelName")]
    pub owner_channel_name: Option<String>,
    #[serde(rename = "externalChannelId")]
    pub external_channel_id: Option<String>,
    #[serde(rename = "availableCountries")]
    pub available_countries: Option<Vec<String>>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Captions {
    #[serde(rename = "playerCaptionsTracklistRenderer")]
    pub player_captions_tracklist_renderer: Option<CaptionsTracklistRenderer>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CaptionsTracklistRenderer {
    #[serde(rename = "captionTracks")]
    pub caption_tracks: Option<Vec<CaptionTrack>>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CaptionTrack {
    #[serde(rename = "baseUrl")]
    pub base_url: Option<String>,
    pub name: Option<CaptionTrackName>,
    #[serde(rename = "languageCode")]
    pub language_code: Option<String>,
    pub kind: Option<String>,
    #[serde(rename = "vssId")]
    pub vss_id: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CaptionTrackName {
    #[serde(rename = "simpleText")]
    pub simple_text: Option<String>,
    pub runs: Option<Vec<CaptionTrackNameRun>>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CaptionTrackNameRun {
    pub text: Option<String>,
}

impl PlayerResponse {
    pub(crate) fn playability(&self) -> (Option<&str>, Option<&str>) {
        let status = self
            .playability_status
            .as_ref()
            .and_then(|s| s.status.as_deref());
        let reason = self
            .playability_status
            .as_ref()
            .and_then(|s| s.reason.as_deref());
        (status, reason)
    }
}

/// Retry middleware strategy for the metadata transport: transient server
/// pressure retries, everything else (playability failures surface as
/// 200s, 4xx are deterministic) fails fast.
pub struct TransientStatusStrategy;

impl reqwest_retry::RetryableStrategy for TransientStatusStrategy {
    fn handle(
        &self,
        res: &reqwest_middleware::Result<reqwest::Response>,
    ) -> Option<reqwest_retry::Retryable> {
        match res {
            Ok(response) => {
                let status = response.status().as_u16();
                if RETRIABLE_STATUS_CODES.contains(&status) {
                    Some(reqwest_retry::Retryable::Transient)
                } else {
                    None
                }
            }
            Err(error) => reqwest_retry::default_on_request_failure(error),
        }
    }
}
