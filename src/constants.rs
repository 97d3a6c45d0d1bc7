use std::time::Duration;

use once_cell::sync::Lazy;

pub const BASE_URL: &str = "https://www.youtube.com/watch?v=";

pub const INNERTUBE_PLAYER_PATH: &str = "/youtubei/v1/player";

/// Locale segment every player JS path is normalized to before it is used
/// as a cache key.
pub const DEFAULT_PLAYER_LOCALE: &str = "en_US";

pub const VALID_QUERY_DOMAINS: &[&str] = &[
    "youtube.com",
    "www.youtube.com",
    "m.youtube.com",
    "music.youtube.com",
    "gaming.youtube.com",
];

/// Delay between hedged client launches within an orchestrator phase.
pub const DEFAULT_CLIENT_HEDGE_DELAY: Duration = Duration::from_millis(350);

pub const DEFAULT_MAX_RETRIES: u32 = 3;

pub const DEFAULT_METADATA_INITIAL_BACKOFF: Duration = Duration::from_millis(250);
pub const DEFAULT_METADATA_MAX_BACKOFF: Duration = Duration::from_millis(2000);

pub const DEFAULT_DOWNLOAD_INITIAL_BACKOFF: Duration = Duration::from_millis(500);
pub const DEFAULT_DOWNLOAD_MAX_BACKOFF: Duration = Duration::from_millis(10000);

/// Status codes worth retrying on either transport. Everything else fails
/// the attempt immediately.
pub const RETRIABLE_STATUS_CODES: &[u16] = &[429, 500, 502, 503, 504];

pub const DEFAULT_DL_CHUNK_SIZE: u64 = 1024 * 1024;
pub const DEFAULT_DL_CONCURRENCY: usize = 4;

pub const DEFAULT_SESSION_CACHE_TTL: Duration = Duration::from_secs(600);
pub const DEFAULT_SESSION_CACHE_MAX_ENTRIES: usize = 64;

/// Limits for a single sandboxed n-function evaluation.
pub const JS_EVAL_TIMEOUT: Duration = Duration::from_secs(5);
pub const JS_LOOP_ITERATION_LIMIT: u64 = 5_000_000;
pub const JS_RECURSION_LIMIT: usize = 512;

pub(crate) static DEFAULT_HEADERS: Lazy<reqwest::header::HeaderMap> = Lazy::new(|| {
    let mut headers = reqwest::header::HeaderMap::new();
    headers.insert(
        reqwest::header::USER_AGENT,
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36"
            .parse()
            .unwrap(),
    );
    headers.insert(
        reqwest::header::ACCEPT_LANGUAGE,
        "en-US,en;q=0.5".parse().unwrap(),
    );

    headers
});
