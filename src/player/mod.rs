pub(crate) mod challenge;
pub(crate) mod sandbox;
pub(crate) mod solver;

use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use reqwest_middleware::ClientWithMiddleware;
use tokio::sync::OnceCell;

use crate::constants::DEFAULT_HEADERS;
use crate::events::{EventPhase, EventSink, ExtractionStage};
use crate::structs::{PlayerSource, VideoOptions};
use crate::utils::make_absolute_url;
use crate::VideoError;

pub use challenge::{Decipherer, SigOp};
pub use solver::ChallengeSolutions;

/// Session state scraped from a watch page, cached per host.
#[derive(Debug, Clone, Default)]
pub(crate) struct WatchPageSnapshot {
    pub player_js_url: Option<String>,
    pub api_key: Option<String>,
    pub visitor_data: Option<String>,
    pub sts: Option<u64>,
    pub session_index: Option<String>,
    pub delegated_session_id: Option<String>,
    pub user_session_id: Option<String>,
}

/// Locates the current player script and serves its body from a memory
/// cache keyed by the canonical (locale-normalized) path. Concurrent
/// fetches for the same canonical key coalesce into one request.
pub(crate) struct PlayerJsResolver {
    http: ClientWithMiddleware,
    options: Arc<VideoOptions>,
    events: EventSink,
    pages: tokio::sync::Mutex<HashMap<String, Arc<WatchPageSnapshot>>>,
    scripts: std::sync::Mutex<HashMap<String, Arc<OnceCell<Arc<String>>>>>,
}

static PLAYER_JS_URL_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#""jsUrl":"([^"]+base\.js)"|<script[^>]+src="((?:\\/|/)s(?:\\/|/)player[^"]+base\.js)""#)
        .unwrap()
});
static API_KEY_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""INNERTUBE_API_KEY":"([^"]+)""#).unwrap());
static VISITOR_DATA_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""visitorData":"([^"]+)""#).unwrap());
static STS_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""(?:STS|signatureTimestamp)":(\d+)"#).unwrap());
static SESSION_INDEX_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""SESSION_INDEX":"(\d*)""#).unwrap());
static DELEGATED_SESSION_ID_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""DELEGATED_SESSION_ID":"([^"]+)""#).unwrap());
static USER_SESSION_ID_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""USER_SESSION_ID":"([^"]+)""#).unwrap());

static PLAYER_PATH_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?P<head>.*/s/player/[^/]+/[^/]*player[^/]*\.vflset)/(?P<locale>[A-Za-z]{2}_[A-Za-z]{2})/(?P<tail>base\.js)$")
        .unwrap()
});

/// Normalize a player JS path or URL to its canonical cache key: the path
/// with the locale segment replaced by `locale`. Idempotent; paths that
/// do not match the player shape come back unchanged.
pub(crate) fn canonical_player_key(url_or_path: &str, locale: &str) -> String {
    let unescaped = url_or_path.replace("\\/", "/");
    let path = match url::Url::parse(&unescaped) {
        Ok(parsed) => parsed.path().to_string(),
        Err(_) => unescaped,
    };

    match PLAYER_PATH_REGEX.captures(&path) {
        Some(caps) => format!("{}/{}/{}", &caps["head"], locale, &caps["tail"]),
        None => path,
    }
}

impl PlayerJsResolver {
    pub fn new(http: ClientWithMiddleware, options: Arc<VideoOptions>, events: EventSink) -> Self {
        Self {
            http,
            options,
            events,
            pages: tokio::sync::Mutex::new(HashMap::new()),
            scripts: std::sync::Mutex::new(HashMap::new()),
        }
    }

    fn watch_base(&self) -> String {
        self.options
            .player_js
            .base_url
            .clone()
            .unwrap_or_else(|| "https://www.youtube.com".to_string())
    }

    /// Fetch and scrape the watch page, once per host.
    pub async fn watch_page(&self, video_id: &str) -> Result<Arc<WatchPageSnapshot>, VideoError> {
        let base = self.watch_base();

        {
            let pages = self.pages.lock().await;
            if let Some(snapshot) = pages.get(&base) {
                return Ok(snapshot.clone());
            }
        }

        self.events
            .extraction(ExtractionStage::Webpage, EventPhase::Start, None, None);

        let url = format!("{base}/watch?v={video_id}&hl=en&bpctr=9999999999");
        let response = self
            .http
            .get(&url)
            .headers(self.request_headers())
            .send()
            .await;

        let html = match response {
            Ok(response) => match response.text().await {
                Ok(html) => html,
                Err(error) => {
                    self.events.extraction(
                        ExtractionStage::Webpage,
                        EventPhase::Failure,
                        None,
                        Some(error.to_string()),
                    );
                    return Err(VideoError::Reqwest(error));
                }
            },
            Err(error) => {
                self.events.extraction(
                    ExtractionStage::Webpage,
                    EventPhase::Failure,
                    None,
                    Some(error.to_string()),
                );
                return Err(VideoError::ReqwestMiddleware(error));
            }
        };

        let snapshot = Arc::new(scrape_watch_page(&html));
        self.events
            .extraction(ExtractionStage::Webpage, EventPhase::Success, None, None);

        let mut pages = self.pages.lock().await;
        pages.insert(base, snapshot.clone());
        Ok(snapshot)
    }

    /// Resolve the player URL for a video, scraping the watch page when
    /// needed. Returns an absolute URL.
    pub async fn player_url(&self, video_id: &str) -> Result<String, VideoError> {
        if let Some(source) = &self.options.player_js.resolver {
            return source.get_player_url(video_id).await;
        }

        let snapshot = self.watch_page(video_id).await?;
        let path = snapshot
            .player_js_url
            .clone()
            .ok_or_else(|| VideoError::PlayerJsUnavailable("no player url on watch page".into()))?;

        Ok(make_absolute_url(&self.watch_base(), &path)?.to_string())
    }

    /// Fetch the player JS body for a player URL. Bodies are cached by
    /// canonical key; parallel callers share one in-flight request.
    pub async fn player_js(&self, player_url: &str) -> Result<Arc<String>, VideoError> {
        if let Some(source) = &self.options.player_js.resolver {
            return source
                .get_player_js(player_url)
                .await
                .map(Arc::new);
        }

        let locale = self.options.player_js.preferred_locale.clone();
        let canonical = canonical_player_key(player_url, &locale);

        let cell = {
            let mut scripts = self.scripts.lock().expect("player js cache poisoned");
            scripts
                .entry(canonical.clone())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };

        let body = cell
            .get_or_try_init(|| self.fetch_player_js(player_url, &canonical))
            .await?;
        Ok(body.clone())
    }

    async fn fetch_player_js(
        &self,
        original_url: &str,
        canonical: &str,
    ) -> Result<Arc<String>, VideoError> {
        self.events
            .extraction(ExtractionStage::PlayerJs, EventPhase::Start, None, None);

        let base = self.watch_base();
        let canonical_url = make_absolute_url(&base, canonical)?.to_string();

        let result = match self.fetch_script(&canonical_url).await {
            // A canonical locale that was never published 404s; the
            // original locale path still serves the same program.
            Err(FetchError::NotFound) if canonical_url != original_url => {
                log::debug!("canonical player js 404, retrying original locale path");
                let original = make_absolute_url(&base, original_url)?.to_string();
                self.fetch_script(&original).await
            }
            other => other,
        };

        match result {
            Ok(body) => {
                self.events
                    .extraction(ExtractionStage::PlayerJs, EventPhase::Success, None, None);
                Ok(Arc::new(body))
            }
            Err(FetchError::NotFound) => {
                let error = VideoError::PlayerJsUnavailable(format!("{canonical_url} not found"));
                self.events.extraction(
                    ExtractionStage::PlayerJs,
                    EventPhase::Failure,
                    None,
                    Some(error.to_string()),
                );
                Err(error)
            }
            Err(FetchError::Other(error)) => {
                self.events.extraction(
                    ExtractionStage::PlayerJs,
                    EventPhase::Failure,
                    None,
                    Some(error.to_string()),
                );
                Err(error)
            }
        }
    }

    async fn fetch_script(&self, url: &str) -> Result<String, FetchError> {
        let response = self
            .http
            .get(url)
            .headers(self.request_headers())
            .send()
            .await
            .map_err(|error| FetchError::Other(VideoError::ReqwestMiddleware(error)))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(FetchError::NotFound);
        }
        if !response.status().is_success() {
            return Err(FetchError::Other(VideoError::PlayerJsUnavailable(format!(
                "{url} returned {}",
                response.status()
            ))));
        }

        response
            .text()
            .await
            .map_err(|error| FetchError::Other(VideoError::Reqwest(error)))
    }

    fn request_headers(&self) -> reqwest::header::HeaderMap {
        let mut headers = self
            .options
            .player_js
            .headers
            .clone()
            .unwrap_or_else(|| DEFAULT_HEADERS.clone());
        if let Some(user_agent) = &self.options.player_js.user_agent {
            if let Ok(value) = user_agent.parse() {
                headers.insert(reqwest::header::USER_AGENT, value);
            }
        }
        headers
    }
}

enum FetchError {
    NotFound,
    Other(VideoError),
}

fn scrape_watch_page(html: &str) -> WatchPageSnapshot {
    let capture = |regex: &Regex| {
        regex.captures(html).and_then(|caps| {
            caps.iter()
                .skip(1)
                .flatten()
                .next()
                .map(|m| m.as_str().replace("\\/", "/"))
        })
    };

    WatchPageSnapshot {
        player_js_url: capture(&PLAYER_JS_URL_REGEX),
        api_key: capture(&API_KEY_REGEX),
        visitor_data: capture(&VISITOR_DATA_REGEX),
        sts: capture(&STS_REGEX).and_then(|raw| raw.parse().ok()),
        session_index: capture(&SESSION_INDEX_REGEX),
        delegated_session_id: capture(&DELEGATED_SESSION_ID_REGEX),
        user_session_id: capture(&USER_SESSION_ID_REGEX),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_key_normalizes_locale() {
        let key = canonical_player_key(
            "/s/player/4fcd6e4a/player_ias.vflset/de_DE/base.js",
            "en_US",
        );
        assert_eq!(key, "/s/player/4fcd6e4a/player_ias.vflset/en_US/base.js");

        // Idempotent
        assert_eq!(canonical_player_key(&key, "en_US"), key);
    }

    #[test]
    fn canonical_key_accepts_urls_and_escapes() {
        let key = canonical_player_key(
            "https://www.youtube.com/s/player/4fcd6e4a/player_ias.vflset/tr_TR/base.js",
            "en_US",
        );
        assert_eq!(key, "/s/player/4fcd6e4a/player_ias.vflset/en_US/base.js");

        let key = canonical_player_key(
            r"\/s\/player\/4fcd6e4a\/player_ias.vflset\/tr_TR\/base.js",
            "en_US",
        );
        assert_eq!(key, "/s/player/4fcd6e4a/player_ias.vflset/en_US/base.js");
    }

    #[test]
    fn non_player_paths_pass_through() {
        assert_eq!(
            canonical_player_key("/s/other/thing.js", "en_US"),
            "/s/other/thing.js"
        );
    }

    #[test]
    fn scrapes_watch_page_state() {
        let html = concat!(
            r#"<html><script src="/s/player/4fcd6e4a/player_ias.vflset/en_US/base.js"></script>"#,
            r#"ytcfg.set({"INNERTUBE_API_KEY":"AIzaKey","SESSION_INDEX":"0","STS":19876,"#,
            r#""DELEGATED_SESSION_ID":"DSID","USER_SESSION_ID":"USID"});"#,
            r#""visitorData":"Cgt2aXNpdG9y""#,
            "</html>"
        );

        let snapshot = scrape_watch_page(html);
        assert_eq!(
            snapshot.player_js_url.as_deref(),
            Some("/s/player/4fcd6e4a/player_ias.vflset/en_US/base.js")
        );
        assert_eq!(snapshot.api_key.as_deref(), Some("AIzaKey"));
        assert_eq!(snapshot.sts, Some(19876));
        assert_eq!(snapshot.visitor_data.as_deref(), Some("Cgt2aXNpdG9y"));
        assert_eq!(snapshot.session_index.as_deref(), Some("0"));
        assert_eq!(snapshot.delegated_session_id.as_deref(), Some("DSID"));
        assert_eq!(snapshot.user_session_id.as_deref(), Some("USID"));
    }
}
