use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};

use crate::cache::{PoTokenCache, SessionCache, VideoSession};
use crate::constants::{BASE_URL, DEFAULT_HEADERS};
use crate::errors::VideoError;
use crate::events::{DownloadPhase, DownloadStage, EventPhase, EventSink, ExtractionStage};
use crate::formats::materialize::UrlMaterializer;
use crate::formats::select::{
    best_progressive, choose_format, choose_format_filtered, FormatPick, Selection, SelectionMode,
};
use crate::formats::{manifest, parse_formats, Format};
use crate::innertube::{Orchestrator, PlayerOutcome};
use crate::player::solver::{collect_challenges, ChallengeSolver};
use crate::player::{ChallengeSolutions, PlayerJsResolver};
use crate::stream::{
    DownloadEngine, HlsStream, HlsStreamOptions, NonLiveStream, NonLiveStreamOptions, Stream,
};
use crate::structs::{
    DownloadOutcome, DownloadRequest, Mp3Transcoder, Muxer, PlayerResponse, Protocol,
    SubtitleTrack, TrackMetadata, TransientStatusStrategy, VideoInfo, VideoOptions,
};
use crate::utils::parse_video_input;

/// Entry point of the crate: owns the transports, the player JS and
/// challenge caches, and the video session cache. Cheap to share behind
/// an `Arc`; all methods take `&self`.
pub struct Client {
    options: Arc<VideoOptions>,
    resolver: Arc<PlayerJsResolver>,
    solver: Arc<ChallengeSolver>,
    orchestrator: Orchestrator,
    po_tokens: Arc<PoTokenCache>,
    sessions: SessionCache,
    engine: DownloadEngine,
    events: EventSink,
}

impl Client {
    pub fn new() -> Result<Self, VideoError> {
        Self::with_options(VideoOptions::default())
    }

    pub fn with_options(options: VideoOptions) -> Result<Self, VideoError> {
        // Cookies travel in a header; only visible ASCII survives that.
        if let Some(cookie) = &options.request_options.cookies {
            if reqwest::header::HeaderValue::from_str(cookie).is_err() {
                return Err(VideoError::CookieError);
            }
        }

        let options = Arc::new(options);

        let base_client = match options.request_options.client.clone() {
            Some(client) => client,
            None => {
                let mut builder = reqwest::Client::builder();

                let mut headers = DEFAULT_HEADERS.clone();
                if let Some(extra) = &options.request_options.request_headers {
                    for (name, value) in extra {
                        headers.insert(name.clone(), value.clone());
                    }
                }
                builder = builder.default_headers(headers);

                if let Some(proxy) = &options.request_options.proxy {
                    builder = builder.proxy(proxy.clone());
                }
                if let Some(timeout) = options.request_options.request_timeout {
                    builder = builder.timeout(timeout);
                }

                builder.build().map_err(VideoError::Reqwest)?
            }
        };

        let max_retries = options
            .request_options
            .max_retries
            .unwrap_or(options.metadata_retry.max_retries);
        let retry_policy = ExponentialBackoff::builder()
            .retry_bounds(
                options.metadata_retry.initial_backoff,
                options.metadata_retry.max_backoff,
            )
            .build_with_max_retries(max_retries);
        let metadata_client: ClientWithMiddleware = ClientBuilder::new(base_client.clone())
            .with(RetryTransientMiddleware::new_with_policy_and_strategy(
                retry_policy,
                TransientStatusStrategy,
            ))
            .build();

        let events = EventSink {
            on_extraction: options.hooks.on_extraction_event.clone(),
            on_download: options.hooks.on_download_event.clone(),
        };

        let po_tokens = Arc::new(PoTokenCache::new(
            options.innertube.po_token_provider.clone(),
        ));

        let resolver = Arc::new(PlayerJsResolver::new(
            metadata_client.clone(),
            options.clone(),
            events.clone(),
        ));
        let solver = Arc::new(ChallengeSolver::new(
            resolver.clone(),
            events.clone(),
            options.player_js.preferred_locale.clone(),
        ));
        let orchestrator = Orchestrator::new(
            metadata_client.clone(),
            options.clone(),
            events.clone(),
            po_tokens.clone(),
        );
        let sessions = SessionCache::new(
            options.cache.session_cache_ttl,
            options.cache.session_cache_max_entries,
        );
        let engine = DownloadEngine::new(base_client, options.download.clone());

        Ok(Self {
            options,
            resolver,
            solver,
            orchestrator,
            po_tokens,
            sessions,
            engine,
            events,
        })
    }

    /// Full extraction: metadata plus the playable format list.
    pub async fn get_video(&self, input: &str) -> Result<VideoInfo, VideoError> {
        let (video_id, session) = self.session(input).await?;
        Ok(build_video_info(&video_id, &session))
    }

    /// Just the format list.
    pub async fn get_formats(&self, input: &str) -> Result<Vec<Format>, VideoError> {
        let (_, session) = self.session(input).await?;
        Ok(session.formats)
    }

    /// Materialize the playable URL for one itag.
    pub async fn resolve_stream_url(&self, input: &str, itag: u64) -> Result<String, VideoError> {
        let (_, session) = self.session(input).await?;

        let format = session
            .formats
            .iter()
            .find(|format| format.itag == itag)
            .ok_or_else(|| VideoError::NoPlayableFormats {
                mode: format!("itag {itag}"),
                selector: None,
                selection_error: Some("itag not present".into()),
                skips: Vec::new(),
            })?;

        self.materialize(&session, format).await
    }

    /// Raw DASH manifest body, fetched through the rewritten URL.
    pub async fn fetch_dash_manifest(&self, input: &str) -> Result<String, VideoError> {
        let (_, session) = self.session(input).await?;
        let url = session
            .response
            .streaming_data
            .as_ref()
            .and_then(|streaming| streaming.dash_manifest_url.clone())
            .ok_or_else(|| VideoError::DashManifestError("video has no dash manifest".into()))?;

        let url = self.rewrite_manifest_url(&session, &url).await;
        manifest::fetch_text(self.resolver_http(), &url).await
    }

    /// Raw HLS master playlist body, fetched through the rewritten URL.
    pub async fn fetch_hls_manifest(&self, input: &str) -> Result<String, VideoError> {
        let (_, session) = self.session(input).await?;
        let url = session
            .response
            .streaming_data
            .as_ref()
            .and_then(|streaming| streaming.hls_manifest_url.clone())
            .ok_or_else(|| VideoError::M3U8ParseError("video has no hls manifest".into()))?;

        let url = self.rewrite_manifest_url(&session, &url).await;
        manifest::fetch_text(self.resolver_http(), &url).await
    }

    /// Open a pull-based byte stream without touching disk.
    pub async fn open_stream(
        &self,
        input: &str,
        pick: FormatPick,
    ) -> Result<(Box<dyn Stream + Send + Sync>, Format), VideoError> {
        let (_, session) = self.session(input).await?;
        let resolved = self.resolve_selection(&session, &pick).await?;

        // Streams serve one file; a merge pair degrades to its primary.
        let (format, url) = resolved.primary;

        match format.protocol {
            Protocol::Hls => {
                let stream = HlsStream::new(HlsStreamOptions {
                    client: Some(self.engine.http.clone()),
                    stream_url: url,
                })?;
                Ok((Box::new(stream), format))
            }
            Protocol::Dash => Err(VideoError::DashManifestError(
                "dash formats can be downloaded but not streamed".into(),
            )),
            Protocol::Https => {
                let content_length = match format.content_length {
                    Some(length) if length > 0 => length,
                    // Size the stream without provoking a full body: the
                    // one-byte range probe first, HEAD when the host
                    // ignores ranges.
                    _ => match self.engine.probe_total_size(&url).await? {
                        Some(total) => total,
                        None => self
                            .engine
                            .http
                            .head(&url)
                            .send()
                            .await
                            .map_err(VideoError::Reqwest)?
                            .content_length()
                            .ok_or_else(|| {
                                VideoError::BodyCannotParsed(
                                    "no content length on stream".into(),
                                )
                            })?,
                    },
                };

                let stream = NonLiveStream::new(NonLiveStreamOptions {
                    client: Some(self.engine.http.clone()),
                    link: url,
                    content_length,
                    dl_chunk_size: self.options.download.chunk_size,
                    retry: self.options.download.retry.clone(),
                })?;
                Ok((Box::new(stream), format))
            }
        }
    }

    /// Download a selection to disk, merging separate video and audio
    /// tracks through the configured muxer.
    pub async fn download(
        &self,
        input: &str,
        request: DownloadRequest,
    ) -> Result<DownloadOutcome, VideoError> {
        let (video_id, session) = self.session(input).await?;

        self.events.download(
            DownloadStage::Download,
            DownloadPhase::Destination,
            &video_id,
            Some(request.output_path.clone()),
            None,
        );

        let outcome = self.perform_download(&video_id, &session, &request).await;

        match &outcome {
            Ok(done) => self.events.download(
                DownloadStage::Download,
                DownloadPhase::Complete,
                &video_id,
                Some(done.output_path.clone()),
                Some(format!("{} bytes", done.bytes)),
            ),
            Err(error) => self.events.download(
                DownloadStage::Download,
                DownloadPhase::Failure,
                &video_id,
                Some(request.output_path.clone()),
                Some(error.to_string()),
            ),
        }

        outcome
    }

    /// Caption tracks listed by the player response. Transcript fetching
    /// and serialization stay with the caller.
    pub async fn get_subtitle_tracks(&self, input: &str) -> Result<Vec<SubtitleTrack>, VideoError> {
        let (_, session) = self.session(input).await?;

        let tracks = session
            .response
            .captions
            .as_ref()
            .and_then(|captions| captions.player_captions_tracklist_renderer.as_ref())
            .and_then(|renderer| renderer.caption_tracks.as_ref())
            .map(|tracks| {
                tracks
                    .iter()
                    .filter_map(|track| {
                        Some(SubtitleTrack {
                            base_url: track.base_url.clone()?,
                            language_code: track.language_code.clone().unwrap_or_default(),
                            name: track
                                .name
                                .as_ref()
                                .and_then(|name| {
                                    name.simple_text.clone().or_else(|| {
                                        name.runs
                                            .as_ref()?
                                            .first()
                                            .and_then(|run| run.text.clone())
                                    })
                                })
                                .unwrap_or_default(),
                            kind: track.kind.clone(),
                            is_auto_generated: track.kind.as_deref() == Some("asr"),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(tracks)
    }

    pub fn get_video_url(video_id: &str) -> String {
        format!("{BASE_URL}{video_id}")
    }

    // ---- internals ----

    fn resolver_http(&self) -> &ClientWithMiddleware {
        self.orchestrator.http()
    }

    async fn session(&self, input: &str) -> Result<(String, VideoSession), VideoError> {
        let video_id = parse_video_input(input)?;

        if let Some(session) = self.sessions.get(&video_id) {
            log::debug!("session cache hit for {video_id}");
            return Ok((video_id, session));
        }

        let session = self.extract(&video_id).await?;
        self.sessions.put(&video_id, session.clone());
        Ok((video_id, session))
    }

    async fn extract(&self, video_id: &str) -> Result<VideoSession, VideoError> {
        // The watch page is an enrichment source (player URL, visitor
        // data, signature timestamp); losing it does not sink extraction.
        let page = match self.resolver.watch_page(video_id).await {
            Ok(page) => Some(page),
            Err(error) => {
                log::warn!("watch page unavailable for {video_id}: {error}");
                None
            }
        };

        let PlayerOutcome {
            response,
            source_client,
            attempts,
        } = self
            .orchestrator
            .fetch_player_response(video_id, page.as_deref())
            .await?;
        log::debug!(
            "player response from {} after {} failed attempts",
            source_client.id,
            attempts.len()
        );

        let player_url = match self.resolver.player_url(video_id).await {
            Ok(url) => Some(url),
            Err(error) => {
                log::debug!("no player url for {video_id}: {error}");
                None
            }
        };

        let streaming = response.streaming_data.clone().unwrap_or_default();
        let mut formats = parse_formats(&streaming, source_client.id);

        let mut manifest_urls: Vec<String> = Vec::new();
        if let Some(dash_url) = streaming.dash_manifest_url.clone() {
            manifest_urls.push(dash_url.clone());
            self.events
                .extraction(ExtractionStage::Manifest, EventPhase::Start, Some(source_client.id), None);
            match manifest::fetch_dash_formats(self.resolver_http(), &dash_url, source_client.id)
                .await
            {
                Ok(expanded) => {
                    self.events.extraction(
                        ExtractionStage::Manifest,
                        EventPhase::Success,
                        Some(source_client.id),
                        Some(format!("dash: {} representations", expanded.len())),
                    );
                    formats.extend(expanded);
                }
                Err(error) => self.events.extraction(
                    ExtractionStage::Manifest,
                    EventPhase::Failure,
                    Some(source_client.id),
                    Some(error.to_string()),
                ),
            }
        }
        if let Some(hls_url) = streaming.hls_manifest_url.clone() {
            manifest_urls.push(hls_url.clone());
            self.events
                .extraction(ExtractionStage::Manifest, EventPhase::Start, Some(source_client.id), None);
            match manifest::fetch_hls_formats(self.resolver_http(), &hls_url, source_client.id)
                .await
            {
                Ok(expanded) => {
                    self.events.extraction(
                        ExtractionStage::Manifest,
                        EventPhase::Success,
                        Some(source_client.id),
                        Some(format!("hls: {} variants", expanded.len())),
                    );
                    formats.extend(expanded);
                }
                Err(error) => self.events.extraction(
                    ExtractionStage::Manifest,
                    EventPhase::Failure,
                    Some(source_client.id),
                    Some(error.to_string()),
                ),
            }
        }

        let manifest_url_refs: Vec<&str> = manifest_urls.iter().map(String::as_str).collect();
        let challenges = collect_challenges(Some(&streaming), &manifest_url_refs);

        let solutions = match (&player_url, challenges.is_empty()) {
            (_, true) => ChallengeSolutions::default(),
            (Some(url), false) => self
                .solver
                .solve_batch(url, &challenges, Some(source_client.id))
                .await
                .unwrap_or_else(|error| {
                    log::warn!("challenge solving failed: {error}");
                    ChallengeSolutions::default()
                }),
            (None, false) => {
                self.events.extraction(
                    ExtractionStage::Challenge,
                    EventPhase::Failure,
                    Some(source_client.id),
                    Some("challenges present but no player url".into()),
                );
                ChallengeSolutions::default()
            }
        };

        {
            let materializer = UrlMaterializer {
                solutions: &solutions,
                player_url: player_url.as_deref(),
                profile: Some(source_client),
                pot_overrides: &self.options.innertube.po_token_fetch_policy,
                po_tokens: &self.po_tokens,
            };
            for format in &mut formats {
                materializer.apply_lenient(format);
            }
        }

        let now = Instant::now();
        Ok(VideoSession {
            response,
            player_url,
            formats,
            created_at: now,
            last_access: now,
        })
    }

    async fn materialize(
        &self,
        session: &VideoSession,
        format: &Format,
    ) -> Result<String, VideoError> {
        let solutions = match &session.player_url {
            Some(url) => self.solver.solutions_for(url).await,
            None => ChallengeSolutions::default(),
        };

        let profile = crate::innertube::profiles::profile_by_id(&format.source_client);
        let materializer = UrlMaterializer {
            solutions: &solutions,
            player_url: session.player_url.as_deref(),
            profile,
            pot_overrides: &self.options.innertube.po_token_fetch_policy,
            po_tokens: &self.po_tokens,
        };
        materializer.materialize(format).await
    }

    async fn rewrite_manifest_url(&self, session: &VideoSession, url: &str) -> String {
        let solutions = match &session.player_url {
            Some(player_url) => self.solver.solutions_for(player_url).await,
            None => ChallengeSolutions::default(),
        };

        match crate::utils::url_query_value(url, "n")
            .and_then(|n| solutions.n.get(&n).cloned())
        {
            Some(solved) => crate::utils::rewrite_url_param(url, "n", &solved),
            None => url.to_string(),
        }
    }

    async fn perform_download(
        &self,
        video_id: &str,
        session: &VideoSession,
        request: &DownloadRequest,
    ) -> Result<DownloadOutcome, VideoError> {
        let resolved = self.resolve_selection(session, &request.pick).await?;
        let metadata = track_metadata(&session.response);

        match resolved.audio {
            Some(audio) if request.merge_output => {
                self.download_pair(video_id, request, resolved.primary, audio, &metadata)
                    .await
            }
            Some(audio) => {
                // Caller opted out of merging; keep both tracks.
                let (video_format, video_url) = resolved.primary;
                let video_path = sibling_path(&request.output_path, "video");
                let audio_path = sibling_path(&request.output_path, "audio");
                let video_bytes = self
                    .run_single_download(video_id, &video_format, &video_url, &video_path, request)
                    .await?;
                let audio_bytes = self
                    .run_single_download(video_id, &audio.0, &audio.1, &audio_path, request)
                    .await?;
                Ok(DownloadOutcome {
                    video_id: video_id.to_string(),
                    itag: video_format.itag,
                    output_path: video_path,
                    bytes: video_bytes + audio_bytes,
                })
            }
            None => {
                let (format, url) = resolved.primary;

                if matches!(request.pick, FormatPick::Mode(SelectionMode::Mp3)) {
                    self.download_mp3(video_id, &format, &url, request, &metadata)
                        .await
                } else {
                    let bytes = self
                        .run_single_download(video_id, &format, &url, &request.output_path, request)
                        .await?;
                    Ok(DownloadOutcome {
                        video_id: video_id.to_string(),
                        itag: format.itag,
                        output_path: request.output_path.clone(),
                        bytes,
                    })
                }
            }
        }
    }

    /// Selection plus strict materialization, with the documented retry
    /// ladder: full pool, then non-ciphered candidates only, then the
    /// best muxed progressive file.
    async fn resolve_selection(
        &self,
        session: &VideoSession,
        pick: &FormatPick,
    ) -> Result<ResolvedSelection, VideoError> {
        let first = choose_format(&session.formats, pick)?;
        log::debug!("selected itag {} for {pick}", first.primary().itag);
        let first_error = match self.materialize_selection(session, &first).await {
            Ok(resolved) => return Ok(resolved),
            Err(error @ VideoError::ChallengeNotSolved { .. }) => error,
            Err(other) => return Err(other),
        };

        log::debug!("selection needs decipher, retrying non-ciphered: {first_error}");
        if let Ok(retry) = choose_format_filtered(&session.formats, pick, true) {
            if let Ok(resolved) = self.materialize_selection(session, &retry).await {
                return Ok(resolved);
            }
        }

        if let Some(progressive) = best_progressive(&session.formats) {
            if let Ok(url) = self.materialize(session, progressive).await {
                return Ok(ResolvedSelection {
                    primary: (progressive.clone(), url),
                    audio: None,
                });
            }
        }

        Err(first_error)
    }

    async fn materialize_selection(
        &self,
        session: &VideoSession,
        selection: &Selection<'_>,
    ) -> Result<ResolvedSelection, VideoError> {
        match selection {
            Selection::Single(format) => {
                let url = self.materialize(session, format).await?;
                Ok(ResolvedSelection {
                    primary: ((*format).clone(), url),
                    audio: None,
                })
            }
            Selection::Pair { video, audio } => {
                let video_url = self.materialize(session, video).await?;
                let audio_url = self.materialize(session, audio).await?;
                Ok(ResolvedSelection {
                    primary: ((*video).clone(), video_url),
                    audio: Some(((*audio).clone(), audio_url)),
                })
            }
        }
    }

    async fn run_single_download(
        &self,
        video_id: &str,
        format: &Format,
        url: &str,
        path: &Path,
        request: &DownloadRequest,
    ) -> Result<u64, VideoError> {
        self.events.download(
            DownloadStage::Download,
            DownloadPhase::Start,
            video_id,
            Some(path.to_path_buf()),
            Some(format!("itag {} via {}", format.itag, format.protocol)),
        );

        match format.protocol {
            Protocol::Https => self.engine.download_https(url, path, request.resume).await,
            Protocol::Hls => self.engine.download_hls(url, path).await,
            Protocol::Dash => {
                self.engine
                    .download_dash(url, &format.itag.to_string(), path)
                    .await
            }
        }
    }

    async fn download_pair(
        &self,
        video_id: &str,
        request: &DownloadRequest,
        video: (Format, String),
        audio: (Format, String),
        metadata: &TrackMetadata,
    ) -> Result<DownloadOutcome, VideoError> {
        let muxer = self
            .options
            .hooks
            .muxer
            .as_ref()
            .filter(|muxer| muxer.available())
            .cloned()
            .ok_or_else(|| {
                VideoError::MuxError("merge requested but no muxer is configured".into())
            })?;

        let video_path = sibling_path(&request.output_path, "video");
        let audio_path = sibling_path(&request.output_path, "audio");

        let (video_format, video_url) = video;
        let (audio_format, audio_url) = audio;

        let video_bytes = self
            .run_single_download(video_id, &video_format, &video_url, &video_path, request)
            .await?;
        let _audio_bytes = self
            .run_single_download(video_id, &audio_format, &audio_url, &audio_path, request)
            .await?;

        self.events.download(
            DownloadStage::Merge,
            DownloadPhase::Start,
            video_id,
            Some(request.output_path.clone()),
            None,
        );
        let merge = muxer
            .merge(&video_path, &audio_path, &request.output_path, metadata)
            .await;
        match &merge {
            Ok(()) => self.events.download(
                DownloadStage::Merge,
                DownloadPhase::Complete,
                video_id,
                Some(request.output_path.clone()),
                None,
            ),
            Err(error) => self.events.download(
                DownloadStage::Merge,
                DownloadPhase::Failure,
                video_id,
                Some(request.output_path.clone()),
                Some(error.to_string()),
            ),
        }
        merge?;

        for intermediate in [&video_path, &audio_path] {
            if request.keep_intermediate_files {
                self.events.download(
                    DownloadStage::Cleanup,
                    DownloadPhase::Skip,
                    video_id,
                    Some(intermediate.clone()),
                    None,
                );
            } else {
                let _ = tokio::fs::remove_file(intermediate).await;
                self.events.download(
                    DownloadStage::Cleanup,
                    DownloadPhase::Delete,
                    video_id,
                    Some(intermediate.clone()),
                    None,
                );
            }
        }

        let bytes = tokio::fs::metadata(&request.output_path)
            .await
            .map(|meta| meta.len())
            .unwrap_or(video_bytes);

        Ok(DownloadOutcome {
            video_id: video_id.to_string(),
            itag: video_format.itag,
            output_path: request.output_path.clone(),
            bytes,
        })
    }

    async fn download_mp3(
        &self,
        video_id: &str,
        format: &Format,
        url: &str,
        request: &DownloadRequest,
        metadata: &TrackMetadata,
    ) -> Result<DownloadOutcome, VideoError> {
        let transcoder = self
            .options
            .hooks
            .mp3_transcoder
            .clone()
            .ok_or_else(|| {
                VideoError::TranscodeError("mp3 requested but no transcoder is configured".into())
            })?;

        let audio_path = sibling_path(&request.output_path, "audio");
        self.run_single_download(video_id, format, url, &audio_path, request)
            .await?;

        let bytes = transcoder
            .transcode_to_mp3(&audio_path, &request.output_path, metadata)
            .await?;

        if request.keep_intermediate_files {
            self.events.download(
                DownloadStage::Cleanup,
                DownloadPhase::Skip,
                video_id,
                Some(audio_path),
                None,
            );
        } else {
            let _ = tokio::fs::remove_file(&audio_path).await;
            self.events.download(
                DownloadStage::Cleanup,
                DownloadPhase::Delete,
                video_id,
                Some(audio_path),
                None,
            );
        }

        Ok(DownloadOutcome {
            video_id: video_id.to_string(),
            itag: format.itag,
            output_path: request.output_path.clone(),
            bytes,
        })
    }
}

struct ResolvedSelection {
    primary: (Format, String),
    audio: Option<(Format, String)>,
}

fn sibling_path(path: &Path, tag: &str) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "download".to_string());
    name.push('.');
    name.push_str(tag);
    path.with_file_name(name)
}

fn track_metadata(response: &PlayerResponse) -> TrackMetadata {
    let details = response.video_details.as_ref();
    TrackMetadata {
        title: details
            .and_then(|details| details.title.clone())
            .unwrap_or_default(),
        author: details
            .and_then(|details| details.author.clone())
            .unwrap_or_default(),
    }
}

fn build_video_info(video_id: &str, session: &VideoSession) -> VideoInfo {
    let details = session.response.video_details.as_ref();
    let microformat = session
        .response
        .micro_format
        .as_ref()
        .and_then(|micro| micro.player_micro_format_renderer.as_ref());

    let duration_sec = details
        .and_then(|details| details.length_seconds.as_deref())
        .or_else(|| microformat.and_then(|micro| micro.length_seconds.as_deref()))
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(0);

    let view_count = details
        .and_then(|details| details.view_count.as_deref())
        .or_else(|| microformat.and_then(|micro| micro.view_count.as_deref()))
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(0);

    let streaming = session.response.streaming_data.as_ref();

    VideoInfo {
        id: video_id.to_string(),
        title: details
            .and_then(|details| details.title.clone())
            .unwrap_or_default(),
        author: details
            .and_then(|details| details.author.clone())
            .or_else(|| microformat.and_then(|micro| micro.owner_channel_name.clone()))
            .unwrap_or_default(),
        description: details
            .and_then(|details| details.short_description.clone())
            .unwrap_or_default(),
        duration_sec,
        view_count,
        channel_id: details
            .and_then(|details| details.channel_id.clone())
            .or_else(|| microformat.and_then(|micro| micro.external_channel_id.clone()))
            .unwrap_or_default(),
        publish_date: microformat
            .and_then(|micro| micro.publish_date.clone())
            .unwrap_or_default(),
        upload_date: microformat
            .and_then(|micro| micro.upload_date.clone())
            .unwrap_or_default(),
        category: microformat
            .and_then(|micro| micro.category.clone())
            .unwrap_or_default(),
        keywords: details
            .and_then(|details| details.keywords.clone())
            .unwrap_or_default(),
        dash_manifest_url: streaming.and_then(|streaming| streaming.dash_manifest_url.clone()),
        hls_manifest_url: streaming.and_then(|streaming| streaming.hls_manifest_url.clone()),
        formats: session.formats.clone(),
    }
}
