use std::collections::HashSet;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use m3u8_rs::parse_media_playlist;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use url::Url;

use super::encryption::{KeyCache, SegmentEncryption};
use super::{DownloadEngine, Stream};
use crate::utils::make_absolute_url;
use crate::VideoError;

impl DownloadEngine {
    /// HLS media-playlist download loop: refresh, pick up new segments by
    /// sequence number (URL dedup as fallback), decrypt, append in order;
    /// exit on `#EXT-X-ENDLIST`, otherwise sleep one target duration.
    pub(crate) async fn download_hls(
        &self,
        playlist_url: &str,
        path: &Path,
    ) -> Result<u64, VideoError> {
        let mut file = tokio::fs::File::create(path).await?;
        let keys = KeyCache::default();

        let mut seen_sequences: HashSet<(u64, u64)> = HashSet::new();
        let mut seen_urls: HashSet<String> = HashSet::new();
        let mut fetched_inits: HashSet<String> = HashSet::new();
        let mut skipped = 0u32;
        let mut written = 0u64;

        loop {
            let body = self.fetch_text_with_retry(playlist_url).await?;
            let playlist = parse_media_playlist(body.as_bytes())
                .map_err(|error| VideoError::M3U8ParseError(error.to_string()))?
                .1;

            let mut encryption = SegmentEncryption::None;
            let mut discontinuity_offset = 0u64;
            let mut new_segments = 0usize;

            for (seq, segment) in (playlist.media_sequence..).zip(playlist.segments.iter()) {
                if segment.discontinuity {
                    discontinuity_offset += 1;
                }
                let discon_seq = playlist.discontinuity_sequence + discontinuity_offset;

                if let Some(key) = &segment.key {
                    encryption = SegmentEncryption::from_key(key, playlist_url, seq)?;
                }

                let segment_url = make_absolute_url(playlist_url, &segment.uri)?;
                if seen_sequences.contains(&(discon_seq, seq))
                    || seen_urls.contains(segment_url.as_str())
                {
                    continue;
                }

                // Initialization section, once per distinct map URI.
                if let Some(map) = &segment.map {
                    let map_url = make_absolute_url(playlist_url, &map.uri)?;
                    if fetched_inits.insert(map_url.to_string()) {
                        let init = self.fetch_bytes_with_retry(map_url.as_str()).await?;
                        file.write_all(&init).await?;
                        written += init.len() as u64;
                    }
                }

                match self.fetch_bytes_with_retry(segment_url.as_str()).await {
                    Ok(data) => {
                        let data = encryption.decrypt(&self.http, &keys, &data).await?;
                        file.write_all(&data).await?;
                        written += data.len() as u64;
                    }
                    Err(error) => {
                        if self.options.skip_unavailable_fragments
                            && skipped < self.options.max_skipped_fragments
                        {
                            skipped += 1;
                            log::warn!(
                                "skipping unavailable fragment {seq} ({skipped} skipped): {error}"
                            );
                        } else {
                            return Err(error);
                        }
                    }
                }

                seen_sequences.insert((discon_seq, seq));
                seen_urls.insert(segment_url.to_string());
                new_segments += 1;
            }

            if playlist.end_list {
                break;
            }

            log::debug!("hls refresh: {new_segments} new segments");
            let target = (playlist.target_duration as u64).max(1);
            tokio::time::sleep(Duration::from_secs(target)).await;
        }

        file.flush().await?;
        Ok(written)
    }
}

pub struct HlsStreamOptions {
    pub client: Option<reqwest::Client>,
    pub stream_url: String,
}

struct HlsSegmentRef {
    url: Url,
    discon_seq: u64,
    seq: u64,
}

/// Pull-based HLS stream: each `chunk()` yields one decrypted segment,
/// refreshing the media playlist when it runs dry.
pub struct HlsStream {
    client: reqwest::Client,
    stream_url: String,
    keys: KeyCache,

    last_refresh: RwLock<u128>,
    refresh_millis: RwLock<u64>,
    segments: RwLock<Vec<(HlsSegmentRef, SegmentEncryption)>>,
    is_end: RwLock<bool>,
    last_seg: RwLock<Option<(u64, u64)>>,
}

impl HlsStream {
    pub fn new(options: HlsStreamOptions) -> Result<Self, VideoError> {
        let client = match options.client {
            Some(client) => client,
            None => reqwest::Client::builder()
                .build()
                .map_err(VideoError::Reqwest)?,
        };

        Ok(Self {
            client,
            stream_url: options.stream_url,
            keys: KeyCache::default(),
            last_refresh: RwLock::new(0),
            refresh_millis: RwLock::new(2000),
            segments: RwLock::new(Vec::new()),
            is_end: RwLock::new(false),
            last_seg: RwLock::new(None),
        })
    }

    async fn refresh_playlist(&self) -> Result<(), VideoError> {
        let body = self
            .client
            .get(&self.stream_url)
            .send()
            .await
            .map_err(VideoError::Reqwest)?
            .text()
            .await
            .map_err(VideoError::Reqwest)?;

        let playlist = parse_media_playlist(body.as_bytes())
            .map_err(|error| VideoError::M3U8ParseError(error.to_string()))?
            .1;

        let mut encryption = SegmentEncryption::None;
        let mut discontinuity_offset = 0u64;

        for (seq, segment) in (playlist.media_sequence..).zip(playlist.segments.iter()) {
            if segment.discontinuity {
                discontinuity_offset += 1;
            }
            let discon_seq = playlist.discontinuity_sequence + discontinuity_offset;

            if let Some(done) = *self.last_seg.read().await {
                if done >= (discon_seq, seq) {
                    continue;
                }
            }

            if let Some(key) = &segment.key {
                encryption = SegmentEncryption::from_key(key, &self.stream_url, seq)?;
            }

            *self.last_seg.write().await = Some((discon_seq, seq));

            let segment_url = make_absolute_url(&self.stream_url, &segment.uri)?;
            let reference = HlsSegmentRef {
                url: segment_url,
                discon_seq,
                seq,
            };

            let mut segments = self.segments.write().await;
            if !segments
                .iter()
                .any(|(existing, _)| (existing.discon_seq, existing.seq) == (discon_seq, seq))
            {
                segments.push((reference, encryption.clone()));
            }
        }

        *self.refresh_millis.write().await = (playlist.target_duration as u64).max(1) * 1000;
        *self.last_refresh.write().await = now_millis();

        if playlist.end_list {
            *self.is_end.write().await = true;
        }

        Ok(())
    }
}

fn now_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("Time went backwards")
        .as_millis()
}

#[async_trait]
impl Stream for HlsStream {
    async fn chunk(&self) -> Result<Option<Vec<u8>>, VideoError> {
        if *self.is_end.read().await && self.segments.read().await.is_empty() {
            return Ok(None);
        }

        let refresh_millis = *self.refresh_millis.read().await;
        let since_refresh = now_millis().saturating_sub(*self.last_refresh.read().await);

        // Wait out the target duration before asking for new segments.
        if since_refresh < refresh_millis as u128
            && self.segments.read().await.is_empty()
            && !*self.is_end.read().await
        {
            tokio::time::sleep(Duration::from_millis(
                refresh_millis - since_refresh as u64,
            ))
            .await;
        }

        if now_millis().saturating_sub(*self.last_refresh.read().await) >= refresh_millis as u128
            && !*self.is_end.read().await
        {
            self.refresh_playlist().await?;
        }

        let (url, encryption) = {
            let segments = self.segments.read().await;
            match segments.first() {
                Some((reference, encryption)) => (reference.url.clone(), encryption.clone()),
                None => return Ok(Some(Vec::new())),
            }
        };

        let data = self
            .client
            .get(url)
            .send()
            .await
            .map_err(VideoError::Reqwest)?
            .bytes()
            .await
            .map_err(VideoError::Reqwest)?;

        let data = encryption.decrypt(&self.client, &self.keys, &data).await?;

        self.segments.write().await.remove(0);

        Ok(Some(data))
    }
}
