use once_cell::sync::Lazy;
use regex::Regex;
use reqwest_middleware::ClientWithMiddleware;
use serde::Deserialize;
use url::Url;

use super::Format;
use crate::structs::Protocol;
use crate::utils::make_absolute_url;
use crate::VideoError;

static ITAG_PATH_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"/itag/(\d+)/").unwrap());

/// Minimal MPD document model, covering what YouTube manifests carry.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename = "MPD")]
pub(crate) struct Mpd {
    #[serde(rename = "@type")]
    pub mpd_type: Option<String>,
    #[serde(rename = "@minimumUpdatePeriod")]
    pub minimum_update_period: Option<String>,
    #[serde(rename = "Period", default)]
    pub periods: Vec<Period>,
}

impl Mpd {
    pub fn is_dynamic(&self) -> bool {
        self.mpd_type.as_deref() == Some("dynamic")
    }

    pub fn representations(&self) -> impl Iterator<Item = (&AdaptationSet, &Representation)> {
        self.periods.iter().flat_map(|period| {
            period.adaptation_sets.iter().flat_map(|adaptation| {
                adaptation
                    .representations
                    .iter()
                    .map(move |representation| (adaptation, representation))
            })
        })
    }

    pub fn find_representation(&self, id: &str) -> Option<(&AdaptationSet, &Representation)> {
        self.representations()
            .find(|(_, representation)| representation.id.as_deref() == Some(id))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct Period {
    #[serde(rename = "AdaptationSet", default)]
    pub adaptation_sets: Vec<AdaptationSet>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct AdaptationSet {
    #[serde(rename = "@mimeType")]
    pub mime_type: Option<String>,
    #[serde(rename = "SegmentTemplate")]
    pub segment_template: Option<SegmentTemplate>,
    #[serde(rename = "Representation", default)]
    pub representations: Vec<Representation>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct Representation {
    #[serde(rename = "@id")]
    pub id: Option<String>,
    #[serde(rename = "@bandwidth")]
    pub bandwidth: Option<u64>,
    #[serde(rename = "@codecs")]
    pub codecs: Option<String>,
    #[serde(rename = "@mimeType")]
    pub mime_type: Option<String>,
    #[serde(rename = "@width")]
    pub width: Option<u64>,
    #[serde(rename = "@height")]
    pub height: Option<u64>,
    #[serde(rename = "@frameRate")]
    pub frame_rate: Option<String>,
    #[serde(rename = "@audioSamplingRate")]
    pub audio_sampling_rate: Option<String>,
    #[serde(rename = "BaseURL")]
    pub base_url: Option<String>,
    #[serde(rename = "SegmentTemplate")]
    pub segment_template: Option<SegmentTemplate>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct SegmentTemplate {
    #[serde(rename = "@initialization")]
    pub initialization: Option<String>,
    #[serde(rename = "@media")]
    pub media: Option<String>,
    #[serde(rename = "@startNumber")]
    pub start_number: Option<u64>,
    #[serde(rename = "@timescale")]
    pub timescale: Option<u64>,
    #[serde(rename = "@duration")]
    pub duration: Option<u64>,
    #[serde(rename = "SegmentTimeline")]
    pub timeline: Option<SegmentTimeline>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct SegmentTimeline {
    #[serde(rename = "S", default)]
    pub entries: Vec<TimelineEntry>,
}

/// `S` element: `t` resets the clock, `d` is the duration, `r` repeats
/// `d` after the first occurrence.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct TimelineEntry {
    #[serde(rename = "@t")]
    pub t: Option<u64>,
    #[serde(rename = "@d")]
    pub d: u64,
    #[serde(rename = "@r")]
    pub r: Option<i64>,
}

pub(crate) fn parse_mpd(xml: &str) -> Result<Mpd, VideoError> {
    quick_xml::de::from_str(xml).map_err(|error| VideoError::DashManifestError(error.to_string()))
}

/// Expand an MPD into first-class DASH formats. Every entry points at the
/// manifest URL; the representation is addressed by its id (the itag).
pub(crate) fn dash_formats(mpd: &Mpd, manifest_url: &str, source_client: &str) -> Vec<Format> {
    mpd.representations()
        .filter_map(|(adaptation, representation)| {
            let mime = representation
                .mime_type
                .as_deref()
                .or(adaptation.mime_type.as_deref())
                .unwrap_or_default();
            let codecs: Vec<String> = representation
                .codecs
                .as_deref()
                .map(|raw| raw.split(',').map(|codec| codec.trim().to_string()).collect())
                .unwrap_or_default();

            let has_video = mime.starts_with("video/") || representation.width.is_some();
            let has_audio =
                mime.starts_with("audio/") || representation.audio_sampling_rate.is_some();
            if !has_audio && !has_video {
                return None;
            }

            let container = mime.split('/').nth(1).unwrap_or_default().to_string();

            Some(Format {
                itag: representation
                    .id
                    .as_deref()
                    .and_then(|id| id.parse().ok())
                    .unwrap_or_default(),
                url: manifest_url.to_string(),
                container,
                codecs,
                bitrate: representation.bandwidth.unwrap_or_default(),
                width: representation.width,
                height: representation.height,
                fps: representation
                    .frame_rate
                    .as_deref()
                    .and_then(parse_frame_rate),
                audio_sample_rate: representation
                    .audio_sampling_rate
                    .as_deref()
                    .and_then(|raw| raw.parse().ok()),
                protocol: Protocol::Dash,
                has_audio,
                has_video,
                source_client: source_client.to_string(),
                ..Default::default()
            })
        })
        .collect()
}

fn parse_frame_rate(raw: &str) -> Option<u64> {
    match raw.split_once('/') {
        Some((numerator, denominator)) => {
            let numerator: f64 = numerator.parse().ok()?;
            let denominator: f64 = denominator.parse().ok()?;
            (denominator != 0.0).then(|| (numerator / denominator).round() as u64)
        }
        None => raw.parse().ok(),
    }
}

pub(crate) async fn fetch_dash_formats(
    http: &ClientWithMiddleware,
    manifest_url: &str,
    source_client: &str,
) -> Result<Vec<Format>, VideoError> {
    let body = fetch_text(http, manifest_url).await?;
    let mpd = parse_mpd(&body)?;
    Ok(dash_formats(&mpd, manifest_url, source_client))
}

/// Expand an HLS master playlist into variant formats. The itag rides in
/// the variant URI path for YouTube streams.
pub(crate) fn hls_variant_formats(
    body: &str,
    manifest_url: &str,
    source_client: &str,
) -> Result<Vec<Format>, VideoError> {
    let playlist = m3u8_rs::parse_master_playlist(body.as_bytes())
        .map_err(|error| VideoError::M3U8ParseError(error.to_string()))?
        .1;

    let mut formats = Vec::new();
    for variant in &playlist.variants {
        let absolute = match make_absolute_url(manifest_url, &variant.uri) {
            Ok(url) => url.to_string(),
            Err(_) => continue,
        };

        let codecs: Vec<String> = variant
            .codecs
            .as_deref()
            .map(|raw| raw.split(',').map(|codec| codec.trim().to_string()).collect())
            .unwrap_or_default();

        let (width, height) = variant
            .resolution
            .map(|resolution| (Some(resolution.width), Some(resolution.height)))
            .unwrap_or((None, None));

        let has_video = variant.resolution.is_some()
            || codecs.iter().any(|codec| {
                ["avc1", "av01", "vp9", "hev1", "hvc1"]
                    .iter()
                    .any(|prefix| codec.starts_with(prefix))
            });
        // Master-playlist variants are muxed unless codecs say otherwise.
        let has_audio = codecs.is_empty()
            || codecs.iter().any(|codec| {
                ["mp4a", "opus", "ac-3", "ec-3"]
                    .iter()
                    .any(|prefix| codec.starts_with(prefix))
            });

        formats.push(Format {
            itag: ITAG_PATH_REGEX
                .captures(&variant.uri)
                .and_then(|caps| caps.get(1))
                .and_then(|m| m.as_str().parse().ok())
                .unwrap_or_default(),
            url: absolute,
            container: "ts".to_string(),
            codecs,
            bitrate: variant.bandwidth,
            width,
            height,
            fps: variant.frame_rate.map(|rate| rate.round() as u64),
            protocol: Protocol::Hls,
            has_audio: has_audio || !has_video,
            has_video,
            source_client: source_client.to_string(),
            ..Default::default()
        });
    }

    Ok(formats)
}

pub(crate) async fn fetch_hls_formats(
    http: &ClientWithMiddleware,
    manifest_url: &str,
    source_client: &str,
) -> Result<Vec<Format>, VideoError> {
    let body = fetch_text(http, manifest_url).await?;
    hls_variant_formats(&body, manifest_url, source_client)
}

pub(crate) async fn fetch_text(
    http: &ClientWithMiddleware,
    url: &str,
) -> Result<String, VideoError> {
    let response = http
        .get(url)
        .send()
        .await
        .map_err(VideoError::ReqwestMiddleware)?;

    if !response.status().is_success() {
        return Err(VideoError::BodyCannotParsed(format!(
            "{url} returned {}",
            response.status()
        )));
    }

    response.text().await.map_err(VideoError::Reqwest)
}

/// Resolve a representation's single-file URL against the manifest when
/// it is addressed by BaseURL instead of a segment template.
pub(crate) fn resolve_base_url(
    representation: &Representation,
    manifest_url: &str,
) -> Result<Option<Url>, VideoError> {
    match representation.base_url.as_deref() {
        Some(base) => Ok(Some(make_absolute_url(manifest_url, base.trim())?)),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MPD_STATIC: &str = r#"<?xml version="1.0"?>
<MPD xmlns="urn:mpeg:dash:schema:mpd:2011" type="static" mediaPresentationDuration="PT10S">
  <Period>
    <AdaptationSet mimeType="video/mp4">
      <Representation id="137" bandwidth="2500000" codecs="avc1.640028" width="1920" height="1080" frameRate="30">
        <SegmentTemplate media="sq/$Number$/video.mp4" initialization="init/video.mp4" startNumber="1" timescale="1000">
          <SegmentTimeline>
            <S t="0" d="2000" r="3"/>
            <S d="1500"/>
          </SegmentTimeline>
        </SegmentTemplate>
      </Representation>
    </AdaptationSet>
    <AdaptationSet mimeType="audio/mp4">
      <Representation id="140" bandwidth="128000" codecs="mp4a.40.2" audioSamplingRate="44100">
        <BaseURL>audio/full.m4a</BaseURL>
      </Representation>
    </AdaptationSet>
  </Period>
</MPD>"#;

    #[test]
    fn parses_representations() {
        let mpd = parse_mpd(MPD_STATIC).unwrap();
        assert!(!mpd.is_dynamic());
        assert_eq!(mpd.representations().count(), 2);

        let (_, video) = mpd.find_representation("137").unwrap();
        assert_eq!(video.bandwidth, Some(2_500_000));
        let timeline = video
            .segment_template
            .as_ref()
            .unwrap()
            .timeline
            .as_ref()
            .unwrap();
        assert_eq!(timeline.entries.len(), 2);
        assert_eq!(timeline.entries[0].r, Some(3));
    }

    #[test]
    fn expands_dash_formats() {
        let mpd = parse_mpd(MPD_STATIC).unwrap();
        let formats = dash_formats(&mpd, "https://example.com/dash.mpd", "web");
        assert_eq!(formats.len(), 2);

        let video = formats.iter().find(|format| format.itag == 137).unwrap();
        assert_eq!(video.protocol, Protocol::Dash);
        assert_eq!(video.height, Some(1080));
        assert_eq!(video.fps, Some(30));
        assert!(video.has_video && !video.has_audio);
        assert_eq!(video.url, "https://example.com/dash.mpd");

        let audio = formats.iter().find(|format| format.itag == 140).unwrap();
        assert!(audio.has_audio && !audio.has_video);
        assert_eq!(audio.audio_sample_rate, Some(44100));
    }

    #[test]
    fn expands_hls_variants() {
        let body = concat!(
            "#EXTM3U\n",
            "#EXT-X-STREAM-INF:BANDWIDTH=1500000,RESOLUTION=1280x720,CODECS=\"avc1.4d401f,mp4a.40.2\",FRAME-RATE=30.0\n",
            "/api/hls_playlist/itag/95/index.m3u8\n",
            "#EXT-X-STREAM-INF:BANDWIDTH=500000,CODECS=\"mp4a.40.2\"\n",
            "audio/index.m3u8\n",
        );

        let formats =
            hls_variant_formats(body, "https://manifest.example.com/master.m3u8", "ios").unwrap();
        assert_eq!(formats.len(), 2);

        assert_eq!(formats[0].itag, 95);
        assert_eq!(formats[0].protocol, Protocol::Hls);
        assert_eq!(formats[0].width, Some(1280));
        assert!(formats[0].has_audio && formats[0].has_video);
        assert!(formats[0].url.starts_with("https://manifest.example.com/"));

        assert!(formats[1].has_audio && !formats[1].has_video);
        assert_eq!(
            formats[1].url,
            "https://manifest.example.com/audio/index.m3u8"
        );
    }

    #[test]
    fn frame_rate_fractions() {
        assert_eq!(parse_frame_rate("30"), Some(30));
        assert_eq!(parse_frame_rate("30000/1001"), Some(30));
        assert_eq!(parse_frame_rate("bogus"), None);
    }
}
