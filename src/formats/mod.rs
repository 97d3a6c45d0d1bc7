pub(crate) mod manifest;
pub(crate) mod materialize;
pub mod select;

use serde::Serialize;

use crate::structs::{MimeType, Protocol, RangeObject, StreamingData, StreamingDataFormat};

const AUDIO_CODEC_PREFIXES: &[&str] = &["mp4a", "opus", "vorbis", "aac"];
const VIDEO_CODEC_PREFIXES: &[&str] = &["avc1", "av01", "vp9", "vp8", "hev1", "hvc1"];

/// One normalized media entry. Invariants: every surfaced format has
/// audio or video; `ciphered` is true exactly when the URL is empty and a
/// cipher blob is present; `protocol` matches the entry's source.
#[derive(Debug, Clone, Serialize)]
pub struct Format {
    pub itag: u64,
    pub url: String,
    #[serde(rename = "mimeType")]
    pub mime_type: Option<MimeType>,
    pub container: String,
    pub codecs: Vec<String>,
    pub bitrate: u64,
    pub width: Option<u64>,
    pub height: Option<u64>,
    pub fps: Option<u64>,
    pub quality: Option<String>,
    #[serde(rename = "qualityLabel")]
    pub quality_label: Option<String>,
    #[serde(rename = "audioChannels")]
    pub audio_channels: Option<u8>,
    #[serde(rename = "audioSampleRate")]
    pub audio_sample_rate: Option<u64>,
    #[serde(rename = "contentLength")]
    pub content_length: Option<u64>,
    #[serde(rename = "initRange")]
    pub init_range: Option<RangeObject>,
    #[serde(rename = "indexRange")]
    pub index_range: Option<RangeObject>,
    pub protocol: Protocol,
    #[serde(rename = "hasAudio")]
    pub has_audio: bool,
    #[serde(rename = "hasVideo")]
    pub has_video: bool,
    pub ciphered: bool,
    #[serde(rename = "signatureCipher")]
    pub signature_cipher: Option<String>,
    pub cipher: Option<String>,
    #[serde(rename = "sourceClient")]
    pub source_client: String,
}

impl Default for Format {
    fn default() -> Self {
        Self {
            itag: 0,
            url: String::new(),
            mime_type: None,
            container: String::new(),
            codecs: Vec::new(),
            bitrate: 0,
            width: None,
            height: None,
            fps: None,
            quality: None,
            quality_label: None,
            audio_channels: None,
            audio_sample_rate: None,
            content_length: None,
            init_range: None,
            index_range: None,
            protocol: Protocol::Https,
            has_audio: false,
            has_video: false,
            ciphered: false,
            signature_cipher: None,
            cipher: None,
            source_client: String::new(),
        }
    }
}

impl Format {
    /// Re-derive the cipher flag after URL mutation so the invariant
    /// `ciphered ⇔ (url empty ∧ cipher blob present)` keeps holding.
    pub(crate) fn refresh_cipher_flag(&mut self) {
        self.ciphered = self.url.is_empty()
            && (self.signature_cipher.as_deref().is_some_and(|s| !s.is_empty())
                || self.cipher.as_deref().is_some_and(|s| !s.is_empty()));
    }
}

/// Map raw progressive and adaptive streaming entries to the normalized
/// format model. Entries that resolve to neither audio nor video are
/// dropped.
pub(crate) fn parse_formats(streaming: &StreamingData, source_client: &str) -> Vec<Format> {
    let progressive = streaming.formats.iter().flatten().map(|entry| (entry, true));
    let adaptive = streaming
        .adaptive_formats
        .iter()
        .flatten()
        .map(|entry| (entry, false));

    progressive
        .chain(adaptive)
        .filter_map(|(entry, is_progressive)| normalize_entry(entry, is_progressive, source_client))
        .collect()
}

fn normalize_entry(
    entry: &StreamingDataFormat,
    progressive: bool,
    source_client: &str,
) -> Option<Format> {
    let (container, codecs) = entry
        .mime_type
        .as_ref()
        .map(|mime| (mime.container.clone(), mime.codecs.clone()))
        .unwrap_or_default();

    let mut format = Format {
        itag: entry.itag.unwrap_or_default(),
        url: entry.url.clone().unwrap_or_default(),
        mime_type: entry.mime_type.clone(),
        container,
        codecs,
        bitrate: entry.bitrate.or(entry.average_bitrate).unwrap_or_default(),
        width: entry.width,
        height: entry.height,
        fps: entry.fps,
        quality: entry.quality.clone(),
        quality_label: entry.quality_label.clone(),
        audio_channels: entry.audio_channels,
        audio_sample_rate: entry
            .audio_sample_rate
            .as_deref()
            .and_then(|raw| raw.parse().ok()),
        content_length: entry
            .content_length
            .as_deref()
            .and_then(|raw| raw.parse().ok()),
        init_range: entry.init_range.clone(),
        index_range: entry.index_range.clone(),
        protocol: Protocol::Https,
        has_audio: false,
        has_video: false,
        ciphered: false,
        signature_cipher: entry.signature_cipher.clone(),
        cipher: entry.cipher.clone(),
        source_client: source_client.to_string(),
    };

    let (has_audio, has_video) = derive_tracks(entry, &format, progressive);
    format.has_audio = has_audio;
    format.has_video = has_video;
    format.refresh_cipher_flag();

    (format.has_audio || format.has_video).then_some(format)
}

/// Track derivation, in order: mime prefix, stream attributes, codec
/// prefixes, and the progressive audio default.
fn derive_tracks(
    entry: &StreamingDataFormat,
    format: &Format,
    progressive: bool,
) -> (bool, bool) {
    let mut has_audio = false;
    let mut has_video = false;

    if let Some(mime) = &format.mime_type {
        if mime.mime.type_() == mime::AUDIO {
            has_audio = true;
        }
        if mime.mime.type_() == mime::VIDEO {
            has_video = true;
        }
    }

    if entry.audio_channels.unwrap_or(0) > 0 || format.audio_sample_rate.unwrap_or(0) > 0 {
        has_audio = true;
    }
    if format.width.unwrap_or(0) > 0 || format.height.unwrap_or(0) > 0 || format.fps.unwrap_or(0) > 0
    {
        has_video = true;
    }

    for codec in &format.codecs {
        if AUDIO_CODEC_PREFIXES
            .iter()
            .any(|prefix| codec.starts_with(prefix))
        {
            has_audio = true;
        }
        if VIDEO_CODEC_PREFIXES
            .iter()
            .any(|prefix| codec.starts_with(prefix))
        {
            has_video = true;
        }
    }

    if progressive && has_video {
        has_audio = true;
    }

    (has_audio, has_video)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mime(raw: &str) -> Option<MimeType> {
        serde_json::from_value(serde_json::Value::String(raw.to_string())).ok()
    }

    #[test]
    fn progressive_video_defaults_audio_on() {
        let streaming = StreamingData {
            formats: Some(vec![StreamingDataFormat {
                itag: Some(18),
                mime_type: mime(r#"video/mp4; codecs="avc1.42001E, mp4a.40.2""#),
                url: Some("https://example.com/video".into()),
                width: Some(640),
                height: Some(360),
                ..Default::default()
            }]),
            ..Default::default()
        };

        let formats = parse_formats(&streaming, "web");
        assert_eq!(formats.len(), 1);
        let format = &formats[0];
        assert!(format.has_audio && format.has_video);
        assert_eq!(format.container, "mp4");
        assert_eq!(format.protocol, Protocol::Https);
        assert!(!format.ciphered);
        assert_eq!(format.source_client, "web");
    }

    #[test]
    fn adaptive_audio_only_from_codec_prefix() {
        let streaming = StreamingData {
            adaptive_formats: Some(vec![StreamingDataFormat {
                itag: Some(251),
                mime_type: mime(r#"audio/webm; codecs="opus""#),
                url: Some("https://example.com/audio".into()),
                audio_channels: Some(2),
                audio_sample_rate: Some("48000".into()),
                ..Default::default()
            }]),
            ..Default::default()
        };

        let formats = parse_formats(&streaming, "web");
        assert_eq!(formats.len(), 1);
        assert!(formats[0].has_audio);
        assert!(!formats[0].has_video);
        assert_eq!(formats[0].audio_sample_rate, Some(48000));
    }

    #[test]
    fn ciphered_invariant_holds() {
        let streaming = StreamingData {
            adaptive_formats: Some(vec![StreamingDataFormat {
                itag: Some(140),
                mime_type: mime(r#"audio/mp4; codecs="mp4a.40.2""#),
                signature_cipher: Some("s=abc&sp=sig&url=https%3A%2F%2Fx".into()),
                ..Default::default()
            }]),
            ..Default::default()
        };

        let formats = parse_formats(&streaming, "web");
        assert_eq!(formats.len(), 1);
        assert!(formats[0].ciphered);
        assert!(formats[0].url.is_empty());
    }

    #[test]
    fn trackless_entries_are_dropped() {
        let streaming = StreamingData {
            adaptive_formats: Some(vec![StreamingDataFormat {
                itag: Some(0),
                url: Some("https://example.com/mystery".into()),
                ..Default::default()
            }]),
            ..Default::default()
        };

        assert!(parse_formats(&streaming, "web").is_empty());
    }
}
