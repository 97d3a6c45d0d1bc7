use std::cmp::Reverse;

use super::Format;
use crate::errors::{FormatSkip, VideoError};
use crate::structs::Protocol;

/// Selection modes applied when no itag is forced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum SelectionMode {
    #[display("best")]
    Best,
    #[display("mp4av")]
    Mp4Av,
    #[display("mp4videoonly")]
    Mp4VideoOnly,
    #[display("videoonly")]
    VideoOnly,
    #[display("audioonly")]
    AudioOnly,
    #[display("mp3")]
    Mp3,
}

/// What the caller wants downloaded or streamed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum FormatPick {
    #[display("itag {_0}")]
    Itag(u64),
    #[display("{_0}")]
    Mode(SelectionMode),
}

/// Outcome of a selection: either a single file or a merge pair.
#[derive(Debug, Clone)]
pub(crate) enum Selection<'a> {
    Single(&'a Format),
    Pair {
        video: &'a Format,
        audio: &'a Format,
    },
}

impl<'a> Selection<'a> {
    pub fn primary(&self) -> &'a Format {
        match self {
            Selection::Single(format) => format,
            Selection::Pair { video, .. } => video,
        }
    }
}

fn audio_key(format: &Format) -> (u64, bool, Reverse<u64>) {
    (format.bitrate, !format.ciphered, Reverse(format.itag))
}

fn video_key(format: &Format) -> (u64, u64, u64, u64, bool, Reverse<u64>) {
    (
        format.height.unwrap_or(0),
        format.width.unwrap_or(0),
        format.fps.unwrap_or(0),
        format.bitrate,
        !format.ciphered,
        Reverse(format.itag),
    )
}

fn track_rank(format: &Format) -> u8 {
    match (format.has_video, format.has_audio) {
        (true, true) => 3,
        (true, false) => 2,
        (false, true) => 1,
        (false, false) => 0,
    }
}

fn best_key(format: &Format) -> (u8, u64, u64, u64, u64, bool, Reverse<u64>) {
    let (height, width, fps, bitrate, non_ciphered, itag) = video_key(format);
    (
        track_rank(format),
        height,
        width,
        fps,
        bitrate,
        non_ciphered,
        itag,
    )
}

fn is_mp4_video(format: &Format) -> bool {
    format.container == "mp4"
        || format
            .codecs
            .iter()
            .any(|codec| codec.starts_with("avc1") || codec.starts_with("av01"))
}

fn is_m4a_audio(format: &Format) -> bool {
    format.container == "mp4"
        || format.container == "m4a"
        || format.codecs.iter().any(|codec| codec.starts_with("mp4a"))
}

/// Choose formats for a pick. Merge pairs are only built from plain HTTPS
/// entries; manifest-addressed formats stream as single files.
pub(crate) fn choose_format<'a>(
    formats: &'a [Format],
    pick: &FormatPick,
) -> Result<Selection<'a>, VideoError> {
    choose_format_filtered(formats, pick, false)
}

/// Same as [`choose_format`] but optionally restricted to non-ciphered
/// candidates, for retry after a failed decipher.
pub(crate) fn choose_format_filtered<'a>(
    formats: &'a [Format],
    pick: &FormatPick,
    exclude_ciphered: bool,
) -> Result<Selection<'a>, VideoError> {
    let candidates: Vec<&Format> = formats
        .iter()
        .filter(|format| !(exclude_ciphered && format.ciphered))
        .collect();

    let mode = match pick {
        FormatPick::Itag(itag) => {
            return candidates
                .iter()
                .copied()
                .find(|format| format.itag == *itag)
                .map(Selection::Single)
                .ok_or_else(|| no_formats(pick, &candidates, "itag not present"));
        }
        FormatPick::Mode(mode) => *mode,
    };

    let https: Vec<&Format> = candidates
        .iter()
        .copied()
        .filter(|format| format.protocol == Protocol::Https)
        .collect();
    // Manifest entries only matter when nothing plain is available.
    let pool: &[&Format] = if https.is_empty() { &candidates } else { &https };

    match mode {
        SelectionMode::AudioOnly | SelectionMode::Mp3 => pool
            .iter()
            .copied()
            .filter(|format| format.has_audio && !format.has_video)
            .max_by_key(|format| audio_key(format))
            .map(Selection::Single)
            .ok_or_else(|| no_formats(pick, &candidates, "no audio-only candidates")),
        SelectionMode::VideoOnly => pool
            .iter()
            .copied()
            .filter(|format| format.has_video && !format.has_audio)
            .max_by_key(|format| video_key(format))
            .map(Selection::Single)
            .ok_or_else(|| no_formats(pick, &candidates, "no video-only candidates")),
        SelectionMode::Mp4VideoOnly => pool
            .iter()
            .copied()
            .filter(|format| format.has_video && !format.has_audio && is_mp4_video(format))
            .max_by_key(|format| video_key(format))
            .map(Selection::Single)
            .ok_or_else(|| no_formats(pick, &candidates, "no mp4 video-only candidates")),
        SelectionMode::Best => choose_pair(pick, &candidates, pool, |_| true, |_| true),
        SelectionMode::Mp4Av => {
            choose_pair(pick, &candidates, pool, is_mp4_video, is_m4a_audio)
        }
    }
}

/// Best separate video+audio pair, falling back to the best muxed single
/// file when the pair cannot be formed.
fn choose_pair<'a>(
    pick: &FormatPick,
    all: &[&'a Format],
    pool: &[&'a Format],
    video_filter: impl Fn(&Format) -> bool,
    audio_filter: impl Fn(&Format) -> bool,
) -> Result<Selection<'a>, VideoError> {
    let video = pool
        .iter()
        .copied()
        .filter(|format| {
            format.has_video
                && !format.has_audio
                && format.protocol == Protocol::Https
                && video_filter(format)
        })
        .max_by_key(|format| video_key(format));
    let audio = pool
        .iter()
        .copied()
        .filter(|format| {
            format.has_audio
                && !format.has_video
                && format.protocol == Protocol::Https
                && audio_filter(format)
        })
        .max_by_key(|format| audio_key(format));

    if let (Some(video), Some(audio)) = (video, audio) {
        return Ok(Selection::Pair { video, audio });
    }

    pool.iter()
        .copied()
        .filter(|format| format.has_video && format.has_audio && video_filter(format))
        .max_by_key(|format| best_key(format))
        .map(Selection::Single)
        .ok_or_else(|| no_formats(pick, all, "no merge pair and no muxed candidate"))
}

/// Best muxed progressive file, the last resort after decipher failures.
pub(crate) fn best_progressive<'a>(formats: &'a [Format]) -> Option<&'a Format> {
    formats
        .iter()
        .filter(|format| {
            format.has_audio
                && format.has_video
                && format.protocol == Protocol::Https
                && !format.ciphered
        })
        .max_by_key(|format| best_key(format))
}

fn no_formats(pick: &FormatPick, candidates: &[&Format], reason: &str) -> VideoError {
    VideoError::NoPlayableFormats {
        mode: pick.to_string(),
        selector: None,
        selection_error: Some(reason.to_string()),
        skips: candidates
            .iter()
            .map(|format| FormatSkip {
                itag: format.itag,
                reason: format!(
                    "audio={} video={} ciphered={} protocol={}",
                    format.has_audio, format.has_video, format.ciphered, format.protocol
                ),
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn format(itag: u64, audio: bool, video: bool) -> Format {
        Format {
            itag,
            url: format!("https://example.com/{itag}"),
            has_audio: audio,
            has_video: video,
            ..Default::default()
        }
    }

    #[test]
    fn audio_only_prefers_bitrate_then_non_ciphered() {
        let mut low = format(249, true, false);
        low.bitrate = 64_000;
        let mut high = format(251, true, false);
        high.bitrate = 160_000;
        let formats = vec![low, high];

        let selection =
            choose_format(&formats, &FormatPick::Mode(SelectionMode::AudioOnly)).unwrap();
        assert_eq!(selection.primary().itag, 251);
    }

    #[test]
    fn non_ciphered_wins_at_equal_rank() {
        let mut ciphered = format(140, true, false);
        ciphered.bitrate = 128_000;
        ciphered.url = String::new();
        ciphered.signature_cipher = Some("s=abc&url=https%3A%2F%2Fx".into());
        ciphered.refresh_cipher_flag();

        let mut clear = format(141, true, false);
        clear.bitrate = 128_000;

        let formats = vec![ciphered, clear];
        let selection =
            choose_format(&formats, &FormatPick::Mode(SelectionMode::AudioOnly)).unwrap();
        assert_eq!(selection.primary().itag, 141);
    }

    #[test]
    fn equal_rank_breaks_to_lower_itag() {
        let mut a = format(140, true, false);
        a.bitrate = 128_000;
        let mut b = format(141, true, false);
        b.bitrate = 128_000;

        let formats = vec![b, a];
        let selection =
            choose_format(&formats, &FormatPick::Mode(SelectionMode::AudioOnly)).unwrap();
        assert_eq!(selection.primary().itag, 140);
    }

    #[test]
    fn best_builds_merge_pair() {
        let mut video = format(137, false, true);
        video.height = Some(1080);
        let mut audio = format(140, true, false);
        audio.bitrate = 128_000;
        let progressive = format(18, true, true);

        let formats = vec![video, audio, progressive];
        match choose_format(&formats, &FormatPick::Mode(SelectionMode::Best)).unwrap() {
            Selection::Pair { video, audio } => {
                assert_eq!(video.itag, 137);
                assert_eq!(audio.itag, 140);
            }
            Selection::Single(_) => panic!("expected merge pair"),
        }
    }

    #[test]
    fn best_falls_back_to_progressive() {
        let formats = vec![format(18, true, true)];
        match choose_format(&formats, &FormatPick::Mode(SelectionMode::Best)).unwrap() {
            Selection::Single(single) => assert_eq!(single.itag, 18),
            Selection::Pair { .. } => panic!("expected single"),
        }
    }

    #[test]
    fn video_modes_rank_by_resolution() {
        let mut hd = format(137, false, true);
        hd.height = Some(1080);
        hd.container = "mp4".into();
        let mut sd = format(135, false, true);
        sd.height = Some(480);
        sd.container = "mp4".into();
        let mut webm = format(248, false, true);
        webm.height = Some(1080);
        webm.container = "webm".into();
        webm.codecs = vec!["vp9".into()];

        let formats = vec![sd, webm, hd];
        let selection =
            choose_format(&formats, &FormatPick::Mode(SelectionMode::Mp4VideoOnly)).unwrap();
        assert_eq!(selection.primary().itag, 137);
    }

    #[test]
    fn forced_itag_and_missing_itag() {
        let formats = vec![format(18, true, true)];
        let selection = choose_format(&formats, &FormatPick::Itag(18)).unwrap();
        assert_eq!(selection.primary().itag, 18);

        match choose_format(&formats, &FormatPick::Itag(22)) {
            Err(VideoError::NoPlayableFormats { mode, skips, .. }) => {
                assert_eq!(mode, "itag 22");
                assert_eq!(skips.len(), 1);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn excluding_ciphered_retries_cleanly() {
        let mut ciphered = format(137, false, true);
        ciphered.height = Some(2160);
        ciphered.url = String::new();
        ciphered.cipher = Some("s=zz&url=https%3A%2F%2Fx".into());
        ciphered.refresh_cipher_flag();
        let mut clear = format(136, false, true);
        clear.height = Some(720);

        let formats = vec![ciphered, clear];
        let strict = choose_format_filtered(
            &formats,
            &FormatPick::Mode(SelectionMode::VideoOnly),
            true,
        )
        .unwrap();
        assert_eq!(strict.primary().itag, 136);
    }
}
