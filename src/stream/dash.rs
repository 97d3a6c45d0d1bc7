use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use bytes::Bytes;
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use super::chunked::download_failure;
use super::DownloadEngine;
use crate::formats::manifest::{
    parse_mpd, resolve_base_url, Mpd, Representation, SegmentTemplate,
};
use crate::utils::make_absolute_url;
use crate::VideoError;

static TEMPLATE_VAR_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$(RepresentationID|Number|Time|Bandwidth)(?:%0(\d+)d)?\$").unwrap());

#[derive(Debug, Clone, PartialEq, Eq)]
struct DashSegment {
    number: u64,
    time: u64,
}

impl DownloadEngine {
    /// DASH MPD download loop: refresh the manifest, materialize segment
    /// URLs for the chosen representation, fetch new segments (dedup by
    /// number) and append in manifest order. Static manifests finish in
    /// one pass; dynamic ones sleep `minimumUpdatePeriod` between passes.
    pub(crate) async fn download_dash(
        &self,
        manifest_url: &str,
        representation_id: &str,
        path: &Path,
    ) -> Result<u64, VideoError> {
        let mut file = tokio::fs::File::create(path).await?;
        let mut seen_numbers: HashSet<u64> = HashSet::new();
        let mut init_written = false;
        let mut base_url_written = false;
        let mut skipped = 0u32;
        let mut written = 0u64;

        loop {
            let xml = self.fetch_text_with_retry(manifest_url).await?;
            let mpd = parse_mpd(&xml)?;

            let (adaptation, representation) =
                mpd.find_representation(representation_id).ok_or_else(|| {
                    VideoError::DashManifestError(format!(
                        "representation {representation_id} not in manifest"
                    ))
                })?;

            let template = representation
                .segment_template
                .as_ref()
                .or(adaptation.segment_template.as_ref());

            match template {
                None => {
                    // Single-file representation addressed by BaseURL.
                    let base = resolve_base_url(representation, manifest_url)?.ok_or_else(|| {
                        VideoError::DashManifestError(
                            "representation has neither SegmentTemplate nor BaseURL".into(),
                        )
                    })?;
                    if !base_url_written {
                        let data = self.fetch_bytes_with_retry(base.as_str()).await?;
                        file.write_all(&data).await?;
                        written += data.len() as u64;
                        base_url_written = true;
                    }
                }
                Some(template) => {
                    if !init_written {
                        if let Some(init) = template.initialization.as_deref() {
                            let url = substitute_template(
                                init,
                                representation,
                                /* number */ 0,
                                /* time */ 0,
                            );
                            let url = make_absolute_url(manifest_url, &url)?;
                            let data = self.fetch_bytes_with_retry(url.as_str()).await?;
                            file.write_all(&data).await?;
                            written += data.len() as u64;
                        }
                        init_written = true;
                    }

                    let segments = materialize_segments(template)?;
                    let new_segments: Vec<DashSegment> = segments
                        .into_iter()
                        .filter(|segment| !seen_numbers.contains(&segment.number))
                        .collect();

                    let media = template.media.as_deref().ok_or_else(|| {
                        VideoError::DashManifestError("SegmentTemplate without media".into())
                    })?;

                    let bodies = if mpd.is_dynamic() {
                        self.fetch_segments_sequential(media, representation, manifest_url, &new_segments, &mut skipped)
                            .await?
                    } else {
                        self.fetch_segments_concurrent(media, representation, manifest_url, &new_segments)
                            .await?
                    };

                    for (segment, body) in new_segments.iter().zip(bodies) {
                        if let Some(body) = body {
                            file.write_all(&body).await?;
                            written += body.len() as u64;
                        }
                        seen_numbers.insert(segment.number);
                    }
                }
            }

            if !mpd.is_dynamic() {
                break;
            }

            let period = update_period(&mpd).unwrap_or(Duration::from_secs(5));
            tokio::time::sleep(period).await;
        }

        file.flush().await?;
        Ok(written)
    }

    async fn fetch_segments_sequential(
        &self,
        media: &str,
        representation: &Representation,
        manifest_url: &str,
        segments: &[DashSegment],
        skipped: &mut u32,
    ) -> Result<Vec<Option<Bytes>>, VideoError> {
        let mut bodies = Vec::with_capacity(segments.len());
        for segment in segments {
            let url = substitute_template(media, representation, segment.number, segment.time);
            let url = make_absolute_url(manifest_url, &url)?;
            match self.fetch_bytes_with_retry(url.as_str()).await {
                Ok(body) => bodies.push(Some(body)),
                Err(error) => {
                    if self.options.skip_unavailable_fragments
                        && *skipped < self.options.max_skipped_fragments
                    {
                        *skipped += 1;
                        log::warn!("skipping dash segment {}: {error}", segment.number);
                        bodies.push(None);
                    } else {
                        return Err(error);
                    }
                }
            }
        }
        Ok(bodies)
    }

    /// Bounded-concurrency fetch for static manifests. Bodies come back
    /// in manifest order so the writer can append directly.
    async fn fetch_segments_concurrent(
        &self,
        media: &str,
        representation: &Representation,
        manifest_url: &str,
        segments: &[DashSegment],
    ) -> Result<Vec<Option<Bytes>>, VideoError> {
        let semaphore = std::sync::Arc::new(Semaphore::new(self.options.max_concurrency.max(1)));
        let mut tasks: JoinSet<Result<(usize, Bytes), VideoError>> = JoinSet::new();

        for (index, segment) in segments.iter().enumerate() {
            let url = substitute_template(media, representation, segment.number, segment.time);
            let url = make_absolute_url(manifest_url, &url)?.to_string();
            let client = self.http.clone();
            let policy = self.options.retry.clone();
            let semaphore = semaphore.clone();

            tasks.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|_| download_failure(&url, None, 0, "download cancelled"))?;
                let body = super::chunked::fetch_bytes_retrying(&client, &policy, &url).await?;
                Ok((index, body))
            });
        }

        let mut bodies: Vec<Option<Bytes>> = vec![None; segments.len()];
        let mut failure = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok((index, body))) => bodies[index] = Some(body),
                Ok(Err(error)) => {
                    failure = Some(error);
                    tasks.abort_all();
                }
                Err(join_error) if join_error.is_cancelled() => {}
                Err(join_error) => {
                    failure = Some(VideoError::IoError(join_error.to_string()));
                    tasks.abort_all();
                }
            }
        }

        match failure {
            Some(error) => Err(error),
            None => Ok(bodies),
        }
    }
}

/// Expand the SegmentTimeline into (number, time) pairs. A `$Number$`
/// template without a timeline is unsupported, by decision: guessing
/// segment counts from durations produces silently broken files.
fn materialize_segments(template: &SegmentTemplate) -> Result<Vec<DashSegment>, VideoError> {
    let timeline = template.timeline.as_ref().ok_or_else(|| {
        VideoError::DashManifestError(
            "number template without SegmentTimeline is unsupported".into(),
        )
    })?;

    let mut segments = Vec::new();
    let mut number = template.start_number.unwrap_or(1);
    let mut clock = 0u64;

    for entry in &timeline.entries {
        if let Some(reset) = entry.t {
            clock = reset;
        }
        let repeats = entry.r.unwrap_or(0).max(0) as u64;
        for _ in 0..=repeats {
            segments.push(DashSegment {
                number,
                time: clock,
            });
            number += 1;
            clock += entry.d;
        }
    }

    Ok(segments)
}

fn substitute_template(
    template: &str,
    representation: &Representation,
    number: u64,
    time: u64,
) -> String {
    let substituted = TEMPLATE_VAR_REGEX.replace_all(template, |caps: &regex::Captures| {
        let value = match &caps[1] {
            "RepresentationID" => representation.id.clone().unwrap_or_default(),
            "Number" => number.to_string(),
            "Time" => time.to_string(),
            "Bandwidth" => representation.bandwidth.unwrap_or_default().to_string(),
            _ => unreachable!("regex alternation"),
        };
        match caps.get(2) {
            Some(width) => {
                let width: usize = width.as_str().parse().unwrap_or(0);
                format!("{value:0>width$}")
            }
            None => value,
        }
    });

    substituted.replace("$$", "$")
}

/// Minimal ISO-8601 duration parser for `minimumUpdatePeriod` values
/// like `PT3S` / `PT1M30S` / `PT1.5S`.
fn update_period(mpd: &Mpd) -> Option<Duration> {
    let raw = mpd.minimum_update_period.as_deref()?;
    parse_iso8601_duration(raw)
}

fn parse_iso8601_duration(raw: &str) -> Option<Duration> {
    static DURATION_REGEX: Lazy<Regex> = Lazy::new(|| {
        Regex::new(r"^P(?:(\d+)D)?T?(?:(\d+)H)?(?:(\d+)M)?(?:(\d+(?:\.\d+)?)S)?$").unwrap()
    });

    let caps = DURATION_REGEX.captures(raw.trim())?;
    let days: u64 = caps.get(1).map_or(0, |m| m.as_str().parse().unwrap_or(0));
    let hours: u64 = caps.get(2).map_or(0, |m| m.as_str().parse().unwrap_or(0));
    let minutes: u64 = caps.get(3).map_or(0, |m| m.as_str().parse().unwrap_or(0));
    let seconds: f64 = caps
        .get(4)
        .map_or(0.0, |m| m.as_str().parse().unwrap_or(0.0));

    let total = (days * 86400 + hours * 3600 + minutes * 60) as f64 + seconds;
    (total > 0.0).then(|| Duration::from_secs_f64(total))
}
