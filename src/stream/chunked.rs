use std::path::Path;
use std::time::Duration;

use bytes::Bytes;
use once_cell::sync::Lazy;
use rand::Rng;
use regex::Regex;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;

use super::DownloadEngine;
use crate::errors::{DownloadFailureDetail, VideoError};
use crate::structs::RetryPolicy;
use crate::utils::{url_host, url_query_value};

static CONTENT_RANGE_TOTAL_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"bytes\s+\d+-\d+/(\d+)").unwrap());

impl DownloadEngine {
    /// Single-URL download path: resume attempt, range probe, then either
    /// parallel chunked download or a full streaming rewrite.
    pub(crate) async fn download_https(
        &self,
        url: &str,
        path: &Path,
        resume: bool,
    ) -> Result<u64, VideoError> {
        if resume {
            if let Some(existing) = existing_size(path).await {
                match self.try_resume(url, path, existing).await? {
                    ResumeOutcome::Completed(total) => return Ok(total),
                    ResumeOutcome::Resumed(total) => return Ok(total),
                    // Server ignored the range; rewrite from scratch.
                    ResumeOutcome::RangeUnsupported => {}
                }
            }
        }

        if self.options.enable_chunked {
            if let Some(total) = self.probe_total_size(url).await? {
                return self.chunked_download(url, path, total).await;
            }
        }

        self.full_rewrite(url, path).await
    }

    /// Resume with `Range: bytes=<size>-`. 206 appends, 416 means the
    /// file is already complete, 200 means no range support.
    async fn try_resume(
        &self,
        url: &str,
        path: &Path,
        existing: u64,
    ) -> Result<ResumeOutcome, VideoError> {
        let response = self
            .http
            .get(url)
            .header(reqwest::header::RANGE, format!("bytes={existing}-"))
            .send()
            .await
            .map_err(|error| download_failure(url, None, 0, &error.to_string()))?;

        match response.status().as_u16() {
            206 => {
                log::debug!("resuming {url} at byte {existing}");
                let mut file = tokio::fs::OpenOptions::new()
                    .append(true)
                    .open(path)
                    .await?;
                let appended = stream_body_to(response, &mut file, url).await?;
                file.flush().await?;
                Ok(ResumeOutcome::Resumed(existing + appended))
            }
            416 => Ok(ResumeOutcome::Completed(existing)),
            200 => Ok(ResumeOutcome::RangeUnsupported),
            status => Err(download_failure(
                url,
                Some(status),
                0,
                &format!("resume request returned {status}"),
            )),
        }
    }

    /// `Range: bytes=0-0` probe. A 206 with `Content-Range: bytes 0-0/N`
    /// hands us the total size and proves range support.
    pub(crate) async fn probe_total_size(&self, url: &str) -> Result<Option<u64>, VideoError> {
        let response = self
            .http
            .get(url)
            .header(reqwest::header::RANGE, "bytes=0-0")
            .send()
            .await
            .map_err(|error| download_failure(url, None, 0, &error.to_string()))?;

        if response.status().as_u16() != 206 {
            return Ok(None);
        }

        let total = response
            .headers()
            .get(reqwest::header::CONTENT_RANGE)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| CONTENT_RANGE_TOTAL_REGEX.captures(value))
            .and_then(|caps| caps.get(1))
            .and_then(|m| m.as_str().parse::<u64>().ok());

        Ok(total.filter(|total| *total > 0))
    }

    /// Split `[0..total)` into chunks and download them with bounded
    /// concurrency. Chunk bodies travel through a channel to one writer
    /// task that seeks into the pre-truncated file, so output byte order
    /// is exact regardless of completion order. The first chunk error
    /// cancels all siblings.
    async fn chunked_download(
        &self,
        url: &str,
        path: &Path,
        total: u64,
    ) -> Result<u64, VideoError> {
        let mut file = tokio::fs::File::create(path).await?;
        file.set_len(total).await?;

        let concurrency = self.options.max_concurrency.max(1);
        let (tx, mut rx) = mpsc::channel::<(u64, Bytes)>(concurrency);

        let writer = tokio::spawn(async move {
            let mut written: u64 = 0;
            while let Some((offset, bytes)) = rx.recv().await {
                file.seek(std::io::SeekFrom::Start(offset)).await?;
                file.write_all(&bytes).await?;
                written += bytes.len() as u64;
            }
            file.flush().await?;
            Ok::<u64, std::io::Error>(written)
        });

        let semaphore = std::sync::Arc::new(Semaphore::new(concurrency));
        let mut tasks: JoinSet<Result<(), VideoError>> = JoinSet::new();

        let chunk_size = self.options.chunk_size.max(1);
        let mut offset = 0u64;
        while offset < total {
            let end = (offset + chunk_size - 1).min(total - 1);
            let client = self.http.clone();
            let policy = self.options.retry.clone();
            let url = url.to_string();
            let tx = tx.clone();
            let semaphore = semaphore.clone();

            tasks.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|_| download_failure(&url, None, 0, "download cancelled"))?;
                let bytes = fetch_range(&client, &policy, &url, offset, end).await?;
                tx.send((offset, bytes))
                    .await
                    .map_err(|_| download_failure(&url, None, 0, "writer gone"))?;
                Ok(())
            });

            offset = end + 1;
        }
        drop(tx);

        let mut failure: Option<VideoError> = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(error)) => {
                    failure = Some(error);
                    tasks.abort_all();
                }
                Err(join_error) if join_error.is_cancelled() => {}
                Err(join_error) => {
                    failure = Some(download_failure(url, None, 0, &join_error.to_string()));
                    tasks.abort_all();
                }
            }
        }

        let written = writer
            .await
            .map_err(|error| VideoError::IoError(error.to_string()))??;

        if let Some(error) = failure {
            return Err(error);
        }

        if written != total {
            return Err(download_failure(
                url,
                None,
                0,
                &format!("wrote {written} of {total} bytes"),
            ));
        }

        Ok(total)
    }

    /// Plain streaming download into a truncated file.
    async fn full_rewrite(&self, url: &str, path: &Path) -> Result<u64, VideoError> {
        let mut attempt = 0u32;
        loop {
            let result = self.full_rewrite_once(url, path).await;
            match result {
                Ok(written) => return Ok(written),
                Err(error) => {
                    let retriable = matches!(
                        &error,
                        VideoError::DownloadFailure { detail }
                            if detail.http_status.map_or(true, |status| {
                                self.options.retry.is_retriable_status(status)
                            })
                    );
                    if !retriable || attempt >= self.options.retry.max_retries {
                        return Err(error);
                    }
                    let delay = backoff_delay(&self.options.retry, attempt, None);
                    log::debug!("full rewrite retry {attempt} after {delay:?}");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn full_rewrite_once(&self, url: &str, path: &Path) -> Result<u64, VideoError> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|error| download_failure(url, None, 0, &error.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(download_failure(
                url,
                Some(status.as_u16()),
                0,
                &format!("download returned {status}"),
            ));
        }

        let expected = response.content_length();
        let mut file = tokio::fs::File::create(path).await?;
        let written = stream_body_to(response, &mut file, url).await?;
        file.flush().await?;

        if let Some(expected) = expected {
            if written != expected {
                return Err(download_failure(
                    url,
                    None,
                    0,
                    &format!("wrote {written} of {expected} bytes"),
                ));
            }
        }

        Ok(written)
    }

    /// Retrying text fetch for playlist/manifest refresh loops.
    pub(crate) async fn fetch_text_with_retry(&self, url: &str) -> Result<String, VideoError> {
        let mut attempt = 0u32;
        loop {
            let outcome = self.fetch_text_once(url).await;
            match outcome {
                Ok(body) => return Ok(body),
                Err((error, retriable, retry_after)) => {
                    if !retriable || attempt >= self.options.retry.max_retries {
                        return Err(error);
                    }
                    let delay = backoff_delay(&self.options.retry, attempt, retry_after);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn fetch_text_once(
        &self,
        url: &str,
    ) -> Result<String, (VideoError, bool, Option<Duration>)> {
        let response = self.http.get(url).send().await.map_err(|error| {
            (
                download_failure(url, None, 0, &error.to_string()),
                true,
                None,
            )
        })?;

        let status = response.status().as_u16();
        if !response.status().is_success() {
            let retry_after = parse_retry_after(response.headers());
            return Err((
                download_failure(url, Some(status), 0, &format!("fetch returned {status}")),
                self.options.retry.is_retriable_status(status),
                retry_after,
            ));
        }

        response
            .text()
            .await
            .map_err(|error| (VideoError::Reqwest(error), true, None))
    }

    /// Retrying binary fetch for HLS/DASH segments.
    pub(crate) async fn fetch_bytes_with_retry(&self, url: &str) -> Result<Bytes, VideoError> {
        fetch_bytes_retrying(&self.http, &self.options.retry, url).await
    }
}

/// Whole-body fetch with the download retry policy, shareable by spawned
/// segment tasks.
pub(crate) async fn fetch_bytes_retrying(
    client: &reqwest::Client,
    policy: &RetryPolicy,
    url: &str,
) -> Result<Bytes, VideoError> {
    let mut attempt = 0u32;
    loop {
        let outcome = fetch_bytes_once(client, url).await;
        match outcome {
            Ok(bytes) => return Ok(bytes),
            Err((error, status, retry_after)) => {
                let retriable = status.map_or(true, |code| policy.is_retriable_status(code));
                if !retriable || attempt >= policy.max_retries {
                    return Err(error);
                }
                let delay = backoff_delay(policy, attempt, retry_after);
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

async fn fetch_bytes_once(
    client: &reqwest::Client,
    url: &str,
) -> Result<Bytes, (VideoError, Option<u16>, Option<Duration>)> {
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|error| (download_failure(url, None, 0, &error.to_string()), None, None))?;

    let status = response.status().as_u16();
    if !response.status().is_success() {
        let retry_after = parse_retry_after(response.headers());
        return Err((
            download_failure(url, Some(status), 0, &format!("segment returned {status}")),
            Some(status),
            retry_after,
        ));
    }

    response
        .bytes()
        .await
        .map_err(|error| (download_failure(url, None, 0, &error.to_string()), None, None))
}

enum ResumeOutcome {
    Completed(u64),
    Resumed(u64),
    RangeUnsupported,
}

async fn existing_size(path: &Path) -> Option<u64> {
    tokio::fs::metadata(path)
        .await
        .ok()
        .filter(|meta| meta.is_file() && meta.len() > 0)
        .map(|meta| meta.len())
}

async fn stream_body_to(
    mut response: reqwest::Response,
    file: &mut tokio::fs::File,
    url: &str,
) -> Result<u64, VideoError> {
    let mut written = 0u64;
    loop {
        let chunk = response
            .chunk()
            .await
            .map_err(|error| download_failure(url, None, 0, &error.to_string()))?;
        match chunk {
            Some(bytes) => {
                file.write_all(&bytes).await?;
                written += bytes.len() as u64;
            }
            None => return Ok(written),
        }
    }
}

/// Fetch one byte range with the engine retry policy. Transport errors
/// always retry; HTTP failures only when the policy lists the status.
pub(crate) async fn fetch_range(
    client: &reqwest::Client,
    policy: &RetryPolicy,
    url: &str,
    start: u64,
    end: u64,
) -> Result<Bytes, VideoError> {
    let mut attempt = 0u32;
    loop {
        let outcome = fetch_range_once(client, url, start, end).await;
        match outcome {
            Ok(bytes) => return Ok(bytes),
            Err((error, status, retry_after)) => {
                let retriable = status.map_or(true, |code| policy.is_retriable_status(code));
                if !retriable || attempt >= policy.max_retries {
                    return Err(error);
                }
                let delay = backoff_delay(policy, attempt, retry_after);
                log::debug!("chunk {start}-{end} retry {attempt} after {delay:?}");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

async fn fetch_range_once(
    client: &reqwest::Client,
    url: &str,
    start: u64,
    end: u64,
) -> Result<Bytes, (VideoError, Option<u16>, Option<Duration>)> {
    let response = client
        .get(url)
        .header(reqwest::header::RANGE, format!("bytes={start}-{end}"))
        .send()
        .await
        .map_err(|error| (download_failure(url, None, 0, &error.to_string()), None, None))?;

    let status = response.status().as_u16();
    if !(status == 206 || status == 200) {
        let retry_after = parse_retry_after(response.headers());
        return Err((
            download_failure(url, Some(status), 0, &format!("range returned {status}")),
            Some(status),
            retry_after,
        ));
    }

    response
        .bytes()
        .await
        .map_err(|error| (download_failure(url, None, 0, &error.to_string()), None, None))
}

/// Exponential backoff capped at the policy maximum, honoring a larger
/// `Retry-After` and adding a little jitter.
pub(crate) fn backoff_delay(
    policy: &RetryPolicy,
    attempt: u32,
    retry_after: Option<Duration>,
) -> Duration {
    let exponential = policy
        .initial_backoff
        .checked_mul(1u32 << attempt.min(16))
        .unwrap_or(policy.max_backoff)
        .min(policy.max_backoff);

    let base = match retry_after {
        Some(hinted) if hinted > exponential => hinted,
        _ => exponential,
    };

    let jitter = rand::thread_rng().gen_range(0..=(base.as_millis() as u64 / 10).max(1));
    base + Duration::from_millis(jitter)
}

pub(crate) fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

pub(crate) fn download_failure(
    url: &str,
    http_status: Option<u16>,
    attempt: u32,
    reason: &str,
) -> VideoError {
    VideoError::DownloadFailure {
        detail: DownloadFailureDetail {
            http_status,
            url_host: url_host(url).unwrap_or_default(),
            url_has_n: url_query_value(url, "n").is_some(),
            url_has_pot: url_query_value(url, "pot").is_some() || url.contains("/pot/"),
            url_has_signature: url_query_value(url, "sig").is_some()
                || url_query_value(url, "signature").is_some(),
            attempt,
            reason: reason.to_string(),
        },
    }
}
