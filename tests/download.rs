use std::time::Duration;

use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

use ytfetch::{
    Client, DownloadOptions, DownloadRequest, FormatPick, InnertubeOptions, PlayerJsOptions,
    RetryPolicy, VideoOptions,
};

/// Serves a fixed body honoring `Range` requests with 206 responses and
/// `Content-Range` headers, like a CDN edge.
struct RangeResponder {
    body: Vec<u8>,
}

impl Respond for RangeResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let total = self.body.len() as u64;
        let range = request
            .headers
            .get("range")
            .and_then(|value| value.to_str().ok())
            .and_then(parse_range);

        match range {
            Some((start, end)) => {
                if start >= total {
                    return ResponseTemplate::new(416);
                }
                let end = end.map_or(total - 1, |end| end.min(total - 1));
                ResponseTemplate::new(206)
                    .insert_header(
                        "Content-Range",
                        format!("bytes {start}-{end}/{total}").as_str(),
                    )
                    .set_body_bytes(self.body[start as usize..=end as usize].to_vec())
            }
            None => ResponseTemplate::new(200).set_body_bytes(self.body.clone()),
        }
    }
}

fn parse_range(raw: &str) -> Option<(u64, Option<u64>)> {
    let raw = raw.strip_prefix("bytes=")?;
    let (start, end) = raw.split_once('-')?;
    Some((start.parse().ok()?, end.parse().ok()))
}

fn test_body() -> Vec<u8> {
    (0u32..12_345).map(|i| (i * 7 % 251) as u8).collect()
}

fn options(base: &str, chunked: bool) -> VideoOptions {
    VideoOptions {
        innertube: InnertubeOptions {
            api_base_url: Some(base.to_string()),
            client_overrides: Some(vec!["web".to_string()]),
            client_hedge_delay: Duration::from_millis(10),
            ..Default::default()
        },
        player_js: PlayerJsOptions {
            base_url: Some(base.to_string()),
            ..Default::default()
        },
        download: DownloadOptions {
            enable_chunked: chunked,
            chunk_size: 1024,
            max_concurrency: 4,
            retry: RetryPolicy {
                max_retries: 2,
                initial_backoff: Duration::from_millis(10),
                max_backoff: Duration::from_millis(50),
                ..RetryPolicy::download_default()
            },
            ..Default::default()
        },
        ..Default::default()
    }
}

async fn mount_player_api(server: &MockServer, media_url: &str) {
    Mock::given(method("POST"))
        .and(path("/youtubei/v1/player"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "playabilityStatus": { "status": "OK" },
            "streamingData": {
                "formats": [{
                    "itag": 18,
                    "mimeType": "video/mp4; codecs=\"avc1.42001E, mp4a.40.2\"",
                    "bitrate": 500000,
                    "width": 320,
                    "height": 240,
                    "contentLength": "12345",
                    "url": media_url
                }]
            },
            "videoDetails": { "title": "download test", "lengthSeconds": "19" }
        })))
        .mount(server)
        .await;
}

#[tokio::test]
async fn chunked_download_is_byte_identical() {
    let body = test_body();

    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/media/video.mp4"))
        .respond_with(RangeResponder { body: body.clone() })
        .mount(&server)
        .await;
    let media_url = format!("{}/media/video.mp4", server.uri());
    mount_player_api(&server, &media_url).await;

    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("video.mp4");

    let client = Client::with_options(options(&server.uri(), true)).unwrap();
    let outcome = client
        .download(
            "jNQXAC9IVRw",
            DownloadRequest::new(FormatPick::Itag(18), &output),
        )
        .await
        .unwrap();

    assert_eq!(outcome.bytes, body.len() as u64);
    assert_eq!(outcome.itag, 18);
    let written = std::fs::read(&output).unwrap();
    assert_eq!(written, body);

    // Probe plus at least one real chunk means several range requests.
    let range_calls = server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .filter(|request| {
            request.url.path() == "/media/video.mp4" && request.headers.get("range").is_some()
        })
        .count();
    assert!(range_calls > 1, "expected ranged requests, got {range_calls}");
}

/// A server answering 200 to range requests forces exactly one full
/// streaming rewrite.
#[tokio::test]
async fn range_unsupported_falls_back_to_full_rewrite() {
    let body = test_body();

    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/media/video.mp4"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
        .mount(&server)
        .await;
    let media_url = format!("{}/media/video.mp4", server.uri());
    mount_player_api(&server, &media_url).await;

    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("video.mp4");

    let client = Client::with_options(options(&server.uri(), true)).unwrap();
    let outcome = client
        .download(
            "jNQXAC9IVRw",
            DownloadRequest::new(FormatPick::Itag(18), &output),
        )
        .await
        .unwrap();

    assert_eq!(outcome.bytes, body.len() as u64);
    assert_eq!(std::fs::read(&output).unwrap(), body);

    // Probe answered 200, then exactly one full-body request.
    let media_calls = server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .filter(|request| request.url.path() == "/media/video.mp4")
        .count();
    assert_eq!(media_calls, 2);
}

#[tokio::test]
async fn resume_appends_remaining_bytes() {
    let body = test_body();

    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/media/video.mp4"))
        .respond_with(RangeResponder { body: body.clone() })
        .mount(&server)
        .await;
    let media_url = format!("{}/media/video.mp4", server.uri());
    mount_player_api(&server, &media_url).await;

    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("video.mp4");
    std::fs::write(&output, &body[..5000]).unwrap();

    let client = Client::with_options(options(&server.uri(), true)).unwrap();
    let mut request = DownloadRequest::new(FormatPick::Itag(18), &output);
    request.resume = true;
    let outcome = client.download("jNQXAC9IVRw", request).await.unwrap();

    assert_eq!(outcome.bytes, body.len() as u64);
    assert_eq!(std::fs::read(&output).unwrap(), body);
}

#[tokio::test]
async fn resume_of_complete_file_is_a_noop() {
    let body = test_body();

    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/media/video.mp4"))
        .respond_with(RangeResponder { body: body.clone() })
        .mount(&server)
        .await;
    let media_url = format!("{}/media/video.mp4", server.uri());
    mount_player_api(&server, &media_url).await;

    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("video.mp4");
    std::fs::write(&output, &body).unwrap();

    let client = Client::with_options(options(&server.uri(), true)).unwrap();
    let mut request = DownloadRequest::new(FormatPick::Itag(18), &output);
    request.resume = true;
    let outcome = client.download("jNQXAC9IVRw", request).await.unwrap();

    assert_eq!(outcome.bytes, body.len() as u64);
    assert_eq!(std::fs::read(&output).unwrap(), body);
}

#[tokio::test]
async fn hls_download_assembles_segments_without_duplicates() {
    let server = MockServer::start().await;

    let master = format!(
        "#EXTM3U\n#EXT-X-STREAM-INF:BANDWIDTH=1500000,RESOLUTION=640x360,CODECS=\"avc1.4d401f,mp4a.40.2\"\n{}/hls/itag/95/media.m3u8\n",
        server.uri()
    );
    let live_playlist = concat!(
        "#EXTM3U\n",
        "#EXT-X-VERSION:3\n",
        "#EXT-X-TARGETDURATION:1\n",
        "#EXT-X-MEDIA-SEQUENCE:0\n",
        "#EXTINF:1.0,\n",
        "seg0.ts\n",
        "#EXTINF:1.0,\n",
        "seg1.ts\n",
    );
    let ended_playlist = concat!(
        "#EXTM3U\n",
        "#EXT-X-VERSION:3\n",
        "#EXT-X-TARGETDURATION:1\n",
        "#EXT-X-MEDIA-SEQUENCE:0\n",
        "#EXTINF:1.0,\n",
        "seg0.ts\n",
        "#EXTINF:1.0,\n",
        "seg1.ts\n",
        "#EXT-X-ENDLIST\n",
    );

    Mock::given(method("POST"))
        .and(path("/youtubei/v1/player"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "playabilityStatus": { "status": "OK" },
            "streamingData": {
                "hlsManifestUrl": format!("{}/hls/master.m3u8", server.uri())
            },
            "videoDetails": { "title": "live test", "lengthSeconds": "0" }
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/hls/master.m3u8"))
        .respond_with(ResponseTemplate::new(200).set_body_string(master))
        .mount(&server)
        .await;
    // First refresh sees an open playlist, the second one is unchanged
    // except for ENDLIST: no segment may be written twice.
    Mock::given(method("GET"))
        .and(path("/hls/itag/95/media.m3u8"))
        .respond_with(ResponseTemplate::new(200).set_body_string(live_playlist))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/hls/itag/95/media.m3u8"))
        .respond_with(ResponseTemplate::new(200).set_body_string(ended_playlist))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/hls/itag/95/seg0.ts"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"AAAA".to_vec()))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/hls/itag/95/seg1.ts"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"BBBB".to_vec()))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("live.ts");

    let client = Client::with_options(options(&server.uri(), false)).unwrap();
    let outcome = client
        .download(
            "jNQXAC9IVRw",
            DownloadRequest::new(FormatPick::Itag(95), &output),
        )
        .await
        .unwrap();

    assert_eq!(outcome.bytes, 8);
    assert_eq!(std::fs::read(&output).unwrap(), b"AAAABBBB");
}
