use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use ytfetch::{
    Client, InnertubeOptions, PlayerJsOptions, PlayerSource, VideoError, VideoOptions,
};

/// Player script whose signature scrambler strips the first character
/// (one splice op) and whose n transform drops the first character.
const PLAYER_JS: &str = concat!(
    r#"var Ou={pk:function(a,b){a.splice(0,b)}};"#,
    r#"var Wka=function(a){a=a.split("");Ou.pk(a,1);return a.join("")};"#,
    r#"Xno=function(a){return a.slice(1)};"#,
    r#"var bquc=[Xno];"#,
    r#"g.D=function(a){var b,c;(c=a.get("n"))&&(b=bquc[0](c)||dW0)};"#,
    r#"var cfg={signatureTimestamp:19876};"#
);

struct StubPlayer;

#[async_trait]
impl PlayerSource for StubPlayer {
    async fn get_player_url(&self, _video_id: &str) -> Result<String, VideoError> {
        Ok("/s/player/feedface/player_ias.vflset/en_US/base.js".to_string())
    }

    async fn get_player_js(&self, _player_url: &str) -> Result<String, VideoError> {
        Ok(PLAYER_JS.to_string())
    }
}

fn options(base: &str) -> VideoOptions {
    VideoOptions {
        innertube: InnertubeOptions {
            api_base_url: Some(base.to_string()),
            client_overrides: Some(vec!["web".to_string()]),
            client_hedge_delay: Duration::from_millis(10),
            ..Default::default()
        },
        player_js: PlayerJsOptions {
            base_url: Some(base.to_string()),
            resolver: Some(Arc::new(StubPlayer)),
            ..Default::default()
        },
        ..Default::default()
    }
}

fn query_value(url: &str, name: &str) -> Option<String> {
    let parsed = url::Url::parse(url).ok()?;
    parsed
        .query_pairs()
        .find_map(|(key, value)| (key == name).then(|| value.into_owned()))
}

#[tokio::test]
async fn resolves_ciphered_format_url() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/youtubei/v1/player"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "playabilityStatus": { "status": "OK" },
            "streamingData": {
                "adaptiveFormats": [{
                    "itag": 140,
                    "mimeType": "audio/mp4; codecs=\"mp4a.40.2\"",
                    "bitrate": 128000,
                    "audioChannels": 2,
                    "audioSampleRate": "44100",
                    "signatureCipher":
                        "url=https%3A%2F%2Fexample.com%2Faudio%3Fn%3Dabcd&s=xyz&sp=sig"
                }]
            },
            "videoDetails": { "title": "cipher test", "lengthSeconds": "60" }
        })))
        .mount(&server)
        .await;

    let client = Client::with_options(options(&server.uri())).unwrap();
    let url = client
        .resolve_stream_url("jNQXAC9IVRw", 140)
        .await
        .unwrap();

    // splice(1) on "xyz" leaves "yz"; n "abcd" becomes "bcd".
    assert_eq!(query_value(&url, "sig").as_deref(), Some("yz"));
    assert_eq!(query_value(&url, "n").as_deref(), Some("bcd"));
    assert!(url.starts_with("https://example.com/audio"));
}

#[tokio::test]
async fn ciphered_format_is_materialized_in_list() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/youtubei/v1/player"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "playabilityStatus": { "status": "OK" },
            "streamingData": {
                "adaptiveFormats": [{
                    "itag": 140,
                    "mimeType": "audio/mp4; codecs=\"mp4a.40.2\"",
                    "bitrate": 128000,
                    "audioChannels": 2,
                    "signatureCipher":
                        "url=https%3A%2F%2Fexample.com%2Faudio%3Fn%3Dabcd&s=xyz&sp=sig"
                }]
            },
            "videoDetails": { "title": "cipher test", "lengthSeconds": "60" }
        })))
        .mount(&server)
        .await;

    let client = Client::with_options(options(&server.uri())).unwrap();
    let formats = client.get_formats("jNQXAC9IVRw").await.unwrap();

    assert_eq!(formats.len(), 1);
    // The batch solver already ran, so the list entry is playable and no
    // longer counts as ciphered.
    assert!(!formats[0].ciphered);
    assert_eq!(query_value(&formats[0].url, "sig").as_deref(), Some("yz"));
}

#[tokio::test]
async fn unsolvable_challenge_keeps_format_ciphered() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/youtubei/v1/player"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "playabilityStatus": { "status": "OK" },
            "streamingData": {
                "adaptiveFormats": [{
                    "itag": 140,
                    "mimeType": "audio/mp4; codecs=\"mp4a.40.2\"",
                    "bitrate": 128000,
                    "audioChannels": 2,
                    "signatureCipher":
                        "url=https%3A%2F%2Fexample.com%2Faudio%3Fn%3Dabcd&s=xyz&sp=sig"
                }]
            },
            "videoDetails": { "title": "cipher test", "lengthSeconds": "60" }
        })))
        .mount(&server)
        .await;

    struct BrokenPlayer;

    #[async_trait]
    impl PlayerSource for BrokenPlayer {
        async fn get_player_url(&self, _video_id: &str) -> Result<String, VideoError> {
            Ok("/s/player/feedface/player_ias.vflset/en_US/base.js".to_string())
        }

        async fn get_player_js(&self, _player_url: &str) -> Result<String, VideoError> {
            Ok("var nothing=1;".to_string())
        }
    }

    let mut options = options(&server.uri());
    options.player_js.resolver = Some(Arc::new(BrokenPlayer));

    let client = Client::with_options(options).unwrap();
    let formats = client.get_formats("jNQXAC9IVRw").await.unwrap();

    assert_eq!(formats.len(), 1);
    assert!(formats[0].ciphered);
    assert!(formats[0].url.is_empty());

    // Strict materialization reports the standing challenge.
    let error = client
        .resolve_stream_url("jNQXAC9IVRw", 140)
        .await
        .unwrap_err();
    assert!(matches!(error, VideoError::ChallengeNotSolved { .. }));
}
