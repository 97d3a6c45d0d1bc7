use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest_middleware::ClientWithMiddleware;
use serde_json::json;
use tokio::task::JoinHandle;

use super::auth::{build_auth_headers, has_sapisid, parse_cookie_header, SessionIdentity};
use super::profiles::ClientProfile;
use super::selector::{select_clients, ClientPlan};
use crate::cache::PoTokenCache;
use crate::constants::INNERTUBE_PLAYER_PATH;
use crate::errors::{AttemptDetail, AttemptStage, VideoError};
use crate::events::{EventPhase, EventSink, ExtractionStage};
use crate::player::WatchPageSnapshot;
use crate::structs::{PlayerResponse, PoTokenFetchPolicy, Protocol, VideoOptions};

const ALL_PROTOCOLS: [Protocol; 3] = [Protocol::Https, Protocol::Dash, Protocol::Hls];

/// Successful extraction of a player response, with the full attempt log.
pub(crate) struct PlayerOutcome {
    pub response: PlayerResponse,
    pub source_client: &'static ClientProfile,
    pub attempts: Vec<AttemptDetail>,
}

/// Races emulated player clients against the Innertube player endpoint
/// and commits the first success in client priority order.
pub(crate) struct Orchestrator {
    http: ClientWithMiddleware,
    options: Arc<VideoOptions>,
    events: EventSink,
    po_tokens: Arc<PoTokenCache>,
}

enum PhaseOutcome {
    Success {
        response: PlayerResponse,
        client: &'static ClientProfile,
        attempts: Vec<AttemptDetail>,
    },
    Failed(Vec<AttemptDetail>),
}

impl Orchestrator {
    pub fn new(
        http: ClientWithMiddleware,
        options: Arc<VideoOptions>,
        events: EventSink,
        po_tokens: Arc<PoTokenCache>,
    ) -> Self {
        Self {
            http,
            options,
            events,
            po_tokens,
        }
    }

    pub fn http(&self) -> &ClientWithMiddleware {
        &self.http
    }

    pub async fn fetch_player_response(
        &self,
        video_id: &str,
        page: Option<&WatchPageSnapshot>,
    ) -> Result<PlayerOutcome, VideoError> {
        let cookies = self
            .options
            .request_options
            .cookies
            .as_deref()
            .map(parse_cookie_header)
            .unwrap_or_default();
        // Cookie-carrying sessions prefer the tv_downgraded plan; the
        // Authorization hashes additionally need SAPISID-family cookies.
        let authenticated = !cookies.is_empty();

        let plan: ClientPlan = select_clients(&self.options.innertube, authenticated)?;
        if plan.primary.is_empty() && plan.fallback.is_empty() {
            return Err(VideoError::AllClientsFailed {
                attempts: Vec::new(),
            });
        }

        let mut attempts = Vec::new();

        match self
            .run_phase(&plan.primary, video_id, page, &cookies)
            .await
        {
            PhaseOutcome::Success {
                response,
                client,
                attempts: phase_attempts,
            } => {
                attempts.extend(phase_attempts);
                return Ok(PlayerOutcome {
                    response,
                    source_client: client,
                    attempts,
                });
            }
            PhaseOutcome::Failed(phase_attempts) => attempts.extend(phase_attempts),
        }

        // The fallback phase exists for playability gates only; plain
        // transport trouble will not get better on an embedded client.
        let gated = attempts.iter().any(AttemptDetail::gates_playability);
        if !plan.fallback.is_empty() && gated {
            log::debug!("primary phase gated, racing fallback clients");
            match self
                .run_phase(&plan.fallback, video_id, page, &cookies)
                .await
            {
                PhaseOutcome::Success {
                    response,
                    client,
                    attempts: phase_attempts,
                } => {
                    attempts.extend(phase_attempts);
                    return Ok(PlayerOutcome {
                        response,
                        source_client: client,
                        attempts,
                    });
                }
                PhaseOutcome::Failed(phase_attempts) => attempts.extend(phase_attempts),
            }
        }

        Err(VideoError::AllClientsFailed { attempts })
    }

    /// Launch every client of the phase concurrently (hedged by position)
    /// and commit results in client order: a success at position `k` is
    /// returned only after all positions `< k` have resolved.
    async fn run_phase(
        &self,
        clients: &[&'static ClientProfile],
        video_id: &str,
        page: Option<&WatchPageSnapshot>,
        cookies: &HashMap<String, String>,
    ) -> PhaseOutcome {
        let hedge = self.options.innertube.client_hedge_delay;

        let mut handles: Vec<(
            &'static ClientProfile,
            JoinHandle<Result<PlayerResponse, AttemptDetail>>,
        )> = Vec::with_capacity(clients.len());

        for (position, &profile) in clients.iter().enumerate() {
            self.events.extraction(
                ExtractionStage::PlayerApiJson,
                EventPhase::Start,
                Some(profile.id),
                None,
            );

            let request = match self.prepare_attempt(profile, video_id, page, cookies).await {
                Ok(request) => request,
                Err(detail) => {
                    // Policy failures are committed without a launch.
                    let (done_tx, done_rx) = tokio::sync::oneshot::channel();
                    let _ = done_tx.send(Err(detail));
                    handles.push((
                        profile,
                        tokio::spawn(async move { done_rx.await.expect("attempt channel") }),
                    ));
                    continue;
                }
            };

            let delay = hedge
                .checked_mul(position as u32)
                .unwrap_or(Duration::ZERO);
            handles.push((
                profile,
                tokio::spawn(async move {
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    request.execute().await
                }),
            ));
        }

        let mut attempts = Vec::new();
        let mut committed: Option<(PlayerResponse, &'static ClientProfile)> = None;

        for (profile, handle) in handles {
            if committed.is_some() {
                // The phase already has its winner, siblings get cancelled.
                handle.abort();
                continue;
            }

            match handle.await {
                Ok(Ok(response)) => {
                    self.events.extraction(
                        ExtractionStage::PlayerApiJson,
                        EventPhase::Success,
                        Some(profile.id),
                        None,
                    );
                    committed = Some((response, profile));
                }
                Ok(Err(detail)) => {
                    self.events.extraction(
                        ExtractionStage::PlayerApiJson,
                        EventPhase::Failure,
                        Some(profile.id),
                        Some(detail.reason.clone()),
                    );
                    attempts.push(detail);
                }
                Err(join_error) => {
                    attempts.push(AttemptDetail {
                        client: profile.id.to_string(),
                        stage: Some(AttemptStage::Request),
                        reason: format!("attempt task failed: {join_error}"),
                        ..Default::default()
                    });
                }
            }
        }

        match committed {
            Some((response, client)) => PhaseOutcome::Success {
                response,
                client,
                attempts,
            },
            None => PhaseOutcome::Failed(attempts),
        }
    }

    /// Resolve PO-token policy, headers and body for one client attempt.
    async fn prepare_attempt(
        &self,
        profile: &'static ClientProfile,
        video_id: &str,
        page: Option<&WatchPageSnapshot>,
        cookies: &HashMap<String, String>,
    ) -> Result<AttemptRequest, AttemptDetail> {
        let innertube = &self.options.innertube;

        let po_token = self.resolve_po_token(profile).await?;

        let visitor_data = innertube
            .visitor_data
            .clone()
            .or_else(|| cookies.get("VISITOR_INFO1_LIVE").cloned())
            .or_else(|| page.and_then(|p| p.visitor_data.clone()));

        let api_key = if innertube.enable_dynamic_api_key_resolution {
            page.and_then(|p| p.api_key.as_deref())
                .unwrap_or(profile.api_key)
        } else {
            profile.api_key
        };

        let signature_timestamp = page.and_then(|p| p.sts);

        let base = innertube
            .api_base_url
            .clone()
            .unwrap_or_else(|| profile.origin());
        let url = format!("{base}{INNERTUBE_PLAYER_PATH}?key={api_key}&prettyPrint=false");

        let body = build_player_request_body(
            profile,
            video_id,
            visitor_data.as_deref(),
            signature_timestamp,
            po_token.as_deref(),
            innertube.use_ad_playback_context,
        );

        let headers = self.build_headers(profile, video_id, visitor_data.as_deref(), page, cookies);

        Ok(AttemptRequest {
            http: self.http.clone(),
            profile,
            url,
            headers,
            body,
        })
    }

    /// Enforce the effective PO-token policy for this profile across all
    /// protocols. Required without a usable token fails the attempt;
    /// recommended is best effort.
    async fn resolve_po_token(
        &self,
        profile: &'static ClientProfile,
    ) -> Result<Option<String>, AttemptDetail> {
        let overrides = &self.options.innertube.po_token_fetch_policy;

        let mut required_protocols = Vec::new();
        let mut recommended = false;
        for protocol in ALL_PROTOCOLS {
            let effective = match overrides.get(&protocol) {
                Some(PoTokenFetchPolicy::Required) => PoTokenFetchPolicy::Required,
                Some(PoTokenFetchPolicy::Never) => PoTokenFetchPolicy::Never,
                Some(PoTokenFetchPolicy::Recommended) => PoTokenFetchPolicy::Recommended,
                None => {
                    let policy = profile.policy_for(protocol);
                    if policy.required {
                        PoTokenFetchPolicy::Required
                    } else if policy.recommended {
                        PoTokenFetchPolicy::Recommended
                    } else {
                        PoTokenFetchPolicy::Never
                    }
                }
            };
            match effective {
                PoTokenFetchPolicy::Required => required_protocols.push(protocol),
                PoTokenFetchPolicy::Recommended => recommended = true,
                PoTokenFetchPolicy::Never => {}
            }
        }

        if required_protocols.is_empty() && !recommended {
            return Ok(None);
        }

        let provider_available = self.po_tokens.provider_available();
        let lookup = self.po_tokens.token_for(profile.id).await;

        match lookup {
            Ok(Some(token)) => Ok(Some(token)),
            Ok(None) if required_protocols.is_empty() => Ok(None),
            Ok(None) => Err(po_token_detail(
                profile,
                &required_protocols,
                provider_available,
                if provider_available {
                    "provider returned an empty token"
                } else {
                    "no provider configured"
                },
            )),
            Err(error) if required_protocols.is_empty() => {
                log::warn!("po token provider failed for {}: {error}", profile.id);
                Ok(None)
            }
            Err(error) => Err(po_token_detail(
                profile,
                &required_protocols,
                provider_available,
                &format!("provider error: {error}"),
            )),
        }
    }

    fn build_headers(
        &self,
        profile: &'static ClientProfile,
        video_id: &str,
        visitor_data: Option<&str>,
        page: Option<&WatchPageSnapshot>,
        cookies: &HashMap<String, String>,
    ) -> HeaderMap {
        let mut headers = HeaderMap::new();
        insert(&mut headers, "content-type", "application/json");
        insert(&mut headers, "x-youtube-client-name", profile.context_name_id);
        insert(
            &mut headers,
            "x-youtube-client-version",
            profile.client_version,
        );
        insert(&mut headers, "user-agent", profile.user_agent);
        let origin = profile.origin();
        insert(&mut headers, "origin", &origin);
        insert(&mut headers, "x-origin", &origin);
        insert(
            &mut headers,
            "referer",
            &format!("{origin}/watch?v={video_id}"),
        );
        if let Some(visitor) = visitor_data {
            insert(&mut headers, "x-goog-visitor-id", visitor);
        }

        if profile.supports_cookies && !cookies.is_empty() {
            if let Some(raw) = self.options.request_options.cookies.as_deref() {
                insert(&mut headers, "cookie", raw);
            }

            if has_sapisid(cookies) {
                let identity = SessionIdentity {
                    session_index: page.and_then(|p| p.session_index.clone()),
                    delegated_session_id: page.and_then(|p| p.delegated_session_id.clone()),
                    user_session_id: page.and_then(|p| p.user_session_id.clone()),
                };
                let auth = build_auth_headers(cookies, &origin, &identity);
                if let Some(authorization) = auth.authorization {
                    insert(&mut headers, "authorization", &authorization);
                }
                if let Some(page_id) = auth.page_id {
                    insert(&mut headers, "x-goog-pageid", &page_id);
                }
                if let Some(auth_user) = auth.auth_user {
                    insert(&mut headers, "x-goog-authuser", &auth_user);
                }
            }
        }

        headers
    }
}

struct AttemptRequest {
    http: ClientWithMiddleware,
    profile: &'static ClientProfile,
    url: String,
    headers: HeaderMap,
    body: serde_json::Value,
}

impl AttemptRequest {
    async fn execute(self) -> Result<PlayerResponse, AttemptDetail> {
        let mut detail = AttemptDetail {
            client: self.profile.id.to_string(),
            ..Default::default()
        };

        let response = self
            .http
            .post(&self.url)
            .headers(self.headers)
            .json(&self.body)
            .send()
            .await
            .map_err(|error| {
                detail.stage = Some(AttemptStage::Request);
                detail.reason = format!("player request failed: {error}");
                detail.clone()
            })?;

        let status = response.status();
        if !status.is_success() {
            detail.stage = Some(AttemptStage::Request);
            detail.http_status = Some(status.as_u16());
            detail.reason = format!("player request returned {status}");
            return Err(detail);
        }

        let text = response.text().await.map_err(|error| {
            detail.stage = Some(AttemptStage::Decode);
            detail.reason = format!("player response body unreadable: {error}");
            detail.clone()
        })?;

        let player_response: PlayerResponse =
            serde_json::from_str(&text).map_err(|error| {
                detail.stage = Some(AttemptStage::Decode);
                detail.reason = format!("player response undecodable: {error}");
                detail.clone()
            })?;

        if classify_playability(&player_response, &mut detail) {
            Ok(player_response)
        } else {
            detail.stage = Some(AttemptStage::Playability);
            Err(detail)
        }
    }
}

/// Success ⇔ `playabilityStatus.status == "OK"` or live-streamable.
/// Everything else gets classified into the attempt flags.
fn classify_playability(response: &PlayerResponse, detail: &mut AttemptDetail) -> bool {
    let (status, reason) = response.playability();

    let live_streamable = response
        .playability_status
        .as_ref()
        .map(|playability| playability.live_streamability.is_some())
        .unwrap_or(false)
        && response.streaming_data.is_some();

    match status {
        Some("OK") => return true,
        _ if live_streamable => return true,
        _ => {}
    }

    let status = status.unwrap_or("MISSING").to_string();
    let reason = reason.unwrap_or("").to_string();
    detail.playability_status = Some(status.clone());
    detail.playability_reason = (!reason.is_empty()).then(|| reason.clone());
    detail.reason = format!("playability {status}: {reason}");

    let status_upper = status.to_uppercase();
    let reason_upper = reason.to_uppercase();

    if status_upper.contains("LOGIN") || reason_upper.contains("SIGN IN") {
        detail.login_required = true;
    }
    if status_upper.contains("AGE") || reason_upper.contains("AGE") {
        detail.age_restricted = true;
        detail.login_required = true;
    }
    if reason_upper.contains("COUNTRY")
        || reason_upper.contains("REGION")
        || reason_upper.contains("NOT AVAILABLE IN YOUR")
    {
        detail.geo_restricted = true;
        detail.available_countries = response
            .micro_format
            .as_ref()
            .and_then(|m| m.player_micro_format_renderer.as_ref())
            .and_then(|m| m.available_countries.clone())
            .unwrap_or_default();
    }
    if status_upper.contains("UNPLAYABLE")
        || status_upper.contains("ERROR")
        || reason_upper.contains("PRIVATE")
        || reason_upper.contains("DELETED")
        || reason_upper.contains("UNAVAILABLE")
    {
        detail.unavailable = true;
    }

    let drm = response
        .streaming_data
        .as_ref()
        .map(|streaming| {
            streaming
                .adaptive_formats
                .iter()
                .flatten()
                .chain(streaming.formats.iter().flatten())
                .any(|format| format.drm_families.is_some())
        })
        .unwrap_or(false);
    detail.drm_protected = drm;

    false
}

fn build_player_request_body(
    profile: &ClientProfile,
    video_id: &str,
    visitor_data: Option<&str>,
    signature_timestamp: Option<u64>,
    po_token: Option<&str>,
    use_ad_playback_context: bool,
) -> serde_json::Value {
    let mut client = json!({
        "clientName": profile.client_name,
        "clientVersion": profile.client_version,
        "userAgent": profile.user_agent,
        "hl": "en",
        "gl": "US",
        "timeZone": "UTC",
        "utcOffsetMinutes": 0,
    });

    let client_map = client.as_object_mut().expect("client context object");
    if let Some(os_name) = profile.os_name {
        client_map.insert("osName".into(), json!(os_name));
    }
    if let Some(os_version) = profile.os_version {
        client_map.insert("osVersion".into(), json!(os_version));
    }
    if let Some(device_make) = profile.device_make {
        client_map.insert("deviceMake".into(), json!(device_make));
    }
    if let Some(device_model) = profile.device_model {
        client_map.insert("deviceModel".into(), json!(device_model));
    }
    if let Some(sdk) = profile.android_sdk_version {
        client_map.insert("androidSdkVersion".into(), json!(sdk));
    }
    if let Some(screen) = profile.screen {
        client_map.insert("clientScreen".into(), json!(screen));
    }
    if let Some(visitor) = visitor_data {
        client_map.insert("visitorData".into(), json!(visitor));
    }

    let mut context = json!({ "client": client });
    if profile.screen == Some("EMBED") {
        context["thirdParty"] = json!({ "embedUrl": "https://www.youtube.com/" });
    }

    let mut body = json!({
        "context": context,
        "videoId": video_id,
        "contentCheckOk": true,
        "racyCheckOk": true,
    });
    let body_map = body.as_object_mut().expect("player request object");

    if let Some(sts) = signature_timestamp {
        body_map.insert(
            "playbackContext".into(),
            json!({
                "contentPlaybackContext": {
                    "signatureTimestamp": sts,
                    "html5Preference": "HTML5_PREF_WANTS",
                }
            }),
        );
    }
    if let Some(params) = profile.player_params {
        body_map.insert("params".into(), json!(params));
    }
    if use_ad_playback_context && profile.supports_ad_playback_context {
        body_map.insert(
            "adPlaybackContext".into(),
            json!({ "pyv": true, "adType": "AD_TYPE_INSTREAM" }),
        );
    }
    if let Some(token) = po_token {
        body_map.insert(
            "serviceIntegrityDimensions".into(),
            json!({ "poToken": token }),
        );
    }

    body
}

fn po_token_detail(
    profile: &ClientProfile,
    protocols: &[Protocol],
    provider_available: bool,
    cause: &str,
) -> AttemptDetail {
    AttemptDetail {
        client: profile.id.to_string(),
        stage: Some(AttemptStage::PoToken),
        reason: format!("po token required: {cause}"),
        protocol: protocols.first().copied(),
        pot_required: true,
        pot_available: provider_available,
        ..Default::default()
    }
}

fn insert(headers: &mut HeaderMap, name: &'static str, value: &str) {
    if let (Ok(name), Ok(value)) = (
        HeaderName::from_bytes(name.as_bytes()),
        HeaderValue::from_str(value),
    ) {
        headers.insert(name, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::innertube::profiles::profile_by_id;

    #[test]
    fn body_carries_context_and_checks() {
        let profile = profile_by_id("web").unwrap();
        let body = build_player_request_body(
            profile,
            "jNQXAC9IVRw",
            Some("visitor"),
            Some(19876),
            Some("pot-token"),
            false,
        );

        assert_eq!(body["videoId"], "jNQXAC9IVRw");
        assert_eq!(body["context"]["client"]["clientName"], "WEB");
        assert_eq!(body["context"]["client"]["visitorData"], "visitor");
        assert_eq!(
            body["playbackContext"]["contentPlaybackContext"]["signatureTimestamp"],
            19876
        );
        assert_eq!(body["serviceIntegrityDimensions"]["poToken"], "pot-token");
        assert_eq!(body["contentCheckOk"], true);
    }

    #[test]
    fn embedded_profile_gets_third_party_context() {
        let profile = profile_by_id("web_embedded").unwrap();
        let body = build_player_request_body(profile, "jNQXAC9IVRw", None, None, None, false);
        assert_eq!(
            body["context"]["thirdParty"]["embedUrl"],
            "https://www.youtube.com/"
        );
        assert_eq!(body["context"]["client"]["clientScreen"], "EMBED");
    }

    #[test]
    fn classifies_login_required() {
        let response: PlayerResponse = serde_json::from_value(json!({
            "playabilityStatus": {
                "status": "LOGIN_REQUIRED",
                "reason": "Sign in to confirm your age"
            }
        }))
        .unwrap();

        let mut detail = AttemptDetail::default();
        assert!(!classify_playability(&response, &mut detail));
        assert!(detail.login_required);
        assert!(detail.age_restricted);
        assert!(detail.gates_playability());
    }

    #[test]
    fn classifies_geo_restriction() {
        let response: PlayerResponse = serde_json::from_value(json!({
            "playabilityStatus": {
                "status": "UNPLAYABLE",
                "reason": "The uploader has not made this video available in your country"
            },
            "microformat": {
                "playerMicroformatRenderer": { "availableCountries": ["US", "DE"] }
            }
        }))
        .unwrap();

        let mut detail = AttemptDetail::default();
        assert!(!classify_playability(&response, &mut detail));
        assert!(detail.geo_restricted);
        assert_eq!(detail.available_countries, vec!["US", "DE"]);
    }

    #[test]
    fn ok_is_success() {
        let response: PlayerResponse =
            serde_json::from_value(json!({ "playabilityStatus": { "status": "OK" } })).unwrap();
        let mut detail = AttemptDetail::default();
        assert!(classify_playability(&response, &mut detail));
    }
}
