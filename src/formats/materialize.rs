use std::collections::HashMap;

use super::Format;
use crate::cache::PoTokenCache;
use crate::innertube::ClientProfile;
use crate::player::solver::parse_cipher_blob;
use crate::player::ChallengeSolutions;
use crate::structs::{PoTokenFetchPolicy, Protocol};
use crate::utils::{rewrite_url_param, set_url_param, url_query_value};
use crate::VideoError;

/// Turns a normalized format into a playable URL by applying solved
/// challenges and the proof-of-origin policy.
pub(crate) struct UrlMaterializer<'a> {
    pub solutions: &'a ChallengeSolutions,
    pub player_url: Option<&'a str>,
    pub profile: Option<&'static ClientProfile>,
    pub pot_overrides: &'a HashMap<Protocol, PoTokenFetchPolicy>,
    pub po_tokens: &'a PoTokenCache,
}

impl UrlMaterializer<'_> {
    /// Strict materialization for a chosen format: unsolved challenges
    /// and unsatisfiable token policies are hard errors.
    pub async fn materialize(&self, format: &Format) -> Result<String, VideoError> {
        let url = if !format.url.is_empty() {
            self.rewrite_n(&format.url)?
        } else {
            self.decipher(format)?
        };

        self.inject_po_token(url, format.protocol).await
    }

    /// Best-effort pass over the whole format list: apply whatever is
    /// already solved, leave the rest ciphered for selection fallback.
    pub fn apply_lenient(&self, format: &mut Format) {
        if !format.url.is_empty() {
            if let Some(n) = url_query_value(&format.url, "n") {
                if let Some(solved) = self.solutions.n.get(&n) {
                    format.url = rewrite_url_param(&format.url, "n", solved);
                }
            }
            return;
        }

        if let Ok(url) = self.decipher(format) {
            format.url = url;
            format.refresh_cipher_flag();
        }
    }

    /// Replace the `n` query parameter with its solved value. A URL
    /// without `n` passes through untouched; an unsolved `n` means the
    /// throttling challenge stands and the URL is not playable.
    fn rewrite_n(&self, url: &str) -> Result<String, VideoError> {
        let n = match url_query_value(url, "n") {
            Some(n) => n,
            None => return Ok(url.to_string()),
        };

        if self.player_url.is_none() {
            return Err(VideoError::ChallengeNotSolved { player_url: None });
        }

        match self.solutions.n.get(&n) {
            Some(solved) => Ok(rewrite_url_param(url, "n", solved)),
            // Materialization is idempotent: a URL whose n was already
            // rewritten carries a solved value, not a challenge.
            None if self.solutions.n.values().any(|solved| *solved == n) => Ok(url.to_string()),
            None => Err(VideoError::ChallengeNotSolved {
                player_url: self.player_url.map(str::to_string),
            }),
        }
    }

    /// Unpack the cipher blob, write the deciphered signature into the
    /// parameter named by `sp` (default `signature`), then rewrite `n`.
    fn decipher(&self, format: &Format) -> Result<String, VideoError> {
        let blob = format
            .signature_cipher
            .as_deref()
            .or(format.cipher.as_deref())
            .ok_or(VideoError::ChallengeNotSolved { player_url: None })?;

        let cipher = parse_cipher_blob(blob);
        let url = cipher.url.ok_or_else(|| VideoError::ChallengeNotSolved {
            player_url: self.player_url.map(str::to_string),
        })?;

        let url = match cipher.s {
            Some(scrambled) => {
                let solved = self.solutions.sig.get(&scrambled).ok_or_else(|| {
                    VideoError::ChallengeNotSolved {
                        player_url: self.player_url.map(str::to_string),
                    }
                })?;
                let param = cipher.sp.as_deref().unwrap_or("signature");
                set_url_param(&url, param, solved)
            }
            None => url,
        };

        self.rewrite_n(&url)
    }

    async fn inject_po_token(
        &self,
        url: String,
        protocol: Protocol,
    ) -> Result<String, VideoError> {
        let policy = self.effective_policy(protocol);
        if policy == PoTokenFetchPolicy::Never {
            return Ok(url);
        }

        let client_id = self.profile.map(|profile| profile.id).unwrap_or("web");
        let lookup = self.po_tokens.token_for(client_id).await;

        let token = match (policy, lookup) {
            (_, Ok(Some(token))) => token,
            (PoTokenFetchPolicy::Recommended, _) => return Ok(url),
            (PoTokenFetchPolicy::Required, Ok(None)) => {
                return Err(self.po_token_required(client_id, protocol, "no usable token"));
            }
            (PoTokenFetchPolicy::Required, Err(error)) => {
                return Err(self.po_token_required(
                    client_id,
                    protocol,
                    &format!("provider error: {error}"),
                ));
            }
            (PoTokenFetchPolicy::Never, _) => unreachable!("handled above"),
        };

        // Some streaming hosts carry the token as a path segment already.
        let already_tokenized = url.contains("/pot/") || url_query_value(&url, "pot").is_some();
        if already_tokenized {
            Ok(url)
        } else {
            Ok(set_url_param(&url, "pot", &token))
        }
    }

    fn effective_policy(&self, protocol: Protocol) -> PoTokenFetchPolicy {
        if let Some(policy) = self.pot_overrides.get(&protocol) {
            return *policy;
        }
        match self.profile {
            Some(profile) => {
                let policy = profile.policy_for(protocol);
                if policy.required {
                    PoTokenFetchPolicy::Required
                } else if policy.recommended {
                    PoTokenFetchPolicy::Recommended
                } else {
                    PoTokenFetchPolicy::Never
                }
            }
            None => PoTokenFetchPolicy::Never,
        }
    }

    fn po_token_required(
        &self,
        client_id: &str,
        protocol: Protocol,
        cause: &str,
    ) -> VideoError {
        VideoError::PoTokenRequired {
            client: client_id.to_string(),
            cause: cause.to_string(),
            policy: PoTokenFetchPolicy::Required.to_string(),
            protocols: vec![protocol],
            provider_available: self.po_tokens.provider_available(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Arc;

    struct FixedProvider(&'static str);

    #[async_trait]
    impl crate::structs::PoTokenProvider for FixedProvider {
        async fn get_token(&self, _client_id: &str) -> Result<String, VideoError> {
            Ok(self.0.to_string())
        }
    }

    fn solutions() -> ChallengeSolutions {
        let mut solutions = ChallengeSolutions::default();
        solutions.n.insert("abcd".into(), "bcd".into());
        solutions.sig.insert("xyz".into(), "yz".into());
        solutions
    }

    fn materializer<'a>(
        solutions: &'a ChallengeSolutions,
        po_tokens: &'a PoTokenCache,
        overrides: &'a HashMap<Protocol, PoTokenFetchPolicy>,
    ) -> UrlMaterializer<'a> {
        UrlMaterializer {
            solutions,
            player_url: Some("/s/player/abc/player_ias.vflset/en_US/base.js"),
            profile: None,
            pot_overrides: overrides,
            po_tokens,
        }
    }

    #[tokio::test]
    async fn rewrites_direct_url_n() {
        let solutions = solutions();
        let po_tokens = PoTokenCache::new(None);
        let overrides = HashMap::new();
        let materializer = materializer(&solutions, &po_tokens, &overrides);

        let format = Format {
            url: "https://example.com/video?itag=18&n=abcd".into(),
            ..Default::default()
        };

        let url = materializer.materialize(&format).await.unwrap();
        assert_eq!(url_query_value(&url, "n").as_deref(), Some("bcd"));
        assert_eq!(url_query_value(&url, "itag").as_deref(), Some("18"));
    }

    #[tokio::test]
    async fn missing_n_is_not_an_error() {
        let solutions = ChallengeSolutions::default();
        let po_tokens = PoTokenCache::new(None);
        let overrides = HashMap::new();
        let materializer = materializer(&solutions, &po_tokens, &overrides);

        let format = Format {
            url: "https://example.com/video?itag=18".into(),
            ..Default::default()
        };
        assert_eq!(
            materializer.materialize(&format).await.unwrap(),
            "https://example.com/video?itag=18"
        );
    }

    #[tokio::test]
    async fn deciphers_signature_into_sp_param() {
        let solutions = solutions();
        let po_tokens = PoTokenCache::new(None);
        let overrides = HashMap::new();
        let materializer = materializer(&solutions, &po_tokens, &overrides);

        let mut format = Format {
            signature_cipher: Some(
                "url=https%3A%2F%2Fexample.com%2Faudio%3Fn%3Dabcd&s=xyz&sp=sig".into(),
            ),
            ..Default::default()
        };
        format.refresh_cipher_flag();
        assert!(format.ciphered);

        let url = materializer.materialize(&format).await.unwrap();
        assert_eq!(url_query_value(&url, "sig").as_deref(), Some("yz"));
        assert_eq!(url_query_value(&url, "n").as_deref(), Some("bcd"));
    }

    #[tokio::test]
    async fn unsolved_challenge_is_reported() {
        let solutions = ChallengeSolutions::default();
        let po_tokens = PoTokenCache::new(None);
        let overrides = HashMap::new();
        let materializer = materializer(&solutions, &po_tokens, &overrides);

        let format = Format {
            url: "https://example.com/video?n=unsolved".into(),
            ..Default::default()
        };
        assert!(matches!(
            materializer.materialize(&format).await,
            Err(VideoError::ChallengeNotSolved { .. })
        ));
    }

    #[tokio::test]
    async fn required_policy_without_provider_fails() {
        let solutions = ChallengeSolutions::default();
        let po_tokens = PoTokenCache::new(None);
        let mut overrides = HashMap::new();
        overrides.insert(Protocol::Https, PoTokenFetchPolicy::Required);
        let materializer = materializer(&solutions, &po_tokens, &overrides);

        let format = Format {
            url: "https://example.com/video".into(),
            ..Default::default()
        };
        match materializer.materialize(&format).await {
            Err(VideoError::PoTokenRequired {
                provider_available, ..
            }) => assert!(!provider_available),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn required_policy_with_provider_injects_pot() {
        let solutions = ChallengeSolutions::default();
        let po_tokens = PoTokenCache::new(Some(Arc::new(FixedProvider("tok3n"))));
        let mut overrides = HashMap::new();
        overrides.insert(Protocol::Https, PoTokenFetchPolicy::Required);
        let materializer = materializer(&solutions, &po_tokens, &overrides);

        let format = Format {
            url: "https://example.com/video".into(),
            ..Default::default()
        };
        let url = materializer.materialize(&format).await.unwrap();
        assert_eq!(url_query_value(&url, "pot").as_deref(), Some("tok3n"));
    }

    #[tokio::test]
    async fn pot_path_segment_is_detected() {
        let solutions = ChallengeSolutions::default();
        let po_tokens = PoTokenCache::new(Some(Arc::new(FixedProvider("tok3n"))));
        let mut overrides = HashMap::new();
        overrides.insert(Protocol::Https, PoTokenFetchPolicy::Required);
        let materializer = materializer(&solutions, &po_tokens, &overrides);

        let format = Format {
            url: "https://example.com/pot/abc/video".into(),
            ..Default::default()
        };
        let url = materializer.materialize(&format).await.unwrap();
        assert!(url_query_value(&url, "pot").is_none());
    }
}
