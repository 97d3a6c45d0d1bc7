use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use serde::Deserialize;
use tokio::sync::RwLock;

use super::challenge::Decipherer;
use super::sandbox::JsSandbox;
use super::{canonical_player_key, PlayerJsResolver};
use crate::constants::JS_EVAL_TIMEOUT;
use crate::events::{EventPhase, EventSink, ExtractionStage};
use crate::structs::StreamingData;
use crate::utils::url_query_value;
use crate::VideoError;

/// Solved challenges for one canonical player: original value → solved
/// value, for both families.
#[derive(Debug, Clone, Default)]
pub struct ChallengeSolutions {
    pub n: HashMap<String, String>,
    pub sig: HashMap<String, String>,
}

impl ChallengeSolutions {
    pub fn covers(&self, set: &ChallengeSet) -> bool {
        set.n.iter().all(|value| self.n.contains_key(value))
            && set.sig.iter().all(|value| self.sig.contains_key(value))
    }
}

/// Distinct challenges collected from one player response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChallengeSet {
    pub n: BTreeSet<String>,
    pub sig: BTreeSet<String>,
}

impl ChallengeSet {
    pub fn is_empty(&self) -> bool {
        self.n.is_empty() && self.sig.is_empty()
    }

    pub fn len(&self) -> usize {
        self.n.len() + self.sig.len()
    }
}

/// Decoded `signatureCipher` / `cipher` query blob.
#[derive(Debug, Clone, Deserialize, Default)]
pub(crate) struct CipherBlob {
    pub s: Option<String>,
    pub sp: Option<String>,
    pub url: Option<String>,
}

pub(crate) fn parse_cipher_blob(blob: &str) -> CipherBlob {
    serde_qs::from_str(blob).unwrap_or_default()
}

/// Scan every format entry plus the manifest URLs for distinct `n` values
/// and scrambled `s` signatures.
pub(crate) fn collect_challenges(
    streaming: Option<&StreamingData>,
    manifest_urls: &[&str],
) -> ChallengeSet {
    let mut set = ChallengeSet::default();

    if let Some(streaming) = streaming {
        let entries = streaming
            .formats
            .iter()
            .flatten()
            .chain(streaming.adaptive_formats.iter().flatten());

        for entry in entries {
            if let Some(url) = entry.url.as_deref() {
                if let Some(n) = url_query_value(url, "n") {
                    set.n.insert(n);
                }
                continue;
            }

            // signatureCipher wins over cipher when both are present.
            let blob = entry
                .signature_cipher
                .as_deref()
                .or(entry.cipher.as_deref());
            if let Some(blob) = blob {
                let cipher = parse_cipher_blob(blob);
                if let Some(s) = cipher.s {
                    set.sig.insert(s);
                }
                if let Some(n) = cipher.url.as_deref().and_then(|url| url_query_value(url, "n"))
                {
                    set.n.insert(n);
                }
            }
        }
    }

    for url in manifest_urls {
        if let Some(n) = url_query_value(url, "n") {
            set.n.insert(n);
        }
    }

    set
}

/// Solves sig and n challenges in batch and shares the results across all
/// sessions, keyed by canonical player. Writes only append.
pub(crate) struct ChallengeSolver {
    resolver: Arc<PlayerJsResolver>,
    sandbox: JsSandbox,
    events: EventSink,
    preferred_locale: String,
    solutions: RwLock<HashMap<String, ChallengeSolutions>>,
    decipherers: RwLock<HashMap<String, Arc<Decipherer>>>,
}

impl ChallengeSolver {
    pub fn new(resolver: Arc<PlayerJsResolver>, events: EventSink, preferred_locale: String) -> Self {
        Self {
            resolver,
            sandbox: JsSandbox::default(),
            events,
            preferred_locale,
            solutions: RwLock::new(HashMap::new()),
            decipherers: RwLock::new(HashMap::new()),
        }
    }

    /// Load (or reuse) the decipherer for a player URL. The primary URL is
    /// tried first, then the canonical-locale path.
    pub async fn decipherer_for(&self, player_url: &str) -> Result<Arc<Decipherer>, VideoError> {
        let canonical = canonical_player_key(player_url, &self.preferred_locale);

        {
            let decipherers = self.decipherers.read().await;
            if let Some(decipherer) = decipherers.get(&canonical) {
                return Ok(decipherer.clone());
            }
        }

        let body = match self.resolver.player_js(player_url).await {
            Ok(body) => body,
            Err(primary_error) if canonical != player_url => {
                log::debug!("primary player js fetch failed ({primary_error}), trying canonical");
                self.resolver.player_js(&canonical).await?
            }
            Err(error) => return Err(error),
        };

        let decipherer = Arc::new(Decipherer::from_player_js(&body)?);

        let mut decipherers = self.decipherers.write().await;
        Ok(decipherers
            .entry(canonical)
            .or_insert(decipherer)
            .clone())
    }

    /// Solve every challenge of the set once and return the merged
    /// solutions view for this player. Partial results are reported via a
    /// `challenge`/`partial` event and kept; unresolved entries stay
    /// ciphered downstream.
    pub async fn solve_batch(
        &self,
        player_url: &str,
        set: &ChallengeSet,
        client: Option<&str>,
    ) -> Result<ChallengeSolutions, VideoError> {
        let canonical = canonical_player_key(player_url, &self.preferred_locale);

        {
            let solutions = self.solutions.read().await;
            if let Some(existing) = solutions.get(&canonical) {
                if existing.covers(set) {
                    return Ok(existing.clone());
                }
            }
        }

        self.events.extraction(
            ExtractionStage::Challenge,
            EventPhase::Start,
            client,
            Some(format!("{} distinct challenges", set.len())),
        );

        let decipherer = match self.decipherer_for(player_url).await {
            Ok(decipherer) => decipherer,
            Err(error) => {
                self.events.extraction(
                    ExtractionStage::Challenge,
                    EventPhase::Failure,
                    client,
                    Some(error.to_string()),
                );
                return Err(error);
            }
        };

        let mut solved = ChallengeSolutions::default();
        let mut failures = 0usize;

        for scrambled in &set.sig {
            solved
                .sig
                .insert(scrambled.clone(), decipherer.apply_sig(scrambled));
        }

        for value in &set.n {
            match self.evaluate_n(&decipherer, value).await {
                Ok(result) => {
                    solved.n.insert(value.clone(), result);
                }
                Err(error) => {
                    log::warn!("n challenge {value:?} unsolved: {error}");
                    failures += 1;
                }
            }
        }

        let merged = {
            let mut solutions = self.solutions.write().await;
            let entry = solutions.entry(canonical).or_default();
            entry.n.extend(solved.n);
            entry.sig.extend(solved.sig);
            entry.clone()
        };

        let phase = if failures == 0 {
            EventPhase::Success
        } else if merged.covers(set) {
            EventPhase::Success
        } else if merged.n.is_empty() && merged.sig.is_empty() {
            EventPhase::Failure
        } else {
            EventPhase::Partial
        };
        self.events.extraction(
            ExtractionStage::Challenge,
            phase,
            client,
            (failures > 0).then(|| format!("{failures} challenges unresolved")),
        );

        Ok(merged)
    }

    /// Cached view of the solutions for a player URL.
    pub async fn solutions_for(&self, player_url: &str) -> ChallengeSolutions {
        let canonical = canonical_player_key(player_url, &self.preferred_locale);
        let solutions = self.solutions.read().await;
        solutions.get(&canonical).cloned().unwrap_or_default()
    }

    async fn evaluate_n(
        &self,
        decipherer: &Decipherer,
        value: &str,
    ) -> Result<String, VideoError> {
        let sandbox = self.sandbox;
        let source = decipherer.n_fn_source.clone();
        let name = decipherer.n_fn_name.clone();
        let input = value.to_string();

        let evaluation = tokio::time::timeout(
            JS_EVAL_TIMEOUT,
            tokio::task::spawn_blocking(move || sandbox.evaluate_unary(&source, &name, &input)),
        )
        .await;

        match evaluation {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => Err(VideoError::JsEvaluationError(join_error.to_string())),
            Err(_) => Err(VideoError::JsEvaluationError(
                "n evaluation timed out".into(),
            )),
        }
    }
}
