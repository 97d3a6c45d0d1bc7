use crate::structs::Protocol;

/// Why an input string could not be turned into a video id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum InvalidInputReason {
    #[display("empty_input")]
    EmptyInput,
    #[display("unsupported_host")]
    UnsupportedHost,
    #[display("invalid_video_id")]
    InvalidVideoId,
    #[display("missing_video_id")]
    MissingVideoId,
    #[display("unsupported_input_shape")]
    UnsupportedInputShape,
}

/// Pipeline stage an attempt failed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum AttemptStage {
    #[display("request")]
    Request,
    #[display("decode")]
    Decode,
    #[display("playability")]
    Playability,
    #[display("po_token")]
    PoToken,
}

/// Per-client diagnostic record collected by the orchestrator. Every field
/// is filled from what the attempt actually observed, so a failed
/// extraction can be debugged from the error alone.
#[derive(Debug, Clone, Default)]
pub struct AttemptDetail {
    pub client: String,
    pub stage: Option<AttemptStage>,
    pub reason: String,
    pub http_status: Option<u16>,
    pub itag: Option<u64>,
    pub protocol: Option<Protocol>,
    pub url_host: Option<String>,
    pub url_has_n: bool,
    pub url_has_pot: bool,
    pub url_has_signature: bool,
    pub pot_required: bool,
    pub pot_available: bool,
    pub playability_status: Option<String>,
    pub playability_reason: Option<String>,
    pub geo_restricted: bool,
    pub login_required: bool,
    pub age_restricted: bool,
    pub unavailable: bool,
    pub drm_protected: bool,
    pub available_countries: Vec<String>,
}

impl AttemptDetail {
    /// Whether this failure should pull in the fallback client phase.
    pub(crate) fn gates_playability(&self) -> bool {
        self.login_required
            || self.age_restricted
            || self.geo_restricted
            || self.unavailable
            || self.pot_required
    }
}

/// Detail payload attached to a download failure.
#[derive(Debug, Clone, Default)]
pub struct DownloadFailureDetail {
    pub http_status: Option<u16>,
    pub url_host: String,
    pub url_has_n: bool,
    pub url_has_pot: bool,
    pub url_has_signature: bool,
    pub attempt: u32,
    pub reason: String,
}

/// A format that was considered and rejected during selection.
#[derive(Debug, Clone)]
pub struct FormatSkip {
    pub itag: u64,
    pub reason: String,
}

#[derive(thiserror::Error, Debug)]
pub enum VideoError {
    /// Input could not be normalized to an 11 character video id
    #[error("invalid input {input:?}: {reason}")]
    InvalidInput {
        input: String,
        reason: InvalidInputReason,
    },
    /// Playability status maps to an unavailable video (private, deleted,
    /// region locked, unplayable)
    #[error("video unavailable: {reason}")]
    Unavailable { status: String, reason: String },
    /// Playability status demands a signed-in session or age verification
    #[error("sign in required: {reason}")]
    LoginRequired { status: String, reason: String },
    /// Selection produced zero candidates
    #[error("no playable formats for mode {mode}")]
    NoPlayableFormats {
        mode: String,
        selector: Option<String>,
        selection_error: Option<String>,
        skips: Vec<FormatSkip>,
    },
    /// A sig or n challenge stayed unresolved
    #[error("challenge not solved")]
    ChallengeNotSolved { player_url: Option<String> },
    /// Every candidate client failed
    #[error("all player clients failed after {} attempts", attempts.len())]
    AllClientsFailed { attempts: Vec<AttemptDetail> },
    /// The effective policy requires a proof-of-origin token and no usable
    /// token could be obtained
    #[error("po token required for client {client}")]
    PoTokenRequired {
        client: String,
        cause: String,
        policy: String,
        protocols: Vec<Protocol>,
        provider_available: bool,
    },
    /// Download failed after exhausting retries
    #[error("download failed: {}", detail.reason)]
    DownloadFailure { detail: DownloadFailureDetail },
    /// The crawled client registry has no such id
    #[error("unknown client id {0:?}")]
    UnknownClient(String),
    /// Reqwest error
    #[error(transparent)]
    Reqwest(#[from] reqwest::Error),
    /// ReqwestMiddleware error
    #[error(transparent)]
    ReqwestMiddleware(#[from] reqwest_middleware::Error),
    /// URL cannot be parsed
    #[error(transparent)]
    URLParseError(#[from] url::ParseError),
    /// Hex decode error
    #[error(transparent)]
    HexError(#[from] hex::FromHexError),
    /// Body cannot be parsed
    #[error("body cannot be parsed: {0}")]
    BodyCannotParsed(String),
    /// Player JS could not be located or fetched
    #[error("player js unavailable: {0}")]
    PlayerJsUnavailable(String),
    /// Player JS did not yield the expected transforms
    #[error("player js parse error: {0}")]
    PlayerJsParseError(String),
    /// Sandboxed JS evaluation failed
    #[error("js evaluation error: {0}")]
    JsEvaluationError(String),
    /// M3U8 parse error
    #[error("m3u8 parse error: {0}")]
    M3U8ParseError(String),
    /// DASH manifest error
    #[error("dash manifest error: {0}")]
    DashManifestError(String),
    /// Encryption descriptor error
    #[error("encryption error: {0}")]
    EncryptionError(String),
    /// Segment decryption error
    #[error("decryption error: {0}")]
    DecryptionError(String),
    /// Filesystem error while downloading
    #[error("io error: {0}")]
    IoError(String),
    /// Merge delegated to the muxer failed
    #[error("mux error: {0}")]
    MuxError(String),
    /// Transcode delegated to the mp3 transcoder failed
    #[error("transcode error: {0}")]
    TranscodeError(String),
    /// Provided cookie contains invalid header value characters. Only
    /// visible ASCII characters (32-127) are permitted
    #[error("provided cookie contains invalid header value characters")]
    CookieError,
    /// Transcript payload could not be parsed (delegated surface)
    #[error("transcript parse error: {0}")]
    TranscriptParse(String),
    /// No transcript exists for the video (delegated surface)
    #[error("transcript unavailable")]
    TranscriptUnavailable,
}

impl From<std::io::Error> for VideoError {
    fn from(value: std::io::Error) -> Self {
        VideoError::IoError(value.to_string())
    }
}

/// Extract the per-client attempt diagnostics from a top-level error, if
/// it carries any.
pub fn attempt_details(err: &VideoError) -> Option<&[AttemptDetail]> {
    match err {
        VideoError::AllClientsFailed { attempts } => Some(attempts),
        _ => None,
    }
}

impl VideoError {
    /// `Is`-style sentinel check for the sign-in family of failures.
    pub fn is_login_required(&self) -> bool {
        match self {
            VideoError::LoginRequired { .. } => true,
            VideoError::AllClientsFailed { attempts } => attempts
                .iter()
                .any(|attempt| attempt.login_required || attempt.age_restricted),
            _ => false,
        }
    }

    /// `Is`-style sentinel check for the unavailable family of failures.
    pub fn is_unavailable(&self) -> bool {
        match self {
            VideoError::Unavailable { .. } => true,
            VideoError::AllClientsFailed { attempts } => attempts
                .iter()
                .any(|attempt| attempt.unavailable || attempt.geo_restricted),
            _ => false,
        }
    }
}
