use once_cell::sync::Lazy;
use regex::Regex;
use url::Url;

use crate::constants::VALID_QUERY_DOMAINS;
use crate::errors::{InvalidInputReason, VideoError};

static ID_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-zA-Z0-9_-]{11}$").unwrap());

pub fn validate_id(id: &str) -> bool {
    ID_REGEX.is_match(id.trim())
}

/// Normalize a raw id or a watch/short/embed/live URL to an 11 character
/// video id, with a typed reason on failure.
pub fn parse_video_input(input: &str) -> Result<String, VideoError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(invalid(input, InvalidInputReason::EmptyInput));
    }

    if validate_id(trimmed) {
        return Ok(trimmed.to_string());
    }

    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        return parse_video_url(input, trimmed);
    }

    // Scheme-less URLs are common in user input
    if trimmed.contains("youtube.com/") || trimmed.contains("youtu.be/") {
        return parse_video_url(input, &format!("https://{trimmed}"));
    }

    if trimmed.len() == 11 {
        return Err(invalid(input, InvalidInputReason::InvalidVideoId));
    }

    Err(invalid(input, InvalidInputReason::UnsupportedInputShape))
}

fn parse_video_url(original: &str, raw: &str) -> Result<String, VideoError> {
    let parsed = Url::parse(raw.trim())
        .map_err(|_| invalid(original, InvalidInputReason::UnsupportedInputShape))?;

    let host = parsed
        .host_str()
        .ok_or_else(|| invalid(original, InvalidInputReason::UnsupportedHost))?;

    let is_short_host = host == "youtu.be";
    let is_query_host = VALID_QUERY_DOMAINS.contains(&host)
        || host == "youtube-nocookie.com"
        || host == "www.youtube-nocookie.com";

    if !is_short_host && !is_query_host {
        return Err(invalid(original, InvalidInputReason::UnsupportedHost));
    }

    if is_short_host {
        let id = parsed
            .path_segments()
            .and_then(|mut segments| segments.next().map(str::to_string))
            .filter(|segment| !segment.is_empty())
            .ok_or_else(|| invalid(original, InvalidInputReason::MissingVideoId))?;
        return check_candidate(original, &id);
    }

    if let Some(id) = parsed
        .query_pairs()
        .find_map(|(key, value)| (key == "v").then(|| value.to_string()))
    {
        return check_candidate(original, &id);
    }

    let segments: Vec<&str> = parsed
        .path_segments()
        .map(|segments| segments.filter(|segment| !segment.is_empty()).collect())
        .unwrap_or_default();

    match segments.as_slice() {
        ["watch"] => Err(invalid(original, InvalidInputReason::MissingVideoId)),
        ["embed" | "shorts" | "live" | "v" | "e", id, ..] => check_candidate(original, id),
        _ => Err(invalid(original, InvalidInputReason::UnsupportedInputShape)),
    }
}

fn check_candidate(original: &str, candidate: &str) -> Result<String, VideoError> {
    // Trailing junk after the id (tracking params mashed into the path) is
    // tolerated as long as the first 11 characters form a valid id.
    let head: String = candidate.chars().take(11).collect();
    if validate_id(&head) {
        Ok(head)
    } else {
        Err(invalid(original, InvalidInputReason::InvalidVideoId))
    }
}

fn invalid(input: &str, reason: InvalidInputReason) -> VideoError {
    VideoError::InvalidInput {
        input: input.to_string(),
        reason,
    }
}

/// Cut a balanced `{...}`/`[...]`/`(...)` block off the front of minified
/// JS, skipping string literals (escape aware), comments and regexes.
pub(crate) fn balanced_js_block(source: &str) -> Option<&str> {
    let bytes = source.as_bytes();

    let mut index = 0;
    let mut nest = 0i32;
    let mut last_significant: Option<u8> = None;

    while nest > 0 || index == 0 {
        if index >= bytes.len() {
            return None;
        }
        let byte = bytes[index];
        match byte {
            b'{' | b'[' | b'(' => nest += 1,
            b'}' | b']' | b')' => nest -= 1,
            b'"' | b'\'' | b'`' => {
                index += 1;
                while index < bytes.len() && bytes[index] != byte {
                    if bytes[index] == b'\\' {
                        index += 1;
                    }
                    index += 1;
                }
                if index >= bytes.len() {
                    return None;
                }
            }
            b'/' if bytes.get(index + 1) == Some(&b'*') => {
                index += 2;
                while index + 1 < bytes.len() && !(bytes[index] == b'*' && bytes[index + 1] == b'/')
                {
                    index += 1;
                }
                index += 2;
                continue;
            }
            b'/' if last_significant
                .map(|b| !b.is_ascii_alphanumeric() && b != b')' && b != b']')
                .unwrap_or(false) =>
            {
                index += 1;
                while index < bytes.len() && bytes[index] != byte {
                    if bytes[index] == b'\\' {
                        index += 1;
                    }
                    index += 1;
                }
                if index >= bytes.len() {
                    return None;
                }
            }
            other if !other.is_ascii_whitespace() => last_significant = Some(other),
            _ => {}
        }
        index += 1;
    }

    if index <= 1 || nest != 0 {
        return None;
    }
    Some(&source[..index])
}

/// Replace the value of one query parameter, preserving every other pair
/// and their order. A URL without the parameter comes back untouched.
pub(crate) fn rewrite_url_param(raw: &str, name: &str, value: &str) -> String {
    let mut parsed = match Url::parse(raw) {
        Ok(parsed) => parsed,
        Err(_) => return raw.to_string(),
    };

    if !parsed.query_pairs().any(|(key, _)| key == name) {
        return raw.to_string();
    }

    let pairs: Vec<(String, String)> = parsed
        .query_pairs()
        .map(|(key, current)| {
            if key == name {
                (key.into_owned(), value.to_string())
            } else {
                (key.into_owned(), current.into_owned())
            }
        })
        .collect();

    parsed.query_pairs_mut().clear().extend_pairs(pairs);
    parsed.to_string()
}

/// Append a query parameter, replacing it if already present.
pub(crate) fn set_url_param(raw: &str, name: &str, value: &str) -> String {
    let mut parsed = match Url::parse(raw) {
        Ok(parsed) => parsed,
        Err(_) => return raw.to_string(),
    };

    let mut pairs: Vec<(String, String)> = parsed
        .query_pairs()
        .filter(|(key, _)| key != name)
        .map(|(key, current)| (key.into_owned(), current.into_owned()))
        .collect();
    pairs.push((name.to_string(), value.to_string()));

    parsed.query_pairs_mut().clear().extend_pairs(pairs);
    parsed.to_string()
}

pub(crate) fn url_query_value(raw: &str, name: &str) -> Option<String> {
    let parsed = Url::parse(raw).ok()?;
    parsed
        .query_pairs()
        .find_map(|(key, value)| (key == name).then(|| value.into_owned()))
}

pub(crate) fn url_host(raw: &str) -> Option<String> {
    Url::parse(raw)
        .ok()
        .and_then(|parsed| parsed.host_str().map(str::to_string))
}

pub(crate) fn make_absolute_url(base: &str, candidate: &str) -> Result<Url, VideoError> {
    match Url::parse(candidate) {
        Ok(parsed) => Ok(parsed),
        Err(url::ParseError::RelativeUrlWithoutBase) => {
            let base_url = Url::parse(base).map_err(VideoError::URLParseError)?;
            Ok(base_url.join(candidate)?)
        }
        Err(e) => Err(VideoError::URLParseError(e)),
    }
}
