use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use sha1::{Digest, Sha1};

/// Parse a `Cookie:`-style header string into a name → value map.
pub(crate) fn parse_cookie_header(raw: &str) -> HashMap<String, String> {
    raw.split(';')
        .filter_map(|pair| {
            let (name, value) = pair.trim().split_once('=')?;
            (!name.is_empty()).then(|| (name.to_string(), value.to_string()))
        })
        .collect()
}

/// Whether the cookie set carries a SAPISID-family credential, i.e. the
/// session counts as authenticated.
pub(crate) fn has_sapisid(cookies: &HashMap<String, String>) -> bool {
    cookies.contains_key("SAPISID")
        || cookies.contains_key("__Secure-1PAPISID")
        || cookies.contains_key("__Secure-3PAPISID")
}

/// Identity headers derived from cookies and scraped session state.
#[derive(Debug, Clone, Default)]
pub(crate) struct AuthHeaders {
    pub authorization: Option<String>,
    /// `X-Goog-PageId`, the delegated session id.
    pub page_id: Option<String>,
    /// `X-Goog-AuthUser`, the session index.
    pub auth_user: Option<String>,
}

/// Session identifiers resolved from config or the watch page.
#[derive(Debug, Clone, Default)]
pub(crate) struct SessionIdentity {
    pub session_index: Option<String>,
    pub delegated_session_id: Option<String>,
    pub user_session_id: Option<String>,
}

pub(crate) fn build_auth_headers(
    cookies: &HashMap<String, String>,
    origin: &str,
    identity: &SessionIdentity,
) -> AuthHeaders {
    let unix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0);

    AuthHeaders {
        authorization: authorization_value(cookies, origin, identity, unix),
        page_id: identity.delegated_session_id.clone(),
        auth_user: identity.session_index.clone(),
    }
}

/// Compose the `Authorization` value out of every hash scheme the cookie
/// set supports: `SAPISIDHASH`, `SAPISID1PHASH`, `SAPISID3PHASH`, each as
/// `<unix>_<sha1(unix SP sid SP origin)>`. With a user session id the id
/// is prepended to the hashed payload and the digest gets a `_u` marker.
fn authorization_value(
    cookies: &HashMap<String, String>,
    origin: &str,
    identity: &SessionIdentity,
    unix: u64,
) -> Option<String> {
    let primary = cookies
        .get("SAPISID")
        .or_else(|| cookies.get("__Secure-1PAPISID"))?;
    let first_party = cookies.get("__Secure-1PAPISID").unwrap_or(primary);
    let third_party = cookies.get("__Secure-3PAPISID").unwrap_or(primary);

    let schemes = [
        ("SAPISIDHASH", primary),
        ("SAPISID1PHASH", first_party),
        ("SAPISID3PHASH", third_party),
    ];

    let value = schemes
        .iter()
        .map(|(scheme, sid)| {
            let digest = sapisid_hash(unix, sid, origin, identity.user_session_id.as_deref());
            format!("{scheme} {digest}")
        })
        .collect::<Vec<_>>()
        .join(" ");

    Some(value)
}

fn sapisid_hash(unix: u64, sid: &str, origin: &str, user_session_id: Option<&str>) -> String {
    let payload = match user_session_id {
        Some(session_id) => format!("{session_id} {unix} {sid} {origin}"),
        None => format!("{unix} {sid} {origin}"),
    };

    let mut hasher = Sha1::new();
    hasher.update(payload.as_bytes());
    let digest = hex::encode(hasher.finalize());

    match user_session_id {
        Some(_) => format!("{unix}_{digest}_u"),
        None => format!("{unix}_{digest}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_cookie_pairs() {
        let cookies = parse_cookie_header("SAPISID=abc; VISITOR_INFO1_LIVE=xyz;  HSID=1");
        assert_eq!(cookies.get("SAPISID").map(String::as_str), Some("abc"));
        assert_eq!(
            cookies.get("VISITOR_INFO1_LIVE").map(String::as_str),
            Some("xyz")
        );
        assert_eq!(cookies.len(), 3);
    }

    #[test]
    fn hash_matches_known_vector() {
        // sha1("1700000000 abc https://www.youtube.com")
        let digest = sapisid_hash(1_700_000_000, "abc", "https://www.youtube.com", None);
        assert!(digest.starts_with("1700000000_"));
        assert_eq!(digest.len(), "1700000000_".len() + 40);
        assert!(!digest.ends_with("_u"));
    }

    #[test]
    fn user_session_id_marks_hash() {
        let digest = sapisid_hash(
            1_700_000_000,
            "abc",
            "https://www.youtube.com",
            Some("session"),
        );
        assert!(digest.ends_with("_u"));
    }

    #[test]
    fn authorization_lists_all_schemes() {
        let mut cookies = HashMap::new();
        cookies.insert("SAPISID".to_string(), "abc".to_string());
        cookies.insert("__Secure-3PAPISID".to_string(), "def".to_string());

        let value = authorization_value(
            &cookies,
            "https://www.youtube.com",
            &SessionIdentity::default(),
            1_700_000_000,
        )
        .unwrap();

        assert!(value.contains("SAPISIDHASH "));
        assert!(value.contains("SAPISID1PHASH "));
        assert!(value.contains("SAPISID3PHASH "));
    }

    #[test]
    fn no_sapisid_no_header() {
        let cookies = parse_cookie_header("VISITOR_INFO1_LIVE=xyz");
        assert!(!has_sapisid(&cookies));
        assert!(authorization_value(
            &cookies,
            "https://www.youtube.com",
            &SessionIdentity::default(),
            0
        )
        .is_none());
    }
}
