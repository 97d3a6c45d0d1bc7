use once_cell::sync::Lazy;
use regex::Regex;

use crate::utils::balanced_js_block;
use crate::VideoError;

/// One pure signature transform parsed out of the player script.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigOp {
    Reverse,
    Splice(usize),
    Swap(usize),
}

/// Everything needed to solve both challenge families for one player
/// script: the signature op list and the extracted n-function source.
#[derive(Debug, Clone)]
pub struct Decipherer {
    pub sig_ops: Vec<SigOp>,
    pub n_fn_name: String,
    pub n_fn_source: String,
    pub signature_timestamp: Option<u64>,
}

static SIG_MAIN_FN_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?:[a-zA-Z0-9$_]+=function|function\s+[a-zA-Z0-9$_]+)\(a\)\{a=a\.split\((?:""|[a-zA-Z0-9$_]+\(\))\);((?:[a-zA-Z0-9$_]+\.[a-zA-Z0-9$_]+\(a,\d+\);)+)return a\.join"#,
    )
    .unwrap()
});

static SIG_CALL_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"([a-zA-Z0-9$_]+)\.([a-zA-Z0-9$_]+)\(a,(\d+)\)").unwrap());

static SIGNATURE_TIMESTAMP_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"signatureTimestamp[:=](\d+)").unwrap());

/// Anchors for the n-function name, in priority order. All of them hang
/// off the `.get("n")` call the player uses to read the parameter.
static N_ANCHOR_INDEXED_PLUS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"\.get\("n"\)\)&&\(b=([a-zA-Z0-9$_]+)\[(\d+)\]\([a-zA-Z0-9$_]+\)\+1\|\|([a-zA-Z0-9$_]+)"#)
        .unwrap()
});
static N_ANCHOR_INDEXED: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"b=([a-zA-Z0-9$_]+)\[(\d+)\]\([a-zA-Z0-9$_]+\)\|\|([a-zA-Z0-9$_]+)"#).unwrap()
});
static N_ANCHOR_DIRECT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"b=([a-zA-Z0-9$_]+)\(b\)|b=([a-zA-Z0-9$_]+)\(a\)"#).unwrap());
static N_ANCHOR_LOOSE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?s)\.get\("n"\).{0,200}?&&.{0,200}?([a-zA-Z0-9$_]+)\([a-zA-Z0-9$_]+\)"#)
        .unwrap()
});

impl Decipherer {
    /// Parse a player script body once. Either extraction failing is fatal
    /// for the whole decipherer; the caller decides how much of the format
    /// list survives.
    pub fn from_player_js(body: &str) -> Result<Self, VideoError> {
        let sig_ops = extract_sig_ops(body)?;
        let (n_fn_name, n_fn_source) = extract_n_function(body)?;

        Ok(Self {
            sig_ops,
            n_fn_name,
            n_fn_source,
            signature_timestamp: extract_signature_timestamp(body),
        })
    }

    /// Apply the signature ops left to right to the scrambled `s` value.
    pub fn apply_sig(&self, scrambled: &str) -> String {
        let mut bytes: Vec<u8> = scrambled.bytes().collect();

        for op in &self.sig_ops {
            match *op {
                SigOp::Reverse => bytes.reverse(),
                SigOp::Splice(count) => {
                    if count >= bytes.len() {
                        bytes.clear();
                    } else {
                        bytes.drain(..count);
                    }
                }
                SigOp::Swap(index) => {
                    if !bytes.is_empty() {
                        let pos = index % bytes.len();
                        bytes.swap(0, pos);
                    }
                }
            }
        }

        String::from_utf8_lossy(&bytes).into_owned()
    }
}

pub(crate) fn extract_signature_timestamp(body: &str) -> Option<u64> {
    SIGNATURE_TIMESTAMP_REGEX
        .captures(body)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Find the top-level `a=a.split("")...a.join("")` scrambler, resolve its
/// helper-object calls and map each key to an op by the shape of the
/// helper body.
fn extract_sig_ops(body: &str) -> Result<Vec<SigOp>, VideoError> {
    let caps = SIG_MAIN_FN_REGEX.captures(body).ok_or_else(|| {
        VideoError::PlayerJsParseError("signature scrambler function not found".into())
    })?;
    let calls = caps.get(1).map(|m| m.as_str()).unwrap_or_default();

    let mut ops = Vec::new();
    let mut helper_source: Option<(String, String)> = None;

    for call in SIG_CALL_REGEX.captures_iter(calls) {
        let object = &call[1];
        let key = &call[2];
        let argument: usize = call[3]
            .parse()
            .map_err(|_| VideoError::PlayerJsParseError("non-numeric op argument".into()))?;

        let source = match &helper_source {
            Some((name, source)) if name == object => source.clone(),
            _ => {
                let source = extract_helper_object(body, object)?;
                helper_source = Some((object.to_string(), source.clone()));
                source
            }
        };

        ops.push(classify_helper(&source, key, argument)?);
    }

    if ops.is_empty() {
        return Err(VideoError::PlayerJsParseError(
            "signature scrambler has no helper calls".into(),
        ));
    }

    Ok(ops)
}

fn extract_helper_object(body: &str, name: &str) -> Result<String, VideoError> {
    let declaration = format!("var {name}={{");
    let start = body
        .find(&declaration)
        .or_else(|| body.find(&format!("{name}={{")))
        .ok_or_else(|| {
            VideoError::PlayerJsParseError(format!("helper object {name} not found"))
        })?;

    let brace = start + body[start..].find('{').expect("declaration has brace");
    balanced_js_block(&body[brace..])
        .map(str::to_string)
        .ok_or_else(|| VideoError::PlayerJsParseError(format!("helper object {name} unbalanced")))
}

/// Identify a helper entry by its body: `a.reverse()`, `a.splice(0,b)`,
/// or the three-line element swap.
fn classify_helper(object_source: &str, key: &str, argument: usize) -> Result<SigOp, VideoError> {
    let entry_body = find_helper_body(object_source, key).ok_or_else(|| {
        VideoError::PlayerJsParseError(format!("helper entry {key} not found"))
    })?;

    if entry_body.contains("reverse") {
        Ok(SigOp::Reverse)
    } else if entry_body.contains("splice") {
        Ok(SigOp::Splice(argument))
    } else if entry_body.contains("%") && entry_body.contains("length") {
        Ok(SigOp::Swap(argument))
    } else {
        Err(VideoError::PlayerJsParseError(format!(
            "helper entry {key} has unknown shape: {entry_body}"
        )))
    }
}

fn find_helper_body<'a>(object_source: &'a str, key: &str) -> Option<&'a str> {
    // Keys may or may not be quoted in the object literal.
    let mut start = None;
    for candidate in [
        format!("{key}:function"),
        format!(r#""{key}":function"#),
        format!("'{key}':function"),
    ] {
        if let Some(pos) = object_source.find(&candidate) {
            start = Some(pos + candidate.len());
            break;
        }
    }

    let after = &object_source[start?..];
    let brace = after.find('{')?;
    balanced_js_block(&after[brace..])
}

/// Resolve the n-function name from the anchor patterns and lift its full
/// source with a brace-balanced scan.
fn extract_n_function(body: &str) -> Result<(String, String), VideoError> {
    let mut candidates: Vec<String> = Vec::new();

    for anchor in [&*N_ANCHOR_INDEXED_PLUS, &*N_ANCHOR_INDEXED] {
        if let Some(caps) = anchor.captures(body) {
            let array_name = &caps[1];
            let index: usize = caps[2].parse().unwrap_or(0);
            let fallback = caps[3].to_string();

            if index == 0 {
                candidates.push(fallback.clone());
                if let Some(resolved) = resolve_indexed_symbol(body, array_name, index) {
                    candidates.push(resolved);
                }
            } else {
                if let Some(resolved) = resolve_indexed_symbol(body, array_name, index) {
                    candidates.push(resolved);
                }
                candidates.push(fallback);
            }
            break;
        }
    }

    if candidates.is_empty() {
        if let Some(caps) = N_ANCHOR_DIRECT.captures(body) {
            if let Some(name) = caps.get(1).or_else(|| caps.get(2)) {
                candidates.push(name.as_str().to_string());
            }
        }
    }

    if candidates.is_empty() {
        if let Some(caps) = N_ANCHOR_LOOSE.captures(body) {
            candidates.push(caps[1].to_string());
        }
    }

    for name in candidates {
        if let Some(source) = lift_function_source(body, &name) {
            return Ok((name, source));
        }
    }

    Err(VideoError::PlayerJsParseError(
        "n transform function not found".into(),
    ))
}

/// Resolve `XY[i]` through the `var XY=[...]` declaration table.
fn resolve_indexed_symbol(body: &str, array_name: &str, index: usize) -> Option<String> {
    let declaration = format!("var {array_name}=[");
    let start = body.find(&declaration)?;
    let open = start + declaration.len() - 1;
    let block = balanced_js_block(&body[open..])?;
    let inner = &block[1..block.len() - 1];

    inner
        .split(',')
        .map(str::trim)
        .nth(index)
        .filter(|entry| !entry.is_empty())
        .map(str::to_string)
}

/// Lift `name=function(...){...}` or `function name(...){...}` as a
/// self-contained `var name=function(...){...};` source string.
fn lift_function_source(body: &str, name: &str) -> Option<String> {
    let assignment = format!("{name}=function(");
    let declaration = format!("function {name}(");

    let (start, offset_to_args) = if let Some(pos) = body.find(&assignment) {
        (pos, assignment.len() - 1)
    } else {
        let pos = body.find(&declaration)?;
        (pos, declaration.len() - 1)
    };

    let args_open = start + offset_to_args;
    let args_block = balanced_js_block(&body[args_open..])?;
    let after_args = args_open + args_block.len();

    let body_open = after_args + body[after_args..].find('{')?;
    let fn_body = balanced_js_block(&body[body_open..])?;

    let args = &args_block[1..args_block.len() - 1];
    Some(format!("var {name}=function({args}){fn_body};"))
}

#[cfg(test)]
mod tests {
    use super::*;

    const PLAYER_STUB: &str = concat!(
        r#"var Ou={zq:function(a){a.reverse()},"#,
        r#"pk:function(a,b){a.splice(0,b)},"#,
        r#"hW:function(a,b){var c=a[0];a[0]=a[b%a.length];a[b%a.length]=c}};"#,
        r#"Wka=function(a){a=a.split("");Ou.pk(a,1);Ou.zq(a,0);Ou.hW(a,3);return a.join("")};"#,
        r#"var bquc=[Xno];"#,
        r#"Xno=function(a){var b=a.split("");b.push("x");return b.join("")};"#,
        r#"g.k.get=function(a){if(c=a.get("n"))&&(b=bquc[0](c)||dT0)"#,
        r#"{signatureTimestamp:19876}"#
    );

    #[test]
    fn extracts_sig_ops_in_call_order() {
        let decipherer = Decipherer::from_player_js(PLAYER_STUB).unwrap();
        assert_eq!(
            decipherer.sig_ops,
            vec![SigOp::Splice(1), SigOp::Reverse, SigOp::Swap(3)]
        );
        assert_eq!(decipherer.signature_timestamp, Some(19876));
    }

    #[test]
    fn applies_sig_ops() {
        let decipherer = Decipherer {
            sig_ops: vec![SigOp::Splice(1), SigOp::Reverse, SigOp::Swap(1)],
            n_fn_name: String::new(),
            n_fn_source: String::new(),
            signature_timestamp: None,
        };
        // "abcdef" -> splice(1) "bcdef" -> reverse "fedcb" -> swap(1) "efdcb"
        assert_eq!(decipherer.apply_sig("abcdef"), "efdcb");
    }

    #[test]
    fn splice_past_end_returns_empty() {
        let decipherer = Decipherer {
            sig_ops: vec![SigOp::Splice(10)],
            n_fn_name: String::new(),
            n_fn_source: String::new(),
            signature_timestamp: None,
        };
        assert_eq!(decipherer.apply_sig("abc"), "");
    }

    #[test]
    fn swap_wraps_modulo_length() {
        let decipherer = Decipherer {
            sig_ops: vec![SigOp::Swap(7)],
            n_fn_name: String::new(),
            n_fn_source: String::new(),
            signature_timestamp: None,
        };
        // pos = 7 % 3 = 1
        assert_eq!(decipherer.apply_sig("abc"), "bac");
    }

    #[test]
    fn resolves_indexed_n_function_through_array() {
        let decipherer = Decipherer::from_player_js(PLAYER_STUB).unwrap();
        assert_eq!(decipherer.n_fn_name, "Xno");
        assert!(decipherer.n_fn_source.starts_with("var Xno=function(a)"));
        assert!(decipherer.n_fn_source.ends_with("};"));
    }

    #[test]
    fn lifts_function_declaration_form() {
        let body = r#"function tzb(a){var b=a.length;return a+b};b=tzb(a)"#;
        let (name, source) = extract_n_function(body).unwrap();
        assert_eq!(name, "tzb");
        assert_eq!(source, "var tzb=function(a){var b=a.length;return a+b};");
    }

    #[test]
    fn missing_scrambler_is_an_error() {
        assert!(matches!(
            Decipherer::from_player_js("var nothing=1;"),
            Err(VideoError::PlayerJsParseError(_))
        ));
    }
}
