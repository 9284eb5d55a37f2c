use std::borrow::Cow;
use std::fmt;
use tracing::warn;
use url::Url;

/// Why a request path failed to yield a usable proxy target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetError {
    /// The path carries no proxy prefix, or nothing follows it.
    Missing,
    /// The candidate after the prefix is not an absolute URL.
    Malformed,
    /// The candidate parsed but uses a non-network scheme (file:, etc.).
    ForbiddenScheme(String),
}

impl fmt::Display for TargetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetError::Missing => write!(f, "no proxy target in request path"),
            TargetError::Malformed => write!(f, "target is not a valid absolute URL"),
            TargetError::ForbiddenScheme(scheme) => {
                write!(f, "unsupported target scheme '{scheme}'")
            }
        }
    }
}

impl std::error::Error for TargetError {}

/// Extract the forwarding target from an inbound path+query.
///
/// Everything after the first occurrence of `prefix` is the candidate URL.
/// Only `http` and `https` targets are accepted; anything else is rejected
/// so the proxy can never be pointed at local resources (`file:///...`).
pub fn extract_target(path_and_query: &str, prefix: &str) -> Result<Url, TargetError> {
    let idx = path_and_query.find(prefix).ok_or(TargetError::Missing)?;
    let candidate = &path_and_query[idx + prefix.len()..];
    if candidate.is_empty() {
        return Err(TargetError::Missing);
    }

    let candidate = repair_query(candidate);
    let url = Url::parse(&candidate).map_err(|err| {
        warn!(candidate = %candidate, error = %err, "rejected malformed proxy target");
        TargetError::Malformed
    })?;

    match url.scheme() {
        "http" | "https" => Ok(url),
        scheme => {
            warn!(scheme = %scheme, "rejected proxy target with forbidden scheme");
            Err(TargetError::ForbiddenScheme(scheme.to_string()))
        }
    }
}

/// Quirk repair for callers that append query parameters to a target whose
/// own query string was dropped: `.../api&x=1` becomes `.../api?x=1`. Only
/// applies when the candidate has no `?` at all; this is not a query parser.
fn repair_query(candidate: &str) -> Cow<'_, str> {
    if !candidate.contains('?') && candidate.contains('&') {
        Cow::Owned(candidate.replacen('&', "?", 1))
    } else {
        Cow::Borrowed(candidate)
    }
}
