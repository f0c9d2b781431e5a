//! Request target matching against resource patterns.
//!
//! Matching is performed on `host + path` of the request URL. The query
//! string and fragment are ignored and trailing slashes are stripped from
//! both sides before comparison.
//!
//! Supported patterns:
//! - `api.stripe.com/*` matches the host itself and anything below it
//! - `api.openai.com/v1/chat/*` matches only chat endpoints
//! - `api.example.com/v1/specific` matches that exact host and path
//! - `*` matches everything
//!
//! A `*` anywhere else matches any run of characters, including `/`.
//!
//! Hosts compare case-insensitively on both sides. Paths are case-sensitive
//! and are compared in the form the URL parser produces, with dot segments
//! resolved and unsafe characters percent-encoded.

use std::borrow::Cow;

use url::{ParseError, Position, Url};

/// Check whether a request URL matches a resource pattern.
///
/// Unparseable URLs never match.
pub fn matches(request_url: &str, pattern: &str) -> bool {
    request_target(request_url).is_some_and(|target| target_matches(&target, pattern))
}

/// Extract `host[:port]/path` from a request URL, trailing slashes removed.
///
/// Scheme-less input such as `api.stripe.com/v1` is taken verbatim as
/// host and path.
pub(crate) fn request_target(request_url: &str) -> Option<String> {
    let target = match Url::parse(request_url) {
        Ok(url) => {
            let host = &url[Position::BeforeHost..Position::AfterPort];
            format!("{}{}", host, url.path())
        }
        Err(ParseError::RelativeUrlWithoutBase) => {
            let end = request_url
                .find(['?', '#'])
                .unwrap_or(request_url.len());
            lowercase_host(&request_url[..end]).into_owned()
        }
        Err(_) => return None,
    };

    Some(target.trim_end_matches('/').to_string())
}

/// Match an already extracted request target against a pattern.
pub(crate) fn target_matches(target: &str, pattern: &str) -> bool {
    glob_match(&lowercase_host(pattern.trim_end_matches('/')), target)
}

/// Lowercase everything before the first `/`, matching how the URL parser
/// reports hosts.
fn lowercase_host(value: &str) -> Cow<'_, str> {
    let (host, path) = value.split_at(value.find('/').unwrap_or(value.len()));
    if host.bytes().any(|b| b.is_ascii_uppercase()) {
        Cow::Owned(host.to_ascii_lowercase() + path)
    } else {
        Cow::Borrowed(value)
    }
}

fn glob_match(pattern: &str, value: &str) -> bool {
    if pattern == value {
        return true;
    }

    if let Some(prefix) = pattern.strip_suffix("/*") {
        if value == prefix
            || value
                .strip_prefix(prefix)
                .is_some_and(|rest| rest.starts_with('/'))
        {
            return true;
        }
    }

    wildcard_match(pattern.as_bytes(), value.as_bytes())
}

/// Backtracking wildcard match where `*` matches zero or more bytes.
fn wildcard_match(pattern: &[u8], value: &[u8]) -> bool {
    match pattern.split_first() {
        None => value.is_empty(),
        Some((b'*', rest)) => {
            if rest.is_empty() {
                return true;
            }
            (0..=value.len()).any(|split| wildcard_match(rest, &value[split..]))
        }
        Some((&c, rest)) => match value.split_first() {
            Some((&v, tail)) if v == c => wildcard_match(rest, tail),
            _ => false,
        },
    }
}
