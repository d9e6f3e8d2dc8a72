//! Parsing for RFC 9111 section 5.2.2 response directives, plus the
//! `immutable` (RFC 8246) and `stale-*` (RFC 5861) extensions, and the
//! storability decision built on top of them.

use std::collections::HashSet;
use std::time::Duration;

use http::{HeaderMap, StatusCode, header};
use thiserror::Error;
use tracing::{trace, warn};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CacheControlError {
    #[error("invalid argument for directive '{directive}': '{value}'")]
    InvalidArgument { directive: String, value: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheControl {
    pub immutable: bool,
    pub max_age: Option<Duration>,
    pub must_revalidate: bool,
    pub must_understand: bool,
    pub no_cache: bool,
    pub no_store: bool,
    pub no_transform: bool,
    pub private: bool,
    pub proxy_revalidate: bool,
    pub public: bool,
    pub s_maxage: Option<Duration>,
    pub stale_while_revalidate: Option<Duration>,
    pub stale_if_error: Option<Duration>,
}

impl CacheControl {
    /// Parses every `Cache-Control` header value in `headers`. Duplicate
    /// directives keep their first occurrence; unknown directives are
    /// ignored.
    pub fn parse(headers: &HeaderMap) -> Result<Self, CacheControlError> {
        let mut parsed = Self::default();
        let mut seen = HashSet::new();

        for value in headers.get_all(header::CACHE_CONTROL) {
            let Ok(value) = value.to_str() else {
                warn!("ignoring a Cache-Control header that is not valid UTF-8");
                continue;
            };

            for directive in value.split(',') {
                let directive = directive.trim();
                if directive.is_empty() {
                    continue;
                }

                let (name, argument) = match directive.split_once('=') {
                    Some((name, argument)) => (name, Some(argument)),
                    None => (directive, None),
                };
                let name = name.to_ascii_lowercase();
                if !seen.insert(name.clone()) {
                    // Duplicate directive, only the first occurrence is valid.
                    continue;
                }

                match (name.as_str(), argument) {
                    ("max-age", Some(value)) => {
                        parsed.max_age = Some(parse_seconds("max-age", value)?);
                    }
                    ("s-maxage", Some(value)) => {
                        parsed.s_maxage = Some(parse_seconds("s-maxage", value)?);
                    }
                    ("stale-while-revalidate", Some(value)) => {
                        parsed.stale_while_revalidate =
                            Some(parse_seconds("stale-while-revalidate", value)?);
                    }
                    ("stale-if-error", Some(value)) => {
                        parsed.stale_if_error = Some(parse_seconds("stale-if-error", value)?);
                    }
                    // no-cache and private can carry a field-name list; the
                    // qualified forms are treated as unqualified.
                    ("no-cache", qualifier) => {
                        if qualifier.is_some() {
                            trace!(directive, "treating qualified 'no-cache' as unqualified");
                        }
                        parsed.no_cache = true;
                    }
                    ("private", qualifier) => {
                        if qualifier.is_some() {
                            trace!(directive, "treating qualified 'private' as unqualified");
                        }
                        parsed.private = true;
                    }
                    ("must-revalidate", None) => parsed.must_revalidate = true,
                    ("must-understand", None) => parsed.must_understand = true,
                    ("no-store", None) => parsed.no_store = true,
                    ("no-transform", None) => parsed.no_transform = true,
                    ("proxy-revalidate", None) => parsed.proxy_revalidate = true,
                    ("public", None) => parsed.public = true,
                    ("immutable", None) => parsed.immutable = true,
                    _ => {
                        warn!(directive, "received an unknown directive in Cache-Control header");
                    }
                }
            }
        }

        Ok(parsed)
    }
}

fn parse_seconds(directive: &str, value: &str) -> Result<Duration, CacheControlError> {
    // delta-seconds per RFC 9111 section 1.2.2: a non-negative integer.
    value
        .trim()
        .parse::<u64>()
        .map(Duration::from_secs)
        .map_err(|_| CacheControlError::InvalidArgument {
            directive: directive.to_string(),
            value: value.to_string(),
        })
}

/// Implements the storability decision of RFC 9111 section 3 for a shared
/// (or, when `private_cache` is set, private) cache: only complete 200
/// responses carrying an explicit or heuristic freshness signal are stored.
pub fn is_storable(status: StatusCode, headers: &HeaderMap, private_cache: bool) -> bool {
    if status != StatusCode::OK {
        return false;
    }

    let cache_control = match CacheControl::parse(headers) {
        Ok(cache_control) => cache_control,
        Err(err) => {
            warn!(error = %err, "unable to parse cache control directives");
            return false;
        }
    };

    if cache_control.no_store {
        return false;
    }
    if cache_control.private && !private_cache {
        return false;
    }

    if headers.contains_key(header::AUTHORIZATION)
        && !cache_control.must_revalidate
        && !cache_control.public
        && cache_control.s_maxage.is_none()
    {
        return false;
    }

    // Partial content is never stored.
    if headers.contains_key(header::RANGE) || headers.contains_key(header::CONTENT_RANGE) {
        return false;
    }

    if cache_control.public || cache_control.max_age.is_some() || cache_control.s_maxage.is_some() {
        return true;
    }

    if headers.contains_key(header::EXPIRES) {
        return true;
    }

    // A parseable Last-Modified allows the heuristic lifetime of RFC 9111
    // section 4.2.2.
    if let Some(last_modified) = headers.get(header::LAST_MODIFIED) {
        match last_modified
            .to_str()
            .ok()
            .and_then(|value| httpdate::parse_http_date(value).ok())
        {
            Some(_) => return true,
            None => warn!("unable to parse Last-Modified header"),
        }
    }

    // An entity tag lets us revalidate for free on the next request.
    if headers.contains_key(header::ETAG) {
        return true;
    }

    false
}
