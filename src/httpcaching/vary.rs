//! `Vary` handling per RFC 9110 section 12.5.5 and RFC 9111 section 4.1.

use std::collections::BTreeMap;

use http::{HeaderMap, header};
use serde::{Deserialize, Serialize};

/// The request-header subset captured when a response was stored: for each
/// field name listed in the response's `Vary`, the normalized request value
/// (or `None` when the request did not carry the field).
///
/// A response with `Vary: *` records the `*` entry and never matches a
/// later request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaryMap(BTreeMap<String, Option<String>>);

impl VaryMap {
    pub fn from_response(response_headers: &HeaderMap, request_headers: &HeaderMap) -> Self {
        let mut map = BTreeMap::new();
        for name in vary_field_names(response_headers) {
            let value = normalized_request_value(request_headers, &name);
            map.insert(name, value);
        }
        Self(map)
    }

    /// Whether a request can be served by the response this map was captured
    /// for: every recorded field must agree, either both absent or byte-equal
    /// after normalization.
    pub fn matches(&self, request_headers: &HeaderMap) -> bool {
        if self.0.contains_key("*") {
            return false;
        }

        for (name, stored) in &self.0 {
            if normalized_request_value(request_headers, name) != *stored {
                return false;
            }
        }
        true
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Option<String>> {
        self.0.get(name)
    }
}

fn vary_field_names(headers: &HeaderMap) -> Vec<String> {
    headers
        .get_all(header::VARY)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(str::trim)
        .filter(|field| !field.is_empty())
        .map(|field| field.to_ascii_lowercase())
        .collect()
}

/// All occurrences of a request header joined with `", "`, or `None` when
/// the request did not send the field at all.
fn normalized_request_value(headers: &HeaderMap, name: &str) -> Option<String> {
    let values: Vec<&str> = headers
        .get_all(name)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .collect();
    if values.is_empty() {
        None
    } else {
        Some(values.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn header_map(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(*name, HeaderValue::from_static(value));
        }
        map
    }

    #[test]
    fn empty_vary_matches_everything() {
        let vary = VaryMap::from_response(&HeaderMap::new(), &HeaderMap::new());
        assert!(vary.is_empty());
        assert!(vary.matches(&header_map(&[("accept", "text/html")])));
    }

    #[test]
    fn captures_normalized_request_values() {
        let response = header_map(&[("vary", "Accept-Encoding, Count")]);
        let request = header_map(&[("accept-encoding", "gzip"), ("accept-encoding", "br")]);

        let vary = VaryMap::from_response(&response, &request);
        assert_eq!(
            vary.get("accept-encoding"),
            Some(&Some("gzip, br".to_string()))
        );
        assert_eq!(vary.get("count"), Some(&None));
    }

    #[test]
    fn matches_when_values_agree() {
        let response = header_map(&[("vary", "Count")]);
        let request = header_map(&[("count", "1")]);
        let vary = VaryMap::from_response(&response, &request);

        assert!(vary.matches(&header_map(&[("count", "1")])));
        assert!(!vary.matches(&header_map(&[("count", "2")])));
        assert!(!vary.matches(&HeaderMap::new()));
    }

    #[test]
    fn absent_header_only_matches_absent() {
        let response = header_map(&[("vary", "Count")]);
        let vary = VaryMap::from_response(&response, &HeaderMap::new());

        assert!(vary.matches(&HeaderMap::new()));
        assert!(!vary.matches(&header_map(&[("count", "1")])));
    }

    #[test]
    fn multiple_occurrences_normalize_before_comparing() {
        let response = header_map(&[("vary", "X-Flags")]);
        let request = header_map(&[("x-flags", "a"), ("x-flags", "b")]);
        let vary = VaryMap::from_response(&response, &request);

        assert!(vary.matches(&header_map(&[("x-flags", "a"), ("x-flags", "b")])));
        assert!(!vary.matches(&header_map(&[("x-flags", "a")])));
    }

    #[test]
    fn vary_star_never_matches() {
        let response = header_map(&[("vary", "*")]);
        let vary = VaryMap::from_response(&response, &HeaderMap::new());
        assert!(!vary.matches(&HeaderMap::new()));
    }

    #[test]
    fn vary_lists_split_across_header_values() {
        let mut response = HeaderMap::new();
        response.append(header::VARY, HeaderValue::from_static("Accept"));
        response.append(header::VARY, HeaderValue::from_static("Count"));
        let request = header_map(&[("accept", "text/plain"), ("count", "7")]);

        let vary = VaryMap::from_response(&response, &request);
        assert_eq!(vary.get("accept"), Some(&Some("text/plain".to_string())));
        assert_eq!(vary.get("count"), Some(&Some("7".to_string())));
    }
}
