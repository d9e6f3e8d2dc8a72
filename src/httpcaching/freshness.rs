//! Freshness and age arithmetic from RFC 9111 section 4.2.
//!
//! The section 4.2.3 age calculation is collapsed into a single stored
//! timestamp: the estimated moment the response was created at the origin.
//! The current age then becomes `now - creation_time`, which keeps serving
//! stateless.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use http::{HeaderMap, HeaderName, header};
use tracing::{error, warn};

use super::CacheControl;

fn parse_date_header(headers: &HeaderMap, name: &HeaderName) -> Option<SystemTime> {
    let value = headers.get(name)?;
    match value
        .to_str()
        .ok()
        .and_then(|value| httpdate::parse_http_date(value).ok())
    {
        Some(time) => Some(time),
        None => {
            warn!(header = %name, "header is not a valid HTTP date");
            None
        }
    }
}

fn response_date(headers: &HeaderMap) -> SystemTime {
    // The forwarding path replaces a missing or malformed Date before a
    // response is ever stored, so a failure here means stored state is bad.
    match parse_date_header(headers, &header::DATE) {
        Some(date) => date,
        None => {
            error!("Date header is missing or invalid on a stored response");
            UNIX_EPOCH
        }
    }
}

/// Computes the freshness lifetime per RFC 9111 sections 4.2.1 and 4.2.2:
/// `s-maxage`, then `max-age`, then `Expires - Date`, then the heuristic
/// `(Date - Last-Modified) / 10`, and zero when nothing applies.
pub fn freshness_lifetime(headers: &HeaderMap, cache_control: &CacheControl) -> Duration {
    if let Some(s_maxage) = cache_control.s_maxage {
        return s_maxage;
    }
    if let Some(max_age) = cache_control.max_age {
        return max_age;
    }

    if let Some(expires) = parse_date_header(headers, &header::EXPIRES) {
        let date = response_date(headers);
        return expires.duration_since(date).unwrap_or(Duration::ZERO);
    }

    if let Some(modified) = parse_date_header(headers, &header::LAST_MODIFIED) {
        let date = response_date(headers);
        return date
            .duration_since(modified)
            .map(|interval| interval / 10)
            .unwrap_or(Duration::ZERO);
    }

    Duration::ZERO
}

/// Estimates when the response was created at the origin, per RFC 9111
/// section 4.2.3: `response_time - max(apparent_age, corrected_age)`.
pub fn response_creation_time(
    headers: &HeaderMap,
    request_time: SystemTime,
    response_time: SystemTime,
) -> SystemTime {
    let age_header = match headers.get(header::AGE) {
        Some(value) => match value.to_str().ok().and_then(|v| v.trim().parse::<u64>().ok()) {
            Some(age) => age,
            None => {
                warn!(age = ?value, "response has an invalid Age header");
                0
            }
        },
        None => 0,
    };

    let date = response_date(headers);
    let apparent_age = response_time.duration_since(date).unwrap_or(Duration::ZERO);
    let response_delay = response_time
        .duration_since(request_time)
        .unwrap_or(Duration::ZERO);
    let corrected_age = Duration::from_secs(age_header) + response_delay;

    let initial_age = apparent_age.max(corrected_age);
    response_time.checked_sub(initial_age).unwrap_or(UNIX_EPOCH)
}

/// Current age of a stored response, truncated to whole seconds.
pub fn current_age(created_at: SystemTime, now: SystemTime) -> Duration {
    let age = now.duration_since(created_at).unwrap_or(Duration::ZERO);
    Duration::from_secs(age.as_secs())
}

/// Returns the current age and whether the response is still fresh.
pub fn is_fresh(
    headers: &HeaderMap,
    cache_control: &CacheControl,
    created_at: SystemTime,
    now: SystemTime,
) -> (Duration, bool) {
    let age = current_age(created_at, now);
    (age, freshness_lifetime(headers, cache_control) > age)
}
