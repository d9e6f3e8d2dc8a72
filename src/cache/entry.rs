//! The descriptor types stored in the metadata store, and their binary
//! encoding.
//!
//! Each cache key maps to an ordered list of [`CachedResponse`] descriptors:
//! one per stored variant, plus historical copies refreshed by
//! revalidation. The runtime form carries `http` types; the persisted form
//! is a plain serde tuple so the encoding stays stable and strict.

use std::collections::BTreeMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, anyhow};
use bincode::Options;
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use serde::{Deserialize, Serialize};

use crate::httpcaching::VaryMap;

/// One stored response variant.
#[derive(Debug, Clone)]
pub struct CachedResponse {
    /// Hex BLAKE3-256 of the response body; names the blob on disk.
    pub content_hash: String,
    pub status: StatusCode,
    /// Response headers, post hop-by-hop strip.
    pub headers: HeaderMap,
    /// Request-header subset this variant was negotiated on.
    pub vary: VaryMap,
    /// Estimated wall-clock time the response was created at the origin.
    pub created_at: SystemTime,
}

pub type CachedResponses = Vec<CachedResponse>;

#[derive(Debug, Serialize, Deserialize)]
struct PersistedResponse {
    content_hash: String,
    status: u16,
    headers: BTreeMap<String, Vec<String>>,
    vary: VaryMap,
    created_at_nanos: i64,
}

impl CachedResponse {
    fn to_persisted(&self) -> PersistedResponse {
        PersistedResponse {
            content_hash: self.content_hash.clone(),
            status: self.status.as_u16(),
            headers: header_fields(&self.headers),
            vary: self.vary.clone(),
            created_at_nanos: system_time_nanos(self.created_at),
        }
    }

    fn from_persisted(persisted: PersistedResponse) -> Result<Self> {
        Ok(Self {
            content_hash: persisted.content_hash,
            status: StatusCode::from_u16(persisted.status)
                .map_err(|_| anyhow!("invalid status code {}", persisted.status))?,
            headers: header_map(&persisted.headers),
            vary: persisted.vary,
            created_at: nanos_system_time(persisted.created_at_nanos),
        })
    }
}

pub(crate) fn encode_responses(responses: &CachedResponses) -> Result<Vec<u8>> {
    let persisted: Vec<PersistedResponse> = responses
        .iter()
        .map(CachedResponse::to_persisted)
        .collect();
    bincode_options()
        .serialize(&persisted)
        .context("unable to encode cache entry")
}

pub(crate) fn decode_responses(bytes: &[u8]) -> Result<CachedResponses> {
    let persisted: Vec<PersistedResponse> = bincode_options()
        .deserialize(bytes)
        .context("unable to decode cache entry")?;
    persisted
        .into_iter()
        .map(CachedResponse::from_persisted)
        .collect()
}

fn bincode_options() -> impl Options {
    // The default options reject trailing bytes, keeping decoding strict.
    bincode::DefaultOptions::new()
}

fn system_time_nanos(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(offset) => i64::try_from(offset.as_nanos()).unwrap_or(i64::MAX),
        Err(before) => -i64::try_from(before.duration().as_nanos()).unwrap_or(i64::MAX),
    }
}

fn nanos_system_time(nanos: i64) -> SystemTime {
    if nanos >= 0 {
        UNIX_EPOCH + Duration::from_nanos(nanos as u64)
    } else {
        UNIX_EPOCH - Duration::from_nanos(nanos.unsigned_abs())
    }
}

pub(crate) fn header_fields(map: &HeaderMap) -> BTreeMap<String, Vec<String>> {
    let mut fields: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (name, value) in map.iter() {
        if let Ok(value) = value.to_str() {
            fields
                .entry(name.as_str().to_string())
                .or_default()
                .push(value.to_string());
        }
    }
    fields
}

pub(crate) fn header_map(fields: &BTreeMap<String, Vec<String>>) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, values) in fields {
        for value in values {
            if let (Ok(name), Ok(value)) = (
                HeaderName::try_from(name.as_str()),
                HeaderValue::from_str(value),
            ) {
                map.append(name, value);
            }
        }
    }
    map
}
