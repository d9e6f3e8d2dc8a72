//! The caching HTTP client.
//!
//! [`CachingClient::execute`] sits between per-origin handlers and the
//! public origins: it serves fresh stored responses directly, revalidates
//! stale ones with conditional requests, falls back to stale copies when an
//! origin is down, consults peer caches before the origin, and streams new
//! cacheable responses through the blob store on their way out.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::{Context as _, Result};
use futures::{StreamExt, TryStreamExt};
use http::{HeaderMap, HeaderValue, Method, StatusCode, header};
use tracing::{debug, trace, warn};
use url::Url;

mod body;
mod upstream;

pub use body::Body;
pub use upstream::UpstreamCaches;

use crate::cache::{Cache, CachedResponse, CachedResponses, MetaError, Version};
use crate::httpcaching::{
    CacheControl, VaryMap, current_age, etags_match, is_fresh, is_storable,
    response_creation_time, strip_hop_by_hop,
};
use body::BoxByteStream;
use upstream::rewrite_request;

/// An outbound request as the per-origin handlers hand it over: URL-form,
/// with an optional in-memory body (cacheable methods never carry one).
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Option<bytes::Bytes>,
}

impl Request {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: None,
        }
    }

    pub fn get(url: Url) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn head(url: Url) -> Self {
        Self::new(Method::HEAD, url)
    }
}

#[derive(Debug)]
pub struct Response {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Body,
}

/// How a request was satisfied. Reported through the notification hook
/// exactly once per [`CachingClient::execute`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Hit,
    Miss,
    Revalidated,
}

impl CacheStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheStatus::Hit => "hit",
            CacheStatus::Miss => "miss",
            CacheStatus::Revalidated => "revalidated",
        }
    }
}

pub type NotifyHook = Arc<dyn Fn(&Request, CacheStatus) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// A private cache may store `Cache-Control: private` responses.
    pub private_cache: bool,
    /// Total per-request timeout for outbound calls.
    pub timeout: Duration,
    pub pool_max_idle_per_host: usize,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            private_cache: false,
            timeout: Duration::from_secs(120),
            pool_max_idle_per_host: 32,
        }
    }
}

pub struct CachingClient {
    http: reqwest::Client,
    /// reqwest configures proxies per client, so proxy-mode upstream caches
    /// each get a lazily built client sharing the same settings.
    proxied: parking_lot::Mutex<HashMap<String, reqwest::Client>>,
    cache: Cache,
    options: ClientOptions,
    notify: NotifyHook,
}

/// A forwarded response before a serving decision was made: headers are
/// hop-by-hop stripped and the `Date` header is repaired, the body is still
/// an untouched upstream stream.
struct ForwardOutcome {
    status: StatusCode,
    headers: HeaderMap,
    body: BoxByteStream,
    request_time: SystemTime,
    response_time: SystemTime,
}

impl ForwardOutcome {
    fn into_response(self) -> Response {
        Response {
            status: self.status,
            headers: self.headers,
            body: Body::from_stream(self.body),
        }
    }
}

impl CachingClient {
    pub fn new(cache: Cache, options: ClientOptions, notify: NotifyHook) -> Result<Self> {
        let http = build_http_client(&options, None)?;
        Ok(Self {
            http,
            proxied: parking_lot::Mutex::new(HashMap::new()),
            cache,
            options,
            notify,
        })
    }

    fn notify(&self, request: &Request, status: CacheStatus) {
        (self.notify)(request, status);
    }

    /// Executes a request with full RFC 9111 semantics, consulting
    /// `upstreams` before the origin. The returned body always streams.
    pub async fn execute(
        &self,
        mut request: Request,
        upstreams: &UpstreamCaches,
    ) -> Result<Response> {
        // Only safe methods are cached.
        if request.method != Method::GET && request.method != Method::HEAD {
            let forwarded = self.forward(&request).await;
            self.notify(&request, CacheStatus::Miss);
            return forwarded.map(ForwardOutcome::into_response);
        }

        let key = cache_key(&request);

        let entry = match self.cache.get(key.as_bytes()) {
            Ok(entry) => Some(entry),
            Err(MetaError::NotFound) => None,
            Err(err) => {
                debug!(error = %err, "unable to load the cache entry, treating as absent");
                None
            }
        };

        if let Some((responses, _)) = &entry {
            if let Some(response) = self.serve_from_cache(&request, responses, false).await {
                debug!("serving response from cache");
                self.notify(&request, CacheStatus::Hit);
                return Ok(response);
            }
        }

        let original_request = request.clone();
        let (has_conditionals, was_conditional) = match &entry {
            Some((responses, _)) => add_conditional_headers(&mut request, responses),
            None => (false, false),
        };

        debug!("unable to serve from cache, forwarding");

        let mut outcome = match self.forward_with_upstreams(&request, upstreams).await {
            Ok(outcome) => outcome,
            Err(err) => return self.stale_or_error(&request, entry.as_ref(), err).await,
        };
        if outcome.status.is_server_error() {
            return self.stale_or_server_error(&request, entry.as_ref(), outcome).await;
        }

        if has_conditionals && outcome.status == StatusCode::NOT_MODIFIED {
            if let Some((responses, version)) = &entry {
                match self
                    .refresh_from_not_modified(&key, responses, *version, &outcome)
                    .await
                {
                    Some(response) => {
                        debug!("request re-validated, serving from cache");
                        self.notify(&request, CacheStatus::Revalidated);
                        return Ok(response);
                    }
                    None if was_conditional => {
                        debug!("passing through the conditional response");
                        self.notify(&request, CacheStatus::Miss);
                        return Ok(outcome.into_response());
                    }
                    None => {
                        // The origin answered 304 to validators we
                        // fabricated; ask again without them.
                        warn!(
                            "received a Not-Modified response matching no cached entry, retrying"
                        );
                        outcome = match self
                            .forward_with_upstreams(&original_request, upstreams)
                            .await
                        {
                            Ok(outcome) => outcome,
                            Err(err) => {
                                return self
                                    .stale_or_error(&original_request, entry.as_ref(), err)
                                    .await;
                            }
                        };
                        if outcome.status.is_server_error() {
                            return self
                                .stale_or_server_error(&original_request, entry.as_ref(), outcome)
                                .await;
                        }
                    }
                }
            }
        }

        self.notify(&request, CacheStatus::Miss);

        if !is_storable(outcome.status, &outcome.headers, self.options.private_cache) {
            debug!("response is not cacheable");
            return Ok(outcome.into_response());
        }

        Ok(self.ingest_response(&request, key, entry, outcome).await)
    }

    /// Tries to satisfy the request from the stored descriptors. With
    /// `force_stale` the freshness and revalidation requirements are
    /// ignored; that is the path taken when the origin is unreachable.
    async fn serve_from_cache(
        &self,
        request: &Request,
        responses: &CachedResponses,
        force_stale: bool,
    ) -> Option<Response> {
        let candidates: Vec<&CachedResponse> = responses
            .iter()
            .filter(|response| response.vary.matches(&request.headers))
            .collect();
        if candidates.is_empty() {
            return None;
        }

        for response in most_recent_candidates(&candidates) {
            let cache_control = match CacheControl::parse(&response.headers) {
                Ok(cache_control) => cache_control,
                Err(err) => {
                    warn!(error = %err, "unable to parse cache control directives");
                    CacheControl::default()
                }
            };

            if !force_stale && (cache_control.no_cache || cache_control.must_revalidate) {
                continue;
            }

            let (age, fresh) = is_fresh(
                &response.headers,
                &cache_control,
                response.created_at,
                SystemTime::now(),
            );
            if !fresh && !force_stale {
                continue;
            }

            match self.cache.open_blob(&response.content_hash).await {
                Ok(file) => {
                    let mut headers = response.headers.clone();
                    set_age_header(&mut headers, age);
                    return Some(Response {
                        status: response.status,
                        headers,
                        body: Body::from_file(file),
                    });
                }
                Err(err) => {
                    warn!(error = %err, "entry has been pruned from the cache already");
                    continue;
                }
            }
        }

        None
    }

    /// Handles a 304: finds the descriptor the origin revalidated, merges
    /// the refreshed headers into it, persists the merge (one retry on
    /// conflict), and re-serves the cached body as a synthetic 200.
    async fn refresh_from_not_modified(
        &self,
        key: &str,
        responses: &CachedResponses,
        version: Version,
        outcome: &ForwardOutcome,
    ) -> Option<Response> {
        let index = find_validator_match(&outcome.headers, responses)?;

        let mut updated = responses.clone();
        merge_refreshed_headers(&mut updated[index], &outcome.headers);
        updated[index].created_at = response_creation_time(
            &outcome.headers,
            outcome.request_time,
            outcome.response_time,
        );

        match self.cache.save(key.as_bytes(), &updated, version) {
            Ok(()) => {}
            Err(MetaError::Conflict) => self.retry_refresh(key, outcome, &updated[index]),
            Err(err) => warn!(error = %err, "unable to update the revalidated entry"),
        }

        let refreshed = &updated[index];
        let file = match self.cache.open_blob(&refreshed.content_hash).await {
            Ok(file) => file,
            Err(err) => {
                warn!(
                    error = %err,
                    "revalidated entry no longer has its body, ignoring the match"
                );
                return None;
            }
        };

        let mut headers = refreshed.headers.clone();
        set_age_header(
            &mut headers,
            current_age(refreshed.created_at, SystemTime::now()),
        );
        Some(Response {
            status: StatusCode::OK,
            headers,
            body: Body::from_file(file),
        })
    }

    /// Second and last attempt to persist a revalidation merge after a
    /// version conflict. Failing again only costs the refreshed headers.
    fn retry_refresh(&self, key: &str, outcome: &ForwardOutcome, refreshed: &CachedResponse) {
        let (mut latest, latest_version) = match self.cache.get(key.as_bytes()) {
            Ok(entry) => entry,
            Err(err) => {
                warn!(error = %err, "unable to reload the entry for a revalidation update");
                return;
            }
        };

        let Some(index) = find_validator_match(&outcome.headers, &latest) else {
            warn!("revalidated entry disappeared during the update");
            return;
        };

        merge_refreshed_headers(&mut latest[index], &outcome.headers);
        latest[index].created_at = refreshed.created_at;
        if let Err(err) = self.cache.save(key.as_bytes(), &latest, latest_version) {
            warn!(error = %err, "unable to update the revalidated entry, dropping the refresh");
        }
    }

    async fn stale_or_error(
        &self,
        request: &Request,
        entry: Option<&(CachedResponses, Version)>,
        err: anyhow::Error,
    ) -> Result<Response> {
        if let Some((responses, _)) = entry {
            if let Some(response) = self.serve_from_cache(request, responses, true).await {
                warn!(
                    error = %err,
                    "unable to contact the upstream, serving stale response from cache"
                );
                self.notify(request, CacheStatus::Hit);
                return Ok(response);
            }
        }
        self.notify(request, CacheStatus::Miss);
        Err(err)
    }

    async fn stale_or_server_error(
        &self,
        request: &Request,
        entry: Option<&(CachedResponses, Version)>,
        outcome: ForwardOutcome,
    ) -> Result<Response> {
        if let Some((responses, _)) = entry {
            if let Some(response) = self.serve_from_cache(request, responses, true).await {
                warn!(
                    status = %outcome.status,
                    "upstream returned a server error, serving stale response from cache"
                );
                self.notify(request, CacheStatus::Hit);
                return Ok(response);
            }
        }
        self.notify(request, CacheStatus::Miss);
        Ok(outcome.into_response())
    }

    /// Wires the response body through the blob store. On a clean ingest a
    /// new descriptor is appended to the entry; a version conflict drops
    /// the descriptor and the next request re-ingests.
    async fn ingest_response(
        &self,
        request: &Request,
        key: String,
        entry: Option<(CachedResponses, Version)>,
        outcome: ForwardOutcome,
    ) -> Response {
        let ForwardOutcome {
            status,
            headers,
            body,
            request_time,
            response_time,
        } = outcome;

        let vary = VaryMap::from_response(&headers, &request.headers);
        let created_at = response_creation_time(&headers, request_time, response_time);

        let cache = self.cache.clone();
        let descriptor_headers = headers.clone();
        let commit_key = key.clone();
        let on_commit = move |content_hash: String| {
            let descriptor = CachedResponse {
                content_hash,
                status,
                headers: descriptor_headers,
                vary,
                created_at,
            };
            let result = match entry {
                Some((mut responses, version)) => {
                    responses.push(descriptor);
                    cache.save(commit_key.as_bytes(), &responses, version)
                }
                None => cache.insert_new(commit_key.as_bytes(), &vec![descriptor]),
            };
            match result {
                Ok(()) => debug!(key = %commit_key, "response saved in the cache"),
                Err(MetaError::Conflict) => debug!(
                    key = %commit_key,
                    "entry changed concurrently, dropping the new response"
                ),
                Err(err) => {
                    warn!(key = %commit_key, error = %err, "unable to save the response")
                }
            }
        };
        let on_abort = move || debug!(key = %key, "response was not stored");

        let stream = self.cache.ingest(body, on_commit, on_abort).await;
        Response {
            status,
            headers,
            body: Body::from_stream(stream.boxed()),
        }
    }

    /// Tries every upstream cache in order, swallowing transport errors,
    /// and falls back to the origin.
    async fn forward_with_upstreams(
        &self,
        request: &Request,
        upstreams: &UpstreamCaches,
    ) -> Result<ForwardOutcome> {
        for upstream in &upstreams.uris {
            debug!(upstream = %upstream, "trying upstream cache first");
            let attempt = if upstreams.proxy {
                match self.proxied_client(upstream) {
                    Ok(client) => self.forward_via(&client, request).await,
                    Err(err) => {
                        warn!(
                            upstream = %upstream,
                            error = %err,
                            "unable to build a proxy client for the upstream cache"
                        );
                        continue;
                    }
                }
            } else {
                self.forward(&rewrite_request(request, upstream)).await
            };

            match attempt {
                Ok(outcome) => return Ok(outcome),
                Err(err) => {
                    debug!(upstream = %upstream, error = %err, "upstream cache returned an error");
                }
            }
        }

        self.forward(request).await
    }

    async fn forward(&self, request: &Request) -> Result<ForwardOutcome> {
        self.forward_via(&self.http, request).await
    }

    async fn forward_via(
        &self,
        http: &reqwest::Client,
        request: &Request,
    ) -> Result<ForwardOutcome> {
        let mut headers = request.headers.clone();
        strip_hop_by_hop(&mut headers);

        {
            // Log-line clones never carry credentials.
            let mut logged = headers.clone();
            logged.remove(header::AUTHORIZATION);
            trace!(
                method = %request.method,
                url = %request.url,
                headers = ?logged,
                "sending request to upstream"
            );
        }

        let mut builder = http
            .request(request.method.clone(), request.url.clone())
            .headers(headers);
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let request_time = SystemTime::now();
        let result = builder.send().await;
        let response_time = SystemTime::now();
        let response = result.context("upstream request failed")?;

        let status = response.status();
        let mut headers = response.headers().clone();
        strip_hop_by_hop(&mut headers);
        trace!(status = %status, headers = ?headers, "received response from upstream");

        // RFC 9110: a cache recipient must replace a missing or garbled
        // Date with its own clock.
        repair_date_header(&mut headers);

        let body = response.bytes_stream().map_err(std::io::Error::other).boxed();
        Ok(ForwardOutcome {
            status,
            headers,
            body,
            request_time,
            response_time,
        })
    }

    fn proxied_client(&self, upstream: &Url) -> Result<reqwest::Client> {
        if let Some(client) = self.proxied.lock().get(upstream.as_str()) {
            return Ok(client.clone());
        }
        let client = build_http_client(&self.options, Some(upstream))?;
        self.proxied
            .lock()
            .insert(upstream.as_str().to_string(), client.clone());
        Ok(client)
    }
}

fn build_http_client(options: &ClientOptions, proxy: Option<&Url>) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .timeout(options.timeout)
        .pool_max_idle_per_host(options.pool_max_idle_per_host)
        // A cache hands redirects back to its caller untouched.
        .redirect(reqwest::redirect::Policy::none())
        .use_rustls_tls();
    if let Some(proxy) = proxy {
        builder = builder.proxy(
            reqwest::Proxy::all(proxy.as_str())
                .with_context(|| format!("invalid upstream proxy '{proxy}'"))?,
        );
    }
    builder.build().context("unable to build the HTTP client")
}

fn cache_key(request: &Request) -> String {
    format!("{}+{}", request.method, request.url)
}

fn set_age_header(headers: &mut HeaderMap, age: Duration) {
    if let Ok(value) = HeaderValue::from_str(&age.as_secs().to_string()) {
        headers.insert(header::AGE, value);
    }
}

fn repair_date_header(headers: &mut HeaderMap) {
    let valid = headers
        .get(header::DATE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| httpdate::parse_http_date(value).ok())
        .is_some();
    if !valid {
        debug!("missing or invalid Date header replaced");
        if let Ok(value) = HeaderValue::from_str(&httpdate::fmt_http_date(SystemTime::now())) {
            headers.insert(header::DATE, value);
        }
    }
}

/// Among the vary-compatible candidates, keeps the ones with the greatest
/// `Date` header (several on a tie).
fn most_recent_candidates<'a>(candidates: &[&'a CachedResponse]) -> Vec<&'a CachedResponse> {
    let mut most_recent: Vec<&CachedResponse> = Vec::with_capacity(1);
    let mut max_date = SystemTime::UNIX_EPOCH;

    for &candidate in candidates {
        let date = match header_str(&candidate.headers, &header::DATE)
            .and_then(|value| httpdate::parse_http_date(value).ok())
        {
            Some(date) => date,
            None => {
                // Date is repaired before storage; a stored response
                // without one means corrupted state.
                tracing::error!("stored response carries no parseable Date header");
                SystemTime::UNIX_EPOCH
            }
        };

        if date > max_date {
            most_recent.clear();
            most_recent.push(candidate);
            max_date = date;
        } else if date == max_date {
            most_recent.push(candidate);
        }
    }

    most_recent
}

/// Attaches stored validators to the outbound request: every stored ETag
/// joins `If-None-Match` (preserving the caller's), and the newest parseable
/// `Last-Modified` becomes `If-Modified-Since` unless the caller already
/// sent one. Returns (attached anything, caller was conditional).
fn add_conditional_headers(request: &mut Request, responses: &CachedResponses) -> (bool, bool) {
    let original_if_none_match: Vec<String> = request
        .headers
        .get_all(header::IF_NONE_MATCH)
        .iter()
        .filter_map(|value| value.to_str().ok().map(str::to_string))
        .collect();
    let original_if_modified_since = request.headers.get(header::IF_MODIFIED_SINCE).cloned();

    let mut etags: Vec<String> = Vec::new();
    let mut last_modified: Vec<String> = Vec::new();
    for response in responses {
        etags.extend(
            response
                .headers
                .get_all(header::ETAG)
                .iter()
                .filter_map(|value| value.to_str().ok().map(str::to_string)),
        );
        last_modified.extend(
            response
                .headers
                .get_all(header::LAST_MODIFIED)
                .iter()
                .filter_map(|value| value.to_str().ok().map(str::to_string)),
        );
    }

    let has_etags = !etags.is_empty();
    if has_etags {
        etags.extend(original_if_none_match.iter().cloned());
        // Some servers only honor a single If-None-Match header.
        if let Ok(value) = HeaderValue::from_str(&etags.join(", ")) {
            request.headers.insert(header::IF_NONE_MATCH, value);
        }
    }

    let mut has_last_modified = false;
    if !last_modified.is_empty() && original_if_modified_since.is_none() {
        let newest = last_modified
            .iter()
            .filter_map(|value| {
                httpdate::parse_http_date(value)
                    .ok()
                    .map(|time| (time, value))
            })
            .max_by_key(|(time, _)| *time)
            .map(|(_, value)| value.clone());
        if let Some(newest) = newest {
            if let Ok(value) = HeaderValue::from_str(&newest) {
                request.headers.insert(header::IF_MODIFIED_SINCE, value);
                has_last_modified = true;
            }
        }
    }

    let was_conditional =
        !original_if_none_match.is_empty() || original_if_modified_since.is_some();
    (has_etags || has_last_modified, was_conditional)
}

/// Matches a 304 to a stored descriptor: weak ETag comparison first, then
/// byte-equal `Last-Modified`.
fn find_validator_match(headers: &HeaderMap, responses: &CachedResponses) -> Option<usize> {
    if let Some(etag) = header_str(headers, &header::ETAG) {
        if let Some(index) = responses.iter().position(|response| {
            header_str(&response.headers, &header::ETAG)
                .is_some_and(|stored| etags_match(etag, stored))
        }) {
            trace!(etag, "conditional request matched by Etag");
            return Some(index);
        }
    }

    if let Some(last_modified) = header_str(headers, &header::LAST_MODIFIED) {
        if let Some(index) = responses.iter().position(|response| {
            header_str(&response.headers, &header::LAST_MODIFIED) == Some(last_modified)
        }) {
            trace!(last_modified, "conditional request matched by Last-Modified");
            return Some(index);
        }
    }

    None
}

/// Replaces the stored copies of every header the 304 carried, except
/// `Content-Length`: the stored one describes the body we re-serve.
fn merge_refreshed_headers(target: &mut CachedResponse, refreshed: &HeaderMap) {
    for name in refreshed.keys() {
        if *name == header::CONTENT_LENGTH {
            continue;
        }
        target.headers.remove(name);
        for value in refreshed.get_all(name) {
            target.headers.append(name.clone(), value.clone());
        }
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &header::HeaderName) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}
