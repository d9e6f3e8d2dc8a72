use url::Url;

use super::Request;

/// Peer caches consulted, in order, before the origin.
///
/// In rewrite mode the request is re-addressed at the peer: its scheme and
/// authority are replaced and the peer's path is prepended. In proxy mode
/// the request URL is untouched and the peer acts as the HTTP proxy for the
/// attempt.
#[derive(Debug, Clone, Default)]
pub struct UpstreamCaches {
    pub uris: Vec<Url>,
    pub proxy: bool,
}

impl UpstreamCaches {
    /// No peers: every request goes straight to the origin.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn rewrite(uris: Vec<Url>) -> Self {
        Self { uris, proxy: false }
    }

    pub fn proxy(uris: Vec<Url>) -> Self {
        Self { uris, proxy: true }
    }
}

/// Re-addresses a request at an upstream cache: scheme and authority come
/// from the upstream, and the upstream's path is prepended to the request
/// path.
pub(super) fn rewrite_request(request: &Request, upstream: &Url) -> Request {
    let mut rewritten = request.clone();

    let _ = rewritten.url.set_scheme(upstream.scheme());
    let _ = rewritten.url.set_host(upstream.host_str());
    let _ = rewritten.url.set_port(upstream.port());

    let prefix = match upstream.path() {
        "/" => "",
        path => path,
    };
    if !prefix.is_empty() {
        let path = format!("{}{}", prefix, request.url.path());
        rewritten.url.set_path(&path);
    }

    rewritten
}
