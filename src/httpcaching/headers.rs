use http::HeaderMap;

/// Hop-by-hop and proxy-specific fields per RFC 9111 section 3.1: the
/// Connection family must be removed before forwarding, and the Proxy-*
/// authentication fields must never be stored because the cache key does
/// not incorporate the proxy identity.
const HOP_BY_HOP_HEADERS: [&str; 10] = [
    "connection",
    "proxy-connection",
    "keep-alive",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "proxy-authenticate",
    "proxy-authentication-info",
    "proxy-authorization",
];

/// Strips hop-by-hop fields in place. Applied to requests before forwarding
/// and to responses before storage and before returning them to the caller.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(name);
    }
}
