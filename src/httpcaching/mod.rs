//! RFC 9111 building blocks: `Cache-Control` parsing, freshness and age
//! arithmetic, `Vary` negotiation, validator comparison, and hop-by-hop
//! header stripping.

mod cache_control;
mod etag;
mod freshness;
mod headers;
mod vary;

pub use cache_control::{CacheControl, CacheControlError, is_storable};
pub use etag::etags_match;
pub use freshness::{current_age, freshness_lifetime, is_fresh, response_creation_time};
pub use headers::strip_hop_by_hop;
pub use vary::VaryMap;
