/// Weak entity-tag comparison per RFC 9110 section 8.8.3.2: two tags match
/// when their opaque parts are byte-equal, ignoring a `W/` prefix on either
/// side.
pub fn etags_match(first: &str, second: &str) -> bool {
    fn opaque(tag: &str) -> &str {
        tag.strip_prefix("W/").unwrap_or(tag)
    }
    opaque(first) == opaque(second)
}
