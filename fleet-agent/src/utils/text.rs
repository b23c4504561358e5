//! Byte-bounded string helpers.

/// Longest prefix of `s` that fits in `max_bytes` without splitting a character.
pub fn truncate_utf8(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Same as [`truncate_utf8`] but in place.
pub fn truncate_utf8_in_place(s: &mut String, max_bytes: usize) {
    let keep = truncate_utf8(s, max_bytes).len();
    s.truncate(keep);
}

/// Last `max_bytes` of `s`, starting on a character boundary.
pub fn tail_utf8(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut start = s.len() - max_bytes;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    &s[start..]
}
