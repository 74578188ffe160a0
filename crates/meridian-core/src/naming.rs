//! Deterministic names built from several parts.
//!
//! Parts are joined with `-`. When the join could be ambiguous (a variable
//! part contains `-`) or too long, a truncated prefix is suffixed with a hash
//! of the parts so distinct inputs keep distinct names.

use sha2::{Digest, Sha256};

/// Limit for label values and namespaces.
pub const SHORT: usize = 63;
/// Limit for most other names.
pub const LONG: usize = 253;

const HASH_LEN: usize = 10;

/// Join `parts` into a name of at most `limit` bytes.
///
/// `constant` lists the indices of parts that never vary (their dashes are not
/// ambiguous); `optional` lists parts that may be empty.
pub fn from_parts(limit: usize, constant: &[usize], optional: &[usize], parts: &[&str]) -> String {
    let variable_parts = parts.len().saturating_sub(constant.len());
    let mut hash_required = false;
    let mut non_empty = Vec::with_capacity(parts.len());
    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() {
            if optional.len() > 1 {
                hash_required = true;
            }
            continue;
        }
        non_empty.push(*part);
        if part.contains('-') && !constant.contains(&i) && variable_parts > 1 {
            hash_required = true;
        }
    }

    let joined = non_empty.join("-");
    if !hash_required && joined.len() <= limit {
        return joined;
    }
    // `/` cannot appear in a part, so this key is unique per input.
    let key = parts.join("/");
    append_hash(limit, &key, &joined)
}

/// `base` suffixed with a hash of `key`, at most `limit` bytes.
pub fn suffixed(limit: usize, base: &str, key: &str) -> String {
    append_hash(limit, key, base)
}

fn append_hash(limit: usize, key: &str, s: &str) -> String {
    let prefix = truncate(limit.saturating_sub(HASH_LEN + 1), s);
    let digest = hex::encode(Sha256::digest(key.as_bytes()));
    format!("{prefix}-{}", &digest[..HASH_LEN])
}

fn truncate(limit: usize, s: &str) -> &str {
    let mut end = s.len().min(limit);
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].trim_end_matches('-')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_names_are_joined() {
        assert_eq!(from_parts(LONG, &[0], &[], &["meridian", "c1"]), "meridian-c1");
    }

    #[test]
    fn ambiguous_dashes_get_a_hash() {
        let a = from_parts(SHORT, &[], &[], &["a-b", "c"]);
        let b = from_parts(SHORT, &[], &[], &["a", "b-c"]);
        assert_ne!(a, b);
        assert!(a.starts_with("a-b-c-"));
        assert_eq!(a.len(), "a-b-c-".len() + 10);
    }

    #[test]
    fn constant_parts_may_contain_dashes() {
        assert_eq!(
            from_parts(LONG, &[0], &[], &["meridian-proxy", "c1"]),
            "meridian-proxy-c1"
        );
    }

    #[test]
    fn long_names_are_truncated() {
        let long = "x".repeat(100);
        let name = from_parts(SHORT, &[0], &[], &["meridian", &long]);
        assert_eq!(name.len(), SHORT);
        assert!(name.starts_with("meridian-xxx"));
    }

    #[test]
    fn suffix_depends_on_key() {
        let a = suffixed(LONG, "pod1", "uid-1");
        assert!(a.starts_with("pod1-"));
        assert_eq!(a.len(), "pod1-".len() + 10);
        assert_ne!(a, suffixed(LONG, "pod1", "uid-2"));
    }

    #[test]
    fn truncation_drops_trailing_dashes() {
        assert_eq!(truncate(3, "ab-cd"), "ab");
    }
}
