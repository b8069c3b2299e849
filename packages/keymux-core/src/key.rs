//! Key normalization and filtering utilities.
//!
//! Keys are colon-separated sequences of non-empty segments
//! (`users:42:profile`). Slashes in input are coerced to colons so both
//! path-style and colon-style callers resolve to the same entry. A *base
//! key* carries a trailing colon and names a subtree root; the empty base
//! names the root itself.

/// Suffix reserving a key for metadata; such keys are excluded from
/// enumeration.
pub const META_KEY_SUFFIX: char = '$';

/// Normalizes a key to canonical colon form.
///
/// Strips any `?`-suffixed query portion, coerces `/` and `\` to `:`,
/// collapses separator runs, and trims leading/trailing separators.
/// Idempotent: `normalize_key(normalize_key(k)) == normalize_key(k)`.
#[must_use]
pub fn normalize_key(key: &str) -> String {
    let without_query = match key.find('?') {
        Some(idx) => &key[..idx],
        None => key,
    };

    let mut out = String::with_capacity(without_query.len());
    for ch in without_query.chars() {
        if ch == '/' || ch == '\\' || ch == ':' {
            if !out.is_empty() && !out.ends_with(':') {
                out.push(':');
            }
        } else {
            out.push(ch);
        }
    }
    if out.ends_with(':') {
        out.pop();
    }
    out
}

/// Normalizes a base key: empty stays empty, anything else gains exactly
/// one trailing colon.
#[must_use]
pub fn normalize_base_key(base: &str) -> String {
    let normalized = normalize_key(base);
    if normalized.is_empty() {
        normalized
    } else {
        format!("{normalized}:")
    }
}

/// Joins key fragments with `:` and normalizes the result.
#[must_use]
pub fn join_keys(keys: &[&str]) -> String {
    normalize_key(&keys.join(":"))
}

/// Number of separator levels in a key (`a` is 0, `a:b` is 1).
#[must_use]
pub fn key_depth(key: &str) -> usize {
    key.chars().filter(|c| *c == ':').count()
}

/// Whether `key` survives a `max_depth` filter.
#[must_use]
pub fn filter_key_by_depth(key: &str, max_depth: Option<usize>) -> bool {
    match max_depth {
        Some(depth) => key_depth(key) <= depth,
        None => true,
    }
}

/// Whether `key` belongs under `base` and is not metadata-reserved.
#[must_use]
pub fn filter_key_by_base(key: &str, base: &str) -> bool {
    key.starts_with(base) && !key.ends_with(META_KEY_SUFFIX)
}

/// Whether a normalized key contains a path-traversal sequence.
///
/// Catches `..` appearing as a full segment (`..:etc` or a trailing `..`)
/// while still permitting `..` embedded inside a legitimate segment such
/// as `te..st..js`.
#[must_use]
pub fn has_traversal(key: &str) -> bool {
    key.contains("..:") || key.ends_with("..")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_coerces_slashes() {
        assert_eq!(normalize_key("users/42/profile"), "users:42:profile");
        assert_eq!(normalize_key("users\\42\\profile"), "users:42:profile");
    }

    #[test]
    fn normalize_collapses_runs_and_trims() {
        assert_eq!(normalize_key(":a::b:"), "a:b");
        assert_eq!(normalize_key("//a//b//"), "a:b");
        assert_eq!(normalize_key("a:/b"), "a:b");
    }

    #[test]
    fn normalize_strips_query_portion() {
        assert_eq!(normalize_key("a:b?cache=false"), "a:b");
        assert_eq!(normalize_key("?x"), "");
    }

    #[test]
    fn normalize_is_idempotent() {
        for raw in ["/a//b\\c:", "x?q", ":::", "plain", "a/b:c\\d"] {
            let once = normalize_key(raw);
            assert_eq!(normalize_key(&once), once, "not idempotent for {raw:?}");
        }
    }

    #[test]
    fn base_key_forms() {
        assert_eq!(normalize_base_key(""), "");
        assert_eq!(normalize_base_key("mnt"), "mnt:");
        assert_eq!(normalize_base_key("mnt:"), "mnt:");
        assert_eq!(normalize_base_key("a/b/"), "a:b:");
    }

    #[test]
    fn join_keys_normalizes() {
        assert_eq!(join_keys(&["a", "b:c"]), "a:b:c");
        assert_eq!(join_keys(&["mnt:", "x"]), "mnt:x");
        assert_eq!(join_keys(&["", "x"]), "x");
    }

    #[test]
    fn depth_counting() {
        assert_eq!(key_depth("a"), 0);
        assert_eq!(key_depth("a:b"), 1);
        assert_eq!(key_depth("a:b:c:d"), 3);
    }

    #[test]
    fn depth_filter_matches_enumeration_contract() {
        // Keys a, a:b, a:b:c, a:b:c:d with max_depth=1 keep exactly a and a:b.
        let keys = ["a", "a:b", "a:b:c", "a:b:c:d"];
        let kept: Vec<&str> = keys
            .iter()
            .copied()
            .filter(|k| filter_key_by_depth(k, Some(1)))
            .collect();
        assert_eq!(kept, vec!["a", "a:b"]);
    }

    #[test]
    fn base_filter_excludes_meta_keys() {
        assert!(filter_key_by_base("cfg:port", "cfg:"));
        assert!(!filter_key_by_base("cfg:port", "users:"));
        assert!(!filter_key_by_base("cfg:port$", "cfg:"));
    }

    #[test]
    fn traversal_detection() {
        assert!(has_traversal("..:etc:passwd"));
        assert!(has_traversal("a:..:b"));
        assert!(has_traversal("a:.."));
        assert!(has_traversal(".."));
        assert!(!has_traversal("s1:te..st..js"));
        assert!(!has_traversal("normal:key"));
        assert!(!has_traversal("dots..inside:file"));
    }
}
