//! Version algebra (§4.A). Grounded in `original_source/versions.py`.

use regex::Regex;
use std::sync::LazyLock;

static PRERELEASE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(?:alpha|beta|rc|dev|pre)").unwrap());

static SPLIT_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[.\-_]").unwrap());

/// Strip a leading `v` or `version_` (case-insensitive) and trim.
pub fn normalize_version(v: &str) -> String {
    let trimmed = v.trim();
    let lower = trimmed.to_lowercase();
    if lower.starts_with("version_") {
        return trimmed["version_".len()..].to_string();
    }
    if lower.starts_with('v') {
        return trimmed["v".len()..].to_string();
    }
    trimmed.to_string()
}

/// Ordering key: split the normalized string on `. - _`, convert each part to
/// an integer (non-integer parts become 0), compare lexicographically.
pub fn version_key(v: &str) -> Vec<i64> {
    let normalized = normalize_version(v);
    SPLIT_RE
        .split(&normalized)
        .map(|part| part.parse::<i64>().unwrap_or(0))
        .collect()
}

pub fn is_prerelease(v: &str) -> bool {
    PRERELEASE_RE.is_match(v)
}

/// A version is mutable if, after normalization, it is one of `main`,
/// `master`, `develop`, `dev`, or begins with `nightly`.
pub fn is_mutable(v: &str) -> bool {
    let normalized = normalize_version(v).to_lowercase();
    matches!(normalized.as_str(), "main" | "master" | "develop" | "dev") || normalized.starts_with("nightly")
}

/// Stable total-order sort by `version_key`.
pub fn sort_versions(versions: &mut [String]) {
    versions.sort_by(|a, b| version_key(a).cmp(&version_key(b)));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_prefixes() {
        assert_eq!(normalize_version("v1.2.3"), "1.2.3");
        assert_eq!(normalize_version("version_1.2.3"), "1.2.3");
        assert_eq!(normalize_version("V02.05.00.66"), "02.05.00.66");
        assert_eq!(normalize_version("main"), "main");
    }

    #[test]
    fn orders_numerically_not_lexically() {
        assert!(version_key("2.9.0") < version_key("2.10.0"));
        assert!(version_key("v1.0.0") < version_key("v1.0.1"));
    }

    #[test]
    fn non_numeric_segments_become_zero() {
        assert_eq!(version_key("1.x.0"), vec![1, 0, 0]);
    }

    #[test]
    fn total_order_property() {
        let versions = vec!["2.0.0".to_string(), "1.9.0".to_string(), "1.10.0".to_string()];
        let mut sorted = versions.clone();
        sort_versions(&mut sorted);
        assert_eq!(sorted, vec!["1.9.0", "1.10.0", "2.0.0"]);
        for a in &versions {
            for b in &versions {
                let (ka, kb) = (version_key(a), version_key(b));
                let lt = ka < kb;
                let eq = ka == kb;
                let gt = ka > kb;
                assert_eq!([lt, eq, gt].iter().filter(|x| **x).count(), 1);
            }
        }
    }

    #[test]
    fn mutability_rules() {
        assert!(is_mutable("main"));
        assert!(is_mutable("master"));
        assert!(is_mutable("nightly-2024-01-01"));
        assert!(!is_mutable("v2.4.0"));
    }

    #[test]
    fn prerelease_detection() {
        assert!(is_prerelease("2.5.0-beta.1"));
        assert!(is_prerelease("2.5.0-RC1"));
        assert!(!is_prerelease("2.5.0"));
    }
}
