//! Version comparison for heterogeneous upstream version strings.
//!
//! App versions in the wild range from clean semver to dotted build strings
//! ("2024.10.3", "1.1.3363,abcdef") to pre-release tags ("2.0-rc.1").
//! Strict semver is tried first; everything else goes through a
//! numeric-aware dotted comparison where missing trailing segments count as
//! zero and a pre-release suffix ranks below the same base version.

use std::cmp::Ordering;

/// Returns true when `available` is strictly newer than `current`.
pub fn is_newer(current: &str, available: &str) -> bool {
    compare(current, available) == Ordering::Less
}

/// Total order over version strings.
pub fn compare(a: &str, b: &str) -> Ordering {
    let a = a.trim();
    let b = b.trim();

    if let (Ok(va), Ok(vb)) = (semver::Version::parse(a), semver::Version::parse(b)) {
        return va.cmp(&vb);
    }

    let (base_a, pre_a) = split_pre_release(a);
    let (base_b, pre_b) = split_pre_release(b);

    match compare_segments(base_a, base_b) {
        Ordering::Equal => {}
        other => return other,
    }

    match (pre_a, pre_b) {
        (None, None) => Ordering::Equal,
        // A pre-release ranks below the same base without a suffix.
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (Some(pa), Some(pb)) => compare_segments(pa, pb),
    }
}

/// Splits "2.0-rc.1" into ("2.0", Some("rc.1")). A '-' only counts as a
/// pre-release separator when followed by a non-digit, so date-like strings
/// such as "2024-10-03" stay intact.
fn split_pre_release(v: &str) -> (&str, Option<&str>) {
    if let Some(idx) = v.find('-') {
        let suffix = &v[idx + 1..];
        if suffix.chars().next().map_or(false, |c| !c.is_ascii_digit()) {
            return (&v[..idx], Some(suffix));
        }
    }
    (v, None)
}

fn compare_segments(a: &str, b: &str) -> Ordering {
    let seg_a: Vec<&str> = a.split('.').collect();
    let seg_b: Vec<&str> = b.split('.').collect();

    let max_len = seg_a.len().max(seg_b.len());
    for i in 0..max_len {
        let sa = seg_a.get(i).copied().unwrap_or("0");
        let sb = seg_b.get(i).copied().unwrap_or("0");

        let ord = match (sa.parse::<u64>(), sb.parse::<u64>()) {
            (Ok(na), Ok(nb)) => na.cmp(&nb),
            _ => sa.cmp(sb),
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }

    Ordering::Equal
}

/// Homebrew version strings may carry a build token after a comma
/// ("1.1.3363,9a458f20"). Only the leading part is comparable.
pub fn strip_brew_token(version: &str) -> &str {
    version.split(',').next().unwrap_or(version)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reflexive() {
        for v in ["1.0", "2.3.4", "1.0-alpha", "2024.10.3"] {
            assert_eq!(compare(v, v), Ordering::Equal);
        }
    }

    #[test]
    fn antisymmetric() {
        assert_eq!(compare("1.2", "1.3"), Ordering::Less);
        assert_eq!(compare("1.3", "1.2"), Ordering::Greater);
    }

    #[test]
    fn transitive() {
        assert_eq!(compare("1.0", "1.5"), Ordering::Less);
        assert_eq!(compare("1.5", "2.0"), Ordering::Less);
        assert_eq!(compare("1.0", "2.0"), Ordering::Less);
    }

    #[test]
    fn missing_trailing_segments_are_zero() {
        assert_eq!(compare("1.2", "1.2.0"), Ordering::Equal);
        assert_eq!(compare("5", "5.0.0"), Ordering::Equal);
        assert_eq!(compare("1.0", "1.0.1"), Ordering::Less);
    }

    #[test]
    fn numeric_segments_beat_lexicographic() {
        assert_eq!(compare("1.10", "1.9"), Ordering::Greater);
        assert_eq!(compare("17.2", "17.3"), Ordering::Less);
    }

    #[test]
    fn pre_release_ranks_below_release() {
        assert_eq!(compare("2.0-rc.1", "2.0"), Ordering::Less);
        assert_eq!(compare("2.0", "2.0-rc.1"), Ordering::Greater);
        assert_eq!(compare("1.5.0-beta.2", "1.5.0"), Ordering::Less);
    }

    #[test]
    fn pre_release_suffixes_compare_lexicographically() {
        assert_eq!(compare("1.0-alpha", "1.0-beta"), Ordering::Less);
        assert_eq!(compare("1.0-beta.1", "1.0-beta.2"), Ordering::Less);
        assert_eq!(compare("1.0-rc.2", "1.0-rc.10"), Ordering::Less);
    }

    #[test]
    fn date_style_versions_are_not_pre_releases() {
        assert_eq!(compare("2024.9.0", "2024.10.3"), Ordering::Less);
        assert!(is_newer("2024.9.0", "2024.10.3"));
    }

    #[test]
    fn is_newer_discards_equal_and_older() {
        assert!(!is_newer("1.2.0", "1.2"));
        assert!(!is_newer("2.0", "1.9"));
        assert!(is_newer("1.5.0", "1.5.2"));
    }

    #[test]
    fn brew_token_stripping() {
        assert_eq!(strip_brew_token("1.1.3363,9a458f20"), "1.1.3363");
        assert_eq!(strip_brew_token("4.2.0"), "4.2.0");
    }

    #[test]
    fn semver_fast_path() {
        assert_eq!(compare("1.2.3", "1.2.4"), Ordering::Less);
        assert_eq!(compare("2.0.0-rc.1", "2.0.0"), Ordering::Less);
    }
}
