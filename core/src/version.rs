//! Tag classification and ordering.
//!
//! A tag string is mapped onto a [`Version`] whose *distinction* names the
//! equivalence class it belongs to (`"majorMinorPatch-alpine"`,
//! `"static-latest"`, ...). Tags are only ever ordered against tags of the
//! same distinction; everything else is [`SpyError::Incomparable`].
//!
//! Recognizers are tried in a fixed priority order and the first one that
//! accepts wins:
//!
//! | Kind              | Example            | Distinction              |
//! |-------------------|--------------------|--------------------------|
//! | Major             | `v2`, `3-alpine`   | `major`, `major-alpine`  |
//! | MajorMinor        | `1.2`              | `majorMinor`             |
//! | MajorMinorPatch   | `v1.2.3-alpine`    | `majorMinorPatch-alpine` |
//! | NameDate          | `ubuntu-20180913`  | `nameDate-ubuntu`        |
//! | Static            | `latest`, `stable` | `static-latest`          |
//! | Unknown           | anything else      | `unknown-<tag>`          |

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;

use crate::error::{Result, SpyError};

/// Rolling aliases that carry no version ordering.
pub const STATIC_TAGS: [&str; 4] = ["latest", "mainline", "master", "stable"];

/// A classified tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    raw: String,
    kind: VersionKind,
}

/// Concrete version shape recognized from a tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionKind {
    Major {
        major: u64,
        suffix: Option<String>,
    },
    MajorMinor {
        major: u64,
        minor: u64,
        suffix: Option<String>,
    },
    MajorMinorPatch {
        major: u64,
        minor: u64,
        patch: u64,
        suffix: Option<String>,
    },
    NameDate {
        name: String,
        date: u32,
    },
    Static,
    Unknown,
}

impl VersionKind {
    fn label(&self) -> &'static str {
        match self {
            VersionKind::Major { .. } => "major",
            VersionKind::MajorMinor { .. } => "majorMinor",
            VersionKind::MajorMinorPatch { .. } => "majorMinorPatch",
            VersionKind::NameDate { .. } => "nameDate",
            VersionKind::Static => "static",
            VersionKind::Unknown => "unknown",
        }
    }
}

impl Version {
    /// The equivalence-class key of this tag.
    pub fn distinction(&self) -> String {
        let label = self.kind.label();
        match &self.kind {
            VersionKind::Major { suffix, .. }
            | VersionKind::MajorMinor { suffix, .. }
            | VersionKind::MajorMinorPatch { suffix, .. } => match suffix {
                Some(suffix) => format!("{}-{}", label, suffix),
                None => label.to_string(),
            },
            VersionKind::NameDate { name, .. } => format!("{}-{}", label, name),
            VersionKind::Static | VersionKind::Unknown => format!("{}-{}", label, self.raw),
        }
    }

    /// Strict ordering within one distinction.
    ///
    /// Fails with `Incomparable` when the kinds or distinctions differ.
    /// Static and Unknown tags are never greater than each other.
    pub fn is_greater_than(&self, other: &Version) -> Result<bool> {
        if self.distinction() != other.distinction() {
            return Err(self.incomparable(other));
        }

        match (&self.kind, &other.kind) {
            (VersionKind::Major { major: a, .. }, VersionKind::Major { major: b, .. }) => Ok(a > b),
            (
                VersionKind::MajorMinor {
                    major: a1,
                    minor: a2,
                    ..
                },
                VersionKind::MajorMinor {
                    major: b1,
                    minor: b2,
                    ..
                },
            ) => Ok((a1, a2) > (b1, b2)),
            (
                VersionKind::MajorMinorPatch {
                    major: a1,
                    minor: a2,
                    patch: a3,
                    ..
                },
                VersionKind::MajorMinorPatch {
                    major: b1,
                    minor: b2,
                    patch: b3,
                    ..
                },
            ) => Ok((a1, a2, a3) > (b1, b2, b3)),
            (VersionKind::NameDate { date: a, .. }, VersionKind::NameDate { date: b, .. }) => {
                Ok(a > b)
            }
            (VersionKind::Static, VersionKind::Static) => Ok(false),
            (VersionKind::Unknown, VersionKind::Unknown) => Ok(false),
            _ => Err(self.incomparable(other)),
        }
    }

    /// The original tag string.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn kind(&self) -> &VersionKind {
        &self.kind
    }

    fn incomparable(&self, other: &Version) -> SpyError {
        SpyError::Incomparable {
            left: self.raw.clone(),
            right: other.raw.clone(),
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// A recognizer either accepts a tag or passes.
pub type Recognizer = fn(&str) -> Option<VersionKind>;

/// Ordered set of recognizers; `Unknown` is the implicit fallback.
#[derive(Clone)]
pub struct VersionResolver {
    recognizers: Vec<Recognizer>,
}

impl VersionResolver {
    pub fn new() -> Self {
        Self {
            recognizers: vec![
                recognize_major,
                recognize_major_minor,
                recognize_major_minor_patch,
                recognize_name_date,
                recognize_static,
            ],
        }
    }

    /// Classify a tag with the first recognizer that accepts it.
    pub fn classify(&self, tag: &str) -> Version {
        let kind = self
            .recognizers
            .iter()
            .find_map(|recognize| recognize(tag))
            .unwrap_or(VersionKind::Unknown);

        Version {
            raw: tag.to_string(),
            kind,
        }
    }
}

impl Default for VersionResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for VersionResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VersionResolver")
            .field("recognizers", &self.recognizers.len())
            .finish()
    }
}

/// Classify a tag with the default recognizer order.
pub fn classify(tag: &str) -> Version {
    static RESOLVER: OnceLock<VersionResolver> = OnceLock::new();
    RESOLVER.get_or_init(VersionResolver::new).classify(tag)
}

fn semver_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^v?(\d+)(?:\.(\d+))?(?:\.(\d+))?(?:-(.+))?$").expect("valid semver pattern")
    })
}

fn name_date_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^(\w*)-(\d{8})$").expect("valid name-date pattern"))
}

/// Numeric components and suffix of a `v?X[.Y[.Z]][-suffix]` tag.
fn semver_parts(tag: &str) -> Option<(Vec<u64>, Option<String>)> {
    let caps = semver_pattern().captures(tag)?;
    let mut numbers = Vec::with_capacity(3);
    for group in 1..=3 {
        match caps.get(group) {
            Some(m) => numbers.push(m.as_str().parse::<u64>().ok()?),
            None => break,
        }
    }
    let suffix = caps.get(4).map(|m| m.as_str().to_string());
    Some((numbers, suffix))
}

fn recognize_major(tag: &str) -> Option<VersionKind> {
    match semver_parts(tag)? {
        (n, suffix) if n.len() == 1 => Some(VersionKind::Major {
            major: n[0],
            suffix,
        }),
        _ => None,
    }
}

fn recognize_major_minor(tag: &str) -> Option<VersionKind> {
    match semver_parts(tag)? {
        (n, suffix) if n.len() == 2 => Some(VersionKind::MajorMinor {
            major: n[0],
            minor: n[1],
            suffix,
        }),
        _ => None,
    }
}

fn recognize_major_minor_patch(tag: &str) -> Option<VersionKind> {
    match semver_parts(tag)? {
        (n, suffix) if n.len() == 3 => Some(VersionKind::MajorMinorPatch {
            major: n[0],
            minor: n[1],
            patch: n[2],
            suffix,
        }),
        _ => None,
    }
}

fn recognize_name_date(tag: &str) -> Option<VersionKind> {
    let caps = name_date_pattern().captures(tag)?;
    let date = caps[2].parse::<u32>().ok()?;
    Some(VersionKind::NameDate {
        name: caps[1].to_string(),
        date,
    })
}

fn recognize_static(tag: &str) -> Option<VersionKind> {
    STATIC_TAGS
        .contains(&tag)
        .then_some(VersionKind::Static)
}

#[cfg(test)]
mod tests {
    use super::*;

    // ========================================================================
    // Classification
    // ========================================================================

    #[test]
    fn test_distinctions() {
        let cases = [
            ("1", "major"),
            ("1-alpine", "major-alpine"),
            ("v1", "major"),
            ("v1-alpine", "major-alpine"),
            ("1.2", "majorMinor"),
            ("1.2-alpine", "majorMinor-alpine"),
            ("v1.2", "majorMinor"),
            ("v1.2-alpine", "majorMinor-alpine"),
            ("1.2.3", "majorMinorPatch"),
            ("1.2.3-alpine", "majorMinorPatch-alpine"),
            ("v1.2.3", "majorMinorPatch"),
            ("v1.2.3-alpine", "majorMinorPatch-alpine"),
            ("ubuntu-20180913", "nameDate-ubuntu"),
            ("latest", "static-latest"),
            ("mainline", "static-mainline"),
            ("master", "static-master"),
            ("stable", "static-stable"),
            ("sometag", "unknown-sometag"),
        ];

        for (tag, expected) in cases {
            let version = classify(tag);
            assert_eq!(version.distinction(), expected, "tag {}", tag);
            assert_eq!(version.to_string(), tag);
        }
    }

    #[test]
    fn test_suffix_may_contain_dashes_and_dots() {
        assert_eq!(classify("3-alpine3.8").distinction(), "major-alpine3.8");
        assert_eq!(
            classify("1.2.3-slim-buster").distinction(),
            "majorMinorPatch-slim-buster"
        );
    }

    #[test]
    fn test_four_components_are_unknown() {
        assert_eq!(classify("1.2.3.4").distinction(), "unknown-1.2.3.4");
    }

    #[test]
    fn test_overflowing_number_is_unknown() {
        let tag = "99999999999999999999999";
        assert_eq!(classify(tag).kind(), &VersionKind::Unknown);
    }

    #[test]
    fn test_name_date_requires_eight_digits() {
        assert_eq!(classify("ubuntu-2018091").distinction(), "unknown-ubuntu-2018091");
    }

    #[test]
    fn test_date_only_tag_is_major() {
        // Priority order: the major recognizer sees it first.
        assert_eq!(classify("20180913").distinction(), "major");
    }

    // ========================================================================
    // Ordering
    // ========================================================================

    #[test]
    fn test_major_ordering() {
        let one = classify("1");
        let two = classify("2");
        assert!(two.is_greater_than(&one).unwrap());
        assert!(!one.is_greater_than(&two).unwrap());
        assert_eq!(one.distinction(), two.distinction());
    }

    #[test]
    fn test_major_ordering_is_numeric() {
        assert!(classify("10").is_greater_than(&classify("9")).unwrap());
    }

    #[test]
    fn test_major_minor_ordering() {
        let first = classify("1.1");
        let second = classify("1.2");
        assert!(!first.is_greater_than(&second).unwrap());
        assert!(second.is_greater_than(&first).unwrap());
        assert!(classify("2.0").is_greater_than(&classify("1.9")).unwrap());
    }

    #[test]
    fn test_major_minor_patch_ordering() {
        let first = classify("1.2.3");
        let second = classify("1.2.4");
        assert!(!first.is_greater_than(&second).unwrap());
        assert!(second.is_greater_than(&first).unwrap());
        assert!(classify("v1.10.0").is_greater_than(&classify("1.9.9")).unwrap());
    }

    #[test]
    fn test_equal_versions_are_not_greater() {
        assert!(!classify("1.2.3").is_greater_than(&classify("v1.2.3")).unwrap());
    }

    #[test]
    fn test_name_date_ordering() {
        let old = classify("ubuntu-20180913");
        let new = classify("ubuntu-20181010");
        assert!(new.is_greater_than(&old).unwrap());
        assert!(!old.is_greater_than(&new).unwrap());
    }

    #[test]
    fn test_static_never_greater() {
        let a = classify("latest");
        let b = classify("latest");
        assert!(!a.is_greater_than(&b).unwrap());
    }

    #[test]
    fn test_unknown_never_greater() {
        let a = classify("foo");
        assert!(!a.is_greater_than(&a.clone()).unwrap());
    }

    #[test]
    fn test_cross_distinction_is_incomparable() {
        let err = classify("1").is_greater_than(&classify("1.2")).unwrap_err();
        assert!(err.is_incomparable());
    }

    #[test]
    fn test_suffix_mismatch_is_incomparable() {
        let err = classify("2-alpine").is_greater_than(&classify("1")).unwrap_err();
        assert!(err.is_incomparable());
        assert!(classify("2-alpine")
            .is_greater_than(&classify("1-alpine"))
            .unwrap());
    }

    #[test]
    fn test_different_static_aliases_are_incomparable() {
        assert!(classify("latest").is_greater_than(&classify("stable")).is_err());
    }

    #[test]
    fn test_name_date_different_names_are_incomparable() {
        assert!(classify("ubuntu-20180913")
            .is_greater_than(&classify("debian-20180913"))
            .is_err());
    }

    #[test]
    fn test_custom_resolver_matches_default() {
        let resolver = VersionResolver::default();
        assert_eq!(resolver.classify("1.2"), classify("1.2"));
    }
}
