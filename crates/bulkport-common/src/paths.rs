//! Hierarchical resource paths
//!
//! Locks and storage keys address folders and files by path. Every caller
//! must agree on one spelling of a path, so raw input goes through
//! [`ResourcePath::parse`] which produces the canonical form:
//!
//! - always starts with `/`, never ends with `/` (except the root itself)
//! - backslashes become `/`, repeated separators collapse, `.` segments vanish
//! - `..` segments and control characters are rejected
//!
//! Path sets are reduced with [`collapse`]: if `P` is an ancestor of `Q`
//! only `P` survives, and the survivors are ordered by depth then
//! lexicographically. Acquiring locks in that order everywhere rules out
//! circular waits.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{CommonError, Result};

/// Maximum accepted length of a canonical path in bytes
pub const MAX_PATH_LEN: usize = 1024;

/// A canonical, absolute, `/`-separated resource path
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ResourcePath(String);

impl ResourcePath {
    /// The root path `/`
    pub fn root() -> Self {
        ResourcePath("/".to_string())
    }

    /// Normalize raw input into its canonical form
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(CommonError::invalid_path(raw, "path is empty"));
        }
        if trimmed.chars().any(char::is_control) {
            return Err(CommonError::invalid_path(raw, "path contains control characters"));
        }

        let unified = trimmed.replace('\\', "/");
        let mut segments = Vec::new();
        for segment in unified.split('/') {
            match segment.trim() {
                "" | "." => continue,
                ".." => {
                    return Err(CommonError::invalid_path(
                        raw,
                        "parent segments ('..') are not allowed",
                    ))
                },
                s => segments.push(s),
            }
        }

        let canonical = format!("/{}", segments.join("/"));
        if canonical.len() > MAX_PATH_LEN {
            return Err(CommonError::invalid_path(
                raw,
                format!("path exceeds {} bytes", MAX_PATH_LEN),
            ));
        }

        Ok(ResourcePath(canonical))
    }

    /// Build a path from individual segments, normalizing each one
    pub fn from_segments<I, S>(segments: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let joined = segments
            .into_iter()
            .map(|s| s.as_ref().to_string())
            .collect::<Vec<_>>()
            .join("/");
        Self::parse(&format!("/{}", joined))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0 == "/"
    }

    /// Number of segments; the root has depth 0
    pub fn depth(&self) -> usize {
        if self.is_root() {
            0
        } else {
            self.0.matches('/').count()
        }
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('/').filter(|s| !s.is_empty())
    }

    /// Last segment, `None` for the root
    pub fn name(&self) -> Option<&str> {
        self.segments().last()
    }

    /// Parent path, `None` for the root
    pub fn parent(&self) -> Option<ResourcePath> {
        if self.is_root() {
            return None;
        }
        match self.0.rfind('/') {
            Some(0) => Some(Self::root()),
            Some(idx) => Some(ResourcePath(self.0[..idx].to_string())),
            None => None,
        }
    }

    /// All strict ancestors, nearest first, ending with the root
    pub fn ancestors(&self) -> Vec<ResourcePath> {
        let mut out = Vec::with_capacity(self.depth());
        let mut current = self.parent();
        while let Some(path) = current {
            current = path.parent();
            out.push(path);
        }
        out
    }

    /// True when `self` is a strict ancestor of `other`
    pub fn is_ancestor_of(&self, other: &ResourcePath) -> bool {
        if self.0.len() >= other.0.len() {
            return false;
        }
        if self.is_root() {
            return true;
        }
        other.0.starts_with(&self.0) && other.0.as_bytes()[self.0.len()] == b'/'
    }

    /// True when the two paths are equal or one contains the other
    pub fn overlaps(&self, other: &ResourcePath) -> bool {
        self == other || self.is_ancestor_of(other) || other.is_ancestor_of(self)
    }

    /// Append a child segment
    pub fn join(&self, child: &str) -> Result<ResourcePath> {
        Self::parse(&format!("{}/{}", self.0, child))
    }

    /// Object-storage key form: the canonical path without its leading `/`
    pub fn to_key(&self) -> String {
        self.0.trim_start_matches('/').to_string()
    }
}

impl fmt::Display for ResourcePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for ResourcePath {
    type Error = CommonError;

    fn try_from(value: String) -> Result<Self> {
        ResourcePath::parse(&value)
    }
}

impl From<ResourcePath> for String {
    fn from(path: ResourcePath) -> Self {
        path.0
    }
}

impl std::str::FromStr for ResourcePath {
    type Err = CommonError;

    fn from_str(s: &str) -> Result<Self> {
        ResourcePath::parse(s)
    }
}

/// Total order used for multi-path acquisition: depth first, then bytes
pub fn acquisition_order(a: &ResourcePath, b: &ResourcePath) -> std::cmp::Ordering {
    a.depth().cmp(&b.depth()).then_with(|| a.0.cmp(&b.0))
}

/// Reduce a path set to its minimal covering set in acquisition order
///
/// Duplicates are removed and any path with an ancestor in the set is
/// dropped. The result is identical for every permutation of the input.
pub fn collapse<I>(paths: I) -> Vec<ResourcePath>
where
    I: IntoIterator<Item = ResourcePath>,
{
    let mut sorted: Vec<ResourcePath> = paths.into_iter().collect();
    sorted.sort_by(acquisition_order);
    sorted.dedup();

    // Shallower paths come first, so every potential ancestor of a path
    // has already been kept or dropped by the time the path is seen.
    let mut kept: Vec<ResourcePath> = Vec::with_capacity(sorted.len());
    for path in sorted {
        if !kept.iter().any(|k| k.is_ancestor_of(&path)) {
            kept.push(path);
        }
    }
    kept
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn p(raw: &str) -> ResourcePath {
        ResourcePath::parse(raw).unwrap()
    }

    #[test]
    fn test_parse_normalizes_separators() {
        assert_eq!(p("companies//acme/./media/").as_str(), "/companies/acme/media");
        assert_eq!(p(r"\companies\acme").as_str(), "/companies/acme");
        assert_eq!(p("  /a/b  ").as_str(), "/a/b");
        assert_eq!(p("/").as_str(), "/");
        assert_eq!(p("///").as_str(), "/");
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(ResourcePath::parse("").is_err());
        assert!(ResourcePath::parse("   ").is_err());
        assert!(ResourcePath::parse("/a/../b").is_err());
        assert!(ResourcePath::parse("/a/\u{0}b").is_err());
        assert!(ResourcePath::parse(&"x/".repeat(600)).is_err());
    }

    #[test]
    fn test_depth_parent_and_ancestors() {
        let path = p("/a/b/c");
        assert_eq!(path.depth(), 3);
        assert_eq!(path.parent(), Some(p("/a/b")));
        assert_eq!(path.name(), Some("c"));
        assert_eq!(path.ancestors(), vec![p("/a/b"), p("/a"), ResourcePath::root()]);
        assert_eq!(ResourcePath::root().depth(), 0);
        assert_eq!(ResourcePath::root().parent(), None);
        assert_eq!(p("/a").parent(), Some(ResourcePath::root()));
    }

    #[test]
    fn test_ancestry_respects_segment_boundaries() {
        assert!(p("/a").is_ancestor_of(&p("/a/b")));
        assert!(!p("/a").is_ancestor_of(&p("/ab")));
        assert!(!p("/a").is_ancestor_of(&p("/a")));
        assert!(ResourcePath::root().is_ancestor_of(&p("/x")));
        assert!(p("/a/b").overlaps(&p("/a")));
        assert!(!p("/a/b").overlaps(&p("/a/c")));
    }

    #[test]
    fn test_collapse_keeps_ancestors_only() {
        let collapsed = collapse(vec![p("/b/c"), p("/a/x"), p("/a"), p("/b"), p("/a")]);
        assert_eq!(collapsed, vec![p("/a"), p("/b")]);
    }

    #[test]
    fn test_collapse_orders_by_depth_then_name() {
        let collapsed = collapse(vec![p("/z"), p("/a/b/c"), p("/m/n"), p("/b")]);
        assert_eq!(collapsed, vec![p("/b"), p("/z"), p("/m/n"), p("/a/b/c")]);
    }

    #[test]
    fn test_to_key_and_join() {
        assert_eq!(p("/companies/acme").join("logo.png").unwrap().to_key(), "companies/acme/logo.png");
        assert_eq!(
            ResourcePath::from_segments(["companies", "acme", "catalog"]).unwrap(),
            p("/companies/acme/catalog")
        );
    }

    #[test]
    fn test_serde_round_trip_normalizes() {
        let path: ResourcePath = serde_json::from_str("\"a//b/\"").unwrap();
        assert_eq!(path.as_str(), "/a/b");
        assert_eq!(serde_json::to_string(&path).unwrap(), "\"/a/b\"");
    }

    proptest! {
        #[test]
        fn prop_collapse_is_order_independent(
            raw in proptest::collection::vec("(/[a-c]){1,4}", 1..8),
            seed in any::<u64>(),
        ) {
            let paths: Vec<ResourcePath> = raw.iter().map(|r| p(r)).collect();
            let mut shuffled = paths.clone();
            // Deterministic rotation stands in for a shuffle.
            let len = shuffled.len();
            shuffled.rotate_left((seed as usize) % len);
            shuffled.reverse();

            prop_assert_eq!(collapse(paths.clone()), collapse(shuffled));
        }

        #[test]
        fn prop_collapsed_paths_never_overlap(
            raw in proptest::collection::vec("(/[a-c]){1,4}", 1..8),
        ) {
            let collapsed = collapse(raw.iter().map(|r| p(r)));
            for (i, a) in collapsed.iter().enumerate() {
                for b in collapsed.iter().skip(i + 1) {
                    prop_assert!(!a.overlaps(b));
                }
            }
        }
    }
}
