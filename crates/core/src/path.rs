//! Keyspace paths
//!
//! A [`Path`] addresses one node of the tree-shaped keyspace. Paths are the
//! unit of locking: two lock requests interact only when their paths are on
//! the same trail (one is an ancestor of the other, or they are equal).
//!
//! # Path Syntax
//!
//! | Syntax | Meaning | Example |
//! |--------|---------|---------|
//! | `key` | Child key | `users` |
//! | `a/b` | Nested keys | `users/42` |
//! | `key[n]` | Key then array index | `items[3]` |
//! | `[n]` | Array index segment | `items/[3]` |
//! | (empty) | Root | `` |
//!
//! Leading and trailing slashes are ignored, so `/users/42/` and `users/42`
//! name the same node. The canonical text form (used for display, hashing
//! and on the wire) never carries them.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Error parsing a path string
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PathParseError {
    /// Empty segment between two slashes
    #[error("empty path segment at position {0}")]
    EmptySegment(usize),
    /// Opening bracket without a closing one
    #[error("unclosed bracket at position {0}")]
    UnclosedBracket(usize),
    /// Bracket contents are not a number
    #[error("invalid index at position {0}: {1}")]
    InvalidIndex(usize, String),
    /// Characters after a closing bracket that are not another index
    #[error("unexpected character '{0}' at position {1}")]
    UnexpectedChar(char, usize),
}

/// A segment in a path
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PathSegment {
    /// Child key
    Key(String),
    /// Array index
    Index(usize),
}

impl PathSegment {
    /// True for the `*` and `$name` wildcard keys used by subscription patterns
    pub fn is_wildcard(&self) -> bool {
        match self {
            PathSegment::Key(k) => k == "*" || k.starts_with('$'),
            PathSegment::Index(_) => false,
        }
    }
}

impl fmt::Display for PathSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathSegment::Key(k) => write!(f, "{}", k),
            PathSegment::Index(i) => write!(f, "[{}]", i),
        }
    }
}

/// A path into the keyspace tree
///
/// # Examples
///
/// ```
/// use canopy_core::Path;
///
/// let user = Path::root().child("users").child("42");
/// let parsed: Path = "/users/42/".parse().unwrap();
/// assert_eq!(user, parsed);
///
/// let name = user.clone().child("name");
/// assert!(user.is_ancestor_of(&name));
/// assert!(name.is_on_trail_of(&user));
/// assert!(!name.is_on_trail_of(&"users/43".parse().unwrap()));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct Path {
    segments: Vec<PathSegment>,
}

impl Path {
    /// The root path (no segments)
    pub fn root() -> Self {
        Path {
            segments: Vec::new(),
        }
    }

    /// Build a path from segments
    pub fn from_segments(segments: Vec<PathSegment>) -> Self {
        Path { segments }
    }

    /// Parse a path string
    pub fn parse(s: &str) -> Result<Self, PathParseError> {
        s.parse()
    }

    /// The path segments
    pub fn segments(&self) -> &[PathSegment] {
        &self.segments
    }

    /// Number of segments
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    /// Check if this is the root path
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Check if this is the root path
    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    /// Append a key segment (builder pattern)
    pub fn child(mut self, key: impl Into<String>) -> Self {
        self.segments.push(PathSegment::Key(key.into()));
        self
    }

    /// Append an index segment (builder pattern)
    pub fn index(mut self, idx: usize) -> Self {
        self.segments.push(PathSegment::Index(idx));
        self
    }

    /// The parent path, `None` for the root
    pub fn parent(&self) -> Option<Path> {
        if self.segments.is_empty() {
            None
        } else {
            let mut parent = self.clone();
            parent.segments.pop();
            Some(parent)
        }
    }

    /// Last segment, `None` for the root
    pub fn last_segment(&self) -> Option<&PathSegment> {
        self.segments.last()
    }

    /// Check if this path is an ancestor of another (or equal)
    ///
    /// The root is an ancestor of every path, and every path is an ancestor
    /// of itself.
    pub fn is_ancestor_of(&self, other: &Path) -> bool {
        if self.segments.len() > other.segments.len() {
            return false;
        }
        self.segments
            .iter()
            .zip(other.segments.iter())
            .all(|(a, b)| a == b)
    }

    /// Check if this path is a descendant of another (or equal)
    pub fn is_descendant_of(&self, other: &Path) -> bool {
        other.is_ancestor_of(self)
    }

    /// Check if this path is a strict ancestor of another (not equal)
    pub fn is_strict_ancestor_of(&self, other: &Path) -> bool {
        self.segments.len() < other.segments.len() && self.is_ancestor_of(other)
    }

    /// Check if both paths lie on one trail (ancestor, descendant or equal)
    ///
    /// This is the relation lock conflicts are defined over.
    pub fn is_on_trail_of(&self, other: &Path) -> bool {
        self.is_ancestor_of(other) || self.is_descendant_of(other)
    }

    /// Longest common prefix of both paths
    pub fn common_ancestor(&self, other: &Path) -> Path {
        let segments = self
            .segments
            .iter()
            .zip(other.segments.iter())
            .take_while(|(a, b)| a == b)
            .map(|(a, _)| a.clone())
            .collect();
        Path::from_segments(segments)
    }

    /// Check if this path matches a subscription pattern
    ///
    /// Both must have the same length. A pattern segment `*` or `$name`
    /// matches any single key or index; every other segment must be equal.
    pub fn matches(&self, pattern: &Path) -> bool {
        self.segments.len() == pattern.segments.len()
            && self
                .segments
                .iter()
                .zip(pattern.segments.iter())
                .all(|(seg, pat)| pat.is_wildcard() || seg == pat)
    }

    /// Canonical text form
    pub fn to_path_string(&self) -> String {
        let mut result = String::new();
        for seg in &self.segments {
            match seg {
                PathSegment::Key(k) => {
                    if !result.is_empty() {
                        result.push('/');
                    }
                    result.push_str(k);
                }
                PathSegment::Index(i) => {
                    result.push('[');
                    result.push_str(&i.to_string());
                    result.push(']');
                }
            }
        }
        result
    }
}

impl FromStr for Path {
    type Err = PathParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim_matches('/');
        if trimmed.is_empty() {
            return Ok(Path::root());
        }
        let offset = s.len() - s.trim_start_matches('/').len();

        let mut segments = Vec::new();
        let mut pos = offset;
        for part in trimmed.split('/') {
            if part.is_empty() {
                return Err(PathParseError::EmptySegment(pos));
            }
            parse_part(part, pos, &mut segments)?;
            pos += part.len() + 1;
        }
        Ok(Path { segments })
    }
}

/// Parse one slash-separated part: `key`, `key[1][2]` or `[1]`
fn parse_part(
    part: &str,
    pos: usize,
    segments: &mut Vec<PathSegment>,
) -> Result<(), PathParseError> {
    let key_end = part.find('[').unwrap_or(part.len());
    if key_end > 0 {
        segments.push(PathSegment::Key(part[..key_end].to_string()));
    }

    let mut rest = &part[key_end..];
    let mut at = pos + key_end;
    while !rest.is_empty() {
        if !rest.starts_with('[') {
            let c = rest.chars().next().unwrap_or('?');
            return Err(PathParseError::UnexpectedChar(c, at));
        }
        let close = rest
            .find(']')
            .ok_or(PathParseError::UnclosedBracket(at))?;
        let digits = &rest[1..close];
        let idx = digits
            .parse::<usize>()
            .map_err(|_| PathParseError::InvalidIndex(at + 1, digits.to_string()))?;
        segments.push(PathSegment::Index(idx));
        rest = &rest[close + 1..];
        at += close + 1;
    }
    Ok(())
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.segments.is_empty() {
            return write!(f, "/");
        }
        write!(f, "/{}", self.to_path_string())
    }
}

impl From<Path> for String {
    fn from(path: Path) -> Self {
        path.to_path_string()
    }
}

impl TryFrom<String> for Path {
    type Error = PathParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl TryFrom<&str> for Path {
    type Error = PathParseError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        s.parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn p(s: &str) -> Path {
        s.parse().unwrap()
    }

    #[test]
    fn test_parse_root_variants() {
        assert!(p("").is_root());
        assert!(p("/").is_root());
        assert!(p("//").is_root());
    }

    #[test]
    fn test_parse_keys_and_indices() {
        let path = p("/users/42/posts[3]/title");
        assert_eq!(
            path.segments(),
            &[
                PathSegment::Key("users".into()),
                PathSegment::Key("42".into()),
                PathSegment::Key("posts".into()),
                PathSegment::Index(3),
                PathSegment::Key("title".into()),
            ]
        );
        assert_eq!(path.to_path_string(), "users/42/posts[3]/title");
    }

    #[test]
    fn test_standalone_index_segment_normalizes() {
        assert_eq!(p("items/[3]"), p("items[3]"));
        assert_eq!(p("matrix[1][2]").len(), 3);
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            Path::parse("a//b"),
            Err(PathParseError::EmptySegment(_))
        ));
        assert!(matches!(
            Path::parse("a[1"),
            Err(PathParseError::UnclosedBracket(_))
        ));
        assert!(matches!(
            Path::parse("a[x]"),
            Err(PathParseError::InvalidIndex(_, _))
        ));
        assert!(matches!(
            Path::parse("a[1]b"),
            Err(PathParseError::UnexpectedChar('b', _))
        ));
    }

    #[test]
    fn test_display_has_leading_slash() {
        assert_eq!(p("users/42").to_string(), "/users/42");
        assert_eq!(Path::root().to_string(), "/");
    }

    #[test]
    fn test_parent_chain() {
        let path = p("a/b/c");
        assert_eq!(path.parent(), Some(p("a/b")));
        assert_eq!(p("a").parent(), Some(Path::root()));
        assert_eq!(Path::root().parent(), None);
    }

    #[test]
    fn test_trail_relations() {
        let users = p("users");
        let user = p("users/42");
        let other = p("users/43");

        assert!(users.is_ancestor_of(&user));
        assert!(user.is_descendant_of(&users));
        assert!(users.is_strict_ancestor_of(&user));
        assert!(!user.is_strict_ancestor_of(&user));
        assert!(user.is_on_trail_of(&user));
        assert!(Path::root().is_on_trail_of(&user));
        assert!(!user.is_on_trail_of(&other));
    }

    #[test]
    fn test_key_prefix_is_not_ancestor() {
        // "user" is a string prefix of "users" but not a path ancestor
        assert!(!p("user").is_on_trail_of(&p("users/1")));
    }

    #[test]
    fn test_common_ancestor() {
        assert_eq!(p("a/b/c").common_ancestor(&p("a/b/d")), p("a/b"));
        assert_eq!(p("x").common_ancestor(&p("y")), Path::root());
    }

    #[test]
    fn test_wildcard_matching() {
        let pattern = p("users/$uid/posts/*");
        assert!(p("users/42/posts/7").matches(&pattern));
        assert!(p("users/42/posts[7]").matches(&pattern));
        assert!(!p("users/42/posts").matches(&pattern));
        assert!(!p("users/42/likes/7").matches(&pattern));
        assert!(p("users/42").matches(&p("users/42")));
    }

    #[test]
    fn test_serde_uses_canonical_string() {
        let json = serde_json::to_string(&p("/a/b[2]/")).unwrap();
        assert_eq!(json, "\"a/b[2]\"");
        let back: Path = serde_json::from_str(&json).unwrap();
        assert_eq!(back, p("a/b[2]"));
        assert!(serde_json::from_str::<Path>("\"a[\"").is_err());
    }

    fn arb_path() -> impl Strategy<Value = Path> {
        prop::collection::vec(
            prop_oneof![
                "[a-c]{1,2}".prop_map(PathSegment::Key),
                (0usize..3).prop_map(PathSegment::Index),
            ],
            0..5,
        )
        .prop_map(Path::from_segments)
    }

    proptest! {
        #[test]
        fn prop_text_form_reparses(path in arb_path()) {
            let reparsed: Path = path.to_path_string().parse().unwrap();
            prop_assert_eq!(reparsed, path);
        }

        #[test]
        fn prop_trail_is_symmetric(a in arb_path(), b in arb_path()) {
            prop_assert_eq!(a.is_on_trail_of(&b), b.is_on_trail_of(&a));
        }

        #[test]
        fn prop_common_ancestor_is_on_both_trails(a in arb_path(), b in arb_path()) {
            let c = a.common_ancestor(&b);
            prop_assert!(c.is_ancestor_of(&a));
            prop_assert!(c.is_ancestor_of(&b));
        }
    }
}
