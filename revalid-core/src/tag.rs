//! Hierarchical invalidation tags.
//!
//! A [`Tag`] is an ordered list of path segments. Tag `A` matches tag `B`
//! when `A`'s segments are a prefix of `B`'s, so invalidating `user:1`
//! also reaches `user:1.posts` but never the other way around.
//!
//! Tag sets are persisted as delimited text so the persistent tier can
//! pre-filter rows with a plain substring search:
//!
//! ```text
//! [users, user:1.posts]  =>  "\x1eusers\x1euser:1\x1fposts\x1e"
//! ```
//!
//! Every encoded tag starts right after a record separator, so the needle
//! `"\x1e" + segments.join("\x1f")` finds every tag the search tag could
//! match. The substring hit is only a candidate; [`TagSet::contains_match`]
//! decides.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Separator written before (and after) every tag in the encoded form.
pub const TAG_SEPARATOR: char = '\u{1e}';

/// Separator written between the segments of one tag.
pub const SEGMENT_SEPARATOR: char = '\u{1f}';

/// Separator used by the human-readable form (`user:1.posts`).
const DISPLAY_SEPARATOR: char = '.';

/// A hierarchical invalidation tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Tag {
    segments: Vec<String>,
}

impl Tag {
    /// Build a tag from explicit segments.
    ///
    /// Segments must be non-empty and may not contain `.` or the control
    /// separators used by the encoded form.
    pub fn from_segments<I, S>(segments: I) -> Result<Self, ValidationError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let segments: Vec<String> = segments.into_iter().map(Into::into).collect();
        if segments.is_empty() {
            return Err(ValidationError::InvalidTag {
                reason: "a tag needs at least one segment".to_string(),
            });
        }
        for segment in &segments {
            validate_segment(segment)?;
        }
        Ok(Self { segments })
    }

    /// Parse the dotted form, e.g. `user:1.posts`.
    pub fn parse(value: &str) -> Result<Self, ValidationError> {
        Self::from_segments(value.split(DISPLAY_SEPARATOR))
    }

    /// Extend this tag by one segment.
    pub fn child(&self, segment: impl Into<String>) -> Result<Self, ValidationError> {
        let segment = segment.into();
        validate_segment(&segment)?;
        let mut segments = self.segments.clone();
        segments.push(segment);
        Ok(Self { segments })
    }

    /// The parent tag, or `None` for a root tag.
    pub fn parent(&self) -> Option<Self> {
        if self.segments.len() <= 1 {
            return None;
        }
        Some(Self {
            segments: self.segments[..self.segments.len() - 1].to_vec(),
        })
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn depth(&self) -> usize {
        self.segments.len()
    }

    /// True iff `self`'s segments are a prefix of `other`'s (including equality).
    pub fn matches(&self, other: &Tag) -> bool {
        other.segments.starts_with(&self.segments)
    }

    /// Substring that every encoded tag matched by `self` starts with.
    pub fn search_needle(&self) -> String {
        let mut needle = String::new();
        needle.push(TAG_SEPARATOR);
        needle.push_str(&self.segments.join(&SEGMENT_SEPARATOR.to_string()));
        needle
    }
}

fn validate_segment(segment: &str) -> Result<(), ValidationError> {
    if segment.is_empty() {
        return Err(ValidationError::InvalidTag {
            reason: "empty segment".to_string(),
        });
    }
    if segment
        .chars()
        .any(|c| c == DISPLAY_SEPARATOR || c == TAG_SEPARATOR || c == SEGMENT_SEPARATOR)
    {
        return Err(ValidationError::InvalidTag {
            reason: format!("segment {segment:?} contains a reserved separator"),
        });
    }
    Ok(())
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.segments.join("."))
    }
}

impl FromStr for Tag {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Tag {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Tag> for String {
    fn from(tag: Tag) -> Self {
        tag.to_string()
    }
}

/// The set of tags attached to one cache entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TagSet(BTreeSet<Tag>);

impl TagSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, tag: Tag) -> bool {
        self.0.insert(tag)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Tag> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// True iff invalidating `tag` hits this set, i.e. some member `m`
    /// satisfies `tag.matches(m)`.
    pub fn contains_match(&self, tag: &Tag) -> bool {
        self.0.iter().any(|member| tag.matches(member))
    }

    /// Encode for storage and substring pre-filtering.
    pub fn encode(&self) -> String {
        let mut out = String::new();
        out.push(TAG_SEPARATOR);
        for tag in &self.0 {
            out.push_str(&tag.segments.join(&SEGMENT_SEPARATOR.to_string()));
            out.push(TAG_SEPARATOR);
        }
        out
    }

    /// Decode the output of [`TagSet::encode`].
    pub fn decode(encoded: &str) -> Result<Self, ValidationError> {
        encoded
            .split(TAG_SEPARATOR)
            .filter(|chunk| !chunk.is_empty())
            .map(|chunk| Tag::from_segments(chunk.split(SEGMENT_SEPARATOR)))
            .collect()
    }
}

impl FromIterator<Tag> for TagSet {
    fn from_iter<I: IntoIterator<Item = Tag>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a TagSet {
    type Item = &'a Tag;
    type IntoIter = std::collections::btree_set::Iter<'a, Tag>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}
