//! Tags: the keys that define consistency boundaries.
//!
//! A tag is written `group:content`. Plain tags only route events to
//! projections. Consistency tags additionally take part in write
//! reservations and may carry the last sortable id the writer expects the
//! tag to be at.
//!
//! Construction is lenient so that tags parsed from stored events always
//! round-trip; [`TagKey::validate`] reports every well-formedness violation
//! and is applied by the command executor before anything is reserved.

use crate::types::SortableUniqueId;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Maximum characters in a tag group.
pub const MAX_GROUP_LENGTH: usize = 40;
/// Maximum characters in a tag content.
pub const MAX_CONTENT_LENGTH: usize = 80;

/// The `group:content` identity of a tag, without consistency semantics.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TagKey {
    group: String,
    content: String,
}

impl TagKey {
    /// Creates a key from its two parts.
    pub fn new(group: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            content: content.into(),
        }
    }

    /// Splits `group:content` at the first colon. Text without a colon is
    /// all group and no content.
    pub fn parse(text: &str) -> Self {
        match text.split_once(':') {
            Some((group, content)) => Self::new(group, content),
            None => Self::new(text, ""),
        }
    }

    /// The tag group.
    pub fn group(&self) -> &str {
        &self.group
    }

    /// The tag content.
    pub fn content(&self) -> &str {
        &self.content
    }

    /// Canonical `group:content` form, also the reservation actor id.
    pub fn tag_id(&self) -> String {
        self.to_string()
    }

    /// Checks the key against the naming rules and returns every violation.
    pub fn validate(&self) -> Vec<TagValidationError> {
        let mut errors = Vec::new();
        let tag = self.tag_id();

        if self.group.is_empty() {
            errors.push(TagValidationError::new(
                &tag,
                TagValidationErrorKind::EmptyGroup,
                "tag group must not be empty",
            ));
        } else if !has_allowed_characters(&self.group) {
            errors.push(TagValidationError::new(
                &tag,
                TagValidationErrorKind::InvalidCharactersInGroup,
                format!(
                    "tag group '{}' contains invalid characters (allowed: A-Z a-z 0-9 . _ -)",
                    self.group
                ),
            ));
        }
        let group_len = self.group.chars().count();
        if group_len > MAX_GROUP_LENGTH {
            errors.push(TagValidationError::new(
                &tag,
                TagValidationErrorKind::GroupTooLong,
                format!(
                    "tag group exceeds maximum length of {MAX_GROUP_LENGTH} (actual: {group_len})"
                ),
            ));
        }

        if self.content.is_empty() {
            errors.push(TagValidationError::new(
                &tag,
                TagValidationErrorKind::EmptyContent,
                "tag content must not be empty",
            ));
        } else if !has_allowed_characters(&self.content) {
            errors.push(TagValidationError::new(
                &tag,
                TagValidationErrorKind::InvalidCharactersInContent,
                format!(
                    "tag content '{}' contains invalid characters (allowed: A-Z a-z 0-9 . _ -)",
                    self.content
                ),
            ));
        }
        let content_len = self.content.chars().count();
        if content_len > MAX_CONTENT_LENGTH {
            errors.push(TagValidationError::new(
                &tag,
                TagValidationErrorKind::ContentTooLong,
                format!(
                    "tag content exceeds maximum length of {MAX_CONTENT_LENGTH} (actual: {content_len})"
                ),
            ));
        }

        errors
    }
}

fn has_allowed_characters(part: &str) -> bool {
    part.chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

impl fmt::Display for TagKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.group, self.content)
    }
}

/// A tag attached to an event.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Tag {
    /// Routes the event to projections; never blocks a write.
    Plain(TagKey),
    /// Takes part in write reservations using whatever position is known.
    Consistency(TagKey),
    /// Takes part in write reservations and requires the tag to be at the
    /// given position.
    ConsistencyWithId(TagKey, SortableUniqueId),
}

impl Tag {
    /// A plain tag.
    pub fn plain(group: impl Into<String>, content: impl Into<String>) -> Self {
        Self::Plain(TagKey::new(group, content))
    }

    /// A consistency tag without an expected position.
    pub fn consistency(group: impl Into<String>, content: impl Into<String>) -> Self {
        Self::Consistency(TagKey::new(group, content))
    }

    /// Turns this tag into a consistency tag that expects `expected`.
    #[must_use]
    pub fn with_expected(self, expected: SortableUniqueId) -> Self {
        Self::ConsistencyWithId(self.into_key(), expected)
    }

    /// The underlying identity.
    pub const fn key(&self) -> &TagKey {
        match self {
            Self::Plain(key) | Self::Consistency(key) | Self::ConsistencyWithId(key, _) => key,
        }
    }

    /// Consumes the tag, keeping only its identity.
    pub fn into_key(self) -> TagKey {
        match self {
            Self::Plain(key) | Self::Consistency(key) | Self::ConsistencyWithId(key, _) => key,
        }
    }

    /// Canonical `group:content` form.
    pub fn tag_id(&self) -> String {
        self.key().tag_id()
    }

    /// The tag group.
    pub fn group(&self) -> &str {
        self.key().group()
    }

    /// Whether the tag takes part in write reservations.
    pub const fn is_consistency_tag(&self) -> bool {
        !matches!(self, Self::Plain(_))
    }

    /// The explicitly expected position, if any.
    pub const fn expected_sortable_unique_id(&self) -> Option<&SortableUniqueId> {
        match self {
            Self::ConsistencyWithId(_, expected) => Some(expected),
            _ => None,
        }
    }

    /// Precedence when several tags with the same identity meet in one
    /// write: an explicit expectation beats a bare consistency tag, which
    /// beats a plain tag.
    pub(crate) const fn precedence(&self) -> u8 {
        match self {
            Self::Plain(_) => 0,
            Self::Consistency(_) => 1,
            Self::ConsistencyWithId(..) => 2,
        }
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self.key(), f)
    }
}

/// The kind of a tag naming violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TagValidationErrorKind {
    /// Nothing before the colon.
    EmptyGroup,
    /// Nothing after the colon, or no colon at all.
    EmptyContent,
    /// The group has characters outside `[A-Za-z0-9._-]`.
    InvalidCharactersInGroup,
    /// The content has characters outside `[A-Za-z0-9._-]`.
    InvalidCharactersInContent,
    /// The group is longer than [`MAX_GROUP_LENGTH`].
    GroupTooLong,
    /// The content is longer than [`MAX_CONTENT_LENGTH`].
    ContentTooLong,
}

/// One naming violation of one tag.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{tag}: {message}")]
pub struct TagValidationError {
    /// The offending tag in `group:content` form.
    pub tag: String,
    /// What is wrong with it.
    pub kind: TagValidationErrorKind,
    /// Human readable description.
    pub message: String,
}

impl TagValidationError {
    fn new(tag: &str, kind: TagValidationErrorKind, message: impl Into<String>) -> Self {
        Self {
            tag: tag.to_string(),
            kind,
            message: message.into(),
        }
    }
}

/// Validates every tag and concatenates the violations.
pub fn validate_tags<'a>(tags: impl IntoIterator<Item = &'a Tag>) -> Vec<TagValidationError> {
    tags.into_iter().flat_map(|tag| tag.key().validate()).collect()
}

/// The identity of a tag state actor: one tag folded by one projector.
///
/// Rendered as `group:content:projector`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TagStateId {
    tag: TagKey,
    projector: String,
}

impl TagStateId {
    /// Pairs a tag with a projector name.
    pub fn new(tag: TagKey, projector: impl Into<String>) -> Self {
        Self {
            tag,
            projector: projector.into(),
        }
    }

    /// Parses `group:content:projector`.
    pub fn parse(text: &str) -> Option<Self> {
        let mut parts = text.splitn(3, ':');
        let group = parts.next()?;
        let content = parts.next()?;
        let projector = parts.next()?;
        if group.is_empty() || content.is_empty() || projector.is_empty() {
            return None;
        }
        Some(Self::new(TagKey::new(group, content), projector))
    }

    /// The tag being folded.
    pub const fn tag(&self) -> &TagKey {
        &self.tag
    }

    /// The projector folding it.
    pub fn projector(&self) -> &str {
        &self.projector
    }
}

impl fmt::Display for TagStateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.tag, self.projector)
    }
}
