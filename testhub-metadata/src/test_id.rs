// Copyright (c) The testhub Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Hierarchical test identifiers.

use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::{cmp::Ordering, fmt};

/// The reserved separator between path segments of a [`TestId`].
pub const TEST_ID_DELIMITER: char = '\0';

/// A controller identifier. This is always the first segment of a [`TestId`].
pub type ControllerId = SmolStr;

/// A hierarchical identifier for a test item.
///
/// The first segment names the controller that owns the test; each further
/// segment descends one level into the controller's tree. A child's ID is
/// always its parent's ID followed by one more segment, so the parent and the
/// owning controller can be derived without looking at the tree.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TestId(SmolStr);

/// How two test IDs relate to each other.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TestPosition {
    /// `a` is a descendant of `b`.
    IsChild,

    /// `a` is an ancestor of `b`.
    IsParent,

    /// The IDs are the same.
    IsSame,

    /// Neither ID contains the other.
    Disconnected,
}

impl TestId {
    /// Creates the root ID for a controller.
    pub fn root(controller_id: &str) -> Self {
        Self(SmolStr::new(controller_id))
    }

    /// Creates an ID from its path segments, controller first.
    pub fn from_parts<I, S>(parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut out = String::new();
        for (idx, part) in parts.into_iter().enumerate() {
            if idx > 0 {
                out.push(TEST_ID_DELIMITER);
            }
            out.push_str(part.as_ref());
        }
        Self(SmolStr::new(out))
    }

    /// Parses an ID from its string representation.
    ///
    /// Every string is a valid ID, so this cannot fail.
    pub fn parse(s: &str) -> Self {
        Self(SmolStr::new(s))
    }

    /// Returns a new ID for a child of `self` with the given local segment.
    pub fn join(&self, child: &str) -> Self {
        let mut out = String::with_capacity(self.0.len() + 1 + child.len());
        out.push_str(&self.0);
        out.push(TEST_ID_DELIMITER);
        out.push_str(child);
        Self(SmolStr::new(out))
    }

    /// Returns the raw string form of this ID.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the ID of the controller owning this test.
    pub fn controller_id(&self) -> &str {
        match self.0.find(TEST_ID_DELIMITER) {
            Some(idx) => &self.0[..idx],
            None => &self.0,
        }
    }

    /// Returns the ID of the parent, or `None` if this is a controller root.
    pub fn parent_id(&self) -> Option<TestId> {
        self.0
            .rfind(TEST_ID_DELIMITER)
            .map(|idx| Self(SmolStr::new(&self.0[..idx])))
    }

    /// Returns true if this is the root ID of a controller.
    pub fn is_root(&self) -> bool {
        !self.0.contains(TEST_ID_DELIMITER)
    }

    /// Returns the last segment of the ID.
    pub fn local_id(&self) -> &str {
        match self.0.rfind(TEST_ID_DELIMITER) {
            Some(idx) => &self.0[idx + 1..],
            None => &self.0,
        }
    }

    /// Iterates over the path segments, controller first.
    pub fn segments(&self) -> impl Iterator<Item = &str> + '_ {
        self.0.split(TEST_ID_DELIMITER)
    }

    /// Returns the number of segments below the controller root.
    pub fn depth(&self) -> usize {
        self.0.matches(TEST_ID_DELIMITER).count()
    }

    /// Returns true if `self` is a strict descendant of `other`.
    pub fn is_child_of(&self, other: &TestId) -> bool {
        self.0.len() > other.0.len()
            && self.0.starts_with(other.0.as_str())
            && self.0[other.0.len()..].starts_with(TEST_ID_DELIMITER)
    }

    /// Compares the position of `a` relative to `b`.
    pub fn compare(a: &TestId, b: &TestId) -> TestPosition {
        match a.0.len().cmp(&b.0.len()) {
            Ordering::Equal if a == b => TestPosition::IsSame,
            Ordering::Greater if a.is_child_of(b) => TestPosition::IsChild,
            Ordering::Less if b.is_child_of(a) => TestPosition::IsParent,
            _ => TestPosition::Disconnected,
        }
    }

    /// Returns a display adapter that renders the segments separated by ` > `.
    pub fn display_path(&self) -> DisplayTestPath<'_> {
        DisplayTestPath(self)
    }
}

impl From<&str> for TestId {
    fn from(s: &str) -> Self {
        Self::parse(s)
    }
}

impl AsRef<str> for TestId {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

/// Display adapter returned by [`TestId::display_path`].
#[derive(Clone, Copy, Debug)]
pub struct DisplayTestPath<'a>(&'a TestId);

impl fmt::Display for DisplayTestPath<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, segment) in self.0.segments().enumerate() {
            if idx > 0 {
                f.write_str(" > ")?;
            }
            f.write_str(segment)?;
        }
        Ok(())
    }
}
