// Copyright (c) The testhub Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Test items as published by controllers.

use crate::test_id::{ControllerId, TestId};
use serde::{Deserialize, Serialize};

/// A zero-based position in a document.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Position {
    /// Zero-based line.
    pub line: u32,
    /// Zero-based character offset within the line.
    pub character: u32,
}

/// A range in a document.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Range {
    /// Start of the range, inclusive.
    pub start: Position,
    /// End of the range, exclusive.
    pub end: Position,
}

/// A location in a document, used by output and messages.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    /// The document URI.
    pub uri: String,
    /// The range within the document.
    pub range: Range,
}

/// The payload describing a single test item.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestItem {
    /// The full, controller-prefixed identifier of the item.
    pub ext_id: TestId,

    /// Human-readable label.
    pub label: String,

    /// Optional description rendered next to the label.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Tags attached to the item. Run profiles may be restricted to a tag.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,

    /// The document the item lives in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,

    /// Location of the item within `uri`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range: Option<Range>,

    /// Text used in place of the label when sorting.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort_text: Option<String>,

    /// Whether the controller reports this item as busy.
    #[serde(default)]
    pub busy: bool,

    /// An error raised while discovering the item.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TestItem {
    /// Creates an item with the given ID and label and no other metadata.
    pub fn new(ext_id: TestId, label: impl Into<String>) -> Self {
        Self {
            ext_id,
            label: label.into(),
            description: None,
            tags: Vec::new(),
            uri: None,
            range: None,
            sort_text: None,
            busy: false,
            error: None,
        }
    }
}

/// Whether and how an item's children have been discovered.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TestItemExpandState {
    /// The item cannot have children.
    #[default]
    NotExpandable,

    /// The item may have children that have not been discovered yet.
    Expandable,

    /// The controller is discovering children right now.
    BusyExpanding,

    /// Children have been discovered.
    Expanded,
}

/// A test item along with the bookkeeping the collection needs.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InternalTestItem {
    /// The controller that owns the item.
    pub controller_id: ControllerId,

    /// The parent's ID, or `None` for a root.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<TestId>,

    /// Expansion state.
    pub expand: TestItemExpandState,

    /// The item payload.
    pub item: TestItem,
}

impl InternalTestItem {
    /// Creates an internal item, deriving the controller and parent from the ID.
    pub fn new(item: TestItem, expand: TestItemExpandState) -> Self {
        Self {
            controller_id: ControllerId::new(item.ext_id.controller_id()),
            parent: item.ext_id.parent_id(),
            expand,
            item,
        }
    }

    /// Returns the item's ID.
    pub fn id(&self) -> &TestId {
        &self.item.ext_id
    }
}

/// Partial item fields carried by an update.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestItemPatch {
    /// New label.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// New description; `Some(None)` clears it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<Option<String>>,
    /// New tag list.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    /// New document URI; `Some(None)` clears it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<Option<String>>,
    /// New range; `Some(None)` clears it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range: Option<Option<Range>>,
    /// New sort text; `Some(None)` clears it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort_text: Option<Option<String>>,
    /// New busy flag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub busy: Option<bool>,
    /// New discovery error; `Some(None)` clears it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Option<String>>,
}

/// An in-place update to an existing item.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestItemUpdate {
    /// The item to update.
    pub ext_id: TestId,

    /// The new expansion state, if it changed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expand: Option<TestItemExpandState>,

    /// Changed payload fields.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item: Option<TestItemPatch>,
}

impl TestItemUpdate {
    /// Merges the update into `target`. Fields absent from the update are left
    /// untouched.
    pub fn apply_to(&self, target: &mut InternalTestItem) {
        if let Some(expand) = self.expand {
            target.expand = expand;
        }

        let Some(patch) = &self.item else {
            return;
        };
        let item = &mut target.item;
        if let Some(label) = &patch.label {
            item.label.clone_from(label);
        }
        if let Some(description) = &patch.description {
            item.description.clone_from(description);
        }
        if let Some(tags) = &patch.tags {
            item.tags.clone_from(tags);
        }
        if let Some(uri) = &patch.uri {
            item.uri.clone_from(uri);
        }
        if let Some(range) = patch.range {
            item.range = range;
        }
        if let Some(sort_text) = &patch.sort_text {
            item.sort_text.clone_from(sort_text);
        }
        if let Some(busy) = patch.busy {
            item.busy = busy;
        }
        if let Some(error) = &patch.error {
            item.error.clone_from(error);
        }
    }
}
