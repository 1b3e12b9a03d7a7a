// Copyright (c) The testhub Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Tree mutation operations.

use crate::{
    item::{InternalTestItem, TestItemUpdate},
    test_id::TestId,
};
use serde::{Deserialize, Serialize};

/// A single operation in a [`TestsDiff`].
///
/// Diffs are the only channel through which a collection changes. Operations
/// are applied strictly in the order they were published.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "kebab-case")]
pub enum TestDiffOp {
    /// Adds a new item under its parent, or as a root if it has none.
    Add {
        /// The item to add.
        item: InternalTestItem,
    },

    /// Merges fields into an existing item.
    Update {
        /// The fields to merge.
        item: TestItemUpdate,
    },

    /// Removes an item along with its whole subtree.
    Remove {
        /// The item to remove.
        item_id: TestId,
    },

    /// Adjusts the number of controllers still discovering their roots.
    IncrementPendingExtHosts {
        /// The signed amount to adjust by.
        amount: i32,
    },

    /// Marks an item as retired: it keeps its definition, but results that
    /// refer to it are considered outdated.
    RetireTest {
        /// The item being retired.
        test_id: TestId,
    },
}

/// An ordered sequence of operations.
pub type TestsDiff = Vec<TestDiffOp>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::{TestItem, TestItemExpandState};
    use pretty_assertions::assert_eq;

    #[test]
    fn ops_are_tagged() {
        let id = TestId::from_parts(["ctrl", "a"]);
        let diff: TestsDiff = vec![
            TestDiffOp::Add {
                item: InternalTestItem::new(
                    TestItem::new(id.clone(), "a"),
                    TestItemExpandState::NotExpandable,
                ),
            },
            TestDiffOp::IncrementPendingExtHosts { amount: -1 },
            TestDiffOp::Remove { item_id: id },
        ];

        let json = serde_json::to_value(&diff).unwrap();
        assert_eq!(json[0]["op"], "add");
        assert_eq!(json[1]["op"], "increment-pending-ext-hosts");
        assert_eq!(json[2]["op"], "remove");

        let back: TestsDiff = serde_json::from_value(json).unwrap();
        assert_eq!(back, diff);
    }
}
