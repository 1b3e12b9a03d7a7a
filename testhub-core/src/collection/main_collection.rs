// Copyright (c) The testhub Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::incremental::{
    ChangeCollector, CollectionNode, IncrementalNode, IncrementalTestCollection,
};
use crate::{
    events::{Emitter, ListenerId},
    helpers::lock,
};
use debug_ignore::DebugIgnore;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::{
    fmt,
    sync::{Arc, Mutex},
};
use testhub_metadata::{InternalTestItem, TestDiffOp, TestId, TestsDiff};
use tracing::debug;

/// The capability used to ask a controller to discover children of a test,
/// `levels` deep.
pub type ExpandFn = Arc<dyn Fn(TestId, u32) -> BoxFuture<'static, ()> + Send + Sync>;

/// A snapshot of one node in the [`MainTestCollection`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CollectedTest {
    /// The item.
    pub item: InternalTestItem,
    /// IDs of the item's children, in the order they were added.
    pub children: Vec<TestId>,
    /// Whether the item was retired.
    pub retired: bool,
}

/// The process-wide test tree that controllers publish into.
///
/// This wraps an [`IncrementalTestCollection`], de-duplicating expansion
/// requests and producing reviver diffs for late subscribers.
pub struct MainTestCollection {
    inner: Mutex<IncrementalTestCollection<MainCollectionNode>>,
    expand_actual: DebugIgnore<ExpandFn>,
    busy_providers_change: Emitter<usize>,
}

impl fmt::Debug for MainTestCollection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MainTestCollection")
            .field("inner", &self.inner)
            .field("expand_actual", &self.expand_actual)
            .finish_non_exhaustive()
    }
}

impl MainTestCollection {
    /// Creates an empty collection that expands items through `expand_actual`.
    pub fn new(expand_actual: ExpandFn) -> Self {
        Self {
            inner: Mutex::new(IncrementalTestCollection::new()),
            expand_actual: DebugIgnore(expand_actual),
            busy_providers_change: Emitter::new(),
        }
    }

    /// Applies a diff to the tree, notifying busy-provider listeners if the
    /// number of busy items changed.
    pub fn apply(&self, diff: &[TestDiffOp]) {
        let (before, after) = {
            let mut inner = lock(&self.inner);
            let before = inner.busy_count();
            inner.apply_with(diff, &mut RemovalLogger);
            (before, inner.busy_count())
        };

        if before != after {
            self.busy_providers_change.fire(&after);
        }
    }

    /// Expands the test `levels` deep.
    ///
    /// A request is satisfied by an in-flight or finished request for the
    /// same test if that one was at least as deep. Unknown tests resolve
    /// immediately.
    pub async fn expand(&self, test_id: &TestId, levels: u32) {
        let pending = match self.covering_expansion(test_id, levels) {
            ExpandLookup::Unknown => {
                debug!(test_id = %test_id.display_path(), "not expanding unknown test");
                return;
            }
            ExpandLookup::Covered(future) => future,
            ExpandLookup::Uncovered => {
                // Called without the lock held: the expander may read or
                // update the collection before returning its future.
                let future = (self.expand_actual)(test_id.clone(), levels).shared();
                self.record_expansion(test_id, levels, future)
            }
        };

        pending.await;

        let mut inner = lock(&self.inner);
        if let Some(record) = inner
            .get_mut(test_id)
            .and_then(|node| node.payload_mut().expand.as_mut())
            && record.pending_level == levels
        {
            record.done_level = Some(levels);
        }
    }

    fn covering_expansion(&self, test_id: &TestId, levels: u32) -> ExpandLookup {
        let inner = lock(&self.inner);
        match inner.get(test_id) {
            None => ExpandLookup::Unknown,
            Some(node) => match &node.payload().expand {
                Some(existing) if existing.pending_level >= levels => {
                    ExpandLookup::Covered(existing.future.clone())
                }
                _ => ExpandLookup::Uncovered,
            },
        }
    }

    /// Records `future` as the pending expansion of the test, unless a request
    /// at least as deep was recorded in the meantime. Returns the future to
    /// wait on.
    fn record_expansion(
        &self,
        test_id: &TestId,
        levels: u32,
        future: SharedExpand,
    ) -> SharedExpand {
        let mut inner = lock(&self.inner);
        let Some(node) = inner.get_mut(test_id) else {
            // Removed while the request was being made; still let it finish.
            return future;
        };
        let payload = node.payload_mut();
        match &payload.expand {
            Some(existing) if existing.pending_level >= levels => existing.future.clone(),
            _ => {
                let done_level = payload.expand.as_ref().and_then(|record| record.done_level);
                payload.expand = Some(ExpandRecord {
                    pending_level: levels,
                    done_level,
                    future: future.clone(),
                });
                future
            }
        }
    }

    /// Returns how deep a test has been expanded so far, if any expansion of
    /// it has completed.
    pub fn expanded_level(&self, test_id: &TestId) -> Option<u32> {
        lock(&self.inner)
            .get(test_id)
            .and_then(|node| node.payload().expand.as_ref())
            .and_then(|record| record.done_level)
    }

    /// Returns a diff that, replayed into an empty collection, reproduces the
    /// current tree.
    ///
    /// The diff starts with the pending root count, followed by an `Add` for
    /// every node, breadth-first from the roots.
    pub fn get_reviver_diff(&self) -> TestsDiff {
        let inner = lock(&self.inner);
        let mut ops = Vec::with_capacity(inner.len() + 1);
        ops.push(TestDiffOp::IncrementPendingExtHosts {
            amount: i32::try_from(inner.pending_root_count()).unwrap_or(i32::MAX),
        });
        ops.extend(inner.iter_breadth_first().map(|node| TestDiffOp::Add {
            item: node.item().clone(),
        }));
        ops
    }

    /// Removes every item, returning the diff that performs the same removal.
    pub fn clear(&self) -> TestsDiff {
        let (ops, was_busy) = {
            let mut inner = lock(&self.inner);
            let was_busy = inner.busy_count() != 0;
            (inner.clear(), was_busy)
        };
        if was_busy {
            self.busy_providers_change.fire(&0);
        }
        ops
    }

    /// Returns a snapshot of the node with the given ID.
    pub fn get_node_by_id(&self, test_id: &TestId) -> Option<CollectedTest> {
        lock(&self.inner).get(test_id).map(collected)
    }

    /// Returns the IDs of the root items.
    pub fn root_ids(&self) -> Vec<TestId> {
        lock(&self.inner).root_ids().cloned().collect()
    }

    /// Returns snapshots of the root items.
    pub fn root_items(&self) -> Vec<CollectedTest> {
        let inner = lock(&self.inner);
        inner
            .root_ids()
            .filter_map(|id| inner.get(id))
            .map(collected)
            .collect()
    }

    /// Returns snapshots of every item, breadth-first from the roots.
    pub fn all(&self) -> Vec<CollectedTest> {
        lock(&self.inner).iter_breadth_first().map(collected).collect()
    }

    /// Returns the number of items in the tree.
    pub fn len(&self) -> usize {
        lock(&self.inner).len()
    }

    /// Returns true if the tree is empty.
    pub fn is_empty(&self) -> bool {
        lock(&self.inner).is_empty()
    }

    /// Returns the number of items currently being expanded by a controller.
    pub fn busy_providers(&self) -> usize {
        lock(&self.inner).busy_count()
    }

    /// Returns the number of controllers still publishing their roots.
    pub fn pending_root_count(&self) -> u32 {
        lock(&self.inner).pending_root_count()
    }

    /// Registers a listener for changes to [`Self::busy_providers`].
    pub fn on_busy_providers_change(
        &self,
        callback: impl Fn(&usize) + Send + Sync + 'static,
    ) -> ListenerId {
        self.busy_providers_change.subscribe(callback)
    }
}

/// A node of the main collection: the item plus its expansion bookkeeping.
#[derive(Debug)]
pub struct MainCollectionNode {
    item: InternalTestItem,
    expand: Option<ExpandRecord>,
}

impl CollectionNode for MainCollectionNode {
    fn from_item(item: InternalTestItem) -> Self {
        Self { item, expand: None }
    }

    fn item(&self) -> &InternalTestItem {
        &self.item
    }

    fn item_mut(&mut self) -> &mut InternalTestItem {
        &mut self.item
    }
}

type SharedExpand = Shared<BoxFuture<'static, ()>>;

enum ExpandLookup {
    Unknown,
    Covered(SharedExpand),
    Uncovered,
}

struct ExpandRecord {
    pending_level: u32,
    done_level: Option<u32>,
    future: SharedExpand,
}

impl fmt::Debug for ExpandRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExpandRecord")
            .field("pending_level", &self.pending_level)
            .field("done_level", &self.done_level)
            .finish_non_exhaustive()
    }
}

/// Expansion records live on the node, so removing a node drops its record.
/// Re-adding a node with the same ID starts from scratch.
struct RemovalLogger;

impl ChangeCollector<MainCollectionNode> for RemovalLogger {
    fn remove(&mut self, node: &IncrementalNode<MainCollectionNode>, is_nested: bool) {
        if !is_nested && node.payload().expand.is_some() {
            debug!(
                test_id = %node.id().display_path(),
                "dropping expansion state of removed test",
            );
        }
    }
}

fn collected(node: &IncrementalNode<MainCollectionNode>) -> CollectedTest {
    CollectedTest {
        item: node.item().clone(),
        children: node.children().cloned().collect(),
        retired: node.is_retired(),
    }
}
