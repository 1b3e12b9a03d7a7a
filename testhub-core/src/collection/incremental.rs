// Copyright (c) The testhub Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use indexmap::IndexSet;
use std::collections::{HashMap, VecDeque};
use testhub_metadata::{
    InternalTestItem, TestDiffOp, TestId, TestItemExpandState, TestItemUpdate,
};
use tracing::{debug, error};

/// A payload stored in an [`IncrementalTestCollection`].
///
/// The collection creates payloads from `Add` operations and hands out mutable
/// access to the wrapped item only while applying an `Update`.
pub trait CollectionNode {
    /// Creates the payload for a newly added item.
    fn from_item(item: InternalTestItem) -> Self;

    /// Returns the wrapped item.
    fn item(&self) -> &InternalTestItem;

    /// Returns the wrapped item mutably.
    fn item_mut(&mut self) -> &mut InternalTestItem;
}

impl CollectionNode for InternalTestItem {
    fn from_item(item: InternalTestItem) -> Self {
        item
    }

    fn item(&self) -> &InternalTestItem {
        self
    }

    fn item_mut(&mut self) -> &mut InternalTestItem {
        self
    }
}

/// A node in an [`IncrementalTestCollection`]: the payload plus the IDs of its
/// children.
#[derive(Clone, Debug)]
pub struct IncrementalNode<N> {
    payload: N,
    children: IndexSet<TestId>,
    retired: bool,
}

impl<N: CollectionNode> IncrementalNode<N> {
    /// Returns the node's payload.
    pub fn payload(&self) -> &N {
        &self.payload
    }

    pub(crate) fn payload_mut(&mut self) -> &mut N {
        &mut self.payload
    }

    /// Returns the node's item.
    pub fn item(&self) -> &InternalTestItem {
        self.payload.item()
    }

    /// Returns the node's ID.
    pub fn id(&self) -> &TestId {
        self.payload.item().id()
    }

    /// Iterates over the IDs of the node's children, in the order they were
    /// added.
    pub fn children(&self) -> impl ExactSizeIterator<Item = &TestId> + '_ {
        self.children.iter()
    }

    /// Returns true if a `RetireTest` operation has been applied to the node.
    pub fn is_retired(&self) -> bool {
        self.retired
    }
}

/// Observes the effect of each operation while a diff is applied.
///
/// Every method has an empty default, so implementors only override what they
/// care about.
pub trait ChangeCollector<N> {
    /// Called after a node was added.
    fn add(&mut self, _node: &IncrementalNode<N>) {}

    /// Called after a node was updated.
    fn update(&mut self, _node: &IncrementalNode<N>) {}

    /// Called for each node removed. `is_nested` is true for descendants of
    /// the node the `Remove` named.
    fn remove(&mut self, _node: &IncrementalNode<N>, _is_nested: bool) {}

    /// Called after a node was retired.
    fn retire(&mut self, _node: &IncrementalNode<N>) {}

    /// Called once after the whole diff was applied.
    fn complete(&mut self) {}
}

/// A [`ChangeCollector`] that ignores every change.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopCollector;

impl<N> ChangeCollector<N> for NoopCollector {}

/// A tree of test items maintained by applying diffs.
///
/// Diffs are the only way to mutate the tree. Operations that refer to
/// unknown IDs are dropped, leaving the tree as it was.
#[derive(Clone, Debug)]
pub struct IncrementalTestCollection<N> {
    items: HashMap<TestId, IncrementalNode<N>>,
    roots: IndexSet<TestId>,
    busy_count: usize,
    pending_root_count: u32,
}

impl<N> Default for IncrementalTestCollection<N> {
    fn default() -> Self {
        Self {
            items: HashMap::new(),
            roots: IndexSet::new(),
            busy_count: 0,
            pending_root_count: 0,
        }
    }
}

impl<N: CollectionNode> IncrementalTestCollection<N> {
    /// Creates an empty collection.
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies a diff, discarding change notifications.
    pub fn apply(&mut self, diff: &[TestDiffOp]) {
        self.apply_with(diff, &mut NoopCollector);
    }

    /// Applies a diff, reporting each change to `collector`.
    pub fn apply_with(&mut self, diff: &[TestDiffOp], collector: &mut impl ChangeCollector<N>) {
        for op in diff {
            match op {
                TestDiffOp::Add { item } => self.add(item, collector),
                TestDiffOp::Update { item } => self.update(item, collector),
                TestDiffOp::Remove { item_id } => self.remove(item_id, collector),
                TestDiffOp::IncrementPendingExtHosts { amount } => {
                    self.increment_pending_root_count(*amount)
                }
                TestDiffOp::RetireTest { test_id } => self.retire(test_id, collector),
            }
        }
        collector.complete();
    }

    /// Returns the node with the given ID.
    pub fn get(&self, id: &TestId) -> Option<&IncrementalNode<N>> {
        self.items.get(id)
    }

    pub(crate) fn get_mut(&mut self, id: &TestId) -> Option<&mut IncrementalNode<N>> {
        self.items.get_mut(id)
    }

    /// Returns true if the collection contains `id`.
    pub fn contains(&self, id: &TestId) -> bool {
        self.items.contains_key(id)
    }

    /// Iterates over the IDs of root nodes, in the order they were added.
    pub fn root_ids(&self) -> impl ExactSizeIterator<Item = &TestId> + '_ {
        self.roots.iter()
    }

    /// Returns the number of nodes.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Returns true if the collection has no nodes.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Returns the number of nodes currently reporting
    /// [`TestItemExpandState::BusyExpanding`].
    pub fn busy_count(&self) -> usize {
        self.busy_count
    }

    /// Returns the number of controllers that have not finished publishing
    /// their roots.
    pub fn pending_root_count(&self) -> u32 {
        self.pending_root_count
    }

    /// Iterates over every node, roots first, breadth-first.
    pub fn iter_breadth_first(&self) -> BreadthFirst<'_, N> {
        BreadthFirst {
            collection: self,
            queue: self.roots.iter().collect(),
        }
    }

    /// Removes every node, returning the diff that would have the same effect.
    pub fn clear(&mut self) -> Vec<TestDiffOp> {
        let ops = self
            .roots
            .iter()
            .map(|id| TestDiffOp::Remove {
                item_id: id.clone(),
            })
            .collect();
        self.items.clear();
        self.roots.clear();
        self.busy_count = 0;
        ops
    }

    fn add(&mut self, item: &InternalTestItem, collector: &mut impl ChangeCollector<N>) {
        let id = item.id().clone();

        if let Some(existing) = self.items.get_mut(&id) {
            // A repeated add replaces the payload but keeps the subtree.
            if existing.item().expand == TestItemExpandState::BusyExpanding {
                self.busy_count -= 1;
            }
            existing.payload = N::from_item(item.clone());
            if item.expand == TestItemExpandState::BusyExpanding {
                self.busy_count += 1;
            }
            collector.update(existing);
            return;
        }

        match &item.parent {
            None => {
                self.roots.insert(id.clone());
            }
            Some(parent_id) => match self.items.get_mut(parent_id) {
                Some(parent) => {
                    parent.children.insert(id.clone());
                }
                None => {
                    debug!(
                        test_id = %id.display_path(),
                        parent = %parent_id.display_path(),
                        "ignoring add for test whose parent is unknown",
                    );
                    return;
                }
            },
        }

        if item.expand == TestItemExpandState::BusyExpanding {
            self.busy_count += 1;
        }
        let node = IncrementalNode {
            payload: N::from_item(item.clone()),
            children: IndexSet::new(),
            retired: false,
        };
        collector.add(&node);
        self.items.insert(id, node);
    }

    fn update(&mut self, update: &TestItemUpdate, collector: &mut impl ChangeCollector<N>) {
        let Some(node) = self.items.get_mut(&update.ext_id) else {
            debug!(
                test_id = %update.ext_id.display_path(),
                "ignoring update for unknown test",
            );
            return;
        };

        if let Some(expand) = update.expand {
            if node.item().expand == TestItemExpandState::BusyExpanding {
                self.busy_count -= 1;
            }
            if expand == TestItemExpandState::BusyExpanding {
                self.busy_count += 1;
            }
        }
        update.apply_to(node.payload.item_mut());
        collector.update(node);
    }

    fn remove(&mut self, id: &TestId, collector: &mut impl ChangeCollector<N>) {
        let Some(node) = self.items.remove(id) else {
            debug!(test_id = %id.display_path(), "ignoring removal of unknown test");
            return;
        };

        match &node.item().parent {
            Some(parent_id) => {
                if let Some(parent) = self.items.get_mut(parent_id) {
                    parent.children.shift_remove(id);
                }
            }
            None => {
                self.roots.shift_remove(id);
            }
        }

        let mut queue = VecDeque::from([(node, false)]);
        while let Some((node, is_nested)) = queue.pop_front() {
            if node.item().expand == TestItemExpandState::BusyExpanding {
                self.busy_count -= 1;
            }
            collector.remove(&node, is_nested);
            for child_id in &node.children {
                if let Some(child) = self.items.remove(child_id) {
                    queue.push_back((child, true));
                }
            }
        }
    }

    fn retire(&mut self, id: &TestId, collector: &mut impl ChangeCollector<N>) {
        match self.items.get_mut(id) {
            Some(node) => {
                node.retired = true;
                collector.retire(node);
            }
            None => {
                debug!(test_id = %id.display_path(), "ignoring retirement of unknown test");
            }
        }
    }

    fn increment_pending_root_count(&mut self, amount: i32) {
        let next = i64::from(self.pending_root_count) + i64::from(amount);
        if next < 0 {
            error!(
                current = self.pending_root_count,
                amount, "pending root count would become negative, clamping to zero",
            );
        }
        self.pending_root_count = u32::try_from(next.max(0)).unwrap_or(u32::MAX);
    }
}

/// Breadth-first iterator returned by
/// [`IncrementalTestCollection::iter_breadth_first`].
#[derive(Debug)]
pub struct BreadthFirst<'a, N> {
    collection: &'a IncrementalTestCollection<N>,
    queue: VecDeque<&'a TestId>,
}

impl<'a, N: CollectionNode> Iterator for BreadthFirst<'a, N> {
    type Item = &'a IncrementalNode<N>;

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(id) = self.queue.pop_front() {
            if let Some(node) = self.collection.items.get(id) {
                self.queue.extend(node.children.iter());
                return Some(node);
            }
        }
        None
    }
}
