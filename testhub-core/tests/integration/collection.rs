// Copyright (c) The testhub Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::fixtures::*;
use color_eyre::eyre::Result;
use pretty_assertions::assert_eq;
use std::sync::{Arc, Mutex};
use testhub_core::{
    collection::IncrementalTestCollection, config::ResultsConfig, storage::MemoryResultStorage,
};
use testhub_metadata::{InternalTestItem, TestDiffOp, TestItemExpandState};

fn harness() -> Result<Harness> {
    Harness::new(
        true,
        ResultsConfig::default(),
        Arc::new(MemoryResultStorage::new()),
    )
}

#[tokio::test]
async fn concurrent_expansions_share_one_request() -> Result<()> {
    let harness = harness()?;
    let controller = RecordingController::new("ctrl");
    harness.service.register_test_controller(controller.clone());
    harness.service.publish_diff(
        "ctrl",
        vec![add(&["ctrl"], TestItemExpandState::Expandable)],
    );

    let root = test_id(&["ctrl"]);
    futures::join!(
        harness.service.collection().expand(&root, 2),
        harness.service.collection().expand(&root, 1),
    );
    assert_eq!(controller.expand_count(), 1);

    // A finished expansion at least as deep satisfies later requests.
    harness.service.collection().expand(&root, 1).await;
    assert_eq!(controller.expand_count(), 1);
    assert_eq!(harness.service.collection().expanded_level(&root), Some(2));

    harness.service.collection().expand(&root, 3).await;
    assert_eq!(controller.expand_count(), 2);
    assert_eq!(harness.service.collection().expanded_level(&root), Some(3));

    // Unknown tests resolve without asking anyone.
    harness.service.collection().expand(&test_id(&["ctrl", "nope"]), 1).await;
    assert_eq!(controller.expand_count(), 2);
    Ok(())
}

#[test]
fn late_subscribers_replay_the_tree() -> Result<()> {
    let harness = harness()?;
    harness.service.publish_diff(
        "ctrl",
        vec![
            TestDiffOp::IncrementPendingExtHosts { amount: 2 },
            add(&["ctrl"], TestItemExpandState::Expanded),
            add(&["ctrl", "a"], TestItemExpandState::Expandable),
            add(&["ctrl", "b"], TestItemExpandState::NotExpandable),
            add(&["ctrl", "a", "x"], TestItemExpandState::NotExpandable),
            TestDiffOp::IncrementPendingExtHosts { amount: -1 },
        ],
    );

    let replica = Arc::new(Mutex::new(IncrementalTestCollection::<InternalTestItem>::new()));
    let subscriber = replica.clone();
    harness
        .service
        .subscribe_to_diffs(move |diff| subscriber.lock().unwrap().apply(diff));

    harness.service.publish_diff(
        "other",
        vec![add(&["other"], TestItemExpandState::NotExpandable)],
    );
    harness.service.publish_diff(
        "ctrl",
        vec![TestDiffOp::Remove {
            item_id: test_id(&["ctrl", "b"]),
        }],
    );

    let replica = replica.lock().unwrap();
    let collection = harness.service.collection();
    assert_eq!(replica.len(), collection.len());
    assert_eq!(replica.pending_root_count(), collection.pending_root_count());
    assert_eq!(
        replica.root_ids().cloned().collect::<Vec<_>>(),
        collection.root_ids()
    );
    for node in collection.all() {
        let copy = replica
            .get(node.item.id())
            .expect("replica has every node");
        assert_eq!(copy.item(), &node.item);
        assert_eq!(copy.children().cloned().collect::<Vec<_>>(), node.children);
    }
    Ok(())
}
