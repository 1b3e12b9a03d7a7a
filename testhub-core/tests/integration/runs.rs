// Copyright (c) The testhub Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::fixtures::*;
use color_eyre::eyre::{Result, ensure};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use testhub_core::{
    cancel::CancellationToken,
    config::ResultsConfig,
    exclusions::TestExclusions,
    profiles::TestProfileService,
    service::AmbiguousRunTestsRequest,
    storage::{MemoryResultStorage, StateStorage},
};
use testhub_metadata::{ProfileGroup, TestItemExpandState};

fn publish_tree(harness: &Harness) {
    harness.service.publish_diff(
        "ctrl",
        vec![
            add(&["ctrl"], TestItemExpandState::Expanded),
            add(&["ctrl", "a"], TestItemExpandState::NotExpandable),
            add(&["ctrl", "b"], TestItemExpandState::NotExpandable),
        ],
    );
}

fn run_root() -> AmbiguousRunTestsRequest {
    AmbiguousRunTestsRequest {
        group: ProfileGroup::Run,
        tests: vec![internal_item(&["ctrl"], TestItemExpandState::Expanded)],
        exclude: None,
        is_auto_run: false,
    }
}

#[tokio::test]
async fn untrusted_workspaces_never_reach_controllers() -> Result<()> {
    let harness = Harness::new(
        false,
        ResultsConfig::default(),
        Arc::new(MemoryResultStorage::new()),
    )?;
    let controller = RecordingController::new("ctrl");
    harness.service.register_test_controller(controller.clone());
    harness.profiles.add_profile(run_profile("ctrl", 1));
    publish_tree(&harness);

    let result = harness
        .service
        .run_tests(run_root(), CancellationToken::none())
        .await;

    ensure!(
        result.completed_at().is_some(),
        "result is completed even though nothing ran"
    );
    assert_eq!(controller.runs().len(), 0);
    assert!(!harness.service.results().is_running().get());
    Ok(())
}

#[tokio::test]
async fn exclusions_persist_and_apply_to_runs() -> Result<()> {
    let harness = Harness::new(
        true,
        ResultsConfig::default(),
        Arc::new(MemoryResultStorage::new()),
    )?;
    let controller = RecordingController::new("ctrl");
    harness.service.register_test_controller(controller.clone());
    harness.profiles.add_profile(run_profile("ctrl", 1));
    publish_tree(&harness);

    let excluded = test_id(&["ctrl", "b"]);
    assert!(harness.service.excluded().toggle(&excluded, None)?);

    let reloaded = TestExclusions::load(harness.state.clone() as Arc<dyn StateStorage>)?;
    assert_eq!(reloaded.all(), vec![excluded.clone()]);

    harness
        .service
        .run_tests(run_root(), CancellationToken::none())
        .await;
    let runs = controller.runs();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0][0].test_ids, vec![test_id(&["ctrl"])]);
    assert_eq!(runs[0][0].exclude_ext_ids, vec![excluded.clone()]);

    // Toggling again removes it, both here and in storage.
    assert!(harness.service.excluded().toggle(&excluded, None)?);
    let reloaded = TestExclusions::load(harness.state.clone() as Arc<dyn StateStorage>)?;
    assert!(!reloaded.has_any());
    Ok(())
}
