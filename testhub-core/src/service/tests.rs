// Copyright (c) The testhub Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::*;
use crate::{
    errors::ControllerError,
    test_helpers::{
        FakeBehavior, FakeController, ServiceFixture, add_op, internal_item, profile, run_task,
        test_id, test_item,
    },
};
use pretty_assertions::assert_eq;
use std::time::Duration;
use testhub_metadata::{ProfileId, TestItemExpandState, TestResultState};

fn target(controller: &str, profile_id: u32, tests: &[&[&str]]) -> ResolvedTestRunTarget {
    ResolvedTestRunTarget {
        controller_id: controller.into(),
        profile_id: ProfileId(profile_id),
        profile_group: ProfileGroup::Run,
        test_ids: tests.iter().map(|parts| test_id(parts)).collect(),
    }
}

fn register(fixture: &ServiceFixture, id: &str) -> Arc<FakeController> {
    let controller = FakeController::new(id);
    fixture.service.register_test_controller(controller.clone());
    controller
}

#[tokio::test]
async fn untrusted_workspace_completes_without_running() {
    let fixture = ServiceFixture::new(false);
    let controller = register(&fixture, "a");

    let request = ResolvedTestRunRequest {
        targets: vec![target("a", 1, &[&["a", "t"]])],
        ..Default::default()
    };
    let result = fixture
        .service
        .run_resolved_tests(request, CancellationToken::none())
        .await;

    assert!(result.completed_at().is_some());
    assert!(result.tests().is_empty());
    assert!(controller.runs().is_empty());
    assert!(fixture.errors().is_empty());
}

#[tokio::test]
async fn dispatch_filters_excludes_per_target() {
    let fixture = ServiceFixture::new(true);
    let a = register(&fixture, "a");
    let b = register(&fixture, "b");

    let request = ResolvedTestRunRequest {
        targets: vec![
            target("a", 1, &[&["a", "x"]]),
            target("b", 1, &[&["b", "y"]]),
            target("a", 2, &[&["a", "z"]]),
        ],
        exclude: Some(vec![test_id(&["a", "x"]), test_id(&["b", "q"])]),
        ..Default::default()
    };
    let result = fixture
        .service
        .run_resolved_tests(request, CancellationToken::none())
        .await;

    let a_runs = a.runs();
    assert_eq!(a_runs.len(), 1, "one call per controller");
    assert_eq!(
        a_runs[0],
        vec![
            RunTestForControllerRequest {
                run_id: result.id().to_owned(),
                controller_id: "a".into(),
                profile_id: ProfileId(1),
                exclude_ext_ids: vec![test_id(&["b", "q"])],
                test_ids: vec![test_id(&["a", "x"])],
            },
            RunTestForControllerRequest {
                run_id: result.id().to_owned(),
                controller_id: "a".into(),
                profile_id: ProfileId(2),
                exclude_ext_ids: vec![test_id(&["a", "x"]), test_id(&["b", "q"])],
                test_ids: vec![test_id(&["a", "z"])],
            },
        ]
    );
    assert_eq!(b.runs()[0].len(), 1);
    assert!(result.completed_at().is_some());
    assert!(!fixture.service.results().is_running().get());

    fixture.service.results().persist_immediately().await;
    assert_eq!(fixture.storage.persisted()[0].id, result.id());
}

#[tokio::test]
async fn missing_exclude_uses_global_exclusions() {
    let fixture = ServiceFixture::new(true);
    let a = register(&fixture, "a");
    fixture
        .service
        .excluded()
        .toggle(&test_id(&["a", "slow"]), Some(true))
        .unwrap();

    let request = ResolvedTestRunRequest {
        targets: vec![target("a", 1, &[&["a"]])],
        ..Default::default()
    };
    let result = fixture
        .service
        .run_resolved_tests(request, CancellationToken::none())
        .await;

    assert_eq!(result.request().exclude, Some(vec![test_id(&["a", "slow"])]));
    assert_eq!(a.runs()[0][0].exclude_ext_ids, vec![test_id(&["a", "slow"])]);
}

#[tokio::test]
async fn controller_errors_are_reported_without_aborting_others() {
    let fixture = ServiceFixture::new(true);
    let failing = FakeController::new("bad")
        .with_run_behavior(FakeBehavior::ReportError("no such file".to_owned()));
    fixture.service.register_test_controller(failing);
    let broken = FakeController::new("gone")
        .with_run_behavior(FakeBehavior::Fail(ControllerError::Disconnected {
            controller_id: "gone".to_owned(),
        }));
    fixture.service.register_test_controller(broken);
    let good = register(&fixture, "good");

    let request = ResolvedTestRunRequest {
        targets: vec![
            target("bad", 1, &[&["bad"]]),
            target("gone", 1, &[&["gone"]]),
            target("good", 1, &[&["good"]]),
            target("unregistered", 1, &[&["unregistered"]]),
        ],
        ..Default::default()
    };
    let result = fixture
        .service
        .run_resolved_tests(request, CancellationToken::none())
        .await;

    assert!(result.completed_at().is_some());
    assert_eq!(good.runs().len(), 1);
    assert_eq!(
        fixture.errors(),
        vec![
            "An error occurred attempting to run tests: no such file".to_owned(),
            "An error occurred attempting to run tests: controller `gone` disconnected"
                .to_owned(),
        ]
    );
}

#[tokio::test]
async fn run_tests_prefers_group_defaults() {
    let fixture = ServiceFixture::new(true);
    let a = register(&fixture, "a");
    let b = register(&fixture, "b");
    fixture.profiles.add_profile(profile("a", 1, ProfileGroup::Run, true));
    fixture.profiles.add_profile(profile("a", 2, ProfileGroup::Run, false));
    fixture.profiles.add_profile(profile("b", 5, ProfileGroup::Debug, true));

    let request = AmbiguousRunTestsRequest {
        group: ProfileGroup::Run,
        tests: vec![
            internal_item(&["a", "x"], TestItemExpandState::NotExpandable),
            internal_item(&["b", "y"], TestItemExpandState::NotExpandable),
        ],
        exclude: None,
        is_auto_run: false,
    };
    let result = fixture
        .service
        .run_tests(request, CancellationToken::none())
        .await;

    assert_eq!(
        result.request().targets,
        vec![target("a", 1, &[&["a", "x"]])],
        "`b` has no run profile, and `a` covers at least one test"
    );
    assert_eq!(a.runs().len(), 1);
    assert!(b.runs().is_empty());
    assert!(result.request().is_ui_triggered);
}

#[tokio::test]
async fn run_tests_falls_back_to_controller_profiles() {
    let fixture = ServiceFixture::new(true);
    register(&fixture, "a");
    register(&fixture, "b");
    let mut tagged = profile("a", 1, ProfileGroup::Debug, true);
    tagged.tag = Some("gpu".to_owned());
    fixture.profiles.add_profile(tagged);
    fixture.profiles.add_profile(profile("a", 2, ProfileGroup::Debug, false));
    fixture.profiles.add_profile(profile("b", 3, ProfileGroup::Debug, false));
    // The user's only preferred debug profile can't run any of the tests.
    fixture
        .profiles
        .set_group_default_profiles(
            ProfileGroup::Debug,
            &[profile("a", 1, ProfileGroup::Debug, true)],
        );

    let request = AmbiguousRunTestsRequest {
        group: ProfileGroup::Debug,
        tests: vec![
            internal_item(&["a", "x"], TestItemExpandState::NotExpandable),
            internal_item(&["b", "y"], TestItemExpandState::NotExpandable),
            internal_item(&["a", "z"], TestItemExpandState::NotExpandable),
        ],
        exclude: Some(vec![internal_item(&["a", "skip"], TestItemExpandState::NotExpandable)]),
        is_auto_run: true,
    };
    let result = fixture
        .service
        .run_tests(request, CancellationToken::none())
        .await;

    let mut expected_a = target("a", 2, &[&["a", "x"], &["a", "z"]]);
    expected_a.profile_group = ProfileGroup::Debug;
    let mut expected_b = target("b", 3, &[&["b", "y"]]);
    expected_b.profile_group = ProfileGroup::Debug;
    assert_eq!(result.request().targets, vec![expected_a, expected_b]);
    assert_eq!(result.request().exclude, Some(vec![test_id(&["a", "skip"])]));
    assert!(result.request().is_auto_run);
}

#[tokio::test]
async fn cancel_test_run_cancels_dispatched_runs() {
    let fixture = ServiceFixture::new(true);
    let controller =
        FakeController::new("a").with_run_behavior(FakeBehavior::WaitForCancel);
    fixture.service.register_test_controller(controller.clone());

    let cancelled = Arc::new(Mutex::new(Vec::new()));
    let cancelled2 = cancelled.clone();
    fixture
        .service
        .on_did_cancel_test_run(move |run_id| cancelled2.lock().unwrap().push(run_id.clone()));

    let service = fixture.service.clone();
    let run = tokio::spawn(async move {
        let request = ResolvedTestRunRequest {
            targets: vec![target("a", 1, &[&["a"]])],
            ..Default::default()
        };
        service
            .run_resolved_tests(request, CancellationToken::none())
            .await
    });
    while controller.runs().is_empty() {
        tokio::task::yield_now().await;
    }
    assert!(fixture.service.results().is_running().get());

    fixture.service.cancel_test_run(Some("not-a-run"));
    fixture.service.cancel_test_run(None);
    let result = tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .expect("run finished after cancellation")
        .unwrap();

    assert!(result.completed_at().is_some());
    assert_eq!(
        *cancelled.lock().unwrap(),
        vec![Some("not-a-run".to_owned()), None]
    );
}

#[tokio::test]
async fn caller_token_cancels_run() {
    let fixture = ServiceFixture::new(true);
    let controller =
        FakeController::new("a").with_run_behavior(FakeBehavior::WaitForCancel);
    fixture.service.register_test_controller(controller);

    let source = CancellationSource::new();
    source.cancel();
    let request = ResolvedTestRunRequest {
        targets: vec![target("a", 1, &[&["a"]])],
        ..Default::default()
    };
    let result = fixture.service.run_resolved_tests(request, source.token()).await;
    assert!(result.completed_at().is_some());
}

#[tokio::test]
async fn dropping_a_run_still_completes_it() {
    let fixture = ServiceFixture::new(true);
    let controller =
        FakeController::new("a").with_run_behavior(FakeBehavior::WaitForCancel);
    fixture.service.register_test_controller(controller.clone());

    let service = fixture.service.clone();
    let run = tokio::spawn(async move {
        let request = ResolvedTestRunRequest {
            targets: vec![target("a", 1, &[&["a"]])],
            ..Default::default()
        };
        service
            .run_resolved_tests(request, CancellationToken::none())
            .await
    });
    while controller.runs().is_empty() {
        tokio::task::yield_now().await;
    }
    run.abort();
    _ = run.await;

    let run_id = controller.runs()[0][0].run_id.clone();
    let result = fixture.service.results().get_result(&run_id).unwrap();
    assert!(result.completed_at().is_some());
    assert!(!fixture.service.results().is_running().get());
}

#[test]
fn registration_tracks_counts_and_removes_roots() {
    let fixture = ServiceFixture::new(true);
    let a = register(&fixture, "a");
    register(&fixture, "b");
    assert_eq!(fixture.service.provider_count().get(), 2);
    assert!(!fixture.service.can_refresh().get());

    a.can_refresh().set(true);
    assert!(fixture.service.can_refresh().get());

    fixture.service.publish_diff(
        "a",
        vec![
            add_op(&["a"], TestItemExpandState::Expanded),
            add_op(&["a", "x"], TestItemExpandState::NotExpandable),
        ],
    );
    fixture
        .service
        .publish_diff("b", vec![add_op(&["b"], TestItemExpandState::Expandable)]);

    let removals = Arc::new(Mutex::new(Vec::new()));
    let removals2 = removals.clone();
    fixture.service.on_did_process_diff(move |diff| {
        removals2.lock().unwrap().extend(diff.iter().cloned());
    });

    assert!(fixture.service.unregister_test_controller("a"));
    assert!(!fixture.service.unregister_test_controller("a"));
    assert_eq!(
        *removals.lock().unwrap(),
        vec![TestDiffOp::Remove {
            item_id: test_id(&["a"]),
        }]
    );
    assert_eq!(fixture.service.collection().root_ids(), vec![test_id(&["b"])]);
    assert_eq!(fixture.service.collection().len(), 1);
    assert_eq!(fixture.service.provider_count().get(), 1);
    assert!(!fixture.service.can_refresh().get());

    // The listener on the removed controller is gone.
    a.can_refresh().set(false);
    a.can_refresh().set(true);
    assert!(!fixture.service.can_refresh().get());
}

#[tokio::test]
async fn refresh_tracks_and_cancels() {
    let fixture = ServiceFixture::new(true);
    let a = register(&fixture, "a");
    let b = register(&fixture, "b");
    *a.refresh_behavior.lock().unwrap() = FakeBehavior::WaitForCancel;

    let service = fixture.service.clone();
    let refresh = tokio::spawn(async move { service.refresh_tests(None).await });
    while b.refreshes.load(std::sync::atomic::Ordering::SeqCst) == 0 {
        tokio::task::yield_now().await;
    }
    assert!(fixture.service.is_refreshing().get());

    fixture.service.cancel_refresh_tests();
    assert!(!fixture.service.is_refreshing().get());
    tokio::time::timeout(Duration::from_secs(5), refresh)
        .await
        .expect("refresh finished after cancellation")
        .unwrap();
    assert!(!fixture.service.is_refreshing().get());
    assert_eq!(a.refreshes.load(std::sync::atomic::Ordering::SeqCst), 1);
}

#[tokio::test]
async fn refresh_failures_are_reported() {
    let fixture = ServiceFixture::new(true);
    let a = register(&fixture, "a");
    let b = register(&fixture, "b");
    *a.refresh_behavior.lock().unwrap() =
        FakeBehavior::Fail(ControllerError::failed("a", "timed out"));

    fixture.service.refresh_tests(Some("b")).await;
    assert_eq!(a.refreshes.load(std::sync::atomic::Ordering::SeqCst), 0);
    assert_eq!(b.refreshes.load(std::sync::atomic::Ordering::SeqCst), 1);
    assert!(fixture.errors().is_empty());

    fixture.service.refresh_tests(None).await;
    assert_eq!(
        fixture.errors(),
        vec!["An error occurred attempting to refresh tests: controller `a` failed: timed out"
            .to_owned()]
    );
    assert!(!fixture.service.is_refreshing().get());
}

#[tokio::test]
async fn collection_expands_through_owning_controller() {
    let fixture = ServiceFixture::new(true);
    let a = register(&fixture, "a");
    fixture
        .service
        .publish_diff("a", vec![add_op(&["a"], TestItemExpandState::Expandable)]);

    fixture.service.collection().expand(&test_id(&["a"]), 2).await;
    fixture.service.collection().expand(&test_id(&["a"]), 1).await;
    assert_eq!(*a.expands.lock().unwrap(), vec![(test_id(&["a"]), 2)]);
    assert_eq!(fixture.service.collection().expanded_level(&test_id(&["a"])), Some(2));

    // Tests of unregistered controllers are silently skipped.
    fixture.service.expand_test(&test_id(&["zzz", "x"]), 1).await;
}

#[test]
fn retire_ops_reach_live_results() {
    let fixture = ServiceFixture::new(true);
    let live = fixture
        .service
        .results()
        .create_live_result(ResolvedTestRunRequest::default());
    live.add_task(run_task("t"));
    live.add_test_chain_to_run("a", &[test_item(&["a"]), test_item(&["a", "x"])]);
    live.update_state(&test_id(&["a", "x"]), "t", TestResultState::Passed, None);

    let order = Arc::new(Mutex::new(Vec::new()));
    let will = order.clone();
    fixture
        .service
        .on_will_process_diff(move |_| will.lock().unwrap().push("will"));
    let did = order.clone();
    fixture
        .service
        .on_did_process_diff(move |_| did.lock().unwrap().push("did"));

    fixture.service.publish_diff(
        "a",
        vec![TestDiffOp::RetireTest {
            test_id: test_id(&["a", "x"]),
        }],
    );

    assert!(live.get_state_by_id(&test_id(&["a", "x"])).unwrap().retired);
    assert!(!live.get_state_by_id(&test_id(&["a"])).unwrap().retired);
    assert_eq!(*order.lock().unwrap(), vec!["will", "did"]);
}

#[test]
fn diff_subscribers_receive_the_current_tree_first() {
    let fixture = ServiceFixture::new(true);
    fixture.service.publish_diff(
        "a",
        vec![
            TestDiffOp::IncrementPendingExtHosts { amount: 1 },
            add_op(&["a"], TestItemExpandState::Expanded),
        ],
    );

    let received = Arc::new(Mutex::new(Vec::new()));
    let received2 = received.clone();
    let id = fixture
        .service
        .subscribe_to_diffs(move |diff| received2.lock().unwrap().push(diff.clone()));
    fixture.service.publish_diff(
        "a",
        vec![add_op(&["a", "x"], TestItemExpandState::NotExpandable)],
    );
    assert!(fixture.service.unsubscribe_from_diffs(id));
    fixture
        .service
        .publish_diff("a", vec![TestDiffOp::Remove { item_id: test_id(&["a"]) }]);

    assert_eq!(
        *received.lock().unwrap(),
        vec![
            vec![
                TestDiffOp::IncrementPendingExtHosts { amount: 1 },
                add_op(&["a"], TestItemExpandState::Expanded),
            ],
            vec![add_op(&["a", "x"], TestItemExpandState::NotExpandable)],
        ]
    );
}
