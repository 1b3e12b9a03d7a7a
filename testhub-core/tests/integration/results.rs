// Copyright (c) The testhub Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::fixtures::test_init;
use camino_tempfile::Utf8TempDir;
use chrono::{DateTime, TimeZone, Utc};
use color_eyre::eyre::{Result, eyre};
use pretty_assertions::assert_eq;
use std::{sync::Arc, time::Duration};
use testhub_core::{
    config::ResultsConfig,
    profiles::TestProfileRegistry,
    result::ResultRef,
    result_service::TestResultService,
    storage::{FileResultStorage, MemoryResultStorage, TestResultStorage},
};
use testhub_metadata::{ResolvedTestRunRequest, TestId, TestItem, TestResultState, TestRunTask};

fn at(secs: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_opt(secs, 0)
        .single()
        .ok_or_else(|| eyre!("invalid timestamp {secs}"))
}

fn new_service(retain_max: usize, storage: Arc<dyn TestResultStorage>) -> TestResultService {
    test_init();
    let config = ResultsConfig {
        retain_max,
        persist_delay: Duration::from_millis(10),
    };
    TestResultService::new(config, storage, Arc::new(TestProfileRegistry::new()))
}

fn ids(results: &[ResultRef]) -> Vec<String> {
    results.iter().map(|result| result.id().to_owned()).collect()
}

#[tokio::test]
async fn live_results_lead_and_completed_sort_newest_first() -> Result<()> {
    let service = new_service(8, Arc::new(MemoryResultStorage::new()));
    let first = service.create_live_result(ResolvedTestRunRequest::default());
    let second = service.create_live_result(ResolvedTestRunRequest::default());
    let third = service.create_live_result(ResolvedTestRunRequest::default());

    // Completion order differs from completion time.
    third.mark_complete_at(at(10)?);
    first.mark_complete_at(at(30)?);

    assert_eq!(
        ids(&service.results()),
        vec![
            second.id().to_owned(),
            first.id().to_owned(),
            third.id().to_owned(),
        ]
    );
    assert!(service.is_running().get());

    second.mark_complete_at(at(20)?);
    assert_eq!(
        ids(&service.results()),
        vec![
            first.id().to_owned(),
            second.id().to_owned(),
            third.id().to_owned(),
        ]
    );
    assert!(!service.is_running().get());
    Ok(())
}

#[tokio::test]
async fn retention_drops_the_oldest_completed_results() -> Result<()> {
    let service = new_service(2, Arc::new(MemoryResultStorage::new()));
    let mut completed = Vec::new();
    for secs in [10, 20, 30] {
        let result = service.create_live_result(ResolvedTestRunRequest::default());
        result.mark_complete_at(at(secs)?);
        completed.push(result.id().to_owned());
    }
    assert_eq!(
        ids(&service.results()),
        vec![completed[2].clone(), completed[1].clone()]
    );

    // Runs in progress count towards the limit but are never evicted.
    let live = service.create_live_result(ResolvedTestRunRequest::default());
    assert_eq!(
        ids(&service.results()),
        vec![live.id().to_owned(), completed[2].clone()]
    );
    Ok(())
}

#[tokio::test]
async fn clear_keeps_results_in_progress() -> Result<()> {
    let service = new_service(8, Arc::new(MemoryResultStorage::new()));
    let done = service.create_live_result(ResolvedTestRunRequest::default());
    done.mark_complete_at(at(10)?);
    let live = service.create_live_result(ResolvedTestRunRequest::default());

    service.clear();
    assert_eq!(ids(&service.results()), vec![live.id().to_owned()]);
    assert!(service.has_any_results().get());

    live.mark_complete();
    service.clear();
    assert!(service.results().is_empty());
    assert!(!service.has_any_results().get());
    Ok(())
}

#[tokio::test]
async fn results_survive_a_restart() -> Result<()> {
    let dir = Utf8TempDir::new()?;
    let store_dir = dir.path().join("store");

    let storage = Arc::new(FileResultStorage::new(&store_dir, 8)?);
    let service = new_service(8, storage.clone());
    let result = service.create_live_result(ResolvedTestRunRequest::default());

    let root = TestId::root("ctrl");
    let test = root.join("works");
    result.add_task(TestRunTask {
        id: "task".to_owned(),
        name: None,
        running: true,
    });
    result.add_test_chain_to_run(
        "ctrl",
        &[
            TestItem::new(root.clone(), "ctrl"),
            TestItem::new(test.clone(), "works"),
        ],
    );
    result.update_state(&test, "task", TestResultState::Passed, None);
    result.append_output(b"\x1b[32mok\x1b[0m\n", Some("task"), None, Some(&test));
    result.mark_task_complete("task");
    result.mark_complete_at(at(100)?);
    service.persist_immediately().await;

    let restarted = new_service(8, Arc::new(FileResultStorage::new(&store_dir, 8)?));
    restarted.load().await;
    let results = restarted.results();
    assert_eq!(ids(&results), vec![result.id().to_owned()]);
    assert!(matches!(results[0], ResultRef::Historical(_)));
    assert_eq!(results[0].completed_at(), Some(at(100)?));
    assert_eq!(results[0].computed_state(&test), TestResultState::Passed);
    assert_eq!(results[0].computed_state(&root), TestResultState::Passed);

    let output = storage.read_output(result.id()).await?;
    assert_eq!(output.as_deref(), Some(&b"\x1b[32mok\x1b[0m\n"[..]));
    Ok(())
}
