//! Task lifecycle against a scripted engine.

mod common;

use std::sync::Arc;

use serde_json::json;

use common::{ENV_ID, Fixture, ScriptedEngine, eventually, write_file};
use drover_task::{TaskError, TaskManager};
use drover_types::{InfoKey, OutputValue, ProgressKey, TaskStatus};

use TaskStatus::{Aborted, Completed, Failed, Queued, Running};

fn has(manager: &TaskManager, key: ProgressKey) -> bool {
    manager
        .store()
        .read_now(|db| db.progress().has(key))
        .unwrap()
}

// ─────────────────────────────────────────────────────────────────────────────
// Creation
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn from_workflow_records_task_and_materializes() {
    let fx = Fixture::new(ScriptedEngine::new(&[Completed]));
    let graph = fx.graph();

    let manager = TaskManager::from_workflow(&fx.ctx, &graph, ENV_ID, None)
        .await
        .unwrap();

    assert_eq!(fx.translator_calls(), 1);
    assert!(has(&manager, ProgressKey::DirectoryScaffolded));
    assert!(has(&manager, ProgressKey::WorkflowMaterialized));
    assert!(!has(&manager, ProgressKey::Submitted));
    assert_eq!(manager.status().unwrap(), TaskStatus::Processing);

    let record = manager
        .store()
        .read_now(|db| db.metadata().task())
        .unwrap()
        .unwrap();
    assert_eq!(record.environment.as_deref(), Some(ENV_ID));
    assert_eq!(record.engine_id.as_deref(), Some("scripted"));
    assert_eq!(record.name.as_deref(), Some("hello"));
    assert!(!record.validating);

    let inputs = manager
        .store()
        .read_now(|db| db.inputs().get_all())
        .unwrap();
    assert_eq!(inputs.len(), 2);
    assert_eq!(inputs["name"], json!("world"));

    let latest = manager
        .store()
        .read_now(|db| db.versions().latest("drover"))
        .unwrap();
    assert_eq!(latest.as_deref(), Some(env!("CARGO_PKG_VERSION")));
    let engine_version = manager
        .store()
        .read_now(|db| db.versions().latest("scripted"))
        .unwrap();
    assert_eq!(engine_version.as_deref(), Some("scripted-1"));

    let layout = manager.layout();
    assert!(layout.workflow_snapshot_path().is_file());
    assert!(layout.workflow_dir().join("hello.cwl").is_file());
    assert!(layout.materialized_path().is_file());
}

#[tokio::test]
async fn unknown_environment_at_creation() {
    let fx = Fixture::new(ScriptedEngine::new(&[]));
    let err = TaskManager::from_workflow(&fx.ctx, &fx.graph(), "mars", None)
        .await
        .unwrap_err();
    assert!(matches!(err, TaskError::UnknownEnvironment(id) if id == "mars"));
}

#[tokio::test]
async fn unknown_environment_on_resume() {
    let fx = Fixture::new(ScriptedEngine::new(&[]));
    let manager = TaskManager::from_workflow(&fx.ctx, &fx.graph(), ENV_ID, None)
        .await
        .unwrap();

    let bare = fx.context_without_environments();
    let err = TaskManager::from_existing_tid(&bare, manager.tid())
        .await
        .unwrap_err();
    assert!(matches!(err, TaskError::UnknownEnvironment(id) if id == ENV_ID));
}

#[tokio::test]
async fn missing_task_is_not_found() {
    let fx = Fixture::new(ScriptedEngine::new(&[]));
    let err = TaskManager::from_existing_tid(&fx.ctx, "nope")
        .await
        .unwrap_err();
    assert!(matches!(err, TaskError::NotFound(_)));
}

// ─────────────────────────────────────────────────────────────────────────────
// Resume
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn resume_after_materialize_goes_straight_to_submission() {
    let fx = Fixture::new(ScriptedEngine::new(&[Running, Completed]));
    let tid = TaskManager::from_workflow(&fx.ctx, &fx.graph(), ENV_ID, None)
        .await
        .unwrap()
        .tid()
        .to_string();
    assert_eq!(fx.translator_calls(), 1);

    // A fresh process picks the task up.
    let manager = TaskManager::from_existing_tid(&fx.ctx, &tid).await.unwrap();
    assert_eq!(manager.resume().await.unwrap(), Completed);

    assert_eq!(fx.translator_calls(), 1);
    assert_eq!(ScriptedEngine::count(&fx.engine.starts), 1);
}

#[tokio::test]
async fn missing_materialized_marker_translates_again() {
    let fx = Fixture::new(ScriptedEngine::new(&[Completed]));
    let manager = TaskManager::from_workflow(&fx.ctx, &fx.graph(), ENV_ID, None)
        .await
        .unwrap();
    manager
        .store()
        .write(|db| db.progress().clear(ProgressKey::WorkflowMaterialized))
        .unwrap();

    assert_eq!(manager.resume().await.unwrap(), Completed);
    assert_eq!(fx.translator_calls(), 2);
}

#[tokio::test]
async fn resume_of_finished_task_repeats_nothing() {
    let fx = Fixture::new(ScriptedEngine::new(&[Completed]));
    let manager = TaskManager::from_workflow(&fx.ctx, &fx.graph(), ENV_ID, None)
        .await
        .unwrap();
    manager.resume().await.unwrap();
    let polls = ScriptedEngine::count(&fx.engine.polls);

    let again = TaskManager::from_existing_tid(&fx.ctx, manager.tid())
        .await
        .unwrap();
    assert_eq!(again.resume().await.unwrap(), Completed);
    assert_eq!(ScriptedEngine::count(&fx.engine.starts), 1);
    assert_eq!(ScriptedEngine::count(&fx.engine.polls), polls);
    assert_eq!(ScriptedEngine::count(&fx.engine.output_fetches), 1);
}

// ─────────────────────────────────────────────────────────────────────────────
// Poll loop
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn happy_path_copies_outputs_and_saves_metadata() {
    let fx = Fixture::build(|src| {
        let report = write_file(src, "report.txt", "all good");
        let shard0 = write_file(src, "part0.csv", "a");
        let shard1 = write_file(src, "part1.csv", "b");
        ScriptedEngine::new(&[Queued, Running, Completed])
            .with_output("report", OutputValue::Single(report.display().to_string()))
            .with_output(
                "parts",
                OutputValue::Sharded(vec![
                    OutputValue::Single(shard0.display().to_string()),
                    OutputValue::Single(shard1.display().to_string()),
                ]),
            )
            .with_output("count", OutputValue::Value(json!(2)))
    });

    let manager = TaskManager::from_workflow(&fx.ctx, &fx.graph(), ENV_ID, None)
        .await
        .unwrap();
    assert_eq!(manager.resume().await.unwrap(), Completed);

    let outputs_dir = manager.layout().outputs_dir();
    assert_eq!(
        std::fs::read_to_string(outputs_dir.join("report.txt")).unwrap(),
        "all good"
    );
    assert_eq!(
        std::fs::read_to_string(outputs_dir.join("partsshard-0.csv")).unwrap(),
        "a"
    );
    assert_eq!(
        std::fs::read_to_string(outputs_dir.join("partsshard-1.csv")).unwrap(),
        "b"
    );

    for key in ProgressKey::ALL {
        assert!(has(&manager, key), "{key} not marked");
    }

    let meta = manager.metadata().await.unwrap();
    assert_eq!(meta.status, Completed);
    assert_eq!(meta.engine_tid.as_deref(), Some("run-0"));
    assert_eq!(meta.execution_dir.as_deref(), Some("/engine/run-0"));
    assert!(meta.finish.is_some());
    assert_eq!(meta.jobs.len(), 1);
    assert_eq!(meta.jobs[0].jobs.len(), 1);
    let report_record = meta.outputs.iter().find(|o| o.name == "report").unwrap();
    assert_eq!(
        report_record.copied_path.as_deref(),
        Some(outputs_dir.join("report.txt").as_path())
    );
    let count_record = meta.outputs.iter().find(|o| o.name == "count").unwrap();
    assert!(count_record.copied_path.is_none());

    let saved: serde_json::Value = serde_json::from_slice(
        &std::fs::read(manager.layout().final_metadata_path()).unwrap(),
    )
    .unwrap();
    assert_eq!(saved["status"], "completed");

    assert_eq!(fx.notifications(), vec![Queued, Running, Completed]);
}

#[tokio::test]
async fn repeated_status_notifies_once() {
    let fx = Fixture::new(ScriptedEngine::new(&[
        Running, Running, Running, Running, Completed,
    ]));
    let manager = TaskManager::from_workflow(&fx.ctx, &fx.graph(), ENV_ID, None)
        .await
        .unwrap();
    manager.resume().await.unwrap();

    assert_eq!(fx.notifications(), vec![Running, Completed]);
}

#[tokio::test]
async fn engine_observed_failure_is_a_status_not_an_error() {
    let fx = Fixture::new(
        ScriptedEngine::new(&[Running, Failed]).with_error("task 'say' returned 1"),
    );
    let manager = TaskManager::from_workflow(&fx.ctx, &fx.graph(), ENV_ID, None)
        .await
        .unwrap();

    assert_eq!(manager.resume().await.unwrap(), Failed);
    assert_eq!(ScriptedEngine::count(&fx.engine.output_fetches), 0);
    assert!(!has(&manager, ProgressKey::OutputsCopied));
    assert!(has(&manager, ProgressKey::MetadataSaved));

    let error = manager
        .store()
        .read_now(|db| db.metadata().get(InfoKey::Error))
        .unwrap();
    assert_eq!(error.as_deref(), Some("task 'say' returned 1"));
    assert_eq!(fx.notifications(), vec![Running, Failed]);
}

#[tokio::test]
async fn unreachable_engine_fails_after_consecutive_polls() {
    let fx = Fixture::new(ScriptedEngine::new(&[Running]));
    fx.engine.set_unreachable(true);
    let manager = TaskManager::from_workflow(&fx.ctx, &fx.graph(), ENV_ID, None)
        .await
        .unwrap();

    assert_eq!(manager.resume().await.unwrap(), Failed);
    assert_eq!(ScriptedEngine::count(&fx.engine.polls), 3);

    let error = manager
        .store()
        .read_now(|db| db.metadata().get(InfoKey::Error))
        .unwrap()
        .unwrap();
    assert!(error.contains("unreachable after 3 consecutive polls"));
}

// ─────────────────────────────────────────────────────────────────────────────
// Submission
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn submission_failure_is_retryable() {
    let fx = Fixture::new(ScriptedEngine::new(&[Completed]));
    fx.engine.fail_next_starts(1);
    let manager = TaskManager::from_workflow(&fx.ctx, &fx.graph(), ENV_ID, None)
        .await
        .unwrap();

    let err = manager.resume().await.unwrap_err();
    assert!(err.is_retryable());
    assert!(matches!(err, TaskError::Engine(_)));
    assert!(has(&manager, ProgressKey::WorkflowMaterialized));
    assert!(!has(&manager, ProgressKey::Submitted));
    assert_eq!(manager.status().unwrap(), TaskStatus::Processing);

    assert_eq!(manager.resume().await.unwrap(), Completed);
    assert_eq!(ScriptedEngine::count(&fx.engine.starts), 2);
    assert_eq!(fx.translator_calls(), 1);
}

#[tokio::test]
async fn too_many_input_documents_rejected_before_start() {
    let fx = Fixture::new(ScriptedEngine::new(&[Completed]).with_max_inputs(0));
    let manager = TaskManager::from_workflow(&fx.ctx, &fx.graph(), ENV_ID, None)
        .await
        .unwrap();

    let err = manager.resume().await.unwrap_err();
    assert!(!err.is_retryable());
    assert_eq!(ScriptedEngine::count(&fx.engine.starts), 0);
}

// ─────────────────────────────────────────────────────────────────────────────
// Output copy
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn failed_copy_leaves_marker_unset_and_retry_recopies() {
    let fx = Fixture::build(|src| {
        let late = src.join("late.txt");
        ScriptedEngine::new(&[Completed])
            .with_output("late", OutputValue::Single(late.display().to_string()))
    });
    let late = fx.sources.path().join("late.txt");

    let manager = TaskManager::from_workflow(&fx.ctx, &fx.graph(), ENV_ID, None)
        .await
        .unwrap();
    let err = manager.resume().await.unwrap_err();
    assert!(matches!(err, TaskError::Copy(_)));
    assert_eq!(manager.status().unwrap(), Completed);
    assert!(!has(&manager, ProgressKey::OutputsCopied));
    assert!(!manager.layout().outputs_dir().join("late.txt").exists());

    std::fs::write(&late, "finally").unwrap();
    assert_eq!(manager.resume().await.unwrap(), Completed);
    assert!(has(&manager, ProgressKey::OutputsCopied));
    assert_eq!(
        std::fs::read_to_string(manager.layout().outputs_dir().join("late.txt")).unwrap(),
        "finally"
    );
    assert_eq!(ScriptedEngine::count(&fx.engine.starts), 1);
}

// ─────────────────────────────────────────────────────────────────────────────
// Abort
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn abort_wins_over_late_success() {
    let fx = Fixture::new(
        ScriptedEngine::new(&[Running]).with_output(
            "report",
            OutputValue::Single("/nonexistent/report.txt".into()),
        ),
    );
    let manager = Arc::new(
        TaskManager::from_workflow(&fx.ctx, &fx.graph(), ENV_ID, None)
            .await
            .unwrap(),
    );
    let tid = manager.tid().to_string();

    let running = manager.clone();
    let handle = tokio::spawn(async move { running.resume().await });

    let observer = TaskManager::from_existing_tid(&fx.ctx, &tid).await.unwrap();
    eventually(|| observer.status().is_ok_and(|s| s == Running)).await;

    // Abort from a second manager, as another process would.
    assert_eq!(observer.abort().await.unwrap(), Aborted);
    fx.engine.push(Completed);

    assert_eq!(handle.await.unwrap().unwrap(), Aborted);
    assert_eq!(manager.status().unwrap(), Aborted);
    assert_eq!(ScriptedEngine::count(&fx.engine.output_fetches), 0);
    assert!(ScriptedEngine::count(&fx.engine.terminates) >= 1);
    assert!(!has(&manager, ProgressKey::OutputsCopied));
    assert!(has(&manager, ProgressKey::MetadataSaved));
    assert_eq!(
        std::fs::read_dir(manager.layout().outputs_dir()).unwrap().count(),
        0
    );
    assert!(fx.notifications().contains(&Aborted));
}

#[tokio::test]
async fn abort_committed_during_poll_terminates_run() {
    let fx = Fixture::new(ScriptedEngine::new(&[Running]));
    let manager = TaskManager::from_workflow(&fx.ctx, &fx.graph(), ENV_ID, None)
        .await
        .unwrap();

    // Another process aborts between the loop's abort check and the
    // observation being recorded.
    let other = fx.ctx.open_store(manager.tid()).unwrap();
    fx.engine.during_poll(2, move || {
        other
            .write(|db| {
                let meta = db.metadata();
                meta.set_bool(InfoKey::AbortRequested, true)?;
                meta.set_status(Aborted)?;
                Ok(())
            })
            .unwrap();
    });

    assert_eq!(manager.resume().await.unwrap(), Aborted);
    assert_eq!(ScriptedEngine::count(&fx.engine.terminates), 1);
    assert_eq!(ScriptedEngine::count(&fx.engine.output_fetches), 0);
    assert!(!has(&manager, ProgressKey::OutputsCopied));
}

#[tokio::test]
async fn abort_before_submission_never_starts() {
    let fx = Fixture::new(ScriptedEngine::new(&[Completed]));
    let manager = TaskManager::from_workflow(&fx.ctx, &fx.graph(), ENV_ID, None)
        .await
        .unwrap();

    assert_eq!(manager.abort().await.unwrap(), Aborted);
    assert_eq!(manager.resume().await.unwrap(), Aborted);
    assert_eq!(ScriptedEngine::count(&fx.engine.starts), 0);
    assert_eq!(ScriptedEngine::count(&fx.engine.terminates), 0);
}

#[tokio::test]
async fn abort_of_finished_task_is_a_no_op() {
    let fx = Fixture::new(ScriptedEngine::new(&[Completed]));
    let manager = TaskManager::from_workflow(&fx.ctx, &fx.graph(), ENV_ID, None)
        .await
        .unwrap();
    manager.resume().await.unwrap();

    assert_eq!(manager.abort().await.unwrap(), Completed);
    assert_eq!(manager.status().unwrap(), Completed);
    let requested = manager
        .store()
        .read_now(|db| db.metadata().get_bool(InfoKey::AbortRequested))
        .unwrap();
    assert!(!requested);
}

// ─────────────────────────────────────────────────────────────────────────────
// Watch
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn watch_merges_live_state_until_terminal() {
    let fx = Fixture::new(ScriptedEngine::new(&[Running, Running, Completed]));
    let manager = TaskManager::from_workflow(&fx.ctx, &fx.graph(), ENV_ID, None)
        .await
        .unwrap();
    // Submit without polling: no marker past Submitted is written.
    manager
        .store()
        .write(|db| {
            db.metadata().set_engine_tid("run-x")?;
            db.progress().mark(ProgressKey::Submitted)
        })
        .unwrap();

    let mut seen = Vec::new();
    let status = manager.watch(|meta| seen.push(meta.status)).await.unwrap();

    assert_eq!(status, Completed);
    assert_eq!(seen, vec![Running, Running, Completed]);
    // Watching never writes.
    assert_eq!(manager.status().unwrap(), TaskStatus::Processing);
}
