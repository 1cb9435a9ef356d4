// Copyright (c) The nodetest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Integration tests
//!
//! These run the real `nodetest-worker` binary against a fake `node` executable (a shell script),
//! so they only run on Unix.

#![cfg(unix)]

use fixtures::{FakeProject, RecordingReporter, events};
use nodetest_protocol::TestIdentity;
use nodetest_runner::{
    cancel::CancellationToken,
    errors::{RunError, WorkerExit},
    orchestrator::{RunOutcome, RunRequest, TestState},
    test_tree::{TestFile, TestTree},
};
use pretty_assertions::assert_eq;
use std::time::{Duration, Instant};

mod fixtures;

const TIMEOUT: Duration = Duration::from_secs(60);

async fn run(
    project: &FakeProject,
    tree: &mut TestTree,
    request: &RunRequest,
    reporter: &RecordingReporter,
) -> Result<RunOutcome, RunError> {
    let orchestrator = project.orchestrator();
    tokio::time::timeout(
        TIMEOUT,
        orchestrator.run(tree, request, reporter.clone(), CancellationToken::new()),
    )
    .await
    .expect("run finished in time")
}

fn id(file: &TestFile, tests: &[&str]) -> TestIdentity {
    std::iter::once(file.id())
        .chain(tests.iter().copied())
        .collect()
}

#[tokio::test]
async fn test_run_reports_results() -> color_eyre::Result<()> {
    let project = FakeProject::new("v22.3.0")?;
    let math_events = [
        events::dequeue("math", 0),
        events::start("math", 0),
        events::dequeue("adds", 1),
        events::log("computing\n"),
        events::start("adds", 1),
        events::pass("adds", 1),
        events::dequeue("subtracts", 1),
        events::start("subtracts", 1),
        events::fail("subtracts", 1, "expected 1 to equal 2"),
        events::pass("math", 0),
    ];
    let math = project.add_file("math.test.js", &(math_events.join("\n") + "\n"))?;
    let other = project.add_file("other.test.js", &events::passing("works"))?;

    let mut tree = TestTree::new();
    let math = TestFile::new(math).unwrap();
    let other = TestFile::new(other).unwrap();
    tree.add_file(None, math.clone());
    tree.add_file(None, other.clone());

    let reporter = RecordingReporter::default();
    let request = RunRequest {
        concurrency: Some(2),
        ..Default::default()
    };
    let outcome = run(&project, &mut tree, &request, &reporter).await?;

    assert!(!outcome.cancelled);
    assert_eq!(outcome.stats.started, 4);
    assert_eq!(outcome.stats.passed, 3);
    assert_eq!(outcome.stats.failed, 1);
    assert_eq!(outcome.stats.files_failed, 0);
    assert_eq!(outcome.state(&id(&math, &["math", "adds"])), TestState::Passed);
    assert_eq!(
        outcome.state(&id(&math, &["math", "subtracts"])),
        TestState::Failed
    );
    assert_eq!(outcome.state(&id(&other, &["works"])), TestState::Passed);

    // Files run concurrently, so only the order within a file is fixed.
    let reported: Vec<_> = reporter
        .events()
        .into_iter()
        .filter(|event| event.contains("math.test.js"))
        .collect();
    assert_eq!(
        reported,
        [
            "started math.test.js > math",
            "started math.test.js > math > adds",
            "output [math.test.js > math > adds] computing",
            "passed math.test.js > math > adds",
            "started math.test.js > math > subtracts",
            "failed math.test.js > math > subtracts: expected 1 to equal 2",
            "passed math.test.js > math",
        ]
    );

    Ok(())
}

#[tokio::test]
async fn test_file_failures() -> color_eyre::Result<()> {
    let project = FakeProject::new("v22.3.0")?;
    let broken = project.add_file(
        "broken.test.js",
        "SyntaxError: Unexpected token '}'\n    at broken.test.js:3\n",
    )?;
    project.set_exit_code(&broken, 1)?;
    // No trailing newline: the last line still counts.
    let crashes = project.add_file(
        "crashes.test.js",
        &[events::dequeue("hangs", 0), events::start("hangs", 0)].join("\n"),
    )?;
    project.set_exit_code(&crashes, 7)?;

    let mut tree = TestTree::new();
    let broken = TestFile::new(broken).unwrap();
    let crashes = TestFile::new(crashes).unwrap();
    tree.add_file(None, broken.clone());
    tree.add_file(None, crashes.clone());

    let reporter = RecordingReporter::default();
    let request = RunRequest {
        concurrency: Some(1),
        ..Default::default()
    };
    let outcome = run(&project, &mut tree, &request, &reporter).await?;

    assert_eq!(outcome.stats.files_failed, 1);
    assert_eq!(
        outcome.state(&TestIdentity::for_file(broken.id())),
        TestState::FileFailed
    );
    assert_eq!(outcome.state(&id(&crashes, &["hangs"])), TestState::Failed);

    let events = reporter.events();
    assert!(
        events.contains(
            &"failed broken.test.js: SyntaxError: Unexpected token '}'\n    at broken.test.js:3"
                .to_owned()
        ),
        "file failure reported: {events:?}"
    );
    assert!(
        events
            .iter()
            .any(|event| event.starts_with("failed crashes.test.js > hangs: test process exited")),
        "outstanding test failed: {events:?}"
    );

    Ok(())
}

#[tokio::test]
async fn test_selection_and_arguments() -> color_eyre::Result<()> {
    let project = FakeProject::new("v22.10.0")?;
    let selected = project.add_file("selected.ts", &events::passing("one"))?;
    let skipped = project.add_file("skipped.test.js", &events::passing("never"))?;

    let mut tree = TestTree::new();
    let selected_file = TestFile::new(&selected).unwrap();
    let selected_node = tree.add_file(None, selected_file);
    let one = tree.add_test(selected_node, "one");
    let two = tree.add_test(selected_node, "two.*");
    tree.add_file(None, TestFile::new(&skipped).unwrap());

    let reporter = RecordingReporter::default();
    let request = RunRequest {
        include: Some(vec![one, two]),
        extensions: vec![nodetest_protocol::ExtensionConfig {
            extensions: vec!["ts".to_owned()],
            parameters: vec!["--import".to_owned(), "tsx".to_owned()],
        }],
        force_exit: true,
        regenerate_snapshots: true,
        ..Default::default()
    };
    run(&project, &mut tree, &request, &reporter).await?;

    let args = project.args_for(&selected)?;
    assert_eq!(&args[..2], ["--import", "tsx"]);
    assert_eq!(args[2], "--test-reporter");
    assert_eq!(
        &args[4..],
        [
            "--test-force-exit",
            "--experimental-test-isolation=process",
            "--experimental-test-snapshots",
            "--test-update-snapshots",
            "--test-name-pattern",
            "^one$",
            "--test-name-pattern",
            r"^two\.\*$",
            selected.as_str(),
        ]
    );
    assert!(
        project.args_for(&skipped).is_err(),
        "unselected file was not run"
    );

    Ok(())
}

#[tokio::test]
async fn test_unsupported_node_version() -> color_eyre::Result<()> {
    let project = FakeProject::new("v18.19.0")?;
    let file = project.add_file("a.test.js", &events::passing("never"))?;

    let mut tree = TestTree::new();
    tree.add_file(None, TestFile::new(&file).unwrap());

    let reporter = RecordingReporter::default();
    let error = run(&project, &mut tree, &RunRequest::default(), &reporter)
        .await
        .expect_err("old runtime is rejected");

    match error {
        RunError::NodeVersionUnsupported { version, .. } => assert_eq!(version, "v18.19.0"),
        other => panic!("unexpected error: {other}"),
    }
    assert!(reporter.events().is_empty());
    assert!(project.args_for(&file).is_err(), "no file was run");

    Ok(())
}

#[tokio::test]
async fn test_missing_worker() -> color_eyre::Result<()> {
    let project = FakeProject::new("v22.3.0")?;
    let orchestrator = nodetest_runner::orchestrator::Orchestrator::new(
        std::sync::Arc::new(nodetest_runner::endpoint::EndpointAllocator::new(
            project.root(),
        )),
        "node",
        project.root().join("no-such-worker"),
    );

    let mut tree = TestTree::new();
    let error = orchestrator
        .run(
            &mut tree,
            &RunRequest::default(),
            RecordingReporter::default(),
            CancellationToken::new(),
        )
        .await
        .expect_err("worker can't be spawned");
    assert!(
        matches!(error, RunError::WorkerSpawn(_)),
        "unexpected error: {error}"
    );

    Ok(())
}

#[tokio::test]
async fn test_cancelled_run() -> color_eyre::Result<()> {
    let project = FakeProject::new("v22.3.0")?;
    let file = project.add_file("a.test.js", &events::passing("never"))?;

    let mut tree = TestTree::new();
    tree.add_file(None, TestFile::new(&file).unwrap());

    let cancel = CancellationToken::new();
    cancel.cancel();
    let reporter = RecordingReporter::default();
    let outcome = tokio::time::timeout(
        TIMEOUT,
        project
            .orchestrator()
            .run(&mut tree, &RunRequest::default(), reporter.clone(), cancel),
    )
    .await?;
    let outcome = outcome?;

    assert!(outcome.cancelled);
    assert!(reporter.events().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_excluded_tests_on_older_runtimes() -> color_eyre::Result<()> {
    let project = FakeProject::new("v20.20.0")?;
    let file = project.add_file("a.test.js", &events::passing("kept"))?;

    let mut tree = TestTree::new();
    let node = tree.add_file(None, TestFile::new(&file).unwrap());
    let skipped = tree.add_test(node, "skipped");

    let reporter = RecordingReporter::default();
    let request = RunRequest {
        exclude: vec![skipped],
        ..Default::default()
    };
    let outcome = run(&project, &mut tree, &request, &reporter).await?;

    // Node.js 20 has no --test-skip-pattern, and passing it fails the whole file.
    assert!(!project.args_for(&file)?.contains(&"--test-skip-pattern".to_owned()));
    assert_eq!(outcome.stats.files_failed, 0);
    assert_eq!(outcome.stats.passed, 1);

    Ok(())
}

#[tokio::test]
async fn test_empty_run() -> color_eyre::Result<()> {
    let project = FakeProject::new("v22.3.0")?;

    let mut tree = TestTree::new();
    let reporter = RecordingReporter::default();
    let outcome = run(&project, &mut tree, &RunRequest::default(), &reporter).await?;

    assert!(!outcome.cancelled);
    assert_eq!(outcome.stats, Default::default());
    assert!(reporter.events().is_empty());
    assert!(project.run_log()?.is_empty(), "no test process was started");

    Ok(())
}

#[tokio::test]
async fn test_concurrency_limits_test_processes() -> color_eyre::Result<()> {
    let project = FakeProject::new("v22.3.0")?;
    let mut tree = TestTree::new();
    for name in ["a.test.js", "b.test.js", "c.test.js", "d.test.js", "e.test.js"] {
        let file = project.add_file(name, &events::passing("works"))?;
        project.set_script(&file, "sleep 0.3\n")?;
        tree.add_file(None, TestFile::new(&file).unwrap());
    }

    let reporter = RecordingReporter::default();
    let request = RunRequest {
        concurrency: Some(2),
        ..Default::default()
    };
    let outcome = run(&project, &mut tree, &request, &reporter).await?;
    assert_eq!(outcome.stats.passed, 5);

    let log = project.run_log()?;
    assert_eq!(log.len(), 10, "every file started and ended: {log:?}");
    let mut running = 0;
    let mut most_running = 0;
    for entry in &log {
        if entry.started {
            running += 1;
            most_running = most_running.max(running);
        } else {
            running -= 1;
        }
    }
    assert!(most_running <= 2, "{most_running} test processes ran at once: {log:?}");

    Ok(())
}

#[tokio::test]
async fn test_single_lane_runs_files_one_at_a_time() -> color_eyre::Result<()> {
    let project = FakeProject::new("v22.3.0")?;
    let mut tree = TestTree::new();
    for name in ["a.test.js", "b.test.js"] {
        let file = project.add_file(name, &events::passing("works"))?;
        project.set_script(&file, "sleep 0.2\n")?;
        tree.add_file(None, TestFile::new(&file).unwrap());
    }

    let reporter = RecordingReporter::default();
    let request = RunRequest {
        concurrency: Some(1),
        ..Default::default()
    };
    run(&project, &mut tree, &request, &reporter).await?;

    let log: Vec<_> = project
        .run_log()?
        .into_iter()
        .map(|entry| (entry.started, entry.file))
        .collect();
    assert_eq!(
        log,
        [
            (true, "a.test.js".to_owned()),
            (false, "a.test.js".to_owned()),
            (true, "b.test.js".to_owned()),
            (false, "b.test.js".to_owned()),
        ]
    );

    Ok(())
}

#[tokio::test]
async fn test_cancel_during_run() -> color_eyre::Result<()> {
    let project = FakeProject::new("v22.3.0")?;
    let file = project.add_file("a.test.js", &(events::dequeue("slow", 0) + "\n"))?;
    project.set_script(&file, "sleep 2\ntouch \"$file.finished\"\n")?;

    let mut tree = TestTree::new();
    tree.add_file(None, TestFile::new(&file).unwrap());

    let cancel = CancellationToken::new();
    let orchestrator = project.orchestrator();
    let request = RunRequest::default();
    let run_future = orchestrator.run(
        &mut tree,
        &request,
        RecordingReporter::default(),
        cancel.clone(),
    );
    let cancel_once_started = async {
        let deadline = Instant::now() + TIMEOUT;
        while project.run_log()?.is_empty() {
            color_eyre::eyre::ensure!(Instant::now() < deadline, "test process never started");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        cancel.cancel();
        Ok::<_, color_eyre::Report>(())
    };
    let (outcome, started) = tokio::time::timeout(TIMEOUT, async {
        tokio::join!(run_future, cancel_once_started)
    })
    .await?;
    started?;
    let outcome = outcome?;

    assert!(outcome.cancelled);
    assert!(
        !camino::Utf8Path::new(outcome.endpoint.as_str()).exists(),
        "endpoint {} was removed",
        outcome.endpoint
    );

    // The test process was killed before it could finish.
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(!std::path::Path::new(&format!("{file}.finished")).exists());
    let log = project.run_log()?;
    assert!(log.iter().all(|entry| entry.started), "{log:?}");

    Ok(())
}

#[tokio::test]
async fn test_worker_crash() -> color_eyre::Result<()> {
    let project = FakeProject::new("v22.3.0")?;
    let file = project.add_file("a.test.js", &(events::dequeue("t", 0) + "\n"))?;
    project.set_script(&file, "kill -9 $PPID\n")?;

    let mut tree = TestTree::new();
    tree.add_file(None, TestFile::new(&file).unwrap());

    let reporter = RecordingReporter::default();
    let error = run(&project, &mut tree, &RunRequest::default(), &reporter)
        .await
        .expect_err("run fails when the worker dies");

    match error {
        RunError::WorkerExited {
            exit: WorkerExit::Exited { status, .. },
        } => assert!(status.contains("signal"), "unexpected status {status}"),
        other => panic!("unexpected error: {other:?}"),
    }

    Ok(())
}

#[tokio::test]
async fn test_results_before_worker_crash_are_reported() -> color_eyre::Result<()> {
    let project = FakeProject::new("v22.3.0")?;
    let path = project.root().join("a.test.js");
    let file = project.add_file(
        "a.test.js",
        &([
            events::dequeue("t", 0),
            events::start("t", 0),
            events::fail_at("t", 0, "boom", path.as_str(), 1),
        ]
        .join("\n")
            + "\n"),
    )?;
    // Give the worker time to forward the results first.
    project.set_script(&file, "sleep 1\nkill -9 $PPID\n")?;

    let mut tree = TestTree::new();
    tree.add_file(None, TestFile::new(&file).unwrap());

    let reporter = RecordingReporter::default();
    let error = run(&project, &mut tree, &RunRequest::default(), &reporter)
        .await
        .expect_err("run fails when the worker dies");
    assert!(
        matches!(error, RunError::WorkerExited { .. }),
        "unexpected error: {error:?}"
    );
    assert_eq!(
        reporter.events(),
        ["started a.test.js > t", "failed a.test.js > t: boom"]
    );

    Ok(())
}
