
use std::time::{Duration, Instant};

use revpool::scheduler::{FailureReason, JobState, TransientCause};
use tempfile::TempDir;
use test_harness::{ids, shell_orchestrator, test_config};

#[tokio::test]
async fn test_successful_job_writes_artifacts() {
    let dir = TempDir::new().unwrap();
    let orchestrator = shell_orchestrator(test_config(dir.path(), 1), "echo reviewed");

    let report = orchestrator.run(&ids(&["abc123"])).await.unwrap();

    let result = &report.aggregator.results()[0];
    assert_eq!(result.final_state, JobState::Succeeded);
    assert_eq!(result.attempts_used, 1);
    assert_eq!(result.exit_code, Some(0));

    let workspace = dir.path().join("revpool-abc123");
    let output = std::fs::read_to_string(workspace.join("revpool-output.txt")).unwrap();
    assert_eq!(output, "reviewed abc123\n");

    let duration: serde_json::Value = serde_json::from_str(
        &std::fs::read_to_string(workspace.join("revpool-duration.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(duration["job_id"], "abc123");
    assert_eq!(duration["attempts"], 1);
    assert_eq!(duration["final_state"], "Succeeded");

    assert!(result
        .artifact_paths
        .contains(&workspace.join("revpool-output.txt")));
    assert!(result
        .artifact_paths
        .contains(&workspace.join("revpool-duration.json")));
}

#[tokio::test]
async fn test_report_file_is_collected() {
    let dir = TempDir::new().unwrap();
    let orchestrator = shell_orchestrator(
        test_config(dir.path(), 1),
        "echo 'inline comment' > review-inline.txt; echo done {id}",
    );

    let report = orchestrator.run(&ids(&["abc123"])).await.unwrap();

    let result = &report.aggregator.results()[0];
    let report_path = dir.path().join("revpool-abc123").join("review-inline.txt");
    assert!(result.artifact_paths.contains(&report_path));
    assert_eq!(
        std::fs::read_to_string(report_path).unwrap(),
        "inline comment\n"
    );
}

#[tokio::test]
async fn test_non_zero_exit_is_retried_then_failed() {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path(), 1).with_max_attempts(3);
    let orchestrator = shell_orchestrator(config, "echo attempt >> attempts.log; exit 3 #");

    let report = orchestrator.run(&ids(&["abc"])).await.unwrap();

    let result = &report.aggregator.results()[0];
    assert_eq!(result.attempts_used, 3);
    assert_eq!(result.exit_code, Some(3));
    assert_eq!(
        result.failure,
        Some(FailureReason::Exhausted(TransientCause::NonZeroExit(Some(3))))
    );

    let log = std::fs::read_to_string(dir.path().join("revpool-abc").join("attempts.log")).unwrap();
    assert_eq!(log.lines().count(), 3);
}

#[tokio::test]
async fn test_timeout_fails_after_max_attempts() {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path(), 1)
        .with_max_attempts(2)
        .with_timeout(Some(Duration::from_millis(200)));
    let orchestrator = shell_orchestrator(config, "sleep 5 #");

    let start = Instant::now();
    let report = orchestrator.run(&ids(&["slow"])).await.unwrap();

    assert!(start.elapsed() < Duration::from_secs(4));
    let result = &report.aggregator.results()[0];
    assert_eq!(result.final_state, JobState::Failed);
    assert_eq!(result.attempts_used, 2);
    assert_eq!(
        result.failure,
        Some(FailureReason::Exhausted(TransientCause::TimedOut))
    );
}

#[tokio::test]
async fn test_timeout_kills_process_ignoring_sigterm() {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path(), 1)
        .with_max_attempts(1)
        .with_timeout(Some(Duration::from_millis(200)));
    let orchestrator = shell_orchestrator(config, "trap '' TERM; sleep 10 #");

    let start = Instant::now();
    let report = orchestrator.run(&ids(&["stubborn"])).await.unwrap();

    // timeout + kill grace, nowhere near the 10s sleep
    assert!(start.elapsed() < Duration::from_secs(4));
    assert_eq!(
        report.aggregator.results()[0].failure,
        Some(FailureReason::Exhausted(TransientCause::TimedOut))
    );
}

#[tokio::test]
async fn test_clean_exit_without_output_is_retried() {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path(), 1).with_max_attempts(2);
    let orchestrator = shell_orchestrator(config, "true");

    let report = orchestrator.run(&ids(&["quiet"])).await.unwrap();

    let result = &report.aggregator.results()[0];
    assert_eq!(result.attempts_used, 2);
    assert_eq!(
        result.failure,
        Some(FailureReason::Exhausted(TransientCause::EmptyOutput))
    );
}

#[tokio::test]
async fn test_job_id_is_passed_as_data() {
    let dir = TempDir::new().unwrap();
    let orchestrator = shell_orchestrator(test_config(dir.path(), 1), "printf '%s\\n' \"{id}\"");

    let report = orchestrator.run(&ids(&["x;touch pwned"])).await.unwrap();

    assert_eq!(report.summary.succeeded, 1);
    let workspace = dir.path().join("revpool-x_3btouch_20pwned");
    let output = std::fs::read_to_string(workspace.join("revpool-output.txt")).unwrap();
    assert_eq!(output, "x;touch pwned\n");
    assert!(!workspace.join("pwned").exists());
}

#[tokio::test]
async fn test_bare_id_placeholder_is_not_split_or_globbed() {
    let dir = TempDir::new().unwrap();
    let orchestrator = shell_orchestrator(test_config(dir.path(), 2), "printf '[%s]\\n' {id}");

    let report = orchestrator.run(&ids(&["*", "x y"])).await.unwrap();
    assert_eq!(report.summary.succeeded, 2);

    let results = report.aggregator.results();
    for (result, expected) in results.iter().zip(["[*]\n", "[x y]\n"]) {
        let output = result
            .artifact_paths
            .iter()
            .find(|p| p.ends_with("revpool-output.txt"))
            .unwrap();
        assert_eq!(std::fs::read_to_string(output).unwrap(), expected);
    }
}

#[tokio::test]
async fn test_command_runs_inside_workspace() {
    let dir = TempDir::new().unwrap();
    let orchestrator = shell_orchestrator(
        test_config(dir.path(), 1),
        "pwd; echo \"$REVPOOL_JOB_ID\"; echo {workspace}",
    );

    let report = orchestrator.run(&ids(&["abc"])).await.unwrap();
    assert_eq!(report.summary.succeeded, 1);

    let workspace = dir.path().join("revpool-abc");
    let output = std::fs::read_to_string(workspace.join("revpool-output.txt")).unwrap();
    let lines: Vec<&str> = output.lines().collect();
    assert_eq!(
        std::fs::canonicalize(lines[0]).unwrap(),
        std::fs::canonicalize(&workspace).unwrap()
    );
    assert_eq!(lines[1], "abc");
    assert_eq!(
        std::fs::canonicalize(lines[2]).unwrap(),
        std::fs::canonicalize(&workspace).unwrap()
    );
}

#[tokio::test]
async fn test_stderr_is_kept_for_failed_jobs() {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path(), 1).with_max_attempts(1);
    let orchestrator = shell_orchestrator(config, "echo 'model overloaded' >&2; exit 1 #");

    let report = orchestrator.run(&ids(&["abc"])).await.unwrap();

    let result = &report.aggregator.results()[0];
    assert!(result
        .stderr_tail
        .as_deref()
        .unwrap_or_default()
        .contains("model overloaded"));
    assert!(report.aggregator.render_details(true).contains("model overloaded"));
}

#[tokio::test]
async fn test_parallel_shell_jobs() {
    let dir = TempDir::new().unwrap();
    let orchestrator = shell_orchestrator(test_config(dir.path(), 3), "sleep 0.3; echo ok");

    let list: Vec<String> = (0..6).map(|i| format!("rev{}", i)).collect();
    let start = Instant::now();
    let report = orchestrator.run(&list).await.unwrap();

    assert_eq!(report.summary.succeeded, 6);
    assert!(report.pool.peak_in_flight <= 3);
    // Two waves of three, not six sequential sleeps
    assert!(start.elapsed() < Duration::from_millis(1500));
}
