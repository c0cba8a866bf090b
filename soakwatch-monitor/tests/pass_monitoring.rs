mod common;

use std::fs::OpenOptions;
use std::io::Write;

use common::{fixture, init_test_logging};
use soakwatch_common::{
    DEFAULT_CHANNEL, ErrorRule, LogLevel, PassResult, ProcessExit, RetryPolicy, TerminationReason,
};
use soakwatch_monitor::{
    ClassifiedEvent, FileLogStream, MemoryLog, PassController, PassControllerConfig, PassState,
    RecordingSink, SuppressionList, SuppressionSource, extract_new_lines, suppression_path,
};
use tempfile::TempDir;
use tracing::info;

fn soak_rules() -> Vec<ErrorRule> {
    vec![
        ErrorRule::new(Some("AutoTest"), "AutoTest failure:", "Soak route did not complete")
            .verbose(true),
        ErrorRule::new(None, "Out of video memory", "GPU ran out of memory"),
    ]
}

fn branch_settings(tmp: &TempDir, branch: &str) {
    let path = suppression_path(tmp.path(), branch);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, fixture("IgnoredIssueList.json")).unwrap();
}

#[test]
fn test_fixture_log_parses_channels() {
    init_test_logging();
    info!("TEST START: test_fixture_log_parses_channels");

    let lines = extract_new_lines(fixture("soak_client.log"), None, 0);
    assert_eq!(lines.len(), 11);
    assert_eq!(lines[0].channel, "LogInit");
    assert_eq!(lines[3].level, LogLevel::Warning);
    assert_eq!(lines[8].channel, DEFAULT_CHANNEL);
    assert!(lines[6].is_ensure());

    let autotest = extract_new_lines(fixture("soak_client.log"), Some("AutoTest"), 0);
    assert_eq!(autotest.len(), 4);
    assert!(autotest.iter().all(|l| l.channel == "AutoTest"));

    info!("TEST PASS: test_fixture_log_parses_channels");
}

#[test]
fn test_file_backed_pass_latches_autotest_failure() {
    init_test_logging();
    info!("TEST START: test_file_backed_pass_latches_autotest_failure");

    let tmp = TempDir::new().unwrap();
    let settings = TempDir::new().unwrap();
    branch_settings(&settings, "release/soak");
    let log_path = tmp.path().join("ClientOutput.log");

    let mut controller = PassController::new(PassControllerConfig {
        scope: "SoakTest".into(),
        channel: None,
        rules: soak_rules(),
        suppression: SuppressionSource::Branch {
            settings_root: settings.path().to_path_buf(),
            branch: "release/soak".into(),
        },
        retry: RetryPolicy::none(),
    });
    let mut sink = RecordingSink::new();
    controller
        .start(2, Box::new(FileLogStream::new(&log_path)))
        .unwrap();
    assert_eq!(controller.suppressions().entries().len(), 3);

    // Nothing written yet.
    assert_eq!(controller.tick(&mut sink).unwrap().new_lines, 0);

    let text = fixture("soak_client.log");
    let (head, tail) = text.split_at(text.find("   0x00007ff6").unwrap());
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .unwrap();
    file.write_all(head.as_bytes()).unwrap();
    file.flush().unwrap();

    let report = controller.tick(&mut sink).unwrap();
    info!(?report, "first tick");
    assert_eq!(report.new_lines, 8);
    assert_eq!(report.warnings, 1);
    assert_eq!(report.errors, 1);
    assert_eq!(report.suppressed, 2);
    assert!(!report.completed);

    file.write_all(tail.as_bytes()).unwrap();
    file.flush().unwrap();

    let report = controller.tick(&mut sink).unwrap();
    assert!(report.completed);
    let reason = report.failure.unwrap();
    assert!(reason.starts_with("Test Error: Soak route did not complete"));
    assert!(reason.contains("AutoTest failure: timeout"));
    assert_eq!(controller.state(), PassState::Completed);

    let outcome = controller.finish(&ProcessExit::exited(0), &mut sink).unwrap();
    assert_eq!(outcome.result, PassResult::Failed);
    assert_eq!(outcome.exit_code, -1);

    let events = sink.events();
    assert!(matches!(events.last(), Some(ClassifiedEvent::Completed { pass: 2, .. })));
    assert_eq!(
        events
            .iter()
            .filter(|e| matches!(e, ClassifiedEvent::Failure { .. }))
            .count(),
        1
    );

    info!("TEST PASS: test_file_backed_pass_latches_autotest_failure");
}

#[test]
fn test_scope_without_suppressions_reports_everything() {
    init_test_logging();
    info!("TEST START: test_scope_without_suppressions_reports_everything");

    let settings = TempDir::new().unwrap();
    branch_settings(&settings, "main");
    let log = MemoryLog::new();
    let mut controller = PassController::new(PassControllerConfig {
        scope: "OtherTest".into(),
        channel: None,
        rules: vec![],
        suppression: SuppressionSource::Branch {
            settings_root: settings.path().to_path_buf(),
            branch: "main".into(),
        },
        retry: RetryPolicy::none(),
    });
    let mut sink = RecordingSink::new();
    controller.start(0, Box::new(log.stream())).unwrap();
    log.append(fixture("soak_client.log"));
    controller.tick(&mut sink).unwrap();

    // Two warnings, plus three errors (network, ensure, unmatched autotest).
    assert_eq!(sink.warnings().len(), 2);
    assert_eq!(sink.errors().len(), 3);

    let outcome = controller.finish(&ProcessExit::exited(0), &mut sink).unwrap();
    assert!(outcome.is_passed());

    info!("TEST PASS: test_scope_without_suppressions_reports_everything");
}

#[test]
fn test_channel_filter_limits_rule_scope() {
    init_test_logging();
    info!("TEST START: test_channel_filter_limits_rule_scope");

    let log = MemoryLog::new();
    let mut controller = PassController::new(PassControllerConfig {
        scope: "SoakTest".into(),
        channel: Some("AutoTest".into()),
        rules: vec![ErrorRule::new(None, "reset", "network reset")],
        suppression: SuppressionSource::Fixed(SuppressionList::empty()),
        retry: RetryPolicy::none(),
    });
    let mut sink = RecordingSink::new();
    controller.start(0, Box::new(log.stream())).unwrap();
    log.append(fixture("soak_client.log"));
    let report = controller.tick(&mut sink).unwrap();

    // Only AutoTest lines are tailed, so the LogNet error never matches.
    assert_eq!(report.new_lines, 4);
    assert!(report.failure.is_none());
    assert_eq!(sink.errors().len(), 1);

    info!("TEST PASS: test_channel_filter_limits_rule_scope");
}

#[test]
fn test_timeout_and_cancel_map_to_timed_out() {
    init_test_logging();
    info!("TEST START: test_timeout_and_cancel_map_to_timed_out");

    let mut controller = PassController::new(PassControllerConfig {
        scope: "SoakTest".into(),
        retry: RetryPolicy::none(),
        ..PassControllerConfig::default()
    });
    let mut sink = RecordingSink::new();

    let log = MemoryLog::new();
    controller.start(0, Box::new(log.stream())).unwrap();
    let outcome = controller
        .finish(&ProcessExit::with_reason(TerminationReason::TimedOut), &mut sink)
        .unwrap();
    assert_eq!(outcome.result, PassResult::TimedOut);

    controller.start(1, Box::new(log.stream())).unwrap();
    let outcome = controller.cancel(&mut sink);
    assert_eq!(outcome.result, PassResult::TimedOut);
    assert_eq!(outcome.exit_code, -1);

    info!("TEST PASS: test_timeout_and_cancel_map_to_timed_out");
}
