mod common;

use common::init_test_logging;
use proptest::prelude::*;
use soakwatch_common::{ErrorRule, LogLine, SuppressionEntry, SuppressionKind};
use soakwatch_monitor::{
    LogTailReader, MemoryLog, SuppressionList, classify, extract_new_lines, filter_reportable,
    find_failure, parse_line,
};
use tracing::info;

fn line_strategy() -> impl Strategy<Value = String> {
    let channel = prop::sample::select(vec!["AutoTest", "LogNet", "LogTemp", "Test"]);
    let level = prop::sample::select(vec!["", "Error: ", "Warning: ", "Display: "]);
    let text = "[a-z ]{0,12}(OOM|timeout|hitch)?[a-z ]{0,6}";
    (channel, level, text).prop_map(|(c, l, t)| format!("{c}: {l}{t}"))
}

fn rule_strategy() -> impl Strategy<Value = ErrorRule> {
    let category = prop::option::of(prop::sample::select(vec!["AutoTest", "LogNet", "Test"]));
    let substring = prop::sample::select(vec!["OOM", "timeout", "hitch", "zz-never"]);
    (category, substring, "[A-Z][a-z]{2,8}").prop_map(|(c, s, m)| ErrorRule::new(c, s, m))
}

fn parsed(raw: &[String]) -> Vec<LogLine> {
    raw.iter()
        .enumerate()
        .map(|(i, r)| parse_line(r, i))
        .collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    /// Feeding the log in arbitrary chunks yields every line exactly once,
    /// in order, including ticks that see no complete line.
    #[test]
    fn prop_tailing_returns_each_line_once(
        raw in prop::collection::vec(line_strategy(), 0..30),
        cuts in prop::collection::vec(0usize..200, 0..12),
    ) {
        init_test_logging();
        let text: String = raw.iter().map(|l| format!("{l}\n")).collect();
        let mut boundaries: Vec<usize> = cuts
            .into_iter()
            .map(|c| c.min(text.len()))
            .filter(|c| text.is_char_boundary(*c))
            .collect();
        boundaries.push(text.len());
        boundaries.sort_unstable();

        let log = MemoryLog::new();
        let mut reader = LogTailReader::new(Box::new(log.stream()), None);
        let mut seen: Vec<LogLine> = Vec::new();
        let mut written = 0;
        for end in boundaries {
            log.append(&text[written..end]);
            written = end;
            let new = reader.extract_new_lines(seen.len()).unwrap().to_vec();
            seen.extend(new);
        }

        prop_assert_eq!(seen.len(), raw.len());
        for (i, line) in seen.iter().enumerate() {
            prop_assert_eq!(line.sequence, i);
        }
        prop_assert_eq!(seen, extract_new_lines(&text, None, 0));
    }

    /// The pure extractor agrees with itself across any cursor split.
    #[test]
    fn prop_extract_split_is_concatenation(
        raw in prop::collection::vec(line_strategy(), 0..20),
        since in 0usize..25,
    ) {
        let text: String = raw.iter().map(|l| format!("{l}\n")).collect();
        let all = extract_new_lines(&text, Some("AutoTest"), 0);
        let tail = extract_new_lines(&text, Some("AutoTest"), since);
        let expected: Vec<LogLine> = all.iter().skip(since).cloned().collect();
        prop_assert_eq!(tail, expected);
    }

    /// Inserting rules that match nothing anywhere in the list never changes
    /// which rule wins.
    #[test]
    fn prop_non_matching_rules_do_not_change_outcome(
        raw in prop::collection::vec(line_strategy(), 0..20),
        rules in prop::collection::vec(rule_strategy(), 0..5),
        position in 0usize..6,
    ) {
        let lines = parsed(&raw);
        let baseline = find_failure(&lines, &rules).map(|f| (f.rule.clone(), f.line.sequence));

        let mut extended = rules.clone();
        let filler = ErrorRule::new(Some("NoSuchChannel"), "zz-never", "filler");
        extended.insert(position.min(extended.len()), filler);
        let after = find_failure(&lines, &extended).map(|f| (f.rule.clone(), f.line.sequence));

        prop_assert_eq!(baseline, after);
    }

    /// A suppressed line stays suppressed no matter how often it is
    /// classified.
    #[test]
    fn prop_suppression_is_idempotent(
        raw in prop::collection::vec(line_strategy(), 0..20),
        repeats in 1usize..4,
    ) {
        let lines = parsed(&raw);
        let suppressions = SuppressionList::new(vec![
            SuppressionEntry::new("Soak", SuppressionKind::Warning, "hitch"),
            SuppressionEntry::new("Soak", SuppressionKind::Error, "timeout"),
        ]);

        let first = filter_reportable(&lines, &suppressions, "Soak");
        for _ in 0..repeats {
            let again = classify(&lines, &[], &suppressions, "Soak");
            prop_assert_eq!(&again.warnings, &first.warnings);
            prop_assert_eq!(&again.errors, &first.errors);
            prop_assert!(again.warnings.iter().all(|l| !l.text.contains("hitch")));
            prop_assert!(again.errors.iter().all(|l| !l.text.contains("timeout")));
        }
    }
}

#[test]
fn test_oom_on_test_channel_fails() {
    init_test_logging();
    info!("TEST START: test_oom_on_test_channel_fails");

    let rules = vec![ErrorRule::new(Some("Test"), "OOM", "Out of memory")];
    let lines = vec![parse_line("Test: Error: OOM detected", 0)];
    let result = classify(&lines, &rules, &SuppressionList::empty(), "Soak");
    let failure = result.failure.expect("rule should match");
    assert_eq!(failure.rule.user_message, "Out of memory");
    assert_eq!(failure.reason(), "Test Error: Out of memory");

    info!("TEST PASS: test_oom_on_test_channel_fails");
}
