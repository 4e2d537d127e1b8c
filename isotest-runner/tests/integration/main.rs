// Copyright (c) The isotest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! End-to-end tests for process isolation.
//!
//! This binary is both the host and the worker: every isolated case re-executes it with the
//! worker subcommand, so [`worker::dispatch`] must run before libtest-mimic parses arguments.
//!
//! The trials touch process-wide ambient state, so they always run on a single thread.

mod fixtures;

use color_eyre::{
    Result,
    eyre::{bail, ensure, eyre},
};
use fixtures::{COUNTER, MALFORMED_WORKER_ENV, case, registry};
use isotest_metadata::FailureKind;
use isotest_runner::{
    ambient::{self, Culture, NeutralSettings},
    case_runner::ConstructionHooks,
    config::IsotestConfig,
    errors::{CaseFailure, IsolationError},
    isolation::{IsolationBoundary, Outcome, ProcessIsolator, WorkerProgram},
    list::TestCase,
    registry::{TestOutput, TestRegistry},
    reporter::{TestEvent, TestEventKind},
    runner::{RunStats, TestRunnerBuilder},
    worker,
};
use libtest_mimic::{Arguments, Failed, Trial};
use serde_json::json;
use std::{collections::BTreeMap, process::ExitCode, sync::atomic::Ordering};

fn main() -> ExitCode {
    if let Some(code) = fixtures::dispatch_malformed() {
        return code;
    }
    let registry = registry();
    if let Some(code) = worker::dispatch(&registry) {
        return code;
    }

    let _ = color_eyre::install();
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_writer(std::io::stderr)
        .try_init();

    let mut args = Arguments::from_args();
    args.test_threads = Some(1);

    let tests = vec![
        trial("static_state_is_not_shared_between_cases", static_state_is_not_shared_between_cases),
        trial("direct_runs_share_static_state", direct_runs_share_static_state),
        trial("single_case_runs_in_host_process", single_case_runs_in_host_process),
        trial("output_and_session_cross_the_boundary", output_and_session_cross_the_boundary),
        trial("failures_keep_their_causes", failures_keep_their_causes),
        trial("crashed_worker_fails_only_its_case", crashed_worker_fails_only_its_case),
        trial("worker_environment_is_neutral", worker_environment_is_neutral),
        trial("ambient_state_restored_after_each_case", ambient_state_restored_after_each_case),
        trial("stop_request_unwinds_balanced", stop_request_unwinds_balanced),
        trial("non_utf8_stdout_is_output", non_utf8_stdout_is_output),
        trial("marker_lookalikes_are_output", marker_lookalikes_are_output),
        trial("malformed_protocol_line_fails_the_case", malformed_protocol_line_fails_the_case),
        trial("missing_worker_program_fails_each_case", missing_worker_program_fails_each_case),
    ];

    libtest_mimic::run(&args, tests).exit_code()
}

fn trial(name: &'static str, test: fn() -> Result<()>) -> Trial {
    Trial::test(name, move || {
        test().map_err(|error| Failed::from(format!("{error:?}")))
    })
}

/// What a run reported about one case, owned so it outlives the event.
#[derive(Debug)]
struct CaseReport {
    display_name: String,
    passed: bool,
    output: String,
    failure: Option<FailureReport>,
}

#[derive(Debug)]
struct FailureReport {
    kind: FailureKind,
    message: String,
    causes: Vec<String>,
    is_isolation: bool,
}

#[derive(Debug, Default)]
struct Collected {
    isolated: Option<bool>,
    cases: Vec<CaseReport>,
    starts: usize,
    finishes: usize,
}

impl Collected {
    fn on_event(&mut self, event: &TestEvent<'_>) {
        if event.kind.starts().is_some() {
            self.starts += 1;
        }
        if event.kind.finishes().is_some() {
            self.finishes += 1;
        }
        match &event.kind {
            TestEventKind::AssemblyStarting { isolated, .. } => self.isolated = Some(*isolated),
            TestEventKind::TestPassed { case, output, .. } => self.cases.push(CaseReport {
                display_name: case.display_name.clone(),
                passed: true,
                output: (*output).to_owned(),
                failure: None,
            }),
            TestEventKind::TestFailed {
                case,
                output,
                failure,
                ..
            } => {
                let summary = failure.to_summary();
                self.cases.push(CaseReport {
                    display_name: case.display_name.clone(),
                    passed: false,
                    output: (*output).to_owned(),
                    failure: Some(FailureReport {
                        kind: summary.kind,
                        message: summary.message,
                        causes: summary.causes,
                        is_isolation: matches!(failure, CaseFailure::Isolation(_)),
                    }),
                })
            }
            _ => {}
        }
    }

    fn case(&self, display_name: &str) -> Result<&CaseReport> {
        self.cases
            .iter()
            .find(|report| report.display_name == display_name)
            .ok_or_else(|| eyre!("no outcome reported for {display_name}: {:#?}", self.cases))
    }
}

fn run(
    registry: &TestRegistry,
    config: &IsotestConfig,
    cases: &[TestCase],
) -> Result<(RunStats, Collected)> {
    let profile = config.profile(IsotestConfig::DEFAULT_PROFILE)?;
    let runner = TestRunnerBuilder::default().build(registry, &profile);
    let mut collected = Collected::default();
    let stats = runner.execute(cases, |event: TestEvent<'_>| {
        collected.on_event(&event);
        true
    });
    Ok((stats, collected))
}

fn embedded_config() -> IsotestConfig {
    IsotestConfig::from_embedded()
}

fn static_state_is_not_shared_between_cases() -> Result<()> {
    let registry = registry();
    let cases: Vec<_> = (0..3)
        .map(|i| case("Counter", "increments").with_display_name(format!("increments #{i}")))
        .collect();

    let (stats, collected) = run(&registry, &embedded_config(), &cases)?;
    ensure!(collected.isolated == Some(true), "multi-case runs are isolated");
    ensure!(
        stats.passed == 3 && stats.is_success(),
        "every case saw a fresh counter: {collected:#?}"
    );
    ensure!(
        COUNTER.load(Ordering::SeqCst) == 0,
        "the host's counter was never touched"
    );
    Ok(())
}

struct NoHooks;

impl ConstructionHooks for NoHooks {}

fn direct_runs_share_static_state() -> Result<()> {
    let registry = registry();
    let boundary = IsolationBoundary::new(
        &registry,
        Box::new(ProcessIsolator::new(
            WorkerProgram::CurrentExe,
            &NeutralSettings::default(),
        )),
        NeutralSettings::default(),
    );
    let request = case("Counter", "increments").to_request();

    COUNTER.store(0, Ordering::SeqCst);
    let first = boundary.run_direct(&request, &TestOutput::discard(), &mut NoHooks);
    let second = boundary.run_direct(&request, &TestOutput::discard(), &mut NoHooks);
    let isolated = boundary.run_isolated(&request, &TestOutput::discard(), &mut NoHooks);
    COUNTER.store(0, Ordering::SeqCst);

    ensure!(
        matches!(first, Outcome::Passed { .. }),
        "first direct run passes: {first:?}"
    );
    match second {
        Outcome::Failed { failure, .. } => ensure!(
            failure.kind() == FailureKind::Invocation,
            "second direct run observes the first run's counter: {failure}"
        ),
        other => bail!("second direct run should fail, got {other:?}"),
    }
    ensure!(
        matches!(isolated, Outcome::Passed { .. }),
        "an isolated run starts from a fresh counter: {isolated:?}"
    );
    Ok(())
}

fn single_case_runs_in_host_process() -> Result<()> {
    let registry = registry();
    let (stats, collected) = run(&registry, &embedded_config(), &[case("Reporter", "pid")])?;

    ensure!(collected.isolated == Some(false), "a single case runs directly");
    ensure!(stats.passed == 1, "case passed: {collected:#?}");
    let report = collected.case("Reporter.pid")?;
    let pid_line = format!("pid={}", std::process::id());
    ensure!(
        report.output.lines().any(|line| line == pid_line),
        "case ran in the host process: {:?}",
        report.output
    );
    Ok(())
}

fn output_and_session_cross_the_boundary() -> Result<()> {
    let registry = registry();
    let cases = [
        case("Reporter", "pid"),
        case("Reporter", "adds").with_arguments([json!(2), json!(3), json!(5)]),
    ];
    let (stats, collected) = run(&registry, &embedded_config(), &cases)?;
    ensure!(stats.passed == 2, "both cases passed: {collected:#?}");

    let report = collected.case("Reporter.pid")?;
    let lines: Vec<_> = report.output.lines().collect();
    let host_pid = format!("pid={}", std::process::id());
    ensure!(
        lines.first() == Some(&"session: creating test class")
            && lines.get(1) == Some(&"session: before")
            && lines.last() == Some(&"session: after"),
        "session wrapped the case: {lines:?}"
    );
    ensure!(
        lines.iter().any(|line| line.starts_with("pid=") && *line != host_pid),
        "case ran in a worker process: {lines:?}"
    );
    ensure!(
        lines.contains(&"written straight to stdout"),
        "raw stdout is captured as output: {lines:?}"
    );
    Ok(())
}

fn failures_keep_their_causes() -> Result<()> {
    let registry = registry();
    let cases = [
        case("Broken", "fails"),
        case("Broken", "panics"),
        case("Reporter", "adds").with_arguments([json!(2), json!(2), json!(5)]),
        case("Missing", "method"),
    ];
    let (stats, collected) = run(&registry, &embedded_config(), &cases)?;
    ensure!(stats.failed == 4, "every case failed: {collected:#?}");

    let failure = |name: &str| -> Result<&FailureReport> {
        collected
            .case(name)?
            .failure
            .as_ref()
            .ok_or_else(|| eyre!("{name} has no failure"))
    };

    let fails = failure("Broken.fails")?;
    ensure!(fails.kind == FailureKind::Invocation, "{fails:?}");
    ensure!(fails.message == "`Broken::fails` failed", "{fails:?}");
    ensure!(
        fails.causes == ["failed to load fixture data", "disk unavailable"],
        "original error chain preserved: {fails:?}"
    );
    ensure!(!fails.is_isolation, "failure came from the case: {fails:?}");

    let panics = failure("Broken.panics")?;
    ensure!(panics.kind == FailureKind::Panic, "{panics:?}");
    ensure!(
        panics.message.contains("fixture panicked on purpose"),
        "{panics:?}"
    );

    let adds = failure("Reporter.adds(2, 2, 5)")?;
    ensure!(adds.causes == ["2 + 2 was 4, not 5"], "{adds:?}");

    let missing = failure("Missing.method")?;
    ensure!(missing.kind == FailureKind::ClassNotFound, "{missing:?}");
    Ok(())
}

fn crashed_worker_fails_only_its_case() -> Result<()> {
    let registry = registry();
    let cases = [case("Broken", "aborts"), case("Counter", "increments")];
    let (stats, collected) = run(&registry, &embedded_config(), &cases)?;

    let aborted = collected
        .case("Broken.aborts")?
        .failure
        .as_ref()
        .ok_or_else(|| eyre!("aborting case should fail"))?;
    ensure!(aborted.is_isolation, "{aborted:?}");
    ensure!(aborted.kind == FailureKind::Isolation, "{aborted:?}");
    ensure!(
        aborted.message.contains("exited without reporting an outcome"),
        "{aborted:?}"
    );
    ensure!(
        collected.case("Counter.increments")?.passed,
        "the sibling case still ran: {collected:#?}"
    );
    ensure!((stats.passed, stats.failed) == (1, 1), "{stats:?}");
    Ok(())
}

fn worker_environment_is_neutral() -> Result<()> {
    let dir = camino_tempfile::tempdir()?;
    let config_dir = dir.path().join(".config");
    std::fs::create_dir_all(&config_dir)?;
    std::fs::write(
        config_dir.join("isotest.toml"),
        indoc::indoc! {r#"
            [profile.default]
            neutral-locale = "C.UTF-8"
            worker-env = { isotest_marker = "present" }
        "#},
    )?;
    let config = IsotestConfig::from_sources(dir.path(), None)?;

    let registry = registry();
    let cases = [case("Reporter", "env"), case("Counter", "increments")];
    let (_, collected) = run(&registry, &config, &cases)?;
    let output = &collected.case("Reporter.env")?.output;
    for expected in [
        "LC_ALL=C.UTF-8",
        "isotest_marker=present",
        "ISOTEST_CONTEXT_NAME=Reporter::Reporter.env",
    ] {
        ensure!(
            output.lines().any(|line| line == expected),
            "expected {expected:?} in {output:?}"
        );
    }
    Ok(())
}

fn ambient_state_restored_after_each_case() -> Result<()> {
    let registry = registry();
    let config = embedded_config();
    let profile = config.profile(IsotestConfig::DEFAULT_PROFILE)?;
    let runner = TestRunnerBuilder::default().build(&registry, &profile);

    ambient::set_current_culture(Culture::new("fr-FR"));
    let default_before = ambient::default_thread_culture();

    for cases in [
        vec![case("Reporter", "switches_culture")],
        vec![
            case("Reporter", "switches_culture"),
            case("Broken", "fails"),
            case("Reporter", "switches_culture").with_display_name("again"),
        ],
    ] {
        let mut seen = Vec::new();
        let stats = runner.execute(&cases, |event: TestEvent<'_>| {
            if event.kind.starts().is_some() || event.kind.finishes().is_some() {
                seen.push(ambient::current_culture());
            }
            true
        });
        let culture_cases = cases
            .iter()
            .filter(|case| case.method == "switches_culture")
            .count();
        ensure!(
            stats.passed == culture_cases && stats.failed == cases.len() - culture_cases,
            "each culture case started from the invariant culture: {stats:?}"
        );
        ensure!(
            seen.iter().all(|culture| *culture == Culture::new("fr-FR")),
            "culture between cases: {seen:?}"
        );
        ensure!(
            ambient::default_thread_culture() == default_before,
            "default thread culture restored"
        );
    }

    ambient::set_current_culture(Culture::invariant());
    Ok(())
}

fn stop_request_unwinds_balanced() -> Result<()> {
    let registry = registry();
    let config = embedded_config();
    let profile = config.profile(IsotestConfig::DEFAULT_PROFILE)?;
    let runner = TestRunnerBuilder::default().build(&registry, &profile);

    let cases = [
        case("Counter", "increments"),
        case("Reporter", "pid"),
        case("Reporter", "adds").with_arguments([json!(1), json!(1), json!(2)]),
    ];
    let mut collected = Collected::default();
    let mut case_starts = 0;
    let stats = runner.execute(&cases, |event: TestEvent<'_>| {
        collected.on_event(&event);
        if let TestEventKind::CaseStarting { .. } = event.kind {
            case_starts += 1;
        }
        case_starts < 2
    });

    ensure!(case_starts == 2, "no case started after the stop request");
    ensure!(
        collected.starts == collected.finishes,
        "{} starts, {} finishes",
        collected.starts,
        collected.finishes
    );
    ensure!(stats.cancelled && !stats.is_success(), "{stats:?}");
    ensure!(stats.finished_count == 2, "{stats:?}");
    Ok(())
}

fn non_utf8_stdout_is_output() -> Result<()> {
    let registry = registry();
    let cases = [case("Noisy", "non_utf8_stdout"), case("Counter", "increments")];
    let (stats, collected) = run(&registry, &embedded_config(), &cases)?;
    ensure!(collected.isolated == Some(true), "multi-case runs are isolated");

    let report = collected.case("Noisy.non_utf8_stdout")?;
    ensure!(report.passed, "invalid UTF-8 on stdout doesn't fail the case: {report:?}");
    ensure!(
        report.output.lines().any(|line| line == "caf\u{fffd}"),
        "output is decoded lossily: {:?}",
        report.output
    );
    ensure!(stats.passed == 2, "{stats:?}");
    Ok(())
}

fn marker_lookalikes_are_output() -> Result<()> {
    let registry = registry();
    let cases = [case("Noisy", "marker_lookalikes"), case("Counter", "increments")];
    let (stats, collected) = run(&registry, &embedded_config(), &cases)?;

    let report = collected.case("Noisy.marker_lookalikes")?;
    ensure!(report.passed, "lines without the context's token are output: {report:?}");
    let lines: Vec<_> = report.output.lines().collect();
    ensure!(
        lines.contains(&"@isotest: this is just a log line"),
        "{lines:?}"
    );
    ensure!(
        lines
            .iter()
            .any(|line| line.starts_with("@isotest::") && line.contains("forged")),
        "a well-formed message without the token is output too: {lines:?}"
    );
    ensure!(stats.passed == 2 && stats.failed == 0, "{stats:?}");
    Ok(())
}

fn malformed_protocol_line_fails_the_case() -> Result<()> {
    let registry = registry();
    let neutral = NeutralSettings::default();
    let isolator = ProcessIsolator::new(WorkerProgram::CurrentExe, &neutral).with_worker_env(
        BTreeMap::from([(MALFORMED_WORKER_ENV.to_owned(), "1".to_owned())]),
    );
    let boundary = IsolationBoundary::new(&registry, Box::new(isolator), neutral);
    let request = case("Counter", "increments").to_request();

    match boundary.run_isolated(&request, &TestOutput::discard(), &mut NoHooks) {
        Outcome::Failed {
            failure:
                CaseFailure::Isolation(IsolationError::Protocol {
                    context_name, line, ..
                }),
            ..
        } => {
            ensure!(context_name == "Counter::Counter.increments", "{context_name}");
            ensure!(line.ends_with(r#"{"type":"passed""#), "offending line kept: {line}");
        }
        other => bail!("expected a protocol error, got {other:?}"),
    }
    ensure!(
        COUNTER.load(Ordering::SeqCst) == 0,
        "the case never ran in the host"
    );
    Ok(())
}

fn missing_worker_program_fails_each_case() -> Result<()> {
    let registry = registry();
    let config = embedded_config();
    let profile = config.profile(IsotestConfig::DEFAULT_PROFILE)?;
    let mut builder = TestRunnerBuilder::default();
    builder.set_worker_program(WorkerProgram::Path("/nonexistent/isotest-worker".into()));
    let runner = builder.build(&registry, &profile);

    let cases = [case("Counter", "increments"), case("Reporter", "pid")];
    let mut collected = Collected::default();
    let stats = runner.execute(&cases, |event: TestEvent<'_>| {
        collected.on_event(&event);
        true
    });
    ensure!(
        (stats.failed, stats.finished_count) == (2, 2) && !stats.cancelled,
        "each case failed on its own and the run continued: {stats:?}"
    );
    for name in ["Counter.increments", "Reporter.pid"] {
        let failure = collected
            .case(name)?
            .failure
            .as_ref()
            .ok_or_else(|| eyre!("{name} should fail"))?;
        ensure!(failure.is_isolation, "{failure:?}");
        ensure!(
            failure.message.contains("unable to resolve worker program"),
            "{failure:?}"
        );
    }
    ensure!(collected.starts == collected.finishes, "{collected:#?}");

    // A lone case runs directly and never needs the worker program.
    let mut passed = 0;
    runner.execute(&[case("Reporter", "pid")], |event: TestEvent<'_>| {
        if let TestEventKind::TestPassed { .. } = event.kind {
            passed += 1;
        }
        true
    });
    ensure!(passed == 1, "direct run unaffected by the missing worker");
    Ok(())
}
