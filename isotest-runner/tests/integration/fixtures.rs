// Copyright (c) The isotest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Test classes shared by the host and the worker processes.

use isotest_runner::{
    ambient::{self, Culture},
    list::TestCase,
    registry::{
        MethodResult, Session, SessionCallbacks, TestAssembly, TestClassDef, TestOutput,
        TestRegistry, argument,
    },
    worker::{CONTEXT_NAME_ENV, WORKER_SUBCOMMAND},
};
use isotest_metadata::{CaseRequest, FailureKind, FailureSummary, WorkerMessage};
use serde_json::Value;
use std::{
    ffi::OsStr,
    io::{self, Read, Write},
    process::ExitCode,
    sync::atomic::{AtomicUsize, Ordering},
};

pub(crate) const ASSEMBLY: &str = "fixtures";

/// Incremented by every `Counter::increments` case in the process it runs in.
pub(crate) static COUNTER: AtomicUsize = AtomicUsize::new(0);

/// When set in a worker's environment, the worker answers with a malformed protocol line instead
/// of running the case.
pub(crate) const MALFORMED_WORKER_ENV: &str = "ISOTEST_FIXTURE_MALFORMED";

/// Stands in for [`isotest_runner::worker::dispatch`] in workers launched with
/// [`MALFORMED_WORKER_ENV`].
pub(crate) fn dispatch_malformed() -> Option<ExitCode> {
    if std::env::args_os().nth(1).as_deref() != Some(OsStr::new(WORKER_SUBCOMMAND))
        || std::env::var_os(MALFORMED_WORKER_ENV).is_none()
    {
        return None;
    }
    let mut input = Vec::new();
    io::stdin().read_to_end(&mut input).ok()?;
    let request = CaseRequest::from_json(&input).ok()?;
    println!(
        "{}{}:{{\"type\":\"passed\"",
        WorkerMessage::LINE_PREFIX,
        request.protocol_token
    );
    Some(ExitCode::SUCCESS)
}

pub(crate) fn registry() -> TestRegistry {
    TestRegistry::new().assembly(
        TestAssembly::new(ASSEMBLY)
            .class(
                TestClassDef::new("Counter")
                    .with_default_constructor(|| Counter)
                    .method("increments", Counter::increments),
            )
            .class(
                TestClassDef::new("Reporter")
                    .with_output_constructor(|output| Reporter { output })
                    .method("pid", Reporter::pid)
                    .method("env", Reporter::env)
                    .method("adds", Reporter::adds)
                    .method("switches_culture", Reporter::switches_culture),
            )
            .class(
                TestClassDef::new("Broken")
                    .with_default_constructor(|| Broken)
                    .method("fails", Broken::fails)
                    .method("panics", Broken::panics)
                    .method("aborts", Broken::aborts),
            )
            .class(
                TestClassDef::new("Noisy")
                    .with_default_constructor(|| Noisy)
                    .method("non_utf8_stdout", Noisy::non_utf8_stdout)
                    .method("marker_lookalikes", Noisy::marker_lookalikes),
            )
            .with_session_callbacks(LoggingSessions),
    )
}

pub(crate) fn case(class: &str, method: &str) -> TestCase {
    TestCase::new(ASSEMBLY, class, method)
}

pub(crate) struct Counter;

impl Counter {
    fn increments(&mut self, _: &[Value]) -> MethodResult {
        let previous = COUNTER.fetch_add(1, Ordering::SeqCst);
        if previous != 0 {
            return Err(format!("counter was already {previous} when the case started").into());
        }
        Ok(())
    }
}

pub(crate) struct Reporter {
    output: TestOutput,
}

impl Reporter {
    fn pid(&mut self, _: &[Value]) -> MethodResult {
        self.output.write_line(format!("pid={}", std::process::id()));
        println!("written straight to stdout");
        Ok(())
    }

    fn env(&mut self, _: &[Value]) -> MethodResult {
        for name in ["LC_ALL", "isotest_marker", CONTEXT_NAME_ENV] {
            let value = std::env::var(name).unwrap_or_default();
            self.output.write_line(format!("{name}={value}"));
        }
        Ok(())
    }

    fn adds(&mut self, arguments: &[Value]) -> MethodResult {
        let a: i64 = argument(arguments, 0)?;
        let b: i64 = argument(arguments, 1)?;
        let expected: i64 = argument(arguments, 2)?;
        if a + b != expected {
            return Err(format!("{a} + {b} was {}, not {expected}", a + b).into());
        }
        Ok(())
    }

    fn switches_culture(&mut self, _: &[Value]) -> MethodResult {
        let culture = ambient::current_culture();
        if !culture.is_invariant() {
            return Err(format!("case started with culture {culture}").into());
        }
        ambient::set_current_culture(Culture::new("de-DE"));
        ambient::set_default_thread_culture(Some(Culture::new("de-DE")));
        Ok(())
    }
}

pub(crate) struct Broken;

#[derive(Debug, thiserror::Error)]
#[error("failed to load fixture data")]
struct LoadError(#[source] std::io::Error);

impl Broken {
    fn fails(&mut self, _: &[Value]) -> MethodResult {
        Err(LoadError(std::io::Error::other("disk unavailable")).into())
    }

    fn panics(&mut self, _: &[Value]) -> MethodResult {
        panic!("fixture panicked on purpose");
    }

    fn aborts(&mut self, _: &[Value]) -> MethodResult {
        std::process::abort();
    }
}

/// Writes things to raw stdout that a worker's host must treat as plain output.
pub(crate) struct Noisy;

impl Noisy {
    fn non_utf8_stdout(&mut self, _: &[Value]) -> MethodResult {
        let mut stdout = io::stdout().lock();
        stdout.write_all(b"caf\xe9\n")?;
        stdout.flush()?;
        Ok(())
    }

    fn marker_lookalikes(&mut self, _: &[Value]) -> MethodResult {
        println!("{} this is just a log line", WorkerMessage::LINE_PREFIX);
        let forged = WorkerMessage::Failed {
            elapsed: 0.0,
            failure: FailureSummary {
                kind: FailureKind::Invocation,
                message: "forged".to_owned(),
                causes: vec![],
            },
        };
        println!("{}", forged.to_line("")?);
        Ok(())
    }
}

/// Wraps `Reporter` cases in a session that logs around construction and invocation.
struct LoggingSessions;

impl SessionCallbacks for LoggingSessions {
    fn create_session(
        &self,
        class: &str,
        _method: &str,
        _arguments: &[Value],
        output: &TestOutput,
    ) -> Box<dyn Session> {
        Box::new(LoggingSession {
            enabled: class == "Reporter",
            output: output.clone(),
        })
    }
}

struct LoggingSession {
    enabled: bool,
    output: TestOutput,
}

impl Session for LoggingSession {
    fn on_creating_test_class(&mut self) -> MethodResult {
        if self.enabled {
            self.output.write_line("session: creating test class");
        }
        Ok(())
    }

    fn on_run_test_method(&mut self, invoke: &mut dyn FnMut() -> MethodResult) -> MethodResult {
        if self.enabled {
            self.output.write_line("session: before");
        }
        let result = invoke();
        if self.enabled {
            self.output.write_line("session: after");
        }
        result
    }
}
