// Copyright (c) The isotest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The isolation boundary: runs one test case in a fresh execution context, or directly in the
//! current one.
//!
//! An isolated context is a short-lived worker process. The host resolves the worker program in
//! its own view of the filesystem and launches it by path, so the code and statics the case sees
//! are a fresh copy that nothing else will observe. The context is owned by a single
//! [`IsolationBoundary::run_isolated`] call and is torn down before that call returns.
//!
//! Both modes run under an [`AmbientGuard`], so ambient settings changed by a case never leak into
//! the next one.

use crate::{
    ambient::{AmbientGuard, NeutralSettings},
    case_runner::{CaseCallbacks, CaseRunner, ConstructionHooks},
    errors::{CaseFailure, IsolationError},
    registry::{TestOutput, TestRegistry},
    stopwatch::stopwatch,
    worker::{CONTEXT_NAME_ENV, WORKER_SUBCOMMAND},
};
use camino::{Utf8Path, Utf8PathBuf};
use isotest_metadata::{CaseRequest, WorkerMessage};
use std::{
    collections::BTreeMap,
    fmt,
    io::{BufRead, BufReader},
    time::Duration,
};
use tracing::{debug, debug_span};

/// The outcome of a single test case. Computed exactly once per case.
#[derive(Debug)]
pub enum Outcome {
    /// The case was not run.
    Skipped {
        /// Why the case was skipped.
        reason: String,
    },

    /// The case passed.
    Passed {
        /// How long the case took.
        elapsed: Duration,
    },

    /// The case failed.
    Failed {
        /// How long the case took.
        elapsed: Duration,

        /// Why the case failed.
        failure: CaseFailure,
    },
}

/// Creates isolated execution contexts.
///
/// An implementation creates a brand new context for every call, runs the case described by
/// `request` inside it, forwards everything the case reports to `callbacks` and `output`, and
/// discards the context before returning.
pub trait Isolator: fmt::Debug {
    /// Runs one case in a new context.
    ///
    /// Returns an error if the context could not be created, could not be talked to, or went away
    /// before reporting an outcome.
    fn run_in_new_context(
        &self,
        request: &CaseRequest,
        output: &TestOutput,
        callbacks: &mut dyn CaseCallbacks,
    ) -> Result<(), IsolationError>;
}

/// The program launched as an isolated worker.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum WorkerProgram {
    /// The currently running executable. It must call [`crate::worker::dispatch`] on startup.
    CurrentExe,

    /// A specific executable.
    Path(Utf8PathBuf),
}

impl WorkerProgram {
    /// Resolves the program to a canonical path, in the host's view of the filesystem.
    pub fn resolve(&self) -> Result<Utf8PathBuf, IsolationError> {
        let program = match self {
            Self::CurrentExe => std::env::current_exe().map_err(IsolationError::CurrentExe)?,
            Self::Path(path) => path.as_std_path().to_owned(),
        };
        let canonical = program
            .canonicalize()
            .map_err(|error| IsolationError::ResolveProgram {
                program: Utf8PathBuf::from(program.to_string_lossy().into_owned()),
                error,
            })?;
        Utf8PathBuf::try_from(canonical)
            .map_err(|error| IsolationError::NonUtf8Program {
                program: error.into_path_buf(),
            })
    }
}

/// Runs each case in its own worker process.
#[derive(Clone, Debug)]
pub struct ProcessIsolator {
    program: WorkerProgram,
    locale: String,
    worker_env: BTreeMap<String, String>,
    forward_stderr: bool,
}

impl ProcessIsolator {
    /// Creates an isolator that launches `program`, applying `neutral`'s locale to every worker.
    pub fn new(program: WorkerProgram, neutral: &NeutralSettings) -> Self {
        Self {
            program,
            locale: neutral.locale.clone(),
            worker_env: BTreeMap::new(),
            forward_stderr: true,
        }
    }

    /// Sets extra environment variables for every worker.
    pub fn with_worker_env(mut self, worker_env: BTreeMap<String, String>) -> Self {
        self.worker_env = worker_env;
        self
    }

    /// Sets whether a worker's stderr is included when it dies without reporting an outcome.
    pub fn with_forward_stderr(mut self, forward_stderr: bool) -> Self {
        self.forward_stderr = forward_stderr;
        self
    }

    fn spawn(
        &self,
        program: &Utf8Path,
        request: &CaseRequest,
    ) -> Result<duct::ReaderHandle, IsolationError> {
        let stdin = request
            .to_json()
            .map_err(|error| IsolationError::SerializeRequest {
                context_name: request.context_name.clone(),
                error,
            })?;

        let mut expression = duct::cmd(program.as_std_path(), [WORKER_SUBCOMMAND])
            .stdin_bytes(stdin)
            .stderr_capture()
            .unchecked();
        for (key, value) in &self.worker_env {
            expression = expression.env(key, value);
        }
        // Set after worker-env so the neutral baseline always wins.
        expression = expression
            .env("LC_ALL", &self.locale)
            .env("LANG", &self.locale)
            .env(CONTEXT_NAME_ENV, &request.context_name);

        expression
            .reader()
            .map_err(|error| IsolationError::Spawn {
                program: program.to_owned(),
                context_name: request.context_name.clone(),
                error,
            })
    }
}

impl Isolator for ProcessIsolator {
    fn run_in_new_context(
        &self,
        request: &CaseRequest,
        output: &TestOutput,
        callbacks: &mut dyn CaseCallbacks,
    ) -> Result<(), IsolationError> {
        let program = self.program.resolve()?;
        let request = CaseRequest {
            protocol_token: protocol_token(),
            ..request.clone()
        };
        debug!(%program, "spawning worker");
        let reader = self.spawn(&program, &request)?;

        let read_error = |error: std::io::Error| IsolationError::Read {
            context_name: request.context_name.clone(),
            error,
        };

        // Dropping the reader before EOF kills the worker, so every early return below also tears
        // the context down.
        let mut reported_outcome = false;
        for line in BufReader::new(&reader).split(b'\n') {
            let mut line = line.map_err(read_error)?;
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            // Protocol lines are always UTF-8. Anything else the case wrote is output.
            let line = String::from_utf8_lossy(&line);
            let message = match WorkerMessage::parse_line(&line, &request.protocol_token) {
                None => {
                    output.write_line(&line);
                    continue;
                }
                Some(Ok(message)) => message,
                Some(Err(error)) => {
                    return Err(IsolationError::Protocol {
                        context_name: request.context_name.clone(),
                        line: line.into_owned(),
                        error,
                    });
                }
            };
            reported_outcome |= message.is_outcome();
            match message {
                WorkerMessage::ConstructionStarting => callbacks.on_constructing(),
                WorkerMessage::ConstructionFinished => callbacks.on_constructed(),
                WorkerMessage::Output { line } => output.write_line(&line),
                WorkerMessage::Passed { elapsed } => callbacks.on_success(seconds(elapsed)),
                WorkerMessage::Failed { elapsed, failure } => {
                    let failure = CaseFailure::Remote { summary: failure };
                    callbacks.on_failure(seconds(elapsed), failure);
                }
            }
        }

        // After EOF the handle is internally waited on, so try_wait() returns the output.
        let (exit_code, stderr) = match reader.try_wait().map_err(read_error)? {
            Some(result) => (
                result.status.code(),
                if self.forward_stderr {
                    String::from_utf8_lossy(&result.stderr).into_owned()
                } else {
                    String::new()
                },
            ),
            None => (None, String::new()),
        };
        debug!(?exit_code, reported_outcome, "worker exited");

        if reported_outcome {
            Ok(())
        } else {
            Err(IsolationError::NoOutcome {
                context_name: request.context_name.clone(),
                exit_code,
                stderr,
            })
        }
    }
}

/// A fresh token for one context's protocol lines.
fn protocol_token() -> String {
    format!("{:016x}", rand::random::<u64>())
}

fn seconds(elapsed: f64) -> Duration {
    Duration::try_from_secs_f64(elapsed).unwrap_or_default()
}

/// Runs single test cases either in a fresh context or directly, under ambient isolation.
#[derive(Debug)]
pub struct IsolationBoundary<'r> {
    registry: &'r TestRegistry,
    isolator: Box<dyn Isolator + 'r>,
    neutral: NeutralSettings,
}

impl<'r> IsolationBoundary<'r> {
    /// Creates a new boundary.
    pub fn new(
        registry: &'r TestRegistry,
        isolator: Box<dyn Isolator + 'r>,
        neutral: NeutralSettings,
    ) -> Self {
        Self {
            registry,
            isolator,
            neutral,
        }
    }

    /// Runs the case in a new execution context created for this call only.
    ///
    /// Failing to create or talk to the context fails this case and nothing else.
    pub fn run_isolated(
        &self,
        request: &CaseRequest,
        output: &TestOutput,
        hooks: &mut dyn ConstructionHooks,
    ) -> Outcome {
        let _span = debug_span!("isolated", context = %request.context_name).entered();
        let _guard = AmbientGuard::enter(&self.neutral);
        let stopwatch = stopwatch();
        let mut recorder = OutcomeRecorder::new(hooks);
        let result = self
            .isolator
            .run_in_new_context(request, output, &mut recorder);
        match (recorder.outcome, result) {
            (Some(outcome), Ok(())) => outcome,
            (Some(outcome), Err(error)) => {
                // The case already reported; a failure tearing the context down doesn't change
                // that.
                debug!(%error, "isolation error after the case reported its outcome");
                outcome
            }
            (None, Err(error)) => Outcome::Failed {
                elapsed: stopwatch.elapsed(),
                failure: CaseFailure::Isolation(error),
            },
            (None, Ok(())) => Outcome::Failed {
                elapsed: stopwatch.elapsed(),
                failure: CaseFailure::Isolation(IsolationError::NoOutcome {
                    context_name: request.context_name.clone(),
                    exit_code: None,
                    stderr: String::new(),
                }),
            },
        }
    }

    /// Runs the case in the current execution context, without creating or loading anything.
    pub fn run_direct(
        &self,
        request: &CaseRequest,
        output: &TestOutput,
        hooks: &mut dyn ConstructionHooks,
    ) -> Outcome {
        let _span = debug_span!("direct", context = %request.context_name).entered();
        let _guard = AmbientGuard::enter(&self.neutral);
        let mut recorder = OutcomeRecorder::new(hooks);
        CaseRunner::new(self.registry).execute(request, output, &mut recorder);
        match recorder.outcome {
            Some(outcome) => outcome,
            None => unreachable!("CaseRunner::execute always reports an outcome"),
        }
    }
}

/// Captures the first outcome reported for a case, forwarding construction hooks.
struct OutcomeRecorder<'a> {
    hooks: &'a mut dyn ConstructionHooks,
    outcome: Option<Outcome>,
}

impl<'a> OutcomeRecorder<'a> {
    fn new(hooks: &'a mut dyn ConstructionHooks) -> Self {
        Self {
            hooks,
            outcome: None,
        }
    }
}

impl ConstructionHooks for OutcomeRecorder<'_> {
    fn on_constructing(&mut self) {
        self.hooks.on_constructing();
    }

    fn on_constructed(&mut self) {
        self.hooks.on_constructed();
    }
}

impl CaseCallbacks for OutcomeRecorder<'_> {
    fn on_success(&mut self, elapsed: Duration) {
        if self.outcome.is_none() {
            self.outcome = Some(Outcome::Passed { elapsed });
        }
    }

    fn on_failure(&mut self, elapsed: Duration, failure: CaseFailure) {
        if self.outcome.is_none() {
            self.outcome = Some(Outcome::Failed { elapsed, failure });
        }
    }
}
