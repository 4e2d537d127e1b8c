// Copyright (c) The isotest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The worker side of process isolation.
//!
//! A binary that runs tests through a [`ProcessIsolator`](crate::isolation::ProcessIsolator) is
//! also its own worker: it must call [`dispatch`] before doing anything else in `main`.
//!
//! ```rust,no_run
//! use isotest_runner::{registry::TestRegistry, worker};
//! use std::process::ExitCode;
//!
//! fn main() -> ExitCode {
//!     let registry = TestRegistry::new();
//!     if let Some(code) = worker::dispatch(&registry) {
//!         return code;
//!     }
//!     // ... run tests as the host ...
//!     ExitCode::SUCCESS
//! }
//! ```

use crate::{
    case_runner::{CaseCallbacks, CaseRunner, ConstructionHooks},
    errors::{CaseFailure, WorkerError},
    registry::{TestOutput, TestRegistry},
};
use isotest_metadata::{CaseRequest, WorkerExitCode, WorkerMessage};
use std::{
    error::Error,
    ffi::OsStr,
    io::{self, Read, Write},
    process::ExitCode,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};
use tracing::debug;

/// The hidden subcommand a worker process is launched with.
pub const WORKER_SUBCOMMAND: &str = "__isotest-worker";

/// The environment variable holding the name of the worker's execution context.
pub const CONTEXT_NAME_ENV: &str = "ISOTEST_CONTEXT_NAME";

/// If this process was launched as an isolated worker, runs the requested case and returns the
/// exit code to terminate with. Otherwise returns `None`.
pub fn dispatch(registry: &TestRegistry) -> Option<ExitCode> {
    let mut args = std::env::args_os().skip(1);
    if args.next().as_deref() != Some(OsStr::new(WORKER_SUBCOMMAND)) {
        return None;
    }

    let code = match run_worker(registry, io::stdin().lock(), io::stdout()) {
        Ok(code) => code,
        Err(error) => {
            let code = error.exit_code();
            eprint!("isotest worker: {error}");
            let mut source = error.source();
            while let Some(cause) = source {
                eprint!("\n  caused by: {cause}");
                source = cause.source();
            }
            eprintln!();
            code
        }
    };
    Some(ExitCode::from(u8::try_from(code).unwrap_or(1)))
}

/// Reads one [`CaseRequest`] from `input`, runs it, and writes protocol messages to `output`.
///
/// Returns the worker exit code: [`WorkerExitCode::OK`] if the case passed and
/// [`WorkerExitCode::CASE_FAILED`] if it failed. Errors are returned only if the request could not
/// be read or the outcome could not be written.
pub fn run_worker(
    registry: &TestRegistry,
    mut input: impl Read,
    output: impl Write + Send + 'static,
) -> Result<i32, WorkerError> {
    let mut buf = Vec::new();
    input
        .read_to_end(&mut buf)
        .map_err(WorkerError::ReadRequest)?;
    let request = CaseRequest::from_json(&buf).map_err(WorkerError::ParseRequest)?;
    debug!(context = %request.context_name, "worker received request");

    let writer = Arc::new(ProtocolWriter::new(output, &request.protocol_token));
    let case_output = {
        let writer = writer.clone();
        TestOutput::new(move |line| {
            writer.send(&WorkerMessage::Output {
                line: line.to_owned(),
            })
        })
    };

    let mut callbacks = WorkerCallbacks {
        writer: &writer,
        passed: None,
    };
    CaseRunner::new(registry).execute(&request, &case_output, &mut callbacks);
    let passed = callbacks.passed;

    writer.finish()?;
    Ok(match passed {
        Some(true) => WorkerExitCode::OK,
        _ => WorkerExitCode::CASE_FAILED,
    })
}

impl WorkerError {
    /// The exit code a worker terminates with after this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::ReadRequest(_) | Self::ParseRequest(_) => WorkerExitCode::BAD_REQUEST,
            Self::Serialize(_) | Self::Write(_) => WorkerExitCode::WRITE_OUTPUT_ERROR,
        }
    }
}

/// Writes protocol lines, remembering the first error.
///
/// Output can be written from any thread the case spawns, so writes are serialized.
struct ProtocolWriter {
    token: String,
    out: Mutex<Box<dyn Write + Send>>,
    error: Mutex<Option<WorkerError>>,
}

impl ProtocolWriter {
    fn new(out: impl Write + Send + 'static, token: &str) -> Self {
        Self {
            token: token.to_owned(),
            out: Mutex::new(Box::new(out)),
            error: Mutex::new(None),
        }
    }

    fn send(&self, message: &WorkerMessage) {
        if let Err(error) = self.try_send(message) {
            let mut first_error = self.error.lock().unwrap_or_else(PoisonError::into_inner);
            if first_error.is_none() {
                *first_error = Some(error);
            }
        }
    }

    fn try_send(&self, message: &WorkerMessage) -> Result<(), WorkerError> {
        let line = message
            .to_line(&self.token)
            .map_err(WorkerError::Serialize)?;
        let mut out = self.out.lock().unwrap_or_else(PoisonError::into_inner);
        writeln!(out, "{line}").map_err(WorkerError::Write)?;
        out.flush().map_err(WorkerError::Write)
    }

    fn finish(&self) -> Result<(), WorkerError> {
        match self
            .error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

struct WorkerCallbacks<'a> {
    writer: &'a ProtocolWriter,
    passed: Option<bool>,
}

impl ConstructionHooks for WorkerCallbacks<'_> {
    fn on_constructing(&mut self) {
        self.writer.send(&WorkerMessage::ConstructionStarting);
    }

    fn on_constructed(&mut self) {
        self.writer.send(&WorkerMessage::ConstructionFinished);
    }
}

impl CaseCallbacks for WorkerCallbacks<'_> {
    fn on_success(&mut self, elapsed: Duration) {
        self.passed = Some(true);
        self.writer.send(&WorkerMessage::Passed {
            elapsed: elapsed.as_secs_f64(),
        });
    }

    fn on_failure(&mut self, elapsed: Duration, failure: CaseFailure) {
        self.passed = Some(false);
        self.writer.send(&WorkerMessage::Failed {
            elapsed: elapsed.as_secs_f64(),
            failure: failure.to_summary(),
        });
    }
}
