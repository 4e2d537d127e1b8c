// Copyright (c) The isotest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Errors produced by isotest.

use crate::registry::MethodError;
use camino::Utf8PathBuf;
use config::ConfigError;
use isotest_metadata::{FailureKind, FailureSummary};
use std::{fmt, io};
use thiserror::Error;

/// An error that occurred while parsing the config.
#[derive(Debug, Error)]
#[error("failed to parse isotest config at `{config_file}`")]
#[non_exhaustive]
pub struct ConfigParseError {
    config_file: Utf8PathBuf,
    #[source]
    kind: ConfigParseErrorKind,
}

impl ConfigParseError {
    pub(crate) fn new(config_file: impl Into<Utf8PathBuf>, kind: ConfigParseErrorKind) -> Self {
        Self {
            config_file: config_file.into(),
            kind,
        }
    }

    /// Returns the config file for this error.
    pub fn config_file(&self) -> &Utf8PathBuf {
        &self.config_file
    }

    /// Returns the kind of error this is.
    pub fn kind(&self) -> &ConfigParseErrorKind {
        &self.kind
    }
}

/// The kind of error that occurred while parsing a config.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigParseErrorKind {
    /// An error occurred while building the config.
    #[error(transparent)]
    BuildError(Box<ConfigError>),

    /// An error occurred while deserializing the config.
    #[error(transparent)]
    DeserializeError(Box<ConfigError>),
}

/// An error which indicates that a profile was requested but not known to isotest.
#[derive(Clone, Debug, Error)]
#[error("profile `{profile}` not found (known profiles: {})", .all_profiles.join(", "))]
pub struct ProfileNotFound {
    profile: String,
    all_profiles: Vec<String>,
}

impl ProfileNotFound {
    pub(crate) fn new(
        profile: impl Into<String>,
        all_profiles: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        let mut all_profiles: Vec<_> = all_profiles.into_iter().map(|s| s.into()).collect();
        all_profiles.sort_unstable();
        Self {
            profile: profile.into(),
            all_profiles,
        }
    }
}

/// An error that occurred while creating, talking to or tearing down an isolated execution
/// context.
///
/// These are always reported as a failure of the one case the context was created for.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum IsolationError {
    /// The current executable could not be determined.
    #[error("unable to determine the current executable to use as the worker program")]
    CurrentExe(#[source] io::Error),

    /// The worker program path could not be resolved.
    #[error("unable to resolve worker program `{program}`")]
    ResolveProgram {
        /// The program as configured.
        program: Utf8PathBuf,

        /// The underlying error.
        #[source]
        error: io::Error,
    },

    /// The worker program path is not valid UTF-8.
    #[error("worker program path `{}` is not valid UTF-8", .program.display())]
    NonUtf8Program {
        /// The program path.
        program: std::path::PathBuf,
    },

    /// The case request could not be serialized.
    #[error("failed to serialize the request for context `{context_name}`")]
    SerializeRequest {
        /// The name of the context.
        context_name: String,

        /// The underlying error.
        #[source]
        error: serde_json::Error,
    },

    /// The worker process could not be spawned.
    #[error("failed to spawn worker `{program}` for context `{context_name}`")]
    Spawn {
        /// The worker program.
        program: Utf8PathBuf,

        /// The name of the context.
        context_name: String,

        /// The underlying error.
        #[source]
        error: io::Error,
    },

    /// Reading from or waiting on the worker failed.
    #[error("failed to read from worker for context `{context_name}`")]
    Read {
        /// The name of the context.
        context_name: String,

        /// The underlying error.
        #[source]
        error: io::Error,
    },

    /// The worker wrote a protocol line that could not be parsed.
    #[error("worker for context `{context_name}` sent a malformed message: {line}")]
    Protocol {
        /// The name of the context.
        context_name: String,

        /// The offending line.
        line: String,

        /// The underlying error.
        #[source]
        error: serde_json::Error,
    },

    /// The context went away without reporting whether the case passed or failed.
    #[error(
        "context `{context_name}` exited without reporting an outcome{}{}",
        DisplayExitCode(.exit_code),
        DisplayStderr(.stderr),
    )]
    NoOutcome {
        /// The name of the context.
        context_name: String,

        /// The worker's exit code, if it exited normally.
        exit_code: Option<i32>,

        /// Captured standard error, if forwarding is enabled.
        stderr: String,
    },
}

struct DisplayExitCode<'a>(&'a Option<i32>);

impl fmt::Display for DisplayExitCode<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.0 {
            Some(code) => write!(f, " (exit code {code})"),
            None => Ok(()),
        }
    }
}

struct DisplayStderr<'a>(&'a str);

impl fmt::Display for DisplayStderr<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let stderr = self.0.trim_end();
        if stderr.is_empty() {
            Ok(())
        } else {
            write!(f, ", stderr:\n{stderr}")
        }
    }
}

/// The phase of a case during which a panic occurred.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CasePhase {
    /// Creating the session or running its pre-construction hook.
    Session,

    /// Constructing the test class.
    Construction,

    /// Invoking the test method.
    Invocation,
}

impl fmt::Display for CasePhase {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Session => f.write_str("session setup"),
            Self::Construction => f.write_str("test class construction"),
            Self::Invocation => f.write_str("test method"),
        }
    }
}

/// Why a single test case failed.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CaseFailure {
    /// The assembly is not registered.
    #[error("assembly `{assembly}` is not registered")]
    AssemblyNotFound {
        /// The requested assembly.
        assembly: String,
    },

    /// The class is not registered in the assembly.
    #[error("class `{class}` not found in assembly `{assembly}`")]
    ClassNotFound {
        /// The assembly that was searched.
        assembly: String,

        /// The requested class.
        class: String,
    },

    /// The method is not registered on the class.
    #[error("method `{method}` not found on class `{class}`")]
    MethodNotFound {
        /// The class that was searched.
        class: String,

        /// The requested method.
        method: String,
    },

    /// The class has neither an output-accepting nor a default constructor.
    #[error("class `{class}` has no usable constructor")]
    NoConstructor {
        /// The class.
        class: String,
    },

    /// The session's pre-construction hook returned an error.
    #[error("session setup for `{class}` failed")]
    Session {
        /// The class being constructed.
        class: String,

        /// The error returned by the session.
        #[source]
        error: MethodError,
    },

    /// The constructor returned an error.
    #[error("constructing `{class}` failed")]
    Construction {
        /// The class.
        class: String,

        /// The error returned by the constructor.
        #[source]
        error: MethodError,
    },

    /// The method returned an error.
    #[error("`{class}::{method}` failed")]
    Invocation {
        /// The class.
        class: String,

        /// The method.
        method: String,

        /// The error returned by the method.
        #[source]
        error: MethodError,
    },

    /// A constructor, session hook or method panicked.
    #[error("{phase} panicked: {message}")]
    Panicked {
        /// Where the panic happened.
        phase: CasePhase,

        /// The panic message, if it was a string.
        message: String,
    },

    /// The isolation boundary failed.
    #[error(transparent)]
    Isolation(#[from] IsolationError),

    /// The case failed inside an isolated worker.
    #[error("{summary}")]
    Remote {
        /// The failure as reported by the worker.
        summary: FailureSummary,
    },
}

impl CaseFailure {
    /// Returns the category of this failure.
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::AssemblyNotFound { .. } => FailureKind::AssemblyNotFound,
            Self::ClassNotFound { .. } => FailureKind::ClassNotFound,
            Self::MethodNotFound { .. } => FailureKind::MethodNotFound,
            Self::NoConstructor { .. } => FailureKind::NoConstructor,
            Self::Session { .. } | Self::Construction { .. } => FailureKind::Construction,
            Self::Invocation { .. } => FailureKind::Invocation,
            Self::Panicked { .. } => FailureKind::Panic,
            Self::Isolation(_) => FailureKind::Isolation,
            Self::Remote { summary } => summary.kind,
        }
    }

    /// Returns the error originally produced by test code, if there was one.
    pub fn test_error(&self) -> Option<&MethodError> {
        match self {
            Self::Session { error, .. }
            | Self::Construction { error, .. }
            | Self::Invocation { error, .. } => Some(error),
            _ => None,
        }
    }

    /// Converts this failure into a form that can cross the process boundary.
    pub fn to_summary(&self) -> FailureSummary {
        match self {
            Self::Remote { summary } => summary.clone(),
            other => FailureSummary::from_error(other.kind(), other),
        }
    }
}

/// An error that occurred inside a worker process, outside of any test code.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum WorkerError {
    /// The request could not be read from stdin.
    #[error("failed to read the case request from stdin")]
    ReadRequest(#[source] io::Error),

    /// The request could not be deserialized.
    #[error("failed to parse the case request")]
    ParseRequest(#[source] serde_json::Error),

    /// A protocol message could not be serialized.
    #[error("failed to serialize a protocol message")]
    Serialize(#[source] serde_json::Error),

    /// A protocol message could not be written.
    #[error("failed to write a protocol message to stdout")]
    Write(#[source] io::Error),
}
