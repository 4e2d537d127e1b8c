// Copyright (c) The isotest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use serde::{Deserialize, Serialize};
use std::{error, fmt};

/// A message sent by a worker to the host, encoded as a single line on stdout.
///
/// A protocol line is [`WorkerMessage::LINE_PREFIX`], the request's
/// [`protocol_token`](crate::CaseRequest::protocol_token), a `:` and the JSON-encoded message.
/// Any other line, including one that merely starts with the prefix, is output written directly
/// by the test.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum WorkerMessage {
    /// The test class is about to be constructed.
    ConstructionStarting,

    /// The test class was constructed.
    ConstructionFinished,

    /// A line written to the case's output helper.
    Output {
        /// The line, without a trailing newline.
        line: String,
    },

    /// The case passed.
    Passed {
        /// Elapsed time in seconds.
        elapsed: f64,
    },

    /// The case failed.
    Failed {
        /// Elapsed time in seconds.
        elapsed: f64,

        /// A description of the failure and its causes.
        failure: FailureSummary,
    },
}

impl WorkerMessage {
    /// The marker that begins every protocol line.
    pub const LINE_PREFIX: &'static str = "@isotest:";

    /// Encodes this message as a protocol line carrying `token`, without a trailing newline.
    pub fn to_line(&self, token: &str) -> Result<String, serde_json::Error> {
        let json = serde_json::to_string(self)?;
        Ok(format!("{}{token}:{json}", Self::LINE_PREFIX))
    }

    /// Parses a line written by a worker whose protocol token is `token`.
    ///
    /// Returns `None` if the line is not a protocol line for that token.
    pub fn parse_line(line: &str, token: &str) -> Option<Result<Self, serde_json::Error>> {
        let json = line
            .strip_prefix(Self::LINE_PREFIX)?
            .strip_prefix(token)?
            .strip_prefix(':')?;
        Some(serde_json::from_str(json.trim_end()))
    }

    /// Returns true if this message reports the final outcome of a case.
    pub fn is_outcome(&self) -> bool {
        matches!(self, Self::Passed { .. } | Self::Failed { .. })
    }
}

/// The category of a case failure.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
#[non_exhaustive]
pub enum FailureKind {
    /// The assembly was not registered.
    AssemblyNotFound,

    /// The class was not registered in the assembly.
    ClassNotFound,

    /// The method was not registered on the class.
    MethodNotFound,

    /// The class has no usable constructor.
    NoConstructor,

    /// The constructor returned an error.
    Construction,

    /// The method returned an error.
    Invocation,

    /// A constructor, session hook or method panicked.
    Panic,

    /// The isolation boundary itself failed.
    Isolation,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Self::AssemblyNotFound => "assembly-not-found",
            Self::ClassNotFound => "class-not-found",
            Self::MethodNotFound => "method-not-found",
            Self::NoConstructor => "no-constructor",
            Self::Construction => "construction",
            Self::Invocation => "invocation",
            Self::Panic => "panic",
            Self::Isolation => "isolation",
        };
        f.write_str(s)
    }
}

/// A serializable description of a failure, used to carry it across the process boundary.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct FailureSummary {
    /// The category of this failure.
    pub kind: FailureKind,

    /// The top-level message.
    pub message: String,

    /// Messages for each error in the source chain, outermost first.
    #[serde(default)]
    pub causes: Vec<String>,
}

impl FailureSummary {
    /// Builds a summary from an error, walking its source chain.
    pub fn from_error(kind: FailureKind, error: &(dyn error::Error + 'static)) -> Self {
        let mut causes = Vec::new();
        let mut source = error.source();
        while let Some(err) = source {
            causes.push(err.to_string());
            source = err.source();
        }
        Self {
            kind,
            message: error.to_string(),
            causes,
        }
    }
}

impl fmt::Display for FailureSummary {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.message)?;
        for cause in &self.causes {
            write!(f, "\n  caused by: {cause}")?;
        }
        Ok(())
    }
}
