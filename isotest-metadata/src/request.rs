// Copyright (c) The isotest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use serde::{Deserialize, Serialize};

/// A request to run one test case inside a worker.
///
/// Identifies the case by assembly, class and method name, the same way the host's registry does.
/// The worker resolves these names against its own copy of the registry.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CaseRequest {
    /// The name of the assembly the class is registered in.
    pub assembly: String,

    /// The fully qualified class name.
    pub class: String,

    /// The method name.
    pub method: String,

    /// The fixed argument list for this case.
    #[serde(default)]
    pub arguments: Vec<serde_json::Value>,

    /// A unique, human-readable name for the execution context, used for diagnostics.
    pub context_name: String,

    /// The token the worker must include in every protocol line.
    ///
    /// Chosen by the host for each context and only ever sent on stdin, so lines the case writes
    /// to stdout itself are never mistaken for protocol messages.
    #[serde(default)]
    pub protocol_token: String,
}

impl CaseRequest {
    /// Serializes this request into the form written to a worker's stdin.
    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Deserializes a request from a worker's stdin.
    pub fn from_json(input: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(input)
    }
}
