// Copyright (c) The isotest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The list of test cases supplied to a run.

use isotest_metadata::CaseRequest;
use serde_json::Value;
use std::fmt;

/// A single discovered test case.
///
/// Each case belongs to exactly one method, within one class, within one collection, within the
/// assembly being run. Cases are immutable once created.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TestCase {
    /// The name of the assembly the case lives in.
    pub assembly: String,

    /// The collection the case belongs to.
    pub collection: String,

    /// The fully qualified class name.
    pub class: String,

    /// The method name.
    pub method: String,

    /// The name used to report the case.
    pub display_name: String,

    /// The fixed arguments passed to the method.
    pub arguments: Vec<Value>,

    /// If set, the case is not run and is reported as skipped with this reason.
    pub skip_reason: Option<String>,
}

impl TestCase {
    /// Creates a new case with no arguments, in a collection named after its class.
    ///
    /// The display name defaults to `Class.method`.
    pub fn new(
        assembly: impl Into<String>,
        class: impl Into<String>,
        method: impl Into<String>,
    ) -> Self {
        let class = class.into();
        let method = method.into();
        Self {
            assembly: assembly.into(),
            collection: format!("Test collection for {class}"),
            display_name: format!("{class}.{method}"),
            class,
            method,
            arguments: Vec::new(),
            skip_reason: None,
        }
    }

    /// Places the case in the given collection.
    pub fn with_collection(mut self, collection: impl Into<String>) -> Self {
        self.collection = collection.into();
        self
    }

    /// Sets the arguments, and appends them to the display name.
    pub fn with_arguments(mut self, arguments: impl IntoIterator<Item = Value>) -> Self {
        self.arguments = arguments.into_iter().collect();
        self.display_name = format!(
            "{}.{}({})",
            self.class,
            self.method,
            DisplayArguments(&self.arguments)
        );
        self
    }

    /// Overrides the display name.
    pub fn with_display_name(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = display_name.into();
        self
    }

    /// Marks the case as skipped.
    pub fn skip(mut self, reason: impl Into<String>) -> Self {
        self.skip_reason = Some(reason.into());
        self
    }

    /// The name of the execution context created for this case.
    pub fn context_name(&self) -> String {
        format!("{}::{}", self.class, self.display_name)
    }

    /// Builds the request sent to the context that runs this case.
    pub fn to_request(&self) -> CaseRequest {
        CaseRequest {
            assembly: self.assembly.clone(),
            class: self.class.clone(),
            method: self.method.clone(),
            arguments: self.arguments.clone(),
            context_name: self.context_name(),
            // The isolator picks a token for each context.
            protocol_token: String::new(),
        }
    }
}

struct DisplayArguments<'a>(&'a [Value]);

impl fmt::Display for DisplayArguments<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for (index, argument) in self.0.iter().enumerate() {
            if index > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{argument}")?;
        }
        Ok(())
    }
}
