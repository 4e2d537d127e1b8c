// Copyright (c) The isotest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

#![warn(missing_docs)]

//! Core functionality for isotest, a test runner that gives every test case its own disposable
//! execution context.
//!
//! For the basic flow of operations: cases are described by [`list::TestCase`], their code is
//! registered up front in a [`registry::TestRegistry`], and a [`runner::TestRunner`] walks them,
//! running each one through an [`isolation::IsolationBoundary`] and publishing lifecycle events
//! to a [`reporter::EventSink`].

pub mod ambient;
pub mod case_runner;
pub mod config;
pub mod errors;
pub mod isolation;
pub mod list;
pub mod registry;
pub mod reporter;
pub mod runner;
pub mod stats;
mod stopwatch;
pub mod worker;
