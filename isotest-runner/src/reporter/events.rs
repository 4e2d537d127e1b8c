// Copyright (c) The isotest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::{errors::CaseFailure, list::TestCase, stats::GroupStats};
use chrono::{DateTime, FixedOffset};
use std::time::Duration;

/// A test event.
///
/// Events are produced by a [`TestRunner`](crate::runner::TestRunner) and consumed by an
/// [`EventSink`](super::EventSink).
#[derive(Clone, Debug)]
pub struct TestEvent<'a> {
    /// The time at which the event was generated, including the offset from UTC.
    pub timestamp: DateTime<FixedOffset>,

    /// The amount of time elapsed since the start of the run.
    pub elapsed: Duration,

    /// The kind of test event this is.
    pub kind: TestEventKind<'a>,
}

/// The kind of test event this is.
///
/// Forms part of [`TestEvent`].
#[derive(Clone, Debug)]
pub enum TestEventKind<'a> {
    /// The run started.
    AssemblyStarting {
        /// The number of cases supplied to the run.
        case_count: usize,

        /// A description of the runner.
        runner: &'a str,

        /// True if cases run in isolated contexts, false if the single case runs directly.
        isolated: bool,
    },

    /// A collection started.
    CollectionStarting {
        /// The collection.
        collection: &'a str,
    },

    /// A class started.
    ClassStarting {
        /// The collection the class belongs to.
        collection: &'a str,

        /// The class.
        class: &'a str,
    },

    /// A method started.
    MethodStarting {
        /// The class the method belongs to.
        class: &'a str,

        /// The method.
        method: &'a str,
    },

    /// A case started.
    CaseStarting {
        /// The case.
        case: &'a TestCase,
    },

    /// A case was skipped.
    TestSkipped {
        /// The case.
        case: &'a TestCase,

        /// Why it was skipped.
        reason: &'a str,
    },

    /// A case is about to run.
    TestStarting {
        /// The case.
        case: &'a TestCase,
    },

    /// The test class for a case is about to be constructed.
    ///
    /// Only emitted if the profile enables `report-class-construction`.
    ClassConstructionStarting {
        /// The case.
        case: &'a TestCase,
    },

    /// The test class for a case was constructed.
    ///
    /// Only emitted if the profile enables `report-class-construction`.
    ClassConstructionFinished {
        /// The case.
        case: &'a TestCase,
    },

    /// A case passed.
    TestPassed {
        /// The case.
        case: &'a TestCase,

        /// How long the case took.
        elapsed: Duration,

        /// Output written by the case.
        output: &'a str,
    },

    /// A case failed.
    TestFailed {
        /// The case.
        case: &'a TestCase,

        /// How long the case took.
        elapsed: Duration,

        /// Output written by the case.
        output: &'a str,

        /// Why the case failed.
        failure: &'a CaseFailure,
    },

    /// A case finished.
    CaseFinished {
        /// The case.
        case: &'a TestCase,

        /// Counts for this case.
        stats: GroupStats,

        /// Output written by the case.
        output: &'a str,
    },

    /// A method finished.
    MethodFinished {
        /// The class the method belongs to.
        class: &'a str,

        /// The method.
        method: &'a str,

        /// Aggregated counts for the method.
        stats: GroupStats,
    },

    /// A class finished.
    ClassFinished {
        /// The collection the class belongs to.
        collection: &'a str,

        /// The class.
        class: &'a str,

        /// Aggregated counts for the class.
        stats: GroupStats,
    },

    /// A collection finished.
    CollectionFinished {
        /// The collection.
        collection: &'a str,

        /// Aggregated counts for the collection.
        stats: GroupStats,
    },

    /// The run finished.
    AssemblyFinished {
        /// Aggregated counts for the whole run.
        stats: GroupStats,
    },
}

/// A level of the test hierarchy.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub enum GroupingLevel {
    /// The whole run.
    Assembly,
    /// A test collection.
    Collection,
    /// A test class.
    Class,
    /// A test method.
    Method,
    /// A single case.
    Case,
}

impl TestEventKind<'_> {
    /// If this event opens a grouping, returns its level.
    pub fn starts(&self) -> Option<GroupingLevel> {
        match self {
            Self::AssemblyStarting { .. } => Some(GroupingLevel::Assembly),
            Self::CollectionStarting { .. } => Some(GroupingLevel::Collection),
            Self::ClassStarting { .. } => Some(GroupingLevel::Class),
            Self::MethodStarting { .. } => Some(GroupingLevel::Method),
            Self::CaseStarting { .. } => Some(GroupingLevel::Case),
            _ => None,
        }
    }

    /// If this event closes a grouping, returns its level.
    pub fn finishes(&self) -> Option<GroupingLevel> {
        match self {
            Self::AssemblyFinished { .. } => Some(GroupingLevel::Assembly),
            Self::CollectionFinished { .. } => Some(GroupingLevel::Collection),
            Self::ClassFinished { .. } => Some(GroupingLevel::Class),
            Self::MethodFinished { .. } => Some(GroupingLevel::Method),
            Self::CaseFinished { .. } => Some(GroupingLevel::Case),
            _ => None,
        }
    }

    /// Returns the aggregated counts carried by a finish event.
    pub fn finish_stats(&self) -> Option<GroupStats> {
        match self {
            Self::AssemblyFinished { stats }
            | Self::CollectionFinished { stats, .. }
            | Self::ClassFinished { stats, .. }
            | Self::MethodFinished { stats, .. }
            | Self::CaseFinished { stats, .. } => Some(*stats),
            _ => None,
        }
    }
}
