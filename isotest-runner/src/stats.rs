// Copyright (c) The isotest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Hierarchical pass/fail/skip counters.
//!
//! Each grouping in a run (assembly, collection, class, method, case) gets its own
//! [`StatsCounter`], linked to the counter of its enclosing grouping. Recording an outcome on a
//! counter also records it on every ancestor, so a parent's totals always equal the sum of its
//! children's.

use crate::stopwatch::{StopwatchStart, stopwatch};
use std::{cell::Cell, time::Duration};

/// A counter of run outcomes for one grouping, linked to its parent grouping's counter.
///
/// The parent link is a borrow: a child counter can never outlive the grouping that encloses it.
#[derive(Debug)]
pub struct StatsCounter<'a> {
    parent: Option<&'a StatsCounter<'a>>,
    stopwatch: StopwatchStart,
    passed: Cell<usize>,
    failed: Cell<usize>,
    skipped: Cell<usize>,
}

impl<'a> StatsCounter<'a> {
    /// Creates a new counter, starting its clock now.
    pub fn new(parent: Option<&'a StatsCounter<'a>>) -> Self {
        Self {
            parent,
            stopwatch: stopwatch(),
            passed: Cell::new(0),
            failed: Cell::new(0),
            skipped: Cell::new(0),
        }
    }

    /// Creates a counter nested under this one.
    pub fn child(&'a self) -> Self {
        Self::new(Some(self))
    }

    /// Records a passing case here and in every ancestor.
    pub fn record_passed(&self) {
        self.passed.set(self.passed.get() + 1);
        if let Some(parent) = self.parent {
            parent.record_passed();
        }
    }

    /// Records a failing case here and in every ancestor.
    pub fn record_failed(&self) {
        self.failed.set(self.failed.get() + 1);
        if let Some(parent) = self.parent {
            parent.record_failed();
        }
    }

    /// Records a skipped case here and in every ancestor.
    pub fn record_skipped(&self) {
        self.skipped.set(self.skipped.get() + 1);
        if let Some(parent) = self.parent {
            parent.record_skipped();
        }
    }

    /// The number of passed cases.
    pub fn passed_count(&self) -> usize {
        self.passed.get()
    }

    /// The number of failed cases.
    pub fn failed_count(&self) -> usize {
        self.failed.get()
    }

    /// The number of skipped cases.
    pub fn skipped_count(&self) -> usize {
        self.skipped.get()
    }

    /// The number of cases that actually ran: passed + failed. Skipped cases are excluded.
    pub fn run_count(&self) -> usize {
        self.passed_count() + self.failed_count()
    }

    /// The time elapsed since this counter was created.
    pub fn elapsed(&self) -> Duration {
        self.stopwatch.elapsed()
    }

    /// Returns a point-in-time copy of this counter's totals.
    pub fn snapshot(&self) -> GroupStats {
        GroupStats {
            elapsed: self.elapsed(),
            run: self.run_count(),
            passed: self.passed_count(),
            failed: self.failed_count(),
            skipped: self.skipped_count(),
        }
    }
}

/// Totals for a grouping, carried by every `*Finished` event.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct GroupStats {
    /// Time since the grouping started.
    pub elapsed: Duration,

    /// The number of cases that ran (passed + failed).
    pub run: usize,

    /// The number of cases that passed.
    pub passed: usize,

    /// The number of cases that failed.
    pub failed: usize,

    /// The number of cases that were skipped.
    pub skipped: usize,
}
