// Copyright (c) The isotest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The test runner.
//!
//! The main structure in this module is [`TestRunner`]. It walks the supplied cases grouped by
//! collection, class and method, publishing a start and a finish event for every grouping, and
//! runs each case through an [`IsolationBoundary`].

use crate::{
    case_runner::ConstructionHooks,
    config::IsotestProfile,
    isolation::{IsolationBoundary, Isolator, Outcome, ProcessIsolator, WorkerProgram},
    list::TestCase,
    registry::{TestOutput, TestRegistry},
    reporter::{EventBus, EventSink, TestEventKind},
    stats::StatsCounter,
    stopwatch::stopwatch,
};
use indexmap::IndexMap;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info};

/// Test runner options.
#[derive(Debug, Default)]
pub struct TestRunnerBuilder {
    isolator: Option<Box<dyn Isolator>>,
    worker_program: Option<WorkerProgram>,
}

impl TestRunnerBuilder {
    /// Sets the program launched for isolated contexts.
    ///
    /// Defaults to the current executable. Ignored if [`set_isolator`](Self::set_isolator) is
    /// called.
    pub fn set_worker_program(&mut self, program: WorkerProgram) -> &mut Self {
        self.worker_program = Some(program);
        self
    }

    /// Replaces the process-based context factory.
    pub fn set_isolator(&mut self, isolator: impl Isolator + 'static) -> &mut Self {
        self.isolator = Some(Box::new(isolator));
        self
    }

    /// Creates a new test runner.
    pub fn build<'r>(
        self,
        registry: &'r TestRegistry,
        profile: &IsotestProfile<'_>,
    ) -> TestRunner<'r> {
        let neutral = profile.neutral_settings();
        let isolator = match self.isolator {
            Some(isolator) => isolator,
            None => Box::new(
                ProcessIsolator::new(
                    self.worker_program.unwrap_or(WorkerProgram::CurrentExe),
                    &neutral,
                )
                .with_worker_env(profile.worker_env())
                .with_forward_stderr(profile.forward_worker_stderr()),
            ),
        };
        TestRunner {
            boundary: IsolationBoundary::new(registry, isolator, neutral),
            report_class_construction: profile.report_class_construction(),
        }
    }
}

/// Runs test cases, one at a time, reporting lifecycle events to a sink.
#[derive(Debug)]
pub struct TestRunner<'r> {
    boundary: IsolationBoundary<'r>,
    report_class_construction: bool,
}

impl TestRunner<'_> {
    /// A description of this runner, reported when the run starts.
    pub const DESCRIPTION: &'static str = "isotest isolated runner";

    /// Executes the given cases, publishing events to `sink`.
    ///
    /// Every case runs in its own isolated context, unless `cases` holds exactly one case, in which
    /// case it runs directly in the current context. Once the sink asks to stop, no further
    /// groupings are started, but each grouping already started still gets its finish event.
    pub fn execute(&self, cases: &[TestCase], mut sink: impl EventSink) -> RunStats {
        let run_stopwatch = stopwatch();
        let isolate = cases.len() != 1;
        debug!(
            start_time = %run_stopwatch.start_time(),
            case_count = cases.len(),
            isolate,
            "starting run"
        );

        let mut bus = EventBus::new(&mut sink, run_stopwatch);
        let assembly_counter = StatsCounter::new(None);

        let mut run = bus.publish(TestEventKind::AssemblyStarting {
            case_count: cases.len(),
            runner: Self::DESCRIPTION,
            isolated: isolate,
        });
        for (collection, cases) in group_by(cases, |case| &case.collection) {
            if !run {
                break;
            }
            let collection_counter = assembly_counter.child();
            run &= bus.publish(TestEventKind::CollectionStarting { collection });
            for (class, cases) in group_by(cases, |case| &case.class) {
                if !run {
                    break;
                }
                let class_counter = collection_counter.child();
                run &= bus.publish(TestEventKind::ClassStarting { collection, class });
                for (method, cases) in group_by(cases, |case| &case.method) {
                    if !run {
                        break;
                    }
                    let method_counter = class_counter.child();
                    run &= bus.publish(TestEventKind::MethodStarting { class, method });
                    for case in cases {
                        if !run {
                            break;
                        }
                        run &= self.run_case(case, &method_counter, &mut bus, isolate);
                    }
                    run &= bus.publish(TestEventKind::MethodFinished {
                        class,
                        method,
                        stats: method_counter.snapshot(),
                    });
                }
                run &= bus.publish(TestEventKind::ClassFinished {
                    collection,
                    class,
                    stats: class_counter.snapshot(),
                });
            }
            run &= bus.publish(TestEventKind::CollectionFinished {
                collection,
                stats: collection_counter.snapshot(),
            });
        }
        bus.publish(TestEventKind::AssemblyFinished {
            stats: assembly_counter.snapshot(),
        });

        let stats = RunStats {
            initial_case_count: cases.len(),
            finished_count: assembly_counter.run_count() + assembly_counter.skipped_count(),
            passed: assembly_counter.passed_count(),
            failed: assembly_counter.failed_count(),
            skipped: assembly_counter.skipped_count(),
            cancelled: bus.stop_requested(),
        };
        info!(
            passed = stats.passed,
            failed = stats.failed,
            skipped = stats.skipped,
            cancelled = stats.cancelled,
            "run finished"
        );
        stats
    }

    // Runs a single case, returning false if the sink asked to stop.
    //
    // A case whose start event was published always runs to completion and gets its finish event,
    // even if the sink asked to stop on that start event.
    fn run_case(
        &self,
        case: &TestCase,
        parent: &StatsCounter<'_>,
        bus: &mut EventBus<'_>,
        isolate: bool,
    ) -> bool {
        let counter = parent.child();
        let mut run = bus.publish(TestEventKind::CaseStarting { case });

        let output = OutputBuffer::default();
        let outcome = match &case.skip_reason {
            Some(reason) => Outcome::Skipped {
                reason: reason.clone(),
            },
            None => {
                run &= bus.publish(TestEventKind::TestStarting { case });
                let request = case.to_request();
                let test_output = output.test_output();
                let mut hooks = ConstructionReporter {
                    bus: &mut *bus,
                    case,
                    enabled: self.report_class_construction,
                    run: &mut run,
                };
                if isolate {
                    self.boundary.run_isolated(&request, &test_output, &mut hooks)
                } else {
                    self.boundary.run_direct(&request, &test_output, &mut hooks)
                }
            }
        };

        let output = output.take();
        match &outcome {
            Outcome::Skipped { reason } => {
                counter.record_skipped();
                run &= bus.publish(TestEventKind::TestSkipped { case, reason });
            }
            Outcome::Passed { elapsed } => {
                counter.record_passed();
                run &= bus.publish(TestEventKind::TestPassed {
                    case,
                    elapsed: *elapsed,
                    output: &output,
                });
            }
            Outcome::Failed { elapsed, failure } => {
                debug!(case = %case.display_name, %failure, "case failed");
                counter.record_failed();
                run &= bus.publish(TestEventKind::TestFailed {
                    case,
                    elapsed: *elapsed,
                    output: &output,
                    failure,
                });
            }
        }
        run &= bus.publish(TestEventKind::CaseFinished {
            case,
            stats: counter.snapshot(),
            output: &output,
        });
        run
    }
}

/// Statistics for a completed run.
#[derive(Copy, Clone, Default, Debug, Eq, PartialEq)]
pub struct RunStats {
    /// The number of cases supplied to the run.
    ///
    /// If the run is cancelled, this will be more than `finished_count` at the end.
    pub initial_case_count: usize,

    /// The number of cases that finished, including skipped ones.
    pub finished_count: usize,

    /// The number of cases that passed.
    pub passed: usize,

    /// The number of cases that failed.
    pub failed: usize,

    /// The number of cases that were skipped.
    pub skipped: usize,

    /// True if the sink asked to stop at any point.
    pub cancelled: bool,
}

impl RunStats {
    /// Returns true if this run is considered a success.
    ///
    /// A run is a failure if it was cancelled before every case finished, or if any case failed.
    pub fn is_success(&self) -> bool {
        if self.initial_case_count > self.finished_count {
            return false;
        }
        self.failed == 0
    }

    /// Returns the number of cases that ran, excluding skipped ones.
    pub fn run_count(&self) -> usize {
        self.passed + self.failed
    }
}

/// Groups cases by `key`, keeping groups and the cases within them in first-seen order.
fn group_by<'a>(
    cases: impl IntoIterator<Item = &'a TestCase>,
    key: impl Fn(&'a TestCase) -> &'a String,
) -> IndexMap<&'a str, Vec<&'a TestCase>> {
    let mut groups: IndexMap<&'a str, Vec<&'a TestCase>> = IndexMap::new();
    for case in cases {
        groups.entry(key(case).as_str()).or_default().push(case);
    }
    groups
}

/// Accumulates the output lines written by one case.
#[derive(Clone, Default)]
struct OutputBuffer {
    text: Arc<Mutex<String>>,
}

impl OutputBuffer {
    fn test_output(&self) -> TestOutput {
        let text = self.text.clone();
        TestOutput::new(move |line| {
            let mut text = text.lock().unwrap_or_else(PoisonError::into_inner);
            text.push_str(line);
            text.push('\n');
        })
    }

    fn take(&self) -> String {
        std::mem::take(&mut *self.text.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

/// Publishes class construction events, if enabled.
struct ConstructionReporter<'b, 's, 'a> {
    bus: &'b mut EventBus<'s>,
    case: &'a TestCase,
    enabled: bool,
    run: &'b mut bool,
}

impl ConstructionHooks for ConstructionReporter<'_, '_, '_> {
    fn on_constructing(&mut self) {
        if self.enabled {
            *self.run &= self
                .bus
                .publish(TestEventKind::ClassConstructionStarting { case: self.case });
        }
    }

    fn on_constructed(&mut self) {
        if self.enabled {
            *self.run &= self
                .bus
                .publish(TestEventKind::ClassConstructionFinished { case: self.case });
        }
    }
}
