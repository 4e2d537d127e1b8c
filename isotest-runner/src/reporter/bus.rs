// Copyright (c) The isotest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::{TestEvent, TestEventKind};
use crate::stopwatch::StopwatchStart;
use chrono::Local;
use debug_ignore::DebugIgnore;
use tracing::info;

/// Receives lifecycle events in order.
///
/// Returning `false` from [`publish`](Self::publish) asks the run to stop: no new groupings are
/// started afterwards, but every grouping already started still receives its finish event.
pub trait EventSink {
    /// Delivers one event. Returns whether the run should continue.
    fn publish(&mut self, event: TestEvent<'_>) -> bool;
}

impl<F> EventSink for F
where
    F: for<'a> FnMut(TestEvent<'a>) -> bool,
{
    fn publish(&mut self, event: TestEvent<'_>) -> bool {
        self(event)
    }
}

/// A synchronous, ordered conduit from the orchestrator to an [`EventSink`].
///
/// The bus stamps every event with the time and the run's elapsed time. It never buffers or
/// reorders.
#[derive(Debug)]
pub(crate) struct EventBus<'s> {
    sink: DebugIgnore<&'s mut dyn EventSink>,
    stopwatch: StopwatchStart,
    stop_requested: bool,
}

impl<'s> EventBus<'s> {
    pub(crate) fn new(sink: &'s mut dyn EventSink, stopwatch: StopwatchStart) -> Self {
        Self {
            sink: DebugIgnore(sink),
            stopwatch,
            stop_requested: false,
        }
    }

    /// Publishes an event, returning the sink's decision.
    pub(crate) fn publish(&mut self, kind: TestEventKind<'_>) -> bool {
        let event = TestEvent {
            timestamp: Local::now().fixed_offset(),
            elapsed: self.stopwatch.elapsed(),
            kind,
        };
        let keep_going = self.sink.publish(event);
        if !keep_going && !self.stop_requested {
            info!("sink requested stop, finishing started groupings");
            self.stop_requested = true;
        }
        keep_going
    }

    /// Returns true if the sink has asked to stop at any point.
    pub(crate) fn stop_requested(&self) -> bool {
        self.stop_requested
    }
}
