// Copyright (c) The isotest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Runs a single test case within the current execution context.
//!
//! The [`CaseRunner`] is the same code whether the context is the host process (direct mode) or a
//! freshly spawned worker (isolated mode). It resolves the case against the registry loaded in the
//! current context, constructs the test class, invokes the method, and reports exactly one of
//! success or failure.

use crate::{
    errors::{CaseFailure, CasePhase},
    registry::{ClassEntry, TestOutput, TestRegistry},
    stopwatch::stopwatch,
};
use isotest_metadata::CaseRequest;
use std::{
    any::Any,
    panic::{AssertUnwindSafe, catch_unwind},
    time::Duration,
};
use tracing::debug;

/// Hooks invoked around test class construction.
pub trait ConstructionHooks {
    /// Called just before the test class is constructed.
    fn on_constructing(&mut self) {}

    /// Called once the test class has been constructed.
    fn on_constructed(&mut self) {}
}

/// Everything a [`CaseRunner`] reports while running a case.
///
/// Exactly one of `on_success` and `on_failure` is called per case.
pub trait CaseCallbacks: ConstructionHooks {
    /// The case passed.
    fn on_success(&mut self, elapsed: Duration);

    /// The case failed.
    fn on_failure(&mut self, elapsed: Duration, failure: CaseFailure);
}

/// Resolves and runs test cases against a registry.
#[derive(Clone, Copy, Debug)]
pub struct CaseRunner<'r> {
    registry: &'r TestRegistry,
}

impl<'r> CaseRunner<'r> {
    /// Creates a runner over the registry loaded in the current context.
    pub fn new(registry: &'r TestRegistry) -> Self {
        Self { registry }
    }

    /// Runs the case described by `request`.
    ///
    /// Failures (including panics) are never propagated: they are reported through `callbacks`.
    pub fn execute(
        &self,
        request: &CaseRequest,
        output: &TestOutput,
        callbacks: &mut dyn CaseCallbacks,
    ) {
        let stopwatch = stopwatch();
        debug!(
            assembly = %request.assembly,
            class = %request.class,
            method = %request.method,
            "executing case"
        );
        match self.execute_inner(request, output, callbacks) {
            Ok(()) => callbacks.on_success(stopwatch.elapsed()),
            Err(failure) => callbacks.on_failure(stopwatch.elapsed(), failure),
        }
    }

    fn execute_inner(
        &self,
        request: &CaseRequest,
        output: &TestOutput,
        callbacks: &mut dyn CaseCallbacks,
    ) -> Result<(), CaseFailure> {
        let assembly =
            self.registry
                .get(&request.assembly)
                .ok_or_else(|| CaseFailure::AssemblyNotFound {
                    assembly: request.assembly.clone(),
                })?;
        let class =
            assembly
                .get_class(&request.class)
                .ok_or_else(|| CaseFailure::ClassNotFound {
                    assembly: request.assembly.clone(),
                    class: request.class.clone(),
                })?;

        let mut session = match assembly.session_callbacks() {
            Some(session_callbacks) => Some(catch_panic(CasePhase::Session, || {
                session_callbacks.create_session(
                    &request.class,
                    &request.method,
                    &request.arguments,
                    output,
                )
            })?),
            None => None,
        };

        callbacks.on_constructing();
        if let Some(session) = &mut session {
            catch_panic(CasePhase::Session, || session.on_creating_test_class())?.map_err(
                |error| CaseFailure::Session {
                    class: request.class.clone(),
                    error,
                },
            )?;
        }
        let mut instance = construct(class, output)?;
        callbacks.on_constructed();

        if !class.has_method(&request.method) {
            return Err(CaseFailure::MethodNotFound {
                class: request.class.clone(),
                method: request.method.clone(),
            });
        }

        let mut invoke = || class.invoke(instance.as_mut(), &request.method, &request.arguments);
        let result = match &mut session {
            Some(session) => catch_panic(CasePhase::Invocation, || {
                session.on_run_test_method(&mut invoke)
            })?,
            None => catch_panic(CasePhase::Invocation, invoke)?,
        };
        result.map_err(|error| CaseFailure::Invocation {
            class: request.class.clone(),
            method: request.method.clone(),
            error,
        })
    }
}

fn construct(class: &dyn ClassEntry, output: &TestOutput) -> Result<Box<dyn Any>, CaseFailure> {
    match catch_panic(CasePhase::Construction, || class.construct(output))? {
        Some(Ok(instance)) => Ok(instance),
        Some(Err(error)) => Err(CaseFailure::Construction {
            class: class.name().to_owned(),
            error,
        }),
        None => Err(CaseFailure::NoConstructor {
            class: class.name().to_owned(),
        }),
    }
}

fn catch_panic<R>(phase: CasePhase, f: impl FnOnce() -> R) -> Result<R, CaseFailure> {
    catch_unwind(AssertUnwindSafe(f)).map_err(|payload| CaseFailure::Panicked {
        phase,
        message: panic_message(payload.as_ref()),
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "(non-string panic payload)".to_owned()
    }
}
