// Copyright (c) The isotest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Lifecycle events emitted during a run, and the bus that delivers them to a sink.
//!
//! The main types here are [`TestEvent`] and [`EventSink`].

mod bus;
mod events;

pub use bus::*;
pub use events::*;
