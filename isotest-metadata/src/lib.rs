// Copyright (c) The isotest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

#![warn(missing_docs)]

//! Wire types for the isotest isolation protocol.
//!
//! The host process sends a [`CaseRequest`] to a freshly spawned worker over stdin. The worker
//! answers with a stream of [`WorkerMessage`]s on stdout, one per line, and exits with one of the
//! codes documented in [`WorkerExitCode`].

mod exit_codes;
mod message;
mod request;

pub use exit_codes::*;
pub use message::*;
pub use request::*;
