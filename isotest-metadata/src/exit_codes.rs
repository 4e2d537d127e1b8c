// Copyright (c) The isotest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

/// Documented exit codes for isotest worker processes.
///
/// A worker always reports the outcome of its case over the protocol stream before exiting. The
/// exit code is a secondary signal the host uses to describe workers that died early.
///
/// Unknown/unexpected failures will always result in exit code 1.
pub enum WorkerExitCode {}

impl WorkerExitCode {
    /// The case ran to completion and passed.
    pub const OK: i32 = 0;

    /// The case ran to completion and failed. The failure was reported over the protocol stream.
    pub const CASE_FAILED: i32 = 100;

    /// The request could not be read from stdin or failed to deserialize.
    pub const BAD_REQUEST: i32 = 96;

    /// Writing a protocol message to stdout failed.
    pub const WRITE_OUTPUT_ERROR: i32 = 110;
}
