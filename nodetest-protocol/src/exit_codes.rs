// Copyright (c) The nodetest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

/// Documented exit codes for `nodetest` failures.
///
/// `nodetest` runs may fail for a variety of reasons. This structure documents the exit codes
/// that may occur in case of expected failures.
///
/// Unknown/unexpected failures will always result in exit code 1.
pub enum NodetestExitCode {}

impl NodetestExitCode {
    /// No errors occurred and nodetest exited normally.
    pub const OK: i32 = 0;

    /// No tests were selected to run, but no other errors occurred.
    pub const NO_TESTS_RUN: i32 = 4;

    /// The run was interrupted by a signal before it completed.
    pub const INTERRUPTED: i32 = 8;

    /// The configured Node.js runtime is older than the minimum supported version.
    pub const NODE_VERSION_UNSUPPORTED: i32 = 50;

    /// A user issue happened while setting up a nodetest invocation.
    pub const SETUP_ERROR: i32 = 96;

    /// One or more tests or test files failed.
    pub const TEST_RUN_FAILED: i32 = 100;

    /// The worker process could not be started, or exited before the run completed.
    pub const WORKER_FAILED: i32 = 101;

    /// Writing data to stdout or stderr produced an error.
    pub const WRITE_OUTPUT_ERROR: i32 = 110;
}
