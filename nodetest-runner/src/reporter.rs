// Copyright (c) The nodetest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The interface through which runs report progress.

use crate::test_tree::TestNodeId;
use nodetest_protocol::TestIdentity;
use std::time::Duration;

pub use crate::source_map::Location;

/// A test (or file) as seen by a [`RunReporter`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TestHandle {
    /// The node in the test tree.
    pub node: TestNodeId,

    /// The wire identity of the node.
    pub identity: TestIdentity,

    /// A human-readable name for the node.
    pub name: String,
}

/// Why a test or file failed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TestFailure {
    /// The failure message.
    pub message: String,

    /// The expected value of a failed assertion.
    pub expected: Option<String>,

    /// The actual value of a failed assertion.
    pub actual: Option<String>,

    /// How long the test ran for.
    pub duration: Option<Duration>,

    /// Where the failure happened, mapped to original sources.
    pub location: Option<Location>,
}

impl TestFailure {
    /// The message used when a failure doesn't come with one.
    pub const DEFAULT_MESSAGE: &'static str = "Test failed";

    /// Returns `(expected, actual)` if both are known, for displaying a diff.
    pub fn diff(&self) -> Option<(&str, &str)> {
        Some((self.expected.as_deref()?, self.actual.as_deref()?))
    }
}

/// Receives the progress of a run.
///
/// Callbacks are made in the order the corresponding events arrived from the worker, from the
/// task driving the run.
pub trait RunReporter: Send + 'static {
    /// A test started running.
    fn started(&mut self, test: &TestHandle);

    /// A test was skipped or marked todo.
    fn skipped(&mut self, test: &TestHandle);

    /// A test passed.
    fn passed(&mut self, test: &TestHandle, duration: Option<Duration>);

    /// A test or a whole file failed.
    fn failed(&mut self, test: &TestHandle, failure: &TestFailure);

    /// Output was produced, optionally attributed to a location and a test.
    fn append_output(
        &mut self,
        text: &str,
        location: Option<&Location>,
        test: Option<&TestHandle>,
    );
}

impl<R: RunReporter + ?Sized> RunReporter for Box<R> {
    fn started(&mut self, test: &TestHandle) {
        (**self).started(test)
    }

    fn skipped(&mut self, test: &TestHandle) {
        (**self).skipped(test)
    }

    fn passed(&mut self, test: &TestHandle, duration: Option<Duration>) {
        (**self).passed(test, duration)
    }

    fn failed(&mut self, test: &TestHandle, failure: &TestFailure) {
        (**self).failed(test, failure)
    }

    fn append_output(
        &mut self,
        text: &str,
        location: Option<&Location>,
        test: Option<&TestHandle>,
    ) {
        (**self).append_output(text, location, test)
    }
}
