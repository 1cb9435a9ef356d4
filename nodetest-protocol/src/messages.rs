// Copyright (c) The nodetest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    ops::Deref,
};

/// The path of segments that addresses a node in the test tree.
///
/// The first segment is the file id; the rest are nested suite and test names. While a single
/// test process runs, identities grow and shrink like a stack as nested tests start and finish.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TestIdentity(Vec<String>);

impl TestIdentity {
    /// Creates an identity pointing at a file.
    pub fn for_file(file_id: impl Into<String>) -> Self {
        Self(vec![file_id.into()])
    }

    /// Returns the file id, if the identity is non-empty.
    pub fn file_id(&self) -> Option<&str> {
        self.0.first().map(String::as_str)
    }

    /// Returns the segments below the file.
    pub fn test_path(&self) -> &[String] {
        self.0.get(1..).unwrap_or_default()
    }

    /// Sets the segment at `depth`, dropping every segment after it.
    ///
    /// Depth 0 is the file itself, so reported tests start at depth 1.
    pub fn set_at_depth(&mut self, depth: usize, name: impl Into<String>) {
        self.0.truncate(depth);
        // Missing intermediate segments can only happen with a malformed event stream; pad them
        // so that the identity still has the right depth.
        self.0.resize(depth, String::new());
        self.0.push(name.into());
    }

    /// Returns true if `other` is this identity or one of its descendants.
    pub fn contains(&self, other: &TestIdentity) -> bool {
        other.0.starts_with(&self.0)
    }

    /// Consumes self, returning the segments.
    pub fn into_inner(self) -> Vec<String> {
        self.0
    }
}

impl Deref for TestIdentity {
    type Target = [String];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<Vec<String>> for TestIdentity {
    fn from(segments: Vec<String>) -> Self {
        Self(segments)
    }
}

impl<'a> FromIterator<&'a str> for TestIdentity {
    fn from_iter<T: IntoIterator<Item = &'a str>>(iter: T) -> Self {
        Self(iter.into_iter().map(str::to_owned).collect())
    }
}

impl fmt::Display for TestIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join(" > "))
    }
}

/// A location captured from a JavaScript stack trace.
///
/// All fields may be null: native frames have no file, and some frames omit positions.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackFrame {
    /// The file path or URL of the frame.
    #[serde(default)]
    pub file: Option<String>,

    /// The 1-based line number.
    #[serde(default, rename = "lineNumber")]
    pub line_number: Option<u32>,

    /// The 0-based column.
    #[serde(default)]
    pub column: Option<u32>,
}

/// Output written by user code while a test file ran.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// The text that was written.
    pub chunk: String,

    /// The frame that performed the write.
    pub sf: StackFrame,
}

/// One test file to execute, with optional test-name filters.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestRunFile {
    /// The URI-like id results are reported against. For source-mapped tests this may not point
    /// at `path`.
    #[serde(rename = "uri")]
    pub id: String,

    /// The filesystem path of the file to run.
    pub path: String,

    /// Full names of tests to run. `None` runs the whole file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub include: Option<BTreeSet<String>>,

    /// Full names of tests to skip.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exclude: Option<BTreeSet<String>>,
}

/// Extra runtime parameters for files with certain extensions.
///
/// For example, `{ "extensions": ["ts"], "parameters": ["--import", "tsx"] }`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtensionConfig {
    /// File extensions, without the leading dot.
    pub extensions: Vec<String>,

    /// Parameters passed to the runtime before the test file.
    pub parameters: Vec<String>,
}

impl ExtensionConfig {
    /// Returns true if this config applies to a file with the given extension (no leading dot).
    pub fn matches(&self, extension: &str) -> bool {
        self.extensions.iter().any(|e| e == extension)
    }
}

/// How the runtime isolates test files from each other.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Isolation {
    /// Each file in its own process.
    #[default]
    Process,

    /// Files share one process.
    None,
}

impl Isolation {
    /// Returns the value passed on the runtime command line.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Process => "process",
            Self::None => "none",
        }
    }
}

impl fmt::Display for Isolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parameters of the [`WorkerRequest::Start`] request.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartParams {
    /// The maximum number of test processes running at once.
    pub concurrency: usize,

    /// The files to run.
    pub files: Vec<TestRunFile>,

    /// Per-extension runtime parameters.
    pub extensions: Vec<ExtensionConfig>,

    /// Echo every line produced by test processes.
    pub verbose: bool,

    /// Environment variables applied last to every test process.
    pub extra_env: BTreeMap<String, String>,

    /// Directory for V8 coverage output, if coverage is collected.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coverage_dir: Option<String>,

    /// Isolation mode.
    #[serde(default)]
    pub isolation: Isolation,

    /// Force the runtime to exit once tests complete.
    #[serde(default)]
    pub force_exit: bool,

    /// Regenerate snapshot files instead of comparing against them.
    #[serde(default)]
    pub regenerate_snapshots: bool,
}

/// How a [`WorkerRequest::Start`] request completed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum CompleteStatus {
    /// Every file ran.
    Done,

    /// The runtime is older than the minimum supported version; nothing ran.
    NodeVersionOutdated,
}

impl From<CompleteStatus> for u8 {
    fn from(status: CompleteStatus) -> Self {
        match status {
            CompleteStatus::Done => 0,
            CompleteStatus::NodeVersionOutdated => 1,
        }
    }
}

impl TryFrom<u8> for CompleteStatus {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Done),
            1 => Ok(Self::NodeVersionOutdated),
            other => Err(format!("unknown completion status {other}")),
        }
    }
}

/// The response to a [`WorkerRequest::Start`] request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartResult {
    /// The completion status.
    pub status: CompleteStatus,

    /// Extra detail. For [`CompleteStatus::NodeVersionOutdated`], the detected version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl StartResult {
    /// A successful completion.
    pub fn done() -> Self {
        Self {
            status: CompleteStatus::Done,
            message: None,
        }
    }
}

/// Parameters that only carry a test identity.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestIdParams {
    /// The test.
    pub id: TestIdentity,
}

/// Parameters of [`HostNotification::Passed`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PassedParams {
    /// The test.
    pub id: TestIdentity,

    /// Duration in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
}

/// Parameters of [`HostNotification::Failed`].
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FailedParams {
    /// The test.
    pub id: TestIdentity,

    /// Duration in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,

    /// The expected value of a failed assertion, pretty-printed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected: Option<String>,

    /// The actual value of a failed assertion, pretty-printed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual: Option<String>,

    /// The error message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// The parsed stack of the error, innermost frame first.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<Vec<StackFrame>>,
}

/// Parameters of [`HostNotification::Log`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogParams {
    /// The test that was running when the output was written, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<TestIdentity>,

    /// The prefix of the lane that ran the test.
    pub prefix: String,

    /// The output.
    pub log: LogEntry,
}

/// Parameters of [`HostNotification::SourceMap`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceMapParams {
    /// The filesystem path of the test file.
    #[serde(rename = "testFile")]
    pub test_file: String,

    /// The source map URL reported by the runtime. May be a `data:` URL.
    #[serde(rename = "sourceMapURL")]
    pub source_map_url: String,
}

/// Parameters of [`HostNotification::FileFailed`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileFailedParams {
    /// The file id.
    pub uri: String,

    /// Whatever the test process printed before it died.
    pub error: String,
}

/// Notifications sent by the worker to the host.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "camelCase")]
pub enum HostNotification {
    /// A test was dequeued for execution.
    Started(TestIdParams),

    /// A test was skipped or marked todo.
    Skipped(TestIdParams),

    /// A test passed.
    Passed(PassedParams),

    /// A test failed.
    Failed(FailedParams),

    /// Free-form output that isn't attributed to a test.
    Output(String),

    /// Output written by user code.
    Log(LogParams),

    /// The runtime reported a source map for a test file.
    SourceMap(SourceMapParams),

    /// A file failed before any of its tests could report.
    FileFailed(FileFailedParams),
}

impl HostNotification {
    /// Returns the JSON-RPC method name.
    pub fn method(&self) -> &'static str {
        match self {
            Self::Started(_) => "started",
            Self::Skipped(_) => "skipped",
            Self::Passed(_) => "passed",
            Self::Failed(_) => "failed",
            Self::Output(_) => "output",
            Self::Log(_) => "log",
            Self::SourceMap(_) => "sourceMap",
            Self::FileFailed(_) => "fileFailed",
        }
    }
}

/// Requests sent by the host to the worker.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "camelCase")]
pub enum WorkerRequest {
    /// Runs files. Answered with a [`StartResult`] once every file has finished.
    Start(StartParams),

    /// Asks for the runtime version. Answered with a string such as `v22.3.0`.
    Version,
}

impl WorkerRequest {
    /// Returns the JSON-RPC method name.
    pub fn method(&self) -> &'static str {
        match self {
            Self::Start(_) => "start",
            Self::Version => "version",
        }
    }
}

/// Notifications sent by the host to the worker.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "camelCase")]
pub enum WorkerNotification {
    /// Flush outgoing messages and exit.
    Kill,
}
