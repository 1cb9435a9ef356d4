// Copyright (c) The nodetest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use camino::{Utf8Path, Utf8PathBuf};
use camino_tempfile::Utf8TempDir;
use color_eyre::eyre::Context;
use nodetest_runner::{
    endpoint::EndpointAllocator,
    orchestrator::Orchestrator,
    reporter::{Location, RunReporter, TestFailure, TestHandle},
};
use std::{
    os::unix::fs::PermissionsExt,
    sync::{Arc, Mutex},
    time::Duration,
};

/// A stand-in for `node`.
///
/// `--version` prints a fixed version. Running a file prints `<file>.events` to stdout and
/// `<file>.stderr` to stderr, sources `<file>.sh` if present, then exits with the code in
/// `<file>.exit` (default 0). The arguments it was run with are written to `<file>.args`, one per
/// line, and `runs.log` next to the file records when each process started and ended.
static FAKE_NODE: &str = r#"#!/bin/sh
if [ "$1" = "--version" ]; then
  echo "@VERSION@"
  exit 0
fi
for arg; do file="$arg"; done
printf '%s\n' "$@" > "$file.args"
log="$(dirname "$file")/runs.log"
echo "start $$ $(basename "$file")" >> "$log"
if [ -f "$file.stderr" ]; then cat "$file.stderr" >&2; fi
if [ -f "$file.events" ]; then cat "$file.events"; fi
if [ -f "$file.sh" ]; then . "$file.sh"; fi
echo "end $$ $(basename "$file")" >> "$log"
if [ -f "$file.exit" ]; then exit "$(cat "$file.exit")"; fi
exit 0
"#;

/// A line of the fake runtime's `runs.log`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct RunLogEntry {
    pub(crate) started: bool,
    pub(crate) pid: u32,
    pub(crate) file: String,
}

/// A temporary project with a fake `node` executable.
#[derive(Debug)]
pub(crate) struct FakeProject {
    dir: Utf8TempDir,
    node: Utf8PathBuf,
}

impl FakeProject {
    pub(crate) fn new(node_version: &str) -> color_eyre::Result<Self> {
        let dir = camino_tempfile::Builder::new()
            .prefix("nodetest-it-")
            .tempdir()
            .wrap_err("failed to create temp dir")?;
        let node = dir.path().join("fake-node");
        std::fs::write(&node, FAKE_NODE.replace("@VERSION@", node_version))
            .wrap_err_with(|| format!("failed to write {node}"))?;
        std::fs::set_permissions(&node, std::fs::Permissions::from_mode(0o755))
            .wrap_err_with(|| format!("failed to make {node} executable"))?;
        Ok(Self { dir, node })
    }

    pub(crate) fn root(&self) -> &Utf8Path {
        self.dir.path()
    }

    /// Writes a test file along with the output the fake runtime produces for it.
    pub(crate) fn add_file(&self, name: &str, events: &str) -> color_eyre::Result<Utf8PathBuf> {
        let path = self.root().join(name);
        std::fs::write(&path, "// fake test file\n")?;
        std::fs::write(format!("{path}.events"), events)?;
        Ok(path)
    }

    pub(crate) fn set_exit_code(&self, file: &Utf8Path, code: i32) -> color_eyre::Result<()> {
        std::fs::write(format!("{file}.exit"), code.to_string())?;
        Ok(())
    }

    /// Runs `script` in the fake runtime's shell after the file's events are printed.
    pub(crate) fn set_script(&self, file: &Utf8Path, script: &str) -> color_eyre::Result<()> {
        std::fs::write(format!("{file}.sh"), script)?;
        Ok(())
    }

    /// Returns the test processes started so far, in order.
    pub(crate) fn run_log(&self) -> color_eyre::Result<Vec<RunLogEntry>> {
        let path = self.root().join("runs.log");
        let log = match std::fs::read_to_string(&path) {
            Ok(log) => log,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(error) => return Err(error).wrap_err_with(|| format!("failed to read {path}")),
        };
        log.lines()
            .map(|line| -> color_eyre::Result<RunLogEntry> {
                let mut parts = line.splitn(3, ' ');
                let (Some(kind), Some(pid), Some(file)) = (parts.next(), parts.next(), parts.next())
                else {
                    color_eyre::eyre::bail!("malformed run log line `{line}`");
                };
                Ok(RunLogEntry {
                    started: kind == "start",
                    pid: pid.parse()?,
                    file: file.to_owned(),
                })
            })
            .collect()
    }

    pub(crate) fn args_for(&self, file: &Utf8Path) -> color_eyre::Result<Vec<String>> {
        let args = std::fs::read_to_string(format!("{file}.args"))
            .wrap_err_with(|| format!("{file} was not run"))?;
        Ok(args.lines().map(str::to_owned).collect())
    }

    pub(crate) fn orchestrator(&self) -> Orchestrator {
        Orchestrator::new(
            Arc::new(EndpointAllocator::new(self.root())),
            self.node.clone(),
            env!("CARGO_BIN_EXE_nodetest-worker"),
        )
    }
}

/// Builds `node:test` reporter event lines.
pub(crate) mod events {
    use serde_json::json;

    pub(crate) fn dequeue(name: &str, nesting: usize) -> String {
        json!({ "type": "test:dequeue", "data": { "name": name, "nesting": nesting } }).to_string()
    }

    pub(crate) fn start(name: &str, nesting: usize) -> String {
        json!({ "type": "test:start", "data": { "name": name, "nesting": nesting } }).to_string()
    }

    pub(crate) fn pass(name: &str, nesting: usize) -> String {
        json!({
            "type": "test:pass",
            "data": { "name": name, "nesting": nesting, "details": { "duration_ms": 2.5 } }
        })
        .to_string()
    }

    pub(crate) fn fail(name: &str, nesting: usize, message: &str) -> String {
        json!({
            "type": "test:fail",
            "data": {
                "name": name,
                "nesting": nesting,
                "details": { "error": { "cause": { "_message": message } } }
            }
        })
        .to_string()
    }

    /// A failure thrown from `file` at `line`.
    pub(crate) fn fail_at(
        name: &str,
        nesting: usize,
        message: &str,
        file: &str,
        line: u32,
    ) -> String {
        json!({
            "type": "test:fail",
            "data": {
                "name": name,
                "nesting": nesting,
                "details": {
                    "error": {
                        "cause": {
                            "_message": message,
                            "_stack": [{ "file": file, "lineNumber": line, "column": 0 }]
                        }
                    }
                }
            }
        })
        .to_string()
    }

    pub(crate) fn log(chunk: &str) -> String {
        json!({ "type": "runner:log", "chunk": chunk, "sf": {} }).to_string()
    }

    /// Runs one passing test at the top level of a file.
    pub(crate) fn passing(name: &str) -> String {
        [dequeue(name, 0), start(name, 0), pass(name, 0)].join("\n") + "\n"
    }
}

/// Records reporter callbacks as strings.
#[derive(Clone, Debug, Default)]
pub(crate) struct RecordingReporter {
    events: Arc<Mutex<Vec<String>>>,
}

impl RecordingReporter {
    pub(crate) fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    fn push(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }
}

impl RunReporter for RecordingReporter {
    fn started(&mut self, test: &TestHandle) {
        self.push(format!("started {}", test.name));
    }

    fn skipped(&mut self, test: &TestHandle) {
        self.push(format!("skipped {}", test.name));
    }

    fn passed(&mut self, test: &TestHandle, _duration: Option<Duration>) {
        self.push(format!("passed {}", test.name));
    }

    fn failed(&mut self, test: &TestHandle, failure: &TestFailure) {
        self.push(format!("failed {}: {}", test.name, failure.message));
    }

    fn append_output(
        &mut self,
        text: &str,
        _location: Option<&Location>,
        test: Option<&TestHandle>,
    ) {
        match test {
            Some(test) => self.push(format!("output [{}] {}", test.name, text.trim_end())),
            None => self.push(format!("output {}", text.trim_end())),
        }
    }
}
