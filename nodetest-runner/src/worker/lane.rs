// Copyright (c) The nodetest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Lanes: the units of concurrency within a run.
//!
//! Each lane repeatedly takes the next file from the shared queue and runs it in a child
//! process until the queue is empty.

use super::{
    Notifier,
    inspector::{LISTENING_PREFIX, watch_inspector},
    reducer::{FileEventReducer, ReducerEvent},
};
use crate::{
    helpers::{escape_js_regex, extension_of},
    node_version::NodeVersion,
};
use camino::Utf8Path;
use nodetest_protocol::{FailedParams, HostNotification, StartParams, TestIdentity, TestRunFile};
use owo_colors::{AnsiColors, OwoColorize};
use std::{
    collections::VecDeque,
    process::Stdio,
    sync::{Mutex, PoisonError},
};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    process::Command,
    task::JoinHandle,
};
use tracing::debug;

const LANE_COLORS: [AnsiColors; 7] = [
    AnsiColors::BrightRed,
    AnsiColors::BrightGreen,
    AnsiColors::BrightYellow,
    AnsiColors::BrightBlue,
    AnsiColors::BrightMagenta,
    AnsiColors::BrightCyan,
    AnsiColors::BrightWhite,
];

const WAITING_FOR_DISCONNECT: &str = "Waiting for the debugger to disconnect...";

/// Inspector chatter that isn't worth showing.
const HIDDEN_STDERR_PREFIXES: [&str; 3] = ["For help, see", "Debugger attached", "Debugger ending on"];

/// Everything lanes share for the duration of a run.
pub(super) struct LaneContext<'a> {
    pub(super) params: &'a StartParams,
    pub(super) node_path: &'a str,
    pub(super) version: &'a NodeVersion,
    pub(super) reporter_url: &'a str,
    pub(super) notifier: &'a Notifier,
    pub(super) queue: Mutex<VecDeque<TestRunFile>>,
}

impl LaneContext<'_> {
    fn next_file(&self) -> Option<TestRunFile> {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }
}

/// Returns the colored output prefix for the lane with the given index.
pub(super) fn lane_prefix(index: usize) -> String {
    let label = format!("worker{}> ", index + 1);
    label.color(LANE_COLORS[index % LANE_COLORS.len()]).to_string()
}

/// Runs files from the queue until it's empty.
pub(super) async fn run_lane(cx: &LaneContext<'_>, index: usize) {
    let prefix = lane_prefix(index);
    while let Some(file) = cx.next_file() {
        run_file(cx, &prefix, &file).await;
    }
    debug!("lane {} done", index + 1);
}

async fn run_file(cx: &LaneContext<'_>, prefix: &str, file: &TestRunFile) {
    let verbose = cx.params.verbose;
    if verbose {
        cx.notifier.send(HostNotification::Output(format!(
            "{prefix}starting {}",
            file.path.underline()
        )));
    }

    let args = child_args(cx.params, cx.version, cx.reporter_url, file);
    if verbose {
        cx.notifier.send(HostNotification::Output(format!(
            "{prefix}{} {}",
            cx.node_path,
            args.join(" ")
        )));
    }

    let mut command = Command::new(cx.node_path);
    command
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .env("FORCE_COLOR", "true");
    if let Some(parent) = Utf8Path::new(&file.path).parent().filter(|p| !p.as_str().is_empty()) {
        command.current_dir(parent);
    }
    if let Some(coverage_dir) = &cx.params.coverage_dir {
        command.env("NODE_V8_COVERAGE", coverage_dir);
    }
    command.envs(&cx.params.extra_env);

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(error) => {
            cx.notifier.send(HostNotification::Failed(FailedParams {
                id: TestIdentity::for_file(file.id.clone()),
                error: Some(format!("failed to spawn `{}`: {error}", cx.node_path)),
                ..Default::default()
            }));
            return;
        }
    };

    let mut stdout = LineReader::new(child.stdout.take());
    let mut stderr = LineReader::new(child.stderr.take());
    let mut reducer = FileEventReducer::new(file.id.clone(), prefix, verbose);
    let mut inspector: Option<AbortOnDrop> = None;
    let mut events = Vec::new();

    while !(stdout.is_done() && stderr.is_done()) {
        tokio::select! {
            Some(line) = stdout.next_line(), if !stdout.is_done() => {
                reducer.line(&line, &mut events);
            }
            Some(line) = stderr.next_line(), if !stderr.is_done() => {
                if let Some(url) = line.strip_prefix(LISTENING_PREFIX) {
                    if inspector.is_none() {
                        inspector = Some(AbortOnDrop(tokio::spawn(watch_inspector(
                            url.trim().to_owned(),
                            file.path.clone(),
                            cx.notifier.clone(),
                        ))));
                    }
                } else if line == WAITING_FOR_DISCONNECT {
                    _ = child.start_kill();
                } else if !HIDDEN_STDERR_PREFIXES.iter().any(|p| line.starts_with(p)) {
                    reducer.line(&line, &mut events);
                }
            }
            else => {}
        }

        for event in events.drain(..) {
            match event {
                ReducerEvent::Notify(notification) => cx.notifier.send(notification),
                ReducerEvent::CloseInspector => inspector = None,
            }
        }
    }

    let exit = match child.wait().await {
        Ok(status) if status.success() => None,
        Ok(status) => Some(status.to_string()),
        Err(error) => Some(format!("an unknown status ({error})")),
    };
    drop(inspector);
    if verbose {
        cx.notifier.send(HostNotification::Output(format!(
            "{prefix}finished {} ({})",
            file.path,
            exit.as_deref().unwrap_or("success")
        )));
    }
    for notification in reducer.finish(exit.as_deref()) {
        cx.notifier.send(notification);
    }
}

/// Builds the runtime arguments for a test file.
pub(super) fn child_args(
    params: &StartParams,
    version: &NodeVersion,
    reporter_url: &str,
    file: &TestRunFile,
) -> Vec<String> {
    let mut args = Vec::new();

    if let Some(extension) = extension_of(&file.path) {
        if let Some(config) = params.extensions.iter().find(|c| c.matches(extension)) {
            args.extend(config.parameters.iter().cloned());
        }
    }

    args.push("--test-reporter".to_owned());
    args.push(reporter_url.to_owned());

    let capabilities = version.capabilities();
    if params.force_exit && capabilities.test_force_exit {
        args.push("--test-force-exit".to_owned());
    }
    if capabilities.test_isolation {
        args.push(format!("--test-isolation={}", params.isolation));
    } else if capabilities.experimental_test_isolation {
        args.push(format!("--experimental-test-isolation={}", params.isolation));
    }
    if capabilities.experimental_snapshots {
        args.push("--experimental-test-snapshots".to_owned());
    }
    if params.regenerate_snapshots && version.supports_snapshots() {
        args.push("--test-update-snapshots".to_owned());
    }

    for name in file.include.iter().flatten() {
        args.push("--test-name-pattern".to_owned());
        args.push(format!("^{}$", escape_js_regex(name)));
    }
    if capabilities.test_skip_pattern {
        for name in file.exclude.iter().flatten() {
            args.push("--test-skip-pattern".to_owned());
            args.push(format!("^{}$", escape_js_regex(name)));
        }
    } else if file.exclude.as_ref().is_some_and(|exclude| !exclude.is_empty()) {
        debug!(
            "Node.js {version} can't skip tests by name, running excluded tests in {}",
            file.path
        );
    }

    args.push(file.path.clone());
    args
}

/// Reads lines from a child pipe, tolerating invalid UTF-8.
struct LineReader<R> {
    reader: Option<BufReader<R>>,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    fn new(reader: Option<R>) -> Self {
        Self {
            reader: reader.map(BufReader::new),
            buf: Vec::new(),
        }
    }

    fn is_done(&self) -> bool {
        self.reader.is_none()
    }

    /// Returns the next line without its terminator, or `None` at the end of the stream.
    ///
    /// Cancel-safe: partially read lines are kept until the next call.
    async fn next_line(&mut self) -> Option<String> {
        let reader = self.reader.as_mut()?;
        match reader.read_until(b'\n', &mut self.buf).await {
            Ok(0) => {
                self.reader = None;
                None
            }
            Ok(_) => {
                let line = self.buf.strip_suffix(b"\n").unwrap_or(&self.buf);
                let line = line.strip_suffix(b"\r").unwrap_or(line);
                let line = String::from_utf8_lossy(line).into_owned();
                self.buf.clear();
                Some(line)
            }
            Err(error) => {
                debug!("error reading from test process: {error}");
                self.reader = None;
                None
            }
        }
    }
}

struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nodetest_protocol::{ExtensionConfig, Isolation};
    use pretty_assertions::assert_eq;
    use std::collections::BTreeSet;

    fn version(input: &str) -> NodeVersion {
        NodeVersion::parse(input).unwrap()
    }

    fn file(path: &str) -> TestRunFile {
        TestRunFile {
            id: format!("file://{path}"),
            path: path.to_owned(),
            include: None,
            exclude: None,
        }
    }

    #[test]
    fn plain_file() {
        let args = child_args(
            &StartParams::default(),
            &version("v20.0.0"),
            "file:///tmp/reporter.mjs",
            &file("/p/a.test.js"),
        );
        assert_eq!(
            args,
            ["--test-reporter", "file:///tmp/reporter.mjs", "/p/a.test.js"]
        );
    }

    #[test]
    fn extensions_filters_and_capabilities() {
        let params = StartParams {
            extensions: vec![
                ExtensionConfig {
                    extensions: vec!["js".to_owned()],
                    parameters: vec!["--no-warnings".to_owned()],
                },
                ExtensionConfig {
                    extensions: vec!["mts".to_owned(), "ts".to_owned()],
                    parameters: vec!["--import".to_owned(), "tsx".to_owned()],
                },
            ],
            force_exit: true,
            regenerate_snapshots: true,
            isolation: Isolation::None,
            ..Default::default()
        };
        let mut file = file("/p/a.test.ts");
        file.include = Some(BTreeSet::from(["math adds (1 + 2)".to_owned()]));
        file.exclude = Some(BTreeSet::from(["math slow".to_owned()]));

        let args = child_args(&params, &version("v22.10.0"), "file:///r.mjs", &file);
        assert_eq!(
            args,
            [
                "--import",
                "tsx",
                "--test-reporter",
                "file:///r.mjs",
                "--test-force-exit",
                "--experimental-test-isolation=none",
                "--experimental-test-snapshots",
                "--test-update-snapshots",
                "--test-name-pattern",
                r"^math adds \(1 \+ 2\)$",
                "--test-skip-pattern",
                "^math slow$",
                "/p/a.test.ts",
            ]
        );

        let args = child_args(&params, &version("v24.0.0"), "file:///r.mjs", &file);
        assert!(args.contains(&"--test-isolation=none".to_owned()));
        assert!(!args.contains(&"--experimental-test-snapshots".to_owned()));
        assert!(args.contains(&"--test-update-snapshots".to_owned()));

        // Unsupported flags are left out.
        let args = child_args(&params, &version("v20.5.0"), "file:///r.mjs", &file);
        assert!(!args.iter().any(|arg| arg.contains("isolation")));
        assert!(!args.iter().any(|arg| arg.contains("snapshots")));
        assert!(!args.contains(&"--test-force-exit".to_owned()));
        assert!(!args.contains(&"--test-skip-pattern".to_owned()));
        assert!(args.contains(&"--test-name-pattern".to_owned()));

        // Skip patterns arrived in 22.1.
        let args = child_args(&params, &version("v22.0.0"), "file:///r.mjs", &file);
        assert!(!args.contains(&"--test-skip-pattern".to_owned()));
        let args = child_args(&params, &version("v22.1.0"), "file:///r.mjs", &file);
        assert!(args.contains(&"--test-skip-pattern".to_owned()));
    }

    #[test]
    fn prefixes_cycle() {
        let plain = |index| {
            let prefix = lane_prefix(index);
            // Strip the color codes.
            let start = prefix.find('w').unwrap();
            let end = prefix.find("> ").unwrap() + 2;
            prefix[start..end].to_owned()
        };
        assert_eq!(plain(0), "worker1> ");
        assert_eq!(plain(8), "worker9> ");
        assert_eq!(&lane_prefix(0)[..5], &lane_prefix(7)[..5]);
    }

    #[tokio::test]
    async fn line_reader_handles_partial_and_invalid_lines() {
        let input: &[u8] = b"one\r\ntw\xffo\nlast";
        let mut reader = LineReader::new(Some(input));
        assert_eq!(reader.next_line().await.as_deref(), Some("one"));
        assert_eq!(reader.next_line().await.as_deref(), Some("tw\u{fffd}o"));
        assert_eq!(reader.next_line().await.as_deref(), Some("last"));
        assert_eq!(reader.next_line().await, None);
        assert!(reader.is_done());
    }
}
