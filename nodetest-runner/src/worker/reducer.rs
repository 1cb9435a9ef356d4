// Copyright (c) The nodetest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Turns the output of one test process into host notifications.
//!
//! The reporter hook makes test processes print one JSON event per line. Anything else printed
//! by the process (before the hook is loaded, or by native code) is passed through as output.

use nodetest_protocol::{
    FailedParams, FileFailedParams, HostNotification, LogEntry, LogParams, PassedParams,
    StackFrame, TestIdParams, TestIdentity,
};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeSet;

/// Something the reducer wants done.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum ReducerEvent {
    /// Send a notification to the host.
    Notify(HostNotification),

    /// The top-level test plan is done, so the inspector connection is no longer needed.
    CloseInspector,
}

/// Tracks the state of a single test process.
#[derive(Debug)]
pub(crate) struct FileEventReducer {
    file_id: String,
    prefix: String,
    verbose: bool,
    // Identity of the test most recently dequeued for execution.
    start_id: TestIdentity,
    // Identity of the test most recently reported on.
    finish_id: TestIdentity,
    // Tests that started and haven't been reported on yet.
    outstanding: BTreeSet<TestIdentity>,
    // Output seen before the first event. Becomes `None` once an event parses.
    failure_lines: Option<Vec<String>>,
}

impl FileEventReducer {
    pub(crate) fn new(file_id: impl Into<String>, prefix: impl Into<String>, verbose: bool) -> Self {
        let file_id = file_id.into();
        Self {
            start_id: TestIdentity::for_file(file_id.clone()),
            finish_id: TestIdentity::for_file(file_id.clone()),
            file_id,
            prefix: prefix.into(),
            verbose,
            outstanding: BTreeSet::new(),
            failure_lines: Some(Vec::new()),
        }
    }

    /// Consumes one line of output, without its line terminator.
    pub(crate) fn line(&mut self, line: &str, out: &mut Vec<ReducerEvent>) {
        if line.is_empty() {
            return;
        }
        if self.verbose {
            out.push(self.output(line));
        }

        let event = match serde_json::from_str::<ReporterEvent>(line) {
            Ok(event) => event,
            Err(_) => {
                out.push(self.output(line));
                if let Some(lines) = &mut self.failure_lines {
                    lines.push(line.to_owned());
                }
                return;
            }
        };
        self.failure_lines = None;

        match event {
            ReporterEvent::Log { chunk, sf } => {
                let id = self
                    .outstanding
                    .contains(&self.start_id)
                    .then(|| self.start_id.clone());
                out.push(ReducerEvent::Notify(HostNotification::Log(LogParams {
                    id,
                    prefix: self.prefix.clone(),
                    log: LogEntry { chunk, sf },
                })));
            }
            ReporterEvent::Dequeue { data } => {
                self.start_id.set_at_depth(data.nesting + 1, data.name);
                self.outstanding.insert(self.start_id.clone());
                out.push(ReducerEvent::Notify(HostNotification::Started(
                    TestIdParams {
                        id: self.start_id.clone(),
                    },
                )));
            }
            ReporterEvent::Start { data } => {
                self.finish_id.set_at_depth(data.nesting + 1, data.name);
            }
            ReporterEvent::Pass { data } => {
                self.finish_id.set_at_depth(data.nesting + 1, data.name);
                self.outstanding.remove(&self.finish_id);
                let id = self.finish_id.clone();
                let notification = if is_truthy(data.skip.as_ref()) || is_truthy(data.todo.as_ref()) {
                    HostNotification::Skipped(TestIdParams { id })
                } else {
                    HostNotification::Passed(PassedParams {
                        id,
                        duration: data.details.duration_ms,
                    })
                };
                out.push(ReducerEvent::Notify(notification));
            }
            ReporterEvent::Fail { data } => {
                self.finish_id.set_at_depth(data.nesting + 1, data.name);
                self.outstanding.remove(&self.finish_id);
                let cause = data.details.error.and_then(|error| error.cause);
                out.push(ReducerEvent::Notify(HostNotification::Failed(
                    failure_params(self.finish_id.clone(), data.details.duration_ms, cause),
                )));
            }
            ReporterEvent::Plan { data } => {
                if data.nesting == 0 {
                    out.push(ReducerEvent::CloseInspector);
                }
            }
            ReporterEvent::Other => {}
        }
    }

    /// Called once the process has exited and its output has been consumed.
    ///
    /// `exit` is `None` if the process exited successfully, and otherwise describes how it
    /// exited.
    pub(crate) fn finish(self, exit: Option<&str>) -> Vec<HostNotification> {
        let mut out = Vec::new();
        let exited_with = || match exit {
            Some(exit) => format!("test process exited with {exit}"),
            None => "test process exited before the test finished".to_owned(),
        };

        match self.failure_lines {
            Some(lines) if !lines.is_empty() => {
                out.push(HostNotification::FileFailed(FileFailedParams {
                    uri: self.file_id.clone(),
                    error: lines.join("\n"),
                }));
            }
            Some(_) if exit.is_some() => {
                out.push(HostNotification::FileFailed(FileFailedParams {
                    uri: self.file_id.clone(),
                    error: exited_with(),
                }));
            }
            _ => {}
        }

        for id in self.outstanding {
            out.push(HostNotification::Failed(FailedParams {
                id,
                error: Some(exited_with()),
                ..Default::default()
            }));
        }
        out
    }

    fn output(&self, line: &str) -> ReducerEvent {
        ReducerEvent::Notify(HostNotification::Output(format!("{}{line}", self.prefix)))
    }
}

fn failure_params(id: TestIdentity, duration: Option<f64>, cause: Option<Value>) -> FailedParams {
    let mut params = FailedParams {
        id,
        duration,
        ..Default::default()
    };
    let Some(cause) = cause.filter(|cause| !cause.is_null()) else {
        return params;
    };

    if let Value::Object(fields) = &cause {
        let string_field = |name: &str| fields.get(name).and_then(Value::as_str).map(str::to_owned);
        params.expected = string_field("expected");
        params.actual = string_field("actual");
        params.stack = fields
            .get("_stack")
            .and_then(|stack| Vec::<StackFrame>::deserialize(stack).ok());
        params.error = string_field("_message").filter(|message| !message.is_empty());
    }

    if params.error.is_none() {
        params.error = Some(match &cause {
            Value::String(message) => message.clone(),
            // Serializing a Value can't fail.
            other => serde_json::to_string_pretty(other).unwrap_or_default(),
        });
    }
    params
}

fn is_truthy(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Bool(value)) => *value,
        Some(Value::String(value)) => !value.is_empty(),
        Some(Value::Number(value)) => value.as_f64().is_some_and(|n| n != 0.0),
        Some(_) => true,
    }
}

/// The subset of `node:test` reporter events that matter here.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ReporterEvent {
    #[serde(rename = "runner:log")]
    Log {
        chunk: String,
        #[serde(default)]
        sf: StackFrame,
    },
    #[serde(rename = "test:dequeue")]
    Dequeue { data: TestEventData },
    #[serde(rename = "test:start")]
    Start { data: TestEventData },
    #[serde(rename = "test:pass")]
    Pass { data: TestResultData },
    #[serde(rename = "test:fail")]
    Fail { data: TestResultData },
    #[serde(rename = "test:plan")]
    Plan { data: PlanData },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct TestEventData {
    name: String,
    nesting: usize,
}

#[derive(Debug, Deserialize)]
struct TestResultData {
    name: String,
    nesting: usize,
    #[serde(default)]
    skip: Option<Value>,
    #[serde(default)]
    todo: Option<Value>,
    #[serde(default)]
    details: TestDetails,
}

#[derive(Debug, Default, Deserialize)]
struct TestDetails {
    #[serde(default)]
    duration_ms: Option<f64>,
    #[serde(default)]
    error: Option<ErrorDetails>,
}

#[derive(Debug, Deserialize)]
struct ErrorDetails {
    #[serde(default)]
    cause: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct PlanData {
    nesting: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    const FILE: &str = "file:///p/a.test.js";

    fn id(segments: &[&str]) -> TestIdentity {
        std::iter::once(FILE).chain(segments.iter().copied()).collect()
    }

    fn feed(reducer: &mut FileEventReducer, lines: &str) -> Vec<ReducerEvent> {
        let mut out = Vec::new();
        for line in lines.lines() {
            reducer.line(line, &mut out);
        }
        out
    }

    fn notify(notification: HostNotification) -> ReducerEvent {
        ReducerEvent::Notify(notification)
    }

    #[test]
    fn nested_tests() {
        let mut reducer = FileEventReducer::new(FILE, "w1> ", false);
        let events = feed(
            &mut reducer,
            indoc! {r#"
                {"type":"test:dequeue","data":{"name":"suite","nesting":0}}
                {"type":"test:dequeue","data":{"name":"inner","nesting":1}}
                {"type":"test:start","data":{"name":"suite","nesting":0}}
                {"type":"test:start","data":{"name":"inner","nesting":1}}
                {"type":"test:pass","data":{"name":"inner","nesting":1,"details":{"duration_ms":1.5}}}
                {"type":"test:plan","data":{"nesting":1,"count":1}}
                {"type":"test:pass","data":{"name":"suite","nesting":0,"details":{"duration_ms":3}}}
                {"type":"test:plan","data":{"nesting":0,"count":1}}
                {"type":"test:diagnostic","data":{"message":"tests 2"}}
            "#},
        );

        assert_eq!(
            events,
            [
                notify(HostNotification::Started(TestIdParams { id: id(&["suite"]) })),
                notify(HostNotification::Started(TestIdParams {
                    id: id(&["suite", "inner"])
                })),
                notify(HostNotification::Passed(PassedParams {
                    id: id(&["suite", "inner"]),
                    duration: Some(1.5),
                })),
                notify(HostNotification::Passed(PassedParams {
                    id: id(&["suite"]),
                    duration: Some(3.0),
                })),
                ReducerEvent::CloseInspector,
            ]
        );
        assert!(reducer.finish(None).is_empty());
    }

    #[test]
    fn skip_and_todo() {
        let mut reducer = FileEventReducer::new(FILE, "", false);
        let events = feed(
            &mut reducer,
            indoc! {r#"
                {"type":"test:pass","data":{"name":"a","nesting":0,"skip":true,"details":{}}}
                {"type":"test:pass","data":{"name":"b","nesting":0,"todo":"later","details":{}}}
                {"type":"test:pass","data":{"name":"c","nesting":0,"skip":false,"details":{}}}
            "#},
        );
        assert_eq!(
            events,
            [
                notify(HostNotification::Skipped(TestIdParams { id: id(&["a"]) })),
                notify(HostNotification::Skipped(TestIdParams { id: id(&["b"]) })),
                notify(HostNotification::Passed(PassedParams {
                    id: id(&["c"]),
                    duration: None,
                })),
            ]
        );
    }

    #[test]
    fn failures() {
        let mut reducer = FileEventReducer::new(FILE, "", false);
        let assertion = json!({
            "type": "test:fail",
            "data": {
                "name": "equal",
                "nesting": 0,
                "details": {
                    "duration_ms": 2,
                    "error": {
                        "cause": {
                            "_message": "Expected values to be strictly equal",
                            "expected": "2",
                            "actual": "3",
                            "_stack": [
                                { "file": "/p/a.test.js", "methodName": "t", "arguments": [], "lineNumber": 4, "column": 10 }
                            ]
                        }
                    }
                }
            }
        });
        let thrown_string = json!({
            "type": "test:fail",
            "data": { "name": "string", "nesting": 0, "details": { "error": { "cause": "boom" } } }
        });
        let thrown_object = json!({
            "type": "test:fail",
            "data": { "name": "object", "nesting": 0, "details": { "error": { "cause": { "code": 1 } } } }
        });

        let mut out = Vec::new();
        for event in [assertion, thrown_string, thrown_object] {
            reducer.line(&event.to_string(), &mut out);
        }

        assert_eq!(
            out,
            [
                notify(HostNotification::Failed(FailedParams {
                    id: id(&["equal"]),
                    duration: Some(2.0),
                    expected: Some("2".to_owned()),
                    actual: Some("3".to_owned()),
                    error: Some("Expected values to be strictly equal".to_owned()),
                    stack: Some(vec![StackFrame {
                        file: Some("/p/a.test.js".to_owned()),
                        line_number: Some(4),
                        column: Some(10),
                    }]),
                })),
                notify(HostNotification::Failed(FailedParams {
                    id: id(&["string"]),
                    error: Some("boom".to_owned()),
                    ..Default::default()
                })),
                notify(HostNotification::Failed(FailedParams {
                    id: id(&["object"]),
                    error: Some("{\n  \"code\": 1\n}".to_owned()),
                    ..Default::default()
                })),
            ]
        );
    }

    #[test]
    fn logs_are_attributed_to_running_tests() {
        let mut reducer = FileEventReducer::new(FILE, "w2> ", false);
        let events = feed(
            &mut reducer,
            indoc! {r#"
                {"type":"runner:log","chunk":"top level\n","sf":{"file":"/p/a.test.js","lineNumber":1,"column":1}}
                {"type":"test:dequeue","data":{"name":"t","nesting":0}}
                {"type":"runner:log","chunk":"inside\n","sf":{"file":"/p/a.test.js","lineNumber":3,"column":5}}
                {"type":"test:pass","data":{"name":"t","nesting":0,"details":{}}}
                {"type":"runner:log","chunk":"after\n"}
            "#},
        );

        let logs: Vec<_> = events
            .into_iter()
            .filter_map(|event| match event {
                ReducerEvent::Notify(HostNotification::Log(params)) => Some(params),
                _ => None,
            })
            .collect();
        assert_eq!(logs.len(), 3);
        assert_eq!(logs[0].id, None);
        assert_eq!(logs[0].prefix, "w2> ");
        assert_eq!(logs[0].log.sf.line_number, Some(1));
        assert_eq!(logs[1].id, Some(id(&["t"])));
        assert_eq!(logs[1].log.chunk, "inside\n");
        assert_eq!(logs[2].id, None);
        assert_eq!(logs[2].log.sf, StackFrame::default());
    }

    #[test]
    fn early_output_fails_the_file() {
        let mut reducer = FileEventReducer::new(FILE, "w1> ", false);
        let events = feed(
            &mut reducer,
            indoc! {"
                /p/a.test.js:1
                syntax error(
                       ^
            "},
        );
        assert_eq!(
            events,
            [
                notify(HostNotification::Output("w1> /p/a.test.js:1".to_owned())),
                notify(HostNotification::Output("w1> syntax error(".to_owned())),
                notify(HostNotification::Output("w1>        ^".to_owned())),
            ]
        );
        assert_eq!(
            reducer.finish(Some("exit status: 1")),
            [HostNotification::FileFailed(FileFailedParams {
                uri: FILE.to_owned(),
                error: "/p/a.test.js:1\nsyntax error(\n       ^".to_owned(),
            })]
        );
    }

    #[test]
    fn output_after_first_event_is_not_a_failure() {
        let mut reducer = FileEventReducer::new(FILE, "", false);
        feed(
            &mut reducer,
            indoc! {r#"
                {"type":"test:dequeue","data":{"name":"t","nesting":0}}
                {"type":"test:pass","data":{"name":"t","nesting":0,"details":{}}}
                (node:123) ExperimentalWarning: something
            "#},
        );
        assert!(reducer.finish(Some("exit status: 1")).is_empty());
    }

    #[test]
    fn abnormal_exit() {
        // No output at all.
        let reducer = FileEventReducer::new(FILE, "", false);
        assert_eq!(
            reducer.finish(Some("signal: 9 (SIGKILL)")),
            [HostNotification::FileFailed(FileFailedParams {
                uri: FILE.to_owned(),
                error: "test process exited with signal: 9 (SIGKILL)".to_owned(),
            })]
        );

        // A clean exit with no tests is fine.
        let reducer = FileEventReducer::new(FILE, "", false);
        assert!(reducer.finish(None).is_empty());

        // Tests that never finished are failed.
        let mut reducer = FileEventReducer::new(FILE, "", false);
        feed(
            &mut reducer,
            r#"{"type":"test:dequeue","data":{"name":"hangs","nesting":0}}"#,
        );
        assert_eq!(
            reducer.finish(Some("exit status: 7")),
            [HostNotification::Failed(FailedParams {
                id: id(&["hangs"]),
                error: Some("test process exited with exit status: 7".to_owned()),
                ..Default::default()
            })]
        );
    }

    #[test]
    fn verbose_echoes_everything() {
        let mut reducer = FileEventReducer::new(FILE, "> ", true);
        let events = feed(
            &mut reducer,
            "{\"type\":\"test:plan\",\"data\":{\"nesting\":1}}\nnot json",
        );
        assert_eq!(
            events,
            [
                notify(HostNotification::Output(
                    "> {\"type\":\"test:plan\",\"data\":{\"nesting\":1}}".to_owned()
                )),
                notify(HostNotification::Output("> not json".to_owned())),
                notify(HostNotification::Output("> not json".to_owned())),
            ]
        );
    }
}
