// Copyright (c) The nodetest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! A minimal V8 inspector client.
//!
//! Test processes started with the reporter hook wait for a debugger before running. The
//! client releases them and watches for the test file being parsed, which is how source maps
//! produced in memory by loaders (such as TypeScript loaders) are found.

use super::Notifier;
use camino::Utf8Path;
use futures::{SinkExt, StreamExt};
use nodetest_protocol::{HostNotification, SourceMapParams};
use serde_json::{Value, json};
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;

const ENABLE_REQUEST_ID: u64 = 0;
const RUN_REQUEST_ID: u64 = 1;

/// The line a test process prints to stderr once its inspector is listening.
pub(super) const LISTENING_PREFIX: &str = "Debugger listening on ";

/// Connects to the inspector at `url` and reports the source map of `test_file`, if any.
///
/// Runs until the inspector closes the connection; callers abort the task once the test process
/// no longer needs the debugger.
pub(super) async fn watch_inspector(url: String, test_file: String, notifier: Notifier) {
    if let Err(error) = watch_inspector_impl(&url, &test_file, &notifier).await {
        debug!("inspector connection to {url} failed: {error}");
    }
}

async fn watch_inspector_impl(
    url: &str,
    test_file: &str,
    notifier: &Notifier,
) -> Result<(), tokio_tungstenite::tungstenite::Error> {
    let expected_url = crate::helpers::file_url(Utf8Path::new(test_file))
        .map(|url| url.as_str().to_lowercase())
        .unwrap_or_default();

    let (mut socket, _) = tokio_tungstenite::connect_async(url).await?;
    socket
        .send(Message::text(
            json!({ "id": ENABLE_REQUEST_ID, "method": "Debugger.enable" }).to_string(),
        ))
        .await?;

    let mut state = InspectorState::default();
    while let Some(message) = socket.next().await {
        let text = match message? {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };
        // Keep reading once done so the process isn't blocked on a full socket.
        if state.is_done() {
            continue;
        }
        let Ok(message) = serde_json::from_str::<Value>(text.as_str()) else {
            continue;
        };

        match state.handle(&message, &expected_url) {
            Some(InspectorAction::Run) => {
                socket
                    .send(Message::text(
                        json!({ "id": RUN_REQUEST_ID, "method": "Runtime.runIfWaitingForDebugger" })
                            .to_string(),
                    ))
                    .await?;
            }
            Some(InspectorAction::SourceMap(source_map_url)) => {
                notifier.send(HostNotification::SourceMap(SourceMapParams {
                    test_file: test_file.to_owned(),
                    source_map_url,
                }));
            }
            None => {}
        }
    }
    Ok(())
}

#[derive(Debug, PartialEq, Eq)]
enum InspectorAction {
    Run,
    SourceMap(String),
}

#[derive(Debug, Default)]
struct InspectorState {
    released: bool,
    parsed: bool,
}

impl InspectorState {
    fn is_done(&self) -> bool {
        self.released && self.parsed
    }

    fn handle(&mut self, message: &Value, expected_url: &str) -> Option<InspectorAction> {
        if message["method"] == "Debugger.scriptParsed" {
            let params = &message["params"];
            let url = params["url"].as_str().unwrap_or_default();
            if self.parsed || url.to_lowercase() != expected_url {
                return None;
            }
            self.parsed = true;
            return params["sourceMapURL"]
                .as_str()
                .filter(|source_map_url| !source_map_url.is_empty())
                .map(|source_map_url| InspectorAction::SourceMap(source_map_url.to_owned()));
        }

        if !self.released
            && message["id"].as_u64() == Some(ENABLE_REQUEST_ID)
            && message.get("result").is_some()
        {
            self.released = true;
            return Some(InspectorAction::Run);
        }
        None
    }
}
