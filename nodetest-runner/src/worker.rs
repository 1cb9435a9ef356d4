// Copyright (c) The nodetest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The worker process: runs test files on behalf of the host.
//!
//! The worker connects to the endpoint it is given, answers `version` and `start` requests, and
//! exits on `kill`. A `start` request runs every file it lists in a pool of lanes, each of which
//! runs one test process at a time, and streams results back as they happen.

mod inspector;
mod lane;
mod reducer;

use crate::{
    endpoint::{self, Connection, EndpointAddress},
    errors::{RemoteError, WorkerError},
    node_version::NodeVersion,
    rpc::{INTERNAL_ERROR, IncomingMessage, METHOD_NOT_FOUND, RpcConnection, RpcSender},
};
use camino::Utf8PathBuf;
use camino_tempfile::Utf8TempDir;
use futures::future::{FutureExt, LocalBoxFuture};
use lane::LaneContext;
use nodetest_protocol::{
    CompleteStatus, HostNotification, StartParams, StartResult, WorkerNotification,
    WorkerRequest,
};
use std::{future::Future, sync::Mutex};
use tokio::sync::OnceCell;
use tracing::{debug, level_filters::LevelFilter};
use tracing_subscriber::{
    Layer, filter::Targets, layer::SubscriberExt, util::SubscriberInitExt,
};
use url::Url;

/// The environment variable naming the Node.js executable the worker runs tests with.
pub const NODE_ENV: &str = "NODETEST_NODE";

/// The environment variable naming an existing reporter hook to use instead of the bundled one.
pub const REPORTER_ENV: &str = "NODETEST_REPORTER";

/// The environment variable holding the worker's log filter.
pub const LOG_ENV: &str = "NODETEST_LOG";

/// The source of the reporter hook loaded into every test process.
pub const REPORTER_SOURCE: &str = include_str!("../assets/reporter.mjs");

/// Runs a worker against the host listening at `address`, configured from the environment.
///
/// Returns once the host asks the worker to exit or closes the connection.
pub async fn run_worker(address: &EndpointAddress) -> Result<(), WorkerError> {
    let worker = Worker::new(NodeRuntime::from_env(), ReporterHook::from_env()?);
    worker.serve(address).await
}

/// Sets up logging to stderr, filtered by [`LOG_ENV`].
///
/// The host captures the worker's stderr and reports it if the worker exits unexpectedly.
pub fn init_worker_logging() {
    let targets = std::env::var(LOG_ENV)
        .ok()
        .filter(|level| !level.is_empty())
        .and_then(|level| level.parse::<Targets>().ok())
        .unwrap_or_else(|| Targets::new().with_default(LevelFilter::WARN));

    let layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .with_target(false)
        .with_filter(targets);
    // Ignore the error if a subscriber was already installed.
    _ = tracing_subscriber::registry().with(layer).try_init();
}

/// The Node.js runtime that runs test files.
#[derive(Debug)]
pub struct NodeRuntime {
    path: String,
    version: OnceCell<Result<String, String>>,
}

impl NodeRuntime {
    /// Creates a runtime from an executable name or path.
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            version: OnceCell::new(),
        }
    }

    /// Creates a runtime from [`NODE_ENV`], defaulting to `node` on `PATH`.
    pub fn from_env() -> Self {
        Self::new(
            std::env::var(NODE_ENV)
                .ok()
                .filter(|path| !path.is_empty())
                .unwrap_or_else(|| "node".to_owned()),
        )
    }

    /// Returns the executable.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Returns the output of `node --version`. The runtime is only asked once.
    pub async fn version(&self) -> Result<&str, RemoteError> {
        let version = self
            .version
            .get_or_init(|| async {
                let output = tokio::process::Command::new(&self.path)
                    .arg("--version")
                    .stdin(std::process::Stdio::null())
                    .output()
                    .await
                    .map_err(|error| format!("failed to run `{} --version`: {error}", self.path))?;
                if !output.status.success() {
                    return Err(format!(
                        "`{} --version` exited with {}",
                        self.path, output.status
                    ));
                }
                Ok(String::from_utf8_lossy(&output.stdout).trim().to_owned())
            })
            .await;

        version.as_deref().map_err(|message| RemoteError {
            code: INTERNAL_ERROR,
            message: message.clone(),
        })
    }
}

/// The reporter hook passed to test processes with `--test-reporter`.
#[derive(Debug)]
pub struct ReporterHook {
    url: Url,
    // Keeps a materialized hook alive.
    _dir: Option<Utf8TempDir>,
}

impl ReporterHook {
    /// Uses the hook named by [`REPORTER_ENV`], or writes out the bundled one.
    pub fn from_env() -> Result<Self, WorkerError> {
        match std::env::var(REPORTER_ENV) {
            Ok(hook) if !hook.is_empty() => Self::existing(&hook),
            _ => Self::materialize(),
        }
    }

    /// Uses an existing hook, given as a `file:` URL or a path.
    pub fn existing(hook: &str) -> Result<Self, WorkerError> {
        if let Ok(url) = Url::parse(hook) {
            if url.scheme() == "file" {
                return Ok(Self { url, _dir: None });
            }
        }

        let mut path = Utf8PathBuf::from(hook);
        if path.is_relative() {
            if let Some(cwd) = std::env::current_dir()
                .ok()
                .and_then(|dir| Utf8PathBuf::from_path_buf(dir).ok())
            {
                path = cwd.join(path);
            }
        }
        let url = crate::helpers::file_url(&path).ok_or_else(|| WorkerError::ReporterSetup {
            path: path.clone(),
            error: std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "reporter hook is not an absolute path",
            ),
        })?;
        Ok(Self { url, _dir: None })
    }

    /// Writes the bundled hook to a fresh temporary directory.
    pub fn materialize() -> Result<Self, WorkerError> {
        let dir = camino_tempfile::Builder::new()
            .prefix("nodetest-reporter-")
            .tempdir()
            .map_err(|error| WorkerError::ReporterSetup {
                path: Utf8PathBuf::from(std::env::temp_dir().to_string_lossy().into_owned()),
                error,
            })?;
        let path = dir.path().join("reporter.mjs");
        std::fs::write(&path, REPORTER_SOURCE).map_err(|error| WorkerError::ReporterSetup {
            path: path.clone(),
            error,
        })?;
        let url = crate::helpers::file_url(&path).ok_or_else(|| WorkerError::ReporterSetup {
            path: path.clone(),
            error: std::io::Error::other("temporary directory is not an absolute path"),
        })?;
        debug!("wrote reporter hook to {path}");

        Ok(Self {
            url,
            _dir: Some(dir),
        })
    }

    /// Returns the URL passed to `--test-reporter`.
    pub fn url(&self) -> &Url {
        &self.url
    }
}

/// Serves runs for a host.
#[derive(Debug)]
pub struct Worker {
    node: NodeRuntime,
    reporter: ReporterHook,
}

type RunningStart<'a> = (u64, LocalBoxFuture<'a, Result<StartResult, RemoteError>>);

enum Flow {
    Continue,
    Exit,
}

impl Worker {
    /// Creates a worker.
    pub fn new(node: NodeRuntime, reporter: ReporterHook) -> Self {
        Self { node, reporter }
    }

    /// Connects to the host and serves it until asked to exit or disconnected.
    pub async fn serve(&self, address: &EndpointAddress) -> Result<(), WorkerError> {
        let connection = endpoint::connect(address).await?;
        debug!("connected to host at {address}");
        self.serve_connection(connection).await
    }

    /// Serves a host over an established connection.
    pub async fn serve_connection(&self, connection: Connection) -> Result<(), WorkerError> {
        let mut rpc = RpcConnection::new(connection);
        let sender = rpc.sender().clone();

        let mut running: Option<RunningStart<'_>> = None;
        loop {
            tokio::select! {
                message = rpc.recv() => {
                    let Some(message) = message else {
                        debug!("host closed the connection");
                        return Ok(());
                    };
                    match self.handle(message?, &sender, &mut running).await? {
                        Flow::Continue => {}
                        Flow::Exit => {
                            // Dropping the run kills any test processes still going.
                            drop(running);
                            sender.close().await?;
                            return Ok(());
                        }
                    }
                }
                (id, result) = poll_running(&mut running), if running.is_some() => {
                    running = None;
                    sender.respond(id, result)?;
                }
            }
        }
    }

    async fn handle<'a>(
        &'a self,
        message: IncomingMessage,
        sender: &RpcSender,
        running: &mut Option<RunningStart<'a>>,
    ) -> Result<Flow, WorkerError> {
        let Some(id) = message.id() else {
            match message.decode::<WorkerNotification>() {
                Ok(WorkerNotification::Kill) => {
                    debug!("received kill");
                    return Ok(Flow::Exit);
                }
                Err(error) => debug!("ignoring notification: {error}"),
            }
            return Ok(Flow::Continue);
        };

        let method = message.method().to_owned();
        let request = match message.decode::<WorkerRequest>() {
            Ok(request) => request,
            Err(error) => {
                debug!("rejecting request `{method}`: {error}");
                let code = if matches!(method.as_str(), "start" | "version") {
                    INTERNAL_ERROR
                } else {
                    METHOD_NOT_FOUND
                };
                sender.respond(
                    id,
                    Err::<(), _>(RemoteError {
                        code,
                        message: format!("invalid request `{method}`"),
                    }),
                )?;
                return Ok(Flow::Continue);
            }
        };

        match request {
            WorkerRequest::Version => {
                let version = self.node.version().await;
                sender.respond(id, version)?;
            }
            WorkerRequest::Start(params) => {
                if running.is_some() {
                    sender.respond(
                        id,
                        Err::<(), _>(RemoteError {
                            code: INTERNAL_ERROR,
                            message: "a run is already in progress".to_owned(),
                        }),
                    )?;
                } else {
                    let notifier = Notifier::new(sender.clone());
                    *running = Some((id, self.start(params, notifier).boxed_local()));
                }
            }
        }
        Ok(Flow::Continue)
    }

    async fn start(
        &self,
        params: StartParams,
        notifier: Notifier,
    ) -> Result<StartResult, RemoteError> {
        if params.files.is_empty() {
            return Ok(StartResult::done());
        }

        let version_text = self.node.version().await?;
        let version = NodeVersion::parse(version_text).map_err(|error| RemoteError {
            code: INTERNAL_ERROR,
            message: format!("unrecognized Node.js version `{version_text}`: {error}"),
        })?;
        if !version.is_supported() {
            return Ok(StartResult {
                status: CompleteStatus::NodeVersionOutdated,
                message: Some(version_text.to_owned()),
            });
        }

        let lanes = params.concurrency.max(1).min(params.files.len());
        debug!(
            "running {} files in {lanes} lanes with node {version}",
            params.files.len()
        );
        let cx = LaneContext {
            params: &params,
            node_path: self.node.path(),
            version: &version,
            reporter_url: self.reporter.url().as_str(),
            notifier: &notifier,
            queue: Mutex::new(params.files.iter().cloned().collect()),
        };
        futures::future::join_all((0..lanes).map(|index| lane::run_lane(&cx, index))).await;

        Ok(StartResult::done())
    }
}

async fn poll_running<F>(running: &mut Option<(u64, F)>) -> (u64, F::Output)
where
    F: Future + Unpin,
{
    match running {
        Some((id, future)) => (*id, future.await),
        None => std::future::pending().await,
    }
}

/// Sends notifications to the host, ignoring a closed connection.
#[derive(Clone, Debug)]
pub(crate) struct Notifier {
    sender: RpcSender,
}

impl Notifier {
    pub(crate) fn new(sender: RpcSender) -> Self {
        Self { sender }
    }

    pub(crate) fn send(&self, notification: HostNotification) {
        if let Err(error) = self.sender.notify(&notification) {
            debug!(
                "dropping `{}` notification: {error}",
                notification.method()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::RpcError;
    use pretty_assertions::assert_eq;

    fn connect() -> (RpcConnection, Connection) {
        let (host, worker) = tokio::io::duplex(4096);
        let (host_read, host_write) = tokio::io::split(host);
        let (worker_read, worker_write) = tokio::io::split(worker);
        (
            RpcConnection::new(Connection::new(host_read, host_write)),
            Connection::new(worker_read, worker_write),
        )
    }

    fn worker(node: &str) -> Worker {
        let reporter = ReporterHook::existing("file:///reporter.mjs").expect("valid hook");
        Worker::new(NodeRuntime::new(node), reporter)
    }

    #[tokio::test]
    async fn answers_requests_until_killed() {
        let worker = worker("/nonexistent/nodetest-node");
        let (mut host, connection) = connect();
        let sender = host.sender().clone();

        let host_side = async {
            match sender.request::<String>(&WorkerRequest::Version).await {
                Err(RpcError::Remote(error)) => {
                    assert_eq!(error.code, INTERNAL_ERROR);
                    assert!(error.message.contains("--version"), "{}", error.message);
                }
                other => panic!("unexpected version response {other:?}"),
            }

            // No runtime is needed to run nothing.
            let result: StartResult = sender
                .request(&WorkerRequest::Start(StartParams::default()))
                .await
                .expect("empty run completes");
            assert_eq!(result, StartResult::done());
            assert!(host.try_recv().is_none(), "empty run sends no notifications");

            match sender
                .request::<serde_json::Value>(&serde_json::json!({ "method": "bogus" }))
                .await
            {
                Err(RpcError::Remote(error)) => assert_eq!(error.code, METHOD_NOT_FOUND),
                other => panic!("unexpected response {other:?}"),
            }

            sender
                .notify(&WorkerNotification::Kill)
                .expect("sent kill");
            assert!(host.recv().await.is_none(), "worker closes the connection");
        };

        let (served, ()) = tokio::join!(worker.serve_connection(connection), host_side);
        served.expect("worker exits cleanly");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn rejects_concurrent_runs() {
        use nodetest_protocol::TestRunFile;
        use std::os::unix::fs::PermissionsExt;

        let dir = camino_tempfile::tempdir().expect("created temp dir");
        let node = dir.path().join("node");
        std::fs::write(
            &node,
            "#!/bin/sh\nif [ \"$1\" = \"--version\" ]; then echo v22.3.0; exit 0; fi\nsleep 1\n",
        )
        .unwrap();
        std::fs::set_permissions(&node, std::fs::Permissions::from_mode(0o755)).unwrap();
        let file = dir.path().join("a.test.js");
        std::fs::write(&file, "").unwrap();

        let worker = worker(node.as_str());
        let (mut host, connection) = connect();
        let sender = host.sender().clone();
        let request = WorkerRequest::Start(StartParams {
            concurrency: 1,
            files: vec![TestRunFile {
                id: crate::helpers::file_url(&file).unwrap().to_string(),
                path: file.to_string(),
                include: None,
                exclude: None,
            }],
            ..Default::default()
        });

        let host_side = async {
            let (first, second) = tokio::join!(
                sender.request::<StartResult>(&request),
                sender.request::<StartResult>(&request),
            );
            assert_eq!(first.expect("first run completes"), StartResult::done());
            match second {
                Err(RpcError::Remote(error)) => {
                    assert_eq!(error.message, "a run is already in progress")
                }
                other => panic!("unexpected response {other:?}"),
            }
            sender
                .notify(&WorkerNotification::Kill)
                .expect("sent kill");
            while host.recv().await.is_some() {}
        };

        let (served, ()) = tokio::join!(worker.serve_connection(connection), host_side);
        served.expect("worker exits cleanly");
    }
}
