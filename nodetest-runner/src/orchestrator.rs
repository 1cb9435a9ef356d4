// Copyright (c) The nodetest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Drives test runs from the host side.
//!
//! The main structure in this module is [`Orchestrator`]. Each call to [`Orchestrator::run`]
//! binds a fresh endpoint, launches a worker process against it and relays the worker's
//! notifications to a [`RunReporter`] until the worker reports completion.

#[cfg(unix)]
#[path = "orchestrator/unix.rs"]
mod os;

#[cfg(windows)]
#[path = "orchestrator/windows.rs"]
mod os;

use crate::{
    cancel::CancellationToken,
    endpoint::{EndpointAddress, EndpointAllocator, EndpointListener},
    errors::{RemoteError, RpcError, RunError, WorkerExit, WorkerSpawnError},
    helpers::file_url,
    node_version::{MINIMUM_NODE_VERSION, NodeVersion},
    output_queue::{Deferred, OutputQueue},
    reporter::{Location, RunReporter, TestFailure, TestHandle},
    rpc::{IncomingMessage, METHOD_NOT_FOUND, RpcConnection, RpcSender},
    selection::resolve_run_files,
    source_map::{ScopedSourceMapStore, SourceMapMaintainer, SourceMapStore},
    test_tree::{TestNodeId, TestTree},
    worker::{LOG_ENV, NODE_ENV},
};
use camino::{Utf8Path, Utf8PathBuf};
use debug_ignore::DebugIgnore;
use futures::future::{BoxFuture, Fuse, FutureExt};
use nodetest_protocol::{
    CompleteStatus, ExtensionConfig, FailedParams, FileFailedParams, HostNotification,
    Isolation, LogParams, StackFrame, StartParams, StartResult, TestIdentity, WorkerNotification,
    WorkerRequest,
};
use std::{
    collections::{BTreeMap, HashMap},
    process::Stdio,
    sync::Arc,
    time::Duration,
};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::Child,
    task::JoinHandle,
};
use tracing::{debug, warn};
use url::Url;

/// What to run, and how.
#[derive(Clone, Debug, Default)]
pub struct RunRequest {
    /// Nodes to run. `None` runs every root of the tree.
    pub include: Option<Vec<TestNodeId>>,

    /// Nodes to leave out.
    pub exclude: Vec<TestNodeId>,

    /// The maximum number of test processes at once. `None` or zero uses the available
    /// parallelism.
    pub concurrency: Option<usize>,

    /// Per-extension runtime parameters.
    pub extensions: Vec<ExtensionConfig>,

    /// Echo every line test processes produce.
    pub verbose: bool,

    /// Environment variables applied last to every test process.
    pub extra_env: BTreeMap<String, String>,

    /// Collect V8 coverage into this directory.
    pub coverage_dir: Option<Utf8PathBuf>,

    /// How test files are isolated from each other.
    pub isolation: Isolation,

    /// Force the runtime to exit once tests complete.
    pub force_exit: bool,

    /// Regenerate snapshots instead of comparing against them.
    pub regenerate_snapshots: bool,
}

impl RunRequest {
    /// Returns the concurrency to run with.
    pub fn effective_concurrency(&self) -> usize {
        match self.concurrency {
            Some(concurrency) if concurrency > 0 => concurrency,
            _ => crate::get_num_cpus(),
        }
    }
}

/// The last known state of a test or file in a run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TestState {
    /// Nothing was heard about the test yet.
    #[default]
    Pending,

    /// The test is running.
    Started,

    /// The test passed.
    Passed,

    /// The test failed.
    Failed,

    /// The test was skipped or marked todo.
    Skipped,

    /// The file containing the test failed as a whole.
    FileFailed,
}

impl TestState {
    /// Returns true if no further events are expected for the test.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Passed | Self::Failed | Self::Skipped | Self::FileFailed
        )
    }
}

/// Counts of what happened during a run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RunStats {
    /// Tests that started.
    pub started: usize,

    /// Tests that passed.
    pub passed: usize,

    /// Tests that failed.
    pub failed: usize,

    /// Tests that were skipped.
    pub skipped: usize,

    /// Files that failed as a whole.
    pub files_failed: usize,
}

impl RunStats {
    /// Returns true if nothing failed.
    pub fn is_success(&self) -> bool {
        self.failed == 0 && self.files_failed == 0
    }
}

/// The result of a run that wasn't ended by a fatal error.
#[derive(Clone, Debug)]
pub struct RunOutcome {
    /// Counts of what happened.
    pub stats: RunStats,

    /// The last known state of every test and file that was reported on.
    pub states: BTreeMap<TestIdentity, TestState>,

    /// Whether the run was cancelled before completing.
    pub cancelled: bool,

    /// The endpoint the run used.
    pub endpoint: EndpointAddress,
}

impl RunOutcome {
    /// Returns the state of a test, which is [`TestState::Pending`] if nothing was reported.
    pub fn state(&self, identity: &TestIdentity) -> TestState {
        self.states.get(identity).copied().unwrap_or_default()
    }
}

/// How to launch a worker process.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkerCommand {
    /// The worker executable.
    pub program: Utf8PathBuf,

    /// Arguments: the endpoint address.
    pub args: Vec<String>,

    /// Environment variables to set for the worker.
    pub env: Vec<(String, String)>,
}

/// Launches the worker under a debugger instead of as a plain child process.
pub trait DebugLauncher: Send + Sync {
    /// Starts a debug session running `command`.
    ///
    /// The returned future completes when the debug session ends.
    fn launch(
        &self,
        command: &WorkerCommand,
    ) -> Result<BoxFuture<'static, ()>, Box<dyn std::error::Error + Send + Sync>>;
}

/// Runs test files through worker processes.
#[derive(Debug)]
pub struct Orchestrator {
    endpoints: Arc<EndpointAllocator>,
    node_path: Utf8PathBuf,
    worker_path: Utf8PathBuf,
    source_maps: SourceMapStore,
    debug_launcher: Option<DebugIgnore<Arc<dyn DebugLauncher>>>,
}

impl Orchestrator {
    /// Creates an orchestrator that runs tests with the Node.js executable at `node_path`,
    /// through the worker executable at `worker_path`.
    pub fn new(
        endpoints: Arc<EndpointAllocator>,
        node_path: impl Into<Utf8PathBuf>,
        worker_path: impl Into<Utf8PathBuf>,
    ) -> Self {
        Self {
            endpoints,
            node_path: node_path.into(),
            worker_path: worker_path.into(),
            source_maps: SourceMapStore::new(),
            debug_launcher: None,
        }
    }

    /// Launches workers through `launcher`.
    pub fn with_debug_launcher(mut self, launcher: Arc<dyn DebugLauncher>) -> Self {
        self.debug_launcher = Some(DebugIgnore(launcher));
        self
    }

    /// Shares a source map cache with other users.
    pub fn with_source_maps(mut self, source_maps: SourceMapStore) -> Self {
        self.source_maps = source_maps;
        self
    }

    /// Returns the Node.js executable.
    pub fn node_path(&self) -> &Utf8Path {
        &self.node_path
    }

    /// Runs the tests selected by `request`, reporting progress to `reporter`.
    ///
    /// Returns an error if the run as a whole failed. Failures of single tests and files are
    /// reported and don't fail the run.
    pub async fn run<R: RunReporter>(
        &self,
        tree: &mut TestTree,
        request: &RunRequest,
        reporter: R,
        cancel: CancellationToken,
    ) -> Result<RunOutcome, RunError> {
        let address = self.endpoints.allocate();
        let mut listener = EndpointListener::bind(address.clone())?;
        debug!("listening for worker at {address}");
        let mut worker = self.launch(&address)?;

        let mut session = RunSession::new(tree, reporter, self.source_maps.scoped());
        let result = self
            .drive(&mut listener, &mut worker, &mut session, request, &cancel)
            .await;

        // Everything below runs whether or not the run succeeded.
        drop(listener);
        worker.terminate();

        let completed = result?;
        Ok(session.into_outcome(!completed, address))
    }

    fn launch(&self, address: &EndpointAddress) -> Result<WorkerProcess, RunError> {
        let mut env = vec![(NODE_ENV.to_owned(), self.node_path.to_string())];
        if let Ok(log) = std::env::var(LOG_ENV) {
            env.push((LOG_ENV.to_owned(), log));
        }
        let command = WorkerCommand {
            program: self.worker_path.clone(),
            args: vec![address.to_string()],
            env,
        };

        match &self.debug_launcher {
            Some(launcher) => {
                debug!("launching worker under debugger: {command:?}");
                let session = launcher.launch(&command).map_err(RunError::DebugLaunch)?;
                Ok(WorkerProcess::Debug(session.fuse()))
            }
            None => Ok(WorkerProcess::Spawned(SpawnedWorker::spawn(&command)?)),
        }
    }

    /// Returns true if the run completed, false if it was cancelled.
    async fn drive<R: RunReporter>(
        &self,
        listener: &mut EndpointListener,
        worker: &mut WorkerProcess,
        session: &mut RunSession<'_, R>,
        request: &RunRequest,
        cancel: &CancellationToken,
    ) -> Result<bool, RunError> {
        let connection = tokio::select! {
            biased;

            () = cancel.cancelled() => return Ok(false),
            connection = listener.accept() => connection?,
            exit = worker.exited() => return Err(RunError::WorkerExited { exit }),
        };
        debug!("worker connected");
        let mut rpc = RpcConnection::new(connection);
        let sender = rpc.sender().clone();

        let result = match self
            .converse(&mut rpc, &sender, worker, session, request, cancel)
            .await
        {
            Err(RunError::Rpc(error)) => Err(lost_connection_error(worker, error).await),
            result => result,
        };

        // Cancelled runs report nothing further; every other run shows what was already queued.
        if !matches!(result, Ok(false)) {
            session.queue.drain(&mut session.reporter).await;
        }
        _ = sender.notify(&WorkerNotification::Kill);
        if let Err(error) = sender.close().await {
            debug!("error closing worker connection: {error}");
        }
        result
    }

    async fn converse<R: RunReporter>(
        &self,
        rpc: &mut RpcConnection,
        sender: &RpcSender,
        worker: &mut WorkerProcess,
        session: &mut RunSession<'_, R>,
        request: &RunRequest,
        cancel: &CancellationToken,
    ) -> Result<bool, RunError> {
        let version: String = tokio::select! {
            biased;

            () = cancel.cancelled() => return Ok(false),
            version = sender.request(&WorkerRequest::Version) => version?,
            exit = worker.exited() => return Err(RunError::WorkerExited { exit }),
        };
        self.check_version(&version)?;

        let files = resolve_run_files(session.tree, request.include.as_deref(), &request.exclude);
        let params = StartParams {
            concurrency: request.effective_concurrency(),
            files,
            extensions: request.extensions.clone(),
            verbose: request.verbose,
            extra_env: request.extra_env.clone(),
            coverage_dir: request.coverage_dir.as_ref().map(|dir| dir.to_string()),
            isolation: request.isolation,
            force_exit: request.force_exit,
            regenerate_snapshots: request.regenerate_snapshots,
        };
        debug!(
            "starting run of {} files with concurrency {}",
            params.files.len(),
            params.concurrency
        );

        let start_request = WorkerRequest::Start(params);
        let start = sender.request::<StartResult>(&start_request);
        tokio::pin!(start);
        let mut connected = true;

        loop {
            tokio::select! {
                biased;

                () = cancel.cancelled() => {
                    debug!("run cancelled");
                    return Ok(false);
                }
                message = rpc.recv(), if connected => match message {
                    Some(message) => session.handle_message(message?, sender),
                    // The pending start request fails with a disconnection error.
                    None => connected = false,
                },
                result = &mut start => {
                    let result = result?;
                    // Notifications sent before the response are already buffered.
                    while let Some(message) = rpc.try_recv() {
                        session.handle_message(message?, sender);
                    }
                    return match result.status {
                        CompleteStatus::Done => Ok(true),
                        CompleteStatus::NodeVersionOutdated => Err(self.version_unsupported(
                            result.message.unwrap_or_default(),
                        )),
                    };
                }
                () = session.queue.advance(&mut session.reporter), if !session.queue.is_idle() => {}
                exit = worker.exited() => return Err(RunError::WorkerExited { exit }),
            }
        }
    }

    fn check_version(&self, version: &str) -> Result<(), RunError> {
        let parsed = NodeVersion::parse(version).map_err(|error| RunError::NodeVersionParse {
            version: version.to_owned(),
            node_path: self.node_path.to_string(),
            error,
        })?;
        debug!("worker is using Node.js {parsed}");
        if parsed.is_supported() {
            Ok(())
        } else {
            Err(self.version_unsupported(version.to_owned()))
        }
    }

    fn version_unsupported(&self, version: String) -> RunError {
        RunError::NodeVersionUnsupported {
            version,
            minimum: MINIMUM_NODE_VERSION,
            node_path: self.node_path.to_string(),
        }
    }
}

/// How long a worker that dropped its connection has to exit before the connection error is
/// reported instead.
const WORKER_EXIT_GRACE: Duration = Duration::from_secs(5);

/// Reports a broken connection as the worker's exit when the worker went away.
async fn lost_connection_error(worker: &mut WorkerProcess, error: RpcError) -> RunError {
    if matches!(error, RpcError::Disconnected | RpcError::Io(_)) {
        if let Ok(exit) = tokio::time::timeout(WORKER_EXIT_GRACE, worker.exited()).await {
            debug!("worker connection lost: {error}");
            return RunError::WorkerExited { exit };
        }
    }
    RunError::Rpc(error)
}

enum WorkerProcess {
    Spawned(SpawnedWorker),
    Debug(Fuse<BoxFuture<'static, ()>>),
}

impl WorkerProcess {
    /// Waits for the worker to go away. This future is cancel-safe.
    async fn exited(&mut self) -> WorkerExit {
        match self {
            Self::Spawned(worker) => worker.exited().await,
            Self::Debug(session) => {
                session.await;
                WorkerExit::DebugSessionEnded
            }
        }
    }

    fn terminate(&mut self) {
        match self {
            Self::Spawned(worker) => worker.terminate(),
            // Dropping the session future is up to the launcher.
            Self::Debug(_) => {}
        }
    }
}

struct SpawnedWorker {
    child: Child,
    pgid: Option<u32>,
    job: os::Job,
    stderr: Option<JoinHandle<String>>,
    captured: Option<String>,
}

impl SpawnedWorker {
    fn spawn(command: &WorkerCommand) -> Result<Self, WorkerSpawnError> {
        let program = command.program.as_str();
        let mut cmd = tokio::process::Command::new(program);
        cmd.args(&command.args)
            .envs(command.env.iter().cloned())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        os::set_process_group(cmd.as_std_mut());

        let job = os::create_job().map_err(|error| WorkerSpawnError::new(program, error))?;
        let mut child = cmd
            .spawn()
            .map_err(|error| WorkerSpawnError::new(program, error))?;
        if let Err(error) = os::assign_process_to_job(&child, &job) {
            _ = child.start_kill();
            return Err(WorkerSpawnError::new(program, error));
        }
        let pgid = child.id();
        debug!("spawned worker {program} (pid {pgid:?})");

        let stderr = child.stderr.take().map(|stderr| {
            tokio::spawn(async move {
                let mut captured = String::new();
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(target: "nodetest_runner::worker", "{line}");
                    captured.push_str(&line);
                    captured.push('\n');
                }
                captured
            })
        });

        Ok(Self {
            child,
            pgid,
            job,
            stderr,
            captured: None,
        })
    }

    async fn exited(&mut self) -> WorkerExit {
        let status = match self.child.wait().await {
            Ok(status) => status.to_string(),
            Err(error) => format!("unknown status ({error})"),
        };
        if let Some(handle) = &mut self.stderr {
            let captured = handle.await.unwrap_or_default();
            self.stderr = None;
            self.captured = Some(captured);
        }
        WorkerExit::Exited {
            status,
            stderr: self.captured.clone().unwrap_or_default(),
        }
    }

    fn terminate(&mut self) {
        os::terminate_tree(&mut self.child, self.pgid, &self.job);
    }
}

/// The state of one run, fed by worker notifications.
struct RunSession<'a, R> {
    tree: &'a mut TestTree,
    reporter: R,
    queue: OutputQueue<R>,
    states: HashMap<TestNodeId, TestState>,
    stats: RunStats,
    source_maps: ScopedSourceMapStore,
    maintainers: HashMap<Url, SourceMapMaintainer>,
}

impl<'a, R: RunReporter> RunSession<'a, R> {
    fn new(tree: &'a mut TestTree, reporter: R, source_maps: ScopedSourceMapStore) -> Self {
        Self {
            tree,
            reporter,
            queue: OutputQueue::new(),
            states: HashMap::new(),
            stats: RunStats::default(),
            source_maps,
            maintainers: HashMap::new(),
        }
    }

    fn into_outcome(self, cancelled: bool, endpoint: EndpointAddress) -> RunOutcome {
        let states = self
            .states
            .iter()
            .filter_map(|(&node, &state)| Some((self.tree.identity(node)?, state)))
            .collect();
        RunOutcome {
            stats: self.stats,
            states,
            cancelled,
            endpoint,
        }
    }

    fn handle_message(&mut self, message: IncomingMessage, sender: &RpcSender) {
        if let Some(id) = message.id() {
            debug!("rejecting request `{}` from worker", message.method());
            _ = sender.respond(
                id,
                Err::<(), _>(RemoteError {
                    code: METHOD_NOT_FOUND,
                    message: format!("unknown method `{}`", message.method()),
                }),
            );
            return;
        }

        match message.decode::<HostNotification>() {
            Ok(notification) => self.handle_notification(notification),
            Err(error) => debug!("ignoring notification: {error}"),
        }
    }

    fn handle_notification(&mut self, notification: HostNotification) {
        match notification {
            HostNotification::Started(params) => {
                let Some(test) = self.transition(&params.id, TestState::Started) else {
                    return;
                };
                self.stats.started += 1;
                self.queue
                    .enqueue(&mut self.reporter, move |reporter| reporter.started(&test));
            }
            HostNotification::Skipped(params) => {
                let Some(test) = self.transition(&params.id, TestState::Skipped) else {
                    return;
                };
                self.stats.skipped += 1;
                self.queue
                    .enqueue(&mut self.reporter, move |reporter| reporter.skipped(&test));
            }
            HostNotification::Passed(params) => {
                let Some(test) = self.transition(&params.id, TestState::Passed) else {
                    return;
                };
                self.stats.passed += 1;
                let duration = duration_from_millis(params.duration);
                self.queue.enqueue(&mut self.reporter, move |reporter| {
                    reporter.passed(&test, duration)
                });
            }
            HostNotification::Failed(params) => self.handle_failed(params),
            HostNotification::Output(text) => {
                self.queue.enqueue(&mut self.reporter, move |reporter| {
                    reporter.append_output(&text, None, None)
                });
            }
            HostNotification::Log(params) => self.handle_log(params),
            HostNotification::SourceMap(params) => {
                let Some(file) = file_url(Utf8Path::new(&params.test_file)) else {
                    debug!("ignoring source map for `{}`", params.test_file);
                    return;
                };
                debug!("source map for {file}: {}", params.source_map_url);
                // Later lookups go through the override.
                self.maintainers.remove(&file);
                self.source_maps.set_override(file, params.source_map_url);
            }
            HostNotification::FileFailed(params) => self.handle_file_failed(params),
        }
    }

    fn handle_failed(&mut self, params: FailedParams) {
        let Some(test) = self.transition(&params.id, TestState::Failed) else {
            return;
        };
        self.stats.failed += 1;

        let location = params
            .stack
            .as_deref()
            .unwrap_or_default()
            .iter()
            .find(|frame| frame.file.is_some())
            .and_then(|frame| self.locate(frame));
        let mut failure = TestFailure {
            message: params
                .error
                .unwrap_or_else(|| TestFailure::DEFAULT_MESSAGE.to_owned()),
            expected: params.expected,
            actual: params.actual,
            duration: duration_from_millis(params.duration),
            location: None,
        };
        self.queue.enqueue_deferred(
            &mut self.reporter,
            flatten(location),
            move |reporter, location| {
                failure.location = location;
                reporter.failed(&test, &failure);
            },
        );
    }

    fn handle_log(&mut self, params: LogParams) {
        let test = params.id.as_ref().and_then(|id| self.handle_for(id));
        let location = self.locate(&params.log.sf);
        let text = if test.is_some() {
            params.log.chunk
        } else {
            format!("{}{}", params.prefix, params.log.chunk)
        };
        self.queue.enqueue_deferred(
            &mut self.reporter,
            flatten(location),
            move |reporter, location| {
                reporter.append_output(&text, location.as_ref(), test.as_ref())
            },
        );
    }

    fn handle_file_failed(&mut self, params: FileFailedParams) {
        let Some(file) = self.tree.file_node(&params.uri) else {
            debug!("ignoring failure of unknown file {}", params.uri);
            return;
        };
        let Some(handle) = self.handle(file) else {
            return;
        };
        for node in self.tree.descendants(file) {
            let state = self.states.entry(node).or_default();
            if !state.is_terminal() {
                *state = TestState::FileFailed;
            }
        }
        self.stats.files_failed += 1;

        let failure = TestFailure {
            message: params.error,
            expected: None,
            actual: None,
            duration: None,
            location: None,
        };
        self.queue.enqueue(&mut self.reporter, move |reporter| {
            reporter.failed(&handle, &failure)
        });
    }

    /// Moves a test to `state`, returning its handle if the transition is allowed.
    fn transition(&mut self, identity: &TestIdentity, state: TestState) -> Option<TestHandle> {
        let Some(node) = self.tree.resolve(identity) else {
            debug!("dropping event for unknown test {identity}");
            return None;
        };
        let current = self.states.entry(node).or_default();
        if current.is_terminal() {
            debug!("ignoring {state:?} for {identity}, which is already {current:?}");
            return None;
        }
        *current = state;
        self.handle(node)
    }

    fn handle_for(&mut self, identity: &TestIdentity) -> Option<TestHandle> {
        let node = self.tree.resolve(identity)?;
        self.handle(node)
    }

    fn handle(&self, node: TestNodeId) -> Option<TestHandle> {
        let identity = self.tree.identity(node)?;
        Some(TestHandle {
            node,
            identity,
            name: self.tree.display_name(node),
        })
    }

    /// Maps a stack frame to its original location.
    fn locate(&mut self, frame: &StackFrame) -> Option<Deferred<Location>> {
        let url = frame_url(frame.file.as_deref()?)?;
        let line = frame.line_number.unwrap_or(1);
        let column = frame.column.unwrap_or(0);

        let maintainer = self
            .maintainers
            .entry(url)
            .or_insert_with_key(|url| self.source_maps.maintain(url));
        if let Some(accessor) = maintainer.value() {
            return Some(Deferred::Ready(accessor.original_position_for(line, column)));
        }
        let pending = maintainer.refresh(None);
        Some(Deferred::spawn(async move {
            pending.await.original_position_for(line, column)
        }))
    }
}

fn frame_url(file: &str) -> Option<Url> {
    if file.starts_with("file:") {
        return Url::parse(file).ok();
    }
    // Runtime internals (`node:...`) and other non-paths have no location.
    file_url(Utf8Path::new(file))
}

fn flatten<T: Send + 'static>(value: Option<Deferred<T>>) -> Deferred<Option<T>> {
    match value {
        None => Deferred::Ready(None),
        Some(Deferred::Ready(value)) => Deferred::Ready(Some(value)),
        Some(Deferred::Pending(future)) => Deferred::Pending(future.map(Some).boxed()),
    }
}

fn duration_from_millis(millis: Option<f64>) -> Option<Duration> {
    let millis = millis?;
    if !millis.is_finite() || millis < 0.0 {
        warn!("ignoring invalid test duration {millis}");
        return None;
    }
    Some(Duration::from_secs_f64(millis / 1000.0))
}
