// Copyright (c) The nodetest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::{
    ExpectedError,
    errors::Result,
    output::{OutputContext, OutputOpts},
    reporter::{ConsoleReporter, ReporterStyles, write_summary},
};
use camino::{Utf8Path, Utf8PathBuf};
use clap::{Args, Parser, Subcommand, ValueEnum};
use futures::future::{BoxFuture, FutureExt};
use nodetest_protocol::{Isolation, NodetestExitCode};
use nodetest_runner::{
    cancel::CancellationToken,
    config::{Concurrency, DefaultConfigWarnings, NodetestConfig},
    endpoint::EndpointAllocator,
    find_node::find_node,
    orchestrator::{DebugLauncher, Orchestrator, RunRequest, WorkerCommand},
    signal::SignalHandler,
    test_tree::{TestFile, TestNodeId, TestTree},
};
use std::sync::Arc;
use tracing::{debug, info};

/// A test runner for Node.js.
///
/// Runs `node:test` files in parallel through a worker process, and reports results with
/// failure locations mapped back to original sources.
#[derive(Debug, Parser)]
#[command(version, name = "nodetest", styles = crate::output::clap_styles::style())]
pub struct NodetestApp {
    #[command(flatten)]
    output: OutputOpts,

    #[command(subcommand)]
    command: Command,
}

impl NodetestApp {
    /// Initializes the output context.
    pub fn init_output(&self) -> OutputContext {
        self.output.init()
    }

    /// Executes the app.
    pub fn exec(self, output: OutputContext) -> Result<i32> {
        match self.command {
            Command::Run(opts) => opts.exec(output),
        }
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run test files
    ///
    /// Each file runs in its own Node.js test process, several at a time. Results are printed as
    /// they arrive.
    Run(RunOpts),
}

#[derive(Debug, Args)]
struct RunOpts {
    /// Config file [default: workspace-root/nodetest.toml]
    #[arg(long, value_name = "PATH")]
    config_file: Option<Utf8PathBuf>,

    /// Directory that relative config paths are resolved against [default: current directory]
    #[arg(long, value_name = "DIR")]
    workspace_root: Option<Utf8PathBuf>,

    #[command(flatten)]
    filter: FilterOpts,

    #[command(flatten)]
    runner: RunnerOpts,

    /// Test files to run
    #[arg(required = true, value_name = "FILES")]
    files: Vec<Utf8PathBuf>,
}

#[derive(Debug, Args)]
#[command(next_help_heading = "Filter options")]
struct FilterOpts {
    /// Only run tests with this name (nested names are joined with ` > `)
    #[arg(long = "test-name", value_name = "NAME")]
    test_names: Vec<String>,

    /// Skip tests with this name (nested names are joined with ` > `)
    #[arg(long = "skip-name", value_name = "NAME")]
    skip_names: Vec<String>,
}

#[derive(Debug, Args)]
#[command(next_help_heading = "Runner options")]
struct RunnerOpts {
    /// Number of test files to run at once [possible values: integer or "num-cpus"]
    #[arg(long, short = 'j', value_name = "N", env = "NODETEST_CONCURRENCY")]
    concurrency: Option<Concurrency>,

    /// Node.js executable [default: `node-path` from config, or found on PATH]
    #[arg(long, value_name = "PATH", env = "NODETEST_NODE_PATH")]
    node: Option<Utf8PathBuf>,

    /// Worker executable [default: nodetest-worker next to this binary]
    #[arg(long, value_name = "PATH")]
    worker: Option<Utf8PathBuf>,

    /// Set an environment variable for test processes
    #[arg(long = "env", value_name = "KEY=VALUE", value_parser = parse_env_var)]
    env: Vec<(String, String)>,

    /// Collect V8 coverage into this directory
    #[arg(long, value_name = "DIR")]
    coverage_dir: Option<Utf8PathBuf>,

    /// How Node.js isolates test files from each other
    #[arg(long, value_enum, value_name = "MODE")]
    isolation: Option<IsolationOpt>,

    /// Make test processes exit once their tests complete, even with open handles
    #[arg(long)]
    force_exit: bool,

    /// Regenerate snapshots instead of comparing against them
    #[arg(long)]
    update_snapshots: bool,

    /// Launch the worker under this debugger command
    #[arg(long, value_name = "PROGRAM")]
    debug_command: Option<Utf8PathBuf>,

    /// Argument to pass to the debugger command, before the worker command line
    #[arg(long = "debug-arg", value_name = "ARG", requires = "debug_command")]
    debug_args: Vec<String>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum IsolationOpt {
    /// Each file in its own process
    Process,

    /// Files share one process
    None,
}

impl From<IsolationOpt> for Isolation {
    fn from(opt: IsolationOpt) -> Self {
        match opt {
            IsolationOpt::Process => Isolation::Process,
            IsolationOpt::None => Isolation::None,
        }
    }
}

fn parse_env_var(input: &str) -> Result<(String, String), String> {
    match input.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_owned(), value.to_owned())),
        _ => Err(format!("expected KEY=VALUE, found `{input}`")),
    }
}

impl RunOpts {
    fn exec(self, output: OutputContext) -> Result<i32> {
        let cwd = current_dir()?;
        let workspace_root = match &self.workspace_root {
            Some(root) => cwd.join(root),
            None => cwd.clone(),
        };
        let config = NodetestConfig::from_sources(
            &workspace_root,
            self.config_file.as_deref(),
            &mut DefaultConfigWarnings,
        )?;

        let mut tree = TestTree::new();
        let request = self.build_request(&config, &cwd, output.verbose, &mut tree)?;

        let node_path = match self.runner.node.clone().or_else(|| config.node_path()) {
            Some(node_path) => node_path,
            None => find_node(&workspace_root)?,
        };
        let worker_path = match self.runner.worker.clone().or_else(|| config.worker_path()) {
            Some(worker_path) => worker_path,
            None => default_worker_path()?,
        };
        debug!("using node at {node_path}, worker at {worker_path}");

        let endpoints = EndpointAllocator::in_temp_dir()?;
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .map_err(ExpectedError::runtime_setup_error)?;

        let mut styles = ReporterStyles::default();
        if output.color.should_colorize(supports_color::Stream::Stderr) {
            styles.colorize();
        }

        let orchestrator = Orchestrator::new(Arc::new(endpoints), node_path, worker_path);
        let orchestrator = match &self.runner.debug_command {
            Some(program) => orchestrator.with_debug_launcher(Arc::new(CommandDebugLauncher {
                program: program.clone(),
                args: self.runner.debug_args.clone(),
            })),
            None => orchestrator,
        };

        runtime.block_on(run_tests(&orchestrator, &mut tree, &request, &styles))
    }

    /// Registers the files to run in `tree` and builds the request for them, with command-line
    /// options taking precedence over config.
    fn build_request(
        &self,
        config: &NodetestConfig,
        cwd: &Utf8Path,
        verbose: bool,
        tree: &mut TestTree,
    ) -> Result<RunRequest> {
        let files = self
            .files
            .iter()
            .map(|file| {
                let path = cwd.join(file);
                if !path.is_file() {
                    return Err(ExpectedError::TestFileNotFound { path });
                }
                let test_file =
                    TestFile::new(path.clone()).ok_or(ExpectedError::TestFileNotFound { path })?;
                Ok(tree.add_file(None, test_file))
            })
            .collect::<Result<Vec<_>>>()?;

        let include = if self.filter.test_names.is_empty() {
            None
        } else {
            Some(add_named_tests(tree, &files, &self.filter.test_names)?)
        };
        let exclude = add_named_tests(tree, &files, &self.filter.skip_names)?;

        let concurrency = self.runner.concurrency.unwrap_or_else(|| config.concurrency());
        let mut extra_env = config.env().clone();
        extra_env.extend(self.runner.env.iter().cloned());
        let coverage_dir = match &self.runner.coverage_dir {
            Some(dir) => Some(cwd.join(dir)),
            None => config.coverage_dir(),
        };

        Ok(RunRequest {
            include,
            exclude,
            concurrency: Some(concurrency.compute()),
            extensions: config.extensions().to_vec(),
            verbose: verbose || config.verbose(),
            extra_env,
            coverage_dir,
            isolation: self
                .runner
                .isolation
                .map_or_else(|| config.isolation(), Isolation::from),
            force_exit: self.runner.force_exit || config.force_exit(),
            regenerate_snapshots: self.runner.update_snapshots,
        })
    }
}

/// Runs the tests, cancelling the run on Ctrl-C and other shutdown signals.
async fn run_tests(
    orchestrator: &Orchestrator,
    tree: &mut TestTree,
    request: &RunRequest,
    styles: &ReporterStyles,
) -> Result<i32> {
    let cancel = CancellationToken::new();
    let signals = SignalHandler::new()?;
    let signal_task = tokio::spawn(signals.cancel_on_shutdown(cancel.clone()));

    let reporter = ConsoleReporter::new(std::io::stderr(), styles.clone(), request.verbose);
    let write_errors = reporter.errors();
    let outcome = orchestrator.run(tree, request, reporter, cancel).await;
    signal_task.abort();
    let outcome = outcome?;

    if let Some(error) = write_errors.take() {
        return Err(ExpectedError::write_output_error(error));
    }
    write_summary(
        &mut std::io::stderr(),
        &outcome.stats,
        outcome.cancelled,
        styles,
    )
    .map_err(ExpectedError::write_output_error)?;

    if outcome.cancelled {
        Err(ExpectedError::Interrupted)
    } else if outcome.stats.started == 0 && outcome.stats.files_failed == 0 {
        Err(ExpectedError::NoTestsRun)
    } else if !outcome.stats.is_success() {
        Err(ExpectedError::TestRunFailed)
    } else {
        Ok(NodetestExitCode::OK)
    }
}

/// Adds a test node for every name under every file, returning the nodes.
fn add_named_tests(
    tree: &mut TestTree,
    files: &[TestNodeId],
    names: &[String],
) -> Result<Vec<TestNodeId>> {
    let mut nodes = Vec::with_capacity(files.len() * names.len());
    for name in names {
        let segments: Vec<_> = name.split(" > ").map(str::trim).collect();
        if segments.iter().any(|segment| segment.is_empty()) {
            return Err(ExpectedError::InvalidTestName { name: name.clone() });
        }
        for &file in files {
            let node = segments
                .iter()
                .fold(file, |parent, segment| tree.add_test(parent, *segment));
            nodes.push(node);
        }
    }
    Ok(nodes)
}

fn current_dir() -> Result<Utf8PathBuf> {
    let cwd = std::env::current_dir().map_err(ExpectedError::current_dir_failed)?;
    Utf8PathBuf::try_from(cwd).map_err(|err| ExpectedError::CurrentDirNotUtf8 {
        path: err.into_path_buf(),
    })
}

/// The worker is installed next to the `nodetest` binary.
fn default_worker_path() -> Result<Utf8PathBuf> {
    let exe = std::env::current_exe()
        .map_err(|error| ExpectedError::WorkerPathError { error })?;
    let dir = exe.parent().ok_or_else(|| ExpectedError::WorkerPathError {
        error: std::io::Error::other(format!("`{}` has no parent directory", exe.display())),
    })?;
    let worker = dir.join(format!("nodetest-worker{}", std::env::consts::EXE_SUFFIX));
    Utf8PathBuf::from_path_buf(worker).map_err(|worker| ExpectedError::WorkerPathError {
        error: std::io::Error::other(format!("`{}` is not valid UTF-8", worker.display())),
    })
}

/// Runs the worker command line under a debugger: `<program> <args>... <worker> <worker args>...`.
#[derive(Debug)]
struct CommandDebugLauncher {
    program: Utf8PathBuf,
    args: Vec<String>,
}

impl DebugLauncher for CommandDebugLauncher {
    fn launch(
        &self,
        command: &WorkerCommand,
    ) -> Result<BoxFuture<'static, ()>, Box<dyn std::error::Error + Send + Sync>> {
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&self.args)
            .arg(&command.program)
            .args(&command.args)
            .envs(command.env.iter().cloned())
            .kill_on_drop(true);
        info!(
            "launching worker under debugger: {} {}",
            self.program,
            self.args.join(" ")
        );
        let mut child = cmd.spawn()?;

        Ok(async move {
            match child.wait().await {
                Ok(status) => debug!("debug session ended with {status}"),
                Err(error) => debug!("failed to wait for debug session: {error}"),
            }
        }
        .boxed())
    }
}
