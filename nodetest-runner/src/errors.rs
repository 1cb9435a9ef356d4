// Copyright (c) The nodetest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Errors produced by nodetest.

use camino::Utf8PathBuf;
use config::ConfigError;
use std::{fmt, io};
use thiserror::Error;

/// Displays an error along with its chain of sources.
pub struct DisplayErrorChain<E> {
    error: E,
}

impl<E: std::error::Error> DisplayErrorChain<E> {
    /// Wraps an error.
    pub fn new(error: E) -> Self {
        Self { error }
    }
}

impl<E: std::error::Error> fmt::Display for DisplayErrorChain<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)?;

        let mut source = self.error.source();
        if source.is_some() {
            write!(f, "\n  caused by:")?;
        }
        while let Some(error) = source {
            write!(f, "\n  - {error}")?;
            source = error.source();
        }
        Ok(())
    }
}

/// An error that occurred while parsing the config.
#[derive(Debug, Error)]
#[error("failed to parse nodetest config at `{config_file}`")]
#[non_exhaustive]
pub struct ConfigParseError {
    config_file: Utf8PathBuf,
    #[source]
    err: ConfigError,
}

impl ConfigParseError {
    pub(crate) fn new(config_file: impl Into<Utf8PathBuf>, err: ConfigError) -> Self {
        Self {
            config_file: config_file.into(),
            err,
        }
    }

    /// Returns the config file that failed to parse.
    pub fn config_file(&self) -> &Utf8PathBuf {
        &self.config_file
    }
}

/// An error that occurs while parsing a [`Concurrency`](crate::config::Concurrency) value.
#[derive(Clone, Debug, Error)]
#[error("unrecognized value for concurrency: {input}")]
pub struct ConcurrencyParseError {
    input: String,
}

impl ConcurrencyParseError {
    pub(crate) fn new(input: impl Into<String>) -> Self {
        Self {
            input: input.into(),
        }
    }
}

/// An error that occurred while setting up or using a local endpoint.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EndpointError {
    /// The temporary directory is not valid UTF-8.
    #[error("temporary directory is not valid UTF-8: {}", .0.display())]
    TempDirNotUtf8(std::path::PathBuf),

    /// Binding the listener failed.
    #[error("failed to listen on `{address}`")]
    Bind {
        /// The endpoint address.
        address: String,

        /// The underlying error.
        #[source]
        error: io::Error,
    },

    /// Accepting a connection failed.
    #[error("failed to accept a connection on `{address}`")]
    Accept {
        /// The endpoint address.
        address: String,

        /// The underlying error.
        #[source]
        error: io::Error,
    },

    /// Connecting to an endpoint failed.
    #[error("failed to connect to `{address}`")]
    Connect {
        /// The endpoint address.
        address: String,

        /// The underlying error.
        #[source]
        error: io::Error,
    },
}

/// An error returned by the remote end of a JSON-RPC connection.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("remote error {code}: {message}")]
pub struct RemoteError {
    /// The JSON-RPC error code.
    pub code: i64,

    /// The error message.
    pub message: String,
}

/// An error that occurred on a JSON-RPC connection.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RpcError {
    /// Reading from or writing to the transport failed.
    #[error("transport I/O error")]
    Io(#[from] io::Error),

    /// A message header was malformed.
    #[error("malformed message header: {0}")]
    Framing(String),

    /// A message body could not be decoded.
    #[error("failed to decode `{context}`")]
    Decode {
        /// What was being decoded.
        context: String,

        /// The underlying error.
        #[source]
        error: serde_json::Error,
    },

    /// A message could not be encoded.
    #[error("failed to encode message")]
    Encode(#[source] serde_json::Error),

    /// The connection closed before a response arrived.
    #[error("connection closed")]
    Disconnected,

    /// The remote end answered with an error.
    #[error(transparent)]
    Remote(#[from] RemoteError),
}

/// An error that occurred while launching the worker process.
#[derive(Debug, Error)]
#[error("failed to spawn worker `{program}`")]
pub struct WorkerSpawnError {
    program: String,
    #[source]
    error: io::Error,
}

impl WorkerSpawnError {
    pub(crate) fn new(program: impl Into<String>, error: io::Error) -> Self {
        Self {
            program: program.into(),
            error,
        }
    }
}

/// The way the worker process ended before a run completed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WorkerExit {
    /// The worker exited on its own.
    Exited {
        /// The exit status, as reported by the OS.
        status: String,

        /// Everything the worker wrote to stderr.
        stderr: String,
    },

    /// The debug session hosting the worker ended.
    DebugSessionEnded,
}

impl fmt::Display for WorkerExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exited { status, stderr } => {
                write!(f, "{status}")?;
                let stderr = stderr.trim_end();
                if !stderr.is_empty() {
                    write!(f, ": {stderr}")?;
                }
                Ok(())
            }
            Self::DebugSessionEnded => write!(f, "debug session ended"),
        }
    }
}

/// A fatal error for a whole test run.
///
/// Failures scoped to single files or tests are reported through the
/// [`RunReporter`](crate::reporter::RunReporter) instead.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RunError {
    /// The local endpoint could not be set up.
    #[error("failed to set up the worker endpoint")]
    Endpoint(#[from] EndpointError),

    /// The worker could not be launched.
    #[error(transparent)]
    WorkerSpawn(#[from] WorkerSpawnError),

    /// The debug launcher failed.
    #[error("failed to launch the worker under a debugger")]
    DebugLaunch(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// The worker went away before the run completed.
    #[error("worker exited without signalling completion ({exit})")]
    WorkerExited {
        /// How the worker ended.
        exit: WorkerExit,
    },

    /// Talking to the worker failed.
    #[error("communication with the worker failed")]
    Rpc(#[from] RpcError),

    /// The Node.js runtime is too old.
    #[error(
        "nodetest requires Node.js {minimum} or above (`{node_path}` is {version}); \
         set `node-path` to use a different Node.js executable"
    )]
    NodeVersionUnsupported {
        /// The version reported by the runtime.
        version: String,

        /// The minimum supported version.
        minimum: semver::Version,

        /// The configured runtime executable.
        node_path: String,
    },

    /// The runtime reported a version string that isn't valid semver.
    #[error("Node.js at `{node_path}` reported an unrecognized version `{version}`")]
    NodeVersionParse {
        /// The version reported by the runtime.
        version: String,

        /// The configured runtime executable.
        node_path: String,

        /// The underlying error.
        #[source]
        error: semver::Error,
    },
}

/// An error that occurred while looking for the Node.js executable.
#[derive(Debug, Error)]
#[error(
    "unable to find `node` on PATH or through the login shell (searched PATH: {search_path})"
)]
pub struct FindNodeError {
    search_path: String,
    #[source]
    shell_error: Option<io::Error>,
}

impl FindNodeError {
    pub(crate) fn new(search_path: impl Into<String>, shell_error: Option<io::Error>) -> Self {
        Self {
            search_path: search_path.into(),
            shell_error,
        }
    }
}

/// An error that occurred while setting up the signal handler.
#[derive(Debug, Error)]
#[error("error setting up signal handler")]
pub struct SignalHandlerSetupError(#[source] io::Error);

impl SignalHandlerSetupError {
    pub(crate) fn new(error: io::Error) -> Self {
        Self(error)
    }
}

/// An error that occurred while loading a source map.
///
/// These never escape the source map store: a failing map is replaced by an identity mapping.
#[derive(Debug, Error)]
pub(crate) enum SourceMapError {
    #[error("failed to read `{path}`")]
    Read {
        path: String,
        #[source]
        error: io::Error,
    },

    #[error("failed to decode source map for `{file}`")]
    Decode {
        file: String,
        #[source]
        error: sourcemap::Error,
    },

    #[error("invalid source map URL `{url}` for `{file}`")]
    InvalidUrl {
        url: String,
        file: String,
        #[source]
        error: url::ParseError,
    },

    #[error("source map URL `{0}` does not point to a local file")]
    NotAFile(String),
}

/// An error that ended the worker process.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum WorkerError {
    /// Connecting to the host failed.
    #[error("failed to connect to host")]
    Connect(#[from] EndpointError),

    /// The connection to the host failed.
    #[error("connection to host failed")]
    Rpc(#[from] RpcError),

    /// The test reporter hook could not be written out.
    #[error("failed to write test reporter hook to `{path}`")]
    ReporterSetup {
        /// Where the hook was being written.
        path: Utf8PathBuf,

        /// The underlying error.
        #[source]
        error: io::Error,
    },
}
