// Copyright (c) The nodetest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::output::{NO_HEADING_TARGET, StderrStyles};
use camino::Utf8PathBuf;
use nodetest_protocol::NodetestExitCode;
use nodetest_runner::errors::*;
use owo_colors::OwoColorize;
use std::{error::Error, path::PathBuf};
use thiserror::Error;
use tracing::error;

pub(crate) type Result<T, E = ExpectedError> = std::result::Result<T, E>;

// Note that the #[error()] strings are mostly placeholder messages -- the expected way to print out
// errors is with the display_to_stderr method, which colorizes errors.

/// An error that nodetest knows how to report.
#[derive(Debug, Error)]
#[doc(hidden)]
pub enum ExpectedError {
    #[error("could not read current directory")]
    CurrentDirFailed { error: std::io::Error },
    #[error("current directory is not valid UTF-8")]
    CurrentDirNotUtf8 { path: PathBuf },
    #[error("config parse error")]
    ConfigParseError {
        #[from]
        err: ConfigParseError,
    },
    #[error("test file not found")]
    TestFileNotFound { path: Utf8PathBuf },
    #[error("invalid test name")]
    InvalidTestName { name: String },
    #[error("node not found")]
    FindNodeError {
        #[from]
        err: FindNodeError,
    },
    #[error("could not locate worker")]
    WorkerPathError { error: std::io::Error },
    #[error("failed to start async runtime")]
    RuntimeSetupError { error: std::io::Error },
    #[error("signal handler setup error")]
    SignalHandlerSetupError {
        #[from]
        err: SignalHandlerSetupError,
    },
    #[error("endpoint setup error")]
    EndpointSetupError {
        #[from]
        err: EndpointError,
    },
    #[error("run error")]
    RunError {
        #[from]
        err: RunError,
    },
    #[error("no tests to run")]
    NoTestsRun,
    #[error("test run failed")]
    TestRunFailed,
    #[error("test run interrupted")]
    Interrupted,
    #[error("error writing output")]
    WriteOutputError { error: std::io::Error },
}

impl ExpectedError {
    pub(crate) fn current_dir_failed(error: std::io::Error) -> Self {
        Self::CurrentDirFailed { error }
    }

    pub(crate) fn runtime_setup_error(error: std::io::Error) -> Self {
        Self::RuntimeSetupError { error }
    }

    pub(crate) fn write_output_error(error: std::io::Error) -> Self {
        Self::WriteOutputError { error }
    }

    /// Returns the exit code for the process.
    pub fn process_exit_code(&self) -> i32 {
        match self {
            Self::CurrentDirFailed { .. }
            | Self::CurrentDirNotUtf8 { .. }
            | Self::ConfigParseError { .. }
            | Self::TestFileNotFound { .. }
            | Self::InvalidTestName { .. }
            | Self::FindNodeError { .. }
            | Self::WorkerPathError { .. }
            | Self::RuntimeSetupError { .. }
            | Self::SignalHandlerSetupError { .. }
            | Self::EndpointSetupError { .. } => NodetestExitCode::SETUP_ERROR,
            Self::RunError { err } => match err {
                RunError::NodeVersionUnsupported { .. } | RunError::NodeVersionParse { .. } => {
                    NodetestExitCode::NODE_VERSION_UNSUPPORTED
                }
                RunError::Endpoint(_) => NodetestExitCode::SETUP_ERROR,
                _ => NodetestExitCode::WORKER_FAILED,
            },
            Self::NoTestsRun => NodetestExitCode::NO_TESTS_RUN,
            Self::TestRunFailed => NodetestExitCode::TEST_RUN_FAILED,
            Self::Interrupted => NodetestExitCode::INTERRUPTED,
            Self::WriteOutputError { .. } => NodetestExitCode::WRITE_OUTPUT_ERROR,
        }
    }

    /// Displays this error to stderr.
    pub fn display_to_stderr(&self, styles: &StderrStyles) {
        let mut next_error = match &self {
            Self::CurrentDirFailed { error } => {
                error!("could not read current directory");
                Some(error as &dyn Error)
            }
            Self::CurrentDirNotUtf8 { path } => {
                error!(
                    "current directory `{}` is not valid UTF-8",
                    path.display().style(styles.bold)
                );
                None
            }
            Self::ConfigParseError { err } => {
                error!(
                    "failed to parse nodetest config at `{}`",
                    err.config_file().style(styles.bold)
                );
                err.source()
            }
            Self::TestFileNotFound { path } => {
                error!("test file `{}` not found", path.style(styles.bold));
                None
            }
            Self::InvalidTestName { name } => {
                error!(
                    "invalid test name `{}`: names of nested tests are separated by ` > `",
                    name.style(styles.bold)
                );
                None
            }
            Self::FindNodeError { err } => {
                error!("{err}");
                error!(
                    target: NO_HEADING_TARGET,
                    "(hint: {} to point nodetest at a Node.js executable)",
                    "pass --node or set node-path in nodetest.toml".style(styles.warning_text)
                );
                err.source()
            }
            Self::WorkerPathError { error } => {
                error!(
                    "could not determine the path to {} (pass --worker to set it)",
                    "nodetest-worker".style(styles.bold)
                );
                Some(error as &dyn Error)
            }
            Self::RuntimeSetupError { error } => {
                error!("failed to start async runtime");
                Some(error as &dyn Error)
            }
            Self::SignalHandlerSetupError { err } => {
                error!("{err}");
                err.source()
            }
            Self::EndpointSetupError { err } => {
                error!("failed to set up worker endpoint");
                Some(err as &dyn Error)
            }
            Self::RunError { err } => {
                error!("{err}");
                err.source()
            }
            Self::NoTestsRun => {
                error!("no tests to run");
                None
            }
            Self::TestRunFailed => {
                error!("test run failed");
                None
            }
            Self::Interrupted => {
                error!("test run interrupted");
                None
            }
            Self::WriteOutputError { error } => {
                error!("error writing output");
                Some(error as &dyn Error)
            }
        };

        while let Some(err) = next_error {
            error!(target: NO_HEADING_TARGET, "\nCaused by:\n  {}", err);
            next_error = err.source();
        }
    }
}
