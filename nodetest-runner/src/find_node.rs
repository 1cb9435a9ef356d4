// Copyright (c) The nodetest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Locates the Node.js executable when none is configured.

use crate::errors::FindNodeError;
use camino::{Utf8Path, Utf8PathBuf};
use std::{ffi::OsStr, path::Path};
use tracing::debug;

#[cfg(windows)]
const NODE_EXE: &str = "node.exe";
#[cfg(not(windows))]
const NODE_EXE: &str = "node";

const START_MARKER: &str = "___NODETEST_START__";
const END_MARKER: &str = "___NODETEST_END__";

/// Finds `node`, first on `PATH` and then (on Unix) through the user's interactive shell, which
/// picks up version managers that are only set up in shell profiles.
///
/// `cwd` is the directory the shell is started in, since some version managers pick a runtime
/// per directory.
pub fn find_node(cwd: &Utf8Path) -> Result<Utf8PathBuf, FindNodeError> {
    let search_path = std::env::var_os("PATH").unwrap_or_default();
    if let Some(node) = find_in_path(&search_path) {
        debug!("found node on PATH at {node}");
        return Ok(node);
    }

    let shell_error = match find_via_shell(cwd) {
        Ok(Some(node)) => {
            debug!("found node through the login shell at {node}");
            return Ok(node);
        }
        Ok(None) => None,
        Err(error) => Some(error),
    };

    Err(FindNodeError::new(
        search_path.to_string_lossy(),
        shell_error,
    ))
}

fn find_in_path(search_path: &OsStr) -> Option<Utf8PathBuf> {
    std::env::split_paths(search_path)
        .map(|dir| dir.join(NODE_EXE))
        .find(|candidate| is_executable(candidate))
        .and_then(|candidate| Utf8PathBuf::from_path_buf(candidate).ok())
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    path.metadata()
        .is_ok_and(|metadata| metadata.is_file() && metadata.permissions().mode() & 0o111 != 0)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

#[cfg(unix)]
fn find_via_shell(cwd: &Utf8Path) -> std::io::Result<Option<Utf8PathBuf>> {
    let Some(shell) = std::env::var_os("SHELL") else {
        return Ok(None);
    };
    let script = format!("echo {START_MARKER} && which node && echo {END_MARKER}");
    let expression = duct::cmd(shell, ["-i", "-c", script.as_str()])
        .dir(cwd)
        .stdin_null()
        .stdout_capture()
        .stderr_null()
        .unchecked();
    debug!("looking for node with {:?}", expression);

    let output = expression.run()?;
    if !output.status.success() {
        debug!("shell lookup for node failed with {}", output.status);
        return Ok(None);
    }
    Ok(extract_between_markers(&String::from_utf8_lossy(&output.stdout)).map(Utf8PathBuf::from))
}

#[cfg(not(unix))]
fn find_via_shell(_cwd: &Utf8Path) -> std::io::Result<Option<Utf8PathBuf>> {
    Ok(None)
}

/// Shell profiles may print anything, so the interesting part is delimited by markers.
fn extract_between_markers(output: &str) -> Option<&str> {
    let start = output.find(START_MARKER)? + START_MARKER.len();
    let end = start + output[start..].find(END_MARKER)?;
    let found = output[start..end].trim();
    (!found.is_empty()).then_some(found)
}
