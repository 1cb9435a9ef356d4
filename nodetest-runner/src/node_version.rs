// Copyright (c) The nodetest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Node.js runtime versions and the test runner features they support.

use semver::Version;
use std::fmt;

/// The oldest Node.js runtime nodetest works with.
pub const MINIMUM_NODE_VERSION: Version = Version::new(19, 0, 0);

/// A parsed Node.js runtime version.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct NodeVersion {
    version: Version,
}

impl NodeVersion {
    /// Parses the output of `node --version`, such as `v22.3.0`.
    pub fn parse(input: &str) -> Result<Self, semver::Error> {
        let input = input.trim();
        let input = input.strip_prefix('v').unwrap_or(input);
        Ok(Self {
            version: Version::parse(input)?,
        })
    }

    /// Returns the semantic version.
    pub fn version(&self) -> &Version {
        &self.version
    }

    /// Returns true if this version is at least [`MINIMUM_NODE_VERSION`].
    pub fn is_supported(&self) -> bool {
        self.at_least(
            MINIMUM_NODE_VERSION.major,
            MINIMUM_NODE_VERSION.minor,
            MINIMUM_NODE_VERSION.patch,
        )
    }

    /// Returns the test runner features this version supports.
    pub fn capabilities(&self) -> NodeCapabilities {
        NodeCapabilities {
            experimental_snapshots: self.at_least(22, 3, 0) && self.below(24, 0, 0),
            test_force_exit: self.at_least(22, 0, 0)
                || (self.version.major == 20 && self.at_least(20, 14, 0)),
            experimental_test_isolation: self.at_least(22, 8, 0) && self.below(23, 6, 0),
            test_isolation: self.at_least(23, 6, 0),
            test_skip_pattern: self.at_least(22, 1, 0),
        }
    }

    /// Returns true if this version has snapshot tests, experimental or not.
    pub fn supports_snapshots(&self) -> bool {
        self.at_least(22, 3, 0)
    }

    // Prereleases of a version count as that version.
    fn at_least(&self, major: u64, minor: u64, patch: u64) -> bool {
        (self.version.major, self.version.minor, self.version.patch) >= (major, minor, patch)
    }

    fn below(&self, major: u64, minor: u64, patch: u64) -> bool {
        !self.at_least(major, minor, patch)
    }
}

impl fmt::Display for NodeVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.version)
    }
}

/// Test runner features that vary across Node.js versions.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NodeCapabilities {
    /// Snapshot tests exist but need `--experimental-test-snapshots`.
    pub experimental_snapshots: bool,

    /// `--test-force-exit` is available.
    pub test_force_exit: bool,

    /// Isolation is set with `--experimental-test-isolation`.
    pub experimental_test_isolation: bool,

    /// Isolation is set with `--test-isolation`.
    pub test_isolation: bool,

    /// Tests can be left out with `--test-skip-pattern`.
    pub test_skip_pattern: bool,
}
