// Copyright (c) The nodetest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! A test runner for Node.js.
//!
//! `nodetest run` runs `node:test` files in parallel, several Node.js test processes at a time,
//! through a separate `nodetest-worker` process. Results are printed as they arrive, with failure
//! locations mapped back to original sources through source maps.
//!
//! The runner itself lives in the `nodetest-runner` crate; this crate is the command-line front
//! end.

#![warn(missing_docs)]

mod dispatch;
mod errors;
mod output;
mod reporter;

#[doc(hidden)]
pub use dispatch::*;
#[doc(hidden)]
pub use errors::*;
