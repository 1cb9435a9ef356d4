// Copyright (c) The nodetest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

#![warn(missing_docs)]

//! Core functionality for nodetest: runs Node.js test files across a pool of child processes
//! owned by a separate worker process, and relays their results back to the host.
//!
//! The basic flow of a run is:
//!
//! 1. The host ([`orchestrator::Orchestrator`]) allocates a private local endpoint, binds it and
//!    launches `nodetest-worker` with the endpoint address.
//! 2. The worker connects, reports the Node.js runtime version and, once asked to `start`, runs
//!    each file in one of several concurrent lanes (see [`worker`]).
//! 3. Results stream back as [`nodetest_protocol::HostNotification`]s. The host maps failure
//!    locations through [`source_map`] and forwards everything to a
//!    [`reporter::RunReporter`] in arrival order (see [`output_queue`]).

pub mod cancel;
pub mod config;
pub mod endpoint;
pub mod errors;
pub mod find_node;
mod helpers;
pub mod node_version;
pub mod orchestrator;
pub mod output_queue;
pub mod reporter;
pub mod rpc;
pub mod selection;
pub mod signal;
pub mod source_map;
pub mod test_tree;
pub mod worker;

pub use helpers::get_num_cpus;
