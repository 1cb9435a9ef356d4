// Copyright (c) The nodetest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

#![warn(missing_docs)]

//! The wire contract between the nodetest host and `nodetest-worker`.
//!
//! Both ends of the transport agree on three closed sets of messages:
//!
//! * [`HostNotification`]: progress and results sent by the worker to the host.
//! * [`WorkerRequest`]: requests sent by the host, answered by the worker.
//! * [`WorkerNotification`]: fire-and-forget messages sent by the host.
//!
//! Each enum serializes to the `method`/`params` part of a JSON-RPC 2.0 message. Framing and
//! request correlation live in `nodetest-runner`.

mod exit_codes;
mod messages;

pub use exit_codes::*;
pub use messages::*;
