// Copyright (c) The nodetest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The worker process launched by the nodetest host.
//!
//! Usage: `nodetest-worker <endpoint-address>`

use nodetest_runner::{
    endpoint::EndpointAddress,
    errors::DisplayErrorChain,
    worker::{init_worker_logging, run_worker},
};
use std::process::ExitCode;
use tracing::error;

fn main() -> ExitCode {
    init_worker_logging();

    let Some(address) = std::env::args().nth(1) else {
        eprintln!("usage: nodetest-worker <endpoint-address>");
        return ExitCode::from(2);
    };
    let address = EndpointAddress::new(address);

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            error!("failed to start async runtime: {err}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run_worker(&address)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{}", DisplayErrorChain::new(err));
            ExitCode::FAILURE
        }
    }
}
