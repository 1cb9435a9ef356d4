// Copyright (c) The nodetest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use libc::SIGKILL;
use std::{io, os::unix::process::CommandExt};
use tokio::process::Child;

/// Puts the worker in a new process group, which the test processes it starts inherit.
pub(super) fn set_process_group(cmd: &mut std::process::Command) {
    cmd.process_group(0);
}

#[derive(Debug)]
pub(super) struct Job(());

pub(super) fn create_job() -> io::Result<Job> {
    Ok(Job(()))
}

pub(super) fn assign_process_to_job(_child: &Child, _job: &Job) -> io::Result<()> {
    Ok(())
}

/// Kills the worker's process group. `pgid` is the worker's pid, captured at spawn time: the
/// group outlives the worker if test processes are still around.
pub(super) fn terminate_tree(child: &mut Child, pgid: Option<u32>, _job: &Job) {
    if let Some(pgid) = pgid.and_then(|pgid| libc::pid_t::try_from(pgid).ok()) {
        // SAFETY: kill has no memory safety requirements. A negative pid addresses the group.
        unsafe {
            libc::kill(-pgid, SIGKILL);
        }
    }
    _ = child.start_kill();
}
