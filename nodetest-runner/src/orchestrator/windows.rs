// Copyright (c) The nodetest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::io;
use tokio::process::Child;
pub(super) use win32job::Job;
use windows_sys::Win32::System::JobObjects::TerminateJobObject;

pub(super) fn set_process_group(_cmd: &mut std::process::Command) {
    // Windows has no process groups; the job object covers the worker's children instead.
}

pub(super) fn create_job() -> io::Result<Job> {
    Job::create_with_limit_info(
        win32job::ExtendedLimitInfo::new()
            .limit_breakaway_ok()
            .limit_kill_on_job_close(),
    )
    .map_err(io::Error::other)
}

pub(super) fn assign_process_to_job(child: &Child, job: &Job) -> io::Result<()> {
    let Some(handle) = child.raw_handle() else {
        // The worker already exited.
        return Ok(());
    };
    job.assign_process(handle as isize).map_err(io::Error::other)
}

pub(super) fn terminate_tree(child: &mut Child, _pgid: Option<u32>, job: &Job) {
    let handle = job.handle();
    // SAFETY: the handle stays valid for as long as `job` is alive.
    unsafe {
        _ = TerminateJobObject(handle as _, 1);
    }
    _ = child.start_kill();
}
