// SPDX-License-Identifier: Mulan PSL v2
/*
 * Copyright (c) 2024 Huawei Technologies Co., Ltd.
 * procpatch is licensed under Mulan PSL v2.
 * You can use this software according to the terms and conditions of the Mulan PSL v2.
 * You may obtain a copy of Mulan PSL v2 at:
 *         http://license.coscl.org.cn/MulanPSL2
 *
 * THIS SOFTWARE IS PROVIDED ON AN "AS IS" BASIS, WITHOUT WARRANTIES OF ANY KIND,
 * EITHER EXPRESS OR IMPLIED, INCLUDING BUT NOT LIMITED TO NON-INFRINGEMENT,
 * MERCHANTABILITY OR FIT FOR A PARTICULAR PURPOSE.
 * See the Mulan PSL v2 for more details.
 */

use std::os::unix::io::RawFd;

use anyhow::{bail, Context, Result};
use log::{debug, error, info, warn};

use procpatch_common::os;

use crate::args::Command;
use crate::cmd::CommandExecutor;
use crate::error::PatchError;
use crate::patch::installer;
use crate::process::Process;
use crate::storage::Storage;

pub struct PatchCommandExecutor;

impl CommandExecutor for PatchCommandExecutor {
    fn invoke(&self, command: &Command) -> Result<Option<i32>> {
        let (target, just_started, ready_fd, storage_path) = match command {
            Command::Patch {
                target,
                just_started,
                ready_fd,
                storage,
            } => (target, *just_started, *ready_fd, storage),
            _ => return Ok(None),
        };

        super::check_root_permission()?;
        os::signal::block(&[os::signal::SIGINT, os::signal::SIGTERM])
            .context("Failed to block termination signals")?;

        let storage = Storage::open(storage_path)?;
        let exit_code = super::for_each_target(target, |pid| {
            patch_one_process(pid, &storage, just_started)
        });

        if let Some(fd) = ready_fd {
            notify_launcher(fd, exit_code);
        }

        Ok(Some(exit_code))
    }
}

fn patch_one_process(pid: i32, storage: &Storage, just_started: bool) -> i32 {
    match patch_process(pid, storage, just_started) {
        Ok(count) => {
            info!(
                "{} patch hunk(s) were successfully applied to PID '{}'",
                count, pid
            );
            count as i32
        }
        Err(e) if matches!(e.downcast_ref::<PatchError>(), Some(PatchError::NoMatch)) => {
            info!("No patch(es) applicable to PID '{}'", pid);
            0
        }
        Err(e) => {
            error!("Failed to patch PID '{}', {:#}", pid, e);
            -1
        }
    }
}

fn patch_process(pid: i32, storage: &Storage, just_started: bool) -> Result<usize> {
    let mut process = Process::open(pid)?;
    process.attach()?;

    let result = patch_attached(&mut process, storage, just_started);
    if let Err(e) = process.detach() {
        warn!("Failed to detach PID '{}', {:#}", pid, e);
    }

    result
}

fn patch_attached(process: &mut Process, storage: &Storage, just_started: bool) -> Result<usize> {
    if just_started {
        process.remote.run_to_entry()?;
        process.refresh_threads();
    }

    process.map_object_files()?;
    let matched = storage.lookup_patches(process)?;
    if matched == 0 {
        bail!(PatchError::NoMatch);
    }
    debug!("{} object(s) have a patch in storage", matched);

    process.find_coroutines()?;
    installer::apply_patches(process)
}

/// Releases an execve launcher waiting on the other end of the pipe: one
/// status byte, then the descriptor is closed.
fn notify_launcher(fd: RawFd, exit_code: i32) {
    let status = [if exit_code < 0 { 1u8 } else { 0u8 }];
    if let Err(e) = nix::unistd::write(fd, &status) {
        warn!("Cannot notify launcher on fd {}, {}", fd, e);
    }
    if let Err(e) = nix::unistd::close(fd) {
        warn!("Cannot close launcher fd {}, {}", fd, e);
    }
}
