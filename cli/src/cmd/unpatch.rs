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

use anyhow::{bail, Context, Result};
use log::{error, info, warn};

use procpatch_common::os;

use crate::args::Command;
use crate::cmd::CommandExecutor;
use crate::error::PatchError;
use crate::patch::canceller;
use crate::process::Process;

pub struct UnpatchCommandExecutor;

impl CommandExecutor for UnpatchCommandExecutor {
    fn invoke(&self, command: &Command) -> Result<Option<i32>> {
        let (target, identifiers) = match command {
            Command::Unpatch {
                target,
                identifiers,
            } => (target, identifiers),
            _ => return Ok(None),
        };

        super::check_root_permission()?;
        os::signal::block(&[os::signal::SIGINT, os::signal::SIGTERM])
            .context("Failed to block termination signals")?;

        let exit_code =
            super::for_each_target(target, |pid| unpatch_one_process(pid, identifiers));

        Ok(Some(exit_code))
    }
}

fn unpatch_one_process(pid: i32, identifiers: &[String]) -> i32 {
    match unpatch_process(pid, identifiers) {
        Ok(count) => {
            info!(
                "{} patch hunk(s) were successfully cancelled from PID '{}'",
                count, pid
            );
            count as i32
        }
        Err(e) if matches!(e.downcast_ref::<PatchError>(), Some(PatchError::NoMatch)) => {
            info!("No patch(es) applied to PID '{}'", pid);
            0
        }
        Err(e) => {
            error!("Failed to unpatch PID '{}', {:#}", pid, e);
            -1
        }
    }
}

fn unpatch_process(pid: i32, identifiers: &[String]) -> Result<usize> {
    let mut process = Process::open(pid)?;
    process.attach()?;

    let result = unpatch_attached(&mut process, identifiers);
    if let Err(e) = process.detach() {
        warn!("Failed to detach PID '{}', {:#}", pid, e);
    }

    result
}

fn unpatch_attached(process: &mut Process, identifiers: &[String]) -> Result<usize> {
    process.map_object_files()?;
    if !process
        .objects
        .iter()
        .any(|object| object.applied_patch.is_some())
    {
        bail!(PatchError::NoMatch);
    }

    process.find_coroutines()?;
    canceller::cancel_patches(process, identifiers)
}
