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

use anyhow::{ensure, Result};
use log::error;

use procpatch_common::os;

use crate::args::{Command, ProcessTarget};

mod info;
mod patch;
mod unpatch;

pub use info::InfoCommandExecutor;
pub use patch::PatchCommandExecutor;
pub use unpatch::UnpatchCommandExecutor;

/// Return value a per-PID callback uses to stop the fan-out early.
pub const CALLBACK_STOP: i32 = -2;

pub trait CommandExecutor {
    /// Handles the command if it is this executor's; `None` passes it on.
    fn invoke(&self, command: &Command) -> Result<Option<i32>>;
}

pub(crate) fn check_root_permission() -> Result<()> {
    const ROOT_UID: u32 = 0;

    ensure!(
        os::user::id() == ROOT_UID,
        "This command has to be run with superuser privileges (under the root user on most systems)."
    );

    Ok(())
}

/// Runs `callback` for the selected target. With "all", every numeric
/// `/proc` entry except init and the tool itself is visited; a callback
/// returning [`CALLBACK_STOP`] ends the enumeration, any other negative
/// value records a whole-run failure without stopping it.
pub(crate) fn for_each_target<F>(target: &ProcessTarget, mut callback: F) -> i32
where
    F: FnMut(i32) -> i32,
{
    match target {
        ProcessTarget::Pid(pid) => {
            if callback(*pid) < 0 {
                -1
            } else {
                0
            }
        }
        ProcessTarget::All => {
            let pids = match os::proc::list_process_ids() {
                Ok(pids) => pids,
                Err(e) => {
                    error!("Cannot enumerate processes, {}", e);
                    return -1;
                }
            };
            let self_pid = os::proc::id();

            let mut failed = false;
            for pid in pids {
                if pid == 1 || pid == self_pid {
                    continue;
                }
                match callback(pid) {
                    CALLBACK_STOP => break,
                    ret if ret < 0 => failed = true,
                    _ => {}
                }
            }
            if failed {
                -1
            } else {
                0
            }
        }
    }
}
