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

use std::time::Duration;

use anyhow::{bail, Result};
use log::info;

use procpatch_abi::PatchInfo;

use crate::error::PatchError;
use crate::process::Process;
use crate::safety::{self, Direction, CORO_STACK_UNSAFE};

pub mod canceller;
pub mod installer;
pub mod module;

#[cfg(test)]
pub mod testing;

/// Time allowed for advancing threads out of patched ranges.
pub const ADVANCE_TIMEOUT: Duration = Duration::from_secs(3000);

pub fn round_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// Safety gate shared by install and cancel: verify every stack, advance
/// unsafe threads to their safe return points once, verify again.
/// Coroutines cannot be advanced, so a coroutine failure is terminal.
pub fn ensure_safety(process: &mut Process, infos: &[PatchInfo], dir: Direction) -> Result<()> {
    process.refresh_threads();

    let failed = safety::verify(
        &*process.remote,
        &mut process.threads,
        &process.coroutines,
        infos,
        dir,
        true,
    )?;
    if failed == 0 {
        return Ok(());
    }
    if failed & CORO_STACK_UNSAFE != 0 {
        bail!(PatchError::UnsafeStack { coroutine: true });
    }

    let targets: Vec<(i32, u64)> = process
        .threads
        .iter()
        .filter_map(|thread| thread.execute_until.map(|addr| (thread.tid, addr)))
        .collect();
    if targets.is_empty() {
        // Unsafe stacks without a safe return point cannot be advanced.
        bail!(PatchError::UnsafeStack { coroutine: false });
    }

    info!(
        "{} thread(s) inside patched range, advancing to safe points...",
        failed
    );
    process.remote.execute_until(&targets, ADVANCE_TIMEOUT)?;
    process.refresh_threads();
    for thread in process.threads.iter_mut() {
        thread.execute_until = None;
    }

    let failed = safety::verify(
        &*process.remote,
        &mut process.threads,
        &process.coroutines,
        infos,
        dir,
        false,
    )?;
    if failed != 0 {
        bail!(PatchError::UnsafeStack {
            coroutine: failed & CORO_STACK_UNSAFE != 0
        });
    }

    Ok(())
}
