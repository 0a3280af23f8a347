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

use anyhow::Result;

use crate::process::maps::MapEntry;

mod ptrace;

pub use self::ptrace::PtraceTarget;

#[cfg(test)]
pub mod testing;

/// Register subset the engine cares about.
#[derive(Debug, Default, Clone, Copy)]
pub struct Registers {
    pub ip: u64,
    pub sp: u64,
    pub bp: u64,
}

/// One stopped thread of the target process.
#[derive(Debug, Clone)]
pub struct ThreadContext {
    pub tid: i32,
    /// Address this thread must pass before the next safety check.
    pub execute_until: Option<u64>,
}

/// Control of a victim process.
///
/// Every memory or register operation requires a prior successful
/// `attach`; `detach` leaves the process running again. The production
/// implementation sits on ptrace, tests use an in-memory stand-in.
pub trait RemoteProcess {
    fn pid(&self) -> i32;

    fn attach(&mut self) -> Result<()>;

    fn detach(&mut self) -> Result<()>;

    /// Currently known (stopped) thread ids.
    fn threads(&self) -> Vec<i32>;

    fn registers(&self, tid: i32) -> Result<Registers>;

    /// Memory mappings of the target, one entry per `maps` line.
    fn maps(&self) -> Result<Vec<MapEntry>>;

    fn read_mem(&self, addr: u64, buf: &mut [u8]) -> Result<()>;

    fn write_mem(&mut self, addr: u64, data: &[u8]) -> Result<()>;

    /// Write through read-only code mappings.
    fn write_code(&mut self, addr: u64, data: &[u8]) -> Result<()>;

    /// Map an anonymous rwx region of `size` bytes, preferably at `hint`.
    fn mmap_remote(&mut self, hint: u64, size: u64) -> Result<u64>;

    fn munmap_remote(&mut self, addr: u64, size: u64) -> Result<()>;

    /// Resume the listed threads until each one reaches its target address,
    /// then stop the whole process again. Threads spawned while waiting are
    /// picked up so that a following safety check sees them.
    fn execute_until(&mut self, targets: &[(i32, u64)], timeout: Duration) -> Result<()>;

    /// Run a freshly exec'ed target up to its ELF entry point so the
    /// dynamic loader has populated shared libraries.
    fn run_to_entry(&mut self) -> Result<()>;
}
