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

//! Stack-safety verification: proves that no thread or coroutine has an
//! in-flight frame inside a range that is about to be rewritten.

use std::convert::TryInto;

use anyhow::Result;
use log::{debug, warn};

use procpatch_abi::PatchInfo;

use crate::process::coroutine::CoroutineContext;
use crate::remote::{Registers, RemoteProcess, ThreadContext};

/// Set in the failure count when a coroutine stack is unsafe; coroutines
/// cannot be advanced, so this is terminal for the object.
pub const CORO_STACK_UNSAFE: u32 = 1 << 31;

const MAX_FRAMES: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Apply,
    Unapply,
}

#[derive(Debug, Clone, Copy)]
pub struct Frame {
    pub ip: u64,
}

/// Frame source for one stack, innermost frame first.
pub trait UnwindCursor {
    fn next_frame(&mut self) -> Result<Option<Frame>>;
}

/// Frame-pointer chain unwinder over remote memory.
///
/// Reads `[rbp]` / `[rbp + 8]` pairs starting from the captured registers;
/// the walk stops on a null or non-increasing frame pointer, an unreadable
/// frame, or the depth cap.
pub struct RemoteCursor<'a> {
    remote: &'a dyn RemoteProcess,
    next_ip: Option<u64>,
    bp: u64,
    depth: usize,
}

impl<'a> RemoteCursor<'a> {
    pub fn new(remote: &'a dyn RemoteProcess, regs: Registers) -> Self {
        Self {
            remote,
            next_ip: Some(regs.ip),
            bp: regs.bp,
            depth: 0,
        }
    }
}

impl UnwindCursor for RemoteCursor<'_> {
    fn next_frame(&mut self) -> Result<Option<Frame>> {
        let ip = match self.next_ip.take() {
            Some(ip) => ip,
            None => return Ok(None),
        };

        self.depth += 1;
        if self.depth < MAX_FRAMES && self.bp != 0 {
            let mut frame = [0u8; 16];
            if self.remote.read_mem(self.bp, &mut frame).is_ok() {
                let saved_bp = u64::from_le_bytes(frame[..8].try_into().unwrap());
                let return_ip = u64::from_le_bytes(frame[8..].try_into().unwrap());
                if return_ip != 0 && (saved_bp > self.bp || saved_bp == 0) {
                    self.next_ip = Some(return_ip);
                    self.bp = saved_bp;
                }
            }
        }

        Ok(Some(Frame { ip }))
    }
}

fn in_hunk(ip: u64, infos: &[PatchInfo], dir: Direction) -> Option<u64> {
    for info in infos {
        if info.is_new_func() {
            continue;
        }
        let (start, len) = match dir {
            Direction::Apply => (info.daddr, info.dlen),
            Direction::Unapply => (info.saddr, info.slen),
        };
        if ip >= start && ip < start + len {
            return Some(start);
        }
    }
    None
}

#[derive(Debug, Clone, Copy)]
pub struct UnsafeFrame {
    /// Start of the most recently entered unsafe range.
    pub unsafe_addr: u64,
    /// First instruction pointer outside every hunk, the point the thread
    /// can be advanced to. Absent when the whole stack sits inside hunks.
    pub retip: Option<u64>,
}

/// Walks one stack and decides whether any frame intersects a hunk.
///
/// Returns `None` for a safe stack. In non-paranoid mode the walk stops at
/// the first frame that leaves an unsafe range; paranoid mode walks to
/// completion and reports the outermost unsafe hunk for diagnostics.
pub fn verify_one(
    cursor: &mut dyn UnwindCursor,
    infos: &[PatchInfo],
    dir: Direction,
    paranoid: bool,
) -> Result<Option<UnsafeFrame>> {
    let mut current_unsafe: Option<u64> = None;
    let mut outermost_unsafe: Option<u64> = None;
    let mut retip: Option<u64> = None;

    while let Some(frame) = cursor.next_frame()? {
        match in_hunk(frame.ip, infos, dir) {
            Some(addr) => {
                outermost_unsafe = Some(addr);
                current_unsafe = Some(addr);
            }
            None => {
                if let Some(addr) = current_unsafe {
                    if !paranoid {
                        return Ok(Some(UnsafeFrame {
                            unsafe_addr: addr,
                            retip: Some(frame.ip),
                        }));
                    }
                    if retip.is_none() {
                        retip = Some(frame.ip);
                    }
                }
                current_unsafe = None;
            }
        }
    }

    match (current_unsafe, outermost_unsafe) {
        // Walk ended inside a hunk: unsafe with no point to advance to.
        (Some(addr), _) => Ok(Some(UnsafeFrame {
            unsafe_addr: addr,
            retip: None,
        })),
        (None, Some(addr)) if paranoid => Ok(Some(UnsafeFrame {
            unsafe_addr: addr,
            retip,
        })),
        _ => Ok(None),
    }
}

/// Checks every coroutine and thread of the process.
///
/// Returns the number of unsafe stacks, with [`CORO_STACK_UNSAFE`] OR-ed in
/// when any coroutine failed. When `collect_retips` is set, each unsafe
/// thread gets its safe return point recorded as `execute_until`.
pub fn verify(
    remote: &dyn RemoteProcess,
    threads: &mut [ThreadContext],
    coroutines: &[CoroutineContext],
    infos: &[PatchInfo],
    dir: Direction,
    collect_retips: bool,
) -> Result<u32> {
    let mut failed: u32 = 0;

    for coroutine in coroutines {
        let mut cursor = RemoteCursor::new(remote, coroutine.regs);
        if let Some(found) = verify_one(&mut cursor, infos, dir, false)? {
            warn!(
                "Coroutine \"{}\" is inside hunk {:#x}",
                coroutine.name, found.unsafe_addr
            );
            failed = (failed + 1) | CORO_STACK_UNSAFE;
        }
    }

    for thread in threads.iter_mut() {
        let regs = remote.registers(thread.tid)?;
        let mut cursor = RemoteCursor::new(remote, regs);
        if let Some(found) = verify_one(&mut cursor, infos, dir, false)? {
            debug!(
                "Thread {} is inside hunk {:#x}, safe point {:?}",
                thread.tid, found.unsafe_addr, found.retip
            );
            if collect_retips {
                thread.execute_until = found.retip;
            }
            failed += 1;
        }
    }

    Ok(failed)
}
