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

use std::collections::HashMap;
use std::convert::TryInto;
use std::io::{IoSlice, IoSliceMut};
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, ensure, Context, Result};
use libc::{c_long, c_void};
use log::{debug, warn};
use nix::errno::Errno;
use nix::sys::ptrace;
use nix::sys::signal::Signal;
use nix::sys::uio::{process_vm_readv, process_vm_writev, RemoteIoVec};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;

use procpatch_common::{fs, os};

use crate::error::PatchError;
use crate::process::maps::{self, MapEntry};
use crate::remote::{Registers, RemoteProcess};

const INT3: u8 = 0xcc;
const SYSCALL_INSN: [u8; 2] = [0x0f, 0x05];
const WORD_LEN: u64 = std::mem::size_of::<c_long>() as u64;
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Ptrace-backed control of a victim process.
pub struct PtraceTarget {
    pid: i32,
    threads: Vec<i32>,
    attached: bool,
}

impl PtraceTarget {
    pub fn new(pid: i32) -> Self {
        Self {
            pid,
            threads: Vec::new(),
            attached: false,
        }
    }

    /// Attaches every thread listed under `/proc/<pid>/task`, repeating the
    /// scan until no new thread shows up (threads may be spawned while the
    /// first ones are being stopped).
    fn seize_all_threads(&mut self) -> Result<()> {
        loop {
            let tids = os::proc::list_thread_ids(self.pid)
                .map_err(|e| PatchError::AttachFailed(e.to_string()))?;

            let mut new_threads = 0;
            for tid in tids {
                if self.threads.contains(&tid) {
                    continue;
                }
                match ptrace::attach(Pid::from_raw(tid)) {
                    Ok(_) => {
                        waitpid(Pid::from_raw(tid), Some(WaitPidFlag::__WALL))
                            .map_err(|e| PatchError::AttachFailed(e.to_string()))?;
                        self.threads.push(tid);
                        new_threads += 1;
                    }
                    // Thread exited between the scan and the attach.
                    Err(Errno::ESRCH) => continue,
                    Err(e) => {
                        return Err(PatchError::AttachFailed(format!(
                            "thread {}, {}",
                            tid, e
                        ))
                        .into())
                    }
                }
            }
            if new_threads == 0 {
                return Ok(());
            }
        }
    }

    fn word_at(&self, addr: u64) -> Result<[u8; 8]> {
        let word = ptrace::read(Pid::from_raw(self.pid), addr as *mut c_void)
            .map_err(|e| PatchError::RemoteIo(format!("peek {:#x}, {}", addr, e)))?;
        Ok((word as u64).to_ne_bytes())
    }

    fn set_word_at(&self, addr: u64, word: [u8; 8]) -> Result<()> {
        let value = u64::from_ne_bytes(word) as *mut c_void;
        unsafe {
            ptrace::write(Pid::from_raw(self.pid), addr as *mut c_void, value)
                .map_err(|e| PatchError::RemoteIo(format!("poke {:#x}, {}", addr, e)))?;
        }
        Ok(())
    }

    fn get_regs(tid: i32) -> Result<libc::user_regs_struct> {
        ptrace::getregs(Pid::from_raw(tid))
            .map_err(|e| anyhow!(PatchError::RemoteIo(format!("getregs {}, {}", tid, e))))
    }

    fn set_regs(tid: i32, regs: libc::user_regs_struct) -> Result<()> {
        ptrace::setregs(Pid::from_raw(tid), regs)
            .map_err(|e| anyhow!(PatchError::RemoteIo(format!("setregs {}, {}", tid, e))))
    }

    /// Executes one syscall on the main thread by overwriting the bytes at
    /// the stop location with a `syscall` instruction, single-stepping, and
    /// restoring the previous register/byte state.
    fn inject_syscall(&mut self, nr: c_long, args: [u64; 6]) -> Result<u64> {
        ensure!(self.attached, "Process {} is not attached", self.pid);
        let tid = self.pid;

        let saved_regs = Self::get_regs(tid)?;
        let ip = saved_regs.rip;
        let mut saved_code = [0u8; SYSCALL_INSN.len()];
        self.read_mem(ip, &mut saved_code)?;
        self.write_code(ip, &SYSCALL_INSN)?;

        let mut regs = saved_regs;
        regs.rax = nr as u64;
        regs.orig_rax = nr as u64;
        regs.rdi = args[0];
        regs.rsi = args[1];
        regs.rdx = args[2];
        regs.r10 = args[3];
        regs.r8 = args[4];
        regs.r9 = args[5];
        Self::set_regs(tid, regs)?;

        ptrace::step(Pid::from_raw(tid), None)
            .map_err(|e| PatchError::RemoteIo(format!("step {}, {}", tid, e)))?;
        let status = waitpid(Pid::from_raw(tid), Some(WaitPidFlag::__WALL))
            .map_err(|e| PatchError::RemoteIo(format!("wait {}, {}", tid, e)))?;

        let result_regs = Self::get_regs(tid)?;
        self.write_code(ip, &saved_code)?;
        Self::set_regs(tid, saved_regs)?;

        match status {
            WaitStatus::Stopped(_, Signal::SIGTRAP) => {}
            other => bail!(PatchError::RemoteIo(format!(
                "unexpected stop during syscall injection: {:?}",
                other
            ))),
        }

        let ret = result_regs.rax as i64;
        if (-4095..0).contains(&ret) {
            bail!(PatchError::RemoteIo(format!(
                "remote syscall {} failed, {}",
                nr,
                Errno::from_i32(-ret as i32)
            )));
        }
        Ok(ret as u64)
    }

    /// Steps `tid` over a breakpoint it has just hit: the original byte is
    /// put back, the thread single-stepped, and the breakpoint re-armed.
    fn step_over_breakpoint(&mut self, tid: i32, addr: u64, original: u8) -> Result<()> {
        self.write_code(addr, &[original])?;
        ptrace::step(Pid::from_raw(tid), None)
            .map_err(|e| PatchError::RemoteIo(format!("step {}, {}", tid, e)))?;
        waitpid(Pid::from_raw(tid), Some(WaitPidFlag::__WALL))
            .map_err(|e| PatchError::RemoteIo(format!("wait {}, {}", tid, e)))?;
        self.write_code(addr, &[INT3])
    }

    /// Stops every thread believed to be running and consumes the stop
    /// notifications. Dead threads are dropped from the thread list.
    fn stop_running_threads(&mut self, running: &mut Vec<i32>) {
        for tid in running.drain(..) {
            if nix::sys::signal::kill(Pid::from_raw(tid), Signal::SIGSTOP).is_err() {
                self.threads.retain(|t| *t != tid);
                continue;
            }
            loop {
                match waitpid(Pid::from_raw(tid), Some(WaitPidFlag::__WALL)) {
                    Ok(WaitStatus::Stopped(_, Signal::SIGSTOP)) => break,
                    Ok(WaitStatus::Stopped(_, _)) => break,
                    Ok(WaitStatus::Exited(_, _)) | Ok(WaitStatus::Signaled(_, _, _)) | Err(_) => {
                        self.threads.retain(|t| *t != tid);
                        break;
                    }
                    Ok(_) => continue,
                }
            }
        }
    }
}

impl RemoteProcess for PtraceTarget {
    fn pid(&self) -> i32 {
        self.pid
    }

    fn attach(&mut self) -> Result<()> {
        ensure!(!self.attached, "Process {} is already attached", self.pid);

        debug!("Attaching to process {}...", self.pid);
        self.seize_all_threads()?;
        self.attached = true;
        debug!("Attached {} thread(s)", self.threads.len());

        Ok(())
    }

    fn detach(&mut self) -> Result<()> {
        if !self.attached {
            return Ok(());
        }

        debug!("Detaching from process {}...", self.pid);
        for tid in self.threads.drain(..) {
            match ptrace::detach(Pid::from_raw(tid), None) {
                Ok(_) | Err(Errno::ESRCH) => {}
                Err(e) => warn!("Failed to detach thread {}, {}", tid, e),
            }
        }
        self.attached = false;

        Ok(())
    }

    fn threads(&self) -> Vec<i32> {
        self.threads.clone()
    }

    fn registers(&self, tid: i32) -> Result<Registers> {
        let regs = Self::get_regs(tid)?;

        Ok(Registers {
            ip: regs.rip,
            sp: regs.rsp,
            bp: regs.rbp,
        })
    }

    fn maps(&self) -> Result<Vec<MapEntry>> {
        let contents = fs::read_to_string(format!("/proc/{}/maps", self.pid))
            .map_err(|e| PatchError::RemoteIo(e.to_string()))?;

        Ok(maps::parse(&contents))
    }

    fn read_mem(&self, addr: u64, buf: &mut [u8]) -> Result<()> {
        let len = buf.len();
        let read = process_vm_readv(
            Pid::from_raw(self.pid),
            &mut [IoSliceMut::new(buf)],
            &[RemoteIoVec {
                base: addr as usize,
                len,
            }],
        )
        .map_err(|e| PatchError::RemoteIo(format!("read {:#x}+{}, {}", addr, len, e)))?;
        ensure!(
            read == len,
            PatchError::RemoteIo(format!("short read at {:#x}: {}/{}", addr, read, len))
        );

        Ok(())
    }

    fn write_mem(&mut self, addr: u64, data: &[u8]) -> Result<()> {
        let len = data.len();
        let written = process_vm_writev(
            Pid::from_raw(self.pid),
            &[IoSlice::new(data)],
            &[RemoteIoVec {
                base: addr as usize,
                len,
            }],
        )
        .map_err(|e| PatchError::RemoteIo(format!("write {:#x}+{}, {}", addr, len, e)))?;
        ensure!(
            written == len,
            PatchError::RemoteIo(format!("short write at {:#x}: {}/{}", addr, written, len))
        );

        Ok(())
    }

    fn write_code(&mut self, addr: u64, data: &[u8]) -> Result<()> {
        // process_vm_writev honors page protections; code pages are written
        // word-wise through ptrace, which copies on write.
        let start = addr & !(WORD_LEN - 1);
        let end = (addr + data.len() as u64 + WORD_LEN - 1) & !(WORD_LEN - 1);

        let mut word_addr = start;
        while word_addr < end {
            let mut word = self.word_at(word_addr)?;
            for byte in 0..WORD_LEN {
                let target = word_addr + byte;
                if target >= addr && target < addr + data.len() as u64 {
                    word[byte as usize] = data[(target - addr) as usize];
                }
            }
            self.set_word_at(word_addr, word)?;
            word_addr += WORD_LEN;
        }

        Ok(())
    }

    fn mmap_remote(&mut self, hint: u64, size: u64) -> Result<u64> {
        let mut flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;
        if hint != 0 {
            flags |= libc::MAP_FIXED_NOREPLACE;
        }

        let addr = self.inject_syscall(
            libc::SYS_mmap,
            [
                hint,
                size,
                (libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC) as u64,
                flags as u64,
                u64::MAX, // fd
                0,        // offset
            ],
        )?;
        debug!("Mapped {:#x}+{:#x} in process {}", addr, size, self.pid);

        Ok(addr)
    }

    fn munmap_remote(&mut self, addr: u64, size: u64) -> Result<()> {
        self.inject_syscall(libc::SYS_munmap, [addr, size, 0, 0, 0, 0])?;
        debug!("Unmapped {:#x}+{:#x} in process {}", addr, size, self.pid);

        Ok(())
    }

    fn execute_until(&mut self, targets: &[(i32, u64)], timeout: Duration) -> Result<()> {
        if targets.is_empty() {
            return Ok(());
        }

        // Arm one breakpoint per distinct address.
        let mut breakpoints: HashMap<u64, u8> = HashMap::new();
        for (_, addr) in targets {
            if breakpoints.contains_key(addr) {
                continue;
            }
            let mut original = [0u8; 1];
            self.read_mem(*addr, &mut original)?;
            self.write_code(*addr, &[INT3])?;
            breakpoints.insert(*addr, original[0]);
        }

        let mut pending: HashMap<i32, u64> = targets.iter().copied().collect();
        let mut running: Vec<i32> = Vec::new();
        for tid in self.threads.clone() {
            ptrace::cont(Pid::from_raw(tid), None)
                .map_err(|e| PatchError::RemoteIo(format!("cont {}, {}", tid, e)))?;
            running.push(tid);
        }

        let deadline = Instant::now() + timeout;
        let result = loop {
            if pending.is_empty() {
                break Ok(());
            }
            if Instant::now() >= deadline {
                break Err(anyhow!(PatchError::UnsafeStack { coroutine: false })
                    .context("Timed out waiting for threads to reach safe points"));
            }

            let status = match waitpid(
                Pid::from_raw(-1),
                Some(WaitPidFlag::WNOHANG | WaitPidFlag::__WALL),
            ) {
                Ok(WaitStatus::StillAlive) | Err(Errno::ECHILD) => {
                    std::thread::sleep(WAIT_POLL_INTERVAL);
                    continue;
                }
                Ok(status) => status,
                Err(e) => break Err(anyhow!(PatchError::RemoteIo(format!("wait, {}", e)))),
            };

            match status {
                WaitStatus::Stopped(tid, Signal::SIGTRAP) => {
                    let tid = tid.as_raw();
                    let mut regs = match Self::get_regs(tid) {
                        Ok(regs) => regs,
                        Err(e) => break Err(e),
                    };
                    let bp_addr = regs.rip.wrapping_sub(1);
                    match breakpoints.get(&bp_addr).copied() {
                        Some(original) => {
                            regs.rip = bp_addr;
                            if let Err(e) = Self::set_regs(tid, regs) {
                                break Err(e);
                            }
                            if pending.get(&tid) == Some(&bp_addr) {
                                // This thread reached its own safe point,
                                // leave it stopped.
                                pending.remove(&tid);
                                running.retain(|t| *t != tid);
                            } else if let Err(e) =
                                self.step_over_breakpoint(tid, bp_addr, original).and_then(
                                    |_| {
                                        ptrace::cont(Pid::from_raw(tid), None).map_err(|e| {
                                            anyhow!(PatchError::RemoteIo(format!(
                                                "cont {}, {}",
                                                tid, e
                                            )))
                                        })
                                    },
                                )
                            {
                                break Err(e);
                            }
                        }
                        None => {
                            // Trap that is not ours, forward it.
                            if let Err(e) = ptrace::cont(Pid::from_raw(tid), Signal::SIGTRAP) {
                                break Err(anyhow!(PatchError::RemoteIo(format!(
                                    "cont {}, {}",
                                    tid, e
                                ))));
                            }
                        }
                    }
                }
                WaitStatus::Stopped(tid, signal) => {
                    let _ = ptrace::cont(tid, signal);
                }
                WaitStatus::Exited(tid, _) | WaitStatus::Signaled(tid, _, _) => {
                    let tid = tid.as_raw();
                    pending.remove(&tid);
                    running.retain(|t| *t != tid);
                    self.threads.retain(|t| *t != tid);
                }
                _ => {}
            }
        };

        self.stop_running_threads(&mut running);
        for (addr, original) in &breakpoints {
            if let Err(e) = self.write_code(*addr, &[*original]) {
                warn!("Failed to disarm breakpoint at {:#x}, {}", addr, e);
            }
        }

        // New threads may have been spawned while the process was running;
        // the next safety check has to see them.
        self.seize_all_threads()?;

        result
    }

    fn run_to_entry(&mut self) -> Result<()> {
        ensure!(self.attached, "Process {} is not attached", self.pid);

        let auxv = fs::read(format!("/proc/{}/auxv", self.pid))
            .map_err(|e| PatchError::RemoteIo(e.to_string()))?;
        let entry = auxv
            .chunks_exact(16)
            .map(|pair| {
                (
                    u64::from_ne_bytes(pair[..8].try_into().unwrap()),
                    u64::from_ne_bytes(pair[8..].try_into().unwrap()),
                )
            })
            .find(|(key, _)| *key == libc::AT_ENTRY as u64)
            .map(|(_, value)| value)
            .context("Cannot find entry point in auxiliary vector")?;

        debug!("Running process {} up to entry {:#x}...", self.pid, entry);
        let tid = self.pid;
        self.execute_until(&[(tid, entry)], Duration::from_secs(30))
    }
}

impl Drop for PtraceTarget {
    fn drop(&mut self) {
        if self.attached {
            if let Err(e) = self.detach() {
                warn!("Failed to detach process {}, {}", self.pid, e);
            }
        }
    }
}
