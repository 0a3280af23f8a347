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

//! In-memory stand-in for a victim process, used by the engine tests.
//! Clones share state, so a test can keep a handle for assertions while
//! the process view owns the boxed trait object.

use std::cell::RefCell;
use std::collections::HashMap;
use std::path::PathBuf;
use std::rc::Rc;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::process::maps::MapEntry;
use crate::remote::{Registers, RemoteProcess};

#[derive(Default)]
struct FakeState {
    attached: bool,
    mem: HashMap<u64, u8>,
    thread_ids: Vec<i32>,
    regs: HashMap<i32, Registers>,
    map_entries: Vec<MapEntry>,
    mapped: Vec<(u64, u64)>,
    unmapped: Vec<(u64, u64)>,
    advanced: Vec<(i32, u64)>,
    entry_runs: u32,
    force_mmap_at: Option<u64>,
}

#[derive(Clone)]
pub struct FakeRemote {
    pid: i32,
    state: Rc<RefCell<FakeState>>,
}

impl FakeRemote {
    pub fn new(pid: i32) -> Self {
        Self {
            pid,
            state: Rc::new(RefCell::new(FakeState::default())),
        }
    }

    pub fn add_thread(&self, tid: i32, regs: Registers) {
        let mut state = self.state.borrow_mut();
        state.thread_ids.push(tid);
        state.regs.insert(tid, regs);
    }

    pub fn set_regs(&self, tid: i32, regs: Registers) {
        self.state.borrow_mut().regs.insert(tid, regs);
    }

    pub fn add_map(&self, start: u64, end: u64, executable: bool, path: Option<&str>) {
        self.state.borrow_mut().map_entries.push(MapEntry {
            start,
            end,
            readable: true,
            writable: !executable,
            executable,
            offset: 0,
            inode: if path.is_some() { 1 } else { 0 },
            path: path.map(PathBuf::from),
        });
    }

    /// Simulates a kernel that ignores the allocation hint.
    pub fn set_force_mmap_at(&self, addr: u64) {
        self.state.borrow_mut().force_mmap_at = Some(addr);
    }

    pub fn write_bytes(&self, addr: u64, data: &[u8]) {
        let mut state = self.state.borrow_mut();
        for (i, byte) in data.iter().enumerate() {
            state.mem.insert(addr + i as u64, *byte);
        }
    }

    pub fn read_bytes(&self, addr: u64, len: usize) -> Vec<u8> {
        let state = self.state.borrow();
        (0..len)
            .map(|i| state.mem.get(&(addr + i as u64)).copied().unwrap_or(0))
            .collect()
    }

    pub fn mapped(&self) -> Vec<(u64, u64)> {
        self.state.borrow().mapped.clone()
    }

    pub fn unmapped(&self) -> Vec<(u64, u64)> {
        self.state.borrow().unmapped.clone()
    }

    pub fn advanced(&self) -> Vec<(i32, u64)> {
        self.state.borrow().advanced.clone()
    }

    pub fn entry_runs(&self) -> u32 {
        self.state.borrow().entry_runs
    }
}

impl RemoteProcess for FakeRemote {
    fn pid(&self) -> i32 {
        self.pid
    }

    fn attach(&mut self) -> Result<()> {
        self.state.borrow_mut().attached = true;
        Ok(())
    }

    fn detach(&mut self) -> Result<()> {
        self.state.borrow_mut().attached = false;
        Ok(())
    }

    fn threads(&self) -> Vec<i32> {
        self.state.borrow().thread_ids.clone()
    }

    fn registers(&self, tid: i32) -> Result<Registers> {
        self.state
            .borrow()
            .regs
            .get(&tid)
            .copied()
            .with_context(|| format!("unknown thread {}", tid))
    }

    fn maps(&self) -> Result<Vec<MapEntry>> {
        Ok(self.state.borrow().map_entries.clone())
    }

    fn read_mem(&self, addr: u64, buf: &mut [u8]) -> Result<()> {
        let state = self.state.borrow();
        for (i, byte) in buf.iter_mut().enumerate() {
            *byte = state.mem.get(&(addr + i as u64)).copied().unwrap_or(0);
        }
        Ok(())
    }

    fn write_mem(&mut self, addr: u64, data: &[u8]) -> Result<()> {
        self.write_bytes(addr, data);
        Ok(())
    }

    fn write_code(&mut self, addr: u64, data: &[u8]) -> Result<()> {
        self.write_bytes(addr, data);
        Ok(())
    }

    fn mmap_remote(&mut self, hint: u64, size: u64) -> Result<u64> {
        let mut state = self.state.borrow_mut();
        let addr = state.force_mmap_at.unwrap_or(if hint != 0 {
            hint
        } else {
            0x7f00_0000_0000
        });
        state.mapped.push((addr, size));
        Ok(addr)
    }

    fn munmap_remote(&mut self, addr: u64, size: u64) -> Result<()> {
        self.state.borrow_mut().unmapped.push((addr, size));
        Ok(())
    }

    fn execute_until(&mut self, targets: &[(i32, u64)], _timeout: Duration) -> Result<()> {
        let mut state = self.state.borrow_mut();
        for (tid, addr) in targets {
            if let Some(regs) = state.regs.get_mut(tid) {
                regs.ip = *addr;
                regs.bp = 0;
            }
            state.advanced.push((*tid, *addr));
        }
        Ok(())
    }

    fn run_to_entry(&mut self) -> Result<()> {
        self.state.borrow_mut().entry_runs += 1;
        Ok(())
    }
}
