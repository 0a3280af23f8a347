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

use anyhow::Result;
use log::debug;

use crate::process::ObjectFile;
use crate::remote::{Registers, RemoteProcess};

/// A user-space execution context whose saved instruction pointer is not
/// visible in the kernel thread list.
#[derive(Debug, Clone)]
pub struct CoroutineContext {
    pub name: String,
    pub regs: Registers,
}

/// Recognizer for one coroutine runtime.
///
/// An implementation inspects the mapped objects for a runtime it knows
/// (scheduler symbols, context pools) and extracts the saved register state
/// of every parked coroutine.
pub trait CoroutineFinder {
    fn runtime(&self) -> &str;

    fn find(
        &self,
        remote: &dyn RemoteProcess,
        objects: &[ObjectFile],
    ) -> Result<Vec<CoroutineContext>>;
}

pub fn discover(
    remote: &dyn RemoteProcess,
    objects: &[ObjectFile],
    finders: &[Box<dyn CoroutineFinder>],
) -> Result<Vec<CoroutineContext>> {
    let mut coroutines = Vec::new();

    for finder in finders {
        let found = finder.find(remote, objects)?;
        if !found.is_empty() {
            debug!(
                "Found {} coroutine(s) of runtime \"{}\"",
                found.len(),
                finder.runtime()
            );
        }
        coroutines.extend(found);
    }

    Ok(coroutines)
}
