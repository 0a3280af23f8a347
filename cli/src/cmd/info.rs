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

use anyhow::{Context, Result};
use log::{error, info, warn};
use regex::Regex;

use crate::args::Command;
use crate::cmd::CommandExecutor;
use crate::process::{ObjectFile, Process};
use crate::storage::{FindResult, Storage};

pub struct InfoCommandExecutor;

impl CommandExecutor for InfoCommandExecutor {
    fn invoke(&self, command: &Command) -> Result<Option<i32>> {
        let (target, build_id, regex, storage_path) = match command {
            Command::Info {
                target,
                build_id,
                regex,
                storage,
            } => (target, build_id, regex, storage),
            _ => return Ok(None),
        };

        let filter = ObjectFilter {
            build_id: build_id.clone(),
            name_regex: regex
                .as_ref()
                .map(|pattern| Regex::new(pattern))
                .transpose()
                .context("Invalid object name pattern")?,
            storage: storage_path.as_ref().map(Storage::open).transpose()?,
        };

        let exit_code = super::for_each_target(target, |pid| {
            match show_process(pid, &filter) {
                Ok(_) => 0,
                Err(e) => {
                    error!("Failed to inspect PID '{}', {:#}", pid, e);
                    -1
                }
            }
        });

        Ok(Some(exit_code))
    }
}

struct ObjectFilter {
    build_id: Option<String>,
    name_regex: Option<Regex>,
    storage: Option<Storage>,
}

impl ObjectFilter {
    fn matches(&self, object: &ObjectFile) -> Result<bool> {
        if let Some(build_id) = &self.build_id {
            return Ok(object.build_id.as_deref() == Some(build_id.as_str()));
        }
        if let Some(regex) = &self.name_regex {
            return Ok(regex.is_match(&object.name));
        }
        if let Some(storage) = &self.storage {
            let build_id = match &object.build_id {
                Some(build_id) => build_id,
                None => return Ok(false),
            };
            return Ok(!matches!(
                storage.find(build_id, false)?,
                FindResult::NotFound
            ));
        }
        Ok(true)
    }
}

fn show_process(pid: i32, filter: &ObjectFilter) -> Result<()> {
    let mut process = Process::open(pid)?;
    process.attach()?;

    let result = show_attached(&mut process, filter);
    if let Err(e) = process.detach() {
        warn!("Failed to detach PID '{}', {:#}", pid, e);
    }

    result
}

fn show_attached(process: &mut Process, filter: &ObjectFilter) -> Result<()> {
    process.map_object_files()?;

    let mut header_printed = false;
    for object in &process.objects {
        if object.is_patch || !object.is_elf {
            continue;
        }
        if !filter.matches(object)? {
            continue;
        }
        if !header_printed {
            info!("pid={} comm={}", process.pid, process.comm);
            header_printed = true;
        }
        info!(
            "{} {}",
            object.name,
            object.build_id.as_deref().unwrap_or("-")
        );
    }

    Ok(())
}
