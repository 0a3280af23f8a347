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

use std::process::exit;

use anyhow::Result;
use log::{debug, error, LevelFilter};

mod args;
mod cmd;
mod error;
mod logger;
mod patch;
mod process;
mod remote;
mod safety;
mod storage;

use args::Arguments;
use cmd::{CommandExecutor, InfoCommandExecutor, PatchCommandExecutor, UnpatchCommandExecutor};
use logger::Logger;

struct ProcpatchCli {
    args: Arguments,
}

impl ProcpatchCli {
    fn start_and_run() -> Result<i32> {
        let instance = Self {
            args: Arguments::new(),
        };
        Logger::initialize(match instance.args.verbose {
            true => LevelFilter::Debug,
            false => LevelFilter::Info,
        })?;
        debug!("Start with {:#?}", instance.args);

        let executors = vec![
            Box::new(PatchCommandExecutor) as Box<dyn CommandExecutor>,
            Box::new(UnpatchCommandExecutor) as Box<dyn CommandExecutor>,
            Box::new(InfoCommandExecutor) as Box<dyn CommandExecutor>,
        ];

        let command = instance.args.command;
        for executor in &executors {
            if let Some(exit_code) = executor.invoke(&command)? {
                debug!("Done, exit code {}", exit_code);
                return Ok(exit_code);
            }
        }

        Ok(0)
    }
}

fn main() {
    let exit_code = match ProcpatchCli::start_and_run() {
        Ok(code) => code,
        Err(e) => {
            match Logger::is_inited() {
                false => eprintln!("Error: {:?}", e),
                true => error!("Error: {:?}", e),
            }
            -1
        }
    };
    exit(exit_code);
}
