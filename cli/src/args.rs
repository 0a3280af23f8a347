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

use std::os::unix::io::RawFd;
use std::path::PathBuf;

use clap::{Parser, Subcommand};

const CLI_NAME: &str = env!("CARGO_PKG_NAME");

#[derive(Parser, Debug)]
#[clap(bin_name = CLI_NAME, version)]
pub struct Arguments {
    #[clap(subcommand)]
    pub command: Command,

    /// Provide more detailed info
    #[clap(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Apply patches from storage to target process(es)
    Patch {
        /// Target process id, or "all" for every process
        #[clap(short = 'p', long = "pid", value_parser = parse_target)]
        target: ProcessTarget,

        /// Target process was just started, run it up to its entry point first
        #[clap(short = 's', long = "start")]
        just_started: bool,

        /// File descriptor used to acknowledge an execve launcher
        #[clap(short = 'r', long = "ready-fd", value_name = "FD")]
        ready_fd: Option<RawFd>,

        /// Patch storage path (single blob file or storage directory)
        storage: PathBuf,
    },
    /// Cancel applied patches
    Unpatch {
        /// Target process id, or "all" for every process
        #[clap(short = 'p', long = "pid", value_parser = parse_target)]
        target: ProcessTarget,

        /// Build ids or object names to cancel; empty cancels everything
        identifiers: Vec<String>,
    },
    /// Show patched or patchable objects of target process(es)
    Info {
        /// Target process id, or "all" for every process
        #[clap(short = 'p', long = "pid", value_parser = parse_target)]
        target: ProcessTarget,

        /// Match objects by build id
        #[clap(
            short = 'b',
            long = "buildid",
            conflicts_with_all = &["regex", "storage"]
        )]
        build_id: Option<String>,

        /// Match objects by name regular expression
        #[clap(short = 'r', long = "regex")]
        regex: Option<String>,

        /// Match objects having a patch in storage
        #[clap(short = 's', long = "storage")]
        storage: Option<PathBuf>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessTarget {
    All,
    Pid(i32),
}

fn parse_target(value: &str) -> Result<ProcessTarget, String> {
    if value == "all" {
        return Ok(ProcessTarget::All);
    }
    value
        .parse::<i32>()
        .map(ProcessTarget::Pid)
        .map_err(|_| format!("\"{}\" is neither a process id nor \"all\"", value))
}

impl Arguments {
    pub fn new() -> Self {
        Arguments::parse()
    }
}
