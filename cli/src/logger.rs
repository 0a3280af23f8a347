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
use flexi_logger::{DeferredNow, LogSpecification, LoggerHandle, WriteMode};
use log::{LevelFilter, Record};
use once_cell::sync::OnceCell;

static LOG_HANDLE: OnceCell<LoggerHandle> = OnceCell::new();

pub struct Logger;

impl Logger {
    pub fn initialize(max_level: LevelFilter) -> Result<()> {
        LOG_HANDLE.get_or_try_init(|| -> Result<LoggerHandle> {
            let log_spec = LogSpecification::builder().default(max_level).build();
            let handle = flexi_logger::Logger::with(log_spec)
                .log_to_stdout()
                .format(Self::format_message)
                .write_mode(WriteMode::Direct)
                .start()?;

            Ok(handle)
        })?;

        Ok(())
    }

    pub fn is_inited() -> bool {
        LOG_HANDLE.get().is_some()
    }

    fn format_message(
        w: &mut dyn std::io::Write,
        _now: &mut DeferredNow,
        record: &Record,
    ) -> std::io::Result<()> {
        write!(w, "{}", record.args())
    }
}
