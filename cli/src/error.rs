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

use std::fmt;

/// Failure kinds the orchestrator maps to exit codes.
///
/// Engine code wraps these into `anyhow::Error`; the command layer recovers
/// the kind with `downcast_ref` where the exit behavior depends on it.
#[derive(Debug)]
pub enum PatchError {
    StorageUnavailable(String),
    InvalidPatch(String),
    AttachFailed(String),
    RemoteIo(String),
    UnsafeStack { coroutine: bool },
    LayoutUnreachable,
    RelocationFailed(String),
    PartialApply { applied: usize },
    NoMatch,
}

impl fmt::Display for PatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StorageUnavailable(msg) => write!(f, "Storage is unavailable, {}", msg),
            Self::InvalidPatch(msg) => write!(f, "Invalid patch, {}", msg),
            Self::AttachFailed(msg) => write!(f, "Cannot attach to process, {}", msg),
            Self::RemoteIo(msg) => write!(f, "Remote operation failed, {}", msg),
            Self::UnsafeStack { coroutine: false } => {
                write!(f, "Thread stack check failed")
            }
            Self::UnsafeStack { coroutine: true } => {
                write!(f, "Coroutine stack check failed")
            }
            Self::LayoutUnreachable => {
                write!(f, "Cannot place patch within 32-bit jump reach of the target")
            }
            Self::RelocationFailed(msg) => write!(f, "Relocation failed, {}", msg),
            Self::PartialApply { applied } => {
                write!(f, "Patch partially applied, {} hunk(s) left in place", applied)
            }
            Self::NoMatch => write!(f, "No applicable patch"),
        }
    }
}

impl std::error::Error for PatchError {}
