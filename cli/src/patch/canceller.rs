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

use anyhow::{ensure, Result};
use log::{debug, info, warn};

use procpatch_abi::{HeaderRead, PatchInfo, KPATCH_HEADER_LEN, NEAR_JMP_LEN, PATCH_INFO_LEN};

use crate::error::PatchError;
use crate::patch::ensure_safety;
use crate::process::{ObjectFile, Process};
use crate::safety::Direction;

/// Upper bound on hunk records recovered from remote memory; a corrupted
/// or hostile blob must not drive unbounded allocation.
const MAX_PATCH_INFO: usize = 16384;

/// Cancels the installed patches selected by `identifiers` (Build-IDs or
/// object names; an empty list selects every patched object). Returns the
/// number of hunks restored.
pub fn cancel_patches(process: &mut Process, identifiers: &[String]) -> Result<usize> {
    let mut total = 0;

    for idx in 0..process.objects.len() {
        let object = &process.objects[idx];
        if object.is_patch || object.applied_patch.is_none() {
            continue;
        }
        if !identifiers.is_empty() && !matches_identifier(object, identifiers) {
            continue;
        }

        info!("Cancelling patch of object \"{}\"", object.name);
        total += cancel_object(process, idx, false)?;
    }

    Ok(total)
}

fn matches_identifier(object: &ObjectFile, identifiers: &[String]) -> bool {
    identifiers.iter().any(|identifier| {
        object.name == *identifier || object.build_id.as_deref() == Some(identifier.as_str())
    })
}

/// Cancels the patch installed on one target object.
///
/// With `check_flag` set, only hunks marked applied in this run are
/// restored (the partial-rollback path); otherwise every hunk recorded in
/// the blob is restored.
pub fn cancel_object(process: &mut Process, target_idx: usize, check_flag: bool) -> Result<usize> {
    let kpta = process.objects[target_idx].kpta;
    ensure!(
        kpta != 0,
        "Object \"{}\" has no installed patch",
        process.objects[target_idx].name
    );
    let region_size = process.objects[target_idx].kpta_size;

    // Header fields come from the local duplicate when this run installed
    // the patch, from remote memory otherwise.
    let (user_info, user_undo) = match &process.objects[target_idx].kpfile {
        Some(kpfile) => (kpfile.user_info(), kpfile.user_undo()),
        None => {
            let mut header = vec![0u8; KPATCH_HEADER_LEN];
            process.remote.read_mem(kpta, &mut header)?;
            (header.user_info(), header.user_undo())
        }
    };

    if process.objects[target_idx].info.is_empty() {
        let recovered = recover_info(process, kpta + user_info)?;
        process.objects[target_idx].info = recovered;
    }

    let infos = process.objects[target_idx].info.clone();
    ensure_safety(process, &infos, Direction::Unapply)?;

    let mut restored = 0;
    for (i, info) in infos.iter().enumerate() {
        if info.is_new_func() {
            continue;
        }
        if check_flag && !info.is_applied() {
            debug!("Hunk {:#x} was never applied, skipping", info.daddr);
            continue;
        }

        let mut original = [0u8; NEAR_JMP_LEN];
        process
            .remote
            .read_mem(kpta + user_undo + (i * NEAR_JMP_LEN) as u64, &mut original)?;
        process.remote.write_code(info.daddr, &original)?;
        restored += 1;
    }

    // Losing the region leaks remote memory but the victim is consistent;
    // report and carry on.
    if let Err(e) = process.remote.munmap_remote(kpta, region_size) {
        warn!("Failed to unmap patch region {:#x}+{:#x}, {}", kpta, region_size, e);
    }

    if let Some(patch_idx) = process.objects[target_idx].applied_patch.take() {
        process.objects[patch_idx].patch_target = None;
        process.objects[patch_idx].kpta = 0;
    }
    let object = &mut process.objects[target_idx];
    object.kpta = 0;
    object.kpta_size = 0;
    object.kpfile = None;
    object.jmp_table = None;
    object.info.clear();

    Ok(restored)
}

/// Reads hunk records from remote memory until the end sentinel.
fn recover_info(process: &Process, info_addr: u64) -> Result<Vec<PatchInfo>> {
    let mut infos = Vec::new();
    let mut record = [0u8; PATCH_INFO_LEN];

    loop {
        ensure!(
            infos.len() < MAX_PATCH_INFO,
            PatchError::InvalidPatch(format!(
                "more than {} hunk records in remote blob",
                MAX_PATCH_INFO
            ))
        );
        process
            .remote
            .read_mem(info_addr + (infos.len() * PATCH_INFO_LEN) as u64, &mut record)?;
        let info = PatchInfo::from_bytes(&record);
        if info.is_end() {
            break;
        }
        infos.push(info);
    }

    debug!("Recovered {} hunk record(s) from remote blob", infos.len());
    Ok(infos)
}
