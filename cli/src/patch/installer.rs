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
use log::{debug, info, warn};

use procpatch_abi::{near_jmp, HeaderRead, HeaderWrite, NEAR_JMP_LEN};

use crate::error::PatchError;
use crate::patch::canceller;
use crate::patch::module::{JumpTable, KpatchModule, TargetSymbols, JMP_TABLE_ENTRY_LEN};
use crate::patch::{ensure_safety, round_up};
use crate::process::{ObjectFile, Process};
use crate::safety::Direction;

/// Widest gap the 32-bit displacement of the entry jump can bridge,
/// leaving a page of slack for in-blob offsets.
const MAX_JUMP_DISTANCE: u64 = (i32::MAX as u64) - 4096;

/// Applies the selected storage blob to every matching object of the
/// process, in discovery order. Returns the number of hunks installed.
///
/// A failing object is rolled back locally; objects patched earlier in the
/// same run stay in place and the error reports a partial apply.
pub fn apply_patches(process: &mut Process) -> Result<usize> {
    let mut total = 0;

    for idx in 0..process.objects.len() {
        if process.objects[idx].skpfile.is_none() || !process.objects[idx].is_patchable() {
            continue;
        }

        if let Some(patch_idx) = process.objects[idx].applied_patch {
            let storage_level = match &process.objects[idx].skpfile {
                Some(patch) => patch.user_level(),
                None => continue,
            };
            let installed_level = process.objects[patch_idx].patch_level;
            if storage_level <= installed_level {
                info!(
                    "Object \"{}\" already has a patch at level {}",
                    process.objects[idx].name, installed_level
                );
                continue;
            }
            info!(
                "Object \"{}\": replacing patch level {} with level {}",
                process.objects[idx].name, installed_level, storage_level
            );
            canceller::cancel_object(process, idx, false).with_context(|| {
                format!(
                    "Failed to cancel patch level {} of object \"{}\"",
                    installed_level, process.objects[idx].name
                )
            })?;
        }

        match install_object(process, idx) {
            Ok(count) => {
                debug!(
                    "Installed {} hunk(s) into object \"{}\"",
                    count, process.objects[idx].name
                );
                total += count;
            }
            Err(e) => {
                warn!(
                    "Failed to patch object \"{}\", rolling it back",
                    process.objects[idx].name
                );
                if process.objects[idx].kpta != 0 {
                    if let Err(rollback_err) = canceller::cancel_object(process, idx, true) {
                        warn!(
                            "Rollback of object \"{}\" failed, {:#}",
                            process.objects[idx].name, rollback_err
                        );
                    }
                }
                if total > 0 {
                    return Err(e.context(PatchError::PartialApply { applied: total }));
                }
                return Err(e);
            }
        }
    }

    Ok(total)
}

/// Installs one object's patch: duplicate the blob, lay it out, place it
/// near the victim code, relocate, write, gate on stack safety, then
/// redirect every patched function.
fn install_object(process: &mut Process, idx: usize) -> Result<usize> {
    let skpfile = process.objects[idx]
        .skpfile
        .clone()
        .context("Object has no patch selected")?;
    let load_bias = process.objects[idx].load_bias;

    // The installer mutates header fields, so it works on its own copy.
    let mut kp = skpfile.data.clone();
    let total_size = kp.total_size() as usize;

    let module = KpatchModule::parse(&kp)?;

    // Region layout: blob, jump table (128-aligned), undo table, page pad.
    let mut sz = round_up(total_size, 8);
    let mut jmp_offset = 0usize;
    if module.undefined_count() > 0 {
        jmp_offset = sz;
        kp.set_jmp_offset(jmp_offset as u64);
        sz = round_up(sz + module.undefined_count() * JMP_TABLE_ENTRY_LEN, 128);
    }
    kp.set_user_info(module.info_offset() as u64);
    let user_undo = sz;
    kp.set_user_undo(user_undo as u64);
    sz = round_up(sz + NEAR_JMP_LEN * module.ninfo(), 16);
    let sz = round_up(sz, 4096);

    let kpta = allocate_near(process, idx, sz as u64)?;
    debug!(
        "Object \"{}\": patch region {:#x}+{:#x}",
        process.objects[idx].name, kpta, sz
    );

    let target_symbols = match module.undefined_count() {
        0 => TargetSymbols::new(),
        _ => {
            let elf_data = process.object_elf_data(idx)?;
            TargetSymbols::load(&elf_data, load_bias)?
        }
    };
    let mut jmp_table = JumpTable::new(kpta + jmp_offset as u64, module.undefined_count());
    module.relocate(&mut kp, kpta, &target_symbols, &mut jmp_table)?;

    // Rebase destinations by the load bias and write the runtime values
    // back, so that the remote copy is self-contained for a later cancel.
    let mut infos = module.read_info(&kp);
    for (i, info) in infos.iter_mut().enumerate() {
        if info.is_new_func() {
            continue;
        }
        info.daddr += load_bias;
        let offset = module.info_offset() + i * procpatch_abi::PATCH_INFO_LEN;
        info.write_to(&mut kp[offset..offset + procpatch_abi::PATCH_INFO_LEN]);
        if near_jmp(info.daddr, info.saddr).is_none() {
            return Err(PatchError::LayoutUnreachable.into());
        }
    }

    process.remote.write_mem(kpta, &kp[..total_size])?;
    if !jmp_table.is_empty() {
        process
            .remote
            .write_mem(kpta + jmp_offset as u64, &jmp_table.bytes())?;
    }

    // Expose the partial state before touching any code byte, so a failed
    // install can be rolled back by the canceller.
    {
        let object = &mut process.objects[idx];
        object.kpta = kpta;
        object.kpta_size = sz as u64;
        object.kpfile = Some(kp);
        object.info = infos;
        object.jmp_table = match jmp_table.is_empty() {
            true => None,
            false => Some(jmp_table.bytes()),
        };
    }

    let infos = process.objects[idx].info.clone();
    ensure_safety(process, &infos, Direction::Apply)?;

    let mut count = 0;
    for i in 0..process.objects[idx].info.len() {
        let info = process.objects[idx].info[i];
        if info.is_new_func() {
            continue;
        }

        let mut original = [0u8; NEAR_JMP_LEN];
        process.remote.read_mem(info.daddr, &mut original)?;
        process
            .remote
            .write_mem(kpta + (user_undo + i * NEAR_JMP_LEN) as u64, &original)?;

        let code = near_jmp(info.daddr, info.saddr).ok_or(PatchError::LayoutUnreachable)?;
        process.remote.write_code(info.daddr, &code)?;
        process.objects[idx].info[i].set_applied();
        count += 1;
    }

    let patch_object = ObjectFile {
        name: format!("[kpatch:{}]", skpfile.uname()),
        start: kpta,
        end: kpta + sz as u64,
        is_elf: true,
        is_patch: true,
        build_id: Some(skpfile.uname().to_string()),
        kpta,
        kpta_size: sz as u64,
        patch_target: Some(idx),
        patch_level: skpfile.user_level(),
        ..Default::default()
    };
    process.objects.push(patch_object);
    let patch_idx = process.objects.len() - 1;
    process.objects[idx].applied_patch = Some(patch_idx);

    Ok(count)
}

/// Chooses a hole in the remote address space within 32-bit jump reach of
/// the object's code and maps the region there.
fn allocate_near(process: &mut Process, idx: usize, size: u64) -> Result<u64> {
    let object_start = process.objects[idx].start;
    let object_end = process.objects[idx].end;

    let window_lo = object_end.saturating_sub(MAX_JUMP_DISTANCE);
    let window_hi = object_start.saturating_add(MAX_JUMP_DISTANCE);

    let mut entries = process.remote.maps()?;
    entries.sort_by_key(|entry| entry.start);

    // Candidate holes between mappings, preferring the one closest to the
    // object so every displacement stays small.
    let mut candidates: Vec<u64> = Vec::new();
    let mut cursor = window_lo.max(4096);
    for entry in &entries {
        if entry.start > cursor && entry.start - cursor >= size {
            candidates.push(cursor);
        }
        cursor = cursor.max(entry.end);
    }
    if cursor.checked_add(size).map_or(false, |end| end <= window_hi) {
        candidates.push(cursor);
    }

    candidates.retain(|start| *start >= window_lo && start + size <= window_hi);
    candidates.sort_by_key(|start| {
        if *start >= object_end {
            *start - object_end
        } else {
            object_start.saturating_sub(*start)
        }
    });

    for hint in candidates {
        match process.remote.mmap_remote(hint, size) {
            Ok(kpta) if kpta >= window_lo && kpta + size <= window_hi => return Ok(kpta),
            Ok(kpta) => {
                // Placed out of reach, give the region back.
                if let Err(e) = process.remote.munmap_remote(kpta, size) {
                    warn!("Failed to unmap misplaced region {:#x}, {}", kpta, e);
                }
            }
            Err(e) => debug!("Cannot map patch region at {:#x}, {}", hint, e),
        }
    }

    Err(PatchError::LayoutUnreachable.into())
}
