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

//! Synthetic patch blobs for the engine tests, plus the end-to-end
//! apply/cancel scenarios run against the in-memory remote.

use object::write::{Object as ElfBuilder, Relocation as ElfRelocation, Symbol, SymbolSection};
use object::{
    Architecture, BinaryFormat, Endianness, RelocationEncoding, RelocationKind, SectionKind,
    SymbolFlags, SymbolKind, SymbolScope,
};

use procpatch_abi::{HeaderWrite, PatchInfo, KPATCH_HEADER_LEN, PATCH_INFO_LEN};

use crate::patch::round_up;

pub struct TestFunc {
    pub daddr: u64,
    pub dlen: u64,
    pub slen: u64,
}

pub fn build_test_patch(build_id: &str, level: u64, funcs: &[TestFunc]) -> Vec<u8> {
    build_test_patch_with_externs(build_id, level, funcs, &[])
}

/// Builds a complete blob: header plus an embedded ET_REL carrying one
/// replacement function per entry, a `.kpatch.info` array whose `saddr`
/// fields are filled by relocations, and optional external references.
pub fn build_test_patch_with_externs(
    build_id: &str,
    level: u64,
    funcs: &[TestFunc],
    externs: &[&str],
) -> Vec<u8> {
    let mut elf = ElfBuilder::new(BinaryFormat::Elf, Architecture::X86_64, Endianness::Little);

    let text_id = elf.add_section(Vec::new(), b".kpatch.text".to_vec(), SectionKind::Text);
    let mut func_symbols = Vec::new();
    for (i, func) in funcs.iter().enumerate() {
        let code = vec![0x90u8; func.slen as usize];
        let offset = elf.append_section_data(text_id, &code, 16);
        func_symbols.push(elf.add_symbol(Symbol {
            name: format!("kpatch_func_{}", i).into_bytes(),
            value: offset,
            size: func.slen,
            kind: SymbolKind::Text,
            scope: SymbolScope::Linkage,
            weak: false,
            section: SymbolSection::Section(text_id),
            flags: SymbolFlags::None,
        }));
    }

    for name in externs {
        let symbol = elf.add_symbol(Symbol {
            name: name.as_bytes().to_vec(),
            value: 0,
            size: 0,
            kind: SymbolKind::Text,
            scope: SymbolScope::Dynamic,
            weak: false,
            section: SymbolSection::Undefined,
            flags: SymbolFlags::None,
        });
        // A call site targeting the external.
        let site = elf.append_section_data(text_id, &[0xe8, 0, 0, 0, 0], 1);
        elf.add_relocation(
            text_id,
            ElfRelocation {
                offset: site + 1,
                size: 32,
                kind: RelocationKind::PltRelative,
                encoding: RelocationEncoding::X86Branch,
                symbol,
                addend: -4,
            },
        )
        .unwrap();
    }

    let info_id = elf.add_section(
        Vec::new(),
        b".kpatch.info".to_vec(),
        SectionKind::ReadOnlyData,
    );
    let mut info_data = vec![0u8; (funcs.len() + 1) * PATCH_INFO_LEN];
    for (i, func) in funcs.iter().enumerate() {
        PatchInfo {
            daddr: func.daddr,
            dlen: func.dlen,
            saddr: 0, // relocated
            slen: func.slen,
            flags: 0,
            reserved: 0,
        }
        .write_to(&mut info_data[i * PATCH_INFO_LEN..(i + 1) * PATCH_INFO_LEN]);
    }
    elf.append_section_data(info_id, &info_data, 8);
    for (i, symbol) in func_symbols.iter().enumerate() {
        elf.add_relocation(
            info_id,
            ElfRelocation {
                offset: (i * PATCH_INFO_LEN + 16) as u64,
                size: 64,
                kind: RelocationKind::Absolute,
                encoding: RelocationEncoding::Generic,
                symbol: *symbol,
                addend: 0,
            },
        )
        .unwrap();
    }

    let image = elf.write().unwrap();

    let kpatch_offset = round_up(KPATCH_HEADER_LEN, 8);
    let total_size = kpatch_offset + image.len();
    let mut blob = vec![0u8; total_size];
    blob.set_magic();
    blob.set_uname(build_id);
    blob.set_user_level(level);
    blob.set_kpatch_offset(kpatch_offset as u64);
    blob.set_total_size(total_size as u64);
    blob[kpatch_offset..].copy_from_slice(&image);

    blob
}

#[cfg(test)]
mod scenarios {
    use std::path::PathBuf;
    use std::sync::Arc;

    use procpatch_abi::{HeaderRead, KPATCH_MAGIC, NEAR_JMP_LEN, PATCH_INFO_APPLIED};

    use super::*;
    use crate::error::PatchError;
    use crate::patch::{canceller, installer};
    use crate::process::coroutine::CoroutineContext;
    use crate::process::{ObjectFile, Process};
    use crate::remote::testing::FakeRemote;
    use crate::remote::Registers;
    use crate::storage::PatchFile;

    const OBJ_START: u64 = 0x400000;
    const OBJ_END: u64 = 0x401000;
    const DADDR: u64 = 0x400100;
    const ORIGINAL_CODE: [u8; 16] = [
        0x55, 0x48, 0x89, 0xe5, 0x48, 0x83, 0xec, 0x10, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90,
        0x90, 0x90,
    ];

    fn one_func() -> Vec<TestFunc> {
        vec![TestFunc {
            daddr: DADDR,
            dlen: 16,
            slen: 32,
        }]
    }

    fn fake_remote() -> FakeRemote {
        let remote = FakeRemote::new(7);
        remote.write_bytes(DADDR, &ORIGINAL_CODE);
        remote.add_map(OBJ_START, OBJ_END, true, Some("/usr/lib/libx.so"));
        remote.add_thread(
            7,
            Registers {
                ip: 0x300000,
                sp: 0x7ffd0000,
                bp: 0,
            },
        );
        remote
    }

    fn patched_object(build_id: &str, blob: Vec<u8>) -> ObjectFile {
        ObjectFile {
            name: "libx".to_string(),
            start: OBJ_START,
            end: OBJ_END,
            is_elf: true,
            build_id: Some(build_id.to_string()),
            skpfile: Some(Arc::new(
                PatchFile::parse(PathBuf::from("patch.bin"), blob).unwrap(),
            )),
            ..Default::default()
        }
    }

    fn test_process(remote: &FakeRemote, blob: Vec<u8>) -> Process {
        let mut process =
            Process::with_remote(7, "victim".to_string(), Box::new(remote.clone()));
        process.objects.push(patched_object("b0", blob));
        process.refresh_threads();
        process
    }

    #[test]
    fn fresh_apply_installs_jump_and_preserves_bytes() {
        let remote = fake_remote();
        let mut process = test_process(&remote, build_test_patch("b0", 1, &one_func()));
        let count = installer::apply_patches(&mut process).unwrap();
        assert_eq!(count, 1);

        let object = &process.objects[0];
        let info = object.info[0];
        assert!(info.is_applied());
        assert_eq!(info.daddr, DADDR);

        // Exact near-jump encoding at the entry.
        let disp = (info.saddr as i64 - DADDR as i64 - NEAR_JMP_LEN as i64) as i32;
        let mut expected = vec![0xe9u8];
        expected.extend_from_slice(&disp.to_le_bytes());
        assert_eq!(remote.read_bytes(DADDR, NEAR_JMP_LEN), expected);

        // Displaced bytes preserved in the undo table.
        let kpfile = object.kpfile.as_ref().unwrap();
        let undo_addr = object.kpta + kpfile.user_undo();
        assert_eq!(
            remote.read_bytes(undo_addr, NEAR_JMP_LEN),
            &ORIGINAL_CODE[..NEAR_JMP_LEN]
        );

        // The blob body is mapped at kpta.
        assert_eq!(remote.read_bytes(object.kpta, 8), KPATCH_MAGIC);

        // Patch object recorded and linked both ways.
        let patch_idx = object.applied_patch.unwrap();
        assert!(process.objects[patch_idx].is_patch);
        assert_eq!(process.objects[patch_idx].patch_target, Some(0));
        assert_eq!(process.objects[patch_idx].patch_level, 1);
    }

    #[test]
    fn apply_cancel_restores_bytes_and_unmaps() {
        let remote = fake_remote();
        let mut process = test_process(&remote, build_test_patch("b0", 1, &one_func()));
        installer::apply_patches(&mut process).unwrap();
        let kpta = process.objects[0].kpta;
        let size = process.objects[0].kpta_size;

        let restored = canceller::cancel_patches(&mut process, &[]).unwrap();
        assert_eq!(restored, 1);
        assert_eq!(
            remote.read_bytes(DADDR, ORIGINAL_CODE.len()),
            ORIGINAL_CODE
        );
        assert!(remote.unmapped().contains(&(kpta, size)));
        assert_eq!(process.objects[0].applied_patch, None);
        assert_eq!(process.objects[0].kpta, 0);
    }

    #[test]
    fn apply_cancel_apply_matches_fresh_apply() {
        let remote = fake_remote();
        let mut process = test_process(&remote, build_test_patch("b0", 1, &one_func()));
        installer::apply_patches(&mut process).unwrap();
        let first = remote.read_bytes(DADDR, NEAR_JMP_LEN);

        canceller::cancel_patches(&mut process, &[]).unwrap();
        process.objects[0].skpfile = Some(Arc::new(
            PatchFile::parse(
                PathBuf::from("patch.bin"),
                build_test_patch("b0", 1, &one_func()),
            )
            .unwrap(),
        ));
        let count = installer::apply_patches(&mut process).unwrap();
        assert_eq!(count, 1);
        assert_eq!(remote.read_bytes(DADDR, NEAR_JMP_LEN), first);
    }

    #[test]
    fn double_apply_is_a_no_op() {
        let remote = fake_remote();
        let mut process = test_process(&remote, build_test_patch("b0", 1, &one_func()));
        assert_eq!(installer::apply_patches(&mut process).unwrap(), 1);
        let patched = remote.read_bytes(DADDR, NEAR_JMP_LEN);

        // Same storage level again: nothing to do.
        assert_eq!(installer::apply_patches(&mut process).unwrap(), 0);
        assert_eq!(remote.read_bytes(DADDR, NEAR_JMP_LEN), patched);
    }

    #[test]
    fn higher_level_replaces_installed_patch() {
        let remote = fake_remote();
        let mut process = test_process(&remote, build_test_patch("b0", 1, &one_func()));
        installer::apply_patches(&mut process).unwrap();
        let old_kpta = process.objects[0].kpta;

        process.objects[0].skpfile = Some(Arc::new(
            PatchFile::parse(
                PathBuf::from("patch.bin"),
                build_test_patch("b0", 2, &one_func()),
            )
            .unwrap(),
        ));
        let count = installer::apply_patches(&mut process).unwrap();
        assert_eq!(count, 1);

        // The old region was cancelled and the new level is installed.
        assert!(remote.unmapped().iter().any(|(addr, _)| *addr == old_kpta));
        let patch_idx = process.objects[0].applied_patch.unwrap();
        assert_eq!(process.objects[patch_idx].patch_level, 2);
    }

    #[test]
    fn unsafe_thread_is_advanced_then_patched() {
        let remote = fake_remote();
        // The only thread sits inside the hunk; its caller frame is safe.
        let frame_addr = 0x7ffd1000u64;
        let mut frame = Vec::new();
        frame.extend_from_slice(&0u64.to_le_bytes()); // saved rbp
        frame.extend_from_slice(&0x300500u64.to_le_bytes()); // return address
        remote.write_bytes(frame_addr, &frame);
        remote.set_regs(
            7,
            Registers {
                ip: DADDR + 3,
                sp: 0x7ffd0ff0,
                bp: frame_addr,
            },
        );

        let mut process = test_process(&remote, build_test_patch("b0", 1, &one_func()));
        let count = installer::apply_patches(&mut process).unwrap();
        assert_eq!(count, 1);
        assert_eq!(remote.advanced(), vec![(7, 0x300500)]);
    }

    #[test]
    fn unsafe_coroutine_is_terminal_and_writes_nothing() {
        let remote = fake_remote();
        let mut process = test_process(&remote, build_test_patch("b0", 1, &one_func()));
        process.coroutines.push(CoroutineContext {
            name: "coroutine-0".to_string(),
            regs: Registers {
                ip: DADDR + 5,
                sp: 0,
                bp: 0,
            },
        });

        let err = installer::apply_patches(&mut process).unwrap_err();
        match err.downcast_ref::<PatchError>() {
            Some(PatchError::UnsafeStack { coroutine: true }) => {}
            other => panic!("unexpected error kind: {:?}", other),
        }
        // No coroutine can be advanced.
        assert!(remote.advanced().is_empty());
        // The function entry was never rewritten.
        assert_eq!(
            remote.read_bytes(DADDR, ORIGINAL_CODE.len()),
            ORIGINAL_CODE
        );
        // The rollback released the staged region.
        assert_eq!(remote.mapped().len(), remote.unmapped().len());
    }

    #[test]
    fn selective_unpatch_keeps_other_objects() {
        let remote = fake_remote();
        let liby_daddr = 0x600100u64;
        remote.write_bytes(liby_daddr, &ORIGINAL_CODE);
        remote.add_map(0x600000, 0x601000, true, Some("/usr/lib/liby.so"));

        let mut process = test_process(&remote, build_test_patch("b0", 1, &one_func()));
        let mut liby = patched_object(
            "b1",
            build_test_patch(
                "b1",
                1,
                &[TestFunc {
                    daddr: liby_daddr,
                    dlen: 16,
                    slen: 32,
                }],
            ),
        );
        liby.name = "liby".to_string();
        liby.start = 0x600000;
        liby.end = 0x601000;
        process.objects.push(liby);

        assert_eq!(installer::apply_patches(&mut process).unwrap(), 2);

        let restored = canceller::cancel_patches(&mut process, &["liby".to_string()]).unwrap();
        assert_eq!(restored, 1);
        assert_eq!(
            remote.read_bytes(liby_daddr, ORIGINAL_CODE.len()),
            ORIGINAL_CODE
        );
        // libx stays patched.
        assert_eq!(remote.read_bytes(DADDR, 1), vec![0xe9]);
        assert!(process.objects[0].applied_patch.is_some());
        assert_eq!(process.objects[1].applied_patch, None);
    }

    #[test]
    fn cancel_recovers_info_from_remote_memory() {
        let remote = fake_remote();
        let mut process = test_process(&remote, build_test_patch("b0", 1, &one_func()));
        installer::apply_patches(&mut process).unwrap();

        // Forget everything this run learned, as if the patch had been
        // found in the maps of a fresh invocation.
        process.objects[0].info.clear();
        process.objects[0].kpfile = None;

        let restored = canceller::cancel_patches(&mut process, &[]).unwrap();
        assert_eq!(restored, 1);
        assert_eq!(
            remote.read_bytes(DADDR, ORIGINAL_CODE.len()),
            ORIGINAL_CODE
        );
    }

    #[test]
    fn rollback_with_check_flag_restores_only_applied_hunks() {
        let remote = fake_remote();
        let mut process = test_process(&remote, build_test_patch("b0", 1, &one_func()));
        installer::apply_patches(&mut process).unwrap();

        // Simulate a partial install: the hunk is marked as never applied.
        process.objects[0].info[0].flags &= !PATCH_INFO_APPLIED;
        let restored = canceller::cancel_object(&mut process, 0, true).unwrap();
        assert_eq!(restored, 0);
        // The jump is still in place, only the region went away.
        assert_eq!(remote.read_bytes(DADDR, 1), vec![0xe9]);
    }

    #[test]
    fn hunk_shorter_than_the_jump_is_still_installed() {
        let remote = fake_remote();
        let mut process = test_process(
            &remote,
            build_test_patch(
                "b0",
                1,
                &[TestFunc {
                    daddr: DADDR,
                    dlen: 3,
                    slen: 16,
                }],
            ),
        );

        // The 5-byte jump overwrites bytes of the following instructions.
        assert_eq!(installer::apply_patches(&mut process).unwrap(), 1);
        assert_eq!(remote.read_bytes(DADDR, 1), vec![0xe9]);
    }

    #[test]
    fn unreachable_layout_is_rejected() {
        let remote = fake_remote();
        // The kernel ignores the hint and maps the region out of reach.
        remote.set_force_mmap_at(0x7f00_0000_0000);

        let mut process = test_process(&remote, build_test_patch("b0", 1, &one_func()));
        let err = installer::apply_patches(&mut process).unwrap_err();
        match err.downcast_ref::<PatchError>() {
            Some(PatchError::LayoutUnreachable) => {}
            other => panic!("unexpected error kind: {:?}", other),
        }
        // Every misplaced region was handed back.
        assert_eq!(remote.mapped().len(), remote.unmapped().len());
    }
}
