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

//! Embedded ET_REL handling: hunk-info discovery, symbol resolution and
//! relocation of the image against its chosen remote load address.

use std::collections::HashMap;

use anyhow::{bail, ensure, Context, Result};
use indexmap::IndexMap;
use log::debug;
use object::{
    Object, ObjectSection, ObjectSymbol, RelocationKind, RelocationTarget, SymbolSection,
};

use procpatch_abi::{HeaderRead, PatchInfo, PATCH_INFO_LEN};

use crate::error::PatchError;

pub const JMP_TABLE_ENTRY_LEN: usize = 16;

const INFO_SECTION: &str = ".kpatch.info";

/// The embedded relocatable image of a patch blob.
///
/// The image is copied out of the blob at parse time so that relocation can
/// mutate the blob while the section/symbol tables stay readable.
pub struct KpatchModule {
    image: Vec<u8>,
    kpatch_offset: usize,
    info_offset: usize,
    ninfo: usize,
    undefined: Vec<String>,
}

impl KpatchModule {
    pub fn parse(blob: &[u8]) -> Result<Self> {
        let kpatch_offset = blob.kpatch_offset() as usize;
        let total_size = blob.total_size() as usize;
        let image = blob[kpatch_offset..total_size].to_vec();

        let file = object::File::parse(&*image)
            .map_err(|e| PatchError::InvalidPatch(format!("embedded image, {}", e)))?;

        let info_section = file
            .section_by_name(INFO_SECTION)
            .with_context(|| PatchError::InvalidPatch(format!("no {} section", INFO_SECTION)))?;
        let (info_off, info_size) = info_section
            .file_range()
            .with_context(|| PatchError::InvalidPatch(format!("{} has no data", INFO_SECTION)))?;

        let info_data = info_section
            .data()
            .map_err(|e| PatchError::InvalidPatch(format!("{}, {}", INFO_SECTION, e)))?;
        let mut ninfo = 0;
        for record in info_data.chunks_exact(PATCH_INFO_LEN) {
            if PatchInfo::from_bytes(record).is_end() {
                break;
            }
            ninfo += 1;
        }
        ensure!(
            ninfo * PATCH_INFO_LEN <= info_size as usize,
            PatchError::InvalidPatch(format!("{} record overflow", INFO_SECTION))
        );

        let undefined: Vec<String> = file
            .symbols()
            .filter(|symbol| symbol.is_undefined())
            .filter_map(|symbol| symbol.name().ok())
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .collect();

        debug!(
            "Patch module: {} hunk(s), {} undefined symbol(s)",
            ninfo,
            undefined.len()
        );
        Ok(Self {
            image,
            kpatch_offset,
            info_offset: kpatch_offset + info_off as usize,
            ninfo,
            undefined,
        })
    }

    /// Blob offset of the hunk-info array.
    pub fn info_offset(&self) -> usize {
        self.info_offset
    }

    pub fn ninfo(&self) -> usize {
        self.ninfo
    }

    pub fn undefined_count(&self) -> usize {
        self.undefined.len()
    }

    /// Decodes the (possibly relocated) hunk records from the blob.
    pub fn read_info(&self, blob: &[u8]) -> Vec<PatchInfo> {
        (0..self.ninfo)
            .map(|i| {
                let offset = self.info_offset + i * PATCH_INFO_LEN;
                PatchInfo::from_bytes(&blob[offset..offset + PATCH_INFO_LEN])
            })
            .collect()
    }

    /// Applies every relocation of the image against load address `kpta`.
    /// Undefined symbols resolve into the target object; PC-relative
    /// references to them are routed through the jump table.
    pub fn relocate(
        &self,
        blob: &mut [u8],
        kpta: u64,
        symbols: &TargetSymbols,
        jmp_table: &mut JumpTable,
    ) -> Result<()> {
        let file = object::File::parse(&*self.image)
            .map_err(|e| PatchError::InvalidPatch(format!("embedded image, {}", e)))?;

        for section in file.sections() {
            let (section_off, _) = match section.file_range() {
                Some(range) => range,
                None => continue,
            };
            for (offset, relocation) in section.relocations() {
                let blob_off = self.kpatch_offset + section_off as usize + offset as usize;
                let place = kpta + blob_off as u64;

                let symbol = match relocation.target() {
                    RelocationTarget::Symbol(index) => {
                        file.symbol_by_index(index).map_err(|e| {
                            PatchError::RelocationFailed(format!("bad symbol reference, {}", e))
                        })?
                    }
                    target => bail!(PatchError::RelocationFailed(format!(
                        "unsupported relocation target {:?}",
                        target
                    ))),
                };

                let value = if symbol.is_undefined() {
                    let name = symbol.name().unwrap_or_default();
                    let address = symbols.resolve(name)?;
                    match relocation.kind() {
                        RelocationKind::Absolute => address,
                        // A 32-bit displacement to the original object may
                        // not reach; the jump table slot always does.
                        _ => jmp_table.entry_address(name, address)?,
                    }
                } else {
                    match symbol.section() {
                        SymbolSection::Section(index) => {
                            let sym_section = file.section_by_index(index).map_err(|e| {
                                PatchError::RelocationFailed(format!("bad symbol section, {}", e))
                            })?;
                            let (sym_off, _) =
                                sym_section.file_range().with_context(|| {
                                    PatchError::RelocationFailed(
                                        "symbol in section without data".to_string(),
                                    )
                                })?;
                            kpta + self.kpatch_offset as u64 + sym_off + symbol.address()
                        }
                        SymbolSection::Absolute => symbol.address(),
                        section => bail!(PatchError::RelocationFailed(format!(
                            "unsupported symbol section {:?}",
                            section
                        ))),
                    }
                };

                self.apply_one(blob, blob_off, place, value, &relocation)?;
            }
        }

        Ok(())
    }

    fn apply_one(
        &self,
        blob: &mut [u8],
        blob_off: usize,
        place: u64,
        value: u64,
        relocation: &object::Relocation,
    ) -> Result<()> {
        let addend = relocation.addend();

        match (relocation.kind(), relocation.size()) {
            (RelocationKind::Absolute, 64) => {
                let result = (value as i64).wrapping_add(addend) as u64;
                blob[blob_off..blob_off + 8].copy_from_slice(&result.to_le_bytes());
            }
            (RelocationKind::Absolute, 32) => {
                let result = (value as i64).wrapping_add(addend);
                ensure!(
                    result >= 0 && result <= i64::from(u32::MAX),
                    PatchError::RelocationFailed(format!(
                        "absolute value {:#x} does not fit 32 bits",
                        result
                    ))
                );
                blob[blob_off..blob_off + 4].copy_from_slice(&(result as u32).to_le_bytes());
            }
            (RelocationKind::Elf(object::elf::R_X86_64_32S), _) => {
                let result = (value as i64).wrapping_add(addend);
                ensure!(
                    result >= i64::from(i32::MIN) && result <= i64::from(i32::MAX),
                    PatchError::RelocationFailed(format!(
                        "signed value {:#x} does not fit 32 bits",
                        result
                    ))
                );
                blob[blob_off..blob_off + 4].copy_from_slice(&(result as i32).to_le_bytes());
            }
            (RelocationKind::Relative, 32) | (RelocationKind::PltRelative, 32) => {
                let result = (value as i64)
                    .wrapping_add(addend)
                    .wrapping_sub(place as i64);
                ensure!(
                    result >= i64::from(i32::MIN) && result <= i64::from(i32::MAX),
                    PatchError::RelocationFailed(format!(
                        "displacement {:#x} does not fit 32 bits",
                        result
                    ))
                );
                blob[blob_off..blob_off + 4].copy_from_slice(&(result as i32).to_le_bytes());
            }
            (kind, size) => bail!(PatchError::RelocationFailed(format!(
                "unsupported relocation {:?} of size {}",
                kind, size
            ))),
        }

        Ok(())
    }
}

/// Defined symbols of the target object, runtime addresses.
pub struct TargetSymbols {
    symbols: HashMap<String, u64>,
}

impl TargetSymbols {
    pub fn new() -> Self {
        Self {
            symbols: HashMap::new(),
        }
    }

    pub fn insert(&mut self, name: &str, address: u64) {
        self.symbols.insert(name.to_string(), address);
    }

    /// Collects symbol and dynamic-symbol tables of the on-disk object,
    /// rebased by its load bias.
    pub fn load(data: &[u8], bias: u64) -> Result<Self> {
        let file = object::File::parse(data)
            .map_err(|e| PatchError::RelocationFailed(format!("target object, {}", e)))?;

        let mut instance = Self::new();
        for symbol in file.symbols().chain(file.dynamic_symbols()) {
            if symbol.is_undefined() {
                continue;
            }
            if let Ok(name) = symbol.name() {
                if !name.is_empty() {
                    instance
                        .symbols
                        .entry(name.to_string())
                        .or_insert(bias + symbol.address());
                }
            }
        }

        Ok(instance)
    }

    pub fn resolve(&self, name: &str) -> Result<u64> {
        self.symbols.get(name).copied().ok_or_else(|| {
            PatchError::RelocationFailed(format!("cannot resolve symbol \"{}\"", name)).into()
        })
    }
}

/// Absolute-jump slots placed behind the blob, one per external symbol:
/// `ff 25 02 00 00 00` (`jmp *0x2(%rip)`), two pad bytes, target address.
pub struct JumpTable {
    base_addr: u64,
    capacity: usize,
    entries: IndexMap<String, u64>,
}

impl JumpTable {
    pub fn new(base_addr: u64, capacity: usize) -> Self {
        Self {
            base_addr,
            capacity,
            entries: IndexMap::new(),
        }
    }

    /// Remote address of the slot jumping to `target`, allocating it on
    /// first use.
    pub fn entry_address(&mut self, name: &str, target: u64) -> Result<u64> {
        let index = match self.entries.get_index_of(name) {
            Some(index) => index,
            None => {
                ensure!(
                    self.entries.len() < self.capacity,
                    PatchError::RelocationFailed(format!(
                        "jump table overflow at symbol \"{}\"",
                        name
                    ))
                );
                self.entries.insert(name.to_string(), target);
                self.entries.len() - 1
            }
        };

        Ok(self.base_addr + (index * JMP_TABLE_ENTRY_LEN) as u64)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn size(&self) -> usize {
        self.entries.len() * JMP_TABLE_ENTRY_LEN
    }

    pub fn bytes(&self) -> Vec<u8> {
        let mut image = Vec::with_capacity(self.size());
        for target in self.entries.values() {
            image.extend_from_slice(&[0xff, 0x25, 0x02, 0x00, 0x00, 0x00, 0xcc, 0xcc]);
            image.extend_from_slice(&target.to_le_bytes());
        }
        image
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patch::testing::{build_test_patch, build_test_patch_with_externs, TestFunc};

    fn funcs() -> Vec<TestFunc> {
        vec![
            TestFunc {
                daddr: 0x400100,
                dlen: 16,
                slen: 32,
            },
            TestFunc {
                daddr: 0x400200,
                dlen: 8,
                slen: 16,
            },
        ]
    }

    #[test]
    fn parse_counts_hunks_and_externals() {
        let blob = build_test_patch("b0", 1, &funcs());
        let module = KpatchModule::parse(&blob).unwrap();
        assert_eq!(module.ninfo(), 2);
        assert_eq!(module.undefined_count(), 0);

        let blob = build_test_patch_with_externs("b0", 1, &funcs(), &["ext_helper"]);
        let module = KpatchModule::parse(&blob).unwrap();
        assert_eq!(module.undefined_count(), 1);
    }

    #[test]
    fn relocation_fills_replacement_addresses() {
        let kpta = 0x7f00_0000_0000u64;
        let mut blob = build_test_patch("b0", 1, &funcs());
        let module = KpatchModule::parse(&blob).unwrap();

        let symbols = TargetSymbols::new();
        let mut jmp_table = JumpTable::new(0, 0);
        module
            .relocate(&mut blob, kpta, &symbols, &mut jmp_table)
            .unwrap();
        assert!(jmp_table.is_empty());

        let infos = module.read_info(&blob);
        assert_eq!(infos.len(), 2);
        for info in &infos {
            // Replacement addresses land inside the mapped image.
            assert!(info.saddr >= kpta + blob.kpatch_offset() as u64);
            assert!(info.saddr < kpta + blob.total_size());
        }
        assert_ne!(infos[0].saddr, infos[1].saddr);
        assert_eq!(infos[0].daddr, 0x400100);
        assert_eq!(infos[1].dlen, 8);
    }

    #[test]
    fn external_references_go_through_the_jump_table() {
        let kpta = 0x7f00_0000_0000u64;
        let mut blob = build_test_patch_with_externs("b0", 1, &funcs(), &["ext_helper"]);
        let module = KpatchModule::parse(&blob).unwrap();

        let mut symbols = TargetSymbols::new();
        let target_addr = 0x0000_5555_0000_1000u64;
        symbols.insert("ext_helper", target_addr);

        let jmp_base = kpta + 0x10000;
        let mut jmp_table = JumpTable::new(jmp_base, module.undefined_count());
        module
            .relocate(&mut blob, kpta, &symbols, &mut jmp_table)
            .unwrap();

        assert_eq!(jmp_table.size(), JMP_TABLE_ENTRY_LEN);
        let image = jmp_table.bytes();
        assert_eq!(&image[..2], &[0xff, 0x25]);
        assert_eq!(&image[8..16], &target_addr.to_le_bytes());
    }

    #[test]
    fn unresolvable_symbol_is_a_relocation_failure() {
        let kpta = 0x7f00_0000_0000u64;
        let mut blob = build_test_patch_with_externs("b0", 1, &funcs(), &["ext_helper"]);
        let module = KpatchModule::parse(&blob).unwrap();

        let symbols = TargetSymbols::new();
        let mut jmp_table = JumpTable::new(kpta, 1);
        let err = module
            .relocate(&mut blob, kpta, &symbols, &mut jmp_table)
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PatchError>(),
            Some(PatchError::RelocationFailed(_))
        ));
    }
}
