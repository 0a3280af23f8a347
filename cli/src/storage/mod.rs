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

use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, ensure, Context, Result};
use indexmap::IndexMap;
use log::debug;

use procpatch_abi::{HeaderRead, HeaderWrite, KPATCH_HEADER_LEN, KPATCH_MAGIC};
use procpatch_common::fs;

use crate::error::PatchError;
use crate::process::Process;

const ELF_IDENT: [u8; 4] = [0x7f, b'E', b'L', b'F'];
const ELF_E_TYPE_OFFSET: usize = 16;
const ELF_E_SHENTSIZE_OFFSET: usize = 58;
const ELF_SHENTSIZE_64: u16 = 64;

/// A verified patch blob.
#[derive(Debug)]
pub struct PatchFile {
    pub path: PathBuf,
    pub data: Vec<u8>,
}

impl PatchFile {
    pub fn parse(path: PathBuf, data: Vec<u8>) -> Result<Self> {
        Self::verify(&data).map_err(|e| {
            PatchError::InvalidPatch(format!("\"{}\", {}", path.display(), e))
        })?;

        Ok(Self { path, data })
    }

    /// Magic, size bounds and the identification of the embedded ET_REL.
    fn verify(data: &[u8]) -> Result<()> {
        ensure!(data.len() >= KPATCH_HEADER_LEN, "file is too short");
        ensure!(data.magic() == KPATCH_MAGIC, "magic mismatch");

        let total_size = data.total_size() as usize;
        ensure!(
            total_size >= KPATCH_HEADER_LEN && total_size <= data.len(),
            "inconsistent total size {}",
            total_size
        );

        let kpatch_offset = data.kpatch_offset() as usize;
        ensure!(
            kpatch_offset + ELF_E_SHENTSIZE_OFFSET + 2 <= total_size,
            "embedded image offset {} is out of bounds",
            kpatch_offset
        );
        let image = &data[kpatch_offset..];
        ensure!(image[..4] == ELF_IDENT, "embedded image is not an ELF");

        let e_type = u16::from_le_bytes([
            image[ELF_E_TYPE_OFFSET],
            image[ELF_E_TYPE_OFFSET + 1],
        ]);
        ensure!(
            e_type == object::elf::ET_REL,
            "embedded ELF type {} is not relocatable",
            e_type
        );

        let e_shentsize = u16::from_le_bytes([
            image[ELF_E_SHENTSIZE_OFFSET],
            image[ELF_E_SHENTSIZE_OFFSET + 1],
        ]);
        ensure!(
            e_shentsize == ELF_SHENTSIZE_64,
            "unexpected section header entry size {}",
            e_shentsize
        );

        Ok(())
    }

    pub fn uname(&self) -> &str {
        self.data.uname()
    }

    pub fn user_level(&self) -> u64 {
        self.data.user_level()
    }
}

#[derive(Clone, Debug)]
enum CacheRecord {
    Found(Arc<PatchFile>),
    Exists,
    Absent,
}

pub enum FindResult {
    Found(Arc<PatchFile>),
    /// A stat-only probe succeeded; the blob has not been mapped.
    Exists,
    NotFound,
}

#[derive(Debug)]
enum StorageKind {
    SingleFile(Arc<PatchFile>),
    Directory {
        root: PathBuf,
        cache: RefCell<IndexMap<String, CacheRecord>>,
    },
}

/// Patch storage: either one blob file or a Build-ID-indexed directory.
#[derive(Debug)]
pub struct Storage {
    kind: StorageKind,
}

impl Storage {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let metadata = fs::metadata(path)
            .map_err(|e| PatchError::StorageUnavailable(e.to_string()))?;

        let kind = if metadata.is_dir() {
            debug!("Using patch storage directory \"{}\"", path.display());
            StorageKind::Directory {
                root: path.to_path_buf(),
                cache: RefCell::new(IndexMap::new()),
            }
        } else {
            debug!("Using single patch file \"{}\"", path.display());
            let data =
                fs::read(path).map_err(|e| PatchError::StorageUnavailable(e.to_string()))?;
            StorageKind::SingleFile(Arc::new(PatchFile::parse(path.to_path_buf(), data)?))
        };

        Ok(Self { kind })
    }

    /// Looks up a patch for `build_id`. With `want_data` unset the probe is
    /// stat-only and never maps the blob. Directory lookups are cached,
    /// including the "known absent" outcome.
    pub fn find(&self, build_id: &str, want_data: bool) -> Result<FindResult> {
        match &self.kind {
            StorageKind::SingleFile(patch) => {
                if patch.uname() == build_id {
                    Ok(FindResult::Found(patch.clone()))
                } else {
                    Ok(FindResult::NotFound)
                }
            }
            StorageKind::Directory { root, cache } => {
                match cache.borrow().get(build_id) {
                    Some(CacheRecord::Found(patch)) => {
                        return Ok(FindResult::Found(patch.clone()))
                    }
                    Some(CacheRecord::Exists) if !want_data => return Ok(FindResult::Exists),
                    Some(CacheRecord::Absent) => return Ok(FindResult::NotFound),
                    // A stat-only record is upgraded by probing again.
                    Some(CacheRecord::Exists) | None => {}
                }

                let result = Self::probe_templates(root, build_id, want_data)?;
                let record = match &result {
                    FindResult::Found(patch) => CacheRecord::Found(patch.clone()),
                    FindResult::Exists => CacheRecord::Exists,
                    FindResult::NotFound => CacheRecord::Absent,
                };
                cache.borrow_mut().insert(build_id.to_string(), record);

                Ok(result)
            }
        }
    }

    /// Probes the storage path templates in order:
    /// `<bid>/latest/kpatch.bin` (the symlink target names the patch
    /// level), then `<bid>.kpatch`. Paths are composed explicitly, never
    /// rewritten in place.
    fn probe_templates(root: &Path, build_id: &str, want_data: bool) -> Result<FindResult> {
        let latest_link = root.join(build_id).join("latest");
        let latest_blob = latest_link.join("kpatch.bin");
        if !want_data {
            if Self::probe_stat(&latest_blob)? {
                return Ok(FindResult::Exists);
            }
        } else if let Some(mut patch) = Self::probe_read(&latest_blob)? {
            let level = Self::read_patch_level(&latest_link)?;
            patch.data.set_user_level(level);
            debug!(
                "Found \"{}\" at patch level {}",
                latest_blob.display(),
                level
            );
            return Ok(FindResult::Found(Arc::new(patch)));
        }

        let direct_blob = root.join(format!("{}.kpatch", build_id));
        if !want_data {
            if Self::probe_stat(&direct_blob)? {
                return Ok(FindResult::Exists);
            }
        } else if let Some(patch) = Self::probe_read(&direct_blob)? {
            debug!("Found \"{}\"", direct_blob.display());
            return Ok(FindResult::Found(Arc::new(patch)));
        }

        Ok(FindResult::NotFound)
    }

    /// A missing template is not an error; an unreadable one is.
    fn probe_stat(path: &Path) -> Result<bool> {
        match fs::symlink_metadata(path) {
            Ok(_) => Ok(true),
            Err(ref e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(PatchError::StorageUnavailable(e.to_string()).into()),
        }
    }

    fn probe_read(path: &Path) -> Result<Option<PatchFile>> {
        match fs::read(path) {
            Ok(data) => Ok(Some(PatchFile::parse(path.to_path_buf(), data)?)),
            Err(ref e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(PatchError::StorageUnavailable(e.to_string()).into()),
        }
    }

    /// The "latest" symlink points at a directory named by the decimal
    /// patch level; the level is read from the link target.
    fn read_patch_level(link: &Path) -> Result<u64> {
        let target = fs::read_link(link)?;
        let name = target
            .file_name()
            .with_context(|| format!("Empty symlink target \"{}\"", link.display()))?;

        match name.to_string_lossy().parse::<u64>() {
            Ok(level) => Ok(level),
            Err(_) => bail!(PatchError::InvalidPatch(format!(
                "\"{}\" does not name a patch level",
                target.display()
            ))),
        }
    }

    /// Attaches a storage blob to every patchable object of the process
    /// whose Build-ID has a match. Returns the number of matches.
    pub fn lookup_patches(&self, process: &mut Process) -> Result<usize> {
        let mut matched = 0;

        for object in process.objects.iter_mut() {
            if !object.is_patchable() {
                continue;
            }
            let build_id = match &object.build_id {
                Some(build_id) => build_id.clone(),
                None => continue,
            };
            if let FindResult::Found(patch) = self.find(&build_id, true)? {
                debug!(
                    "Object \"{}\" matches patch \"{}\"",
                    object.name,
                    patch.path.display()
                );
                object.skpfile = Some(patch);
                matched += 1;
            }
        }

        Ok(matched)
    }
}
