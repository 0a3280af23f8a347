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

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use log::{debug, warn};
use object::{Object, ObjectKind};

use procpatch_abi::{HeaderRead, PatchInfo, KPATCH_HEADER_LEN, KPATCH_MAGIC};
use procpatch_common::{fs, os};

use crate::remote::{PtraceTarget, RemoteProcess, ThreadContext};
use crate::storage::PatchFile;

pub mod coroutine;
pub mod maps;

use coroutine::{CoroutineContext, CoroutineFinder};
use maps::MapEntry;

/// One loaded ELF object (or an installed patch region) of the target.
#[derive(Default)]
pub struct ObjectFile {
    pub name: String,
    pub path: Option<PathBuf>,
    pub start: u64,
    pub end: u64,
    pub load_bias: u64,
    pub build_id: Option<String>,
    pub is_elf: bool,
    pub is_patch: bool,
    /// Index of the installed patch object, if any.
    pub applied_patch: Option<usize>,
    /// Back reference from a patch object to its target.
    pub patch_target: Option<usize>,
    /// Storage blob selected for installation.
    pub skpfile: Option<Arc<PatchFile>>,
    /// Duplicated blob owned after installation.
    pub kpfile: Option<Vec<u8>>,
    /// Remote base address of the mapped blob.
    pub kpta: u64,
    /// Size of the remote blob region.
    pub kpta_size: u64,
    /// Hunk table, runtime addresses.
    pub info: Vec<PatchInfo>,
    /// Jump-table image written behind the blob, if any.
    pub jmp_table: Option<Vec<u8>>,
    /// Patch level, for patch objects.
    pub patch_level: u64,
}

impl ObjectFile {
    /// True for objects the patch pipeline considers: real ELF files that
    /// are neither kernel pseudo objects nor installed patch regions.
    pub fn is_patchable(&self) -> bool {
        self.is_elf && !self.is_patch
    }
}

/// Stop-the-world view of one victim process.
pub struct Process {
    pub pid: i32,
    pub comm: String,
    pub remote: Box<dyn RemoteProcess>,
    pub objects: Vec<ObjectFile>,
    pub threads: Vec<ThreadContext>,
    pub coroutines: Vec<CoroutineContext>,
    pub coroutine_finders: Vec<Box<dyn CoroutineFinder>>,
}

impl Process {
    pub fn open(pid: i32) -> Result<Self> {
        let comm = os::proc::process_comm(pid)
            .with_context(|| format!("Cannot read name of process {}", pid))?;

        Ok(Self::with_remote(pid, comm, Box::new(PtraceTarget::new(pid))))
    }

    pub fn with_remote(pid: i32, comm: String, remote: Box<dyn RemoteProcess>) -> Self {
        Self {
            pid,
            comm,
            remote,
            objects: Vec::new(),
            threads: Vec::new(),
            coroutines: Vec::new(),
            coroutine_finders: Vec::new(),
        }
    }

    pub fn attach(&mut self) -> Result<()> {
        self.remote.attach()?;
        self.refresh_threads();

        Ok(())
    }

    pub fn detach(&mut self) -> Result<()> {
        self.threads.clear();
        self.remote.detach()
    }

    /// Re-reads the thread list from the remote side, keeping any
    /// `execute_until` targets of threads that are still alive.
    pub fn refresh_threads(&mut self) {
        let previous = std::mem::take(&mut self.threads);
        self.threads = self
            .remote
            .threads()
            .into_iter()
            .map(|tid| ThreadContext {
                tid,
                execute_until: previous
                    .iter()
                    .find(|thread| thread.tid == tid)
                    .and_then(|thread| thread.execute_until),
            })
            .collect();
    }

    /// Builds the object list from the memory mappings: path-backed ELF
    /// objects plus anonymous executable regions carrying the patch magic.
    pub fn map_object_files(&mut self) -> Result<()> {
        let entries = self.remote.maps()?;
        let mut objects = Vec::new();

        for entry in &entries {
            if entry.is_kernel_object() {
                continue;
            }
            match &entry.path {
                Some(path) => {
                    // The first mapping of a file describes the object; the
                    // later segments only extend its range.
                    if let Some(existing) = objects
                        .iter_mut()
                        .find(|object: &&mut ObjectFile| object.path.as_ref() == Some(path))
                    {
                        existing.end = existing.end.max(entry.end);
                        continue;
                    }
                    objects.push(self.load_disk_object(path.clone(), entry));
                }
                None => {
                    if !entry.is_anonymous() || !entry.executable {
                        continue;
                    }
                    if let Some(object) = self.probe_patch_region(entry) {
                        objects.push(object);
                    }
                }
            }
        }

        self.objects = objects;
        self.associate_patches();
        debug!(
            "Process {} has {} object file(s)",
            self.pid,
            self.objects.len()
        );

        Ok(())
    }

    fn load_disk_object(&self, path: PathBuf, entry: &MapEntry) -> ObjectFile {
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();

        let mut object = ObjectFile {
            name,
            path: Some(path),
            start: entry.start,
            end: entry.end,
            ..Default::default()
        };

        let data = match fs::read(object.path.as_ref().unwrap()) {
            Ok(data) => data,
            // Deleted or inaccessible backing file, keep the bare record.
            Err(_) => return object,
        };
        let file = match object::File::parse(&*data) {
            Ok(file) => file,
            Err(_) => return object,
        };

        object.is_elf = true;
        object.load_bias = match file.kind() {
            ObjectKind::Dynamic => entry.start,
            _ => 0,
        };
        object.build_id = match file.build_id() {
            Ok(Some(bytes)) => Some(maps::encode_build_id(bytes)),
            _ => None,
        };

        object
    }

    /// An installed patch is an anonymous executable region that starts
    /// with the blob magic; its header carries the target Build-ID.
    fn probe_patch_region(&self, entry: &MapEntry) -> Option<ObjectFile> {
        let mut magic = [0u8; KPATCH_MAGIC.len()];
        if self.remote.read_mem(entry.start, &mut magic).is_err() || magic != KPATCH_MAGIC {
            return None;
        }

        let mut header = vec![0u8; KPATCH_HEADER_LEN];
        if let Err(e) = self.remote.read_mem(entry.start, &mut header) {
            warn!("Cannot read patch header at {:#x}, {}", entry.start, e);
            return None;
        }

        let uname = header.uname().to_string();
        Some(ObjectFile {
            name: format!("[kpatch:{}]", uname),
            start: entry.start,
            end: entry.end,
            is_elf: true,
            is_patch: true,
            build_id: Some(uname),
            kpta: entry.start,
            kpta_size: entry.end - entry.start,
            patch_level: header.user_level(),
            ..Default::default()
        })
    }

    /// Links every recovered patch region to the object with the matching
    /// Build-ID, in both directions.
    fn associate_patches(&mut self) {
        let links: Vec<(usize, usize)> = self
            .objects
            .iter()
            .enumerate()
            .filter(|(_, object)| object.is_patch)
            .filter_map(|(patch_idx, patch)| {
                self.objects
                    .iter()
                    .position(|object| {
                        !object.is_patch && object.build_id == patch.build_id
                    })
                    .map(|target_idx| (patch_idx, target_idx))
            })
            .collect();

        for (patch_idx, target_idx) in links {
            self.objects[patch_idx].patch_target = Some(target_idx);
            self.objects[target_idx].applied_patch = Some(patch_idx);
            self.objects[target_idx].kpta = self.objects[patch_idx].kpta;
            self.objects[target_idx].kpta_size = self.objects[patch_idx].kpta_size;
            debug!(
                "Object \"{}\" already carries patch level {}",
                self.objects[target_idx].name, self.objects[patch_idx].patch_level
            );
        }
    }

    pub fn find_coroutines(&mut self) -> Result<()> {
        self.coroutines =
            coroutine::discover(&*self.remote, &self.objects, &self.coroutine_finders)?;

        Ok(())
    }

    /// On-disk image of an object, used for target-side symbol resolution.
    pub fn object_elf_data(&self, idx: usize) -> Result<Vec<u8>> {
        let object = &self.objects[idx];
        let path = object
            .path
            .as_ref()
            .with_context(|| format!("Object \"{}\" has no backing file", object.name))?;

        Ok(fs::read(path)?)
    }
}
