use std::ffi::OsStr;
use std::path::Path;

use crate::fs;

const PROC_DIR: &str = "/proc";

#[inline]
pub fn parse_process_id(proc_path: &Path) -> Option<i32> {
    proc_path
        .file_name()
        .and_then(OsStr::to_str)
        .map(str::parse)
        .and_then(Result::ok)
}

/// All process ids currently present under `/proc`.
pub fn list_process_ids() -> std::io::Result<Vec<i32>> {
    let proc_dirs = fs::list_dirs(PROC_DIR, fs::TraverseOptions { recursive: false })?;

    Ok(proc_dirs
        .iter()
        .filter_map(|path| parse_process_id(path))
        .collect())
}

/// Thread ids of a process, from `/proc/<pid>/task`.
pub fn list_thread_ids(pid: i32) -> std::io::Result<Vec<i32>> {
    let task_dirs = fs::list_dirs(
        format!("{}/{}/task", PROC_DIR, pid),
        fs::TraverseOptions { recursive: false },
    )?;

    Ok(task_dirs
        .iter()
        .filter_map(|path| parse_process_id(path))
        .collect())
}

pub fn process_comm(pid: i32) -> std::io::Result<String> {
    let comm = fs::read_to_string(format!("{}/{}/comm", PROC_DIR, pid))?;

    Ok(comm.trim_end().to_string())
}

#[inline]
pub fn id() -> i32 {
    std::process::id() as i32
}
