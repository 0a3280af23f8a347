use std::fs::Metadata;
use std::path::{Path, PathBuf};

trait RewriteError {
    fn rewrite_err(self, err_msg: String) -> Self;
}

impl<T> RewriteError for std::io::Result<T> {
    #[inline]
    fn rewrite_err(self, err_msg: String) -> Self {
        self.map_err(|e| {
            std::io::Error::new(
                e.kind(),
                format!("{}, {}", err_msg, e.to_string().to_lowercase()),
            )
        })
    }
}

/* std::fs functions */
#[inline]
pub fn read<P: AsRef<Path>>(path: P) -> std::io::Result<Vec<u8>> {
    std::fs::read(path.as_ref())
        .rewrite_err(format!("Cannot read \"{}\"", path.as_ref().display()))
}

#[inline]
pub fn read_to_string<P: AsRef<Path>>(path: P) -> std::io::Result<String> {
    std::fs::read_to_string(path.as_ref())
        .rewrite_err(format!("Cannot read \"{}\"", path.as_ref().display()))
}

#[inline]
pub fn metadata<P: AsRef<Path>>(path: P) -> std::io::Result<Metadata> {
    std::fs::metadata(path.as_ref())
        .rewrite_err(format!("Cannot access \"{}\"", path.as_ref().display()))
}

#[inline]
pub fn symlink_metadata<P: AsRef<Path>>(path: P) -> std::io::Result<Metadata> {
    std::fs::symlink_metadata(path.as_ref())
        .rewrite_err(format!("Cannot access \"{}\"", path.as_ref().display()))
}

#[inline]
pub fn read_link<P: AsRef<Path>>(path: P) -> std::io::Result<PathBuf> {
    std::fs::read_link(path.as_ref())
        .rewrite_err(format!("Cannot read symbol link \"{}\"", path.as_ref().display()))
}

#[derive(Debug, Clone, Copy)]
pub struct TraverseOptions {
    pub recursive: bool,
}

pub fn list_dirs<P: AsRef<Path>>(
    directory: P,
    options: TraverseOptions,
) -> std::io::Result<Vec<PathBuf>> {
    let directory = directory.as_ref();
    let mut dir_list = Vec::new();

    let read_dir = std::fs::read_dir(directory)
        .rewrite_err(format!("Cannot read directory \"{}\"", directory.display()))?;
    for dir_entry in read_dir.flatten() {
        let file_type = match dir_entry.file_type() {
            Ok(file_type) => file_type,
            Err(_) => continue,
        };
        if !file_type.is_dir() {
            continue;
        }
        dir_list.push(dir_entry.path());
        if options.recursive {
            dir_list.extend(list_dirs(dir_entry.path(), options)?);
        }
    }

    Ok(dir_list)
}
