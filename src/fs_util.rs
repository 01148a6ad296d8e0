use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::CsdmError;

pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), CsdmError> {
    let content =
        serde_json::to_vec_pretty(value).map_err(|err| CsdmError::Filesystem(err.to_string()))?;
    write_bytes_atomic(path, &content)
}

pub fn write_bytes_atomic(path: &Path, content: &[u8]) -> Result<(), CsdmError> {
    let parent = path
        .parent()
        .ok_or_else(|| CsdmError::Filesystem(format!("no parent for {}", path.display())))?;
    fs::create_dir_all(parent).map_err(|err| CsdmError::Filesystem(err.to_string()))?;
    let temp = tempfile::Builder::new()
        .prefix(".csdm-write")
        .tempfile_in(parent)
        .map_err(|err| CsdmError::Filesystem(err.to_string()))?;
    fs::write(temp.path(), content).map_err(|err| CsdmError::Filesystem(err.to_string()))?;
    temp.persist(path)
        .map_err(|err| CsdmError::Filesystem(err.to_string()))?;
    Ok(())
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, CsdmError> {
    let content = fs::read_to_string(path)
        .map_err(|err| CsdmError::Filesystem(format!("read {}: {err}", path.display())))?;
    serde_json::from_str(&content)
        .map_err(|err| CsdmError::Filesystem(format!("parse {}: {err}", path.display())))
}

/// Total size in bytes of all regular files below `root`; a missing root is empty.
pub fn dir_size(root: &Path) -> Result<u64, CsdmError> {
    if !root.exists() {
        return Ok(0);
    }
    let mut total = 0u64;
    for path in walk_dir(root)? {
        if path.is_file() {
            let meta = fs::metadata(&path).map_err(|err| CsdmError::Filesystem(err.to_string()))?;
            total += meta.len();
        }
    }
    Ok(total)
}

/// File names (not paths) of regular files directly inside `dir`, sorted.
pub fn list_file_names(dir: &Path) -> Result<Vec<String>, CsdmError> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut names = Vec::new();
    let entries = fs::read_dir(dir).map_err(|err| CsdmError::Filesystem(err.to_string()))?;
    for entry in entries {
        let entry = entry.map_err(|err| CsdmError::Filesystem(err.to_string()))?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        if let Some(name) = path.file_name().and_then(|name| name.to_str()) {
            names.push(name.to_string());
        }
    }
    names.sort();
    Ok(names)
}

pub fn reset_dir(path: &Path) -> Result<(), CsdmError> {
    if path.exists() {
        fs::remove_dir_all(path).map_err(|err| CsdmError::Filesystem(err.to_string()))?;
    }
    fs::create_dir_all(path).map_err(|err| CsdmError::Filesystem(err.to_string()))
}

/// Moves `file` into `dir`, suffixing the name when the target already exists.
pub fn move_into(file: &Path, dir: &Path) -> Result<PathBuf, CsdmError> {
    fs::create_dir_all(dir).map_err(|err| CsdmError::Filesystem(err.to_string()))?;
    let name = file
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| CsdmError::Filesystem(format!("invalid file name {}", file.display())))?;
    let mut target = dir.join(name);
    let mut counter = 1usize;
    while target.exists() {
        target = dir.join(format!("{name}.{counter}"));
        counter += 1;
    }
    fs::rename(file, &target).map_err(|err| CsdmError::Filesystem(err.to_string()))?;
    Ok(target)
}

fn walk_dir(root: &Path) -> Result<Vec<PathBuf>, CsdmError> {
    let mut items = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(path) = stack.pop() {
        let entries = fs::read_dir(&path).map_err(|err| CsdmError::Filesystem(err.to_string()))?;
        for entry in entries {
            let entry = entry.map_err(|err| CsdmError::Filesystem(err.to_string()))?;
            let path = entry.path();
            if path.is_dir() {
                stack.push(path.clone());
            }
            items.push(path);
        }
    }
    Ok(items)
}
