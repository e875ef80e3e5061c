//! An in-memory [`Filesystem`] backend.
//!
//! Behaves like a device filesystem rooted at `/`, including the failure
//! modes the synchroniser leans on (`OSError` for missing paths, checksum
//! mismatches from safe differential updates). Exists so that logic built on
//! the [`Filesystem`] trait can be exercised without hardware.

use std::collections::{BTreeMap, BTreeSet};

use sha2::{Digest, Sha256};

use crate::codec::{estimate_overheads, plan_update, PatchOp};

use super::{Filesystem, FsError, PathType, DEFAULT_BLOCK_SIZE};

#[derive(Default)]
pub struct InMemoryFs {
    dirs: BTreeSet<String>,
    files: BTreeMap<String, Vec<u8>>,
}

fn normalize(path: &str) -> String {
    let parts: Vec<&str> = path.split('/').filter(|part| !part.is_empty()).collect();
    format!("/{}", parts.join("/"))
}

fn parent(path: &str) -> String {
    match path.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(index) => path[..index].to_string(),
    }
}

fn enoent(path: &str) -> FsError {
    FsError::Os(format!("[Errno 2] ENOENT: {path}"))
}

impl InMemoryFs {
    pub fn new() -> InMemoryFs {
        InMemoryFs::default()
    }

    fn is_dir(&self, path: &str) -> bool {
        path == "/" || self.dirs.contains(path)
    }

    fn classify(&self, path: &str) -> PathType {
        let path = normalize(path);
        if self.is_dir(&path) {
            PathType::Dir
        } else if self.files.contains_key(&path) {
            PathType::File
        } else {
            PathType::Absent
        }
    }
}

impl Filesystem for InMemoryFs {
    fn get_type(&mut self, path: &str) -> Result<PathType, FsError> {
        Ok(self.classify(path))
    }

    fn mkdir(&mut self, path: &str, parents: bool, exist_ok: bool) -> Result<(), FsError> {
        let path = normalize(path);

        if parents {
            let mut missing = Vec::new();
            let mut dir = parent(&path);
            while dir != "/" && !self.is_dir(&dir) {
                missing.push(dir.clone());
                dir = parent(&dir);
            }
            for dir in missing.into_iter().rev() {
                self.dirs.insert(dir);
            }
        }

        if self.is_dir(&path) {
            if exist_ok {
                return Ok(());
            }
            return Err(FsError::Os(format!("[Errno 17] EEXIST: {path}")));
        }
        if self.files.contains_key(&path) {
            return Err(FsError::Os(format!("[Errno 17] EEXIST: {path}")));
        }
        if !self.is_dir(&parent(&path)) {
            return Err(enoent(&parent(&path)));
        }
        self.dirs.insert(path);
        Ok(())
    }

    fn remove_recursive(&mut self, path: &str) -> Result<(), FsError> {
        let path = normalize(path);
        if !self.is_dir(&path) && !self.files.contains_key(&path) {
            return Err(enoent(&path));
        }
        let prefix = format!("{path}/");
        self.files
            .retain(|name, _| name != &path && !name.starts_with(&prefix));
        self.dirs
            .retain(|name| name != &path && !name.starts_with(&prefix));
        Ok(())
    }

    fn ls(&mut self, path: &str) -> Result<(Vec<String>, Vec<String>), FsError> {
        let path = normalize(path);
        if !self.is_dir(&path) {
            return Err(enoent(&path));
        }

        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{path}/")
        };
        let immediate = |full: &str| -> Option<String> {
            let rest = full.strip_prefix(&prefix)?;
            (!rest.is_empty() && !rest.contains('/')).then(|| rest.to_string())
        };

        let dirs = self.dirs.iter().filter_map(|dir| immediate(dir)).collect();
        let files = self.files.keys().filter_map(|file| immediate(file)).collect();
        Ok((dirs, files))
    }

    fn rename(&mut self, old_path: &str, new_path: &str) -> Result<(), FsError> {
        let from = normalize(old_path);
        let to = normalize(new_path);
        if let Some(content) = self.files.remove(&from) {
            self.files.insert(to, content);
            Ok(())
        } else if self.dirs.remove(&from) {
            self.dirs.insert(to);
            Ok(())
        } else {
            Err(enoent(&from))
        }
    }

    fn read_file(&mut self, path: &str) -> Result<Vec<u8>, FsError> {
        let path = normalize(path);
        if self.is_dir(&path) {
            return Err(FsError::Os(format!("[Errno 21] EISDIR: {path}")));
        }
        self.files.get(&path).cloned().ok_or_else(|| enoent(&path))
    }

    fn write_file(&mut self, path: &str, content: &[u8]) -> Result<(), FsError> {
        let path = normalize(path);
        if self.is_dir(&path) {
            return Err(FsError::Os(format!("[Errno 21] EISDIR: {path}")));
        }
        if !self.is_dir(&parent(&path)) {
            return Err(enoent(&parent(&path)));
        }
        self.files.insert(path, content.to_vec());
        Ok(())
    }

    fn update_file(
        &mut self,
        path: &str,
        old: &[u8],
        new: &[u8],
        safe: bool,
    ) -> Result<(), FsError> {
        let key = normalize(path);
        let stored = self.files.get(&key).cloned().ok_or_else(|| enoent(&key))?;

        let overheads = estimate_overheads(old, new, DEFAULT_BLOCK_SIZE);
        let plan = plan_update(old, new, overheads);

        // What the device would read from its copy: the planned ranges,
        // clamped to the file it actually has.
        let read_range = |range: &std::ops::Range<usize>| {
            let start = range.start.min(stored.len());
            let end = range.end.min(stored.len());
            &stored[start..end]
        };

        if safe {
            let mut expected = Sha256::new();
            let mut actual = Sha256::new();
            for op in &plan {
                if let PatchOp::Equal { old: range, .. } = op {
                    expected.update(&old[range.clone()]);
                    actual.update(read_range(range));
                }
            }
            if expected.finalize() != actual.finalize() {
                return Err(FsError::Update(format!(
                    "content of {path} does not match the expected old content"
                )));
            }
        }

        let mut result = Vec::with_capacity(new.len());
        for op in &plan {
            match op {
                PatchOp::Insert { new: range } => result.extend_from_slice(&new[range.clone()]),
                PatchOp::Equal { old: range, .. } => result.extend_from_slice(read_range(range)),
            }
        }
        self.files.insert(key, result);
        Ok(())
    }

    fn file_len(&mut self, path: &str) -> Result<u64, FsError> {
        let path = normalize(path);
        self.files
            .get(&path)
            .map(|content| content.len() as u64)
            .ok_or_else(|| enoent(&path))
    }

    fn sync(&mut self) -> Result<(), FsError> {
        Ok(())
    }
}
