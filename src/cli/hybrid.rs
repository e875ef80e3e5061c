//! Routing of CLI paths to the host or the device.
//!
//! A leading `:` marks a device path; everything else is local. The prefix
//! is stripped here: the device facade itself never sees it.

use std::path::Path;

use fs_err as fs_host;

use crate::fs::{Filesystem, FsError, PathType};

/// A user-supplied path, routed to one side or the other.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HybridPath {
    Local(String),
    Remote(String),
}

impl HybridPath {
    /// Parse and normalise a CLI path: backslashes become slashes, a leading
    /// `:` selects the device, an empty path means the current directory and
    /// trailing slashes are dropped (except on a bare root).
    pub fn parse(raw: &str) -> HybridPath {
        // You can never be sure there aren't Windows users about...
        let raw = raw.replace('\\', "/");

        let (remote, mut path) = match raw.strip_prefix(':') {
            Some(stripped) => (true, stripped.to_string()),
            None => (false, raw),
        };

        if path.is_empty() {
            path = ".".to_string();
        }
        if path != "/" {
            path = path.trim_end_matches('/').to_string();
            if path.is_empty() {
                path = "/".to_string();
            }
        }

        if remote {
            HybridPath::Remote(path)
        } else {
            HybridPath::Local(path)
        }
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, HybridPath::Remote(_))
    }

    pub fn path(&self) -> &str {
        match self {
            HybridPath::Local(path) | HybridPath::Remote(path) => path,
        }
    }

    /// Re-attach the `:` prefix for display.
    pub fn display(&self) -> String {
        match self {
            HybridPath::Local(path) => path.clone(),
            HybridPath::Remote(path) => format!(":{path}"),
        }
    }

    /// Join a further relative component, keeping the routing.
    pub fn join(&self, name: &str) -> HybridPath {
        let joined = format!("{}/{name}", self.path().trim_end_matches('/'));
        match self {
            HybridPath::Local(_) => HybridPath::Local(joined),
            HybridPath::Remote(_) => HybridPath::Remote(joined),
        }
    }
}

/// A filesystem API spanning the host and the device: each operation
/// dispatches on the path's routing.
pub struct HybridFilesystem<'a> {
    fs: &'a mut dyn Filesystem,
}

impl<'a> HybridFilesystem<'a> {
    pub fn new(fs: &'a mut dyn Filesystem) -> HybridFilesystem<'a> {
        HybridFilesystem { fs }
    }

    pub fn get_type(&mut self, path: &HybridPath) -> Result<PathType, FsError> {
        match path {
            HybridPath::Remote(path) => self.fs.get_type(path),
            HybridPath::Local(path) => {
                let path = Path::new(path);
                Ok(if path.is_dir() {
                    PathType::Dir
                } else if path.exists() {
                    PathType::File
                } else {
                    PathType::Absent
                })
            }
        }
    }

    pub fn mkdir(
        &mut self,
        path: &HybridPath,
        parents: bool,
        exist_ok: bool,
    ) -> Result<(), FsError> {
        match path {
            HybridPath::Remote(path) => self.fs.mkdir(path, parents, exist_ok),
            HybridPath::Local(path) => {
                let path = Path::new(path);
                let result = if parents {
                    fs_host::create_dir_all(path)
                } else {
                    fs_host::create_dir(path)
                };
                match result {
                    Err(err)
                        if err.kind() == std::io::ErrorKind::AlreadyExists && exist_ok =>
                    {
                        Ok(())
                    }
                    other => Ok(other?),
                }
            }
        }
    }

    pub fn remove_recursive(&mut self, path: &HybridPath) -> Result<(), FsError> {
        match path {
            HybridPath::Remote(path) => self.fs.remove_recursive(path),
            HybridPath::Local(path) => {
                let path = Path::new(path);
                if path.is_file() {
                    fs_host::remove_file(path)?;
                } else {
                    fs_host::remove_dir_all(path)?;
                }
                Ok(())
            }
        }
    }

    pub fn ls(&mut self, path: &HybridPath) -> Result<(Vec<String>, Vec<String>), FsError> {
        match path {
            HybridPath::Remote(path) => self.fs.ls(path),
            HybridPath::Local(path) => {
                let mut dirs = Vec::new();
                let mut files = Vec::new();
                for entry in fs_host::read_dir(path)? {
                    let entry = entry?;
                    let name = entry.file_name().to_string_lossy().into_owned();
                    if entry.file_type()?.is_dir() {
                        dirs.push(name);
                    } else {
                        files.push(name);
                    }
                }
                Ok((dirs, files))
            }
        }
    }

    pub fn rename(&mut self, old: &HybridPath, new: &HybridPath) -> Result<(), FsError> {
        match (old, new) {
            (HybridPath::Remote(old), HybridPath::Remote(new)) => self.fs.rename(old, new),
            (HybridPath::Local(old), HybridPath::Local(new)) => Ok(fs_host::rename(old, new)?),
            _ => Err(FsError::Protocol(
                "cannot rename across the host/device boundary".to_string(),
            )),
        }
    }

    pub fn read_file(&mut self, path: &HybridPath) -> Result<Vec<u8>, FsError> {
        match path {
            HybridPath::Remote(path) => self.fs.read_file(path),
            HybridPath::Local(path) => Ok(fs_host::read(path)?),
        }
    }

    pub fn write_file(&mut self, path: &HybridPath, content: &[u8]) -> Result<(), FsError> {
        match path {
            HybridPath::Remote(path) => self.fs.write_file(path, content),
            HybridPath::Local(path) => Ok(fs_host::write(path, content)?),
        }
    }

    pub fn file_len(&mut self, path: &HybridPath) -> Result<u64, FsError> {
        match path {
            HybridPath::Remote(path) => self.fs.file_len(path),
            HybridPath::Local(path) => Ok(fs_host::metadata(path)?.len()),
        }
    }

    /// Flush both sides to storage.
    pub fn sync(&mut self) -> Result<(), FsError> {
        self.fs.sync()?;
        #[cfg(unix)]
        nix::unistd::sync();
        Ok(())
    }
}
