//! Filesystem access on a MicroPython device.
//!
//! [`Filesystem`] is the seam between everything that wants a remote
//! filesystem (the synchroniser, the CLI, the hybrid router) and the code
//! that provides one: [`DeviceFs`] drives a real device through the REPL,
//! while [`InMemoryFs`] is a drop-in stand-in for tests.

mod device;
mod in_memory;

use std::io;

use thiserror::Error;

use crate::codec::CodecError;
use crate::repl::ReplError;

pub use self::device::{with_filesystem, DeviceFs, DEFAULT_BLOCK_SIZE, DEFAULT_COMMAND_LIMIT};
pub use self::in_memory::InMemoryFs;

/// What a path on the device refers to. `Absent` is an answer, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathType {
    Absent,
    File,
    Dir,
}

impl PathType {
    pub fn is_file(self) -> bool {
        self == PathType::File
    }

    pub fn is_dir(self) -> bool {
        self == PathType::Dir
    }

    pub fn exists(self) -> bool {
        self != PathType::Absent
    }
}

#[derive(Debug, Error)]
pub enum FsError {
    /// The device raised an `OSError`; the message text is carried over.
    #[error("OSError: {0}")]
    Os(String),

    /// A safe-mode differential update failed its checksum comparison.
    #[error("update failed: {0}")]
    Update(String),

    /// The device printed something the facade cannot make sense of.
    #[error("unexpected response from device: {0}")]
    Protocol(String),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Repl(#[from] ReplError),

    /// Host-side I/O failure (local half of hybrid operations).
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// The operations the synchroniser and CLI need from a remote filesystem.
pub trait Filesystem {
    /// Classify a path. Absent paths are reported, not raised.
    fn get_type(&mut self, path: &str) -> Result<PathType, FsError>;

    /// Create a directory. With `parents`, missing intermediate directories
    /// are created too; with `exist_ok`, an existing directory is fine.
    fn mkdir(&mut self, path: &str, parents: bool, exist_ok: bool) -> Result<(), FsError>;

    /// Delete a file or directory tree, depth first.
    fn remove_recursive(&mut self, path: &str) -> Result<(), FsError>;

    /// List the directories and files (separately) at a path.
    fn ls(&mut self, path: &str) -> Result<(Vec<String>, Vec<String>), FsError>;

    fn rename(&mut self, old_path: &str, new_path: &str) -> Result<(), FsError>;

    fn read_file(&mut self, path: &str) -> Result<Vec<u8>, FsError>;

    fn write_file(&mut self, path: &str, content: &[u8]) -> Result<(), FsError>;

    /// Patch `path` (whose content is believed to be `old`) into `new` using
    /// a minimal diff. With `safe`, a checksum of the bytes actually reused
    /// from the device is verified before the result replaces the original.
    fn update_file(
        &mut self,
        path: &str,
        old: &[u8],
        new: &[u8],
        safe: bool,
    ) -> Result<(), FsError>;

    fn file_len(&mut self, path: &str) -> Result<u64, FsError>;

    /// Flush the device's filesystem to storage, where supported.
    fn sync(&mut self) -> Result<(), FsError>;
}

/// Convert a device traceback ending in an `OSError` into [`FsError::Os`].
/// Tracebacks for other exception types fall through to `Protocol`.
pub(crate) fn traceback_to_error(traceback: &str) -> FsError {
    let last_line = traceback.lines().last().unwrap_or("").trim_end();
    if let Some((exception, message)) = last_line.split_once(": ") {
        if exception == "OSError" {
            return FsError::Os(message.to_string());
        }
    }
    if last_line == "OSError" {
        return FsError::Os(String::new());
    }
    FsError::Protocol(traceback.to_string())
}
