pub mod cli;
pub mod codec;
pub mod connection;
pub mod fs;
pub mod glob;
pub mod logging;
pub mod repl;
pub mod sync;

#[cfg(unix)]
pub mod terminal;

#[cfg(test)]
pub(crate) mod testing;

pub use connection::{Connection, ConnectionError};
pub use fs::{with_filesystem, DeviceFs, Filesystem, FsError, InMemoryFs, PathType};
pub use repl::{
    interrupt_and_enter_repl, raw_mode, raw_paste_exec, soft_reset_directly_into_repl, ReplError,
};
pub use sync::{sync_to_device, SyncError, SyncOptions};
