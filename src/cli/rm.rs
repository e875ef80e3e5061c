//! File deletion utility.

use clap::Parser;

use crate::fs::with_filesystem;
use crate::repl::interrupt_and_enter_repl;

use super::{GlobalOptions, HybridFilesystem, HybridPath};

/// Delete files and directories, recursively.
#[derive(Debug, Parser)]
pub struct RmCommand {
    /// The files or directories to delete. Acts recursively. Prefix with
    /// ':' for device paths.
    #[clap(required = true)]
    pub path: Vec<String>,
}

impl RmCommand {
    pub fn run(self, global: GlobalOptions) -> anyhow::Result<()> {
        let paths: Vec<HybridPath> = self.path.iter().map(|p| HybridPath::parse(p)).collect();
        if !paths.iter().any(HybridPath::is_remote) {
            eprintln!("warning: path not on device (i.e. starting with ':')");
        }

        let mut conn = global.connect()?;
        interrupt_and_enter_repl(conn.as_mut())?;
        with_filesystem(conn.as_mut(), |fs| -> anyhow::Result<()> {
            let mut hybrid = HybridFilesystem::new(fs);
            for path in &paths {
                hybrid.remove_recursive(path)?;
            }
            hybrid.sync()?;
            Ok(())
        })
    }
}
