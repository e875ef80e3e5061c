//! Directory creation utility.

use clap::Parser;

use crate::fs::with_filesystem;
use crate::repl::interrupt_and_enter_repl;

use super::{GlobalOptions, HybridFilesystem, HybridPath};

/// Create directories.
#[derive(Debug, Parser)]
pub struct MkdirCommand {
    /// The directories to create. Prefix with ':' for device paths.
    #[clap(required = true)]
    pub path: Vec<String>,

    /// If given, create parent directories too and don't throw an error if
    /// the directory already exists.
    #[clap(long, short)]
    pub parents: bool,
}

impl MkdirCommand {
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
                hybrid.mkdir(path, self.parents, self.parents)?;
            }
            hybrid.sync()?;
            Ok(())
        })
    }
}
