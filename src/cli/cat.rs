//! File reading utility.

use std::io::Write;

use clap::Parser;

use crate::fs::with_filesystem;
use crate::repl::interrupt_and_enter_repl;

use super::{GlobalOptions, HybridFilesystem, HybridPath};

/// Print the contents of files.
#[derive(Debug, Parser)]
pub struct CatCommand {
    /// The files to read. Prefix with ':' for device paths.
    #[clap(required = true)]
    pub path: Vec<String>,
}

impl CatCommand {
    pub fn run(self, global: GlobalOptions) -> anyhow::Result<()> {
        let paths: Vec<HybridPath> = self.path.iter().map(|p| HybridPath::parse(p)).collect();
        if !paths.iter().any(HybridPath::is_remote) {
            eprintln!("warning: path not on device (i.e. starting with ':')");
        }

        let mut conn = global.connect()?;
        interrupt_and_enter_repl(conn.as_mut())?;
        with_filesystem(conn.as_mut(), |fs| -> anyhow::Result<()> {
            let mut hybrid = HybridFilesystem::new(fs);
            let stdout = std::io::stdout();
            let mut stdout = stdout.lock();
            for path in &paths {
                let content = hybrid.read_file(path)?;
                stdout.write_all(&content)?;
            }
            stdout.flush()?;
            Ok(())
        })
    }
}
