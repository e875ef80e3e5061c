//! File-listing utility.

use clap::Parser;

use crate::fs::with_filesystem;
use crate::repl::interrupt_and_enter_repl;

use super::{GlobalOptions, HybridFilesystem, HybridPath};

/// List files and directories.
#[derive(Debug, Parser)]
pub struct LsCommand {
    /// The path to enumerate. Prefix with ':' for device paths.
    #[clap(default_value = ":/")]
    pub path: String,

    /// If given, show additional details about each file.
    #[clap(long, short)]
    pub long: bool,
}

impl LsCommand {
    pub fn run(self, global: GlobalOptions) -> anyhow::Result<()> {
        let path = HybridPath::parse(&self.path);
        if !path.is_remote() {
            eprintln!("warning: path not on device (i.e. starting with ':')");
        }

        let mut conn = global.connect()?;
        interrupt_and_enter_repl(conn.as_mut())?;
        with_filesystem(conn.as_mut(), |fs| -> anyhow::Result<()> {
            let mut hybrid = HybridFilesystem::new(fs);
            let (directories, files) = hybrid.ls(&path)?;

            let mut entries: Vec<(String, bool)> = directories
                .into_iter()
                .map(|name| (name, true))
                .chain(files.into_iter().map(|name| (name, false)))
                .collect();
            entries.sort();

            for (name, is_dir) in entries {
                let shown = if is_dir { format!("{name}/") } else { name.clone() };
                if self.long {
                    let size = if is_dir {
                        0
                    } else {
                        hybrid.file_len(&path.join(&name))?
                    };
                    println!("{size:8} {shown}");
                } else {
                    println!("{shown}");
                }
            }
            Ok(())
        })
    }
}
