//! Efficiently synchronise a local directory to a device.

use std::collections::BTreeSet;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::bail;
use clap::Parser;

use crate::fs::{with_filesystem, Filesystem};
use crate::repl::{expect, interrupt_and_enter_repl};
use crate::sync::{default_exclude, sync_to_device, SyncOptions};
use crate::terminal::{print_status, serial_terminal, DEFAULT_EXIT_SEQUENCE};

use super::terminal::TerminalArgs;
use super::GlobalOptions;

/// Synchronise a local directory to the device. With `--terminal`, provides
/// an integrated serial terminal where Ctrl+R re-runs synchronisation.
#[derive(Debug, Parser)]
pub struct SyncCommand {
    /// Local directory to synchronise to the device.
    pub source: PathBuf,

    /// Location of the corresponding directory on the device. Must start
    /// with ':'. Note: existing files are updated but files deleted on the
    /// host are *not* automatically deleted on the device.
    #[clap(default_value = ":/")]
    pub destination: String,

    /// An rsync-style exclusion pattern for paths to be excluded from sync.
    /// May be used multiple times. Unless --no-default-exclusions is given,
    /// common temporary and version control files are excluded by default.
    #[clap(long)]
    pub exclude: Vec<String>,

    /// If given, don't exclude any temporary or version control files or
    /// directories by default.
    #[clap(long("no-default-exclusions"), short = 'E')]
    pub no_default_exclusions: bool,

    /// If given, always scan the device to check for missing files.
    #[clap(long("force-enumerate-files"), short = 'f')]
    pub force_enumerate_files: bool,

    /// If given, always verify that modified files on the device have been
    /// edited correctly. Only necessary if files may have been changed on
    /// the device behind the cache's back.
    #[clap(long("force-safe-update"), visible_alias = "safe", short = 's')]
    pub force_safe_update: bool,

    /// If given, reset the device after syncing (e.g. so modules are
    /// reloaded and new code runs). Otherwise the device is left at the
    /// REPL.
    #[clap(long, short = 'r')]
    pub reset: bool,

    /// If given, start the serial terminal after syncing. Synchronisation
    /// can be re-run at any time by pressing Ctrl+R.
    #[clap(long, short = 't')]
    pub terminal: bool,

    #[clap(flatten)]
    pub terminal_args: TerminalArgs,
}

const CTRL_R: &str = "\x12";

impl SyncCommand {
    pub fn run(self, global: GlobalOptions) -> anyhow::Result<()> {
        if self.source.to_string_lossy().starts_with(':') {
            bail!("source path must be on the host (i.e. not start with ':')");
        }
        let Some(device_dir) = self.destination.strip_prefix(':') else {
            bail!("destination path must be on the device (i.e. start with ':')");
        };

        let mut exclude = if self.no_default_exclusions {
            Vec::new()
        } else {
            default_exclude()
        };
        exclude.extend(self.exclude.iter().cloned());

        let options = SyncOptions {
            exclude,
            force_enumerate_files: self.force_enumerate_files,
            force_safe_update: self.force_safe_update,
        };

        let color: termcolor::ColorChoice = global.color.into();
        let quiet = self.terminal_args.quiet;
        let terminal_mode = self.terminal;
        let mut progress = move |path: &Path, _updating: &BTreeSet<PathBuf>, _all: &BTreeSet<PathBuf>| {
            if terminal_mode {
                let _ = print_status(color, &format!("    {}...", path.display()));
            } else {
                println!("{}...", path.display());
            }
        };

        let mut conn = global.connect()?;
        let mut first_run = true;
        loop {
            if self.terminal && !quiet {
                print_status(color, "Synchronising files:")?;
            }

            interrupt_and_enter_repl(conn.as_mut())?;
            with_filesystem(conn.as_mut(), |fs| -> anyhow::Result<()> {
                sync_to_device(
                    fs,
                    &self.source,
                    device_dir,
                    &options,
                    if quiet { None } else { Some(&mut progress) },
                )?;
                fs.sync()?;
                Ok(())
            })?;

            if !self.terminal {
                return Ok(());
            }

            if !quiet {
                print_status(color, "Done")?;
            }

            if self.reset {
                conn.write(b"\x04")?; // Ctrl+D: trigger a reset
            } else {
                conn.write(b"\r\n")?; // Force a prompt to be shown
            }
            expect(conn.as_mut(), b"\r\n")?;

            let mut terminal_options = self.terminal_args.to_options(color);
            terminal_options.exit_on =
                vec![DEFAULT_EXIT_SEQUENCE.to_string(), CTRL_R.to_string()];
            if first_run && !quiet {
                print_status(color, "Press Ctrl+R to re-run file sync, Ctrl+] to exit.")?;
            }

            let exit_sequence = serial_terminal(conn.as_mut(), &terminal_options)?;
            if exit_sequence != CTRL_R {
                return Ok(());
            }
            first_run = false;

            let interrupt_message = interrupt_and_enter_repl(conn.as_mut())?;
            if !interrupt_message.is_empty() {
                let mut stdout = std::io::stdout();
                stdout.write_all(&interrupt_message)?;
                stdout.write_all(b"\n")?;
                stdout.flush()?;
            }
        }
    }
}
