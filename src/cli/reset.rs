//! Soft-reset a device.

use clap::Parser;

use crate::repl::{expect, interrupt_and_enter_repl, soft_reset_directly_into_repl};

use super::GlobalOptions;

/// Soft-reset the device.
#[derive(Debug, Parser)]
pub struct ResetCommand {
    /// If given, force the device to reset into a REPL, without running
    /// main.py (if it exists).
    #[clap(long, short)]
    pub repl: bool,
}

impl ResetCommand {
    pub fn run(self, global: GlobalOptions) -> anyhow::Result<()> {
        let mut conn = global.connect()?;
        interrupt_and_enter_repl(conn.as_mut())?;
        if self.repl {
            soft_reset_directly_into_repl(conn.as_mut())?;
        } else {
            conn.write(b"\x04")?; // Ctrl+D
            expect(conn.as_mut(), b"\r\n")?;
        }
        Ok(())
    }
}
