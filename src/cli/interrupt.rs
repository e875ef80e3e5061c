//! Interrupt a device, returning the interpreter to the REPL.

use clap::Parser;

use crate::repl::interrupt_and_enter_repl;

use super::GlobalOptions;

/// Interrupt whatever the device is running and leave it at the REPL.
#[derive(Debug, Parser)]
pub struct InterruptCommand {}

impl InterruptCommand {
    pub fn run(self, global: GlobalOptions) -> anyhow::Result<()> {
        let mut conn = global.connect()?;
        interrupt_and_enter_repl(conn.as_mut())?;
        Ok(())
    }
}
