//! The interactive serial terminal command.

use clap::Parser;

use crate::terminal::{print_status, serial_terminal, TerminalOptions};

use super::GlobalOptions;

/// A serial terminal for MicroPython.
#[derive(Debug, Parser)]
pub struct TerminalCommand {
    #[clap(flatten)]
    pub options: TerminalArgs,
}

/// Terminal behaviour flags, shared with `sync --terminal`.
#[derive(Debug, Parser)]
pub struct TerminalArgs {
    /// If given, don't print instructions for exiting the terminal on
    /// startup.
    #[clap(long, short)]
    pub quiet: bool,

    /// If given, disable the automatic use of paste mode when multiple
    /// lines of text are pasted into the terminal.
    #[clap(long("no-automatic-paste-mode"), short = 'P')]
    pub no_automatic_paste_mode: bool,

    /// If given, disable emulation of the Ctrl+L (clear terminal) keyboard
    /// shortcut.
    #[clap(long("no-emulate-ctrl-l"), short = 'L')]
    pub no_emulate_ctrl_l: bool,
}

impl TerminalArgs {
    pub fn to_options(&self, color: termcolor::ColorChoice) -> TerminalOptions {
        TerminalOptions {
            automatic_paste_mode: !self.no_automatic_paste_mode,
            emulate_ctrl_l: !self.no_emulate_ctrl_l,
            color,
            ..TerminalOptions::default()
        }
    }
}

impl TerminalCommand {
    pub fn run(self, global: GlobalOptions) -> anyhow::Result<()> {
        let color: termcolor::ColorChoice = global.color.into();
        let mut conn = global.connect()?;

        if !self.options.quiet {
            print_status(color, "Press Ctrl+] to exit.")?;
        }

        serial_terminal(conn.as_mut(), &self.options.to_options(color))?;
        println!(); // Move to a new line on exit
        Ok(())
    }
}
