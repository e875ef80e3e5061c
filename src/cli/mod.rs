//! Defines upyt's CLI through clap types.

mod cat;
mod cp;
mod hybrid;
mod interrupt;
mod ls;
mod mkdir;
mod reset;
mod rm;
mod sync;
mod terminal;

use std::str::FromStr;

use anyhow::Context;
use clap::Parser;
use thiserror::Error;

pub use self::cat::CatCommand;
pub use self::cp::CpCommand;
pub use self::hybrid::{HybridFilesystem, HybridPath};
pub use self::interrupt::InterruptCommand;
pub use self::ls::LsCommand;
pub use self::mkdir::MkdirCommand;
pub use self::reset::ResetCommand;
pub use self::rm::RmCommand;
pub use self::sync::SyncCommand;
pub use self::terminal::TerminalCommand;

use crate::connection::{self, Connection};

/// Command line options that upyt accepts, defined using the clap crate.
#[derive(Debug, Parser)]
#[clap(name = "upyt", version, about)]
pub struct Options {
    #[clap(flatten)]
    pub global: GlobalOptions,

    /// Subcommand to run in this invocation.
    #[clap(subcommand)]
    pub subcommand: Subcommand,
}

impl Options {
    pub fn run(self) -> anyhow::Result<()> {
        match self.subcommand {
            Subcommand::Terminal(subcommand) => subcommand.run(self.global),
            Subcommand::Sync(subcommand) => subcommand.run(self.global),
            Subcommand::Cp(subcommand) => subcommand.run(self.global),
            Subcommand::Ls(subcommand) => subcommand.run(self.global),
            Subcommand::Cat(subcommand) => subcommand.run(self.global),
            Subcommand::Mkdir(subcommand) => subcommand.run(self.global),
            Subcommand::Rm(subcommand) => subcommand.run(self.global),
            Subcommand::Reset(subcommand) => subcommand.run(self.global),
            Subcommand::Interrupt(subcommand) => subcommand.run(self.global),
        }
    }
}

#[derive(Debug, Parser)]
pub struct GlobalOptions {
    /// Sets verbosity level. Can be specified multiple times.
    #[clap(long("verbose"), short, global(true), action = clap::ArgAction::Count)]
    pub verbosity: u8,

    /// Set color behavior. Valid values are auto, always, and never.
    #[clap(long("color"), global(true), default_value("auto"))]
    pub color: ColorChoice,

    /// Device to connect to, e.g. `/dev/ttyACM0`, `/dev/ttyACM0:115200` or
    /// `ws://192.168.4.1/?password`. Defaults to the value of the
    /// UPYT_DEVICE environment variable, required otherwise.
    #[clap(long("device"), short('d'), global(true), env("UPYT_DEVICE"))]
    pub device: Option<String>,
}

impl GlobalOptions {
    /// Open a connection to the configured device.
    pub fn connect(&self) -> anyhow::Result<Box<dyn Connection>> {
        let device = self
            .device
            .as_deref()
            .context("--device is required if UPYT_DEVICE is not set")?;
        Ok(connection::from_specification(device)
            .with_context(|| format!("failed to connect to {device}"))?)
    }
}

#[derive(Debug, Clone, Copy)]
pub enum ColorChoice {
    Auto,
    Always,
    Never,
}

impl FromStr for ColorChoice {
    type Err = ColorChoiceParseError;

    fn from_str(source: &str) -> Result<Self, Self::Err> {
        match source {
            "auto" => Ok(ColorChoice::Auto),
            "always" => Ok(ColorChoice::Always),
            "never" => Ok(ColorChoice::Never),
            _ => Err(ColorChoiceParseError {
                attempted: source.to_owned(),
            }),
        }
    }
}

impl From<ColorChoice> for termcolor::ColorChoice {
    fn from(value: ColorChoice) -> Self {
        match value {
            ColorChoice::Auto => termcolor::ColorChoice::Auto,
            ColorChoice::Always => termcolor::ColorChoice::Always,
            ColorChoice::Never => termcolor::ColorChoice::Never,
        }
    }
}

#[derive(Debug, Error)]
#[error("Invalid color choice '{attempted}'. Valid values are: auto, always, never")]
pub struct ColorChoiceParseError {
    attempted: String,
}

#[derive(Debug, Parser)]
pub enum Subcommand {
    /// A serial terminal for MicroPython.
    #[clap(alias = "t", alias = "term")]
    Terminal(TerminalCommand),
    Sync(SyncCommand),
    Cp(CpCommand),
    Ls(LsCommand),
    Cat(CatCommand),
    Mkdir(MkdirCommand),
    Rm(RmCommand),
    Reset(ResetCommand),
    Interrupt(InterruptCommand),
}
