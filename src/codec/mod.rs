//! Encoders and planners for the byte formats sent through the REPL.
//!
//! Everything here is pure: the facade decides what to run on the device,
//! these modules decide what the bytes on the wire look like.

pub mod diff;
pub mod literal;
pub mod patch;

use thiserror::Error;

pub use self::diff::{estimate_overheads, plan_update, Overheads, PatchOp};
pub use self::literal::{
    bytes_literal, bytes_to_evalable, parse_bytes_expr, parse_str_list, str_literal,
};
pub use self::patch::{batch_commands, patch_commands, PatchCommand};

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed literal from device: {0}")]
    Malformed(String),
}
