//! Rendering a patch plan into device-side commands, and batching them.
//!
//! On the device the facade sets up single-letter aliases before a patch
//! runs: `w` writes to the output file, `r` reads from the input file, `s`
//! seeks the input file and `uh` is unhexlify. Each command is a short Python
//! statement built from those; batches of commands are joined with newlines
//! and executed in one round-trip each.

use super::diff::PatchOp;
use super::literal::bytes_to_evalable;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchCommand {
    /// The Python statement to run.
    pub text: String,
    /// How many bytes of file content this command writes.
    pub payload_len: usize,
}

/// Render a plan into the command stream carrying out the patch.
pub fn patch_commands(
    plan: &[PatchOp],
    new: &[u8],
    block_size: usize,
) -> Vec<PatchCommand> {
    let mut commands = Vec::new();
    // The device-side read cursor over the input file.
    let mut read_cursor = 0usize;

    for op in plan {
        match op {
            PatchOp::Equal { old, .. } => {
                if read_cursor != old.start {
                    commands.push(PatchCommand {
                        text: format!("s({})", old.start),
                        payload_len: 0,
                    });
                    read_cursor = old.start;
                }
                while read_cursor < old.end {
                    let count = block_size.min(old.end - read_cursor);
                    commands.push(PatchCommand {
                        text: format!("w(r({count}))"),
                        payload_len: count,
                    });
                    read_cursor += count;
                }
            }
            PatchOp::Insert { new: range } => {
                for chunk in new[range.clone()].chunks(block_size) {
                    commands.push(PatchCommand {
                        text: format!("w({})", bytes_to_evalable(chunk)),
                        payload_len: chunk.len(),
                    });
                }
            }
        }
    }

    commands
}

/// Concatenate commands (newline-separated) into batches bounded by a byte
/// budget and a command-count budget. A single command longer than the byte
/// budget still goes out, alone in its own batch.
pub fn batch_commands(
    commands: impl IntoIterator<Item = PatchCommand>,
    byte_budget: usize,
    command_budget: usize,
) -> Vec<String> {
    let mut batches = Vec::new();
    let mut current = String::new();
    let mut current_commands = 0usize;

    for command in commands {
        let would_be = if current.is_empty() {
            command.text.len()
        } else {
            current.len() + 1 + command.text.len()
        };
        if current_commands > 0 && (would_be > byte_budget || current_commands >= command_budget) {
            batches.push(std::mem::take(&mut current));
            current_commands = 0;
        }

        if !current.is_empty() {
            current.push('\n');
        }
        current.push_str(&command.text);
        current_commands += 1;
    }

    if !current.is_empty() {
        batches.push(current);
    }

    batches
}
