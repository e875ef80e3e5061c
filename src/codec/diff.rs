//! Planner for differential file updates.
//!
//! Produces an ordered list of patch operations over an (old, new) pair of
//! byte strings: `Insert` emits literal bytes from the new file, `Equal`
//! copies a range from the old file already on the device. Any old range not
//! covered by an `Equal` is implicitly deleted. Concatenating the output of
//! every operation in order yields exactly the new file.
//!
//! The savings live in the post-processing: an `Equal` only pays off when the
//! span is longer than the read command (plus a seek, when the read cursor is
//! not already positioned at its start) needed to copy it. Shorter matches
//! are folded into the surrounding literals.

use std::ops::Range;

use similar::{capture_diff_slices, Algorithm, DiffOp};

use super::literal::{bytes_literal, hex_encoded_len};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchOp {
    /// Emit `new[range]` as literal bytes.
    Insert { new: Range<usize> },
    /// Copy `old[old_range]` from the old file. The same bytes appear at
    /// `new_range` in the new file.
    Equal {
        old: Range<usize>,
        new: Range<usize>,
    },
}

/// Character costs of the commands an `Equal` needs, used to decide when a
/// match is too short to bother with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Overheads {
    /// Cost of one read+write command.
    pub equal: usize,
    /// Additional cost when the input file must seek first.
    pub seek: usize,
}

/// Estimate command overheads for a given update.
///
/// The base costs are the lengths of representative commands. When the head
/// of the new file looks like it will be sent hex-encoded, every literal byte
/// costs two characters on the wire, so command overheads are worth half as
/// many bytes.
pub fn estimate_overheads(old: &[u8], new: &[u8], block_size: usize) -> Overheads {
    let head = &new[..new.len().min(block_size)];
    let mostly_hex = hex_encoded_len(head.len()) < bytes_literal(head).len();

    let equal = "w(r(9))\n".len();
    let seek = format!("s({})\n", old.len() / 2).len();

    if mostly_hex {
        Overheads {
            equal: equal / 2,
            seek: seek / 2,
        }
    } else {
        Overheads { equal, seek }
    }
}

/// Plan a patch turning `old` into `new`.
pub fn plan_update(old: &[u8], new: &[u8], overheads: Overheads) -> Vec<PatchOp> {
    let ops = capture_diff_slices(Algorithm::Myers, old, new);

    let mut plan: Vec<PatchOp> = Vec::new();
    // Where the device's read cursor over the old file will be once the plan
    // so far has run.
    let mut read_cursor = 0usize;

    for op in ops {
        match op {
            // Deleted old ranges are skipped by the next seek.
            DiffOp::Delete { .. } => (),
            DiffOp::Insert {
                new_index, new_len, ..
            }
            | DiffOp::Replace {
                new_index, new_len, ..
            } => push_insert(&mut plan, new_index..new_index + new_len),
            DiffOp::Equal {
                old_index,
                new_index,
                len,
            } => {
                let mut cost = overheads.equal;
                if read_cursor != old_index {
                    cost += overheads.seek;
                }
                if len < cost {
                    // Too short to pay for its commands: fold into the
                    // neighbouring literals instead. (At equal cost the
                    // Equal wins: those bytes are never transferred.)
                    push_insert(&mut plan, new_index..new_index + len);
                } else {
                    plan.push(PatchOp::Equal {
                        old: old_index..old_index + len,
                        new: new_index..new_index + len,
                    });
                    read_cursor = old_index + len;
                }
            }
        }
    }

    plan
}

/// Append an insert, coalescing with an adjacent preceding insert.
fn push_insert(plan: &mut Vec<PatchOp>, range: Range<usize>) {
    if range.is_empty() {
        return;
    }
    if let Some(PatchOp::Insert { new }) = plan.last_mut() {
        if new.end == range.start {
            new.end = range.end;
            return;
        }
    }
    plan.push(PatchOp::Insert { new: range });
}

/// Apply a plan, reading `Equal` ranges back out of `old`.
pub fn apply_plan(plan: &[PatchOp], old: &[u8], new: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(new.len());
    for op in plan {
        match op {
            PatchOp::Insert { new: range } => out.extend_from_slice(&new[range.clone()]),
            PatchOp::Equal { old: range, .. } => out.extend_from_slice(&old[range.clone()]),
        }
    }
    out
}
