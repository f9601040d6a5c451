//! Basic-block discovery.
//!
//! One forward pass over the instruction stream collects every offset where
//! control can arrive other than by falling through: branch targets, the
//! instruction after a branch, switch table entries, `Catch` markers and
//! exception handler targets. The end of the function is recorded as a
//! sentinel so block `i` always spans `offsets[i]..offsets[i + 1]`.

use std::collections::BTreeSet;

use otter_hbc::opcode::{InstructionIter, Opcode};
use otter_hbc::{ExceptionHandlerInfo, Result};
use rustc_hash::FxHashMap;

/// Sorted block start offsets plus the reverse index.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BasicBlockMap {
    /// Block starts, ascending, ending with the function length.
    pub offsets: Vec<u32>,
    /// Offset → position in `offsets`.
    pub index_of: FxHashMap<u32, usize>,
}

impl BasicBlockMap {
    /// Number of real blocks (the end sentinel excluded).
    pub fn block_count(&self) -> usize {
        self.offsets.len().saturating_sub(1)
    }

    /// Block index that starts at `offset`.
    pub fn block_at(&self, offset: u32) -> Option<usize> {
        self.index_of.get(&offset).copied()
    }

    /// `[start, end)` of block `index`.
    pub fn range(&self, index: usize) -> Option<(u32, u32)> {
        Some((*self.offsets.get(index)?, *self.offsets.get(index + 1)?))
    }
}

/// Finds the basic blocks of `code`.
///
/// Malformed instruction streams are reported through the decoder's error
/// instead of producing a partial map.
pub fn discover_bb(code: &[u8], exception_table: &[ExceptionHandlerInfo]) -> Result<BasicBlockMap> {
    let mut starts = BTreeSet::new();
    starts.insert(0u32);

    for inst in InstructionIter::new(code) {
        let inst = inst?;
        if inst.opcode == Opcode::Catch {
            starts.insert(inst.offset);
        }
        if let Some(table) = inst.switch_table(code)? {
            starts.extend(table.targets.iter().copied());
            starts.insert(table.default_target);
            starts.insert(inst.next_offset);
        } else if inst.opcode.has_branch_operand() {
            starts.extend(inst.branch_targets());
            starts.insert(inst.next_offset);
        }
    }

    starts.insert(code.len() as u32);
    starts.extend(exception_table.iter().map(|eh| eh.target));

    let offsets: Vec<u32> = starts.into_iter().collect();
    let index_of = offsets.iter().enumerate().map(|(i, &off)| (off, i)).collect();
    Ok(BasicBlockMap { offsets, index_of })
}
