//! Comparison decomposition.
//!
//! Rewrites comparisons into chains of narrower comparisons joined by
//! control flow, so that each partial match shows up as its own edge in the
//! coverage map. Three rewrites run in order:
//!
//! 1. [`select`] turns `select` instructions into branches and a φ-node.
//! 2. [`compare`] simplifies and halves integer comparisons down to bytes,
//!    recording compared constants into the dictionary on the way.
//! 3. [`strcmp`] unrolls string and memory comparison calls with a known
//!    length into a per-byte chain.
//!
//! Every rewrite splits the block at the original instruction and turns
//! that instruction into the φ-node joining the chain, so all of its uses
//! follow without being rewritten.

pub mod compare;
pub mod select;
pub mod strcmp;

pub use compare::{CompareStats, decompose_compares};
pub use select::lower_selects;
pub use strcmp::{StrcmpStats, decompose_string_compares};

use crate::ir::{BlockId, DebugLoc, Function, InstId, InstKind, Value};

/// Appends instructions to blocks of one function, naming them under a
/// common prefix and giving them the debug location of the instruction
/// being rewritten.
pub(crate) struct Emitter<'f> {
    pub func: &'f mut Function,
    prefix: String,
    loc: Option<DebugLoc>,
}

impl<'f> Emitter<'f> {
    pub fn new(func: &'f mut Function, prefix: impl Into<String>, origin: InstId) -> Self {
        let loc = func.inst(origin).loc.clone();
        Self {
            func,
            prefix: prefix.into(),
            loc,
        }
    }

    pub fn name(&self, suffix: &str) -> String {
        format!("{}{suffix}", self.prefix)
    }

    pub fn emit(&mut self, block: BlockId, kind: InstKind, suffix: &str) -> Value {
        let name = self.name(suffix);
        Value::Inst(self.func.push_inst(block, kind, name, self.loc.clone()))
    }

    pub fn block_before(&mut self, suffix: &str, before: BlockId) -> BlockId {
        let name = self.name(suffix);
        self.func.add_block_before(name, before)
    }

    /// Splits the block holding `inst` so that `inst` leads a new block.
    /// Returns the head and the tail.
    pub fn split_at(&mut self, inst: InstId, suffix: &str) -> Option<(BlockId, BlockId)> {
        let (block, pos) = self.func.position(inst)?;
        let name = self.name(suffix);
        let tail = self.func.split_block(block, pos, name);
        Some((block, tail))
    }
}
