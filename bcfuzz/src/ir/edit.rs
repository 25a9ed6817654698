//! Control-flow queries and the editing primitives every pass is built from.
//!
//! The primitives keep the bookkeeping consistent (owning block of moved
//! instructions, φ incoming blocks of successors) so that the passes only
//! have to reason about the shape of the graph they want.

use std::collections::HashMap;

use super::{Block, BlockId, DebugLoc, Function, Inst, InstId, InstKind, Terminator, Value};

/// Something that reads a value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum User {
    Inst(InstId),
    Term(BlockId),
}

impl Function {
    pub fn successors(&self, block: BlockId) -> Vec<BlockId> {
        self.block(block).term.successors()
    }

    /// One entry per incoming edge, in layout order. A block branching twice
    /// to the same target appears twice.
    pub fn predecessors(&self, block: BlockId) -> Vec<BlockId> {
        self.layout
            .iter()
            .flat_map(|pred| {
                self.successors(*pred)
                    .into_iter()
                    .filter(move |succ| *succ == block)
                    .map(move |_| *pred)
            })
            .collect()
    }

    /// [`Function::predecessors`] of every block, from a single walk of the
    /// layout. Blocks nothing branches to are absent.
    pub fn predecessor_map(&self) -> HashMap<BlockId, Vec<BlockId>> {
        let mut map: HashMap<BlockId, Vec<BlockId>> = HashMap::new();
        for &pred in &self.layout {
            for succ in self.successors(pred) {
                map.entry(succ).or_default().push(pred);
            }
        }
        map
    }

    /// The predecessor of `block` when exactly one edge enters it.
    pub fn single_predecessor(&self, block: BlockId) -> Option<BlockId> {
        let mut edges = self.layout.iter().flat_map(|pred| {
            self.block(*pred)
                .term
                .successors()
                .into_iter()
                .filter(move |succ| *succ == block)
                .map(move |_| *pred)
        });
        match (edges.next(), edges.next()) {
            (Some(pred), None) => Some(pred),
            _ => None,
        }
    }

    pub fn phis(&self, block: BlockId) -> Vec<InstId> {
        self.block(block)
            .insts
            .iter()
            .copied()
            .take_while(|inst| self.kind(*inst).is_phi())
            .collect()
    }

    /// Whether the first non-φ instruction of `block` is a landing pad.
    pub fn is_landing_pad(&self, block: BlockId) -> bool {
        self.block(block)
            .insts
            .iter()
            .find(|inst| !self.kind(**inst).is_phi())
            .is_some_and(|inst| matches!(self.kind(*inst), InstKind::LandingPad))
    }

    pub fn landing_pad_inst(&self, block: BlockId) -> Option<InstId> {
        self.block(block)
            .insts
            .iter()
            .copied()
            .find(|inst| matches!(self.kind(*inst), InstKind::LandingPad))
    }

    /// Index of the first position after φ-nodes and the landing pad.
    pub fn first_insertion_point(&self, block: BlockId) -> usize {
        self.block(block)
            .insts
            .iter()
            .take_while(|inst| {
                matches!(self.kind(**inst), InstKind::Phi { .. } | InstKind::LandingPad)
            })
            .count()
    }

    pub fn position(&self, inst: InstId) -> Option<(BlockId, usize)> {
        let block = self.inst(inst).block?;
        self.block(block)
            .insts
            .iter()
            .position(|id| *id == inst)
            .map(|pos| (block, pos))
    }

    /// Live instructions and terminators reading `inst`, in layout order.
    pub fn users(&self, inst: InstId) -> Vec<User> {
        let target = Value::Inst(inst);
        let mut users = Vec::new();
        for block in &self.layout {
            for id in &self.block(*block).insts {
                if self.kind(*id).operands().contains(&&target) {
                    users.push(User::Inst(*id));
                }
            }
            if self.block(*block).term.operands().contains(&&target) {
                users.push(User::Term(*block));
            }
        }
        users
    }

    /// Instruction users only.
    pub fn inst_users(&self, inst: InstId) -> Vec<InstId> {
        self.users(inst)
            .into_iter()
            .filter_map(|user| match user {
                User::Inst(id) => Some(id),
                User::Term(_) => None,
            })
            .collect()
    }

    /// Live instructions in layout order.
    pub fn live_insts(&self) -> Vec<InstId> {
        self.layout
            .iter()
            .flat_map(|block| self.block(*block).insts.iter().copied())
            .collect()
    }

    /// Appends a block after `after`, or at the end of the layout.
    pub fn add_block(&mut self, name: impl Into<String>, after: Option<BlockId>) -> BlockId {
        let id = self.alloc_block(name.into());
        let at = after
            .and_then(|after| self.layout.iter().position(|b| *b == after))
            .map_or(self.layout.len(), |pos| pos + 1);
        self.layout.insert(at, id);
        id
    }

    /// Inserts a block right before `before` in the layout.
    pub fn add_block_before(&mut self, name: impl Into<String>, before: BlockId) -> BlockId {
        let id = self.alloc_block(name.into());
        let at = self
            .layout
            .iter()
            .position(|b| *b == before)
            .unwrap_or(self.layout.len());
        self.layout.insert(at, id);
        id
    }

    fn alloc_block(&mut self, name: String) -> BlockId {
        self.blocks.push(Block {
            name,
            insts: Vec::new(),
            term: Terminator::Unreachable,
        });
        BlockId(self.blocks.len() as u32 - 1)
    }

    pub fn insert_inst(
        &mut self,
        block: BlockId,
        pos: usize,
        kind: InstKind,
        name: impl Into<String>,
        loc: Option<DebugLoc>,
    ) -> InstId {
        self.insts.push(Inst {
            kind,
            name: name.into(),
            loc,
            block: Some(block),
            split: false,
        });
        let id = InstId(self.insts.len() as u32 - 1);
        let insts = &mut self.block_mut(block).insts;
        let pos = pos.min(insts.len());
        insts.insert(pos, id);
        id
    }

    /// Appends an instruction at the end of `block`, before its terminator.
    pub fn push_inst(
        &mut self,
        block: BlockId,
        kind: InstKind,
        name: impl Into<String>,
        loc: Option<DebugLoc>,
    ) -> InstId {
        let end = self.block(block).insts.len();
        self.insert_inst(block, end, kind, name, loc)
    }

    pub fn set_terminator(&mut self, block: BlockId, term: Terminator) {
        self.block_mut(block).term = term;
    }

    /// Rewrites an instruction in place. Its identity, and so every use of
    /// it, is kept.
    pub fn replace_kind(&mut self, inst: InstId, kind: InstKind) {
        self.inst_mut(inst).kind = kind;
    }

    pub fn redirect_successor(&mut self, block: BlockId, index: usize, target: BlockId) {
        if let Some(slot) = self.block_mut(block).term.successor_mut(index) {
            *slot = target;
        }
    }

    /// Renames `from` to `to` in the incoming lists of the φ-nodes of `block`.
    pub fn replace_phi_incoming_block(&mut self, block: BlockId, from: BlockId, to: BlockId) {
        for phi in self.phis(block) {
            if let InstKind::Phi { incoming, .. } = &mut self.inst_mut(phi).kind {
                for (_, pred) in incoming.iter_mut().filter(|(_, pred)| *pred == from) {
                    *pred = to;
                }
            }
        }
    }

    /// Moves the instructions of `block` from `at` onwards, and its
    /// terminator, into a new block placed right after it. The old block
    /// falls through to the new one with an unconditional branch.
    pub fn split_block(&mut self, block: BlockId, at: usize, name: impl Into<String>) -> BlockId {
        let tail = self.add_block(name, Some(block));
        let moved: Vec<InstId> = {
            let insts = &mut self.block_mut(block).insts;
            let at = at.min(insts.len());
            insts.split_off(at)
        };
        for inst in &moved {
            self.inst_mut(*inst).block = Some(tail);
        }
        let term = std::mem::replace(&mut self.block_mut(block).term, Terminator::Br(tail));
        let successors = term.successors();
        self.block_mut(tail).insts = moved;
        self.block_mut(tail).term = term;
        for succ in successors {
            self.replace_phi_incoming_block(succ, block, tail);
        }
        tail
    }
}
