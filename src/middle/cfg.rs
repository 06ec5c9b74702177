//! Control flow graph formation.
//!
//! Partitions a function's flat op list into basic blocks. Leaders are the
//! first op, every label, and every op following a terminator. Fallthrough
//! between blocks is made explicit by splicing a jump to the following
//! label, so after construction every block ends in exactly one terminator
//! and edges can be read straight off it.

use std::collections::{BTreeMap, BTreeSet};

use hashbrown::HashMap;

use crate::{
    error::{CompileError, Result},
    index::{simple_index, Index},
    intern::InternedSymbol,
    middle::{
        ir::{LabelId, Op},
        var::VarId,
    },
};

simple_index! {
    /// Identifies a basic block within one function's CFG
    pub struct BlockId;
}

#[derive(Debug)]
pub struct Block {
    pub id: BlockId,
    /// The label this block answers to as a jump target
    pub label: LabelId,
    pub code: Vec<Op>,
    /// Phi nodes kept apart from the straight-line code until resolution;
    /// conceptually they execute at block entry, all at once
    pub phis: Vec<Op>,
    pub preds: BTreeSet<BlockId>,
    pub succs: Vec<BlockId>,
    /// All ops emitted; no further defs will appear in this block
    pub filled: bool,
    /// All predecessors known; incomplete phis can be completed
    pub sealed: bool,
    /// Current SSA definition of each source name within this block
    pub defs: HashMap<InternedSymbol, VarId>,
}

impl Block {
    fn new(id: BlockId, label: LabelId) -> Self {
        Self {
            id,
            label,
            code: Vec::new(),
            phis: Vec::new(),
            preds: BTreeSet::new(),
            succs: Vec::new(),
            filled: false,
            sealed: false,
            defs: HashMap::new(),
        }
    }

    pub fn terminator(&self) -> Result<&Op> {
        self.code
            .last()
            .filter(|op| op.is_terminator())
            .ok_or_else(|| {
                CompileError::internal(format!("block {:?} has no terminator", self.id))
            })
    }

    pub fn terminator_mut(&mut self) -> Result<&mut Op> {
        let id = self.id;
        self.code
            .last_mut()
            .filter(|op| op.is_terminator())
            .ok_or_else(|| CompileError::internal(format!("block {id:?} has no terminator")))
    }
}

#[derive(Debug)]
pub struct Cfg {
    pub blocks: BTreeMap<BlockId, Block>,
    pub entry: BlockId,
    /// Maps every label to the block it opens
    pub label_blocks: HashMap<LabelId, BlockId>,
    next_block: usize,
    next_label: usize,
}

impl std::ops::Index<BlockId> for Cfg {
    type Output = Block;

    fn index(&self, id: BlockId) -> &Block {
        &self.blocks[&id]
    }
}

impl std::ops::IndexMut<BlockId> for Cfg {
    fn index_mut(&mut self, id: BlockId) -> &mut Block {
        self.blocks.get_mut(&id).unwrap_or_else(|| {
            panic!("no block {id:?}");
        })
    }
}

impl Cfg {
    /// Partitions `code` into blocks and wires up the edges
    pub fn build(code: Vec<Op>) -> Result<Self> {
        let mut next_label = code
            .iter()
            .filter_map(|op| match op {
                Op::Label { label, .. } => Some(label.index() + 1),
                _ => None,
            })
            .max()
            .unwrap_or(0);

        // Chunk at leaders, giving each chunk a label. Chunks that do not
        // open with a label (the entry, dead code after a terminator) get a
        // fresh one so they can still be addressed uniformly.
        let mut chunks: Vec<(LabelId, Vec<Op>)> = Vec::new();
        let mut current: Vec<Op> = Vec::new();
        let mut current_label = LabelId::new(next_label);
        next_label += 1;

        let mut flush =
            |chunks: &mut Vec<(LabelId, Vec<Op>)>, label: LabelId, ops: Vec<Op>| {
                if !ops.is_empty() {
                    chunks.push((label, ops));
                }
            };

        for op in code {
            match op {
                Op::Label { label, .. } => {
                    // A label after straight-line code is a fallthrough edge
                    if !current.last().is_some_and(Op::is_terminator) && !current.is_empty() {
                        let line = current.last().map_or(0, Op::line);
                        current.push(Op::Jump {
                            target: label,
                            line,
                        });
                    }
                    flush(&mut chunks, current_label, std::mem::take(&mut current));
                    current_label = label;
                    current.push(op);
                }
                _ => {
                    let ends = op.is_terminator();
                    current.push(op);
                    if ends {
                        flush(&mut chunks, current_label, std::mem::take(&mut current));
                        current_label = LabelId::new(next_label);
                        next_label += 1;
                    }
                }
            }
        }

        // An empty leading chunk still needs a block so the entry exists
        if chunks.is_empty() || !current.is_empty() {
            flush(&mut chunks, current_label, current);
        }

        let mut blocks = BTreeMap::new();
        let mut label_blocks = HashMap::new();
        let mut next_block = 0;

        for (label, ops) in chunks {
            let id = BlockId::new(next_block);
            next_block += 1;
            let mut block = Block::new(id, label);
            block.code = ops;
            label_blocks.insert(label, id);
            blocks.insert(id, block);
        }

        let entry = BlockId::new(0);
        let mut cfg = Self {
            blocks,
            entry,
            label_blocks,
            next_block,
            next_label,
        };
        cfg.rebuild_edges()?;
        Ok(cfg)
    }

    /// Recomputes successor and predecessor sets from the terminators
    pub fn rebuild_edges(&mut self) -> Result<()> {
        let mut edges: Vec<(BlockId, Vec<BlockId>)> = Vec::new();
        for block in self.blocks.values() {
            let mut succs = Vec::new();
            for target in block.terminator()?.targets() {
                let to = self.block_of(target)?;
                succs.push(to);
            }
            edges.push((block.id, succs));
        }

        for block in self.blocks.values_mut() {
            block.preds.clear();
            block.succs.clear();
        }
        for (from, succs) in edges {
            for &to in &succs {
                if let Some(block) = self.blocks.get_mut(&to) {
                    block.preds.insert(from);
                }
            }
            if let Some(block) = self.blocks.get_mut(&from) {
                block.succs = succs;
            }
        }
        Ok(())
    }

    pub fn block_of(&self, label: LabelId) -> Result<BlockId> {
        self.label_blocks
            .get(&label)
            .copied()
            .ok_or_else(|| CompileError::internal(format!("jump to unknown label {label:?}")))
    }

    /// Allocates an empty block with a fresh label, outside of any edge
    pub fn create_block(&mut self) -> BlockId {
        let id = BlockId::new(self.next_block);
        self.next_block += 1;
        let label = LabelId::new(self.next_label);
        self.next_label += 1;

        let block = Block::new(id, label);
        self.label_blocks.insert(label, id);
        self.blocks.insert(id, block);
        id
    }

    pub fn ids(&self) -> Vec<BlockId> {
        self.blocks.keys().copied().collect()
    }

    /// Reverse postorder from the entry. Unreachable blocks are absent.
    pub fn reverse_postorder(&self) -> Vec<BlockId> {
        let mut visited = BTreeSet::new();
        let mut order = Vec::new();
        let mut stack = vec![(self.entry, 0usize)];
        visited.insert(self.entry);

        while let Some((id, next)) = stack.pop() {
            let succs = &self[id].succs;
            if next < succs.len() {
                let succ = succs[next];
                stack.push((id, next + 1));
                if visited.insert(succ) {
                    stack.push((succ, 0));
                }
            } else {
                order.push(id);
            }
        }

        order.reverse();
        order
    }

    /// Drops blocks with no path from the entry and prunes dangling edges
    pub fn remove_unreachable(&mut self) -> Result<()> {
        let reachable: BTreeSet<BlockId> = self.reverse_postorder().into_iter().collect();
        self.blocks.retain(|id, _| reachable.contains(id));
        self.label_blocks.retain(|_, id| reachable.contains(id));
        self.rebuild_edges()
    }
}
