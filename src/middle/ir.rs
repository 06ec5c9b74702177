//! The IR node set.
//!
//! A function body starts life as a flat `Vec<Op>` emitted by the builder,
//! gets partitioned into blocks by CFG construction, renamed by SSA
//! conversion, and finally lowered to machine instructions by the backend.
//! The enum is closed on purpose: every pass matches exhaustively, so adding
//! an op kind fails to compile until every pass handles it.

use std::collections::BTreeMap;

use crate::{
    index::simple_index,
    intern::InternedSymbol,
    middle::{cfg::BlockId, ty::BinOp, var::VarId},
};

simple_index! {
    /// Identifies a jump target in the linear IR
    pub struct LabelId;
}

/// Array reduction selector for [`Op::VectorOp`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reduce {
    Min,
    Max,
    Avg,
    Sum,
}

/// Label markers. Loop markers come in matched header/top pairs so loop
/// analysis can locate the canonical blocks of each source-level loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelKind {
    Plain,
    /// Placed just before the loop entry; loop-invariant code is hoisted to
    /// immediately after this marker.
    LoopHeader { pair: u32 },
    /// First label inside the loop (the `continue`/back-edge target for
    /// `while` loops).
    LoopTop { pair: u32 },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    /// Declaration marker; carries no value, always removable
    Define { var: VarId, line: u32 },
    Nop { line: u32 },
    /// dest := interned constant
    LoadConst { dest: VarId, src: VarId, line: u32 },
    /// dest := global (fetch into the local SSA world)
    Load { dest: VarId, global: VarId, line: u32 },
    /// global := src (store back out of the local SSA world)
    Store { global: VarId, src: VarId, line: u32 },
    Assign { dest: VarId, src: VarId, line: u32 },
    Binop {
        op: BinOp,
        /// Use Q16.16 multiply/divide rules
        fixed: bool,
        dest: VarId,
        lhs: VarId,
        rhs: VarId,
        line: u32,
    },
    /// Logical not: dest := (src == 0)
    Not { dest: VarId, src: VarId, line: u32 },
    /// i32 -> f16 (raw × 65536)
    IntToFixed { dest: VarId, src: VarId, line: u32 },
    /// f16 -> i32 (raw / 65536)
    FixedToInt { dest: VarId, src: VarId, line: u32 },
    /// dest := reduce(array[0..len])
    VectorOp {
        reduce: Reduce,
        dest: VarId,
        array: VarId,
        len: u32,
        line: u32,
    },
    /// array[0..len] := src (broadcast)
    VectorAssign {
        array: VarId,
        len: u32,
        src: VarId,
        line: u32,
    },
    Call {
        name: InternedSymbol,
        args: Vec<VarId>,
        dest: Option<VarId>,
        line: u32,
    },
    /// Call into the VM library (resolved through the link table at load)
    LibCall {
        name: InternedSymbol,
        args: Vec<VarId>,
        dest: Option<VarId>,
        line: u32,
    },
    Label { label: LabelId, kind: LabelKind, line: u32 },
    Branch {
        cond: VarId,
        positive: LabelId,
        negative: LabelId,
        line: u32,
    },
    Jump { target: LabelId, line: u32 },
    Return { value: Option<VarId>, line: u32 },
    /// dest := array[index]
    Index {
        dest: VarId,
        array: VarId,
        index: VarId,
        line: u32,
    },
    /// array[index] := src
    Lookup {
        array: VarId,
        index: VarId,
        src: VarId,
        line: u32,
    },
    /// dest := pixel buffer at index
    PixLoad { dest: VarId, index: VarId, line: u32 },
    /// pixel buffer at index := src
    PixStore { index: VarId, src: VarId, line: u32 },
    /// dest := database attribute `entry`
    DbLoad { dest: VarId, entry: u16, line: u32 },
    /// database attribute `entry` := src
    DbStore { entry: u16, src: VarId, line: u32 },
    /// SSA join: dest selects the value supplied by the arriving predecessor
    Phi {
        dest: VarId,
        sources: BTreeMap<BlockId, VarId>,
        line: u32,
    },
    /// Phi placeholder created while some predecessor was still unfilled;
    /// completed when the owning block is sealed
    IncompletePhi {
        dest: VarId,
        name: InternedSymbol,
        line: u32,
    },
    /// Halts the running function fatally when cond is zero
    Assert { cond: VarId, line: u32 },
}

impl Op {
    pub fn line(&self) -> u32 {
        match *self {
            Op::Define { line, .. }
            | Op::Nop { line }
            | Op::LoadConst { line, .. }
            | Op::Load { line, .. }
            | Op::Store { line, .. }
            | Op::Assign { line, .. }
            | Op::Binop { line, .. }
            | Op::Not { line, .. }
            | Op::IntToFixed { line, .. }
            | Op::FixedToInt { line, .. }
            | Op::VectorOp { line, .. }
            | Op::VectorAssign { line, .. }
            | Op::Call { line, .. }
            | Op::LibCall { line, .. }
            | Op::Label { line, .. }
            | Op::Branch { line, .. }
            | Op::Jump { line, .. }
            | Op::Return { line, .. }
            | Op::Index { line, .. }
            | Op::Lookup { line, .. }
            | Op::PixLoad { line, .. }
            | Op::PixStore { line, .. }
            | Op::DbLoad { line, .. }
            | Op::DbStore { line, .. }
            | Op::Phi { line, .. }
            | Op::IncompletePhi { line, .. }
            | Op::Assert { line, .. } => line,
        }
    }

    /// Variables this op reads. Constants and array bases are included;
    /// passes that only care about SSA values filter through
    /// [`crate::middle::var::VarTable::is_renamable`].
    pub fn inputs(&self) -> Vec<VarId> {
        match self {
            Op::Define { .. }
            | Op::Nop { .. }
            | Op::Label { .. }
            | Op::Jump { .. }
            | Op::DbLoad { .. }
            | Op::IncompletePhi { .. } => Vec::new(),
            Op::LoadConst { src, .. } => vec![*src],
            Op::Load { global, .. } => vec![*global],
            Op::Store { src, .. } => vec![*src],
            Op::Assign { src, .. } => vec![*src],
            Op::Binop { lhs, rhs, .. } => vec![*lhs, *rhs],
            Op::Not { src, .. }
            | Op::IntToFixed { src, .. }
            | Op::FixedToInt { src, .. } => vec![*src],
            Op::VectorOp { .. } => Vec::new(),
            Op::VectorAssign { src, .. } => vec![*src],
            Op::Call { args, .. } | Op::LibCall { args, .. } => args.clone(),
            Op::Branch { cond, .. } => vec![*cond],
            Op::Return { value, .. } => value.iter().copied().collect(),
            Op::Index { index, .. } => vec![*index],
            Op::Lookup { index, src, .. } => vec![*index, *src],
            Op::PixLoad { index, .. } => vec![*index],
            Op::PixStore { index, src, .. } => vec![*index, *src],
            Op::DbStore { src, .. } => vec![*src],
            Op::Phi { sources, .. } => sources.values().copied().collect(),
            Op::Assert { cond, .. } => vec![*cond],
        }
    }

    /// Variables this op defines
    pub fn outputs(&self) -> Vec<VarId> {
        match self {
            Op::LoadConst { dest, .. }
            | Op::Load { dest, .. }
            | Op::Assign { dest, .. }
            | Op::Binop { dest, .. }
            | Op::Not { dest, .. }
            | Op::IntToFixed { dest, .. }
            | Op::FixedToInt { dest, .. }
            | Op::VectorOp { dest, .. }
            | Op::Index { dest, .. }
            | Op::PixLoad { dest, .. }
            | Op::DbLoad { dest, .. }
            | Op::Phi { dest, .. }
            | Op::IncompletePhi { dest, .. } => vec![*dest],
            Op::Call { dest, .. } | Op::LibCall { dest, .. } => dest.iter().copied().collect(),
            Op::Define { .. }
            | Op::Nop { .. }
            | Op::Store { .. }
            | Op::VectorAssign { .. }
            | Op::Label { .. }
            | Op::Branch { .. }
            | Op::Jump { .. }
            | Op::Return { .. }
            | Op::Lookup { .. }
            | Op::PixStore { .. }
            | Op::DbStore { .. }
            | Op::Assert { .. } => Vec::new(),
        }
    }

    /// Rewrites every input occurrence of `from` to `to`
    pub fn replace_input(&mut self, from: VarId, to: VarId) {
        let patch = |v: &mut VarId| {
            if *v == from {
                *v = to;
            }
        };

        match self {
            Op::Define { .. }
            | Op::Nop { .. }
            | Op::Label { .. }
            | Op::Jump { .. }
            | Op::DbLoad { .. }
            | Op::IncompletePhi { .. } => {}
            Op::LoadConst { src, .. }
            | Op::Store { src, .. }
            | Op::Assign { src, .. }
            | Op::Not { src, .. }
            | Op::IntToFixed { src, .. }
            | Op::FixedToInt { src, .. }
            | Op::VectorAssign { src, .. }
            | Op::DbStore { src, .. } => patch(src),
            Op::Load { global, .. } => patch(global),
            Op::Binop { lhs, rhs, .. } => {
                patch(lhs);
                patch(rhs);
            }
            Op::VectorOp { .. } => {}
            Op::Call { args, .. } | Op::LibCall { args, .. } => args.iter_mut().for_each(patch),
            Op::Branch { cond, .. } | Op::Assert { cond, .. } => patch(cond),
            Op::Return { value, .. } => {
                if let Some(v) = value {
                    patch(v);
                }
            }
            Op::Index { index, .. } | Op::PixLoad { index, .. } => patch(index),
            Op::Lookup { index, src, .. } | Op::PixStore { index, src, .. } => {
                patch(index);
                patch(src);
            }
            Op::Phi { sources, .. } => sources.values_mut().for_each(patch),
        }
    }

    /// Rewrites every output occurrence of `from` to `to`
    pub fn replace_output(&mut self, from: VarId, to: VarId) {
        let patch = |v: &mut VarId| {
            if *v == from {
                *v = to;
            }
        };

        match self {
            Op::LoadConst { dest, .. }
            | Op::Load { dest, .. }
            | Op::Assign { dest, .. }
            | Op::Binop { dest, .. }
            | Op::Not { dest, .. }
            | Op::IntToFixed { dest, .. }
            | Op::FixedToInt { dest, .. }
            | Op::VectorOp { dest, .. }
            | Op::Index { dest, .. }
            | Op::PixLoad { dest, .. }
            | Op::DbLoad { dest, .. }
            | Op::Phi { dest, .. }
            | Op::IncompletePhi { dest, .. } => patch(dest),
            Op::Call { dest, .. } | Op::LibCall { dest, .. } => {
                if let Some(d) = dest {
                    patch(d);
                }
            }
            Op::Define { .. }
            | Op::Nop { .. }
            | Op::Store { .. }
            | Op::VectorAssign { .. }
            | Op::Label { .. }
            | Op::Branch { .. }
            | Op::Jump { .. }
            | Op::Return { .. }
            | Op::Lookup { .. }
            | Op::PixStore { .. }
            | Op::DbStore { .. }
            | Op::Assert { .. } => {}
        }
    }

    /// True for ops that must survive dead code elimination even when their
    /// outputs are unread
    pub fn has_side_effects(&self) -> bool {
        matches!(
            self,
            Op::Store { .. }
                | Op::VectorAssign { .. }
                | Op::Call { .. }
                | Op::LibCall { .. }
                | Op::Label { .. }
                | Op::Branch { .. }
                | Op::Jump { .. }
                | Op::Return { .. }
                | Op::Lookup { .. }
                | Op::PixStore { .. }
                | Op::DbStore { .. }
                | Op::Assert { .. }
        )
    }

    /// Nop-like markers are always eligible for removal
    pub fn is_nop(&self) -> bool {
        matches!(self, Op::Nop { .. } | Op::Define { .. })
    }

    /// True if this op ends a basic block
    pub fn is_terminator(&self) -> bool {
        matches!(self, Op::Branch { .. } | Op::Jump { .. } | Op::Return { .. })
    }

    /// Jump targets referenced by this op
    pub fn targets(&self) -> Vec<LabelId> {
        match self {
            Op::Branch {
                positive, negative, ..
            } => vec![*positive, *negative],
            Op::Jump { target, .. } => vec![*target],
            _ => Vec::new(),
        }
    }

    /// Repoints every jump target equal to `from` at `to`
    pub fn retarget(&mut self, from: LabelId, to: LabelId) {
        match self {
            Op::Branch {
                positive, negative, ..
            } => {
                if *positive == from {
                    *positive = to;
                }
                if *negative == from {
                    *negative = to;
                }
            }
            Op::Jump { target, .. } => {
                if *target == from {
                    *target = to;
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::Index;

    #[test]
    fn binop_reports_inputs_and_outputs() {
        let op = Op::Binop {
            op: BinOp::Add,
            fixed: false,
            dest: VarId::new(2),
            lhs: VarId::new(0),
            rhs: VarId::new(1),
            line: 3,
        };

        assert_eq!(op.inputs(), vec![VarId::new(0), VarId::new(1)]);
        assert_eq!(op.outputs(), vec![VarId::new(2)]);
        assert!(!op.has_side_effects());
        assert_eq!(op.line(), 3);
    }

    #[test]
    fn retarget_rewrites_both_branch_arms() {
        let mut op = Op::Branch {
            cond: VarId::new(0),
            positive: LabelId::new(1),
            negative: LabelId::new(2),
            line: 1,
        };
        op.retarget(LabelId::new(2), LabelId::new(7));
        assert_eq!(op.targets(), vec![LabelId::new(1), LabelId::new(7)]);
    }

    #[test]
    fn replace_input_leaves_outputs_alone() {
        let mut op = Op::Assign {
            dest: VarId::new(5),
            src: VarId::new(5),
            line: 1,
        };
        op.replace_input(VarId::new(5), VarId::new(9));
        assert_eq!(op.outputs(), vec![VarId::new(5)]);
        assert_eq!(op.inputs(), vec![VarId::new(9)]);
    }
}
