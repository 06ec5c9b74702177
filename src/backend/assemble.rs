//! Two-stage assembly.
//!
//! Lowering first produces a stream of [`Item`]s: machine instructions
//! whose jump and call targets are still symbolic [`Operand::Label`] /
//! [`Operand::Function`] references, interleaved with zero-width label and
//! function markers. Because every instruction is exactly 4 bytes wide
//! whether or not its operands are resolved, offsets can be computed in one
//! walk and patched in a second without anything moving.

use std::collections::BTreeMap;

use hashbrown::HashMap;

use crate::{
    error::{CompileError, Result},
    intern::InternedSymbol,
    middle::{
        ir::{LabelId, Op, Reduce},
        ty::BinOp,
        CompiledFunction, CompiledProgram,
    },
};

use super::{
    isa::{Instr, Opcode, RV},
    Layout,
};

/// Width of one encoded instruction in bytes
pub const INSTRUCTION_BYTES: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    None,
    Regs { b: u8, c: u8 },
    Imm(i16),
    Slot(u16),
    /// Unresolved jump target within the current function
    Label(LabelId),
    /// Unresolved call target
    Function(InternedSymbol),
}

/// An instruction whose wide operand may still be symbolic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Draft {
    pub opcode: Opcode,
    pub a: u8,
    pub operand: Operand,
}

impl Draft {
    fn new(opcode: Opcode, a: u8, operand: Operand) -> Self {
        Self { opcode, a, operand }
    }

    fn finish(self) -> Result<Instr> {
        let [b, c] = match self.operand {
            Operand::None => [0, 0],
            Operand::Regs { b, c } => [b, c],
            Operand::Imm(imm) => (imm as u16).to_le_bytes(),
            Operand::Slot(slot) => slot.to_le_bytes(),
            Operand::Label(label) => {
                return Err(CompileError::internal(format!(
                    "unresolved label {label:?} survived assembly"
                )))
            }
            Operand::Function(name) => {
                return Err(CompileError::internal(format!(
                    "unresolved call to '{name}' survived assembly"
                )))
            }
        };
        Ok(Instr {
            opcode: self.opcode,
            a: self.a,
            b,
            c,
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub enum Item {
    Instr(Draft),
    /// Zero-width jump target marker, scoped to the enclosing function
    Label(LabelId),
    /// Zero-width function start marker; opens a fresh label scope
    Func(InternedSymbol),
}

/// Lowers every function of the program to draft items, in program order
pub fn lower(program: &CompiledProgram, layout: &Layout) -> Result<Vec<Item>> {
    let mut items = Vec::new();
    for function in &program.functions {
        items.push(Item::Func(function.name));
        lower_function(function, program, layout, &mut items)?;
    }
    Ok(items)
}

fn lower_function(
    function: &CompiledFunction,
    program: &CompiledProgram,
    layout: &Layout,
    items: &mut Vec<Item>,
) -> Result<()> {
    let cfg = &function.cfg;
    let vars = &program.vars;
    let me = function.name;

    // Jumps may still target labels merged away by block merging; route
    // every target through the canonical label of the block it lands in.
    let canonical = |label: LabelId| -> Result<LabelId> {
        Ok(cfg[cfg.block_of(label)?].label)
    };
    let reg = |id| layout.register(vars, me, id);

    for block in cfg.blocks.values() {
        items.push(Item::Label(block.label));

        for op in &block.code {
            match *op {
                Op::Define { .. } | Op::Nop { .. } | Op::Label { .. } => {}
                Op::LoadConst { dest, src, .. } => {
                    let raw = vars.holds_const(src).ok_or_else(|| {
                        CompileError::internal("constant pool entry lost its value")
                    })?;
                    let draft = match i16::try_from(raw) {
                        Ok(imm) => Draft::new(Opcode::LoadImm, reg(dest)?, Operand::Imm(imm)),
                        Err(_) => {
                            Draft::new(Opcode::LoadMem, reg(dest)?, Operand::Slot(layout.pool_slot(src)?))
                        }
                    };
                    items.push(Item::Instr(draft));
                }
                Op::Load { dest, global, .. } => {
                    items.push(mov(reg(dest)?, layout.global_register(global)?));
                }
                Op::Store { global, src, .. } => {
                    items.push(mov(layout.global_register(global)?, reg(src)?));
                }
                Op::Assign { dest, src, .. } => {
                    items.push(mov(reg(dest)?, reg(src)?));
                }
                Op::Binop {
                    op,
                    fixed,
                    dest,
                    lhs,
                    rhs,
                    ..
                } => {
                    items.push(Item::Instr(Draft::new(
                        binop_opcode(op, fixed)?,
                        reg(dest)?,
                        Operand::Regs {
                            b: reg(lhs)?,
                            c: reg(rhs)?,
                        },
                    )));
                }
                Op::Not { dest, src, .. } => {
                    items.push(unary(Opcode::Not, reg(dest)?, reg(src)?));
                }
                Op::IntToFixed { dest, src, .. } => {
                    items.push(unary(Opcode::ItoF, reg(dest)?, reg(src)?));
                }
                Op::FixedToInt { dest, src, .. } => {
                    items.push(unary(Opcode::FtoI, reg(dest)?, reg(src)?));
                }
                Op::VectorOp {
                    reduce,
                    dest,
                    array,
                    len,
                    ..
                } => {
                    let opcode = match reduce {
                        Reduce::Sum => Opcode::VSum,
                        Reduce::Min => Opcode::VMin,
                        Reduce::Max => Opcode::VMax,
                        Reduce::Avg => Opcode::VAvg,
                    };
                    items.push(Item::Instr(Draft::new(
                        opcode,
                        reg(dest)?,
                        Operand::Regs {
                            b: layout.array_base(array)?,
                            c: narrow_len(len)?,
                        },
                    )));
                }
                Op::VectorAssign { array, len, src, .. } => {
                    items.push(Item::Instr(Draft::new(
                        Opcode::VFill,
                        layout.array_base(array)?,
                        Operand::Regs {
                            b: reg(src)?,
                            c: narrow_len(len)?,
                        },
                    )));
                }
                Op::Call {
                    name,
                    ref args,
                    dest,
                    ..
                } => {
                    let callee = program.function(name)?;
                    for (&param, &arg) in callee.params.iter().zip(args) {
                        // Dead parameters get no register; the argument
                        // value was already evaluated, dropping it is fine
                        if vars.get(param).register.is_some() {
                            items.push(mov(layout.register(vars, name, param)?, reg(arg)?));
                        }
                    }
                    items.push(Item::Instr(Draft::new(
                        Opcode::Call,
                        0,
                        Operand::Function(name),
                    )));
                    if let Some(dest) = dest {
                        items.push(mov(reg(dest)?, RV));
                    }
                }
                Op::LibCall {
                    name,
                    ref args,
                    dest,
                    ..
                } => {
                    let link = program
                        .links
                        .iter()
                        .position(|&l| l == name)
                        .ok_or_else(|| {
                            CompileError::internal(format!("'{name}' missing from link table"))
                        })?;
                    if args.len() > 2 {
                        return Err(CompileError::internal(format!(
                            "library call '{name}' takes at most 2 arguments"
                        )));
                    }
                    let link = u8::try_from(link).map_err(|_| {
                        CompileError::internal("link table overflows one byte")
                    })?;
                    let b = args.first().map(|&arg| reg(arg)).transpose()?.unwrap_or(0);
                    let c = args.get(1).map(|&arg| reg(arg)).transpose()?.unwrap_or(0);
                    items.push(Item::Instr(Draft::new(
                        Opcode::Sys,
                        link,
                        Operand::Regs { b, c },
                    )));
                    if let Some(dest) = dest {
                        items.push(mov(reg(dest)?, RV));
                    }
                }
                Op::Branch {
                    cond,
                    positive,
                    negative,
                    ..
                } => {
                    items.push(Item::Instr(Draft::new(
                        Opcode::Jz,
                        reg(cond)?,
                        Operand::Label(canonical(negative)?),
                    )));
                    items.push(Item::Instr(Draft::new(
                        Opcode::Jmp,
                        0,
                        Operand::Label(canonical(positive)?),
                    )));
                }
                Op::Jump { target, .. } => {
                    items.push(Item::Instr(Draft::new(
                        Opcode::Jmp,
                        0,
                        Operand::Label(canonical(target)?),
                    )));
                }
                Op::Return { value, .. } => {
                    if let Some(value) = value {
                        items.push(mov(RV, reg(value)?));
                    }
                    items.push(Item::Instr(Draft::new(Opcode::Ret, 0, Operand::None)));
                }
                Op::Index {
                    dest, array, index, ..
                } => {
                    items.push(Item::Instr(Draft::new(
                        Opcode::LdArr,
                        reg(dest)?,
                        Operand::Regs {
                            b: layout.array_base(array)?,
                            c: reg(index)?,
                        },
                    )));
                }
                Op::Lookup {
                    array, index, src, ..
                } => {
                    items.push(Item::Instr(Draft::new(
                        Opcode::StArr,
                        layout.array_base(array)?,
                        Operand::Regs {
                            b: reg(index)?,
                            c: reg(src)?,
                        },
                    )));
                }
                Op::PixLoad { dest, index, .. } => {
                    items.push(unary(Opcode::PixL, reg(dest)?, reg(index)?));
                }
                Op::PixStore { index, src, .. } => {
                    items.push(unary(Opcode::PixS, reg(index)?, reg(src)?));
                }
                Op::DbLoad { dest, entry, .. } => {
                    items.push(Item::Instr(Draft::new(
                        Opcode::DbL,
                        reg(dest)?,
                        Operand::Slot(entry),
                    )));
                }
                Op::DbStore { entry, src, .. } => {
                    items.push(Item::Instr(Draft::new(
                        Opcode::DbS,
                        reg(src)?,
                        Operand::Slot(entry),
                    )));
                }
                Op::Assert { cond, .. } => {
                    items.push(Item::Instr(Draft::new(
                        Opcode::Assert,
                        reg(cond)?,
                        Operand::None,
                    )));
                }
                Op::Phi { .. } | Op::IncompletePhi { .. } => {
                    return Err(CompileError::internal(
                        "phi survived into instruction lowering",
                    ));
                }
            }
        }
    }
    Ok(())
}

fn mov(dest: u8, src: u8) -> Item {
    Item::Instr(Draft::new(Opcode::Mov, dest, Operand::Regs { b: src, c: 0 }))
}

fn unary(opcode: Opcode, a: u8, b: u8) -> Item {
    Item::Instr(Draft::new(opcode, a, Operand::Regs { b, c: 0 }))
}

fn binop_opcode(op: BinOp, fixed: bool) -> Result<Opcode> {
    Ok(match (op, fixed) {
        (BinOp::Add, _) => Opcode::Add,
        (BinOp::Sub, _) => Opcode::Sub,
        (BinOp::Mul, false) => Opcode::Mul,
        (BinOp::Mul, true) => Opcode::MulF,
        (BinOp::Div, false) => Opcode::Div,
        (BinOp::Div, true) => Opcode::DivF,
        (BinOp::Mod, _) => Opcode::Mod,
        (BinOp::And, _) => Opcode::And,
        (BinOp::Or, _) => Opcode::Or,
        (BinOp::Eq, _) => Opcode::Eq,
        (BinOp::Ne, _) => Opcode::Ne,
        (BinOp::Lt, _) => Opcode::Lt,
        (BinOp::Le, _) => Opcode::Le,
        (BinOp::Gt, _) => Opcode::Gt,
        (BinOp::Ge, _) => Opcode::Ge,
    })
}

fn narrow_len(len: u32) -> Result<u8> {
    u8::try_from(len).map_err(|_| CompileError::internal("array length overflows one byte"))
}

/// Deletes unconditional jumps that target the label immediately after
/// them; block layout makes these common. Runs to a fixed point since a
/// removal can bring another jump up against its target.
pub fn prune_jumps(items: &mut Vec<Item>, limit: u32) -> Result<()> {
    for _ in 0..=limit {
        let mut prune = Vec::new();

        for (position, item) in items.iter().enumerate() {
            let Item::Instr(Draft {
                opcode: Opcode::Jmp,
                operand: Operand::Label(target),
                ..
            }) = item
            else {
                continue;
            };
            for next in &items[position + 1..] {
                match next {
                    Item::Label(label) if label == target => {
                        prune.push(position);
                        break;
                    }
                    Item::Label(_) => {}
                    // A function boundary opens a new label scope
                    Item::Func(_) | Item::Instr(_) => break,
                }
            }
        }

        if prune.is_empty() {
            return Ok(());
        }
        let mut position = 0;
        items.retain(|_| {
            let keep = !prune.contains(&position);
            position += 1;
            keep
        });
    }
    Err(CompileError::internal("jump pruning did not converge"))
}

/// Resolves labels and call targets to byte offsets and finalizes every
/// instruction. Returns the code and each function's entry offset.
pub fn resolve(items: &[Item]) -> Result<(Vec<Instr>, BTreeMap<InternedSymbol, u32>)> {
    let mut functions = BTreeMap::new();
    let mut labels: HashMap<(InternedSymbol, LabelId), u32> = HashMap::new();

    let mut offset = 0u32;
    let mut scope = None;
    for item in items {
        match *item {
            Item::Func(name) => {
                functions.insert(name, offset);
                scope = Some(name);
            }
            Item::Label(label) => {
                let Some(function) = scope else {
                    return Err(CompileError::internal("label outside any function"));
                };
                labels.insert((function, label), offset);
            }
            Item::Instr(_) => offset = offset + INSTRUCTION_BYTES,
        }
    }
    let expected = offset;

    let mut code = Vec::new();
    let mut scope = None;
    for item in items {
        match *item {
            Item::Func(name) => scope = Some(name),
            Item::Label(_) => {}
            Item::Instr(mut draft) => {
                match draft.operand {
                    Operand::Label(label) => {
                        let Some(function) = scope else {
                            return Err(CompileError::internal("jump outside any function"));
                        };
                        let target = labels.get(&(function, label)).ok_or_else(|| {
                            CompileError::internal(format!("jump to unknown label {label:?}"))
                        })?;
                        draft.operand = Operand::Slot(narrow_offset(*target)?);
                    }
                    Operand::Function(name) => {
                        let target = functions.get(&name).ok_or_else(|| {
                            CompileError::internal(format!("call to unknown function '{name}'"))
                        })?;
                        draft.operand = Operand::Slot(narrow_offset(*target)?);
                    }
                    _ => {}
                }
                code.push(draft.finish()?);
            }
        }
    }

    // Resolution must not change layout: the offsets in pass one are only
    // valid if pass two emits exactly the bytes pass one counted.
    if code.len() as u32 * INSTRUCTION_BYTES != expected {
        return Err(CompileError::internal(
            "assembled length diverged from computed offsets",
        ));
    }

    Ok((code, functions))
}

fn narrow_offset(offset: u32) -> Result<u16> {
    u16::try_from(offset)
        .map_err(|_| CompileError::internal("code section exceeds the 16-bit address space"))
}

pub fn encode(code: &[Instr]) -> Vec<u8> {
    code.iter().flat_map(Instr::encode).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::Index;

    fn jmp(target: LabelId) -> Item {
        Item::Instr(Draft::new(Opcode::Jmp, 0, Operand::Label(target)))
    }

    fn nop() -> Item {
        Item::Instr(Draft::new(Opcode::Nop, 0, Operand::None))
    }

    #[test]
    fn jump_to_the_next_label_is_pruned() {
        let f = InternedSymbol::new("f");
        let mut items = vec![
            Item::Func(f),
            Item::Label(LabelId::new(0)),
            nop(),
            jmp(LabelId::new(1)),
            Item::Label(LabelId::new(1)),
            nop(),
        ];
        prune_jumps(&mut items, 128).unwrap();
        assert_eq!(items.len(), 5);
        assert!(!items
            .iter()
            .any(|i| matches!(i, Item::Instr(d) if d.opcode == Opcode::Jmp)));
    }

    #[test]
    fn jump_over_an_instruction_survives_pruning() {
        let f = InternedSymbol::new("f");
        let mut items = vec![
            Item::Func(f),
            jmp(LabelId::new(1)),
            nop(),
            Item::Label(LabelId::new(1)),
        ];
        prune_jumps(&mut items, 128).unwrap();
        assert_eq!(items.len(), 4);
    }

    #[test]
    fn pruning_cascades_until_nothing_changes() {
        let f = InternedSymbol::new("f");
        let mut items = vec![
            Item::Func(f),
            jmp(LabelId::new(2)),
            Item::Label(LabelId::new(1)),
            Item::Label(LabelId::new(2)),
            nop(),
        ];
        prune_jumps(&mut items, 128).unwrap();
        assert_eq!(items.len(), 4);
    }

    #[test]
    fn resolve_computes_byte_offsets() {
        let f = InternedSymbol::new("f");
        let items = vec![
            Item::Func(f),
            nop(),
            jmp(LabelId::new(1)),
            nop(),
            Item::Label(LabelId::new(1)),
            nop(),
        ];
        let (code, functions) = resolve(&items).unwrap();
        assert_eq!(functions[&f], 0);
        assert_eq!(code.len(), 4);
        // The jump is the second instruction and targets the fourth
        assert_eq!(code[1].opcode, Opcode::Jmp);
        assert_eq!(code[1].bc(), 12);
    }

    #[test]
    fn unknown_labels_fail_resolution() {
        let f = InternedSymbol::new("f");
        let items = vec![Item::Func(f), jmp(LabelId::new(9))];
        assert!(resolve(&items).unwrap_err().is_internal());
    }

    #[test]
    fn labels_do_not_leak_between_functions() {
        let f = InternedSymbol::new("f");
        let g = InternedSymbol::new("g");
        // g jumps to label 0, which only exists in f
        let items = vec![
            Item::Func(f),
            Item::Label(LabelId::new(0)),
            nop(),
            Item::Func(g),
            jmp(LabelId::new(0)),
        ];
        assert!(resolve(&items).unwrap_err().is_internal());
    }
}
