//! The IR construction façade.
//!
//! The front end walks its AST and drives this builder: declaring variables,
//! requesting constants, and emitting expressions and control flow. The
//! builder takes care of scoping, constant interning with eager folding,
//! implicit i32/f16 conversion, temporaries, and the label bookkeeping for
//! structured control flow, producing a flat pre-SSA op list per function.
//!
//! Control flow is purely structural: `ifelse`/`begin_while`/`begin_for`
//! emit label markers and branches, and an explicit stack of
//! (top, continue, end) label triples makes `loop_break`/`loop_continue`
//! resolve against the innermost loop.

use std::collections::BTreeMap;

use hashbrown::HashMap;

use crate::{
    error::{CompileError, Result},
    index::Index,
    intern::InternedSymbol,
    middle::{
        ir::{LabelId, LabelKind, Op, Reduce},
        ty::{eval_binop, f16_from_f64, BinOp, ValueType, F16_ONE},
        var::{Var, VarId, VarTable},
        Function, Program,
    },
};

/// Declaration keywords carried by global declarations
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeclKeywords {
    /// Exported through the published-variable table of the image
    pub publish: bool,
    /// Persisted across power cycles via the key tables
    pub persist: bool,
}

/// An assignable location. Plain variables are `Direct`; composite accesses
/// (array element, pixel buffer slot, database attribute) carry the
/// addressing information resolved by the lookup/attr chains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Place {
    Direct(VarId),
    Indexed { array: VarId, index: VarId },
    Pixel { index: VarId },
    Db { entry: u16 },
}

#[derive(Debug)]
struct LoopFrame {
    top: LabelId,
    cont: LabelId,
    end: LabelId,
    /// Set for `for` loops so `end_for` can emit the increment
    counter: Option<(VarId, VarId)>,
}

#[derive(Debug)]
struct IfFrame {
    else_label: LabelId,
    end_label: LabelId,
    has_else: bool,
}

#[derive(Debug)]
struct FunctionCtx {
    name: InternedSymbol,
    ret: Option<ValueType>,
    params: Vec<VarId>,
    locals: HashMap<InternedSymbol, VarId>,
    local_order: Vec<VarId>,
    code: Vec<Op>,
    loop_stack: Vec<LoopFrame>,
    if_stack: Vec<IfFrame>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum PendingAccess {
    Lookup { array: VarId, index: Option<VarId> },
    Attr { parts: Vec<String> },
}

#[derive(Debug, Default)]
pub struct Builder {
    program_name: String,
    vars: VarTable,
    globals: BTreeMap<InternedSymbol, VarId>,
    global_order: Vec<VarId>,
    functions: BTreeMap<InternedSymbol, Function>,
    function_order: Vec<InternedSymbol>,
    current: Option<FunctionCtx>,
    /// Constants interned by stringified value so repeated literals reuse
    /// one record
    const_map: HashMap<String, VarId>,
    const_order: Vec<VarId>,
    links: Vec<InternedSymbol>,
    db_entries: Vec<InternedSymbol>,
    pending: Option<PendingAccess>,
    next_label: u32,
    next_temp: u32,
    next_loop_pair: u32,
    line: u32,
}

impl Builder {
    pub fn new(program_name: &str) -> Self {
        Self {
            program_name: program_name.to_owned(),
            line: 1,
            ..Default::default()
        }
    }

    /// Updates the source line stamped onto subsequently emitted ops
    pub fn set_line(&mut self, line: u32) {
        self.line = line;
    }

    pub fn vars(&self) -> &VarTable {
        &self.vars
    }

    /* Internal plumbing */

    fn ctx(&mut self) -> Result<&mut FunctionCtx> {
        self.current
            .as_mut()
            .ok_or_else(|| CompileError::internal("builder used outside of a function"))
    }

    fn emit(&mut self, op: Op) -> Result<()> {
        self.ctx()?.code.push(op);
        Ok(())
    }

    fn new_label(&mut self) -> LabelId {
        let label = LabelId::new(self.next_label as usize);
        self.next_label += 1;
        label
    }

    fn emit_label(&mut self, label: LabelId, kind: LabelKind) -> Result<()> {
        let line = self.line;
        self.emit(Op::Label { label, kind, line })
    }

    fn new_temp(&mut self, ty: ValueType) -> VarId {
        let name = InternedSymbol::new(&format!("__t{}", self.next_temp));
        self.next_temp += 1;
        self.vars.insert(Var {
            name,
            ty,
            ssa_version: None,
            is_const: false,
            is_temp: true,
            is_global: false,
            is_published: false,
            is_persistent: false,
            holds_const: None,
            register: None,
            line: self.line,
        })
    }

    fn syntax(&self, message: impl Into<String>) -> CompileError {
        CompileError::syntax(self.line, message)
    }

    /* Declarations and lookup */

    pub fn declare_var(
        &mut self,
        name: &str,
        ty: ValueType,
        keywords: DeclKeywords,
        is_global: bool,
    ) -> Result<VarId> {
        let symbol = InternedSymbol::new(name);

        if let Some(&existing) = self.globals.get(&symbol) {
            // Redeclaring a global is only diagnosed as a type mismatch when
            // the types actually differ; an identical redeclaration is still
            // an error, just a plainer one.
            if is_global && self.vars.get(existing).ty != ty {
                return Err(self.syntax(format!("global '{name}' redeclared with a different type")));
            }
            return Err(self.syntax(format!("'{name}' is already declared as a global")));
        }

        if !is_global {
            if keywords.publish || keywords.persist {
                return Err(self.syntax(format!(
                    "'publish' and 'persist' are only valid on global declarations of '{name}'"
                )));
            }

            let ctx_line = self.line;
            let ctx = self.ctx()?;
            if ctx.locals.contains_key(&symbol) {
                return Err(CompileError::syntax(
                    ctx_line,
                    format!("variable '{name}' is already declared"),
                ));
            }
        }

        let var = Var {
            name: symbol,
            ty,
            ssa_version: None,
            is_const: false,
            is_temp: false,
            is_global,
            is_published: keywords.publish,
            is_persistent: keywords.persist,
            holds_const: None,
            register: None,
            line: self.line,
        };
        let id = self.vars.insert(var);

        if is_global {
            self.globals.insert(symbol, id);
            self.global_order.push(id);
        } else {
            let line = self.line;
            let ctx = self.ctx()?;
            ctx.locals.insert(symbol, id);
            ctx.local_order.push(id);
            ctx.code.push(Op::Define { var: id, line });
        }

        Ok(id)
    }

    /// Resolves a name through the current scope chain (function locals,
    /// then globals).
    pub fn get_var(&self, name: &str) -> Result<VarId> {
        let symbol = InternedSymbol::new(name);

        if let Some(ctx) = &self.current {
            if let Some(&id) = ctx.locals.get(&symbol) {
                return Ok(id);
            }
        }

        self.globals
            .get(&symbol)
            .copied()
            .ok_or_else(|| self.syntax(format!("undeclared variable '{name}'")))
    }

    /* Constants */

    fn intern_const(&mut self, raw: i32, ty: ValueType) -> VarId {
        let key = format!("{raw}:{ty}");
        if let Some(&id) = self.const_map.get(&key) {
            return id;
        }

        let name = InternedSymbol::new(&format!("__c_{key}"));
        let id = self.vars.insert(Var {
            name,
            ty,
            ssa_version: None,
            is_const: true,
            is_temp: false,
            is_global: false,
            is_published: false,
            is_persistent: false,
            holds_const: Some(raw),
            register: None,
            line: self.line,
        });
        self.const_map.insert(key, id);
        self.const_order.push(id);
        id
    }

    pub fn add_const_i32(&mut self, value: i32) -> VarId {
        self.intern_const(value, ValueType::I32)
    }

    pub fn add_const_f16(&mut self, value: f64) -> VarId {
        self.intern_const(f16_from_f64(value), ValueType::F16)
    }

    pub fn add_const_gfx16(&mut self, raw: i32) -> VarId {
        self.intern_const(raw, ValueType::Gfx16)
    }

    /* Expressions */

    fn operand_ty(&self, id: VarId) -> Result<ValueType> {
        let ty = self.vars.get(id).ty.clone();
        if !ty.is_scalar() {
            return Err(self.syntax(format!(
                "'{}' cannot be used as a scalar operand",
                self.vars.get(id).name
            )));
        }
        Ok(ty)
    }

    /// Inserts an i32 -> f16 conversion, folding constants in place
    fn widen_to_fixed(&mut self, value: VarId) -> Result<VarId> {
        if let Some(raw) = self.vars.holds_const(value).filter(|_| self.vars.is_const(value)) {
            return Ok(self.intern_const(raw.wrapping_mul(F16_ONE), ValueType::F16));
        }

        let dest = self.new_temp(ValueType::F16);
        let line = self.line;
        self.emit(Op::IntToFixed {
            dest,
            src: value,
            line,
        })?;
        Ok(dest)
    }

    fn narrow_to_int(&mut self, value: VarId) -> Result<VarId> {
        if let Some(raw) = self.vars.holds_const(value).filter(|_| self.vars.is_const(value)) {
            return Ok(self.intern_const(raw / F16_ONE, ValueType::I32));
        }

        let dest = self.new_temp(ValueType::I32);
        let line = self.line;
        self.emit(Op::FixedToInt {
            dest,
            src: value,
            line,
        })?;
        Ok(dest)
    }

    /// Emits a binary operation, folding eagerly when both operands are
    /// constants. Mixed i32/f16 operands are widened to f16 unless gfx16 is
    /// involved, which is never converted. Comparisons produce i32.
    pub fn binop(&mut self, op: BinOp, lhs: VarId, rhs: VarId) -> Result<VarId> {
        let lhs_ty = self.operand_ty(lhs)?;
        let rhs_ty = self.operand_ty(rhs)?;

        let pixel = lhs_ty == ValueType::Gfx16 || rhs_ty == ValueType::Gfx16;
        let fixed = !pixel && (lhs_ty.is_fixed() || rhs_ty.is_fixed());

        // Division by a literal zero is a script error; division by a
        // runtime zero saturates in the VM instead.
        if matches!(op, BinOp::Div | BinOp::Mod)
            && self.vars.is_const(rhs)
            && self.vars.holds_const(rhs) == Some(0)
        {
            return Err(self.syntax("division by zero"));
        }

        if self.vars.is_const(lhs) && self.vars.is_const(rhs) {
            let mut l = self.vars.holds_const(lhs).unwrap_or(0);
            let mut r = self.vars.holds_const(rhs).unwrap_or(0);
            if fixed {
                if !lhs_ty.is_fixed() {
                    l = l.wrapping_mul(F16_ONE);
                }
                if !rhs_ty.is_fixed() {
                    r = r.wrapping_mul(F16_ONE);
                }
            }

            let raw = eval_binop(op, fixed, l, r);
            let ty = if op.is_comparison() {
                ValueType::I32
            } else if fixed {
                ValueType::F16
            } else {
                lhs_ty
            };
            return Ok(self.intern_const(raw, ty));
        }

        let (lhs, rhs) = if fixed {
            let l = if lhs_ty.is_fixed() {
                lhs
            } else {
                self.widen_to_fixed(lhs)?
            };
            let r = if rhs_ty.is_fixed() {
                rhs
            } else {
                self.widen_to_fixed(rhs)?
            };
            (l, r)
        } else {
            (lhs, rhs)
        };

        let result_ty = if op.is_comparison() {
            ValueType::I32
        } else if fixed {
            ValueType::F16
        } else if pixel {
            ValueType::Gfx16
        } else {
            lhs_ty
        };

        let dest = self.new_temp(result_ty);
        let line = self.line;
        self.emit(Op::Binop {
            op,
            fixed,
            dest,
            lhs,
            rhs,
            line,
        })?;
        Ok(dest)
    }

    pub fn unary_not(&mut self, value: VarId) -> Result<VarId> {
        self.operand_ty(value)?;
        let dest = self.new_temp(ValueType::I32);
        let line = self.line;
        self.emit(Op::Not {
            dest,
            src: value,
            line,
        })?;
        Ok(dest)
    }

    /* Assignment */

    /// Resolves a composite place into a plain register value
    pub fn load_value(&mut self, place: Place) -> Result<VarId> {
        let line = self.line;
        match place {
            Place::Direct(id) => {
                if !self.vars.get(id).ty.is_scalar() {
                    return Err(self.syntax(format!(
                        "'{}' is not a scalar value",
                        self.vars.get(id).name
                    )));
                }
                Ok(id)
            }
            Place::Indexed { array, index } => {
                let elem = match &self.vars.get(array).ty {
                    ValueType::Array { elem, .. } => (**elem).clone(),
                    _ => return Err(self.syntax("indexed access into a non-array")),
                };
                let dest = self.new_temp(elem);
                self.emit(Op::Index {
                    dest,
                    array,
                    index,
                    line,
                })?;
                Ok(dest)
            }
            Place::Pixel { index } => {
                let dest = self.new_temp(ValueType::Gfx16);
                self.emit(Op::PixLoad { dest, index, line })?;
                Ok(dest)
            }
            Place::Db { entry } => {
                let dest = self.new_temp(ValueType::I32);
                self.emit(Op::DbLoad { dest, entry, line })?;
                Ok(dest)
            }
        }
    }

    /// Inserts a type coercion unless the value is the literal constant
    /// zero, gfx16 is on either side, or the target type is unknowable at
    /// compile time (database attributes).
    fn convert_type(&mut self, value: VarId, target: &ValueType) -> Result<VarId> {
        let value_ty = self.vars.get(value).ty.clone();

        if self.vars.is_const(value) && self.vars.holds_const(value) == Some(0) {
            return Ok(value);
        }
        if value_ty == ValueType::Gfx16 || *target == ValueType::Gfx16 {
            return Ok(value);
        }
        if *target == ValueType::DbRef {
            return Ok(value);
        }

        match (value_ty, target) {
            (ValueType::I32, ValueType::F16) => self.widen_to_fixed(value),
            (ValueType::F16, ValueType::I32) => self.narrow_to_int(value),
            _ => Ok(value),
        }
    }

    fn store_value(&mut self, place: Place, value: VarId) -> Result<()> {
        let line = self.line;
        match place {
            Place::Direct(dest) => {
                let var = self.vars.get(dest);
                if var.is_const {
                    return Err(self.syntax(format!(
                        "invalid assignment target '{}'",
                        var.name
                    )));
                }

                if let ValueType::Array { len, .. } = var.ty {
                    return self.emit(Op::VectorAssign {
                        array: dest,
                        len,
                        src: value,
                        line,
                    });
                }

                if self.vars.is_const(value) {
                    self.emit(Op::LoadConst {
                        dest,
                        src: value,
                        line,
                    })
                } else {
                    self.emit(Op::Assign {
                        dest,
                        src: value,
                        line,
                    })
                }
            }
            Place::Indexed { array, index } => self.emit(Op::Lookup {
                array,
                index,
                src: value,
                line,
            }),
            Place::Pixel { index } => self.emit(Op::PixStore {
                index,
                src: value,
                line,
            }),
            Place::Db { entry } => self.emit(Op::DbStore {
                entry,
                src: value,
                line,
            }),
        }
    }

    fn place_ty(&self, place: Place) -> ValueType {
        match place {
            Place::Direct(id) => match &self.vars.get(id).ty {
                ValueType::Array { elem, .. } => (**elem).clone(),
                other => other.clone(),
            },
            Place::Indexed { array, .. } => match &self.vars.get(array).ty {
                ValueType::Array { elem, .. } => (**elem).clone(),
                _ => ValueType::I32,
            },
            Place::Pixel { .. } => ValueType::Gfx16,
            Place::Db { .. } => ValueType::DbRef,
        }
    }

    pub fn assign(&mut self, place: Place, value: VarId) -> Result<()> {
        let target_ty = self.place_ty(place);
        let value = self.convert_type(value, &target_ty)?;
        self.store_value(place, value)
    }

    pub fn augassign(&mut self, place: Place, op: BinOp, value: VarId) -> Result<()> {
        let current = self.load_value(place)?;
        let combined = self.binop(op, current, value)?;
        self.assign(place, combined)
    }

    /* Composite access chains */

    pub fn start_lookup(&mut self, array: VarId) -> Result<()> {
        if self.pending.is_some() {
            return Err(CompileError::internal("nested lookup chain"));
        }
        match self.vars.get(array).ty {
            ValueType::Array { .. } | ValueType::PixBuf => {}
            _ => {
                return Err(self.syntax(format!(
                    "'{}' is not indexable",
                    self.vars.get(array).name
                )))
            }
        }
        self.pending = Some(PendingAccess::Lookup { array, index: None });
        Ok(())
    }

    pub fn add_lookup(&mut self, index: VarId) -> Result<()> {
        match self.pending.as_mut() {
            Some(PendingAccess::Lookup { index: slot, .. }) => {
                if slot.is_some() {
                    return Err(self.syntax("multi-dimensional indexing is not supported"));
                }
                *slot = Some(index);
                Ok(())
            }
            _ => Err(CompileError::internal("add_lookup without start_lookup")),
        }
    }

    pub fn finish_lookup(&mut self) -> Result<Place> {
        let pending = self.pending.take();
        match pending {
            Some(PendingAccess::Lookup {
                array,
                index: Some(index),
            }) => {
                if self.vars.get(array).ty == ValueType::PixBuf {
                    Ok(Place::Pixel { index })
                } else {
                    Ok(Place::Indexed { array, index })
                }
            }
            Some(PendingAccess::Lookup { index: None, .. }) => {
                Err(self.syntax("indexed access without an index"))
            }
            _ => Err(CompileError::internal("finish_lookup without start_lookup")),
        }
    }

    pub fn start_attr(&mut self, root: &str) -> Result<()> {
        if self.pending.is_some() {
            return Err(CompileError::internal("nested attribute chain"));
        }
        self.pending = Some(PendingAccess::Attr {
            parts: vec![root.to_owned()],
        });
        Ok(())
    }

    pub fn add_attr(&mut self, part: &str) -> Result<()> {
        match self.pending.as_mut() {
            Some(PendingAccess::Attr { parts }) => {
                parts.push(part.to_owned());
                Ok(())
            }
            _ => Err(CompileError::internal("add_attr without start_attr")),
        }
    }

    pub fn finish_attr(&mut self) -> Result<Place> {
        let pending = self.pending.take();
        match pending {
            Some(PendingAccess::Attr { parts }) => {
                let name = InternedSymbol::new(&parts.join("."));
                let entry = match self.db_entries.iter().position(|e| *e == name) {
                    Some(i) => i,
                    None => {
                        self.db_entries.push(name);
                        self.db_entries.len() - 1
                    }
                };
                Ok(Place::Db {
                    entry: entry as u16,
                })
            }
            _ => Err(CompileError::internal("finish_attr without start_attr")),
        }
    }

    /* Control flow */

    pub fn ifelse(&mut self, cond: VarId) -> Result<()> {
        let then_label = self.new_label();
        let else_label = self.new_label();
        let end_label = self.new_label();
        let line = self.line;

        self.emit(Op::Branch {
            cond,
            positive: then_label,
            negative: else_label,
            line,
        })?;
        self.emit_label(then_label, LabelKind::Plain)?;

        self.ctx()?.if_stack.push(IfFrame {
            else_label,
            end_label,
            has_else: false,
        });
        Ok(())
    }

    /// Closes the then-branch by jumping to the merge point
    pub fn end_if(&mut self) -> Result<()> {
        let line = self.line;
        let end = self
            .current
            .as_ref()
            .and_then(|c| c.if_stack.last())
            .map(|f| f.end_label)
            .ok_or_else(|| CompileError::internal("end_if outside of ifelse"))?;
        self.emit(Op::Jump { target: end, line })
    }

    pub fn do_else(&mut self) -> Result<()> {
        let frame_else = {
            let frame = self
                .ctx()?
                .if_stack
                .last_mut()
                .ok_or_else(|| CompileError::internal("do_else outside of ifelse"))?;
            frame.has_else = true;
            frame.else_label
        };
        self.emit_label(frame_else, LabelKind::Plain)
    }

    pub fn end_ifelse(&mut self) -> Result<()> {
        let frame = self
            .ctx()?
            .if_stack
            .pop()
            .ok_or_else(|| CompileError::internal("end_ifelse outside of ifelse"))?;

        if !frame.has_else {
            self.emit_label(frame.else_label, LabelKind::Plain)?;
        }
        self.emit_label(frame.end_label, LabelKind::Plain)
    }

    pub fn begin_while(&mut self) -> Result<()> {
        let pair = self.next_loop_pair;
        self.next_loop_pair += 1;

        let header = self.new_label();
        let top = self.new_label();
        let end = self.new_label();

        self.emit_label(header, LabelKind::LoopHeader { pair })?;
        self.emit_label(top, LabelKind::LoopTop { pair })?;

        self.ctx()?.loop_stack.push(LoopFrame {
            top,
            cont: top,
            end,
            counter: None,
        });
        Ok(())
    }

    pub fn test_while(&mut self, cond: VarId) -> Result<()> {
        let body = self.new_label();
        let line = self.line;
        let end = self
            .current
            .as_ref()
            .and_then(|c| c.loop_stack.last())
            .map(|f| f.end)
            .ok_or_else(|| CompileError::internal("test_while outside of a loop"))?;

        self.emit(Op::Branch {
            cond,
            positive: body,
            negative: end,
            line,
        })?;
        self.emit_label(body, LabelKind::Plain)
    }

    pub fn end_while(&mut self) -> Result<()> {
        let line = self.line;
        let frame = self
            .ctx()?
            .loop_stack
            .pop()
            .ok_or_else(|| CompileError::internal("end_while outside of a loop"))?;

        self.emit(Op::Jump {
            target: frame.top,
            line,
        })?;
        self.emit_label(frame.end, LabelKind::Plain)
    }

    /// Counted loop: declares (or reuses) the counter, zeroes it, and
    /// branches on `counter < limit`. The increment is emitted by
    /// [`Builder::end_for`].
    pub fn begin_for(&mut self, counter_name: &str, limit: VarId) -> Result<VarId> {
        let counter = match self.get_var(counter_name) {
            Ok(id) => id,
            Err(_) => self.declare_var(
                counter_name,
                ValueType::I32,
                DeclKeywords::default(),
                false,
            )?,
        };

        let zero = self.add_const_i32(0);
        self.assign(Place::Direct(counter), zero)?;

        let pair = self.next_loop_pair;
        self.next_loop_pair += 1;

        let header = self.new_label();
        let top = self.new_label();
        let cont = self.new_label();
        let end = self.new_label();
        let body = self.new_label();

        self.emit_label(header, LabelKind::LoopHeader { pair })?;
        self.emit_label(top, LabelKind::LoopTop { pair })?;

        let cond = self.binop(BinOp::Lt, counter, limit)?;
        let line = self.line;
        self.emit(Op::Branch {
            cond,
            positive: body,
            negative: end,
            line,
        })?;
        self.emit_label(body, LabelKind::Plain)?;

        self.ctx()?.loop_stack.push(LoopFrame {
            top,
            cont,
            end,
            counter: Some((counter, limit)),
        });
        Ok(counter)
    }

    pub fn end_for(&mut self) -> Result<()> {
        let line = self.line;
        let frame = self
            .ctx()?
            .loop_stack
            .pop()
            .ok_or_else(|| CompileError::internal("end_for outside of a loop"))?;
        let Some((counter, _)) = frame.counter else {
            return Err(CompileError::internal("end_for closing a while loop"));
        };

        self.emit_label(frame.cont, LabelKind::Plain)?;
        let one = self.add_const_i32(1);
        self.augassign(Place::Direct(counter), BinOp::Add, one)?;
        self.emit(Op::Jump {
            target: frame.top,
            line,
        })?;
        self.emit_label(frame.end, LabelKind::Plain)
    }

    pub fn loop_break(&mut self) -> Result<()> {
        let line = self.line;
        let end = self
            .current
            .as_ref()
            .and_then(|c| c.loop_stack.last())
            .map(|f| f.end)
            .ok_or_else(|| self.syntax("'break' outside of a loop"))?;
        self.emit(Op::Jump { target: end, line })
    }

    pub fn loop_continue(&mut self) -> Result<()> {
        let line = self.line;
        let cont = self
            .current
            .as_ref()
            .and_then(|c| c.loop_stack.last())
            .map(|f| f.cont)
            .ok_or_else(|| self.syntax("'continue' outside of a loop"))?;
        self.emit(Op::Jump { target: cont, line })
    }

    /* Functions and calls */

    pub fn begin_function(
        &mut self,
        name: &str,
        params: &[(&str, ValueType)],
        ret: Option<ValueType>,
    ) -> Result<Vec<VarId>> {
        if self.current.is_some() {
            return Err(CompileError::internal("nested function definition"));
        }

        let symbol = InternedSymbol::new(name);
        if self.functions.contains_key(&symbol) {
            return Err(self.syntax(format!("function '{name}' is already defined")));
        }

        let mut ctx = FunctionCtx {
            name: symbol,
            ret,
            params: Vec::new(),
            locals: HashMap::new(),
            local_order: Vec::new(),
            code: Vec::new(),
            loop_stack: Vec::new(),
            if_stack: Vec::new(),
        };

        let mut param_ids = Vec::new();
        for (param_name, ty) in params {
            let param_symbol = InternedSymbol::new(param_name);
            let id = self.vars.insert(Var {
                name: param_symbol,
                ty: ty.clone(),
                // Parameters are definitions in their own right
                ssa_version: Some(0),
                is_const: false,
                is_temp: false,
                is_global: false,
                is_published: false,
                is_persistent: false,
                holds_const: None,
                register: None,
                line: self.line,
            });
            ctx.locals.insert(param_symbol, id);
            ctx.params.push(id);
            param_ids.push(id);
        }

        self.current = Some(ctx);
        Ok(param_ids)
    }

    pub fn fn_return(&mut self, value: Option<VarId>) -> Result<()> {
        let line = self.line;
        self.emit(Op::Return { value, line })
    }

    pub fn end_function(&mut self) -> Result<()> {
        let line = self.line;
        let mut ctx = self
            .current
            .take()
            .ok_or_else(|| CompileError::internal("end_function outside of a function"))?;

        if !ctx.loop_stack.is_empty() || !ctx.if_stack.is_empty() {
            return Err(CompileError::internal(
                "unterminated control flow at end of function",
            ));
        }

        if !matches!(ctx.code.last(), Some(Op::Return { .. })) {
            ctx.code.push(Op::Return { value: None, line });
        }

        self.function_order.push(ctx.name);
        self.functions.insert(
            ctx.name,
            Function {
                name: ctx.name,
                ret: ctx.ret,
                params: ctx.params,
                locals: ctx.local_order,
                code: ctx.code,
            },
        );
        Ok(())
    }

    /// Dispatches a call: built-in array reductions first, then user
    /// functions (exact arity required), then VM library calls for any
    /// unresolved name.
    pub fn call(&mut self, name: &str, args: &[VarId]) -> Result<Option<VarId>> {
        let line = self.line;

        if let Some(reduce) = match name {
            "min" => Some(Reduce::Min),
            "max" => Some(Reduce::Max),
            "avg" => Some(Reduce::Avg),
            "sum" => Some(Reduce::Sum),
            _ => None,
        } {
            let [array] = args else {
                return Err(self.syntax(format!("'{name}' takes exactly one array argument")));
            };
            let (elem, len) = match &self.vars.get(*array).ty {
                ValueType::Array { elem, len } => ((**elem).clone(), *len),
                _ => return Err(self.syntax(format!("'{name}' requires an array argument"))),
            };
            let dest = self.new_temp(elem);
            self.emit(Op::VectorOp {
                reduce,
                dest,
                array: *array,
                len,
                line,
            })?;
            return Ok(Some(dest));
        }

        if name == "len" {
            let [array] = args else {
                return Err(self.syntax("'len' takes exactly one array argument"));
            };
            // Fixed-size arrays fold to a constant immediately
            let len = match &self.vars.get(*array).ty {
                ValueType::Array { len, .. } => *len,
                _ => return Err(self.syntax("'len' requires an array argument")),
            };
            return Ok(Some(self.add_const_i32(len as i32)));
        }

        let symbol = InternedSymbol::new(name);

        if self
            .current
            .as_ref()
            .is_some_and(|ctx| ctx.name == symbol)
        {
            return Err(self.syntax(format!("recursive call to '{name}' is not supported")));
        }

        if let Some(function) = self.functions.get(&symbol) {
            let arity = function.params.len();
            let ret = function.ret.clone();
            if arity != args.len() {
                return Err(self.syntax(format!(
                    "wrong number of arguments for '{name}' (expected {arity}, found {})",
                    args.len()
                )));
            }

            let dest = ret.map(|ty| self.new_temp(ty));
            self.emit(Op::Call {
                name: symbol,
                args: args.to_vec(),
                dest,
                line,
            })?;
            return Ok(dest);
        }

        /* Unresolved names are VM library calls */

        if args.len() > 2 {
            return Err(self.syntax(format!(
                "library call '{name}' takes at most 2 arguments"
            )));
        }

        if !self.links.contains(&symbol) {
            self.links.push(symbol);
        }

        let dest = self.new_temp(ValueType::I32);
        self.emit(Op::LibCall {
            name: symbol,
            args: args.to_vec(),
            dest: Some(dest),
            line,
        })?;
        Ok(Some(dest))
    }

    pub fn assertion(&mut self, cond: VarId) -> Result<()> {
        let line = self.line;
        self.emit(Op::Assert { cond, line })
    }

    /* Output */

    pub fn finish(self) -> Result<Program> {
        if self.current.is_some() {
            return Err(CompileError::internal(
                "finish called with an open function",
            ));
        }

        Ok(Program {
            name: self.program_name,
            vars: self.vars,
            globals: self.globals,
            global_order: self.global_order,
            functions: self.functions,
            function_order: self.function_order,
            consts: self.const_order,
            links: self.links,
            db_entries: self.db_entries,
        })
    }
}
