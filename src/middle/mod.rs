//! The middle stage: IR construction, SSA conversion, and optimization.
//!
//! The front end drives [`builder::Builder`] to produce a flat op list per
//! function; [`compile`] then runs each function through the pipeline:
//!
//! 1. pre-SSA normalization (zero-init, global shadowing)
//! 2. CFG formation and unreachable block removal
//! 3. SSA renaming (fill/seal), constant version propagation, phi clean up
//! 4. SSA verification
//! 5. dominance, loop discovery, and the optimizer fixed point
//! 6. phi resolution with critical edge splitting
//! 7. block merging
//!
//! The result feeds the backend unchanged.

pub mod builder;
pub mod cfg;
pub mod dominance;
pub mod ir;
pub mod optimize;
pub mod pretty_print;
pub mod ssa;
pub mod ty;
pub mod var;

use std::collections::BTreeMap;

use crate::{
    error::{CompileError, Result},
    intern::InternedSymbol,
    middle::{
        cfg::Cfg,
        dominance::Dominance,
        ir::Op,
        ty::ValueType,
        var::{Var, VarId, VarTable},
    },
};

/// Cap on every fixed-point iteration in the compiler; exceeding it is an
/// internal error rather than a hang
pub const FIXED_POINT_ITERATION_LIMIT: u32 = 128;

/// Per-function virtual register budget the allocator works with
pub const FUNCTION_REGISTERS: u8 = 64;

#[derive(Debug, Clone)]
pub struct Options {
    /// Hoist loop-invariant code into loop headers
    pub licm: bool,
    pub fixed_point_iteration_limit: u32,
    /// Registers available to one function's locals and temporaries
    pub function_registers: u8,
    /// Dump each function's final IR to stdout
    pub dump_ir: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            licm: true,
            fixed_point_iteration_limit: FIXED_POINT_ITERATION_LIMIT,
            function_registers: FUNCTION_REGISTERS,
            dump_ir: false,
        }
    }
}

/// One function, as emitted by the builder (pre-SSA, flat code)
#[derive(Debug)]
pub struct Function {
    pub name: InternedSymbol,
    pub ret: Option<ValueType>,
    pub params: Vec<VarId>,
    pub locals: Vec<VarId>,
    pub code: Vec<Op>,
}

/// Builder output for a whole script
#[derive(Debug)]
pub struct Program {
    pub name: String,
    pub vars: VarTable,
    pub globals: BTreeMap<InternedSymbol, VarId>,
    /// Globals in declaration order; the backend assigns slots in this order
    pub global_order: Vec<VarId>,
    pub functions: BTreeMap<InternedSymbol, Function>,
    pub function_order: Vec<InternedSymbol>,
    pub consts: Vec<VarId>,
    /// Library calls in first-use order, resolved by the VM at load
    pub links: Vec<InternedSymbol>,
    /// Database attributes in first-use order
    pub db_entries: Vec<InternedSymbol>,
}

impl Program {
    /// Interns `raw` into the constant pool, reusing an existing slot when
    /// value and type match
    pub(crate) fn add_const(&mut self, raw: i32, ty: ValueType) -> VarId {
        let existing = self.consts.iter().copied().find(|&id| {
            self.vars.holds_const(id) == Some(raw) && self.vars.get(id).ty == ty
        });
        if let Some(id) = existing {
            return id;
        }

        let name = InternedSymbol::new(&format!("__c_{raw}:{ty}"));
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
            line: 0,
        });
        self.consts.push(id);
        id
    }
}

/// A function after the whole middle stage: phi-free CFG, ready to lower
#[derive(Debug)]
pub struct CompiledFunction {
    pub name: InternedSymbol,
    pub ret: Option<ValueType>,
    pub params: Vec<VarId>,
    pub locals: Vec<VarId>,
    pub cfg: Cfg,
}

#[derive(Debug)]
pub struct CompiledProgram {
    pub name: String,
    pub vars: VarTable,
    pub globals: Vec<VarId>,
    pub functions: Vec<CompiledFunction>,
    pub consts: Vec<VarId>,
    pub links: Vec<InternedSymbol>,
    pub db_entries: Vec<InternedSymbol>,
}

impl CompiledProgram {
    pub fn function(&self, name: InternedSymbol) -> Result<&CompiledFunction> {
        self.functions
            .iter()
            .find(|f| f.name == name)
            .ok_or_else(|| CompileError::internal(format!("unknown function '{name}'")))
    }
}

/// Runs every function of the builder's output through the middle pipeline
pub fn compile(mut program: Program, options: &Options) -> Result<CompiledProgram> {
    let limit = options.fixed_point_iteration_limit;
    let order = program.function_order.clone();
    let mut functions = Vec::with_capacity(order.len());

    for name in order {
        ssa::init_vars(&mut program, name)?;

        let function = program
            .functions
            .get_mut(&name)
            .ok_or_else(|| CompileError::internal(format!("unknown function '{name}'")))?;
        let code = std::mem::take(&mut function.code);
        let params = function.params.clone();
        let ret = function.ret.clone();
        let locals = function.locals.clone();

        let mut cfg = Cfg::build(code)?;
        cfg.remove_unreachable()?;

        ssa::construct(&mut cfg, &mut program.vars, &params, limit)?;
        ssa::propagate_const_versions(&cfg, &mut program.vars, limit)?;
        ssa::clean_up_phis(&mut cfg, &program.vars, limit)?;
        ssa::verify(&cfg, &program.vars)?;

        let dom = Dominance::compute(&cfg);
        let loops = dominance::find_loops(&cfg, &dom)?;
        optimize::run(&mut cfg, &mut program, &dom, &loops, options)?;

        ssa::resolve_phis(&mut cfg, &mut program.vars)?;
        ssa::assert_no_critical_edges(&cfg)?;
        optimize::merge_blocks(&mut cfg, limit)?;

        if options.dump_ir {
            pretty_print::pretty_print_function(name, &cfg, &program.vars);
        }

        functions.push(CompiledFunction {
            name,
            ret,
            params,
            locals,
            cfg,
        });
    }

    Ok(CompiledProgram {
        name: program.name,
        vars: program.vars,
        globals: program.global_order,
        functions,
        consts: program.consts,
        links: program.links,
        db_entries: program.db_entries,
    })
}
