//! The backend: register allocation, instruction lowering, and packing.
//!
//! Takes the phi-free output of the middle stage through:
//!
//! 1. constant materialization (operands may not be pool references)
//! 2. liveness analysis and linear scan allocation, per function
//! 3. register file layout (globals, per-function windows, constant pool)
//! 4. lowering to draft instructions, jump pruning, reference resolution
//! 5. binary image packing
//!
//! The register file doubles as the DATA section of the image: slot 0 is
//! the shared return value register, globals and array storage follow in
//! declaration order, then one disjoint register window per function.
//! Wide constants live past the register file in pool slots reachable
//! only through `LoadMem`.

pub mod assemble;
pub mod image;
pub mod isa;
pub mod liveness;
pub mod regalloc;

use std::collections::BTreeMap;

use hashbrown::HashMap;

use crate::{
    error::{CompileError, Result},
    intern::InternedSymbol,
    middle::{
        ir::Op,
        ty::ValueType,
        var::{Var, VarId, VarTable},
        CompiledProgram, Options,
    },
};

use isa::Instr;

/// Highest register index the 8-bit operand encoding can address, plus one
const REGISTER_FILE_LIMIT: u32 = 256;

/// Everything the backend produces for one program: the packed image for
/// the device, plus the resolved pieces a host-side interpreter needs.
pub struct Artifact {
    pub image: Vec<u8>,
    /// Resolved instruction stream; byte offsets are indices times 4
    pub code: Vec<Instr>,
    /// Byte offset of each function's first instruction
    pub entries: BTreeMap<InternedSymbol, u32>,
    /// Initial data image: register file then constant pool
    pub data: Vec<i32>,
    /// Scalar global name -> register
    pub globals: BTreeMap<InternedSymbol, u8>,
    /// Library link names, indexed by `Sys` instruction operand
    pub links: Vec<InternedSymbol>,
    pub db_entries: usize,
}

/// Where every value lives in the register file and data image
pub(crate) struct Layout {
    globals: HashMap<VarId, u8>,
    arrays: HashMap<VarId, u8>,
    windows: HashMap<InternedSymbol, u8>,
    pool: HashMap<VarId, u16>,
    /// Register file size; also where the constant pool starts
    pub registers: u16,
    /// One i32 per register and pool slot, pre-initialized
    pub data: Vec<i32>,
}

impl Layout {
    fn build(program: &CompiledProgram, windows: &[(InternedSymbol, u8)]) -> Result<Self> {
        let vars = &program.vars;
        let mut globals = HashMap::new();
        let mut arrays = HashMap::new();
        let mut window_bases = HashMap::new();

        let mut next: u32 = 1; // slot 0 is the return value register

        for &id in &program.globals {
            let var = vars.get(id);
            let slots = storage_slots(&var.ty);
            if slots == 0 {
                continue;
            }
            if var.ty.is_scalar() {
                globals.insert(id, narrow_slot(next)?);
            } else {
                arrays.insert(id, narrow_slot(next)?);
            }
            next += slots;
        }

        for function in &program.functions {
            for &local in &function.locals {
                let ty = &vars.get(local).ty;
                if let ValueType::Array { .. } = ty {
                    arrays.insert(local, narrow_slot(next)?);
                    next += storage_slots(ty);
                }
            }
            let used = windows
                .iter()
                .find(|(name, _)| *name == function.name)
                .map(|&(_, used)| used)
                .ok_or_else(|| CompileError::internal("function missing from allocation"))?;
            window_bases.insert(function.name, narrow_slot(next)?);
            next += u32::from(used);
        }

        if next > REGISTER_FILE_LIMIT {
            return Err(CompileError::internal(format!(
                "register file exhausted: {next} slots needed, {REGISTER_FILE_LIMIT} addressable"
            )));
        }
        let registers = next as u16;

        // Constants that fit a 16-bit immediate never touch memory; the
        // rest get pool slots after the register file.
        let mut pool = HashMap::new();
        let mut data = vec![0i32; next as usize];
        for &id in &program.consts {
            let raw = vars
                .holds_const(id)
                .ok_or_else(|| CompileError::internal("constant without a value"))?;
            if i16::try_from(raw).is_ok() {
                continue;
            }
            let slot = u16::try_from(data.len())
                .map_err(|_| CompileError::internal("constant pool exceeds 16-bit addressing"))?;
            pool.insert(id, slot);
            data.push(raw);
        }

        // A global with a folded initial value boots with it in DATA;
        // everything else starts at zero until `init` stores into it.
        for (&id, &slot) in &globals {
            if let Some(value) = vars.holds_const(id) {
                data[usize::from(slot)] = value;
            }
        }

        Ok(Self {
            globals,
            arrays,
            windows: window_bases,
            pool,
            registers,
            data,
        })
    }

    /// Register of a value inside `function`: its global slot, or its
    /// window-relative register offset by the function's window base
    pub(crate) fn register(
        &self,
        vars: &VarTable,
        function: InternedSymbol,
        id: VarId,
    ) -> Result<u8> {
        let var = vars.get(id);
        if var.is_global {
            return self.global_register(id);
        }
        let base = self.windows.get(&function).copied().ok_or_else(|| {
            CompileError::internal(format!("no register window for '{function}'"))
        })?;
        let register = var.register.ok_or_else(|| {
            CompileError::internal(format!(
                "'{}' survived to lowering without a register",
                var.display_name()
            ))
        })?;
        base.checked_add(register)
            .ok_or_else(|| CompileError::internal("register window overflows the file"))
    }

    pub(crate) fn global_register(&self, id: VarId) -> Result<u8> {
        self.globals
            .get(&id)
            .copied()
            .ok_or_else(|| CompileError::internal("global without a register"))
    }

    pub(crate) fn array_base(&self, id: VarId) -> Result<u8> {
        self.arrays
            .get(&id)
            .copied()
            .ok_or_else(|| CompileError::internal("array without storage"))
    }

    pub(crate) fn pool_slot(&self, id: VarId) -> Result<u16> {
        self.pool
            .get(&id)
            .copied()
            .ok_or_else(|| CompileError::internal("wide constant missing from the pool"))
    }
}

fn narrow_slot(slot: u32) -> Result<u8> {
    u8::try_from(slot).map_err(|_| {
        CompileError::internal(format!(
            "register file exhausted: slot {slot} is not addressable"
        ))
    })
}

fn storage_slots(ty: &ValueType) -> u32 {
    match ty {
        ValueType::Array { len, .. } => *len,
        _ if ty.is_scalar() => 1,
        _ => 0,
    }
}

/// Machine operands address registers, not the constant pool, so every
/// instruction reading a constant gets an explicit load into a fresh
/// temporary right before it.
fn materialize_consts(program: &mut CompiledProgram) -> Result<()> {
    let functions = &mut program.functions;
    let vars = &mut program.vars;
    let mut counter = 0usize;

    for function in functions.iter_mut() {
        for block in function.cfg.blocks.values_mut() {
            let mut position = 0;
            while position < block.code.len() {
                if matches!(block.code[position], Op::LoadConst { .. }) {
                    position += 1;
                    continue;
                }

                let mut pooled: Vec<VarId> = Vec::new();
                for input in block.code[position].inputs() {
                    if vars.get(input).is_const && !pooled.contains(&input) {
                        pooled.push(input);
                    }
                }
                if pooled.is_empty() {
                    position += 1;
                    continue;
                }

                let line = block.code[position].line();
                for source in pooled {
                    let (ty, held) = {
                        let var = vars.get(source);
                        (var.ty.clone(), var.holds_const)
                    };
                    let temp = vars.insert(Var {
                        name: InternedSymbol::new(&format!("__ld{counter}")),
                        ty,
                        ssa_version: None,
                        is_const: false,
                        is_temp: true,
                        is_global: false,
                        is_published: false,
                        is_persistent: false,
                        holds_const: held,
                        register: None,
                        line,
                    });
                    counter += 1;
                    block.code.insert(
                        position,
                        Op::LoadConst {
                            dest: temp,
                            src: source,
                            line,
                        },
                    );
                    position += 1;
                    block.code[position].replace_input(source, temp);
                }
                position += 1;
            }
        }
    }
    Ok(())
}

/// Runs the whole backend over a compiled program
pub fn generate(program: &mut CompiledProgram, options: &Options) -> Result<Artifact> {
    materialize_consts(program)?;

    let limit = options.fixed_point_iteration_limit;
    let mut windows = Vec::with_capacity(program.functions.len());
    {
        let functions = &program.functions;
        let vars = &mut program.vars;
        for function in functions {
            let live =
                liveness::analyze(&function.cfg, vars, &function.params, limit as usize)?;
            let intervals = regalloc::intervals(&function.cfg, &live, vars, &function.params);
            let used = regalloc::allocate(&intervals, vars, options.function_registers)?;
            windows.push((function.name, used));
        }
    }

    let layout = Layout::build(program, &windows)?;

    let mut items = assemble::lower(program, &layout)?;
    assemble::prune_jumps(&mut items, limit)?;
    let (code, entries) = assemble::resolve(&items)?;
    let bytes = assemble::encode(&code);

    let image = image::pack(program, &layout, &bytes, |name| {
        entries.get(&InternedSymbol::new(name)).copied()
    })?;

    let mut globals = BTreeMap::new();
    for &id in &program.globals {
        if program.vars.get(id).ty.is_scalar() {
            globals.insert(program.vars.name_of(id), layout.global_register(id)?);
        }
    }

    Ok(Artifact {
        image,
        code,
        entries,
        data: layout.data,
        globals,
        links: program.links.clone(),
        db_entries: program.db_entries.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middle::{
        builder::{Builder, DeclKeywords, Place},
        ty::BinOp,
    };

    fn generated(build: impl Fn(&mut Builder)) -> Result<Artifact> {
        let mut builder = Builder::new("test");
        build(&mut builder);
        let program = builder.finish()?;
        let mut compiled = crate::middle::compile(program, &Options::default())?;
        generate(&mut compiled, &Options::default())
    }

    #[test]
    fn globals_get_the_low_registers_in_declaration_order() {
        let artifact = generated(|b| {
            b.declare_var("speed", ValueType::I32, DeclKeywords::default(), true)
                .unwrap();
            b.declare_var("hue", ValueType::I32, DeclKeywords::default(), true)
                .unwrap();
            b.begin_function("init", &[], None).unwrap();
            b.end_function().unwrap();
        })
        .unwrap();

        assert_eq!(artifact.globals[&InternedSymbol::new("speed")], 1);
        assert_eq!(artifact.globals[&InternedSymbol::new("hue")], 2);
    }

    #[test]
    fn wide_constants_land_in_the_pool_past_the_registers() {
        let artifact = generated(|b| {
            let g = b
                .declare_var("out", ValueType::I32, DeclKeywords::default(), true)
                .unwrap();
            b.begin_function("init", &[], None).unwrap();
            let big = b.add_const_i32(1_000_000);
            b.assign(Place::Direct(g), big).unwrap();
            b.end_function().unwrap();
        })
        .unwrap();

        assert!(artifact.data.contains(&1_000_000));
        assert!(artifact
            .code
            .iter()
            .any(|i| i.opcode == isa::Opcode::LoadMem));
    }

    #[test]
    fn small_constants_are_immediates() {
        let artifact = generated(|b| {
            let g = b
                .declare_var("out", ValueType::I32, DeclKeywords::default(), true)
                .unwrap();
            b.begin_function("init", &[], None).unwrap();
            let small = b.add_const_i32(7);
            b.assign(Place::Direct(g), small).unwrap();
            b.end_function().unwrap();
        })
        .unwrap();

        assert!(artifact
            .code
            .iter()
            .any(|i| i.opcode == isa::Opcode::LoadImm && i.imm() == 7));
        assert!(!artifact
            .code
            .iter()
            .any(|i| i.opcode == isa::Opcode::LoadMem));
    }

    #[test]
    fn image_starts_with_the_magic_and_version() {
        let artifact = generated(|b| {
            b.begin_function("init", &[], None).unwrap();
            b.end_function().unwrap();
        })
        .unwrap();

        assert_eq!(&artifact.image[0..4], b"FXBC");
        assert_eq!(
            u16::from_le_bytes([artifact.image[4], artifact.image[5]]),
            image::ISA_VERSION
        );
        assert_eq!(
            image::header_name_hash(&artifact.image),
            Some(image::crc32(b"test"))
        );
    }

    #[test]
    fn packing_is_deterministic() {
        let build = |b: &mut Builder| {
            let g = b
                .declare_var("out", ValueType::I32, DeclKeywords::default(), true)
                .unwrap();
            b.begin_function("init", &[], None).unwrap();
            let x = b.add_const_i32(70_000);
            let one = b.add_const_i32(1);
            let sum = b.binop(BinOp::Add, x, one).unwrap();
            b.assign(Place::Direct(g), sum).unwrap();
            b.end_function().unwrap();
        };
        let first = generated(&build).unwrap();
        let second = generated(&build).unwrap();
        assert_eq!(first.image, second.image);
    }
}
