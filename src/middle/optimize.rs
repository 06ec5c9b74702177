//! Machine-independent optimization.
//!
//! All passes run on SSA form and iterate together to a fixed point:
//! constant folding, strength reduction, copy propagation, dead code
//! elimination, and loop-invariant code motion. Block merging runs
//! separately after phi resolution, once the graph is allowed to change
//! shape.

use hashbrown::HashSet;

use crate::{
    error::{CompileError, Result},
    middle::{
        cfg::{BlockId, Cfg},
        dominance::{Dominance, Loop},
        ir::Op,
        ssa,
        ty::{eval_binop, BinOp, F16_ONE},
        var::{VarId, VarTable},
        Options, Program,
    },
};

pub fn run(
    cfg: &mut Cfg,
    program: &mut Program,
    dom: &Dominance,
    loops: &[Loop],
    options: &Options,
) -> Result<()> {
    let limit = options.fixed_point_iteration_limit;

    for _ in 0..limit {
        ssa::propagate_const_versions(cfg, &mut program.vars, limit)?;

        let mut changed = false;
        changed |= fold_constants(cfg, program)?;
        changed |= strength_reduce(cfg, program)?;
        changed |= propagate_copies(cfg, &program.vars)?;
        changed |= eliminate_dead_code(cfg)?;
        if options.licm {
            changed |= hoist_invariants(cfg, dom, loops)?;
        }
        ssa::clean_up_phis(cfg, &program.vars, limit)?;

        if !changed {
            return Ok(());
        }
    }

    Err(CompileError::internal(
        "optimization did not reach a fixed point",
    ))
}

/// Replaces pure ops whose operand values are known with constant loads
fn fold_constants(cfg: &mut Cfg, program: &mut Program) -> Result<bool> {
    let mut changed = false;

    for id in cfg.ids() {
        for index in 0..cfg[id].code.len() {
            let folded = match &cfg[id].code[index] {
                Op::Binop {
                    op,
                    fixed,
                    dest,
                    lhs,
                    rhs,
                    line,
                } => {
                    let (Some(l), Some(r)) = (
                        program.vars.holds_const(*lhs),
                        program.vars.holds_const(*rhs),
                    ) else {
                        continue;
                    };
                    Some((*dest, eval_binop(*op, *fixed, l, r), *line))
                }
                Op::Not {
                    dest, src, line, ..
                } => {
                    let Some(value) = program.vars.holds_const(*src) else {
                        continue;
                    };
                    Some((*dest, i32::from(value == 0), *line))
                }
                Op::IntToFixed { dest, src, line } => {
                    let Some(value) = program.vars.holds_const(*src) else {
                        continue;
                    };
                    Some((*dest, value.wrapping_mul(F16_ONE), *line))
                }
                Op::FixedToInt { dest, src, line } => {
                    let Some(value) = program.vars.holds_const(*src) else {
                        continue;
                    };
                    Some((*dest, value / F16_ONE, *line))
                }
                _ => None,
            };

            let Some((dest, raw, line)) = folded else {
                continue;
            };
            let ty = program.vars.get(dest).ty.clone();
            let src = program.add_const(raw, ty);
            program.vars.get_mut(dest).holds_const = Some(raw);
            cfg[id].code[index] = Op::LoadConst { dest, src, line };
            changed = true;
        }
    }

    Ok(changed)
}

/// Algebraic identities with one known operand
fn strength_reduce(cfg: &mut Cfg, program: &mut Program) -> Result<bool> {
    let mut changed = false;

    for id in cfg.ids() {
        for index in 0..cfg[id].code.len() {
            let Op::Binop {
                op,
                fixed,
                dest,
                lhs,
                rhs,
                line,
            } = cfg[id].code[index].clone()
            else {
                continue;
            };

            let one = if fixed { F16_ONE } else { 1 };
            let l = program.vars.holds_const(lhs);
            let r = program.vars.holds_const(rhs);
            // Skip fully-known ops; folding owns those
            if l.is_some() && r.is_some() {
                continue;
            }

            enum Reduced {
                Copy(VarId),
                Zero,
            }

            let reduced = match op {
                BinOp::Add if l == Some(0) => Some(Reduced::Copy(rhs)),
                BinOp::Add | BinOp::Sub if r == Some(0) => Some(Reduced::Copy(lhs)),
                BinOp::Mul if l == Some(one) => Some(Reduced::Copy(rhs)),
                BinOp::Mul | BinOp::Div if r == Some(one) => Some(Reduced::Copy(lhs)),
                BinOp::Mul | BinOp::And if l == Some(0) || r == Some(0) => Some(Reduced::Zero),
                _ => None,
            };

            match reduced {
                Some(Reduced::Copy(src)) => {
                    cfg[id].code[index] = if program.vars.is_const(src) {
                        Op::LoadConst { dest, src, line }
                    } else {
                        Op::Assign { dest, src, line }
                    };
                    changed = true;
                }
                Some(Reduced::Zero) => {
                    let ty = program.vars.get(dest).ty.clone();
                    let zero = program.add_const(0, ty);
                    program.vars.get_mut(dest).holds_const = Some(0);
                    cfg[id].code[index] = Op::LoadConst {
                        dest,
                        src: zero,
                        line,
                    };
                    changed = true;
                }
                None => {}
            }
        }
    }

    Ok(changed)
}

/// Forwards register-to-register copies: uses of the copy's destination
/// read the source directly and the copy dies
fn propagate_copies(cfg: &mut Cfg, vars: &VarTable) -> Result<bool> {
    let mut changed = false;

    loop {
        let mut found: Option<(BlockId, usize, VarId, VarId)> = None;
        'scan: for id in cfg.ids() {
            for (index, op) in cfg[id].code.iter().enumerate() {
                if let Op::Assign { dest, src, .. } = op {
                    if vars.is_renamable(*dest) && vars.is_renamable(*src) {
                        found = Some((id, index, *dest, *src));
                        break 'scan;
                    }
                }
            }
        }

        let Some((id, index, dest, src)) = found else {
            return Ok(changed);
        };

        cfg[id].code.remove(index);
        for block_id in cfg.ids() {
            for op in &mut cfg[block_id].code {
                op.replace_input(dest, src);
            }
            for phi in &mut cfg[block_id].phis {
                phi.replace_input(dest, src);
            }
        }
        changed = true;
    }
}

/// Drops pure ops whose results are never read, plus declaration markers
fn eliminate_dead_code(cfg: &mut Cfg) -> Result<bool> {
    let uses = ssa::collect_uses(cfg);
    let mut changed = false;

    for id in cfg.ids() {
        let before = cfg[id].code.len();
        cfg[id].code.retain(|op| {
            if op.is_nop() {
                return false;
            }
            if op.has_side_effects() {
                return true;
            }
            let outputs = op.outputs();
            outputs.is_empty() || outputs.iter().any(|v| uses.contains(v))
        });
        changed |= cfg[id].code.len() != before;
    }

    Ok(changed)
}

/// Moves pure, invariant ops out of loops, into the tail of the loop
/// header. Only blocks that run on every iteration (they dominate every
/// latch) are eligible, so nothing speculative is ever hoisted.
fn hoist_invariants(cfg: &mut Cfg, dom: &Dominance, loops: &[Loop]) -> Result<bool> {
    let mut changed = false;

    for l in loops {
        let mut defined: HashSet<VarId> = HashSet::new();
        for &id in &l.body {
            for op in cfg[id].code.iter().chain(&cfg[id].phis) {
                defined.extend(op.outputs());
            }
        }

        let body: Vec<BlockId> = l.body.iter().copied().collect();
        for block_id in body {
            if !l.latches.iter().all(|&latch| dom.dominates(block_id, latch)) {
                continue;
            }

            let mut index = 0;
            while index < cfg[block_id].code.len() {
                let op = &cfg[block_id].code[index];
                let pure = matches!(
                    op,
                    Op::Binop { .. }
                        | Op::Not { .. }
                        | Op::IntToFixed { .. }
                        | Op::FixedToInt { .. }
                        | Op::LoadConst { .. }
                        | Op::Assign { .. }
                );
                let invariant =
                    pure && op.inputs().iter().all(|input| !defined.contains(input));

                if !invariant {
                    index += 1;
                    continue;
                }

                let op = cfg[block_id].code.remove(index);
                for output in op.outputs() {
                    defined.remove(&output);
                }
                let header = l.header;
                let at = cfg[header].code.len().saturating_sub(1);
                cfg[header].code.insert(at, op);
                changed = true;
            }
        }
    }

    Ok(changed)
}

/// Collapses jump-only chains: a block whose single successor has no other
/// predecessor absorbs it. Runs after phi resolution, when no phis remain
/// to keep consistent.
pub fn merge_blocks(cfg: &mut Cfg, limit: u32) -> Result<()> {
    for _ in 0..limit {
        let mut merged = false;

        'search: for id in cfg.ids() {
            if !cfg.blocks.contains_key(&id) {
                continue;
            }
            let succ = match cfg[id].succs.as_slice() {
                [single] => *single,
                _ => continue,
            };
            if succ == id
                || cfg[succ].preds.len() != 1
                || !cfg[succ].phis.is_empty()
                || !matches!(cfg[id].terminator()?, Op::Jump { .. })
            {
                continue;
            }

            let absorbed = cfg
                .blocks
                .remove(&succ)
                .ok_or_else(|| CompileError::internal("merge target vanished"))?;
            let block = &mut cfg[id];
            block.code.pop();
            block.code.extend(absorbed.code);

            // Jumps that targeted the absorbed block land here now
            cfg.label_blocks.insert(absorbed.label, id);
            cfg.rebuild_edges()?;
            merged = true;
            break 'search;
        }

        if !merged {
            return Ok(());
        }
    }

    Err(CompileError::internal("block merging did not converge"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        intern::InternedSymbol,
        middle::{
            builder::{Builder, DeclKeywords, Place},
            dominance,
            ty::ValueType,
            FIXED_POINT_ITERATION_LIMIT,
        },
    };

    fn optimized(build: impl FnOnce(&mut Builder)) -> (Cfg, Program) {
        let mut b = Builder::new("test");
        build(&mut b);
        let mut program = b.finish().unwrap();
        let name = InternedSymbol::new("init");
        ssa::init_vars(&mut program, name).unwrap();

        let code = std::mem::take(&mut program.functions.get_mut(&name).unwrap().code);
        let mut cfg = Cfg::build(code).unwrap();
        cfg.remove_unreachable().unwrap();
        let params = program.functions[&name].params.clone();
        ssa::construct(
            &mut cfg,
            &mut program.vars,
            &params,
            FIXED_POINT_ITERATION_LIMIT,
        )
        .unwrap();
        ssa::clean_up_phis(&mut cfg, &program.vars, FIXED_POINT_ITERATION_LIMIT).unwrap();
        ssa::verify(&cfg, &program.vars).unwrap();

        let dom = Dominance::compute(&cfg);
        let loops = dominance::find_loops(&cfg, &dom).unwrap();
        run(&mut cfg, &mut program, &dom, &loops, &Options::default()).unwrap();
        (cfg, program)
    }

    fn all_code(cfg: &Cfg) -> Vec<&Op> {
        cfg.blocks.values().flat_map(|b| &b.code).collect()
    }

    #[test]
    fn constant_expressions_fold_through_copies() {
        let (cfg, program) = optimized(|b| {
            b.begin_function("init", &[], None).unwrap();
            let x = b
                .declare_var("x", ValueType::I32, DeclKeywords::default(), false)
                .unwrap();
            let y = b
                .declare_var("y", ValueType::I32, DeclKeywords::default(), false)
                .unwrap();
            let three = b.add_const_i32(3);
            b.assign(Place::Direct(x), three).unwrap();
            let x_val = b.get_var("x").unwrap();
            let sum = b.binop(BinOp::Add, x_val, x_val).unwrap();
            b.assign(Place::Direct(y), sum).unwrap();
            let y_val = b.get_var("y").unwrap();
            b.fn_return(Some(y_val)).unwrap();
            b.end_function().unwrap();
        });

        assert!(!all_code(&cfg)
            .iter()
            .any(|op| matches!(op, Op::Binop { .. })));
        // 6 made it into the constant pool
        assert!(program
            .consts
            .iter()
            .any(|&c| program.vars.holds_const(c) == Some(6)));
    }

    #[test]
    fn multiplying_by_fixed_one_becomes_a_copy_and_dies() {
        let (cfg, _) = optimized(|b| {
            b.begin_function("init", &[], None).unwrap();
            let x = b
                .declare_var("x", ValueType::F16, DeclKeywords::default(), false)
                .unwrap();
            let noise = b.call("rand", &[]).unwrap().unwrap();
            b.assign(Place::Direct(x), noise).unwrap();
            let one = b.add_const_f16(1.0);
            let x_val = b.get_var("x").unwrap();
            let product = b.binop(BinOp::Mul, x_val, one).unwrap();
            b.assign(Place::Direct(x), product).unwrap();
            let out = b.get_var("x").unwrap();
            b.fn_return(Some(out)).unwrap();
            b.end_function().unwrap();
        });

        assert!(!all_code(&cfg)
            .iter()
            .any(|op| matches!(op, Op::Binop { .. } | Op::Assign { .. })));
    }

    #[test]
    fn unread_results_are_removed() {
        let (cfg, _) = optimized(|b| {
            b.begin_function("init", &[], None).unwrap();
            let x = b
                .declare_var("x", ValueType::I32, DeclKeywords::default(), false)
                .unwrap();
            let keep = b
                .declare_var("keep", ValueType::I32, DeclKeywords::default(), false)
                .unwrap();
            // x is computed from an argumentless library call result and
            // never read again; the binop must die, the call must stay
            let noise = b.call("rand", &[]).unwrap().unwrap();
            let one = b.add_const_i32(1);
            let sum = b.binop(BinOp::Add, noise, one).unwrap();
            b.assign(Place::Direct(x), sum).unwrap();
            b.assign(Place::Direct(keep), one).unwrap();
            let out = b.get_var("keep").unwrap();
            b.fn_return(Some(out)).unwrap();
            b.end_function().unwrap();
        });

        let ops = all_code(&cfg);
        assert!(!ops.iter().any(|op| matches!(op, Op::Binop { .. })));
        assert!(ops.iter().any(|op| matches!(op, Op::LibCall { .. })));
        assert!(!ops.iter().any(|op| matches!(op, Op::Define { .. })));
    }

    #[test]
    fn invariant_code_moves_to_the_loop_header() {
        let (cfg, _program) = optimized(|b| {
            b.declare_var("scale", ValueType::I32, DeclKeywords::default(), true)
                .unwrap();
            b.begin_function("init", &[], None).unwrap();
            let acc = b
                .declare_var("acc", ValueType::I32, DeclKeywords::default(), false)
                .unwrap();
            let limit = b.add_const_i32(10);
            b.begin_for("i", limit).unwrap();
            let scale = b.get_var("scale").unwrap();
            let invariant = b.binop(BinOp::Mul, scale, scale).unwrap();
            b.augassign(Place::Direct(acc), BinOp::Add, invariant).unwrap();
            b.end_for().unwrap();
            let out = b.get_var("acc").unwrap();
            b.fn_return(Some(out)).unwrap();
            b.end_function().unwrap();
        });

        let dom = Dominance::compute(&cfg);
        let loops = dominance::find_loops(&cfg, &dom).unwrap();
        assert_eq!(loops.len(), 1);

        let header_ops = &cfg[loops[0].header].code;
        let hoisted = header_ops.iter().any(|op| {
            matches!(op, Op::Binop { op: BinOp::Mul, .. })
        });
        assert!(hoisted, "scale * scale should sit in the header");

        // The multiply no longer executes inside the loop body
        for &id in &loops[0].body {
            assert!(!cfg[id]
                .code
                .iter()
                .any(|op| matches!(op, Op::Binop { op: BinOp::Mul, .. })));
        }
    }

    #[test]
    fn jump_chains_collapse_after_resolution() {
        let (mut cfg, mut program) = optimized(|b| {
            b.begin_function("init", &[], None).unwrap();
            let x = b
                .declare_var("x", ValueType::I32, DeclKeywords::default(), false)
                .unwrap();
            let flag = b.call("rand", &[]).unwrap().unwrap();
            b.ifelse(flag).unwrap();
            let one = b.add_const_i32(1);
            b.fn_return(Some(one)).unwrap();
            b.end_if().unwrap();
            b.do_else().unwrap();
            let two = b.add_const_i32(2);
            b.assign(Place::Direct(x), two).unwrap();
            b.end_ifelse().unwrap();
            let out = b.get_var("x").unwrap();
            b.fn_return(Some(out)).unwrap();
            b.end_function().unwrap();
        });

        ssa::resolve_phis(&mut cfg, &mut program.vars).unwrap();
        ssa::assert_no_critical_edges(&cfg).unwrap();

        let before = cfg.blocks.len();
        merge_blocks(&mut cfg, FIXED_POINT_ITERATION_LIMIT).unwrap();
        assert!(cfg.blocks.len() < before);

        // Edges stay consistent afterwards
        for block in cfg.blocks.values() {
            for &succ in &block.succs {
                assert!(cfg[succ].preds.contains(&block.id));
            }
        }
    }
}
