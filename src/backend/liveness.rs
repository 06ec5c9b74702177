//! Backward liveness analysis over a laid-out function body.
//!
//! Runs after phi resolution, so the control flow graph contains plain
//! instructions only. Blocks are laid out in id order (the same order the
//! assembler emits them) and flattened into a single indexed instruction
//! list; liveness is then a classic backward fixed point over that list.

use hashbrown::HashSet;
use itertools::Itertools;

use crate::{
    error::{CompileError, Result},
    middle::{
        cfg::{BlockId, Cfg},
        var::{VarId, VarTable},
    },
};

/// Per-instruction live sets for one function
pub struct Liveness {
    /// Flat index -> (block, position within block)
    pub index: Vec<(BlockId, usize)>,
    /// Variables live into each instruction
    pub live_in: Vec<HashSet<VarId>>,
    /// Variables live out of each instruction
    pub live_out: Vec<HashSet<VarId>>,
}

pub fn analyze(
    cfg: &Cfg,
    vars: &VarTable,
    params: &[VarId],
    limit: usize,
) -> Result<Liveness> {
    let mut index = Vec::new();
    let mut block_start = hashbrown::HashMap::new();

    for (&id, block) in &cfg.blocks {
        block_start.insert(id, index.len());
        for position in 0..block.code.len() {
            index.push((id, position));
        }
    }

    // Successor indices per instruction. A terminator continues at the
    // start of each target block, everything else falls through.
    let mut successors = vec![Vec::new(); index.len()];
    for (flat, &(id, position)) in index.iter().enumerate() {
        let op = &cfg.blocks[&id].code[position];
        if op.is_terminator() {
            for label in op.targets() {
                let target = cfg.block_of(label)?;
                successors[flat].push(block_start[&target]);
            }
        } else {
            successors[flat].push(flat + 1);
        }
    }

    let mut live_in = vec![HashSet::new(); index.len()];
    let mut live_out = vec![HashSet::new(); index.len()];

    let mut iterations = 0;
    loop {
        let mut changed = false;

        for flat in (0..index.len()).rev() {
            let (id, position) = index[flat];
            let op = &cfg.blocks[&id].code[position];

            let mut out = HashSet::new();
            for &successor in &successors[flat] {
                out.extend(live_in[successor].iter().copied());
            }

            let mut live = out.clone();
            for def in op.outputs() {
                live.remove(&def);
            }
            for used in op.inputs() {
                if vars.is_renamable(used) {
                    live.insert(used);
                }
            }

            if out != live_out[flat] || live != live_in[flat] {
                changed = true;
                live_out[flat] = out;
                live_in[flat] = live;
            }
        }

        if !changed {
            break;
        }
        iterations += 1;
        if iterations > limit {
            return Err(CompileError::internal(
                "liveness analysis failed to converge",
            ));
        }
    }

    // Nothing but parameters may be live into the entry: anything else
    // is a use of a value no path defines.
    if let Some(first) = live_in.first() {
        let undefined = first
            .iter()
            .filter(|id| !params.contains(id))
            .collect::<Vec<_>>();
        if !undefined.is_empty() {
            return Err(CompileError::internal(format!(
                "used before definition: {}",
                undefined.iter().map(|&&id| vars.name_of(id)).join(", ")
            )));
        }
    }

    Ok(Liveness {
        index,
        live_in,
        live_out,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middle::{
        builder::{Builder, DeclKeywords, Place},
        ty::{BinOp, ValueType},
        Options,
    };

    fn compiled(build: impl FnOnce(&mut Builder)) -> (Cfg, VarTable, Vec<VarId>) {
        let mut builder = Builder::new("test");
        build(&mut builder);
        let program = builder.finish().unwrap();
        let compiled = crate::middle::compile(program, &Options::default()).unwrap();
        let function = compiled.functions.into_iter().next().unwrap();
        (function.cfg, compiled.vars, function.params)
    }

    #[test]
    fn value_stays_live_across_a_branch() {
        let (cfg, vars, params) = compiled(|b| {
            b.begin_function("init", &[], Some(ValueType::I32)).unwrap();
            let x = b
                .declare_var("x", ValueType::I32, DeclKeywords::default(), false)
                .unwrap();
            let seed = b.call("rand", &[]).unwrap().unwrap();
            b.assign(Place::Direct(x), seed).unwrap();
            let cond = b.get_var("x").unwrap();
            b.ifelse(cond).unwrap();
            let one = b.add_const_i32(1);
            b.augassign(Place::Direct(x), BinOp::Add, one).unwrap();
            b.end_if().unwrap();
            b.end_ifelse().unwrap();
            let out = b.get_var("x").unwrap();
            b.fn_return(Some(out)).unwrap();
            b.end_function().unwrap();
        });

        let liveness = analyze(&cfg, &vars, &params, 128).unwrap();
        // The fetched value feeds the branch, the add, and the return, so
        // it must cross at least one instruction boundary.
        assert!(liveness.live_out.iter().any(|set| !set.is_empty()));
    }

    #[test]
    fn nothing_is_live_into_the_entry_of_a_parameterless_function() {
        let (cfg, vars, params) = compiled(|b| {
            b.begin_function("init", &[], Some(ValueType::I32)).unwrap();
            let v = b.add_const_i32(7);
            b.fn_return(Some(v)).unwrap();
            b.end_function().unwrap();
        });

        let liveness = analyze(&cfg, &vars, &params, 128).unwrap();
        assert!(liveness.live_in[0].is_empty());
    }
}
