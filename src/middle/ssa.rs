//! SSA construction and destruction.
//!
//! Renaming follows the on-the-fly algorithm of Braun et al.: blocks are
//! filled in reverse postorder, name lookups walk predecessor chains, and a
//! block whose predecessors are not all filled yet (loop headers) is filled
//! unsealed, parking [`Op::IncompletePhi`] placeholders that are completed
//! once the block can be sealed. Afterwards trivial phis are folded away,
//! the result is verified, and at the end of the middle stage phis are
//! resolved back into edge moves on freshly split edges so that no critical
//! edge survives into the backend.

use std::collections::{BTreeMap, BTreeSet};

use hashbrown::{HashMap, HashSet};

use crate::{
    error::{CompileError, Result},
    intern::InternedSymbol,
    middle::{
        cfg::{BlockId, Cfg},
        ir::Op,
        var::{Var, VarId, VarTable},
        Program,
    },
};

/* Pre-SSA normalization */

/// Prepares a function body for renaming: scalar locals are zero
/// initialized at their declaration, and every scalar global the function
/// touches is shadowed by a local of the same name, loaded once at entry
/// and stored back before each return if written. After this rewrite the
/// body references globals only through [`Op::Load`] and [`Op::Store`].
pub fn init_vars(program: &mut Program, function: InternedSymbol) -> Result<()> {
    let mut code = {
        let function = program
            .functions
            .get_mut(&function)
            .ok_or_else(|| CompileError::internal(format!("unknown function '{function}'")))?;
        std::mem::take(&mut function.code)
    };

    // Zero initialization makes every local defined on every path, which
    // keeps lookups from ever reaching the entry without a definition.
    let mut body = Vec::with_capacity(code.len());
    for op in code.drain(..) {
        match op {
            Op::Define { var, line } if program.vars.is_renamable(var) => {
                let ty = program.vars.get(var).ty.clone();
                let zero = program.add_const(0, ty);
                body.push(Op::Define { var, line });
                body.push(Op::LoadConst {
                    dest: var,
                    src: zero,
                    line,
                });
            }
            op => body.push(op),
        }
    }

    let is_shadowable = |vars: &VarTable, id: VarId| {
        let var = vars.get(id);
        var.is_global && var.ty.is_scalar()
    };

    let mut touched: Vec<VarId> = Vec::new();
    let mut written: HashSet<VarId> = HashSet::new();
    for op in &body {
        for v in op.inputs() {
            if is_shadowable(&program.vars, v) && !touched.contains(&v) {
                touched.push(v);
            }
        }
        for v in op.outputs() {
            if is_shadowable(&program.vars, v) {
                if !touched.contains(&v) {
                    touched.push(v);
                }
                written.insert(v);
            }
        }
    }

    let entry_line = body.first().map_or(0, Op::line);
    let mut prologue = Vec::new();
    let mut stores: Vec<(VarId, VarId)> = Vec::new();

    for global in touched {
        let source = program.vars.get(global);
        let shadow = program.vars.insert(Var {
            name: source.name,
            ty: source.ty.clone(),
            ssa_version: None,
            is_const: false,
            is_temp: false,
            is_global: false,
            is_published: false,
            is_persistent: false,
            holds_const: None,
            register: None,
            line: source.line,
        });

        prologue.push(Op::Load {
            dest: shadow,
            global,
            line: entry_line,
        });
        for op in &mut body {
            op.replace_input(global, shadow);
            op.replace_output(global, shadow);
        }
        if written.contains(&global) {
            stores.push((global, shadow));
        }
    }

    let mut out = prologue;
    for op in body {
        if let Op::Return { .. } = op {
            let line = op.line();
            for &(global, shadow) in &stores {
                out.push(Op::Store {
                    global,
                    src: shadow,
                    line,
                });
            }
        }
        out.push(op);
    }

    let function = program
        .functions
        .get_mut(&function)
        .ok_or_else(|| CompileError::internal("function vanished during init"))?;
    function.code = out;
    Ok(())
}

/* Renaming */

struct SsaBuilder<'a> {
    cfg: &'a mut Cfg,
    vars: &'a mut VarTable,
    versions: HashMap<InternedSymbol, u32>,
}

impl SsaBuilder<'_> {
    fn next_version(&mut self, name: InternedSymbol) -> u32 {
        let counter = self.versions.entry(name).or_insert(0);
        *counter += 1;
        *counter
    }

    /// Braun-style variable lookup. `exemplar` is any handle carrying the
    /// name being resolved; it donates the name and type when a phi has to
    /// be minted. The phi destination is cached in the block's definition
    /// map before predecessor recursion so loops terminate.
    fn lookup(&mut self, block: BlockId, exemplar: VarId) -> Result<VarId> {
        let name = self.vars.name_of(exemplar);
        if let Some(&found) = self.cfg[block].defs.get(&name) {
            return Ok(found);
        }

        let line = self.vars.get(exemplar).line;

        if !self.cfg[block].sealed {
            let version = self.next_version(name);
            let dest = self.vars.new_version(exemplar, version);
            self.cfg[block].phis.push(Op::IncompletePhi { dest, name, line });
            self.cfg[block].defs.insert(name, dest);
            return Ok(dest);
        }

        let preds: Vec<BlockId> = self.cfg[block].preds.iter().copied().collect();
        match preds.as_slice() {
            [] => Err(CompileError::internal(format!(
                "use of '{name}' before definition"
            ))),
            [single] => {
                let found = self.lookup(*single, exemplar)?;
                self.cfg[block].defs.insert(name, found);
                Ok(found)
            }
            _ => {
                let version = self.next_version(name);
                let dest = self.vars.new_version(exemplar, version);
                self.cfg[block].defs.insert(name, dest);

                let mut sources = BTreeMap::new();
                for pred in preds {
                    sources.insert(pred, self.lookup(pred, exemplar)?);
                }
                self.cfg[block].phis.push(Op::Phi {
                    dest,
                    sources,
                    line,
                });
                Ok(dest)
            }
        }
    }

    /// Renames every use and definition in the block
    fn fill(&mut self, id: BlockId) -> Result<()> {
        for index in 0..self.cfg[id].code.len() {
            // Parameters already carry version 0, but their handle is only
            // the entry definition; a use still resolves through the defs
            // map so it sees any reassignment first.
            for used in self.cfg[id].code[index].inputs() {
                if self.vars.is_renamable(used) {
                    let version = self.lookup(id, used)?;
                    if version != used {
                        self.cfg[id].code[index].replace_input(used, version);
                    }
                }
            }

            for defined in self.cfg[id].code[index].outputs() {
                if !self.vars.is_renamable(defined) {
                    continue;
                }
                let name = self.vars.name_of(defined);
                let version = self.next_version(name);
                let fresh = self.vars.new_version(defined, version);
                self.cfg[id].code[index].replace_output(defined, fresh);
                self.cfg[id].defs.insert(name, fresh);
            }

            let constant = match &self.cfg[id].code[index] {
                Op::LoadConst { dest, src, .. } => Some((*dest, *src)),
                _ => None,
            };
            if let Some((dest, src)) = constant {
                self.vars.get_mut(dest).holds_const = self.vars.holds_const(src);
            }
        }

        self.cfg[id].filled = true;
        Ok(())
    }

    /// Completes the block's parked incomplete phis; callable once every
    /// predecessor is filled
    fn seal(&mut self, id: BlockId) -> Result<()> {
        self.cfg[id].sealed = true;

        let pending = std::mem::take(&mut self.cfg[id].phis);
        let mut completed = Vec::with_capacity(pending.len());
        for phi in pending {
            match phi {
                Op::IncompletePhi { dest, name: _, line } => {
                    let preds: Vec<BlockId> = self.cfg[id].preds.iter().copied().collect();
                    let mut sources = BTreeMap::new();
                    for pred in preds {
                        sources.insert(pred, self.lookup(pred, dest)?);
                    }
                    completed.push(Op::Phi {
                        dest,
                        sources,
                        line,
                    });
                }
                phi => completed.push(phi),
            }
        }

        // Lookups above may have minted further phis for this block
        self.cfg[id].phis.append(&mut completed);
        Ok(())
    }

    fn seal_ready(&mut self, order: &[BlockId]) -> Result<()> {
        for &id in order {
            if !self.cfg[id].sealed
                && self.cfg[id]
                    .preds
                    .iter()
                    .all(|&pred| self.cfg[pred].filled)
            {
                self.seal(id)?;
            }
        }
        Ok(())
    }
}

/// Renames the whole function into SSA form. The fill order is a fixed
/// point over reverse postorder: a block fills once every predecessor has,
/// and when only back edges remain unfilled (loop headers) the earliest
/// stuck block is filled unsealed.
pub fn construct(cfg: &mut Cfg, vars: &mut VarTable, params: &[VarId], limit: u32) -> Result<()> {
    let entry = cfg.entry;
    for &param in params {
        let name = vars.name_of(param);
        cfg[entry].defs.insert(name, param);
    }

    let order = cfg.reverse_postorder();
    let mut builder = SsaBuilder {
        cfg,
        vars,
        versions: HashMap::new(),
    };

    for _ in 0..limit {
        builder.seal_ready(&order)?;

        let mut progress = false;
        for &id in &order {
            if builder.cfg[id].filled {
                continue;
            }
            let ready = id == entry
                || builder.cfg[id]
                    .preds
                    .iter()
                    .all(|&pred| builder.cfg[pred].filled);
            if ready {
                builder.fill(id)?;
                builder.seal_ready(&order)?;
                progress = true;
            }
        }

        if order.iter().all(|&id| builder.cfg[id].filled) {
            builder.seal_ready(&order)?;
            if let Some(&stuck) = order.iter().find(|&&id| !builder.cfg[id].sealed) {
                return Err(CompileError::internal(format!(
                    "block {stuck:?} could not be sealed"
                )));
            }
            return Ok(());
        }

        if !progress {
            // Everything remaining waits on a back edge; fill the earliest
            // block that already has a filled predecessor, leaving it
            // unsealed so lookups park incomplete phis.
            let stuck = order.iter().copied().find(|&id| {
                !builder.cfg[id].filled
                    && builder.cfg[id]
                        .preds
                        .iter()
                        .any(|&pred| builder.cfg[pred].filled)
            });
            let Some(id) = stuck else {
                return Err(CompileError::internal("renaming cannot make progress"));
            };
            builder.fill(id)?;
        }
    }

    Err(CompileError::internal(
        "renaming did not converge within the iteration limit",
    ))
}

/* Post-renaming clean up */

/// Propagates compile-time known values along copies and phis until
/// nothing changes
pub fn propagate_const_versions(cfg: &Cfg, vars: &mut VarTable, limit: u32) -> Result<()> {
    for _ in 0..limit {
        let mut changed = false;

        for id in cfg.ids() {
            for index in 0..cfg[id].code.len() {
                let known = match &cfg[id].code[index] {
                    Op::LoadConst { dest, src, .. } => Some((*dest, vars.holds_const(*src))),
                    Op::Assign { dest, src, .. } => Some((*dest, vars.holds_const(*src))),
                    _ => None,
                };
                if let Some((dest, Some(value))) = known {
                    if vars.holds_const(dest) != Some(value) {
                        vars.get_mut(dest).holds_const = Some(value);
                        changed = true;
                    }
                }
            }

            for index in 0..cfg[id].phis.len() {
                let Op::Phi { dest, sources, .. } = &cfg[id].phis[index] else {
                    continue;
                };
                let dest = *dest;
                let agreed: BTreeSet<Option<i32>> = sources
                    .values()
                    .filter(|&&source| source != dest)
                    .map(|&source| vars.holds_const(source))
                    .collect();
                if let [Some(value)] = agreed.into_iter().collect::<Vec<_>>().as_slice() {
                    if vars.holds_const(dest) != Some(*value) {
                        vars.get_mut(dest).holds_const = Some(*value);
                        changed = true;
                    }
                }
            }
        }

        if !changed {
            return Ok(());
        }
    }

    Err(CompileError::internal(
        "constant propagation did not converge",
    ))
}

/// Every variable read anywhere in the function, phi sources included
pub(crate) fn collect_uses(cfg: &Cfg) -> HashSet<VarId> {
    let mut uses = HashSet::new();
    for block in cfg.blocks.values() {
        for op in block.code.iter().chain(&block.phis) {
            uses.extend(op.inputs());
        }
    }
    uses
}

fn replace_everywhere(cfg: &mut Cfg, from: VarId, to: VarId) {
    for id in cfg.ids() {
        for op in &mut cfg[id].code {
            op.replace_input(from, to);
        }
        for phi in &mut cfg[id].phis {
            phi.replace_input(from, to);
        }
    }
}

/// Removes trivial phis (all non-self sources identical) and dead phis
/// (destination never read), iterating because removing one can expose
/// another
pub fn clean_up_phis(cfg: &mut Cfg, vars: &VarTable, limit: u32) -> Result<()> {
    for _ in 0..limit {
        let uses = collect_uses(cfg);
        let mut action: Option<(BlockId, usize, Option<VarId>)> = None;

        'scan: for id in cfg.ids() {
            for (index, phi) in cfg[id].phis.iter().enumerate() {
                let Op::Phi { dest, sources, .. } = phi else {
                    return Err(CompileError::internal("incomplete phi after sealing"));
                };

                let distinct: BTreeSet<VarId> = sources
                    .values()
                    .copied()
                    .filter(|source| source != dest)
                    .collect();

                match distinct.len() {
                    1 => {
                        let replacement = distinct
                            .into_iter()
                            .next()
                            .ok_or_else(|| CompileError::internal("empty phi source set"))?;
                        action = Some((id, index, Some(replacement)));
                        break 'scan;
                    }
                    0 => {
                        // Only references itself; harmless if nothing reads it
                        if !uses.contains(dest) {
                            action = Some((id, index, None));
                            break 'scan;
                        }
                        return Err(CompileError::internal(format!(
                            "phi for '{}' has no real source",
                            vars.get(*dest).display_name()
                        )));
                    }
                    _ => {
                        if !uses.contains(dest) {
                            action = Some((id, index, None));
                            break 'scan;
                        }
                    }
                }
            }
        }

        let Some((id, index, replacement)) = action else {
            return Ok(());
        };

        let removed = cfg[id].phis.remove(index);
        if let (Some(to), Op::Phi { dest, .. }) = (replacement, removed) {
            replace_everywhere(cfg, dest, to);
        }
    }

    Err(CompileError::internal("phi clean up did not converge"))
}

/// Checks the SSA invariants: every renamable definition is versioned and
/// unique, and every renamable use resolves to a version
pub fn verify(cfg: &Cfg, vars: &VarTable) -> Result<()> {
    let mut defined: HashSet<VarId> = HashSet::new();

    for block in cfg.blocks.values() {
        for op in block.phis.iter().chain(&block.code) {
            for defined_var in op.outputs() {
                if !vars.is_renamable(defined_var) {
                    continue;
                }
                if vars.get(defined_var).ssa_version.is_none() {
                    return Err(CompileError::internal(format!(
                        "unversioned definition of '{}'",
                        vars.get(defined_var).display_name()
                    )));
                }
                if !defined.insert(defined_var) {
                    return Err(CompileError::internal(format!(
                        "'{}' is defined more than once",
                        vars.get(defined_var).display_name()
                    )));
                }
            }
        }
    }

    for block in cfg.blocks.values() {
        for op in block.phis.iter().chain(&block.code) {
            for used in op.inputs() {
                if vars.is_renamable(used) && vars.get(used).ssa_version.is_none() {
                    return Err(CompileError::internal(format!(
                        "unrenamed use of '{}'",
                        vars.get(used).display_name()
                    )));
                }
            }
        }
    }

    Ok(())
}

/* Leaving SSA */

/// Orders a parallel move set so no destination is clobbered before it is
/// read, breaking cycles with a scratch copy
fn sequence_moves(
    mut moves: Vec<(VarId, VarId)>,
    vars: &mut VarTable,
    line: u32,
) -> Vec<Op> {
    let mut out = Vec::with_capacity(moves.len());

    while !moves.is_empty() {
        let safe = (0..moves.len()).find(|&i| {
            let dest = moves[i].0;
            !moves
                .iter()
                .enumerate()
                .any(|(j, &(_, src))| j != i && src == dest)
        });

        match safe {
            Some(i) => {
                let (dest, src) = moves.remove(i);
                out.push(Op::Assign { dest, src, line });
            }
            None => {
                // Every move's destination feeds another move: a cycle.
                // Park the first destination and redirect its readers.
                let (dest, _) = moves[0];
                let source = vars.get(dest);
                let scratch = vars.insert(Var {
                    name: source.name,
                    ty: source.ty.clone(),
                    ssa_version: None,
                    is_const: false,
                    is_temp: true,
                    is_global: false,
                    is_published: false,
                    is_persistent: false,
                    holds_const: None,
                    register: None,
                    line: source.line,
                });
                out.push(Op::Assign {
                    dest: scratch,
                    src: dest,
                    line,
                });
                for m in &mut moves {
                    if m.1 == dest {
                        m.1 = scratch;
                    }
                }
            }
        }
    }

    out
}

/// Replaces every phi with explicit moves on its incoming edges. Moves for
/// an edge out of a multi-successor block land in a fresh block spliced
/// into the edge; afterwards every remaining critical edge is split the
/// same way so the backend never sees one.
pub fn resolve_phis(cfg: &mut Cfg, vars: &mut VarTable) -> Result<()> {
    for id in cfg.ids() {
        let phis = std::mem::take(&mut cfg[id].phis);
        if phis.is_empty() {
            continue;
        }

        let preds: Vec<BlockId> = cfg[id].preds.iter().copied().collect();
        for pred in preds {
            let mut moves = Vec::with_capacity(phis.len());
            let mut line = 0;
            for phi in &phis {
                let Op::Phi { dest, sources, .. } = phi else {
                    return Err(CompileError::internal("incomplete phi at resolution"));
                };
                line = phi.line();
                let src = sources.get(&pred).copied().ok_or_else(|| {
                    CompileError::internal(format!("phi missing a source for {pred:?}"))
                })?;
                if src != *dest {
                    moves.push((*dest, src));
                }
            }

            let sequenced = sequence_moves(moves, vars, line);
            if sequenced.is_empty() {
                continue;
            }

            if cfg[pred].succs.len() > 1 {
                // Critical edge: the moves need their own block
                let target_label = cfg[id].label;
                let merge = cfg.create_block();
                let merge_label = cfg[merge].label;
                {
                    let block = &mut cfg[merge];
                    block.code = sequenced;
                    block.code.push(Op::Jump {
                        target: target_label,
                        line,
                    });
                    block.filled = true;
                    block.sealed = true;
                }
                cfg[pred]
                    .terminator_mut()?
                    .retarget(target_label, merge_label);
            } else {
                let block = &mut cfg[pred];
                let at = block.code.len().saturating_sub(1);
                block.code.splice(at..at, sequenced);
            }
        }
    }

    // Split the critical edges that carried no moves as well, so the
    // invariant holds uniformly.
    for from in cfg.ids() {
        if cfg[from].succs.len() < 2 {
            continue;
        }
        let targets: BTreeSet<BlockId> = cfg[from].succs.iter().copied().collect();
        for to in targets {
            if cfg[to].preds.len() < 2 {
                continue;
            }
            let line = cfg[from].terminator()?.line();
            let target_label = cfg[to].label;
            let merge = cfg.create_block();
            let merge_label = cfg[merge].label;
            {
                let block = &mut cfg[merge];
                block.code.push(Op::Jump {
                    target: target_label,
                    line,
                });
                block.filled = true;
                block.sealed = true;
            }
            cfg[from]
                .terminator_mut()?
                .retarget(target_label, merge_label);
        }
    }

    cfg.rebuild_edges()
}

/// Backend precondition: no block with multiple successors feeds a block
/// with multiple predecessors
pub fn assert_no_critical_edges(cfg: &Cfg) -> Result<()> {
    for block in cfg.blocks.values() {
        if block.succs.len() < 2 {
            continue;
        }
        for &succ in &block.succs {
            if cfg[succ].preds.len() > 1 {
                return Err(CompileError::internal(format!(
                    "critical edge {:?} -> {succ:?}",
                    block.id
                )));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middle::{
        builder::{Builder, DeclKeywords, Place},
        ty::{BinOp, ValueType},
        FIXED_POINT_ITERATION_LIMIT,
    };

    fn lower(build: impl FnOnce(&mut Builder)) -> (Cfg, Program) {
        let mut b = Builder::new("test");
        build(&mut b);
        let mut program = b.finish().unwrap();
        let name = InternedSymbol::new("init");
        init_vars(&mut program, name).unwrap();

        let code = std::mem::take(&mut program.functions.get_mut(&name).unwrap().code);
        let mut cfg = Cfg::build(code).unwrap();
        cfg.remove_unreachable().unwrap();
        let params = program.functions[&name].params.clone();
        construct(
            &mut cfg,
            &mut program.vars,
            &params,
            FIXED_POINT_ITERATION_LIMIT,
        )
        .unwrap();
        (cfg, program)
    }

    fn phi_count(cfg: &Cfg) -> usize {
        cfg.blocks.values().map(|b| b.phis.len()).sum()
    }

    #[test]
    fn straight_line_code_gets_consecutive_versions() {
        let (cfg, program) = lower(|b| {
            b.begin_function("init", &[], None).unwrap();
            let x = b
                .declare_var("x", ValueType::I32, DeclKeywords::default(), false)
                .unwrap();
            let one = b.add_const_i32(1);
            b.assign(Place::Direct(x), one).unwrap();
            let x_val = b.get_var("x").unwrap();
            let two = b.add_const_i32(2);
            let sum = b.binop(BinOp::Add, x_val, two).unwrap();
            b.assign(Place::Direct(x), sum).unwrap();
            b.end_function().unwrap();
        });

        verify(&cfg, &program.vars).unwrap();

        let versions: Vec<u32> = cfg
            .blocks
            .values()
            .flat_map(|block| &block.code)
            .flat_map(Op::outputs)
            .filter(|&v| program.vars.name_of(v) == InternedSymbol::new("x"))
            .filter_map(|v| program.vars.get(v).ssa_version)
            .collect();
        // Zero-init, then the two assignments
        assert_eq!(versions.len(), 3);
        assert_eq!(phi_count(&cfg), 0);
    }

    #[test]
    fn diamond_join_creates_a_phi() {
        let (mut cfg, program) = lower(|b| {
            b.begin_function("init", &[], None).unwrap();
            let x = b
                .declare_var("x", ValueType::I32, DeclKeywords::default(), false)
                .unwrap();
            let flag = b
                .declare_var("flag", ValueType::I32, DeclKeywords::default(), false)
                .unwrap();
            b.ifelse(flag).unwrap();
            let one = b.add_const_i32(1);
            b.assign(Place::Direct(x), one).unwrap();
            b.end_if().unwrap();
            b.do_else().unwrap();
            let two = b.add_const_i32(2);
            b.assign(Place::Direct(x), two).unwrap();
            b.end_ifelse().unwrap();
            let x_val = b.get_var("x").unwrap();
            b.fn_return(Some(x_val)).unwrap();
            b.end_function().unwrap();
        });

        verify(&cfg, &program.vars).unwrap();
        assert!(phi_count(&cfg) >= 1);

        let mut vars = program.vars;
        clean_up_phis(&mut cfg, &vars, FIXED_POINT_ITERATION_LIMIT).unwrap();
        // x still merges two different values, so its phi survives
        assert!(phi_count(&cfg) >= 1);

        resolve_phis(&mut cfg, &mut vars).unwrap();
        assert_eq!(phi_count(&cfg), 0);
        assert_no_critical_edges(&cfg).unwrap();
    }

    #[test]
    fn unmodified_variable_needs_no_phi_after_clean_up() {
        let (mut cfg, program) = lower(|b| {
            b.begin_function("init", &[], None).unwrap();
            let x = b
                .declare_var("x", ValueType::I32, DeclKeywords::default(), false)
                .unwrap();
            let seven = b.add_const_i32(7);
            b.assign(Place::Direct(x), seven).unwrap();
            let flag = b.get_var("x").unwrap();
            b.ifelse(flag).unwrap();
            b.end_if().unwrap();
            b.end_ifelse().unwrap();
            let x_val = b.get_var("x").unwrap();
            b.fn_return(Some(x_val)).unwrap();
            b.end_function().unwrap();
        });

        let vars = program.vars;
        clean_up_phis(&mut cfg, &vars, FIXED_POINT_ITERATION_LIMIT).unwrap();
        assert_eq!(phi_count(&cfg), 0);
    }

    #[test]
    fn while_loop_headers_carry_phis_for_mutated_variables() {
        let (cfg, program) = lower(|b| {
            b.begin_function("init", &[], None).unwrap();
            let i = b
                .declare_var("i", ValueType::I32, DeclKeywords::default(), false)
                .unwrap();
            b.begin_while().unwrap();
            let i_val = b.get_var("i").unwrap();
            let ten = b.add_const_i32(10);
            let cond = b.binop(BinOp::Lt, i_val, ten).unwrap();
            b.test_while(cond).unwrap();
            let one = b.add_const_i32(1);
            b.augassign(Place::Direct(i), BinOp::Add, one).unwrap();
            b.end_while().unwrap();
            b.end_function().unwrap();
        });

        verify(&cfg, &program.vars).unwrap();

        let i_name = InternedSymbol::new("i");
        let loop_phis = cfg
            .blocks
            .values()
            .flat_map(|block| &block.phis)
            .filter(|phi| {
                phi.outputs()
                    .iter()
                    .any(|&v| program.vars.name_of(v) == i_name)
            })
            .count();
        assert_eq!(loop_phis, 1);
    }

    #[test]
    fn reassigned_parameters_get_fresh_versions() {
        let mut b = Builder::new("test");
        b.begin_function("bump", &[("x", ValueType::I32)], Some(ValueType::I32))
            .unwrap();
        let x = b.get_var("x").unwrap();
        b.ifelse(x).unwrap();
        let five = b.add_const_i32(5);
        b.assign(Place::Direct(x), five).unwrap();
        b.end_if().unwrap();
        b.end_ifelse().unwrap();
        let x_val = b.get_var("x").unwrap();
        b.fn_return(Some(x_val)).unwrap();
        b.end_function().unwrap();

        let mut program = b.finish().unwrap();
        let name = InternedSymbol::new("bump");
        init_vars(&mut program, name).unwrap();
        let code = std::mem::take(&mut program.functions.get_mut(&name).unwrap().code);
        let mut cfg = Cfg::build(code).unwrap();
        cfg.remove_unreachable().unwrap();
        let params = program.functions[&name].params.clone();
        construct(
            &mut cfg,
            &mut program.vars,
            &params,
            FIXED_POINT_ITERATION_LIMIT,
        )
        .unwrap();

        verify(&cfg, &program.vars).unwrap();

        // The incoming parameter handle is only ever a definition at entry;
        // the conditional assignment must define a distinct version.
        let param = params[0];
        for block in cfg.blocks.values() {
            for op in &block.code {
                assert!(!op.outputs().contains(&param));
            }
        }

        // The join merges the incoming value with the reassigned one
        let x_name = InternedSymbol::new("x");
        let merged = cfg.blocks.values().flat_map(|block| &block.phis).any(|phi| {
            let Op::Phi { dest, sources, .. } = phi else {
                return false;
            };
            program.vars.name_of(*dest) == x_name
                && sources.values().any(|&v| v == param)
                && sources.values().any(|&v| v != param)
        });
        assert!(merged);
    }

    #[test]
    fn globals_are_shadowed_at_entry_and_stored_at_return() {
        let (cfg, program) = lower(|b| {
            b.declare_var("speed", ValueType::I32, DeclKeywords::default(), true)
                .unwrap();
            b.begin_function("init", &[], None).unwrap();
            let speed = b.get_var("speed").unwrap();
            let one = b.add_const_i32(1);
            let sum = b.binop(BinOp::Add, speed, one).unwrap();
            b.assign(Place::Direct(speed), sum).unwrap();
            b.end_function().unwrap();
        });

        verify(&cfg, &program.vars).unwrap();

        let ops: Vec<&Op> = cfg.blocks.values().flat_map(|b| &b.code).collect();
        assert!(ops.iter().any(|op| matches!(op, Op::Load { .. })));
        assert!(ops.iter().any(|op| matches!(op, Op::Store { .. })));
        // The body itself no longer references the global directly
        let global = program.globals[&InternedSymbol::new("speed")];
        for op in ops {
            if let Op::Binop { lhs, rhs, .. } = op {
                assert_ne!(*lhs, global);
                assert_ne!(*rhs, global);
            }
        }
    }

    #[test]
    fn cyclic_parallel_moves_use_a_scratch_copy() {
        let mut vars = VarTable::new();
        let a = vars.insert(Var {
            name: InternedSymbol::new("a"),
            ty: ValueType::I32,
            ssa_version: Some(1),
            is_const: false,
            is_temp: false,
            is_global: false,
            is_published: false,
            is_persistent: false,
            holds_const: None,
            register: None,
            line: 1,
        });
        let mut b_var = vars.get(a).clone();
        b_var.name = InternedSymbol::new("b");
        let b = vars.insert(b_var);

        let before = vars.len();
        let out = sequence_moves(vec![(a, b), (b, a)], &mut vars, 1);

        // One scratch introduced, three moves emitted
        assert_eq!(vars.len(), before + 1);
        assert_eq!(out.len(), 3);
    }
}
