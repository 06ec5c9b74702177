//! Dominance and loop discovery.
//!
//! Dominator sets are computed with the classic iterative dataflow over
//! reverse postorder. Loops are the natural loops of back edges, matched up
//! with the header/top marker pairs the builder planted so the optimizer
//! knows where a loop's preheader code belongs.

use std::collections::{BTreeMap, BTreeSet};

use crate::{
    error::{CompileError, Result},
    middle::{
        cfg::{BlockId, Cfg},
        ir::{LabelKind, Op},
    },
};

#[derive(Debug)]
pub struct Dominance {
    sets: BTreeMap<BlockId, BTreeSet<BlockId>>,
    idom: BTreeMap<BlockId, BlockId>,
}

impl Dominance {
    pub fn compute(cfg: &Cfg) -> Self {
        let order = cfg.reverse_postorder();
        let all: BTreeSet<BlockId> = order.iter().copied().collect();

        let mut sets: BTreeMap<BlockId, BTreeSet<BlockId>> = BTreeMap::new();
        for &id in &order {
            if id == cfg.entry {
                sets.insert(id, BTreeSet::from([id]));
            } else {
                sets.insert(id, all.clone());
            }
        }

        let mut changed = true;
        while changed {
            changed = false;
            for &id in &order {
                if id == cfg.entry {
                    continue;
                }

                let mut meet: Option<BTreeSet<BlockId>> = None;
                for &pred in &cfg[id].preds {
                    let Some(pred_set) = sets.get(&pred) else {
                        continue;
                    };
                    meet = Some(match meet {
                        None => pred_set.clone(),
                        Some(acc) => acc.intersection(pred_set).copied().collect(),
                    });
                }

                let mut next = meet.unwrap_or_default();
                next.insert(id);
                if sets.get(&id) != Some(&next) {
                    sets.insert(id, next);
                    changed = true;
                }
            }
        }

        // Immediate dominator: the strict dominator dominated by every
        // other strict dominator
        let mut idom = BTreeMap::new();
        for (&id, set) in &sets {
            let strict: BTreeSet<BlockId> =
                set.iter().copied().filter(|&d| d != id).collect();
            let immediate = strict.iter().copied().find(|&candidate| {
                strict.iter().all(|&other| {
                    sets.get(&candidate)
                        .is_some_and(|cset| cset.contains(&other))
                })
            });
            if let Some(immediate) = immediate {
                idom.insert(id, immediate);
            }
        }

        Self { sets, idom }
    }

    /// True when every path from entry to `b` passes through `a`
    /// (reflexively)
    pub fn dominates(&self, a: BlockId, b: BlockId) -> bool {
        self.sets.get(&b).is_some_and(|set| set.contains(&a))
    }

    pub fn immediate(&self, id: BlockId) -> Option<BlockId> {
        self.idom.get(&id).copied()
    }
}

/// A source-level loop recovered from the CFG
#[derive(Debug)]
pub struct Loop {
    /// Marker pair stamped by the builder
    pub pair: u32,
    /// Block carrying the header marker; invariant code hoists to the end
    /// of this block
    pub header: BlockId,
    /// Back edge target; first block executed each iteration
    pub top: BlockId,
    /// Back edge sources
    pub latches: Vec<BlockId>,
    /// Blocks executed inside the loop, including `top`, excluding `header`
    pub body: BTreeSet<BlockId>,
}

fn marker_of(block: &crate::middle::cfg::Block) -> Option<LabelKind> {
    block.code.iter().find_map(|op| match op {
        Op::Label { kind, .. } if *kind != LabelKind::Plain => Some(*kind),
        _ => None,
    })
}

/// Finds all natural loops and pairs them with their source markers.
/// Returned innermost-first so enclosing loops are processed after the
/// loops they contain.
pub fn find_loops(cfg: &Cfg, dom: &Dominance) -> Result<Vec<Loop>> {
    // Back edges grouped by their target
    let mut back_edges: BTreeMap<BlockId, Vec<BlockId>> = BTreeMap::new();
    for block in cfg.blocks.values() {
        for &succ in &block.succs {
            if dom.dominates(succ, block.id) {
                back_edges.entry(succ).or_default().push(block.id);
            }
        }
    }

    let mut loops = Vec::new();
    for (top, latches) in back_edges {
        let pair = match marker_of(&cfg[top]) {
            Some(LabelKind::LoopTop { pair }) => pair,
            _ => {
                return Err(CompileError::internal(format!(
                    "back edge target {top:?} is not a loop top"
                )))
            }
        };

        let header = cfg
            .blocks
            .values()
            .find(|block| marker_of(block) == Some(LabelKind::LoopHeader { pair }))
            .map(|block| block.id)
            .ok_or_else(|| {
                CompileError::internal(format!("loop {pair} has no header block"))
            })?;

        // Natural loop body: walk predecessors backwards from the latches,
        // stopping at the top
        let mut body = BTreeSet::from([top]);
        let mut stack: Vec<BlockId> = latches.clone();
        while let Some(id) = stack.pop() {
            if !body.insert(id) {
                continue;
            }
            for &pred in &cfg[id].preds {
                if !body.contains(&pred) {
                    stack.push(pred);
                }
            }
        }

        loops.push(Loop {
            pair,
            header,
            top,
            latches,
            body,
        });
    }

    loops.sort_by_key(|l| l.body.len());
    Ok(loops)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middle::{
        builder::{Builder, DeclKeywords, Place},
        ty::{BinOp, ValueType},
    };

    fn build_cfg(build: impl FnOnce(&mut Builder)) -> Cfg {
        let mut b = Builder::new("test");
        build(&mut b);
        let mut program = b.finish().unwrap();
        let name = crate::intern::InternedSymbol::new("init");
        let code = std::mem::take(&mut program.functions.get_mut(&name).unwrap().code);
        let mut cfg = Cfg::build(code).unwrap();
        cfg.remove_unreachable().unwrap();
        cfg
    }

    #[test]
    fn entry_dominates_everything() {
        let cfg = build_cfg(|b| {
            b.begin_function("init", &[], None).unwrap();
            let flag = b
                .declare_var("flag", ValueType::I32, DeclKeywords::default(), false)
                .unwrap();
            b.ifelse(flag).unwrap();
            b.end_if().unwrap();
            b.end_ifelse().unwrap();
            b.end_function().unwrap();
        });

        let dom = Dominance::compute(&cfg);
        for &id in cfg.blocks.keys() {
            assert!(dom.dominates(cfg.entry, id));
        }
        assert!(dom.immediate(cfg.entry).is_none());
    }

    #[test]
    fn branch_arms_do_not_dominate_the_join() {
        let cfg = build_cfg(|b| {
            b.begin_function("init", &[], None).unwrap();
            let flag = b
                .declare_var("flag", ValueType::I32, DeclKeywords::default(), false)
                .unwrap();
            let one = b.add_const_i32(1);
            b.ifelse(flag).unwrap();
            b.assign(Place::Direct(flag), one).unwrap();
            b.end_if().unwrap();
            b.do_else().unwrap();
            b.assign(Place::Direct(flag), one).unwrap();
            b.end_ifelse().unwrap();
            let v = b.get_var("flag").unwrap();
            b.fn_return(Some(v)).unwrap();
            b.end_function().unwrap();
        });

        let dom = Dominance::compute(&cfg);
        let join = cfg
            .blocks
            .values()
            .find(|b| b.preds.len() == 2)
            .map(|b| b.id)
            .unwrap();
        let arms: Vec<BlockId> = cfg[join].preds.iter().copied().collect();
        for arm in arms {
            assert!(!dom.dominates(arm, join));
        }
    }

    #[test]
    fn while_loop_is_discovered_with_its_markers() {
        let cfg = build_cfg(|b| {
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

        let dom = Dominance::compute(&cfg);
        let loops = find_loops(&cfg, &dom).unwrap();
        assert_eq!(loops.len(), 1);

        let l = &loops[0];
        assert!(!l.body.contains(&l.header));
        assert!(l.body.contains(&l.top));
        assert_eq!(l.latches.len(), 1);
        assert!(dom.dominates(l.header, l.top));
    }

    #[test]
    fn nested_loops_come_innermost_first() {
        let cfg = build_cfg(|b| {
            b.begin_function("init", &[], None).unwrap();
            b.declare_var("x", ValueType::I32, DeclKeywords::default(), false)
                .unwrap();
            let outer_limit = b.add_const_i32(4);
            b.begin_for("i", outer_limit).unwrap();
            let inner_limit = b.add_const_i32(8);
            b.begin_for("j", inner_limit).unwrap();
            b.end_for().unwrap();
            b.end_for().unwrap();
            b.end_function().unwrap();
        });

        let dom = Dominance::compute(&cfg);
        let loops = find_loops(&cfg, &dom).unwrap();
        assert_eq!(loops.len(), 2);
        assert!(loops[0].body.len() < loops[1].body.len());
        assert!(loops[1].body.is_superset(&loops[0].body));
    }
}
