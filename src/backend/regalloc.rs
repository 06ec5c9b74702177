//! Linear scan register allocation.
//!
//! Every function gets its own window of the register file, so allocation
//! never has to consider interference between functions. Within a window
//! each live value gets one register for its whole interval; there is no
//! spilling, a script that needs more simultaneously live values than the
//! budget allows is rejected outright.

use std::collections::BTreeSet;

use crate::{
    error::{CompileError, Result},
    middle::{
        cfg::Cfg,
        var::{VarId, VarTable},
    },
};

use super::liveness::Liveness;

/// Closed range of flat instruction indices over which a value is live
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interval {
    pub var: VarId,
    pub start: usize,
    pub end: usize,
}

impl Interval {
    pub fn overlaps(&self, other: &Interval) -> bool {
        self.start <= other.end && other.start <= self.end
    }
}

/// Builds one interval per value: from its definition (or function entry
/// for parameters) to the last instruction it is live out of.
pub fn intervals(
    cfg: &Cfg,
    liveness: &Liveness,
    vars: &VarTable,
    params: &[VarId],
) -> Vec<Interval> {
    let mut ranges: hashbrown::HashMap<VarId, (usize, usize)> = hashbrown::HashMap::new();
    let mut extend = |var: VarId, at: usize, ranges: &mut hashbrown::HashMap<_, (usize, usize)>| {
        let range = ranges.entry(var).or_insert((at, at));
        range.0 = range.0.min(at);
        range.1 = range.1.max(at);
    };

    for &param in params {
        extend(param, 0, &mut ranges);
    }

    for (flat, &(id, position)) in liveness.index.iter().enumerate() {
        for def in cfg.blocks[&id].code[position].outputs() {
            if vars.is_renamable(def) {
                extend(def, flat, &mut ranges);
            }
        }
        for &live in &liveness.live_out[flat] {
            extend(live, flat, &mut ranges);
        }
    }

    let mut intervals = ranges
        .into_iter()
        .map(|(var, (start, end))| Interval { var, start, end })
        .collect::<Vec<_>>();
    intervals.sort_by_key(|interval| (interval.start, interval.var));
    intervals
}

/// Assigns a window-relative register to every interval. Returns how many
/// registers the function ended up using.
pub fn allocate(intervals: &[Interval], vars: &mut VarTable, budget: u8) -> Result<u8> {
    let mut free: BTreeSet<u8> = (0..budget).collect();
    let mut active: Vec<(usize, u8)> = Vec::new();
    let mut used = 0u8;

    for interval in intervals {
        active.retain(|&(end, register)| {
            if end < interval.start {
                free.insert(register);
                false
            } else {
                true
            }
        });

        let Some(register) = free.pop_first() else {
            return Err(CompileError::internal(format!(
                "out of registers: more than {budget} values live at once"
            )));
        };

        vars.get_mut(interval.var).register = Some(register);
        active.push((interval.end, register));
        used = used.max(register + 1);
    }

    Ok(used)
}
