//! Debug dump of the middle IR, one function at a time.

use colored::Colorize;
use itertools::Itertools;

use crate::{
    index::Index,
    intern::InternedSymbol,
    middle::{
        cfg::Cfg,
        ir::{LabelKind, Op, Reduce},
        var::{VarId, VarTable},
    },
};

pub fn pretty_print_function(name: InternedSymbol, cfg: &Cfg, vars: &VarTable) {
    println!(
        "{} {} {}",
        "fn".magenta(),
        name.value().blue(),
        "{".white()
    );

    for block in cfg.blocks.values() {
        println!("{}", format!("bb{}:", block.id.index()).bright_red());

        for phi in &block.phis {
            println!("    {}", show(phi, vars));
        }
        for op in &block.code {
            println!("    {}", show(op, vars));
        }
    }

    println!("{}", "}".white());
}

fn var(id: VarId, vars: &VarTable) -> String {
    let record = vars.get(id);
    if record.is_const {
        match record.holds_const {
            Some(raw) => format!("#{raw}").purple().to_string(),
            None => "#?".purple().to_string(),
        }
    } else if record.is_global {
        format!("@{}", record.display_name()).yellow().to_string()
    } else {
        format!("%{}", record.display_name()).yellow().to_string()
    }
}

fn show(op: &Op, vars: &VarTable) -> String {
    let v = |id: VarId| var(id, vars);
    let eq = "=".white();

    match op {
        Op::Define { var: id, .. } => format!("{} {}", "define".cyan(), v(*id)),
        Op::Nop { .. } => "nop".cyan().to_string(),
        Op::LoadConst { dest, src, .. } => {
            format!("{} {eq} {} {}", v(*dest), "const".cyan(), v(*src))
        }
        Op::Load { dest, global, .. } => {
            format!("{} {eq} {} {}", v(*dest), "load".cyan(), v(*global))
        }
        Op::Store { global, src, .. } => {
            format!("{} {} {} {}", "store".cyan(), v(*global), "<-".white(), v(*src))
        }
        Op::Assign { dest, src, .. } => format!("{} {eq} {}", v(*dest), v(*src)),
        Op::Binop {
            op,
            fixed,
            dest,
            lhs,
            rhs,
            ..
        } => {
            let suffix = if *fixed { ".f" } else { "" };
            format!(
                "{} {eq} {} {}{} {}",
                v(*dest),
                v(*lhs),
                op.symbol().white(),
                suffix.white(),
                v(*rhs)
            )
        }
        Op::Not { dest, src, .. } => format!("{} {eq} {} {}", v(*dest), "not".cyan(), v(*src)),
        Op::IntToFixed { dest, src, .. } => {
            format!("{} {eq} {} {}", v(*dest), "itof".cyan(), v(*src))
        }
        Op::FixedToInt { dest, src, .. } => {
            format!("{} {eq} {} {}", v(*dest), "ftoi".cyan(), v(*src))
        }
        Op::VectorOp {
            reduce,
            dest,
            array,
            len,
            ..
        } => {
            let name = match reduce {
                Reduce::Min => "vmin",
                Reduce::Max => "vmax",
                Reduce::Avg => "vavg",
                Reduce::Sum => "vsum",
            };
            format!(
                "{} {eq} {} {}{}{}{}",
                v(*dest),
                name.cyan(),
                v(*array),
                "[0..".white(),
                len.to_string().purple(),
                "]".white()
            )
        }
        Op::VectorAssign { array, len, src, .. } => format!(
            "{} {}{}{}{} {} {}",
            "vfill".cyan(),
            v(*array),
            "[0..".white(),
            len.to_string().purple(),
            "]".white(),
            "<-".white(),
            v(*src)
        ),
        Op::Call {
            name, args, dest, ..
        }
        | Op::LibCall {
            name, args, dest, ..
        } => {
            let keyword = if matches!(op, Op::Call { .. }) {
                "call"
            } else {
                "syscall"
            };
            let prefix = match dest {
                Some(dest) => format!("{} {eq} ", v(*dest)),
                None => String::new(),
            };
            format!(
                "{prefix}{} {}({})",
                keyword.cyan(),
                name.value().blue(),
                args.iter().map(|&a| v(a)).join(", ")
            )
        }
        Op::Label { label, kind, .. } => {
            let marker = match kind {
                LabelKind::Plain => String::new(),
                LabelKind::LoopHeader { pair } => format!(" (loop_header {pair})"),
                LabelKind::LoopTop { pair } => format!(" (loop_top {pair})"),
            };
            format!(
                "{} {}{}",
                "label".cyan(),
                format!(".L{}", label.index()).blue(),
                marker.white()
            )
        }
        Op::Branch {
            cond,
            positive,
            negative,
            ..
        } => format!(
            "{} {} {} {}",
            "br".cyan(),
            v(*cond),
            format!(".L{}", positive.index()).blue(),
            format!(".L{}", negative.index()).blue()
        ),
        Op::Jump { target, .. } => {
            format!("{} {}", "jmp".cyan(), format!(".L{}", target.index()).blue())
        }
        Op::Return { value: Some(value), .. } => format!("{} {}", "ret".cyan(), v(*value)),
        Op::Return { value: None, .. } => "ret".cyan().to_string(),
        Op::Index {
            dest, array, index, ..
        } => format!("{} {eq} {}[{}]", v(*dest), v(*array), v(*index)),
        Op::Lookup {
            array, index, src, ..
        } => format!("{}[{}] {} {}", v(*array), v(*index), "<-".white(), v(*src)),
        Op::PixLoad { dest, index, .. } => {
            format!("{} {eq} {} {}", v(*dest), "pix".cyan(), v(*index))
        }
        Op::PixStore { index, src, .. } => {
            format!("{} {} {} {}", "pix".cyan(), v(*index), "<-".white(), v(*src))
        }
        Op::DbLoad { dest, entry, .. } => format!(
            "{} {eq} {} {}",
            v(*dest),
            "db".cyan(),
            entry.to_string().purple()
        ),
        Op::DbStore { entry, src, .. } => format!(
            "{} {} {} {}",
            "db".cyan(),
            entry.to_string().purple(),
            "<-".white(),
            v(*src)
        ),
        Op::Phi { dest, sources, .. } => format!(
            "{} {eq} {}({})",
            v(*dest),
            "phi".bright_green(),
            sources
                .iter()
                .map(|(block, value)| format!(
                    "{} -> {}",
                    format!("bb{}", block.index()).blue(),
                    v(*value)
                ))
                .join(", ")
        ),
        Op::IncompletePhi { dest, name, .. } => format!(
            "{} {eq} {} {}",
            v(*dest),
            "phi?".bright_green(),
            name.value()
        ),
        Op::Assert { cond, .. } => format!("{} {}", "assert".cyan(), v(*cond)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middle::{
        ir::LabelId,
        ty::{BinOp, ValueType},
        var::Var,
    };
    use indoc::indoc;

    fn named(vars: &mut VarTable, name: &str, version: Option<u32>) -> VarId {
        vars.insert(Var {
            name: InternedSymbol::new(name),
            ty: ValueType::I32,
            ssa_version: version,
            is_const: false,
            is_temp: false,
            is_global: false,
            is_published: false,
            is_persistent: false,
            holds_const: None,
            register: None,
            line: 1,
        })
    }

    #[test]
    fn ops_render_without_panicking() {
        let mut vars = VarTable::new();
        let a = named(&mut vars, "a", Some(1));

        let op = Op::Binop {
            op: BinOp::Add,
            fixed: true,
            dest: a,
            lhs: a,
            rhs: a,
            line: 1,
        };
        let text = show(&op, &vars);
        assert!(text.contains("a.1"));
    }

    #[test]
    fn a_block_renders_as_readable_plain_text() {
        colored::control::set_override(false);

        let mut vars = VarTable::new();
        let a = named(&mut vars, "a", Some(1));
        let b = named(&mut vars, "b", Some(1));
        let ops = [
            Op::Assign {
                dest: b,
                src: a,
                line: 1,
            },
            Op::Binop {
                op: BinOp::Mul,
                fixed: false,
                dest: a,
                lhs: a,
                rhs: b,
                line: 2,
            },
            Op::Branch {
                cond: a,
                positive: LabelId::new(1),
                negative: LabelId::new(2),
                line: 2,
            },
        ];

        let text = ops.iter().map(|op| show(op, &vars)).join("\n");
        assert_eq!(
            text,
            indoc! {"
                %b.1 = %a.1
                %a.1 = %a.1 * %b.1
                br %a.1 .L1 .L2"}
        );
        colored::control::unset_override();
    }
}
