//! Host-side interpreter for generated code.
//!
//! Runs the resolved instruction stream of a [`Artifact`] directly, which
//! lets tests execute `init`/`loop` and read named globals back without a
//! device. Execution is a plain fetch/dispatch loop: every instruction
//! yields [`Step::Continue`] with the next pc, [`Step::Return`] when the
//! outermost frame returns, or [`Step::Fault`] — there is no exception
//! path. Each invocation gets a hard cycle budget so a buggy script
//! terminates with a catchable [`Fault::CycleLimit`] instead of hanging
//! the host.

use std::collections::BTreeMap;

use hashbrown::HashMap;

use crate::{
    backend::{
        isa::{Instr, Opcode, RV},
        Artifact,
    },
    intern::InternedSymbol,
    middle::ty::{eval_binop, F16_ONE},
};

/// Instructions one invocation may execute before faulting
pub const CYCLE_BUDGET: u32 = 100_000;

/// Pixel buffer length the host harness simulates
pub const PIXEL_COUNT: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// An `Assert` failed. Fatal: the script must not run again.
    Assertion { pc: usize },
    /// The invocation ran out of cycles. Catchable; the host may call
    /// the function again next tick.
    CycleLimit,
    /// The requested entry point does not exist in the program
    NoSuchFunction(String),
    /// A `Sys` call had no registered handler
    UnresolvedLink(String),
    /// A memory or code reference left the valid range
    BadAddress { pc: usize },
}

impl Fault {
    /// Everything except the cycle limit means the program is wedged
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Fault::CycleLimit)
    }
}

impl std::fmt::Display for Fault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Fault::Assertion { pc } => write!(f, "assertion failed at pc {pc}"),
            Fault::CycleLimit => write!(f, "cycle budget exceeded"),
            Fault::NoSuchFunction(name) => write!(f, "no function named '{name}'"),
            Fault::UnresolvedLink(name) => write!(f, "unresolved library call '{name}'"),
            Fault::BadAddress { pc } => write!(f, "bad address at pc {pc}"),
        }
    }
}

/// Outcome of dispatching one instruction
pub enum Step {
    Continue(usize),
    Return(i32),
    Fault(Fault),
}

type Handler<'a> = Box<dyn FnMut(i32, i32) -> i32 + 'a>;

pub struct Vm<'a> {
    code: Vec<Instr>,
    entries: BTreeMap<InternedSymbol, u32>,
    globals: BTreeMap<InternedSymbol, u8>,
    links: Vec<InternedSymbol>,
    data: Vec<i32>,
    pixels: Vec<i32>,
    db: Vec<i32>,
    stack: Vec<usize>,
    library: HashMap<InternedSymbol, Handler<'a>>,
    pub cycle_budget: u32,
}

impl<'a> Vm<'a> {
    pub fn new(artifact: &Artifact) -> Self {
        let mut data = artifact.data.clone();
        // Pad to the full 8-bit address space so a register operand can
        // never index out of range
        data.resize(data.len().max(256), 0);
        Self {
            code: artifact.code.clone(),
            entries: artifact.entries.clone(),
            globals: artifact.globals.clone(),
            links: artifact.links.clone(),
            data,
            pixels: vec![0; PIXEL_COUNT],
            db: vec![0; artifact.db_entries],
            stack: Vec::new(),
            library: HashMap::new(),
            cycle_budget: CYCLE_BUDGET,
        }
    }

    /// Registers a handler for a linked library call
    pub fn link(&mut self, name: &str, handler: impl FnMut(i32, i32) -> i32 + 'a) {
        self.library
            .insert(InternedSymbol::new(name), Box::new(handler));
    }

    /// Reads a named global back out of the register file
    pub fn global(&self, name: &str) -> Option<i32> {
        let slot = *self.globals.get(&InternedSymbol::new(name))?;
        self.data.get(usize::from(slot)).copied()
    }

    pub fn pixel(&self, index: usize) -> Option<i32> {
        self.pixels.get(index).copied()
    }

    pub fn db_value(&self, entry: usize) -> Option<i32> {
        self.db.get(entry).copied()
    }

    /// Runs one entry point to completion and returns its value
    pub fn run(&mut self, function: &str) -> Result<i32, Fault> {
        let Some(&entry) = self.entries.get(&InternedSymbol::new(function)) else {
            return Err(Fault::NoSuchFunction(function.to_owned()));
        };
        self.stack.clear();

        let mut pc = entry as usize / 4;
        let mut cycles = 0u32;
        loop {
            if cycles >= self.cycle_budget {
                return Err(Fault::CycleLimit);
            }
            cycles += 1;

            let Some(&instr) = self.code.get(pc) else {
                return Err(Fault::BadAddress { pc });
            };
            match self.step(pc, instr) {
                Step::Continue(next) => pc = next,
                Step::Return(value) => return Ok(value),
                Step::Fault(fault) => return Err(fault),
            }
        }
    }

    fn load(&self, register: u8) -> i32 {
        self.data[usize::from(register)]
    }

    fn store(&mut self, register: u8, value: i32) {
        self.data[usize::from(register)] = value;
    }

    /// Jump target in instruction units; offsets are byte addresses
    fn target(&self, instr: Instr, pc: usize) -> Result<usize, Fault> {
        let offset = usize::from(instr.bc());
        if offset % 4 != 0 {
            return Err(Fault::BadAddress { pc });
        }
        Ok(offset / 4)
    }

    /// Dispatches a single instruction
    pub fn step(&mut self, pc: usize, instr: Instr) -> Step {
        match self.exec(pc, instr) {
            Ok(step) => step,
            Err(fault) => Step::Fault(fault),
        }
    }

    fn exec(&mut self, pc: usize, instr: Instr) -> Result<Step, Fault> {
        let Instr { opcode, a, b, c } = instr;

        if let Some((op, fixed)) = opcode.binop() {
            let value = eval_binop(op, fixed, self.load(b), self.load(c));
            self.store(a, value);
            return Ok(Step::Continue(pc + 1));
        }

        match opcode {
            Opcode::Nop => {}
            Opcode::Mov => self.store(a, self.load(b)),
            Opcode::LoadImm => self.store(a, instr.imm()),
            Opcode::LoadMem => {
                let slot = usize::from(instr.bc());
                let value = *self.data.get(slot).ok_or(Fault::BadAddress { pc })?;
                self.store(a, value);
            }
            Opcode::Not => self.store(a, i32::from(self.load(b) == 0)),
            Opcode::ItoF => self.store(a, self.load(b).wrapping_mul(F16_ONE)),
            Opcode::FtoI => self.store(a, self.load(b) / F16_ONE),
            Opcode::Jmp => return Ok(Step::Continue(self.target(instr, pc)?)),
            Opcode::Jz => {
                if self.load(a) == 0 {
                    return Ok(Step::Continue(self.target(instr, pc)?));
                }
            }
            Opcode::Call => {
                self.stack.push(pc + 1);
                return Ok(Step::Continue(self.target(instr, pc)?));
            }
            Opcode::Ret => {
                return Ok(match self.stack.pop() {
                    Some(ret) => Step::Continue(ret),
                    None => Step::Return(self.load(RV)),
                });
            }
            Opcode::Sys => {
                let &name = self
                    .links
                    .get(usize::from(a))
                    .ok_or(Fault::BadAddress { pc })?;
                let (x, y) = (self.load(b), self.load(c));
                let handler = self
                    .library
                    .get_mut(&name)
                    .ok_or_else(|| Fault::UnresolvedLink(name.value().to_owned()))?;
                let value = handler(x, y);
                self.store(RV, value);
            }
            Opcode::VSum | Opcode::VMin | Opcode::VMax | Opcode::VAvg => {
                let base = usize::from(b);
                let len = usize::from(c);
                let slice = self
                    .data
                    .get(base..base + len)
                    .ok_or(Fault::BadAddress { pc })?;
                let value = match opcode {
                    Opcode::VSum => slice.iter().fold(0i32, |acc, &v| acc.wrapping_add(v)),
                    Opcode::VMin => slice.iter().copied().min().unwrap_or(0),
                    Opcode::VMax => slice.iter().copied().max().unwrap_or(0),
                    _ => {
                        let sum = slice.iter().fold(0i64, |acc, &v| acc + i64::from(v));
                        if slice.is_empty() {
                            0
                        } else {
                            (sum / slice.len() as i64) as i32
                        }
                    }
                };
                self.store(a, value);
            }
            Opcode::VFill => {
                let base = usize::from(a);
                let len = usize::from(c);
                let value = self.load(b);
                let slice = self
                    .data
                    .get_mut(base..base + len)
                    .ok_or(Fault::BadAddress { pc })?;
                slice.fill(value);
            }
            Opcode::LdArr => {
                let slot = address(usize::from(b), self.load(c), pc)?;
                let value = *self.data.get(slot).ok_or(Fault::BadAddress { pc })?;
                self.store(a, value);
            }
            Opcode::StArr => {
                let slot = address(usize::from(a), self.load(b), pc)?;
                let value = self.load(c);
                *self.data.get_mut(slot).ok_or(Fault::BadAddress { pc })? = value;
            }
            Opcode::PixL => {
                let index = index_from(self.load(b), pc)?;
                let value = *self.pixels.get(index).ok_or(Fault::BadAddress { pc })?;
                self.store(a, value);
            }
            Opcode::PixS => {
                let index = index_from(self.load(a), pc)?;
                let value = self.load(b);
                *self.pixels.get_mut(index).ok_or(Fault::BadAddress { pc })? = value;
            }
            Opcode::DbL => {
                let entry = usize::from(instr.bc());
                let value = *self.db.get(entry).ok_or(Fault::BadAddress { pc })?;
                self.store(a, value);
            }
            Opcode::DbS => {
                let entry = usize::from(instr.bc());
                let value = self.load(a);
                *self.db.get_mut(entry).ok_or(Fault::BadAddress { pc })? = value;
            }
            Opcode::Assert => {
                if self.load(a) == 0 {
                    return Ok(Step::Fault(Fault::Assertion { pc }));
                }
            }
            // Arithmetic was dispatched above
            _ => return Err(Fault::BadAddress { pc }),
        }
        Ok(Step::Continue(pc + 1))
    }
}

fn index_from(value: i32, pc: usize) -> Result<usize, Fault> {
    usize::try_from(value).map_err(|_| Fault::BadAddress { pc })
}

fn address(base: usize, index: i32, pc: usize) -> Result<usize, Fault> {
    Ok(base + index_from(index, pc)?)
}
