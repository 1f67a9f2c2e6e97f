//! Flat bytecode IR and its register-machine interpreter.
//!
//! Kernels are emitted as straight-line programs over a preallocated
//! register file plus the simulation's global cells. There is no control
//! flow in a program: all loops (samples, oversampling, Newton iterations)
//! live in the driver. The interpreter therefore never allocates and never
//! branches except on the opcode dispatch, which the arithmetic cost of a
//! typical kernel dominates.
//!
//! Expressions are lowered with structural common-subexpression
//! elimination: a builder memoizes every compiled node per program, so the
//! duplicated exponentials the classifier's per-equation substitution
//! produces are computed once.

use std::collections::HashMap;

use crate::algebra::{Expr, Sym};
use crate::error::{Error, Result};

/// Register index.
pub type Reg = u16;

/// Global cell index.
pub type Cell = u32;

/// One straight-line instruction.
#[derive(Clone, Copy, Debug)]
pub enum Op {
    /// `r[dst] = v`
    Const { dst: Reg, v: f64 },
    /// `r[dst] = r[src]`
    Copy { dst: Reg, src: Reg },
    /// `r[dst] = globals[cell]`
    Load { dst: Reg, cell: Cell },
    /// `globals[cell] = r[src]`
    Store { cell: Cell, src: Reg },
    Add { dst: Reg, a: Reg, b: Reg },
    Sub { dst: Reg, a: Reg, b: Reg },
    Mul { dst: Reg, a: Reg, b: Reg },
    Div { dst: Reg, a: Reg, b: Reg },
    Neg { dst: Reg, a: Reg },
    Powi { dst: Reg, a: Reg, n: i32 },
    Exp { dst: Reg, a: Reg },
    Ln { dst: Reg, a: Reg },
    Sin { dst: Reg, a: Reg },
    Cos { dst: Reg, a: Reg },
}

/// A straight-line program.
#[derive(Clone, Debug, Default)]
pub struct Program {
    pub ops: Vec<Op>,
}

impl Program {
    /// Execute over the register file and global cells.
    #[inline]
    pub fn run(&self, regs: &mut [f64], globals: &mut [f64]) {
        for op in &self.ops {
            match *op {
                Op::Const { dst, v } => regs[dst as usize] = v,
                Op::Copy { dst, src } => regs[dst as usize] = regs[src as usize],
                Op::Load { dst, cell } => regs[dst as usize] = globals[cell as usize],
                Op::Store { cell, src } => globals[cell as usize] = regs[src as usize],
                Op::Add { dst, a, b } => {
                    regs[dst as usize] = regs[a as usize] + regs[b as usize]
                }
                Op::Sub { dst, a, b } => {
                    regs[dst as usize] = regs[a as usize] - regs[b as usize]
                }
                Op::Mul { dst, a, b } => {
                    regs[dst as usize] = regs[a as usize] * regs[b as usize]
                }
                Op::Div { dst, a, b } => {
                    regs[dst as usize] = regs[a as usize] / regs[b as usize]
                }
                Op::Neg { dst, a } => regs[dst as usize] = -regs[a as usize],
                Op::Powi { dst, a, n } => regs[dst as usize] = regs[a as usize].powi(n),
                Op::Exp { dst, a } => regs[dst as usize] = regs[a as usize].exp(),
                Op::Ln { dst, a } => regs[dst as usize] = regs[a as usize].ln(),
                Op::Sin { dst, a } => regs[dst as usize] = regs[a as usize].sin(),
                Op::Cos { dst, a } => regs[dst as usize] = regs[a as usize].cos(),
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Where a symbol's value comes from when lowering an expression.
#[derive(Clone, Copy, Debug)]
pub enum Binding {
    /// Already computed into a register.
    Reg(Reg),
    /// Loaded from a global cell on use.
    Cell(Cell),
    /// Loaded from a global cell, then scaled by the register holding `h`
    /// (used for trapezoid states stored pre-divided by `h`).
    CellTimesH(Cell),
    /// A register holding a pre-divided value, scaled by `h` on use.
    RegTimesH(Reg),
}

/// Lowers expressions into a [`Program`], allocating registers and
/// memoizing structurally-identical subexpressions.
pub struct ProgramBuilder {
    program: Program,
    next_reg: u32,
    /// Symbol sources for the program being built.
    bindings: HashMap<Sym, Binding>,
    /// Register holding the running time `t`.
    time_reg: Reg,
    /// Register holding the step `h`.
    h_reg: Reg,
    /// Structural CSE memo.
    memo: HashMap<Expr, Reg>,
    /// Cached loads, per program.
    load_memo: HashMap<Cell, Reg>,
}

impl ProgramBuilder {
    pub fn new(first_reg: u32, time_reg: Reg, h_reg: Reg) -> Self {
        ProgramBuilder {
            program: Program::default(),
            next_reg: first_reg,
            bindings: HashMap::new(),
            time_reg,
            h_reg,
            memo: HashMap::new(),
            load_memo: HashMap::new(),
        }
    }

    pub fn bind(&mut self, sym: Sym, binding: Binding) {
        self.bindings.insert(sym, binding);
    }

    /// Snapshot of the symbol sources, for seeding the next program in a
    /// chain (registers stay valid across programs within one step).
    pub fn carry_bindings(&self) -> HashMap<Sym, Binding> {
        self.bindings.clone()
    }

    pub fn seed_bindings(&mut self, bindings: HashMap<Sym, Binding>) {
        self.bindings = bindings;
    }

    pub fn alloc(&mut self) -> Result<Reg> {
        let r = self.next_reg;
        self.next_reg += 1;
        Reg::try_from(r).map_err(|_| Error::Build("register file overflow".to_string()))
    }

    pub fn next_reg(&self) -> u32 {
        self.next_reg
    }

    pub fn push(&mut self, op: Op) {
        self.program.ops.push(op);
    }

    /// Lower `e`, returning the register holding its value.
    pub fn compile(&mut self, e: &Expr) -> Result<Reg> {
        if let Some(r) = self.memo.get(e) {
            return Ok(*r);
        }
        let r = match e {
            Expr::Const(v) => {
                let dst = self.alloc()?;
                self.push(Op::Const { dst, v: *v });
                dst
            }
            Expr::Time => self.time_reg,
            Expr::Sym(s) => self.compile_sym(s)?,
            Expr::Add(ts) => self.fold(ts, |dst, a, b| Op::Add { dst, a, b })?,
            Expr::Mul(ts) => self.fold(ts, |dst, a, b| Op::Mul { dst, a, b })?,
            Expr::Pow(b, n) => {
                let a = self.compile(b)?;
                let dst = self.alloc()?;
                match n {
                    -1 => {
                        let one = self.compile(&Expr::ONE)?;
                        self.push(Op::Div { dst, a: one, b: a });
                    }
                    2 => self.push(Op::Mul { dst, a, b: a }),
                    n => self.push(Op::Powi { dst, a, n: *n }),
                }
                dst
            }
            Expr::Exp(x) => self.unary(x, |dst, a| Op::Exp { dst, a })?,
            Expr::Ln(x) => self.unary(x, |dst, a| Op::Ln { dst, a })?,
            Expr::Sin(x) => self.unary(x, |dst, a| Op::Sin { dst, a })?,
            Expr::Cos(x) => self.unary(x, |dst, a| Op::Cos { dst, a })?,
        };
        self.memo.insert(e.clone(), r);
        Ok(r)
    }

    fn compile_sym(&mut self, s: &Sym) -> Result<Reg> {
        let binding = *self.bindings.get(s).ok_or_else(|| {
            Error::Build(format!("no binding for symbol {s} during emission"))
        })?;
        Ok(match binding {
            Binding::Reg(r) => r,
            Binding::Cell(cell) => self.load(cell)?,
            Binding::CellTimesH(cell) => {
                let loaded = self.load(cell)?;
                let dst = self.alloc()?;
                self.push(Op::Mul { dst, a: loaded, b: self.h_reg });
                dst
            }
            Binding::RegTimesH(src) => {
                let dst = self.alloc()?;
                self.push(Op::Mul { dst, a: src, b: self.h_reg });
                dst
            }
        })
    }

    fn load(&mut self, cell: Cell) -> Result<Reg> {
        if let Some(r) = self.load_memo.get(&cell) {
            return Ok(*r);
        }
        let dst = self.alloc()?;
        self.push(Op::Load { dst, cell });
        self.load_memo.insert(cell, dst);
        Ok(dst)
    }

    /// Load a cell now (memoized). Emitters use this to pin the pre-commit
    /// value of a `[t0]` cell before a store overwrites it.
    pub fn force_load(&mut self, cell: Cell) -> Result<Reg> {
        self.load(cell)
    }

    fn unary(&mut self, x: &Expr, make: impl Fn(Reg, Reg) -> Op) -> Result<Reg> {
        let a = self.compile(x)?;
        let dst = self.alloc()?;
        self.push(make(dst, a));
        Ok(dst)
    }

    fn fold(&mut self, ts: &[Expr], make: impl Fn(Reg, Reg, Reg) -> Op) -> Result<Reg> {
        let mut acc = self.compile(&ts[0])?;
        for t in &ts[1..] {
            let b = self.compile(t)?;
            let dst = self.alloc()?;
            self.push(make(dst, acc, b));
            acc = dst;
        }
        Ok(acc)
    }

    /// Finish, returning the program and the high-water register count.
    pub fn finish(self) -> (Program, u32) {
        (self.program, self.next_reg)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
