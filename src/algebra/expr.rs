//! Expression tree: symbols, arithmetic, substitution, differentiation.
//!
//! Expressions are canonicalized on construction: sums and products are
//! flattened and constant-folded, like terms are collected, and identical
//! factors are merged into integer powers. This keeps the elimination passes
//! in `solve` from drowning in syntactically-distinct zeros.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops::{Add, Div, Mul, Neg, Sub};
use std::sync::Arc;

// ═══════════════════════════════════════════════════════════════════════════
// Symbols
// ═══════════════════════════════════════════════════════════════════════════

/// What a symbol stands for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SymKind {
    /// A solver unknown or substitution variable (node voltage, branch
    /// current, nonlinear substitution variable).
    Var,
    /// The time derivative of the `Var` with the same name.
    Deriv,
    /// An external input signal, interpolated from a caller buffer.
    Input,
    /// A scalar bound per `process` call from the parameter list.
    Param,
}

/// Which evaluation of the symbol an expression refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Step {
    /// Value at the current timestep.
    Now,
    /// Value committed at the previous timestep (a global cell).
    Prev,
    /// Value at the current Newton iteration point (a guess cell).
    Iter,
}

/// A named symbol with a kind and a step tag.
///
/// `V_out` (a node voltage now), `V_out[t0]` (its previous-step global) and
/// `dV_out/dt` (its time derivative) are three distinct symbols sharing one
/// name.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Sym {
    name: Arc<str>,
    kind: SymKind,
    step: Step,
}

impl Sym {
    pub fn var(name: &str) -> Sym {
        Sym { name: name.into(), kind: SymKind::Var, step: Step::Now }
    }

    pub fn deriv(name: &str) -> Sym {
        Sym { name: name.into(), kind: SymKind::Deriv, step: Step::Now }
    }

    pub fn input(name: &str) -> Sym {
        Sym { name: name.into(), kind: SymKind::Input, step: Step::Now }
    }

    pub fn param(name: &str) -> Sym {
        Sym { name: name.into(), kind: SymKind::Param, step: Step::Now }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> SymKind {
        self.kind
    }

    pub fn step(&self) -> Step {
        self.step
    }

    /// The same symbol tagged as a previous-step value.
    pub fn at_prev(&self) -> Sym {
        Sym { step: Step::Prev, ..self.clone() }
    }

    /// The same symbol tagged as a Newton iteration point.
    pub fn at_iter(&self) -> Sym {
        Sym { step: Step::Iter, ..self.clone() }
    }

    /// Is this symbol a time derivative `d·/dt`?
    pub fn is_d(&self) -> bool {
        self.kind == SymKind::Deriv
    }

    /// For a derivative symbol, the underlying variable.
    pub fn d_of(&self) -> Sym {
        debug_assert!(self.is_d());
        Sym { name: self.name.clone(), kind: SymKind::Var, step: self.step }
    }

    /// The derivative symbol of this variable.
    pub fn d(&self) -> Sym {
        debug_assert_eq!(self.kind, SymKind::Var);
        Sym { name: self.name.clone(), kind: SymKind::Deriv, step: self.step }
    }
}

impl fmt::Display for Sym {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            SymKind::Deriv => write!(f, "d{}/dt", self.name)?,
            _ => write!(f, "{}", self.name)?,
        }
        match self.step {
            Step::Now => Ok(()),
            Step::Prev => write!(f, "[t0]"),
            Step::Iter => write!(f, "[it]"),
        }
    }
}

/// Substitution map used by [`Expr::substitute`].
pub type SubMap = HashMap<Sym, Expr>;

// ═══════════════════════════════════════════════════════════════════════════
// Expressions
// ═══════════════════════════════════════════════════════════════════════════

/// A symbolic expression.
///
/// Sums and products are n-ary and kept flat; a product's constant factor,
/// if any, is its first element. Division is represented as multiplication
/// by a negative power.
#[derive(Clone, Debug, PartialEq)]
pub enum Expr {
    Const(f64),
    Sym(Sym),
    /// Simulation time, bound to the running clock at kernel time.
    Time,
    Add(Vec<Expr>),
    Mul(Vec<Expr>),
    Pow(Box<Expr>, i32),
    Exp(Box<Expr>),
    Ln(Box<Expr>),
    Sin(Box<Expr>),
    Cos(Box<Expr>),
}

// Constants never hold NaN in this crate, so Eq is sound; Hash mirrors
// PartialEq by hashing the bit pattern (negative zero is normalized away by
// `Expr::num`).
impl Eq for Expr {}

impl Hash for Expr {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Expr::Const(c) => c.to_bits().hash(state),
            Expr::Sym(s) => s.hash(state),
            Expr::Time => {}
            Expr::Add(ts) | Expr::Mul(ts) => {
                for t in ts {
                    t.hash(state);
                }
            }
            Expr::Pow(b, n) => {
                b.hash(state);
                n.hash(state);
            }
            Expr::Exp(a) | Expr::Ln(a) | Expr::Sin(a) | Expr::Cos(a) => a.hash(state),
        }
    }
}

fn norm(c: f64) -> f64 {
    // Collapse -0.0 onto +0.0 so structural equality and hashing agree.
    if c == 0.0 {
        0.0
    } else {
        c
    }
}

// A total structural order so sums and products have one spelling: without
// it, `x*y - y*x` survives elimination as nonzero junk.
impl PartialOrd for Expr {
    fn partial_cmp(&self, other: &Expr) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Expr {
    fn cmp(&self, other: &Expr) -> Ordering {
        fn rank(e: &Expr) -> u8 {
            match e {
                Expr::Const(_) => 0,
                Expr::Sym(_) => 1,
                Expr::Time => 2,
                Expr::Add(_) => 3,
                Expr::Mul(_) => 4,
                Expr::Pow(..) => 5,
                Expr::Exp(_) => 6,
                Expr::Ln(_) => 7,
                Expr::Sin(_) => 8,
                Expr::Cos(_) => 9,
            }
        }
        match (self, other) {
            (Expr::Const(a), Expr::Const(b)) => a.total_cmp(b),
            (Expr::Sym(a), Expr::Sym(b)) => a.cmp(b),
            (Expr::Time, Expr::Time) => Ordering::Equal,
            (Expr::Add(a), Expr::Add(b)) | (Expr::Mul(a), Expr::Mul(b)) => a.cmp(b),
            (Expr::Pow(a, n), Expr::Pow(b, m)) => a.cmp(b).then(n.cmp(m)),
            (Expr::Exp(a), Expr::Exp(b))
            | (Expr::Ln(a), Expr::Ln(b))
            | (Expr::Sin(a), Expr::Sin(b))
            | (Expr::Cos(a), Expr::Cos(b)) => a.cmp(b),
            (a, b) => rank(a).cmp(&rank(b)),
        }
    }
}

impl Expr {
    pub const ZERO: Expr = Expr::Const(0.0);
    pub const ONE: Expr = Expr::Const(1.0);

    pub fn num(c: f64) -> Expr {
        Expr::Const(norm(c))
    }

    pub fn sym(s: Sym) -> Expr {
        Expr::Sym(s)
    }

    pub fn var(name: &str) -> Expr {
        Expr::Sym(Sym::var(name))
    }

    // ── Canonicalizing constructors ────────────────────────────────────

    /// Sum of `terms`: flattens, folds constants, collects like terms.
    pub fn add_all(terms: Vec<Expr>) -> Expr {
        let mut flat = Vec::with_capacity(terms.len());
        for t in terms {
            match t {
                Expr::Add(inner) => flat.extend(inner),
                other => flat.push(other),
            }
        }

        let mut constant = 0.0;
        // (core, coefficient) pairs in first-seen order.
        let mut collected: Vec<(Expr, f64)> = Vec::new();
        for t in flat {
            match t {
                Expr::Const(c) => constant += c,
                other => {
                    let (coeff, core) = split_coeff(other);
                    match collected.iter_mut().find(|(k, _)| *k == core) {
                        Some((_, acc)) => *acc += coeff,
                        None => collected.push((core, coeff)),
                    }
                }
            }
        }

        let mut out: Vec<Expr> = Vec::with_capacity(collected.len() + 1);
        for (core, coeff) in collected {
            if coeff == 0.0 {
                continue;
            }
            out.push(scale(core, coeff));
        }
        out.sort();
        if constant != 0.0 {
            out.push(Expr::num(constant));
        }
        match out.len() {
            0 => Expr::ZERO,
            1 => out.pop().unwrap(),
            _ => Expr::Add(out),
        }
    }

    /// Product of `factors`: flattens, folds constants, merges powers.
    pub fn mul_all(factors: Vec<Expr>) -> Expr {
        let mut flat = Vec::with_capacity(factors.len());
        for f in factors {
            match f {
                Expr::Mul(inner) => flat.extend(inner),
                other => flat.push(other),
            }
        }

        let mut constant = 1.0;
        // (base, exponent) pairs in first-seen order.
        let mut bases: Vec<(Expr, i32)> = Vec::new();
        for f in flat {
            match f {
                Expr::Const(c) => constant *= c,
                other => {
                    let (base, n) = match other {
                        Expr::Pow(b, n) => (*b, n),
                        b => (b, 1),
                    };
                    match bases.iter_mut().find(|(k, _)| *k == base) {
                        Some((_, acc)) => *acc += n,
                        None => bases.push((base, n)),
                    }
                }
            }
        }
        if constant == 0.0 {
            return Expr::ZERO;
        }

        let mut merged: Vec<Expr> = Vec::with_capacity(bases.len());
        for (base, n) in bases {
            match n {
                0 => {}
                1 => merged.push(base),
                _ => merged.push(Expr::Pow(Box::new(base), n)),
            }
        }
        merged.sort();
        let mut out: Vec<Expr> = Vec::with_capacity(merged.len() + 1);
        if constant != 1.0 {
            out.push(Expr::num(constant));
        }
        out.extend(merged);
        match out.len() {
            0 => Expr::ONE,
            1 => out.pop().unwrap(),
            _ => Expr::Mul(out),
        }
    }

    pub fn pow(self, n: i32) -> Expr {
        match (self, n) {
            (_, 0) => Expr::ONE,
            (e, 1) => e,
            (Expr::Const(c), n) => Expr::num(c.powi(n)),
            (Expr::Pow(b, m), n) => Expr::Pow(b, m * n),
            (Expr::Mul(fs), n) => Expr::mul_all(fs.into_iter().map(|f| f.pow(n)).collect()),
            (e, n) => Expr::Pow(Box::new(e), n),
        }
    }

    pub fn exp(self) -> Expr {
        match self {
            Expr::Const(c) => Expr::num(c.exp()),
            e => Expr::Exp(Box::new(e)),
        }
    }

    pub fn ln(self) -> Expr {
        match self {
            Expr::Const(c) => Expr::num(c.ln()),
            e => Expr::Ln(Box::new(e)),
        }
    }

    pub fn sin(self) -> Expr {
        match self {
            Expr::Const(c) => Expr::num(c.sin()),
            e => Expr::Sin(Box::new(e)),
        }
    }

    pub fn cos(self) -> Expr {
        match self {
            Expr::Const(c) => Expr::num(c.cos()),
            e => Expr::Cos(Box::new(e)),
        }
    }

    // ── Queries ────────────────────────────────────────────────────────

    pub fn as_const(&self) -> Option<f64> {
        match self {
            Expr::Const(c) => Some(*c),
            _ => None,
        }
    }

    pub fn is_zero(&self) -> bool {
        matches!(self, Expr::Const(c) if *c == 0.0)
    }

    /// Walk every symbol in the expression.
    pub fn visit_syms<F: FnMut(&Sym)>(&self, f: &mut F) {
        match self {
            Expr::Const(_) | Expr::Time => {}
            Expr::Sym(s) => f(s),
            Expr::Add(ts) | Expr::Mul(ts) => {
                for t in ts {
                    t.visit_syms(f);
                }
            }
            Expr::Pow(b, _) => b.visit_syms(f),
            Expr::Exp(a) | Expr::Ln(a) | Expr::Sin(a) | Expr::Cos(a) => a.visit_syms(f),
        }
    }

    /// Does the expression reference `s`? (The functional-dependence test.)
    pub fn depends_on(&self, s: &Sym) -> bool {
        let mut found = false;
        self.visit_syms(&mut |sym| found |= sym == s);
        found
    }

    pub fn depends_on_any(&self, syms: &[Sym]) -> bool {
        let mut found = false;
        self.visit_syms(&mut |sym| found |= syms.contains(sym));
        found
    }

    /// Does the expression reference the time variable?
    pub fn depends_on_time(&self) -> bool {
        match self {
            Expr::Time => true,
            Expr::Const(_) | Expr::Sym(_) => false,
            Expr::Add(ts) | Expr::Mul(ts) => ts.iter().any(|t| t.depends_on_time()),
            Expr::Pow(b, _) => b.depends_on_time(),
            Expr::Exp(a) | Expr::Ln(a) | Expr::Sin(a) | Expr::Cos(a) => a.depends_on_time(),
        }
    }

    /// Does the expression reference any input signal?
    pub fn depends_on_input(&self) -> bool {
        let mut found = false;
        self.visit_syms(&mut |sym| found |= sym.kind() == SymKind::Input);
        found
    }

    // ── Rewriting ──────────────────────────────────────────────────────

    /// Replace symbols by expressions, re-canonicalizing on the way up.
    pub fn substitute(&self, map: &SubMap) -> Expr {
        match self {
            Expr::Const(_) | Expr::Time => self.clone(),
            Expr::Sym(s) => map.get(s).cloned().unwrap_or_else(|| self.clone()),
            Expr::Add(ts) => Expr::add_all(ts.iter().map(|t| t.substitute(map)).collect()),
            Expr::Mul(ts) => Expr::mul_all(ts.iter().map(|t| t.substitute(map)).collect()),
            Expr::Pow(b, n) => b.substitute(map).pow(*n),
            Expr::Exp(a) => a.substitute(map).exp(),
            Expr::Ln(a) => a.substitute(map).ln(),
            Expr::Sin(a) => a.substitute(map).sin(),
            Expr::Cos(a) => a.substitute(map).cos(),
        }
    }

    /// Rewrite every symbol through `f`.
    pub fn map_syms<F: Fn(&Sym) -> Sym + Copy>(&self, f: F) -> Expr {
        match self {
            Expr::Const(_) | Expr::Time => self.clone(),
            Expr::Sym(s) => Expr::Sym(f(s)),
            Expr::Add(ts) => Expr::add_all(ts.iter().map(|t| t.map_syms(f)).collect()),
            Expr::Mul(ts) => Expr::mul_all(ts.iter().map(|t| t.map_syms(f)).collect()),
            Expr::Pow(b, n) => b.map_syms(f).pow(*n),
            Expr::Exp(a) => a.map_syms(f).exp(),
            Expr::Ln(a) => a.map_syms(f).ln(),
            Expr::Sin(a) => a.map_syms(f).sin(),
            Expr::Cos(a) => a.map_syms(f).cos(),
        }
    }

    /// The expression with every current-step symbol moved to `[t0]`.
    pub fn at_prev(&self) -> Expr {
        self.map_syms(|s| {
            if s.step() == Step::Now {
                s.at_prev()
            } else {
                s.clone()
            }
        })
    }

    /// Derivative with respect to symbol `x`.
    pub fn differentiate(&self, x: &Sym) -> Expr {
        match self {
            Expr::Const(_) | Expr::Time => Expr::ZERO,
            Expr::Sym(s) => {
                if s == x {
                    Expr::ONE
                } else {
                    Expr::ZERO
                }
            }
            Expr::Add(ts) => Expr::add_all(ts.iter().map(|t| t.differentiate(x)).collect()),
            Expr::Mul(ts) => {
                // Product rule over the n-ary product.
                let mut terms = Vec::with_capacity(ts.len());
                for (i, t) in ts.iter().enumerate() {
                    let dt = t.differentiate(x);
                    if dt.is_zero() {
                        continue;
                    }
                    let mut factors = vec![dt];
                    for (j, other) in ts.iter().enumerate() {
                        if i != j {
                            factors.push(other.clone());
                        }
                    }
                    terms.push(Expr::mul_all(factors));
                }
                Expr::add_all(terms)
            }
            Expr::Pow(b, n) => {
                let db = b.differentiate(x);
                if db.is_zero() {
                    return Expr::ZERO;
                }
                Expr::mul_all(vec![Expr::num(*n as f64), (**b).clone().pow(n - 1), db])
            }
            Expr::Exp(a) => Expr::mul_all(vec![self.clone(), a.differentiate(x)]),
            Expr::Ln(a) => {
                Expr::mul_all(vec![a.differentiate(x), (**a).clone().pow(-1)])
            }
            Expr::Sin(a) => Expr::mul_all(vec![(**a).clone().cos(), a.differentiate(x)]),
            Expr::Cos(a) => Expr::mul_all(vec![
                Expr::num(-1.0),
                (**a).clone().sin(),
                a.differentiate(x),
            ]),
        }
    }

    /// Distribute products over sums so the result is a flat sum of terms.
    pub fn expand(&self) -> Expr {
        match self {
            Expr::Const(_) | Expr::Sym(_) | Expr::Time => self.clone(),
            Expr::Add(ts) => Expr::add_all(ts.iter().map(|t| t.expand()).collect()),
            Expr::Mul(ts) => {
                let expanded: Vec<Expr> = ts.iter().map(|t| t.expand()).collect();
                // Cartesian distribution of each Add factor.
                let mut acc: Vec<Expr> = vec![Expr::ONE];
                for f in expanded {
                    let summands = match f {
                        Expr::Add(inner) => inner,
                        other => vec![other],
                    };
                    let mut next = Vec::with_capacity(acc.len() * summands.len());
                    for a in &acc {
                        for s in &summands {
                            next.push(Expr::mul_all(vec![a.clone(), s.clone()]));
                        }
                    }
                    acc = next;
                }
                Expr::add_all(acc)
            }
            Expr::Pow(b, n) => {
                let base = b.expand();
                if *n > 1 {
                    if let Expr::Add(_) = base {
                        // Expand small positive powers of sums by repeated
                        // multiplication.
                        let mut acc = base.clone();
                        for _ in 1..*n {
                            acc = Expr::mul_all(vec![acc, base.clone()]).expand();
                        }
                        return acc;
                    }
                }
                base.pow(*n)
            }
            Expr::Exp(a) => a.expand().exp(),
            Expr::Ln(a) => a.expand().ln(),
            Expr::Sin(a) => a.expand().sin(),
            Expr::Cos(a) => a.expand().cos(),
        }
    }

    /// Additive terms of the expanded expression.
    pub fn terms(&self) -> Vec<Expr> {
        match self.expand() {
            Expr::Add(ts) => ts,
            other => vec![other],
        }
    }

    /// If this term is `c·x` with `c` independent of `x`, return `c`.
    ///
    /// Returns `Some(1)` for the bare symbol. Powers of `x` and any other
    /// dependence of the cofactor on `x` yield `None`.
    pub fn coefficient_of(&self, x: &Sym) -> Option<Expr> {
        match self {
            Expr::Sym(s) if s == x => Some(Expr::ONE),
            Expr::Mul(fs) => {
                let mut rest = Vec::with_capacity(fs.len() - 1);
                let mut hits = 0usize;
                for f in fs {
                    match f {
                        Expr::Sym(s) if s == x => hits += 1,
                        other => rest.push(other.clone()),
                    }
                }
                let cofactor = Expr::mul_all(rest);
                if hits == 1 && !cofactor.depends_on(x) {
                    Some(cofactor)
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    /// Evaluate numerically with symbol values from `env` and time `t`.
    /// Returns `None` if a symbol is missing. Used by tests.
    pub fn eval(&self, env: &HashMap<Sym, f64>, t: f64) -> Option<f64> {
        Some(match self {
            Expr::Const(c) => *c,
            Expr::Time => t,
            Expr::Sym(s) => *env.get(s)?,
            Expr::Add(ts) => {
                let mut acc = 0.0;
                for e in ts {
                    acc += e.eval(env, t)?;
                }
                acc
            }
            Expr::Mul(ts) => {
                let mut acc = 1.0;
                for e in ts {
                    acc *= e.eval(env, t)?;
                }
                acc
            }
            Expr::Pow(b, n) => b.eval(env, t)?.powi(*n),
            Expr::Exp(a) => a.eval(env, t)?.exp(),
            Expr::Ln(a) => a.eval(env, t)?.ln(),
            Expr::Sin(a) => a.eval(env, t)?.sin(),
            Expr::Cos(a) => a.eval(env, t)?.cos(),
        })
    }
}

/// Split a canonical term into its constant coefficient and core.
fn split_coeff(e: Expr) -> (f64, Expr) {
    match e {
        Expr::Mul(fs) => {
            if let Some(Expr::Const(c)) = fs.first() {
                let c = *c;
                let rest: Vec<Expr> = fs.into_iter().skip(1).collect();
                (c, Expr::mul_all(rest))
            } else {
                (1.0, Expr::Mul(fs))
            }
        }
        other => (1.0, other),
    }
}

fn scale(core: Expr, coeff: f64) -> Expr {
    if coeff == 1.0 {
        core
    } else {
        Expr::mul_all(vec![Expr::num(coeff), core])
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Operators
// ═══════════════════════════════════════════════════════════════════════════

impl Add for Expr {
    type Output = Expr;
    fn add(self, rhs: Expr) -> Expr {
        Expr::add_all(vec![self, rhs])
    }
}

impl Sub for Expr {
    type Output = Expr;
    fn sub(self, rhs: Expr) -> Expr {
        Expr::add_all(vec![self, -rhs])
    }
}

impl Mul for Expr {
    type Output = Expr;
    fn mul(self, rhs: Expr) -> Expr {
        Expr::mul_all(vec![self, rhs])
    }
}

impl Div for Expr {
    type Output = Expr;
    fn div(self, rhs: Expr) -> Expr {
        Expr::mul_all(vec![self, rhs.pow(-1)])
    }
}

impl Neg for Expr {
    type Output = Expr;
    fn neg(self) -> Expr {
        Expr::mul_all(vec![Expr::num(-1.0), self])
    }
}

impl From<f64> for Expr {
    fn from(c: f64) -> Expr {
        Expr::num(c)
    }
}

impl From<Sym> for Expr {
    fn from(s: Sym) -> Expr {
        Expr::Sym(s)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Display
// ═══════════════════════════════════════════════════════════════════════════

fn fmt_factor(e: &Expr, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match e {
        Expr::Add(_) => write!(f, "({e})"),
        Expr::Const(c) if *c < 0.0 => write!(f, "({e})"),
        _ => write!(f, "{e}"),
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Const(c) => write!(f, "{c}"),
            Expr::Sym(s) => write!(f, "{s}"),
            Expr::Time => write!(f, "t"),
            Expr::Add(ts) => {
                for (i, t) in ts.iter().enumerate() {
                    if i > 0 {
                        write!(f, " + ")?;
                    }
                    write!(f, "{t}")?;
                }
                Ok(())
            }
            Expr::Mul(ts) => {
                for (i, t) in ts.iter().enumerate() {
                    if i > 0 {
                        write!(f, "*")?;
                    }
                    fmt_factor(t, f)?;
                }
                Ok(())
            }
            Expr::Pow(b, n) => {
                fmt_factor(b, f)?;
                write!(f, "^{n}")
            }
            Expr::Exp(a) => write!(f, "exp({a})"),
            Expr::Ln(a) => write!(f, "ln({a})"),
            Expr::Sin(a) => write!(f, "sin({a})"),
            Expr::Cos(a) => write!(f, "cos({a})"),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Equations and solved bindings
// ═══════════════════════════════════════════════════════════════════════════

/// An equation `lhs == rhs`.
#[derive(Clone, Debug, PartialEq)]
pub struct Equation {
    pub lhs: Expr,
    pub rhs: Expr,
}

impl Equation {
    pub fn new(lhs: Expr, rhs: Expr) -> Equation {
        Equation { lhs, rhs }
    }

    /// `lhs − rhs`, expanded to a flat sum of terms.
    pub fn residual(&self) -> Expr {
        (self.lhs.clone() - self.rhs.clone()).expand()
    }
}

impl fmt::Display for Equation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} = {}", self.lhs, self.rhs)
    }
}

/// A solved binding `left := right`.
#[derive(Clone, Debug, PartialEq)]
pub struct Arrow {
    pub left: Sym,
    pub right: Expr,
}

impl Arrow {
    pub fn new(left: Sym, right: Expr) -> Arrow {
        Arrow { left, right }
    }
}

impl fmt::Display for Arrow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.left, self.right)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn v(name: &str) -> Expr {
        Expr::var(name)
    }

    #[test]
    fn add_collects_like_terms() {
        let e = v("x") + v("x") + Expr::num(2.0) * v("x");
        assert_eq!(e, Expr::num(4.0) * v("x"));
    }

    #[test]
    fn sub_of_identical_terms_is_zero() {
        // Products canonicalize to one factor order, so these cancel.
        let e = v("x") * v("y") - v("y") * v("x");
        assert!(e.is_zero());
    }

    #[test]
    fn mul_merges_powers() {
        let e = v("x") * v("x");
        assert_eq!(e, Expr::var("x").pow(2));
    }

    #[test]
    fn mul_by_zero_collapses() {
        let e = (v("x") + Expr::num(3.0)) * Expr::ZERO;
        assert!(e.is_zero());
    }

    #[test]
    fn division_cancels() {
        let e = (v("x") * v("y")) / v("y");
        assert_eq!(e, v("x"));
    }

    #[test]
    fn expand_distributes() {
        let e = (v("a") + v("b")) * v("c");
        let terms = e.terms();
        assert_eq!(terms.len(), 2);
        assert!(terms.contains(&(v("a") * v("c"))));
        assert!(terms.contains(&(v("b") * v("c"))));
    }

    #[test]
    fn coefficient_of_linear_term() {
        let x = Sym::var("x");
        let term = Expr::num(3.0) * Expr::var("r") * Expr::Sym(x.clone());
        let c = term.coefficient_of(&x).unwrap();
        assert_eq!(c, Expr::num(3.0) * Expr::var("r"));
    }

    #[test]
    fn coefficient_of_rejects_nonlinear() {
        let x = Sym::var("x");
        assert!(Expr::Sym(x.clone()).pow(2).coefficient_of(&x).is_none());
        let e = Expr::Sym(x.clone()).exp() * Expr::Sym(x.clone());
        assert!(e.coefficient_of(&x).is_none());
    }

    #[test]
    fn differentiate_exp() {
        let x = Sym::var("x");
        let e = (Expr::num(2.0) * Expr::Sym(x.clone())).exp();
        let d = e.differentiate(&x);
        let mut env = HashMap::new();
        env.insert(x.clone(), 0.5);
        // d/dx exp(2x) = 2 exp(2x); at x = 0.5 this is 2e.
        let got = d.eval(&env, 0.0).unwrap();
        assert!((got - 2.0 * 1.0_f64.exp()).abs() < 1e-12, "got {got}");
    }

    #[test]
    fn differentiate_sin_gives_cos() {
        let x = Sym::var("x");
        let d = Expr::Sym(x.clone()).sin().differentiate(&x);
        assert_eq!(d, Expr::Sym(x.clone()).cos());
    }

    #[test]
    fn substitute_recanonicalizes() {
        let x = Sym::var("x");
        let e = Expr::Sym(x.clone()) + Expr::var("y");
        let mut map = SubMap::new();
        map.insert(x, -Expr::var("y"));
        assert!(e.substitute(&map).is_zero());
    }

    #[test]
    fn at_prev_retags_symbols() {
        let e = Expr::var("x") * Expr::Sym(Sym::deriv("x"));
        let p = e.at_prev();
        let mut steps = Vec::new();
        p.visit_syms(&mut |s| steps.push(s.step()));
        assert!(steps.iter().all(|s| *s == Step::Prev));
    }

    #[test]
    fn display_is_readable() {
        let e = Expr::num(2.0) * Expr::var("V_out") + Expr::num(1.0);
        assert_eq!(e.to_string(), "2*V_out + 1");
    }

    #[test]
    fn deriv_symbol_roundtrip() {
        let y = Sym::var("V_c");
        let dy = y.d();
        assert!(dy.is_d());
        assert_eq!(dy.d_of(), y);
        assert_eq!(dy.to_string(), "dV_c/dt");
    }
}
