//! Kernel builder: lowers a classified system into the per-sample update
//! kernel for one (inputs, outputs, parameters) signature.
//!
//! The kernel is four straight-line programs sharing one register file:
//!
//! - `prelude` — runs once per `process` call: trivial bindings hoisted out
//!   of the loop because they depend on neither an input nor the clock
//! - `step` — runs once per oversample step: in-loop trivial bindings,
//!   differential evaluation (all states evaluated before any commit, to
//!   preserve old-value semantics), differential commits, linear bindings
//! - `newton` — one Newton iteration; the driver loops it and each
//!   iteration writes the refined unknowns back into their guess cells
//! - `finish` — Newton-state commits, `f0` commits, output expressions,
//!   input carry
//!
//! Before anything is emitted, a liveness pass walks backwards from the
//! requested outputs: bindings whose left-hand side has no transitive
//! consumer are omitted entirely, and inputs nobody reads are dropped from
//! the interpolation block.

use std::collections::{HashMap, HashSet};

use crate::algebra::{Expr, Sym, SymKind};
use crate::compiler::classify::SolvedSystem;
use crate::compiler::ir::{Binding, Cell, Op, Program, ProgramBuilder, Reg};
use crate::error::{Error, Result};

/// Fixed register slots.
const REG_T: Reg = 0;
const REG_H: Reg = 1;
const REG_INV_OS: Reg = 2;
const FIRST_FREE: u32 = 3;

/// A used input's interpolation slots.
pub struct KernelInput {
    /// Index into the signature's input list.
    pub sig_index: usize,
    /// Register holding the interpolated value `Vi`.
    pub reg_v: Reg,
    /// Register holding the per-step increment `dVi`.
    pub reg_dv: Reg,
    /// Previous-host-sample anchor cell.
    pub cell: Cell,
}

/// A requested output's slots.
pub struct KernelOutput {
    /// Register the `finish` program leaves the step value in.
    pub reg_value: Reg,
    /// Accumulator register, averaged over the oversample steps.
    pub reg_acc: Reg,
}

/// A compiled kernel, cached per signature for the simulation's lifetime.
pub struct Kernel {
    pub prelude: Program,
    pub step: Program,
    pub newton: Program,
    pub finish: Program,
    pub inputs: Vec<KernelInput>,
    pub outputs: Vec<KernelOutput>,
    /// Parameter registers, in signature order.
    pub param_regs: Vec<Reg>,
    pub has_newton: bool,
    /// Register file size.
    pub n_regs: usize,
}

impl Kernel {
    pub const REG_T: Reg = REG_T;
    pub const REG_H: Reg = REG_H;
    pub const REG_INV_OS: Reg = REG_INV_OS;

    /// Drive the kernel over `n` samples and return the new simulation
    /// time.
    ///
    /// Buffers are indexed per the signature. The inner loops allocate
    /// nothing: all state lives in `globals` (owned by the simulation) and
    /// `scratch` (the preallocated register file).
    #[allow(clippy::too_many_arguments)]
    pub fn run(
        &self,
        n: usize,
        t0: f64,
        dt: f64,
        oversample: usize,
        iterations: usize,
        inputs: &[&[f64]],
        outputs: &mut [&mut [f64]],
        params: &[f64],
        globals: &mut [f64],
        scratch: &mut [f64],
    ) -> f64 {
        let os = oversample.max(1);
        let h = dt / os as f64;
        let inv = 1.0 / os as f64;
        scratch[REG_T as usize] = t0;
        scratch[REG_H as usize] = h;
        scratch[REG_INV_OS as usize] = inv;
        for (i, r) in self.param_regs.iter().enumerate() {
            scratch[*r as usize] = params[i];
        }
        self.prelude.run(scratch, globals);

        let mut t = t0;
        for s in 0..n {
            // Linear interpolation setup: previous host sample to current.
            for ki in &self.inputs {
                let va = globals[ki.cell as usize];
                let vb = inputs[ki.sig_index][s];
                scratch[ki.reg_v as usize] = va;
                scratch[ki.reg_dv as usize] = (vb - va) * inv;
            }
            for ko in &self.outputs {
                scratch[ko.reg_acc as usize] = 0.0;
            }

            for _ in 0..os {
                t += h;
                scratch[REG_T as usize] = t;
                for ki in &self.inputs {
                    scratch[ki.reg_v as usize] += scratch[ki.reg_dv as usize];
                }
                self.step.run(scratch, globals);
                if self.has_newton {
                    let mut it = iterations;
                    loop {
                        self.newton.run(scratch, globals);
                        if it <= 1 {
                            break;
                        }
                        it -= 1;
                    }
                }
                self.finish.run(scratch, globals);
                for ko in &self.outputs {
                    scratch[ko.reg_acc as usize] += scratch[ko.reg_value as usize];
                }
            }

            // Boxcar average of the oversampled step values.
            for (o, ko) in self.outputs.iter().enumerate() {
                outputs[o][s] = scratch[ko.reg_acc as usize] * inv;
            }
        }
        t
    }
}

/// Everything the emitter needs besides the strata.
pub struct EmitEnv<'a> {
    pub system: &'a SolvedSystem,
    /// Global cell registry, shared by every kernel of the simulation.
    pub cells: &'a HashMap<Sym, Cell>,
    /// Inputs declared by the circuit.
    pub circuit_inputs: &'a [Sym],
}

/// The per-signature request.
pub struct Signature<'a> {
    pub inputs: &'a [Expr],
    pub outputs: &'a [Expr],
    pub params: &'a [Sym],
}

pub fn build_kernel(env: &EmitEnv, sig: &Signature) -> Result<Kernel> {
    let sys = env.system;

    // ── Resolve the signature ──────────────────────────────────────────
    let mut input_syms = Vec::with_capacity(sig.inputs.len());
    for e in sig.inputs {
        match e {
            Expr::Sym(s) if s.kind() == SymKind::Input => input_syms.push(s.clone()),
            other => {
                return Err(Error::Build(format!("not an input signal: {other}")));
            }
        }
    }
    for u in env.circuit_inputs {
        if !input_syms.contains(u) {
            return Err(Error::Build(format!("circuit input {u} not supplied")));
        }
    }

    // ── Liveness ───────────────────────────────────────────────────────
    let live = analyze_liveness(sys, sig.outputs);

    // ── Register layout ────────────────────────────────────────────────
    let mut next = FIRST_FREE;
    let mut alloc = |n: &mut u32| -> Reg {
        let r = *n as Reg;
        *n += 1;
        r
    };
    let param_regs: Vec<Reg> = sig.params.iter().map(|_| alloc(&mut next)).collect();

    let mut inputs = Vec::new();
    for (i, u) in input_syms.iter().enumerate() {
        if !live.inputs.contains(u) {
            continue;
        }
        let cell = *env.cells.get(&u.at_prev()).expect("input cell allocated");
        inputs.push(KernelInput {
            sig_index: i,
            reg_v: alloc(&mut next),
            reg_dv: alloc(&mut next),
            cell,
        });
    }

    let outputs: Vec<KernelOutput> = sig
        .outputs
        .iter()
        .map(|_| KernelOutput {
            reg_value: 0, // patched after the finish program is built
            reg_acc: alloc(&mut next),
        })
        .collect();

    // Shared symbol sources every program starts from.
    let mut base = HashMap::new();
    base.insert(Sym::param("h"), Binding::Reg(REG_H));
    for (i, p) in sig.params.iter().enumerate() {
        base.insert(p.clone(), Binding::Reg(param_regs[i]));
    }
    for ki in &inputs {
        let u = &input_syms[ki.sig_index];
        base.insert(u.clone(), Binding::Reg(ki.reg_v));
        base.insert(u.at_prev(), Binding::Cell(ki.cell));
    }
    // State cells: differential states are stored pre-divided by h, Newton
    // states are stored plain.
    for (i, a) in sys.differential.iter().enumerate() {
        if !live.differential[i] {
            continue;
        }
        let y = &a.left;
        base.insert(
            y.at_prev(),
            Binding::CellTimesH(*env.cells.get(&y.at_prev()).expect("state cell")),
        );
        base.insert(
            y.d().at_prev(),
            Binding::Cell(*env.cells.get(&y.d().at_prev()).expect("deriv cell")),
        );
    }
    for y in &sys.newton_states {
        base.insert(
            y.at_prev(),
            Binding::Cell(*env.cells.get(&y.at_prev()).expect("state cell")),
        );
        base.insert(
            y.d().at_prev(),
            Binding::Cell(*env.cells.get(&y.d().at_prev()).expect("deriv cell")),
        );
    }
    // Substitution variables read back the value committed after the last
    // Newton pass of the previous step.
    for (k, a) in sys.f0.iter().enumerate() {
        if live.f0[k] {
            base.insert(
                a.left.clone(),
                Binding::Cell(*env.cells.get(&a.left.at_prev()).expect("f0 cell")),
            );
        }
    }

    // ── Prelude: hoisted trivial bindings ──────────────────────────────
    let mut pb = ProgramBuilder::new(next, REG_T, REG_H);
    pb.seed_bindings(base);
    for (i, a) in sys.trivial.iter().enumerate() {
        if !live.trivial[i] || a.right.depends_on_input() || a.right.depends_on_time() {
            continue;
        }
        let r = pb.compile(&a.right)?;
        pb.bind(a.left.clone(), Binding::Reg(r));
    }
    let carried = pb.carry_bindings();
    let (prelude, next) = pb.finish();

    // ── Step: in-loop trivial, differential, linear ────────────────────
    let mut sb = ProgramBuilder::new(next, REG_T, REG_H);
    sb.seed_bindings(carried);
    for (i, a) in sys.trivial.iter().enumerate() {
        if !live.trivial[i] || !(a.right.depends_on_input() || a.right.depends_on_time()) {
            continue;
        }
        let r = sb.compile(&a.right)?;
        sb.bind(a.left.clone(), Binding::Reg(r));
    }

    // Evaluate every differential right-hand side before any commit; the
    // loads are forced first so a later consumer of a `[t0]` symbol reuses
    // the pre-commit value.
    let mut evaluated: Vec<(usize, Reg)> = Vec::new();
    for (i, a) in sys.differential.iter().enumerate() {
        if !live.differential[i] {
            continue;
        }
        sb.force_load(*env.cells.get(&a.left.at_prev()).unwrap())?;
        sb.force_load(*env.cells.get(&a.left.d().at_prev()).unwrap())?;
    }
    for (i, a) in sys.differential.iter().enumerate() {
        if !live.differential[i] {
            continue;
        }
        let vt = sb.compile(&a.right)?;
        evaluated.push((i, vt));
    }
    for (i, vt) in &evaluated {
        let a = &sys.differential[*i];
        let y = &a.left;
        let cell_y = *env.cells.get(&y.at_prev()).unwrap();
        let cell_dy = *env.cells.get(&y.d().at_prev()).unwrap();
        if live.state_derivs.contains(y) {
            // dV = Vt − Vt0 recovers (y − y0)/h with the pre-division
            // baked in; the trapezoid derivative is 2·dV − dV[t0].
            let vt0 = sb.force_load(cell_y)?;
            let dv = sb.alloc()?;
            sb.push(Op::Sub { dst: dv, a: *vt, b: vt0 });
            let twice = sb.alloc()?;
            sb.push(Op::Add { dst: twice, a: dv, b: dv });
            let d0 = sb.force_load(cell_dy)?;
            let dnew = sb.alloc()?;
            sb.push(Op::Sub { dst: dnew, a: twice, b: d0 });
            sb.push(Op::Store { cell: cell_dy, src: dnew });
            sb.bind(y.d(), Binding::Reg(dnew));
        }
        sb.push(Op::Store { cell: cell_y, src: *vt });
        sb.bind(y.clone(), Binding::RegTimesH(*vt));
    }

    for (i, a) in sys.linear.iter().enumerate() {
        if !live.linear[i] {
            continue;
        }
        let r = sb.compile(&a.right)?;
        sb.bind(a.left.clone(), Binding::Reg(r));
    }
    let carried = sb.carry_bindings();
    let (step, next) = sb.finish();

    // ── Newton: one iteration ──────────────────────────────────────────
    let mut next = next;
    let mut newton = Program::default();
    if live.newton {
        let mut nb = ProgramBuilder::new(next, REG_T, REG_H);
        nb.seed_bindings(carried.clone());
        for x in &sys.unknowns {
            nb.bind(
                x.at_iter(),
                Binding::Cell(*env.cells.get(&x.at_iter()).expect("guess cell")),
            );
        }
        // All refinements are computed, then written back together, so one
        // iteration sees one consistent linearization point.
        let mut updates = Vec::with_capacity(sys.newton_step.len());
        for a in &sys.newton_step {
            updates.push((a.left.clone(), nb.compile(&a.right)?));
        }
        for (x, r) in updates {
            nb.push(Op::Store {
                cell: *env.cells.get(&x.at_iter()).unwrap(),
                src: r,
            });
        }
        let (p, n) = nb.finish();
        newton = p;
        next = n;
    }

    // ── Finish: commits, outputs, input carry ──────────────────────────
    let mut fb = ProgramBuilder::new(next, REG_T, REG_H);
    fb.seed_bindings(carried);
    if live.newton {
        for x in &sys.unknowns {
            fb.bind(
                x.clone(),
                Binding::Cell(*env.cells.get(&x.at_iter()).expect("guess cell")),
            );
        }
        // Newton states double as trapezoid states: recover the step
        // derivative and commit both cells for the next step.
        for y in &sys.newton_states {
            let cell_y = *env.cells.get(&y.at_prev()).unwrap();
            let cell_dy = *env.cells.get(&y.d().at_prev()).unwrap();
            let yf = fb.compile(&Expr::sym(y.clone()))?;
            let y0 = fb.force_load(cell_y)?;
            let delta = fb.alloc()?;
            fb.push(Op::Sub { dst: delta, a: yf, b: y0 });
            let twice = fb.alloc()?;
            fb.push(Op::Add { dst: twice, a: delta, b: delta });
            let slope = fb.alloc()?;
            fb.push(Op::Div { dst: slope, a: twice, b: REG_H });
            let d0 = fb.force_load(cell_dy)?;
            let dnew = fb.alloc()?;
            fb.push(Op::Sub { dst: dnew, a: slope, b: d0 });
            fb.push(Op::Store { cell: cell_dy, src: dnew });
            fb.push(Op::Store { cell: cell_y, src: yf });
            fb.bind(y.d(), Binding::Reg(dnew));
        }
        // f0 commit: each substitution variable's global takes the current
        // value of its substituted expression.
        for (k, a) in sys.f0.iter().enumerate() {
            if !live.f0[k] {
                continue;
            }
            let r = fb.compile(&a.right)?;
            fb.push(Op::Store {
                cell: *env.cells.get(&a.left.at_prev()).unwrap(),
                src: r,
            });
        }
    }

    let mut outputs = outputs;
    for (o, e) in sig.outputs.iter().enumerate() {
        let r = fb.compile(e)?;
        outputs[o].reg_value = r;
    }
    for ki in &inputs {
        fb.push(Op::Store { cell: ki.cell, src: ki.reg_v });
    }
    let (finish, n_regs) = fb.finish();

    Ok(Kernel {
        prelude,
        step,
        newton,
        finish,
        inputs,
        outputs,
        param_regs,
        has_newton: live.newton,
        n_regs: n_regs as usize,
    })
}

// ═══════════════════════════════════════════════════════════════════════════
// Liveness
// ═══════════════════════════════════════════════════════════════════════════

struct Liveness {
    trivial: Vec<bool>,
    differential: Vec<bool>,
    linear: Vec<bool>,
    f0: Vec<bool>,
    newton: bool,
    /// Differential states whose recovered derivative is consumed.
    state_derivs: HashSet<Sym>,
    /// Inputs somebody reads.
    inputs: HashSet<Sym>,
}

/// Walk backwards from the outputs: a binding is emitted only if its
/// left-hand side has a transitive consumer, crossing step boundaries
/// through the `[t0]` cells.
fn analyze_liveness(sys: &SolvedSystem, outputs: &[Expr]) -> Liveness {
    let mut live = Liveness {
        trivial: vec![false; sys.trivial.len()],
        differential: vec![false; sys.differential.len()],
        linear: vec![false; sys.linear.len()],
        f0: vec![false; sys.f0.len()],
        newton: false,
        state_derivs: HashSet::new(),
        inputs: HashSet::new(),
    };

    let mut needed: HashSet<Sym> = HashSet::new();
    let mut work: Vec<Sym> = Vec::new();
    let enqueue_expr = |e: &Expr, work: &mut Vec<Sym>| {
        e.visit_syms(&mut |s| work.push(s.clone()));
    };
    for e in outputs {
        enqueue_expr(e, &mut work);
    }

    while let Some(s) = work.pop() {
        if !needed.insert(s.clone()) {
            continue;
        }
        match s.kind() {
            SymKind::Input => {
                live.inputs.insert(Sym::input(s.name()));
                continue;
            }
            SymKind::Param => continue,
            _ => {}
        }

        // Derivative consumption of a differential state.
        let base = if s.is_d() { s.d_of() } else { s.clone() };
        let base_now = Sym::var(base.name());

        if let Some(i) = sys.trivial.iter().position(|a| a.left == base_now) {
            if !live.trivial[i] {
                live.trivial[i] = true;
                enqueue_expr(&sys.trivial[i].right, &mut work);
            }
            continue;
        }
        if let Some(i) = sys.linear.iter().position(|a| a.left == base_now) {
            if !live.linear[i] {
                live.linear[i] = true;
                enqueue_expr(&sys.linear[i].right, &mut work);
            }
            continue;
        }
        if let Some(i) = sys.differential.iter().position(|a| a.left == base_now) {
            if s.is_d() {
                live.state_derivs.insert(base_now.clone());
            }
            if !live.differential[i] {
                live.differential[i] = true;
                enqueue_expr(&sys.differential[i].right, &mut work);
            }
            continue;
        }
        if let Some(k) = sys.f0.iter().position(|a| a.left == base_now) {
            if !live.f0[k] {
                live.f0[k] = true;
                enqueue_expr(&sys.f0[k].right, &mut work);
            }
            continue;
        }
        if sys.unknowns.contains(&base_now) {
            if !live.newton {
                live.newton = true;
                for a in &sys.newton_step {
                    enqueue_expr(&a.right, &mut work);
                }
                for y in &sys.newton_states {
                    work.push(y.at_prev());
                    work.push(y.d().at_prev());
                }
                for a in &sys.newton_step {
                    work.push(a.left.at_iter());
                }
            }
            continue;
        }
    }

    // The trapezoid recovery of a differential state needs its previous
    // derivative cell whenever the right-hand side references it; that is
    // already covered because the rhs syms were enqueued. What remains is
    // to force the derivative commit for states whose rhs references
    // dy/dt[t0] (the cell must be kept fresh for the next step).
    for (i, a) in sys.differential.iter().enumerate() {
        if live.differential[i] && a.right.depends_on(&a.left.d().at_prev()) {
            live.state_derivs.insert(a.left.clone());
        }
    }

    live
}
