//! Equation classification: raw MNA → solver strata.
//!
//! A raw MNA system mixes algebraic, differential, and implicitly nonlinear
//! equations over one set of unknowns. Classification peels it into four
//! strata the kernel evaluates in order:
//!
//! 1. **trivial** — unknowns determined by no other unknown (source nodes,
//!    shorts); solved once, hoisted when they depend on nothing that moves
//! 2. **differential** — states discretized by the trapezoidal rule, bound
//!    to next-step values; right-hand sides are stored pre-divided by `h`
//! 3. **linear** — closed-form in inputs and already-solved unknowns
//! 4. **nonlinear** — the implicit residual left for Newton iteration, made
//!    linear in the unknowns by substituting fresh `F·` variables for every
//!    nonlinear term group
//!
//! Every original unknown lands in exactly one stratum. Ordering within a
//! stage follows unknown declaration order, so emission is reproducible.

use crate::algebra::{discretize, n_solve, solve_filtered, Arrow, Expr, Sym};
use crate::circuit::Analysis;
use crate::error::{Error, Result};

/// The classified system: four strata plus the Newton bookkeeping.
pub struct SolvedSystem {
    /// Closed forms independent of every other unknown.
    pub trivial: Vec<Arrow>,
    /// Discretized states; right-hand sides are pre-divided by `h` so the
    /// kernel recovers the step derivative with one subtraction.
    pub differential: Vec<Arrow>,
    /// Remaining closed forms over inputs and solved unknowns.
    pub linear: Vec<Arrow>,
    /// Residual equations (zero-normalized), linear in the Newton unknowns
    /// with the nonlinearities hidden behind `f0` variables.
    pub nonlinear: Vec<Expr>,
    /// Unknowns the Newton solver iterates on.
    pub unknowns: Vec<Sym>,
    /// Fresh-variable bindings for the substituted nonlinear term groups.
    pub f0: Vec<Arrow>,
    /// Newton unknowns that are also trapezoid states: their residual
    /// references `y[t0]` and `dy/dt[t0]`, which the kernel commits after
    /// the iteration loop.
    pub newton_states: Vec<Sym>,
    /// One symbolic Newton step: refined values of `unknowns` in terms of
    /// the `[it]` iteration point. Empty when `unknowns` is empty.
    pub newton_step: Vec<Arrow>,
}

impl SolvedSystem {
    /// Is there a nonlinear residual to iterate on?
    pub fn has_newton(&self) -> bool {
        !self.unknowns.is_empty()
    }
}

/// Classify the MNA system of `analysis`, with `h` the symbolic step
/// length.
pub fn classify(analysis: &Analysis, h: &Expr) -> Result<SolvedSystem> {
    let mut eqs: Vec<Expr> = analysis
        .equations
        .iter()
        .map(|e| e.residual())
        .filter(|e| !e.is_zero())
        .collect();
    let mut unknowns: Vec<Sym> = analysis.unknowns.clone();

    // ── Stage 1: trivial elimination ───────────────────────────────────
    //
    // Keep solutions whose right-hand side references no remaining
    // unknown, substitute them out, repeat until no progress. States with
    // a live derivative unknown are kept in the system even when a source
    // pins them: they must flow through the discretizer so their
    // derivative gets a value.
    let mut trivial: Vec<Arrow> = Vec::new();
    loop {
        let outcome = solve_filtered(&eqs, &unknowns, |a| {
            !a.right.depends_on_any(&unknowns)
                && (a.left.is_d() || !unknowns.contains(&a.left.d()))
        });
        if outcome.arrows.is_empty() {
            break;
        }
        eqs = outcome.remaining;
        unknowns.retain(|u| !outcome.arrows.iter().any(|a| a.left == *u));
        trivial.extend(outcome.arrows);
    }
    check_consistency(&eqs)?;

    // ── Stage 2: nonlinear extraction ──────────────────────────────────
    //
    // Per equation: expand to `Σ terms = 0`, split terms into
    // linear-in-unknowns and nonlinear, and replace the nonlinear group
    // with a fresh variable. After this pass every equation is linear in
    // the original unknowns.
    let mut f0: Vec<Arrow> = Vec::new();
    eqs = eqs
        .iter()
        .map(|e| {
            let (mut linear, nonlinear): (Vec<Expr>, Vec<Expr>) = e
                .terms()
                .into_iter()
                .partition(|t| is_linear_term(t, &unknowns));
            if nonlinear.is_empty() {
                return e.clone();
            }
            let fresh = Sym::var(&format!("F{}", f0.len()));
            f0.push(Arrow::new(fresh.clone(), Expr::add_all(nonlinear)));
            linear.push(Expr::sym(fresh));
            Expr::add_all(linear)
        })
        .collect();

    // Unknowns feeding a nonlinearity are reserved for Newton: solving
    // them in an earlier stratum would evaluate the nonlinearity with a
    // stale step value.
    let reserved: Vec<Sym> = unknowns
        .iter()
        .filter(|u| f0.iter().any(|a| a.right.depends_on(u)))
        .cloned()
        .collect();

    // ── Stage 3: differential handling ─────────────────────────────────
    let dy_dt: Vec<Sym> = unknowns.iter().filter(|u| u.is_d()).cloned().collect();
    let states: Vec<Sym> = dy_dt.iter().map(|d| d.d_of()).collect();
    let mut differential: Vec<Arrow> = Vec::new();
    let mut linear_arrows: Vec<Arrow> = Vec::new();

    if !dy_dt.is_empty() {
        // Transient algebraic couplings: non-state unknowns solvable in
        // terms of the states and their derivatives. Substituting them out
        // decouples the differential system.
        let targets: Vec<Sym> = unknowns
            .iter()
            .filter(|u| {
                !u.is_d() && !dy_dt.contains(&u.d()) && !reserved.contains(u)
            })
            .cloned()
            .collect();
        // Couplings may lean on the states and derivatives the kernel binds
        // before the linear block runs; states reserved for Newton resolve
        // too late for that.
        let allowed: Vec<Sym> = states
            .iter()
            .filter(|y| !reserved.contains(y))
            .flat_map(|y| [y.clone(), y.d()])
            .collect();
        let outcome = solve_filtered(&eqs, &targets, |a| {
            let disallowed: Vec<Sym> = unknowns
                .iter()
                .filter(|u| **u != a.left && !allowed.contains(u))
                .cloned()
                .collect();
            !a.right.depends_on_any(&disallowed)
        });
        eqs = outcome.remaining;
        unknowns.retain(|u| !outcome.arrows.iter().any(|a| a.left == *u));
        linear_arrows.extend(outcome.arrows);

        // Trapezoidal integration over the decoupled system. States that
        // feed a nonlinearity are discretized but not solved here: their
        // equations carry the inverted derivative into the residual, where
        // Newton makes the step fully implicit.
        let solve_for: Vec<Sym> = states
            .iter()
            .filter(|y| !reserved.contains(y))
            .cloned()
            .collect();
        let discretized = discretize(&eqs, &states, h);
        let outcome = solve_filtered(&discretized, &solve_for, |a| {
            let others: Vec<Sym> = unknowns
                .iter()
                .filter(|u| **u != a.left && !u.is_d())
                .cloned()
                .collect();
            !a.right.depends_on_any(&others)
        });
        eqs = outcome.remaining;
        unknowns.retain(|u| !u.is_d());
        unknowns.retain(|u| !outcome.arrows.iter().any(|a| a.left == *u));
        for a in outcome.arrows {
            // Stored pre-divided by h; the kernel rebinds consumers of the
            // state to h·Vt and recovers the derivative as a subtraction.
            differential.push(Arrow::new(a.left, a.right / h.clone()));
        }
    }

    // ── Stage 4: linear closure ────────────────────────────────────────
    loop {
        let targets: Vec<Sym> = unknowns
            .iter()
            .filter(|u| !reserved.contains(u))
            .cloned()
            .collect();
        if targets.is_empty() {
            break;
        }
        let outcome = solve_filtered(&eqs, &targets, |a| {
            let others: Vec<Sym> = unknowns
                .iter()
                .filter(|u| **u != a.left)
                .cloned()
                .collect();
            !a.right.depends_on_any(&others)
        });
        if outcome.arrows.is_empty() {
            break;
        }
        eqs = outcome.remaining;
        unknowns.retain(|u| !outcome.arrows.iter().any(|a| a.left == *u));
        linear_arrows.extend(outcome.arrows);
    }
    check_consistency(&eqs)?;

    // ── Stage 5: residual ──────────────────────────────────────────────
    let nonlinear = eqs;
    if unknowns.is_empty() && !nonlinear.is_empty() {
        return Err(Error::Configuration(format!(
            "{} equations left unassigned by the classifier",
            nonlinear.len()
        )));
    }
    if nonlinear.len() < unknowns.len() {
        return Err(Error::Configuration(format!(
            "underdetermined system: {} unknowns, {} residual equations",
            unknowns.len(),
            nonlinear.len()
        )));
    }
    let newton_states: Vec<Sym> = states
        .iter()
        .filter(|y| unknowns.contains(y))
        .cloned()
        .collect();

    // One symbolic Newton step over the residual with the nonlinearities
    // substituted back in, so the Jacobian sees them.
    let newton_step = if unknowns.is_empty() {
        Vec::new()
    } else {
        let expanded: Vec<Expr> = {
            let map = f0
                .iter()
                .map(|a| (a.left.clone(), a.right.clone()))
                .collect();
            nonlinear.iter().map(|e| e.substitute(&map).expand()).collect()
        };
        let step = n_solve(&expanded, &unknowns);
        if step.len() != unknowns.len() {
            return Err(Error::Configuration(
                "singular Jacobian: Newton step could not be solved".to_string(),
            ));
        }
        step
    };

    Ok(SolvedSystem {
        trivial,
        differential,
        linear: linear_arrows,
        nonlinear,
        unknowns,
        f0,
        newton_states,
        newton_step,
    })
}

/// A term is linear in the unknowns when it references none of them, or is
/// `c·x` for exactly one unknown `x` with `c` independent of every unknown.
fn is_linear_term(term: &Expr, unknowns: &[Sym]) -> bool {
    let deps: Vec<&Sym> = unknowns.iter().filter(|x| term.depends_on(x)).collect();
    match deps.as_slice() {
        [] => true,
        [x] => matches!(term.coefficient_of(x), Some(c) if !c.depends_on_any(unknowns)),
        _ => false,
    }
}

fn check_consistency(eqs: &[Expr]) -> Result<()> {
    for e in eqs {
        if let Some(c) = e.as_const() {
            if c != 0.0 {
                return Err(Error::Configuration(format!(
                    "inconsistent system: residual constant {c}"
                )));
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::{Analysis, Netlist};
    use crate::components::{Capacitor, Diode, IdealOpAmp, InputSource, Resistor};

    fn h() -> Expr {
        Expr::sym(Sym::param("h"))
    }

    fn classify_net(net: &Netlist) -> SolvedSystem {
        classify(&net.analyze().unwrap(), &h()).unwrap()
    }

    /// Every original unknown must land in exactly one stratum; derivative
    /// unknowns are represented by their state's stratum.
    fn assert_partition(analysis: &Analysis, sys: &SolvedSystem) {
        for u in &analysis.unknowns {
            let slot = [
                sys.trivial.iter().any(|a| a.left == *u),
                sys.differential.iter().any(|a| a.left == *u),
                sys.linear.iter().any(|a| a.left == *u),
                sys.unknowns.contains(u),
            ];
            let count = slot.iter().filter(|b| **b).count();
            if u.is_d() {
                // Accounted through the underivative's stratum.
                let y = u.d_of();
                let covered = count == 1
                    || sys.differential.iter().any(|a| a.left == y)
                    || sys.unknowns.contains(&y);
                assert!(covered, "derivative {u} not covered by any stratum");
            } else {
                assert_eq!(count, 1, "unknown {u} appears in {count} strata");
            }
        }
    }

    #[test]
    fn wire_is_entirely_trivial() {
        let mut net = Netlist::new();
        let a = net.node("a");
        net.add(InputSource::new("Vin", a, Netlist::GROUND, "in"));
        let analysis = net.analyze().unwrap();
        let sys = classify(&analysis, &h()).unwrap();
        assert_eq!(sys.trivial.len(), 2); // V_a and the branch current
        assert!(sys.differential.is_empty());
        assert!(sys.linear.is_empty());
        assert!(!sys.has_newton());
        assert_partition(&analysis, &sys);
    }

    #[test]
    fn rc_lowpass_strata() {
        let mut net = Netlist::new();
        let a = net.node("a");
        let b = net.node("b");
        net.add(InputSource::new("Vin", a, Netlist::GROUND, "in"));
        net.add(Resistor::new("R1", a, b, 1000.0));
        net.add(Capacitor::new("C1", b, Netlist::GROUND, 1e-6));
        let analysis = net.analyze().unwrap();
        let sys = classify(&analysis, &h()).unwrap();

        // V_a pins to the input; V_b is the state; I_Vin is an algebraic
        // coupling; nothing is nonlinear.
        assert!(sys.trivial.iter().any(|a| a.left == Sym::var("V_a")));
        assert_eq!(sys.differential.len(), 1);
        assert_eq!(sys.differential[0].left, Sym::var("V_b"));
        assert!(sys.linear.iter().any(|a| a.left == Sym::var("I_Vin")));
        assert!(!sys.has_newton());
        assert_partition(&analysis, &sys);
    }

    #[test]
    fn differential_rhs_is_divided_by_h() {
        let mut net = Netlist::new();
        let a = net.node("a");
        let b = net.node("b");
        net.add(InputSource::new("Vin", a, Netlist::GROUND, "in"));
        net.add(Resistor::new("R1", a, b, 1000.0));
        net.add(Capacitor::new("C1", b, Netlist::GROUND, 1e-6));
        let sys = classify_net(&net);

        // Multiplying the stored rhs by h must recover the closed-form
        // trapezoid step computed by nd_solve directly.
        use std::collections::HashMap;
        let env: HashMap<Sym, f64> = [
            (Sym::input("in"), 1.0),
            (Sym::input("in").at_prev(), 0.0),
            (Sym::param("h"), 1.0 / 48000.0),
            (Sym::var("V_b").at_prev(), 0.25),
            (Sym::var("V_b").d().at_prev(), 100.0),
        ]
        .into_iter()
        .collect();
        let scaled = sys.differential[0].right.eval(&env, 0.0).unwrap();
        let v = scaled * (1.0 / 48000.0);
        let (r, c, hv) = (1000.0, 1e-6, 1.0 / 48000.0);
        let expected = (1.0 / r + 2.0 * c * 0.25 / hv + c * 100.0) / (1.0 / r + 2.0 * c / hv);
        assert!((v - expected).abs() < 1e-9, "got {v}, expected {expected}");
    }

    #[test]
    fn rectifier_engages_newton() {
        let mut net = Netlist::new();
        let a = net.node("a");
        let b = net.node("b");
        net.add(InputSource::new("Vin", a, Netlist::GROUND, "in"));
        net.add(Diode::silicon("D1", a, b));
        net.add(Resistor::new("R1", b, Netlist::GROUND, 1000.0));
        let analysis = net.analyze().unwrap();
        let sys = classify(&analysis, &h()).unwrap();

        assert!(sys.has_newton());
        assert_eq!(sys.unknowns, vec![Sym::var("V_b")]);
        assert!(!sys.f0.is_empty());
        assert_eq!(sys.newton_step.len(), 1);
        assert!(sys.newton_states.is_empty());
        // The residual is a function of the substitution variables, not of
        // a raw exponential.
        for e in &sys.nonlinear {
            assert!(!format!("{e}").contains("exp"), "residual leaked: {e}");
        }
        assert_partition(&analysis, &sys);
    }

    #[test]
    fn diode_clipper_with_cap_is_a_newton_state() {
        // Diode and capacitor sharing a junction: the state feeds the
        // nonlinearity, so the trapezoid step goes through Newton.
        let mut net = Netlist::new();
        let a = net.node("a");
        let b = net.node("b");
        net.add(InputSource::new("Vin", a, Netlist::GROUND, "in"));
        net.add(Resistor::new("R1", a, b, 4700.0));
        net.add(Diode::silicon("D1", b, Netlist::GROUND));
        net.add(Capacitor::new("C1", b, Netlist::GROUND, 220e-9));
        let analysis = net.analyze().unwrap();
        let sys = classify(&analysis, &h()).unwrap();

        assert!(sys.has_newton());
        assert_eq!(sys.newton_states, vec![Sym::var("V_b")]);
        assert!(sys.differential.is_empty());
        assert_partition(&analysis, &sys);
    }

    #[test]
    fn opamp_follower_solves_closed_form() {
        let mut net = Netlist::new();
        let p = net.node("p");
        let o = net.node("o");
        net.add(InputSource::new("Vin", p, Netlist::GROUND, "in"));
        net.add(IdealOpAmp::new("U1", p, o, o));
        let analysis = net.analyze().unwrap();
        let sys = classify(&analysis, &h()).unwrap();
        assert!(!sys.has_newton());
        assert_partition(&analysis, &sys);
        // V_o resolves to the input.
        let vo = sys
            .trivial
            .iter()
            .chain(sys.linear.iter())
            .find(|a| a.left == Sym::var("V_o"))
            .expect("V_o should be solved");
        assert_eq!(vo.right, Expr::sym(Sym::input("in")));
    }

    #[test]
    fn floating_node_is_a_configuration_error() {
        let mut net = Netlist::new();
        let a = net.node("a");
        let b = net.node("b");
        // Two caps in series with nothing pinning the middle node's DC.
        net.add(Capacitor::new("C1", a, b, 1e-6));
        net.add(Capacitor::new("C2", b, Netlist::GROUND, 1e-6));
        let analysis = net.analyze().unwrap();
        assert!(classify(&analysis, &h()).is_err());
    }
}
