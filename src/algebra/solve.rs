//! Symbolic solving: Gauss-Jordan elimination, trapezoidal discretization,
//! and the single Newton-Raphson refinement step.
//!
//! All three operate on zero-normalized expressions (`e == 0`).
//! Coefficients are expressions, so elimination works over the field of
//! symbolic rationals; pivots prefer constant coefficients for determinism
//! and to keep the emitted expressions small.
//!
//! [`solve_filtered`] is the classifier's workhorse: it lets the caller
//! veto individual solutions, keeps the vetoed pivot rows as (reduced)
//! equations, and hands back the leftover system directly. Re-substituting
//! a solution into its own pivot row is never attempted — the resulting
//! rational expressions do not cancel structurally and would masquerade as
//! extra equations.

use super::expr::{Arrow, Expr, SubMap, Sym};

/// Decompose a zero-normalized expression into a linear combination over
/// `unknowns`: `Σ cᵢ·xᵢ + rest`. Returns `None` when some term is not
/// linear in the unknowns.
///
/// A term counts as linear when it is `c·x` for exactly one unknown `x`
/// with `c` independent of every unknown. Products of two unknowns, powers,
/// and unknowns under transcendental functions are all nonlinear.
pub fn as_linear(e: &Expr, unknowns: &[Sym]) -> Option<(Vec<Expr>, Expr)> {
    let mut coeffs = vec![Expr::ZERO; unknowns.len()];
    let mut rest = Vec::new();
    for term in e.terms() {
        let deps: Vec<usize> = unknowns
            .iter()
            .enumerate()
            .filter(|(_, x)| term.depends_on(x))
            .map(|(i, _)| i)
            .collect();
        match deps.as_slice() {
            [] => rest.push(term),
            [i] => {
                let c = term.coefficient_of(&unknowns[*i])?;
                if c.depends_on_any(unknowns) {
                    return None;
                }
                coeffs[*i] = coeffs[*i].clone() + c;
            }
            _ => return None,
        }
    }
    Some((coeffs, Expr::add_all(rest)))
}

struct Row {
    coeffs: Vec<Expr>,
    rest: Expr,
    pivot: Option<usize>,
}

impl Row {
    /// Rebuild the row as a zero-normalized equation.
    fn reassemble(&self, unknowns: &[Sym]) -> Expr {
        let mut terms = vec![self.rest.clone()];
        for (j, c) in self.coeffs.iter().enumerate() {
            if !c.is_zero() {
                terms.push(c.clone() * Expr::sym(unknowns[j].clone()));
            }
        }
        Expr::add_all(terms)
    }
}

/// Gauss-Jordan elimination. Rows not linear in the unknowns are left out;
/// their indices into `system` are returned alongside.
fn eliminate(system: &[Expr], unknowns: &[Sym]) -> (Vec<Row>, Vec<usize>) {
    let mut rows = Vec::new();
    let mut skipped = Vec::new();
    for (i, e) in system.iter().enumerate() {
        match as_linear(e, unknowns) {
            Some((coeffs, rest)) => rows.push(Row { coeffs, rest, pivot: None }),
            None => skipped.push(i),
        }
    }

    for col in 0..unknowns.len() {
        // Deterministic pivoting: the first unused row with a constant
        // nonzero coefficient, else the first structurally-nonzero one.
        let candidate = rows
            .iter()
            .position(|r| {
                r.pivot.is_none() && matches!(r.coeffs[col].as_const(), Some(c) if c != 0.0)
            })
            .or_else(|| {
                rows.iter()
                    .position(|r| r.pivot.is_none() && !r.coeffs[col].is_zero())
            });
        let Some(p) = candidate else { continue };

        // Normalize the pivot row so its pivot coefficient is one.
        let inv = rows[p].coeffs[col].clone().pow(-1);
        for c in rows[p].coeffs.iter_mut() {
            *c = c.clone() * inv.clone();
        }
        rows[p].rest = rows[p].rest.clone() * inv;
        rows[p].pivot = Some(col);

        // Clear the column from every other row (Jordan style, so no
        // separate back-substitution pass is needed).
        for r in 0..rows.len() {
            if r == p || rows[r].coeffs[col].is_zero() {
                continue;
            }
            let factor = rows[r].coeffs[col].clone();
            for j in 0..unknowns.len() {
                let delta = factor.clone() * rows[p].coeffs[j].clone();
                rows[r].coeffs[j] = rows[r].coeffs[j].clone() - delta;
            }
            rows[r].rest = rows[r].rest.clone() - factor * rows[p].rest.clone();
        }
    }

    (rows, skipped)
}

fn arrow_of(row: &Row, col: usize, unknowns: &[Sym]) -> Arrow {
    // c_col·x_col + Σ c_j·x_j + rest = 0
    //   =>  x_col = −(rest + Σ c_j·x_j) / c_col
    // The pivot coefficient is normalized to one, but constant folding can
    // leave it an ulp off, so divide by it rather than assume it.
    let mut terms = vec![-row.rest.clone()];
    for (j, c) in row.coeffs.iter().enumerate() {
        if j != col && !c.is_zero() {
            terms.push(-(c.clone() * Expr::sym(unknowns[j].clone())));
        }
    }
    let solved = Expr::add_all(terms) / row.coeffs[col].clone();
    Arrow::new(unknowns[col].clone(), solved)
}

/// Solve `system` (expressions equal to zero) for as many of `unknowns`
/// as can be isolated. Returned bindings may still reference unknowns for
/// which no pivot was found.
pub fn solve(system: &[Expr], unknowns: &[Sym]) -> Vec<Arrow> {
    let (rows, _) = eliminate(system, unknowns);
    let mut arrows = Vec::new();
    for (col, _) in unknowns.iter().enumerate() {
        if let Some(row) = rows.iter().find(|r| r.pivot == Some(col)) {
            arrows.push(arrow_of(row, col, unknowns));
        }
    }
    arrows
}

/// The result of a filtered solve: accepted bindings plus the system that
/// remains to be assigned by later stages.
pub struct SolveOutcome {
    pub arrows: Vec<Arrow>,
    pub remaining: Vec<Expr>,
}

/// Solve and let `accept` veto individual solutions.
///
/// Accepted bindings consume their pivot rows. Vetoed pivot rows and rows
/// that never pivoted come back in `remaining`, reduced by the
/// elimination (accepted unknowns are already cleared from them). Rows
/// that were not linear in the unknowns come back with the accepted
/// bindings substituted in.
pub fn solve_filtered(
    system: &[Expr],
    unknowns: &[Sym],
    mut accept: impl FnMut(&Arrow) -> bool,
) -> SolveOutcome {
    let (rows, skipped) = eliminate(system, unknowns);

    let mut arrows = Vec::new();
    let mut rejected_cols = Vec::new();
    for (col, _) in unknowns.iter().enumerate() {
        let Some(row) = rows.iter().find(|r| r.pivot == Some(col)) else {
            continue;
        };
        let arrow = arrow_of(row, col, unknowns);
        if accept(&arrow) {
            arrows.push(arrow);
        } else {
            rejected_cols.push(col);
        }
    }

    let mut remaining = Vec::new();
    for row in &rows {
        let keep = match row.pivot {
            Some(col) => rejected_cols.contains(&col),
            None => true,
        };
        if keep {
            let e = row.reassemble(unknowns);
            if !e.is_zero() {
                remaining.push(e);
            }
        }
    }
    if !skipped.is_empty() {
        let map: SubMap = arrows
            .iter()
            .map(|a| (a.left.clone(), a.right.clone()))
            .collect();
        for i in &skipped {
            let e = system[*i].substitute(&map).expand();
            if !e.is_zero() {
                remaining.push(e);
            }
        }
    }

    SolveOutcome { arrows, remaining }
}

/// Apply the trapezoidal inversion to every state derivative:
///
/// ```text
/// dy/dt -> (y - y[t0]) * 2/h - dy/dt[t0]
/// ```
///
/// which is the rule `y = y0 + (h/2)(dy/dt + dy/dt[t0])` solved for the
/// current derivative. The result is an algebraic system over the states.
pub fn discretize(system: &[Expr], states: &[Sym], h: &Expr) -> Vec<Expr> {
    let mut map = SubMap::new();
    for y in states {
        let d = y.d();
        let inversion = (Expr::sym(y.clone()) - Expr::sym(y.at_prev()))
            * (Expr::num(2.0) / h.clone())
            - Expr::sym(d.at_prev());
        map.insert(d, inversion);
    }
    system.iter().map(|e| e.substitute(&map).expand()).collect()
}

/// Discretize the differential unknowns of `system` with the trapezoidal
/// rule and solve for the states in `solve_for`. Returns the discretized
/// system alongside the bindings.
pub fn nd_solve(
    system: &[Expr],
    states: &[Sym],
    solve_for: &[Sym],
    h: &Expr,
) -> (Vec<Expr>, Vec<Arrow>) {
    let discretized = discretize(system, states, h);
    let arrows = solve(&discretized, solve_for);
    (discretized, arrows)
}

/// One symbolic Newton-Raphson step over a nonlinear residual system.
///
/// Each residual `F(x)` is linearized about the iteration point (every
/// unknown at its `[it]` tag): `F(x) ≈ F(x·) + J(x·)·(x − x·)`, and the
/// linearized system is solved for the unknowns. The returned bindings are
/// the refined values in terms of the iteration point; looping them is the
/// caller's business. Unknowns whose Jacobian column is structurally zero
/// get no binding.
pub fn n_solve(residuals: &[Expr], unknowns: &[Sym]) -> Vec<Arrow> {
    let point: SubMap = unknowns
        .iter()
        .map(|x| (x.clone(), Expr::sym(x.at_iter())))
        .collect();

    let mut linearized = Vec::with_capacity(residuals.len());
    for f in residuals {
        let mut terms = vec![f.substitute(&point)];
        for x in unknowns {
            let df = f.differentiate(x);
            if df.is_zero() {
                continue;
            }
            let slope = df.substitute(&point);
            let delta = Expr::sym(x.clone()) - Expr::sym(x.at_iter());
            terms.push(slope * delta);
        }
        linearized.push(Expr::add_all(terms).expand());
    }
    solve(&linearized, unknowns)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
