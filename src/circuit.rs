//! Circuit netlists and symbolic MNA assembly.
//!
//! A [`Netlist`] is a bag of named nodes and components. Each component
//! contributes to the Modified Nodal Analysis system through the
//! [`Component::analyze`] contract: it appends equations and declares the
//! unknowns it introduces (branch currents, voltage derivatives). The
//! netlist itself owns the Kirchhoff current law bookkeeping: every current
//! a component pushes into a node accumulates into that node's KCL sum,
//! and `analyze` finishes by emitting one `Σ i = 0` equation per non-ground
//! node.

use std::fmt;

use crate::algebra::{Equation, Expr, Sym};
use crate::error::{Error, Result};

/// Index of a node within a [`Netlist`]. Ground is [`Netlist::GROUND`].
pub type NodeId = usize;

/// The component contract consumed by the analyzer.
///
/// `analyze` appends MNA equations and unknowns; ideal two-terminal
/// components also register a voltage expression so their terminal voltage
/// can be requested as a simulation output.
pub trait Component {
    fn name(&self) -> &str;
    fn analyze(&self, an: &mut Analyzer);
}

/// A circuit: interned nodes plus components.
pub struct Netlist {
    node_names: Vec<String>,
    components: Vec<Box<dyn Component>>,
}

impl Default for Netlist {
    fn default() -> Self {
        Self::new()
    }
}

impl Netlist {
    /// The ground node, fixed at zero volts.
    pub const GROUND: NodeId = 0;

    pub fn new() -> Netlist {
        Netlist { node_names: vec!["gnd".to_string()], components: Vec::new() }
    }

    /// Intern a node by name, creating it on first use.
    pub fn node(&mut self, name: &str) -> NodeId {
        if name == "gnd" {
            return Self::GROUND;
        }
        if let Some(i) = self.node_names.iter().position(|n| n == name) {
            return i;
        }
        self.node_names.push(name.to_string());
        self.node_names.len() - 1
    }

    pub fn add<C: Component + 'static>(&mut self, component: C) {
        self.components.push(Box::new(component));
    }

    /// The node-voltage expression for a named node (zero for ground).
    pub fn node_voltage(&self, name: &str) -> Expr {
        if name == "gnd" {
            return Expr::ZERO;
        }
        Expr::sym(Sym::var(&format!("V_{name}")))
    }

    /// Build the symbolic MNA system by asking every component to augment
    /// it, then closing each non-ground node with its KCL equation.
    pub fn analyze(&self) -> Result<Analysis> {
        for (i, c) in self.components.iter().enumerate() {
            if self.components[..i].iter().any(|o| o.name() == c.name()) {
                return Err(Error::Configuration(format!(
                    "duplicate component name: {}",
                    c.name()
                )));
            }
        }
        if self.components.is_empty() {
            return Err(Error::Configuration("empty netlist".to_string()));
        }

        let mut an = Analyzer {
            node_names: &self.node_names,
            kcl: vec![Vec::new(); self.node_names.len()],
            equations: Vec::new(),
            unknowns: Vec::new(),
            component_voltages: Vec::new(),
            inputs: Vec::new(),
        };

        // Node voltages are unknowns up front, in node order.
        for name in self.node_names.iter().skip(1) {
            an.unknowns.push(Sym::var(&format!("V_{name}")));
        }

        for c in &self.components {
            c.analyze(&mut an);
        }

        // One KCL equation per non-ground node that has current terms.
        let mut equations = Vec::new();
        for (node, terms) in an.kcl.iter().enumerate() {
            if node == Self::GROUND || terms.is_empty() {
                continue;
            }
            equations.push(Equation::new(Expr::add_all(terms.clone()), Expr::ZERO));
        }
        equations.extend(an.equations.clone());

        // Parameters, in order of first appearance across the system.
        let mut params: Vec<Sym> = Vec::new();
        for eq in &equations {
            for side in [&eq.lhs, &eq.rhs] {
                side.visit_syms(&mut |s| {
                    if s.kind() == crate::algebra::SymKind::Param && !params.contains(s) {
                        params.push(s.clone());
                    }
                });
            }
        }

        Ok(Analysis {
            equations,
            unknowns: an.unknowns,
            component_voltages: an.component_voltages,
            inputs: an.inputs,
            params,
        })
    }
}

/// The raw MNA system produced by [`Netlist::analyze`].
pub struct Analysis {
    /// MNA equations: KCL sums first, then component equations.
    pub equations: Vec<Equation>,
    /// Every unknown: node voltages, branch currents, voltage derivatives.
    pub unknowns: Vec<Sym>,
    /// `(component name, terminal voltage)` for ideal two-terminal parts.
    pub component_voltages: Vec<(String, Expr)>,
    /// Input signals, in declaration order.
    pub inputs: Vec<Sym>,
    /// Parameters, in order of first appearance.
    pub params: Vec<Sym>,
}

impl fmt::Display for Analysis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} equations, {} unknowns", self.equations.len(), self.unknowns.len())?;
        for eq in &self.equations {
            writeln!(f, "  {eq}")?;
        }
        Ok(())
    }
}

/// Mutable view handed to [`Component::analyze`].
pub struct Analyzer<'a> {
    node_names: &'a [String],
    kcl: Vec<Vec<Expr>>,
    equations: Vec<Equation>,
    unknowns: Vec<Sym>,
    component_voltages: Vec<(String, Expr)>,
    inputs: Vec<Sym>,
}

impl Analyzer<'_> {
    /// The voltage at a node (zero for ground).
    pub fn node_voltage(&self, node: NodeId) -> Expr {
        if node == Netlist::GROUND {
            Expr::ZERO
        } else {
            Expr::sym(self.node_sym(node))
        }
    }

    /// The time derivative of a node voltage. Declares the derivative as an
    /// unknown on first use; ground's derivative is zero.
    pub fn node_voltage_derivative(&mut self, node: NodeId) -> Expr {
        if node == Netlist::GROUND {
            return Expr::ZERO;
        }
        let d = self.node_sym(node).d();
        self.add_unknown(d.clone());
        Expr::sym(d)
    }

    fn node_sym(&self, node: NodeId) -> Sym {
        Sym::var(&format!("V_{}", self.node_names[node]))
    }

    /// Accumulate a current flowing *into* `node` for its KCL equation.
    pub fn add_current(&mut self, node: NodeId, current: Expr) {
        if node != Netlist::GROUND {
            self.kcl[node].push(current);
        }
    }

    /// Push the current `i` through a two-terminal component from `a` to
    /// `b`: it leaves `a` and enters `b`.
    pub fn add_branch_current(&mut self, a: NodeId, b: NodeId, i: Expr) {
        self.add_current(a, -i.clone());
        self.add_current(b, i);
    }

    pub fn add_equation(&mut self, lhs: Expr, rhs: Expr) {
        self.equations.push(Equation::new(lhs, rhs));
    }

    pub fn add_unknown(&mut self, s: Sym) {
        if !self.unknowns.contains(&s) {
            self.unknowns.push(s);
        }
    }

    /// Register the terminal voltage of an ideal two-terminal component.
    pub fn register_voltage(&mut self, name: &str, v: Expr) {
        self.component_voltages.push((name.to_string(), v));
    }

    /// Declare an external input signal.
    pub fn declare_input(&mut self, s: Sym) {
        if !self.inputs.contains(&s) {
            self.inputs.push(s);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
