//! The component library.
//!
//! Each part contributes its constitutive relation to the MNA system
//! through [`Component::analyze`]. Passive conductance-form parts
//! (resistor, capacitor, diode) push their current directly into the KCL
//! sums; parts that constrain a voltage (sources, inductor, op-amp) declare
//! a branch-current unknown and an extra equation.
//!
//! Component values are expressions, so a resistance can be a literal or a
//! parameter bound per `process` call.

use crate::algebra::{Expr, Sym};
use crate::circuit::{Analyzer, Component, NodeId};

/// Thermal voltage kT/q at 300 K.
pub const VT_300K: f64 = 0.02585;

// ═══════════════════════════════════════════════════════════════════════════
// Passives
// ═══════════════════════════════════════════════════════════════════════════

/// Ideal resistor: `i = (Va − Vb) / R`.
pub struct Resistor {
    name: String,
    a: NodeId,
    b: NodeId,
    resistance: Expr,
}

impl Resistor {
    pub fn new(name: &str, a: NodeId, b: NodeId, resistance: impl Into<Expr>) -> Resistor {
        Resistor { name: name.to_string(), a, b, resistance: resistance.into() }
    }
}

impl Component for Resistor {
    fn name(&self) -> &str {
        &self.name
    }

    fn analyze(&self, an: &mut Analyzer) {
        let v = an.node_voltage(self.a) - an.node_voltage(self.b);
        let i = v.clone() / self.resistance.clone();
        an.add_branch_current(self.a, self.b, i);
        an.register_voltage(&self.name, v);
    }
}

/// Ideal capacitor: `i = C · d(Va − Vb)/dt`.
///
/// The voltage derivatives are declared as unknowns; the classifier
/// recognizes them and discretizes the node voltages they belong to.
pub struct Capacitor {
    name: String,
    a: NodeId,
    b: NodeId,
    capacitance: Expr,
}

impl Capacitor {
    pub fn new(name: &str, a: NodeId, b: NodeId, capacitance: impl Into<Expr>) -> Capacitor {
        Capacitor { name: name.to_string(), a, b, capacitance: capacitance.into() }
    }
}

impl Component for Capacitor {
    fn name(&self) -> &str {
        &self.name
    }

    fn analyze(&self, an: &mut Analyzer) {
        let dv = an.node_voltage_derivative(self.a) - an.node_voltage_derivative(self.b);
        let i = self.capacitance.clone() * dv;
        an.add_branch_current(self.a, self.b, i);
        let v = an.node_voltage(self.a) - an.node_voltage(self.b);
        an.register_voltage(&self.name, v);
    }
}

/// Ideal inductor: `Va − Vb = L · di/dt`, with the branch current and its
/// derivative as unknowns.
pub struct Inductor {
    name: String,
    a: NodeId,
    b: NodeId,
    inductance: Expr,
}

impl Inductor {
    pub fn new(name: &str, a: NodeId, b: NodeId, inductance: impl Into<Expr>) -> Inductor {
        Inductor { name: name.to_string(), a, b, inductance: inductance.into() }
    }
}

impl Component for Inductor {
    fn name(&self) -> &str {
        &self.name
    }

    fn analyze(&self, an: &mut Analyzer) {
        let i = Sym::var(&format!("I_{}", self.name));
        let di = i.d();
        an.add_unknown(i.clone());
        an.add_unknown(di.clone());
        an.add_branch_current(self.a, self.b, Expr::sym(i));
        let v = an.node_voltage(self.a) - an.node_voltage(self.b);
        an.add_equation(v.clone(), self.inductance.clone() * Expr::sym(di));
        an.register_voltage(&self.name, v);
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Sources
// ═══════════════════════════════════════════════════════════════════════════

/// Independent voltage source: `Va − Vb = v(t)`.
///
/// The source expression may reference [`Expr::Time`], e.g. a sine built
/// with [`VoltageSource::sine`].
pub struct VoltageSource {
    name: String,
    a: NodeId,
    b: NodeId,
    voltage: Expr,
}

impl VoltageSource {
    pub fn new(name: &str, a: NodeId, b: NodeId, voltage: impl Into<Expr>) -> VoltageSource {
        VoltageSource { name: name.to_string(), a, b, voltage: voltage.into() }
    }

    /// A sine source `amplitude · sin(2π·freq·t)`.
    pub fn sine(name: &str, a: NodeId, b: NodeId, amplitude: f64, freq_hz: f64) -> VoltageSource {
        let phase = Expr::num(2.0 * std::f64::consts::PI * freq_hz) * Expr::Time;
        Self::new(name, a, b, Expr::num(amplitude) * phase.sin())
    }
}

impl Component for VoltageSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn analyze(&self, an: &mut Analyzer) {
        let i = Sym::var(&format!("I_{}", self.name));
        an.add_unknown(i.clone());
        an.add_branch_current(self.a, self.b, Expr::sym(i));
        let v = an.node_voltage(self.a) - an.node_voltage(self.b);
        an.add_equation(v.clone(), self.voltage.clone());
        an.register_voltage(&self.name, v);
    }
}

/// Voltage source driven by an external input buffer.
pub struct InputSource {
    name: String,
    a: NodeId,
    b: NodeId,
    signal: Sym,
}

impl InputSource {
    pub fn new(name: &str, a: NodeId, b: NodeId, signal: &str) -> InputSource {
        InputSource { name: name.to_string(), a, b, signal: Sym::input(signal) }
    }

    /// The input expression callers pass to `process`.
    pub fn signal(&self) -> Expr {
        Expr::sym(self.signal.clone())
    }
}

impl Component for InputSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn analyze(&self, an: &mut Analyzer) {
        an.declare_input(self.signal.clone());
        let i = Sym::var(&format!("I_{}", self.name));
        an.add_unknown(i.clone());
        an.add_branch_current(self.a, self.b, Expr::sym(i));
        let v = an.node_voltage(self.a) - an.node_voltage(self.b);
        an.add_equation(v.clone(), Expr::sym(self.signal.clone()));
        an.register_voltage(&self.name, v);
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Active parts
// ═══════════════════════════════════════════════════════════════════════════

/// Ideal op-amp: infinite gain, no input current, so `V+ = V−`.
///
/// Three-terminal: only the output sources current, through an unknown the
/// feedback network determines. No saturation model.
pub struct IdealOpAmp {
    name: String,
    pos: NodeId,
    neg: NodeId,
    out: NodeId,
}

impl IdealOpAmp {
    pub fn new(name: &str, pos: NodeId, neg: NodeId, out: NodeId) -> IdealOpAmp {
        IdealOpAmp { name: name.to_string(), pos, neg, out }
    }
}

impl Component for IdealOpAmp {
    fn name(&self) -> &str {
        &self.name
    }

    fn analyze(&self, an: &mut Analyzer) {
        let i = Sym::var(&format!("I_{}", self.name));
        an.add_unknown(i.clone());
        an.add_current(self.out, Expr::sym(i));
        an.add_equation(an.node_voltage(self.pos), an.node_voltage(self.neg));
    }
}

/// Shockley diode parameters.
#[derive(Clone, Copy, Debug)]
pub struct DiodeModel {
    /// Saturation current Is (A).
    pub saturation_current: f64,
    /// Emission coefficient n.
    pub emission_coefficient: f64,
}

impl DiodeModel {
    pub fn silicon() -> DiodeModel {
        DiodeModel { saturation_current: 1e-14, emission_coefficient: 1.0 }
    }

    pub fn germanium() -> DiodeModel {
        DiodeModel { saturation_current: 1e-6, emission_coefficient: 1.0 }
    }

    pub fn led() -> DiodeModel {
        DiodeModel { saturation_current: 1e-18, emission_coefficient: 2.0 }
    }

    fn n_vt(&self) -> f64 {
        self.emission_coefficient * VT_300K
    }
}

/// Shockley diode: `i = Is · (exp((Va − Vb)/(n·Vt)) − 1)` from anode to
/// cathode. The exponential lands in the nonlinear stratum and engages the
/// Newton solver.
pub struct Diode {
    name: String,
    anode: NodeId,
    cathode: NodeId,
    model: DiodeModel,
}

impl Diode {
    pub fn new(name: &str, anode: NodeId, cathode: NodeId, model: DiodeModel) -> Diode {
        Diode { name: name.to_string(), anode, cathode, model }
    }

    pub fn silicon(name: &str, anode: NodeId, cathode: NodeId) -> Diode {
        Self::new(name, anode, cathode, DiodeModel::silicon())
    }
}

impl Component for Diode {
    fn name(&self) -> &str {
        &self.name
    }

    fn analyze(&self, an: &mut Analyzer) {
        let v = an.node_voltage(self.anode) - an.node_voltage(self.cathode);
        let is = Expr::num(self.model.saturation_current);
        let i = is.clone() * ((v.clone() / Expr::num(self.model.n_vt())).exp() - Expr::ONE);
        an.add_branch_current(self.anode, self.cathode, i);
        an.register_voltage(&self.name, v);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::Netlist;

    #[test]
    fn capacitor_declares_voltage_derivative() {
        let mut net = Netlist::new();
        let a = net.node("a");
        net.add(InputSource::new("Vin", a, Netlist::GROUND, "in"));
        net.add(Capacitor::new("C1", a, Netlist::GROUND, 1e-6));
        let analysis = net.analyze().unwrap();
        assert!(
            analysis.unknowns.iter().any(|u| u.is_d()),
            "capacitor should declare dV/dt as an unknown"
        );
    }

    #[test]
    fn inductor_declares_branch_current() {
        let mut net = Netlist::new();
        let a = net.node("a");
        net.add(InputSource::new("Vin", a, Netlist::GROUND, "in"));
        net.add(Inductor::new("L1", a, Netlist::GROUND, 1e-3));
        let analysis = net.analyze().unwrap();
        assert!(analysis.unknowns.contains(&Sym::var("I_L1")));
        assert!(analysis.unknowns.iter().any(|u| u.is_d() && u.name() == "I_L1"));
    }

    #[test]
    fn diode_current_is_nonlinear_in_junction_voltage() {
        let mut net = Netlist::new();
        let a = net.node("a");
        let b = net.node("b");
        net.add(Diode::silicon("D1", a, b));
        let analysis = net.analyze().unwrap();
        // Both KCL equations carry the exponential.
        let nonlinear = analysis
            .equations
            .iter()
            .any(|eq| format!("{eq}").contains("exp"));
        assert!(nonlinear);
    }

    #[test]
    fn sine_source_references_time() {
        let mut net = Netlist::new();
        let s = net.node("s");
        net.add(VoltageSource::sine("V1", s, Netlist::GROUND, 1.0, 1000.0));
        let analysis = net.analyze().unwrap();
        assert!(analysis.equations.iter().any(|eq| eq.rhs.depends_on_time()));
    }

    #[test]
    fn parameter_values_are_collected() {
        let mut net = Netlist::new();
        let a = net.node("a");
        net.add(InputSource::new("Vin", a, Netlist::GROUND, "in"));
        net.add(Resistor::new("R1", a, Netlist::GROUND, Expr::sym(Sym::param("R1"))));
        let analysis = net.analyze().unwrap();
        assert_eq!(analysis.params, vec![Sym::param("R1")]);
    }

    #[test]
    fn opamp_ties_inputs_together() {
        let mut net = Netlist::new();
        let p = net.node("p");
        let o = net.node("o");
        net.add(InputSource::new("Vin", p, Netlist::GROUND, "in"));
        net.add(IdealOpAmp::new("U1", p, o, o));
        let analysis = net.analyze().unwrap();
        // V_p = V_o appears as a component equation.
        assert!(analysis
            .equations
            .iter()
            .any(|eq| format!("{eq}") == "V_p = V_o"));
    }
}
