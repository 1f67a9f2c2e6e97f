//! The runtime driver: owns the classified system, the global state cells,
//! and the kernel cache, and streams caller buffers through the compiled
//! kernels.
//!
//! One `Simulation` is one single-threaded stream: kernels write into the
//! simulation-owned global cells, so two `process` calls on the same
//! instance must not overlap. Distinct instances share nothing.

use std::collections::{HashMap, HashSet};
use std::time::Instant;

use log::{info, warn};

use crate::algebra::{Expr, Sym, SymKind};
use crate::circuit::Netlist;
use crate::compiler::classify::{classify, SolvedSystem};
use crate::compiler::emit::{build_kernel, EmitEnv, Kernel, Signature};
use crate::compiler::ir::Cell;
use crate::error::{Error, Result};

/// Simulation construction parameters.
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Host sample rate (Hz).
    pub sample_rate: f64,
    /// Inner steps per host sample.
    pub oversample: usize,
    /// Newton iterations per inner step.
    pub iterations: usize,
    /// Reset and report when an output buffer tail goes non-finite.
    pub detect_divergence: bool,
}

impl Default for SimConfig {
    fn default() -> Self {
        SimConfig {
            sample_rate: 48_000.0,
            oversample: 8,
            iterations: 8,
            detect_divergence: true,
        }
    }
}

impl SimConfig {
    pub fn new(sample_rate: f64) -> SimConfig {
        SimConfig { sample_rate, ..Default::default() }
    }

    pub fn with_oversample(mut self, oversample: usize) -> SimConfig {
        self.oversample = oversample;
        self
    }

    pub fn with_iterations(mut self, iterations: usize) -> SimConfig {
        self.iterations = iterations;
        self
    }

    pub fn with_divergence_detection(mut self, on: bool) -> SimConfig {
        self.detect_divergence = on;
        self
    }
}

#[derive(Clone, PartialEq, Eq, Hash)]
struct SigKey {
    inputs: Vec<Expr>,
    outputs: Vec<Expr>,
    params: Vec<Sym>,
}

/// A compiled, streamable circuit simulation.
pub struct Simulation {
    system: SolvedSystem,
    component_voltages: Vec<(String, Expr)>,
    circuit_inputs: Vec<Sym>,
    config: SimConfig,
    /// Fixed-layout global record; every `[t0]` cell is an offset here.
    globals: Vec<f64>,
    cells: HashMap<Sym, Cell>,
    /// Symbols a requested output may reference.
    resolvable: HashSet<Sym>,
    kernels: HashMap<SigKey, Kernel>,
    scratch: Vec<f64>,
    time: f64,
}

impl Simulation {
    /// Classify the circuit's MNA system and prepare the global record.
    /// The per-signature kernels are built lazily on first `process`.
    pub fn new(netlist: &Netlist, config: SimConfig) -> Result<Simulation> {
        let start = Instant::now();
        let ms = move || start.elapsed().as_millis();

        info!(
            "[{:4} ms] building simulation: sample rate {}, oversample {}, iterations {}",
            ms(),
            config.sample_rate,
            config.oversample,
            config.iterations
        );

        let analysis = netlist.analyze()?;
        if analysis.params.contains(&Sym::param("h")) {
            return Err(Error::Configuration(
                "parameter name 'h' is reserved for the step length".to_string(),
            ));
        }

        info!(
            "[{:4} ms] MNA: {} equations, {} unknowns",
            ms(),
            analysis.equations.len(),
            analysis.unknowns.len()
        );
        for eq in &analysis.equations {
            info!("[{:4} ms]   {eq}", ms());
        }

        let h = Expr::sym(Sym::param("h"));
        let system = classify(&analysis, &h)?;

        info!("[{:4} ms] trivial solutions:", ms());
        for a in &system.trivial {
            info!("[{:4} ms]   {a}", ms());
        }
        info!("[{:4} ms] differential solutions:", ms());
        for a in &system.differential {
            info!("[{:4} ms]   {a}", ms());
        }
        info!("[{:4} ms] linear solutions:", ms());
        for a in &system.linear {
            info!("[{:4} ms]   {a}", ms());
        }
        info!(
            "[{:4} ms] nonlinear residual ({} unknowns):",
            ms(),
            system.unknowns.len()
        );
        for e in &system.nonlinear {
            info!("[{:4} ms]   {e} = 0", ms());
        }
        for a in &system.f0 {
            info!("[{:4} ms]   {a}", ms());
        }
        info!("[{:4} ms] component voltages:", ms());
        for (name, v) in &analysis.component_voltages {
            info!("[{:4} ms]   {name}: {v}", ms());
        }

        // Global cell layout: previous-step state, previous derivatives,
        // Newton guesses, substitution variables, input anchors. Fixed for
        // the simulation's lifetime so every kernel shares offsets.
        let mut cells: HashMap<Sym, Cell> = HashMap::new();
        let add = |cells: &mut HashMap<Sym, Cell>, s: Sym| {
            let next = cells.len() as Cell;
            cells.entry(s).or_insert(next);
        };
        for a in &system.differential {
            add(&mut cells, a.left.at_prev());
            add(&mut cells, a.left.d().at_prev());
        }
        for y in &system.newton_states {
            add(&mut cells, y.at_prev());
            add(&mut cells, y.d().at_prev());
        }
        for x in &system.unknowns {
            add(&mut cells, x.at_iter());
        }
        for a in &system.f0 {
            add(&mut cells, a.left.at_prev());
        }
        for u in &analysis.inputs {
            add(&mut cells, u.at_prev());
        }
        let globals = vec![0.0; cells.len()];

        let mut resolvable: HashSet<Sym> = HashSet::new();
        for a in system
            .trivial
            .iter()
            .chain(system.differential.iter())
            .chain(system.linear.iter())
        {
            resolvable.insert(a.left.clone());
        }
        resolvable.extend(system.unknowns.iter().cloned());

        Ok(Simulation {
            system,
            component_voltages: analysis.component_voltages,
            circuit_inputs: analysis.inputs,
            config,
            globals,
            cells,
            resolvable,
            kernels: HashMap::new(),
            scratch: Vec::new(),
            time: 0.0,
        })
    }

    /// Current simulation time (seconds).
    pub fn time(&self) -> f64 {
        self.time
    }

    /// Zero every global cell and rewind the clock.
    pub fn reset(&mut self) {
        self.globals.fill(0.0);
        self.time = 0.0;
    }

    /// The voltage expression across a named two-terminal component.
    pub fn component_voltage(&self, name: &str) -> Result<Expr> {
        self.component_voltages
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.clone())
            .ok_or_else(|| Error::UnknownOutput(name.to_string()))
    }

    /// Stream `n` samples through the kernel for this signature.
    ///
    /// Input and output buffers are dense `f64` arrays of length `n`,
    /// keyed by expression; parameters are bound per call in signature
    /// order without rebuilding the kernel.
    pub fn process(
        &mut self,
        n: usize,
        inputs: &[(Expr, &[f64])],
        outputs: &mut [(Expr, &mut [f64])],
        params: &[(Expr, f64)],
    ) -> Result<()> {
        for (_, buf) in inputs {
            if buf.len() != n {
                return Err(Error::LengthMismatch { expected: n, got: buf.len() });
            }
        }
        for (_, buf) in outputs.iter() {
            if buf.len() != n {
                return Err(Error::LengthMismatch { expected: n, got: buf.len() });
            }
        }
        for (e, _) in outputs.iter() {
            self.validate_output(e)?;
        }
        let mut param_syms = Vec::with_capacity(params.len());
        let mut param_values = Vec::with_capacity(params.len());
        for (e, v) in params {
            match e {
                Expr::Sym(s) if s.kind() == SymKind::Param => {
                    param_syms.push(s.clone());
                    param_values.push(*v);
                }
                other => {
                    return Err(Error::Build(format!("not a parameter: {other}")));
                }
            }
        }

        let key = SigKey {
            inputs: inputs.iter().map(|(e, _)| e.clone()).collect(),
            outputs: outputs.iter().map(|(e, _)| e.clone()).collect(),
            params: param_syms.clone(),
        };
        if !self.kernels.contains_key(&key) {
            let env = EmitEnv {
                system: &self.system,
                cells: &self.cells,
                circuit_inputs: &self.circuit_inputs,
            };
            let sig = Signature {
                inputs: &key.inputs,
                outputs: &key.outputs,
                params: &param_syms,
            };
            let kernel = build_kernel(&env, &sig)?;
            if self.scratch.len() < kernel.n_regs {
                self.scratch.resize(kernel.n_regs, 0.0);
            }
            self.kernels.insert(key.clone(), kernel);
        }
        let kernel = self.kernels.get(&key).expect("kernel just built");

        let in_bufs: Vec<&[f64]> = inputs.iter().map(|(_, b)| *b).collect();
        let mut out_bufs: Vec<&mut [f64]> =
            outputs.iter_mut().map(|(_, b)| &mut **b).collect();
        self.time = kernel.run(
            n,
            self.time,
            1.0 / self.config.sample_rate,
            self.config.oversample,
            self.config.iterations,
            &in_bufs,
            &mut out_bufs,
            &param_values,
            &mut self.globals,
            &mut self.scratch,
        );

        if self.config.detect_divergence && n > 0 {
            let diverged = outputs.iter().any(|(_, buf)| !buf[n - 1].is_finite());
            if diverged {
                warn!("simulation diverged; resetting state");
                self.reset();
            }
        }
        Ok(())
    }

    /// One input buffer in, one output buffer out.
    pub fn process_mono(
        &mut self,
        input: &Expr,
        in_buf: &[f64],
        output: &Expr,
        out_buf: &mut [f64],
    ) -> Result<()> {
        let n = in_buf.len();
        self.process(
            n,
            &[(input.clone(), in_buf)],
            &mut [(output.clone(), out_buf)],
            &[],
        )
    }

    fn validate_output(&self, e: &Expr) -> Result<()> {
        let mut unresolved: Option<Sym> = None;
        e.visit_syms(&mut |s| {
            let ok = match s.kind() {
                SymKind::Input => self.circuit_inputs.contains(&Sym::input(s.name())),
                SymKind::Param => true,
                SymKind::Var | SymKind::Deriv => {
                    self.resolvable.contains(&Sym::var(s.name()))
                }
            };
            if !ok && unresolved.is_none() {
                unresolved = Some(s.clone());
            }
        });
        match unresolved {
            Some(s) => Err(Error::UnknownOutput(format!("{e} (unresolved {s})"))),
            None => Ok(()),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::components::{InputSource, Resistor};

    fn divider() -> (Netlist, Expr, Expr) {
        let mut net = Netlist::new();
        let a = net.node("a");
        let b = net.node("b");
        let src = InputSource::new("Vin", a, Netlist::GROUND, "in");
        let input = src.signal();
        net.add(src);
        net.add(Resistor::new("R1", a, b, 1000.0));
        net.add(Resistor::new("R2", b, Netlist::GROUND, 1000.0));
        let output = net.node_voltage("b");
        (net, input, output)
    }

    #[test]
    fn divider_halves_the_input() {
        let (net, input, output) = divider();
        let config = SimConfig::new(48_000.0).with_oversample(1).with_iterations(0);
        let mut sim = Simulation::new(&net, config).unwrap();
        let in_buf = [1.0, -1.0, 0.5, 0.0];
        let mut out_buf = [0.0; 4];
        sim.process_mono(&input, &in_buf, &output, &mut out_buf).unwrap();
        for (i, (x, y)) in in_buf.iter().zip(out_buf.iter()).enumerate() {
            assert!(
                (y - 0.5 * x).abs() < 1e-12,
                "sample {i}: {x} should halve to {y}"
            );
        }
    }

    #[test]
    fn length_mismatch_is_rejected_before_running() {
        let (net, input, output) = divider();
        let mut sim = Simulation::new(&net, SimConfig::new(48_000.0)).unwrap();
        let in_buf = [1.0; 4];
        let mut out_buf = [0.0; 3];
        let err = sim
            .process(
                4,
                &[(input, &in_buf)],
                &mut [(output, &mut out_buf)],
                &[],
            )
            .unwrap_err();
        assert!(matches!(err, Error::LengthMismatch { expected: 4, got: 3 }));
    }

    #[test]
    fn unknown_output_is_rejected() {
        let (net, input, _) = divider();
        let mut sim = Simulation::new(&net, SimConfig::new(48_000.0)).unwrap();
        let in_buf = [1.0; 2];
        let mut out_buf = [0.0; 2];
        let err = sim
            .process(
                2,
                &[(input, &in_buf)],
                &mut [(Expr::var("V_nope"), &mut out_buf)],
                &[],
            )
            .unwrap_err();
        assert!(matches!(err, Error::UnknownOutput(_)));
    }

    #[test]
    fn component_voltage_lookup() {
        let (net, _, _) = divider();
        let sim = Simulation::new(&net, SimConfig::new(48_000.0)).unwrap();
        assert!(sim.component_voltage("R2").is_ok());
        assert!(sim.component_voltage("R9").is_err());
    }

    #[test]
    fn reset_rewinds_the_clock() {
        let (net, input, output) = divider();
        let mut sim = Simulation::new(&net, SimConfig::new(48_000.0).with_oversample(1))
            .unwrap();
        let in_buf = [1.0; 8];
        let mut out_buf = [0.0; 8];
        sim.process_mono(&input, &in_buf, &output, &mut out_buf).unwrap();
        assert!(sim.time() > 0.0);
        sim.reset();
        assert_eq!(sim.time(), 0.0);
    }
}
