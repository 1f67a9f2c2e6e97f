//! CircuitKernel — compile symbolic circuit descriptions into real-time
//! per-sample simulation kernels.
//!
//! A circuit is described as a netlist of components; each component
//! contributes its Modified Nodal Analysis equations symbolically. The
//! compiler classifies the system into trivial, differential, linear, and
//! nonlinear strata, discretizes the differential states with the
//! trapezoidal rule, and emits a flat bytecode kernel specialized for the
//! requested inputs, outputs, and parameters. The runtime then streams
//! sample buffers through that kernel with oversampling, input
//! interpolation, state carry-over, and fixed-count Newton iteration for
//! the nonlinear residual.
//!
//! # Modules
//!
//! - [`algebra`] — expression trees, symbolic solve, discretization,
//!   Newton-step solve
//! - [`circuit`] — netlists and the component `analyze` contract
//! - [`components`] — resistor, capacitor, inductor, sources, ideal
//!   op-amp, Shockley diode
//! - [`compiler`] — equation classifier, bytecode IR, kernel emitter
//! - [`simulation`] — the runtime driver: `process`, `reset`, kernel cache
//! - [`wav`] — offline rendering and test-signal helpers
//!
//! # Example
//!
//! ```
//! use circuitkernel::{InputSource, Netlist, Resistor, SimConfig, Simulation};
//!
//! // A resistive divider driven by an input buffer.
//! let mut net = Netlist::new();
//! let a = net.node("a");
//! let b = net.node("b");
//! let src = InputSource::new("Vin", a, Netlist::GROUND, "in");
//! let input = src.signal();
//! net.add(src);
//! net.add(Resistor::new("R1", a, b, 1000.0));
//! net.add(Resistor::new("R2", b, Netlist::GROUND, 1000.0));
//!
//! let config = SimConfig::new(48_000.0).with_oversample(1).with_iterations(0);
//! let mut sim = Simulation::new(&net, config).unwrap();
//!
//! let output = net.node_voltage("b");
//! let in_buf = [1.0, -1.0, 0.5];
//! let mut out_buf = [0.0; 3];
//! sim.process_mono(&input, &in_buf, &output, &mut out_buf).unwrap();
//! assert!((out_buf[0] - 0.5).abs() < 1e-12);
//! ```

pub mod algebra;
pub mod circuit;
pub mod components;
pub mod compiler;
pub mod error;
pub mod simulation;
pub mod wav;

pub use algebra::{Arrow, Equation, Expr, Sym};
pub use circuit::{Component, Netlist, NodeId};
pub use components::{
    Capacitor, Diode, DiodeModel, IdealOpAmp, Inductor, InputSource, Resistor,
    VoltageSource,
};
pub use error::{Error, Result};
pub use simulation::{SimConfig, Simulation};
