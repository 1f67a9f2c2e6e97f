//! MNA-to-kernel compiler.
//!
//! Turns the raw symbolic MNA system of a circuit into an executable
//! per-sample update kernel:
//!
//! 1. [`classify`] peels the equations into four strata (trivial,
//!    differential, linear, nonlinear) and precomputes the symbolic
//!    Newton step for the residual
//! 2. [`emit`] prunes dead bindings against the requested outputs and
//!    lowers each stratum into flat bytecode
//! 3. [`ir`] is the bytecode itself plus the register-machine interpreter
//!    the runtime drives sample by sample

pub mod classify;
pub mod emit;
pub mod ir;

pub use classify::{classify, SolvedSystem};
pub use emit::{build_kernel, EmitEnv, Kernel, Signature};
