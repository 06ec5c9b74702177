//! FX script compiler middle and back end.
//!
//! The front end (a thin AST walker, out of tree) drives
//! [`middle::builder::Builder`] to emit linear pre-SSA IR per function. From
//! there the pipeline is:
//!
//!   1. CFG construction ([`middle::cfg`])
//!   2. SSA conversion with phi placement and sealing ([`middle::ssa`])
//!   3. Dominance and loop analysis ([`middle::dominance`])
//!   4. Optimization passes ([`middle::optimize`])
//!   5. Phi resolution back out of SSA (merge block insertion)
//!   6. Liveness + linear scan register allocation ([`backend`])
//!   7. Machine lowering, reference resolution, and image packing
//!
//! The output is a packed binary image for the FX lighting VM plus a
//! resolved [`backend::Artifact`] that the host interpreter in [`vm`] can
//! execute directly for testing.

pub mod backend;
pub mod error;
pub mod index;
pub mod intern;
pub mod middle;
pub mod vm;

pub use backend::{generate, Artifact};
pub use error::{CompileError, Result};
pub use middle::{builder::Builder, compile, CompiledProgram, Options};
pub use vm::Vm;
