//! Schur complement elimination for block-sparse least-squares systems.
//!
//! Given `A = [E F]`, a right-hand side `b` and an optional damping diagonal
//! `D`, the crate forms the reduced system over F
//!
//! ```text
//! S = FᵗF - FᵗE (EᵗE)⁻¹ EᵗF
//! r = Fᵗb - FᵗE (EᵗE)⁻¹ Eᵗb
//! ```
//!
//! either explicitly ([`linalg::SchurEliminatorBase`]) or as a matrix-free
//! operator ([`linalg::ImplicitSchurComplement`]), and recovers the eliminated
//! variables by back-substitution.

pub mod error;
pub mod linalg;
pub mod logger;
pub mod parallel;

pub use error::{LinAlgError, LinAlgResult};
pub use logger::{init_logger, init_logger_with_level};
pub use parallel::ParallelContext;
