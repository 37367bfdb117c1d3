//! # Ibex Voxel Physics Engine
//!
//! Ibex is a fast, safe physics engine for deformable cubic-lattice
//! structures written in Rust. Each voxel is a rigid body with 6 degrees of
//! freedom; face-adjacent voxels are joined by elastic beam links carrying
//! axial, shear, bending and torsional loads.
//!
//! ## Features
//!
//! - Explicit symplectic time stepping with a recommended-stable-step query
//! - Nonlinear (piecewise-linear) materials with yield, failure and
//!   plastic unloading
//! - Volumetric (Poisson) coupling and thermal expansion
//! - Ground plane contact with static/kinetic friction
//! - Pairwise voxel-voxel collisions with a watch-list broadphase
//! - A one-shot linearized direct solver for static equilibrium
//! - JSON serialization of the complete lattice state
//!
//! ## Example
//!
//! ```rust
//! use ibex::prelude::*;
//!
//! // two voxels, one fixed, pull on the other
//! let mut lattice = Lattice::new(0.001);
//! let mat = lattice.add_material(1e6, 1000.0).unwrap();
//! let fixed = lattice.set_voxel(mat, 0, 0, 0).unwrap();
//! let pulled = lattice.set_voxel(mat, 1, 0, 0).unwrap();
//!
//! lattice.external(fixed).unwrap().set_fixed(true, true, true, true, true, true);
//! lattice.external(pulled).unwrap().set_force(Vec3::new(1e-3, 0.0, 0.0));
//!
//! for _ in 0..100 {
//!     lattice.do_time_step(-1.0).unwrap();
//! }
//! ```

pub mod array3d;
pub mod collision;
pub mod error;
pub mod external;
pub mod io;
pub mod lattice;
pub mod link;
pub mod materials;
pub mod math;
pub mod prelude;
pub mod solver;
pub mod voxel;

pub use error::{IbexError, Result};
pub use lattice::{Lattice, StateInfo, ValueType};

// Re-export the math backbone for convenience
pub use nalgebra as na;
