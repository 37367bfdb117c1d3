//! Convenient re-exports for common usage

pub use crate::array3d::{Array3D, Index3D};
pub use crate::error::{IbexError, Result, Validate};
pub use crate::external::{
    External, ALL_ROTATE, ALL_TRANSLATE, DOF_ALL, DOF_NONE, X_ROTATE, X_TRANSLATE, Y_ROTATE,
    Y_TRANSLATE, Z_ROTATE, Z_TRANSLATE,
};
pub use crate::io::{LatticeDocument, LatticeIO, ScalarFieldDocument};
pub use crate::lattice::{Lattice, StateInfo, ValueType};
pub use crate::link::{Axis, LinkId};
pub use crate::materials::{
    Color, LinkMaterial, LinkMaterialId, Material, MaterialConfig, MaterialModel, VoxelMaterial,
    VoxelMaterialId,
};
pub use crate::math::{Quat, Vec3};
pub use crate::solver::{LinearSolver, SolverProgress};
pub use crate::voxel::{LinkDirection, VoxelCorner, VoxelId};
