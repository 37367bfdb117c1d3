//! Pairwise contact spring between two voxels on the collision watch list

use crate::materials::VoxelMaterial;
use crate::math::Vec3;
use crate::voxel::{Voxel, VoxelId};
use serde::{Deserialize, Serialize};

/// Handle to a collision in the lattice's active list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CollisionId(pub usize);

/// Radius of the collision sphere around each voxel center, in units of the
/// voxel edge length.
pub const ENVELOPE_RADIUS: f64 = 0.625;

/// An active contact candidate between two surface voxels.
///
/// The stored force acts on the first voxel; the second sees its negation.
#[derive(Debug, Clone)]
pub struct Collision {
    v1: VoxelId,
    v2: VoxelId,
    penetration_stiff: f64,
    damping_c: f64,
    force: Vec3,
}

impl Collision {
    pub(crate) fn new(
        v1: VoxelId,
        mat1: &VoxelMaterial,
        v2: VoxelId,
        mat2: &VoxelMaterial,
    ) -> Self {
        // springs in series across the two contact envelopes
        let penetration_stiff = 2.0
            / (1.0 / mat1.penetration_stiffness() + 1.0 / mat2.penetration_stiffness());
        let damping_c =
            0.5 * (mat1.collision_damping_translate_c() + mat2.collision_damping_translate_c());
        Self {
            v1,
            v2,
            penetration_stiff,
            damping_c,
            force: Vec3::zeros(),
        }
    }

    pub fn voxel1(&self) -> VoxelId {
        self.v1
    }

    pub fn voxel2(&self) -> VoxelId {
        self.v2
    }

    /// The last computed contact force on the given voxel; zero for a voxel
    /// not part of this collision.
    pub fn contact_force(&self, voxel: VoxelId) -> Vec3 {
        if voxel == self.v1 {
            self.force
        } else if voxel == self.v2 {
            -self.force
        } else {
            Vec3::zeros()
        }
    }

    /// Recomputes the contact force from the voxels' current positions and
    /// velocities: a sphere-envelope spring with relative-velocity damping.
    pub(crate) fn update_contact_force(
        &mut self,
        vox1: &Voxel,
        mat1: &VoxelMaterial,
        vox2: &Voxel,
        mat2: &VoxelMaterial,
    ) {
        let offset = vox2.position() - vox1.position();
        let nominal_dist =
            (vox1.base_size_average(mat1) + vox2.base_size_average(mat2)) * ENVELOPE_RADIUS;
        let overlap = nominal_dist - offset.norm();

        if overlap > 0.0 {
            let unit = offset.normalize();
            // negative relative velocity means the voxels approach each other
            let relative_velocity =
                vox1.velocity(mat1).dot(&unit) - vox2.velocity(mat2).dot(&unit);
            self.force = unit * (self.penetration_stiff * overlap + self.damping_c * relative_velocity);
        } else {
            self.force = Vec3::zeros();
        }
    }
}
