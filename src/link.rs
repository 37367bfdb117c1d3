//! The elastic beam joining two face-adjacent voxels
//!
//! Each link is a 12-DOF beam element carrying axial, shear, bending and
//! torsional loads between its two end voxels. Geometry is evaluated in a
//! link-local frame with the link axis mapped onto +X; links whose relative
//! rotation and stretch stay small run a linearized fast path with
//! hysteresis on the mode switch.

use crate::materials::{LinkMaterial, LinkMaterialId, VoxelMaterial};
use crate::math::{
    quat_from_angle_to_pos_x, quat_identity, rotate_vec, rotate_vec_inv, rotation_vector, Quat,
    Vec3,
};
use crate::voxel::{Voxel, VoxelId};
use nalgebra::Quaternion;
use serde::{Deserialize, Serialize};

/// Handle to a link in the lattice arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LinkId(pub usize);

/// A lattice axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Axis {
    X = 0,
    Y = 1,
    Z = 2,
}

impl Axis {
    pub const ALL: [Axis; 3] = [Axis::X, Axis::Y, Axis::Z];

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }
}

// hysteresis band and thresholds for the small-angle fast path
const HYSTERESIS_FACTOR: f64 = 1.2;
const SA_BOND_BEND_RAD: f64 = 0.05;
const SA_BOND_EXT_PERC: f64 = 0.5;

/// Runtime state of one beam link.
///
/// `v_neg` always holds the voxel with the smaller lattice index along the
/// link axis. Forces and moments are reported in each end voxel's local
/// frame.
#[derive(Debug, Clone)]
pub struct Link {
    v_neg: VoxelId,
    v_pos: VoxelId,
    axis: Axis,
    mat: LinkMaterialId,

    force_neg: Vec3,
    force_pos: Vec3,
    moment_neg: Vec3,
    moment_pos: Vec3,

    strain: f64,
    max_strain: f64,
    strain_offset: f64,
    stress: f64,
    strain_ratio: f64,

    // link-local geometry: the negative end sits at the origin
    pos2: Vec3,
    angle1v: Vec3,
    angle2v: Vec3,
    angle1: Quat,
    angle2: Quat,
    small_angle: bool,
    current_rest_length: f64,
    current_transverse_area: f64,
    current_transverse_strain_sum: f64,
    local_velocity_valid: bool,
}

impl Link {
    pub(crate) fn new(v_neg: VoxelId, v_pos: VoxelId, axis: Axis, mat: LinkMaterialId) -> Self {
        Self {
            v_neg,
            v_pos,
            axis,
            mat,
            force_neg: Vec3::zeros(),
            force_pos: Vec3::zeros(),
            moment_neg: Vec3::zeros(),
            moment_pos: Vec3::zeros(),
            strain: 0.0,
            max_strain: 0.0,
            strain_offset: 0.0,
            stress: 0.0,
            strain_ratio: 1.0,
            pos2: Vec3::zeros(),
            angle1v: Vec3::zeros(),
            angle2v: Vec3::zeros(),
            angle1: quat_identity(),
            angle2: quat_identity(),
            small_angle: true,
            current_rest_length: 0.0,
            current_transverse_area: 0.0,
            current_transverse_strain_sum: 0.0,
            local_velocity_valid: false,
        }
    }

    /// Returns the link to its unstressed state.
    pub(crate) fn reset(
        &mut self,
        v_neg: &Voxel,
        v_pos: &Voxel,
        mat_neg: &VoxelMaterial,
        mat_pos: &VoxelMaterial,
    ) {
        self.pos2 = Vec3::zeros();
        self.angle1v = Vec3::zeros();
        self.angle2v = Vec3::zeros();
        self.angle1 = quat_identity();
        self.angle2 = quat_identity();
        self.force_neg = Vec3::zeros();
        self.force_pos = Vec3::zeros();
        self.moment_neg = Vec3::zeros();
        self.moment_pos = Vec3::zeros();
        self.strain = 0.0;
        self.max_strain = 0.0;
        self.strain_offset = 0.0;
        self.stress = 0.0;
        self.strain_ratio =
            mat_pos.material.youngs_modulus() / mat_neg.material.youngs_modulus();
        self.small_angle = true;
        self.local_velocity_valid = false;

        self.update_rest_length(v_neg, v_pos, mat_neg, mat_pos);
        self.update_transverse_info(v_neg, v_pos, mat_neg, mat_pos);
    }

    /// The voxel at the requested end.
    pub fn voxel(&self, positive_end: bool) -> VoxelId {
        if positive_end {
            self.v_pos
        } else {
            self.v_neg
        }
    }

    pub fn axis(&self) -> Axis {
        self.axis
    }

    pub fn material(&self) -> LinkMaterialId {
        self.mat
    }

    /// Force on the voxel at the requested end, in that voxel's frame.
    pub fn force(&self, positive_end: bool) -> Vec3 {
        if positive_end {
            self.force_pos
        } else {
            self.force_neg
        }
    }

    /// Moment on the voxel at the requested end, in that voxel's frame.
    pub fn moment(&self, positive_end: bool) -> Vec3 {
        if positive_end {
            self.moment_pos
        } else {
            self.moment_neg
        }
    }

    /// Overall axial strain between the two voxels.
    pub fn axial_strain(&self) -> f64 {
        self.strain
    }

    /// Axial strain of the half-bond at one end, weighted by the stiffness
    /// asymmetry of the two materials.
    pub fn axial_strain_end(&self, positive_end: bool) -> f64 {
        if positive_end {
            2.0 * self.strain * self.strain_ratio / (1.0 + self.strain_ratio)
        } else {
            2.0 * self.strain / (1.0 + self.strain_ratio)
        }
    }

    /// Current true axial stress, Pa.
    pub fn axial_stress(&self) -> f64 {
        self.stress
    }

    pub fn is_small_angle(&self) -> bool {
        self.small_angle
    }

    pub fn is_yielded(&self, link_mats: &[LinkMaterial]) -> bool {
        link_mats[self.mat.0].material.is_yielded(self.max_strain)
    }

    pub fn is_failed(&self, link_mats: &[LinkMaterial]) -> bool {
        link_mats[self.mat.0].material.is_failed(self.max_strain)
    }

    /// Rest length from the two voxels' current zero-stress sizes.
    pub(crate) fn update_rest_length(
        &mut self,
        v_neg: &Voxel,
        v_pos: &Voxel,
        mat_neg: &VoxelMaterial,
        mat_pos: &VoxelMaterial,
    ) {
        self.current_rest_length = 0.5
            * (v_neg.base_size_axis(mat_neg, self.axis) + v_pos.base_size_axis(mat_pos, self.axis));
    }

    /// Transverse area and Poisson strain sum averaged from the two ends.
    pub(crate) fn update_transverse_info(
        &mut self,
        v_neg: &Voxel,
        v_pos: &Voxel,
        mat_neg: &VoxelMaterial,
        mat_pos: &VoxelMaterial,
    ) {
        self.current_transverse_area = 0.5
            * (v_neg.transverse_area(mat_neg, self.axis) + v_pos.transverse_area(mat_pos, self.axis));
        self.current_transverse_strain_sum = 0.5
            * (v_neg.transverse_strain_sum(mat_neg, self.axis)
                + v_pos.transverse_strain_sum(mat_pos, self.axis));
    }

    // permutations taking the link axis onto +X and back
    fn to_axis_x(&self, v: &Vec3) -> Vec3 {
        match self.axis {
            Axis::X => *v,
            Axis::Y => Vec3::new(v.y, -v.x, v.z),
            Axis::Z => Vec3::new(v.z, v.y, -v.x),
        }
    }

    fn to_axis_x_quat(&self, q: &Quat) -> Quat {
        match self.axis {
            Axis::X => *q,
            Axis::Y => Quaternion::new(q.w, q.j, -q.i, q.k),
            Axis::Z => Quaternion::new(q.w, q.k, q.j, -q.i),
        }
    }

    fn to_axis_original(&self, v: &Vec3) -> Vec3 {
        match self.axis {
            Axis::X => *v,
            Axis::Y => Vec3::new(-v.y, v.x, v.z),
            Axis::Z => Vec3::new(-v.z, v.y, v.x),
        }
    }

    // Updates pos2, angle1, angle2 and the small-angle mode from the current
    // voxel poses. The negative end is made canonical by left-multiplying
    // everything with its inverse orientation.
    fn orient_link(&mut self, v_neg: &Voxel, v_pos: &Voxel) {
        self.pos2 = self.to_axis_x(&(v_pos.position() - v_neg.position()));
        self.angle1 = self.to_axis_x_quat(&v_neg.orientation());
        self.angle2 = self.to_axis_x_quat(&v_pos.orientation());

        let total_rot = self.angle1.conjugate();
        self.pos2 = rotate_vec(&total_rot, &self.pos2);
        self.angle2 = total_rot * self.angle2;
        self.angle1 = quat_identity();

        let small_turn = (self.pos2.z.abs() + self.pos2.y.abs()) / self.pos2.x;
        let extend_perc = (1.0 - self.pos2.x / self.current_rest_length).abs();
        if !self.small_angle && small_turn < SA_BOND_BEND_RAD && extend_perc < SA_BOND_EXT_PERC {
            self.small_angle = true;
            self.local_velocity_valid = false;
        } else if self.small_angle
            && (small_turn > HYSTERESIS_FACTOR * SA_BOND_BEND_RAD
                || extend_perc > HYSTERESIS_FACTOR * SA_BOND_EXT_PERC)
        {
            self.small_angle = false;
            self.local_velocity_valid = false;
        }

        if self.small_angle {
            // angle1 stays identity; axial offset only holds for small angles
            self.pos2.x -= self.current_rest_length;
        } else {
            // align pos2 with +X, folding the alignment into both angles
            self.angle1 = quat_from_angle_to_pos_x(&self.pos2);
            self.angle2 = self.angle1 * self.angle2;
            self.pos2 = Vec3::new(self.pos2.norm() - self.current_rest_length, 0.0, 0.0);
        }

        self.angle1v = rotation_vector(&self.angle1);
        self.angle2v = rotation_vector(&self.angle2);
    }

    // Tracks the strain state, returning the current stress. Nonlinear
    // materials unload along the elastic line through the maximum strain
    // seen, leaving a strain offset (plastic deformation).
    fn update_strain(&mut self, axial_strain: f64, lmat: &LinkMaterial) -> f64 {
        let material = &lmat.material;
        self.strain = axial_strain;

        if material.model().is_linear() {
            if axial_strain > self.max_strain {
                self.max_strain = axial_strain;
            }
            return material.stress(axial_strain, self.current_transverse_strain_sum, false);
        }

        if axial_strain > self.max_strain {
            // new territory on the stress/strain curve
            self.max_strain = axial_strain;
            let return_stress =
                material.stress(axial_strain, self.current_transverse_strain_sum, false);

            if material.poissons_ratio() != 0.0 {
                self.strain_offset = self.max_strain
                    - material.stress(axial_strain, 0.0, false)
                        / (material.e_hat() * (1.0 - material.poissons_ratio()));
            } else {
                self.strain_offset = self.max_strain - return_stress / material.youngs_modulus();
            }
            return_stress
        } else {
            // unloaded into the linear region with a plastic strain offset
            let relative_strain = axial_strain - self.strain_offset;
            if material.poissons_ratio() != 0.0 {
                material.stress(relative_strain, self.current_transverse_strain_sum, true)
            } else {
                material.youngs_modulus() * relative_strain
            }
        }
    }

    /// Recomputes the forces and moments on both ends from the current voxel
    /// positions and orientations.
    pub(crate) fn update_forces(
        &mut self,
        v_neg: &Voxel,
        v_pos: &Voxel,
        mat_neg: &VoxelMaterial,
        mat_pos: &VoxelMaterial,
        lmat: &LinkMaterial,
    ) {
        // previous geometry feeds the local damping velocity estimate
        let old_pos2 = self.pos2;
        let old_angle1v = self.angle1v;
        let old_angle2v = self.angle2v;

        self.orient_link(v_neg, v_pos);

        // velocity at the bond center is half the relative velocity
        let d_pos2 = 0.5 * (self.pos2 - old_pos2);
        let d_angle1 = 0.5 * (self.angle1v - old_angle1v);
        let d_angle2 = 0.5 * (self.angle2v - old_angle2v);

        // the nonzero check catches poisson's ratio disabled mid-simulation
        if !lmat.material.is_xyz_independent() || self.current_transverse_strain_sum != 0.0 {
            self.update_transverse_info(v_neg, v_pos, mat_neg, mat_pos);
        }

        self.stress = self.update_strain(self.pos2.x / self.current_rest_length, lmat);
        if lmat.material.is_failed(self.max_strain) {
            self.force_neg = Vec3::zeros();
            self.force_pos = Vec3::zeros();
            self.moment_neg = Vec3::zeros();
            self.moment_pos = Vec3::zeros();
            return;
        }

        let (b1, b2, b3, a2) = (lmat.b1(), lmat.b2(), lmat.b3(), lmat.a2());

        // beam equations; the axial term uses the current stress to account
        // for nonlinear deformation
        self.force_neg = Vec3::new(
            self.stress * self.current_transverse_area,
            b1 * self.pos2.y - b2 * (self.angle1v.z + self.angle2v.z),
            b1 * self.pos2.z + b2 * (self.angle1v.y + self.angle2v.y),
        );
        self.force_pos = -self.force_neg;

        self.moment_neg = Vec3::new(
            a2 * (self.angle2v.x - self.angle1v.x),
            -b2 * self.pos2.z - b3 * (2.0 * self.angle1v.y + self.angle2v.y),
            b2 * self.pos2.y - b3 * (2.0 * self.angle1v.z + self.angle2v.z),
        );
        self.moment_pos = Vec3::new(
            a2 * (self.angle1v.x - self.angle2v.x),
            -b2 * self.pos2.z - b3 * (self.angle1v.y + 2.0 * self.angle2v.y),
            b2 * self.pos2.y - b3 * (self.angle1v.z + 2.0 * self.angle2v.z),
        );

        if self.local_velocity_valid {
            let sq_a1 = lmat.sq_a1();
            let sq_a2_x_ip = lmat.sq_a2_x_ip();
            let sq_b1 = lmat.sq_b1();
            let sq_b2_x_fmp = lmat.sq_b2_x_fmp();
            let sq_b3_x_ip = lmat.sq_b3_x_ip();

            let pos_calc = Vec3::new(
                sq_a1 * d_pos2.x,
                sq_b1 * d_pos2.y - sq_b2_x_fmp * (d_angle1.z + d_angle2.z),
                sq_b1 * d_pos2.z + sq_b2_x_fmp * (d_angle1.y + d_angle2.y),
            );

            let c_neg = v_neg.damping_multiplier(mat_neg);
            let c_pos = v_pos.damping_multiplier(mat_pos);

            self.force_neg += c_neg * pos_calc;
            self.force_pos -= c_pos * pos_calc;

            self.moment_neg -= 0.5
                * c_neg
                * Vec3::new(
                    -sq_a2_x_ip * (d_angle2.x - d_angle1.x),
                    sq_b2_x_fmp * d_pos2.z + sq_b3_x_ip * (2.0 * d_angle1.y + d_angle2.y),
                    -sq_b2_x_fmp * d_pos2.y + sq_b3_x_ip * (2.0 * d_angle1.z + d_angle2.z),
                );
            self.moment_pos -= 0.5
                * c_pos
                * Vec3::new(
                    sq_a2_x_ip * (d_angle2.x - d_angle1.x),
                    sq_b2_x_fmp * d_pos2.z + sq_b3_x_ip * (d_angle1.y + 2.0 * d_angle2.y),
                    -sq_b2_x_fmp * d_pos2.y + sq_b3_x_ip * (d_angle1.z + 2.0 * d_angle2.z),
                );
        } else {
            // no valid velocity basis this step; good for the next one
            self.local_velocity_valid = true;
        }

        // transform forces and moments back into the voxels' frames
        if !self.small_angle {
            self.force_neg = rotate_vec_inv(&self.angle1, &self.force_neg);
            self.moment_neg = rotate_vec_inv(&self.angle1, &self.moment_neg);
        }
        self.force_pos = rotate_vec_inv(&self.angle2, &self.force_pos);
        self.moment_pos = rotate_vec_inv(&self.angle2, &self.moment_pos);

        self.force_neg = self.to_axis_original(&self.force_neg);
        self.force_pos = self.to_axis_original(&self.force_pos);
        self.moment_neg = self.to_axis_original(&self.moment_neg);
        self.moment_pos = self.to_axis_original(&self.moment_pos);
    }

    /// Recoverable elastic energy in the link, Joules.
    pub fn strain_energy(&self, lmat: &LinkMaterial) -> f64 {
        self.force_neg.x * self.force_neg.x / (2.0 * lmat.a1())
            + self.moment_neg.x * self.moment_neg.x / (2.0 * lmat.a2())
            + (self.moment_neg.z * self.moment_neg.z
                - self.moment_neg.z * self.moment_pos.z
                + self.moment_pos.z * self.moment_pos.z)
                / (3.0 * lmat.b3())
            + (self.moment_neg.y * self.moment_neg.y
                - self.moment_neg.y * self.moment_pos.y
                + self.moment_pos.y * self.moment_pos.y)
                / (3.0 * lmat.b3())
    }

    /// Current linear axial stiffness at this strain.
    pub fn axial_stiffness(&self, lmat: &LinkMaterial) -> f64 {
        if lmat.material.is_xyz_independent() {
            lmat.a1()
        } else {
            lmat.material.e_hat() * self.current_transverse_area
                / ((self.strain + 1.0) * self.current_rest_length)
        }
    }
}
