//! A single lattice-cell rigid body and its integration step
//!
//! A voxel has 6 degrees of freedom; its local coordinate system stays
//! centered on the voxel and oriented with the cube axes. Forces arrive from
//! up to six beam links, an optional [`External`], gravity, global damping,
//! floor contact and watched collisions.

use crate::array3d::Index3D;
use crate::collision::{Collision, CollisionId};
use crate::external::{
    External, X_ROTATE, X_TRANSLATE, Y_ROTATE, Y_TRANSLATE, Z_ROTATE, Z_TRANSLATE,
};
use crate::link::{Axis, Link, LinkId};
use crate::materials::{LinkMaterial, VoxelMaterial, VoxelMaterialId};
use crate::math::{quat_from_rotation_vector, quat_identity, rotate_vec, rotation_vector, Quat, Vec3};
use serde::{Deserialize, Serialize};

/// Handle to a voxel in the lattice arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VoxelId(pub usize);

/// Direction of a link relative to a voxel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LinkDirection {
    XPos = 0,
    XNeg = 1,
    YPos = 2,
    YNeg = 3,
    ZPos = 4,
    ZNeg = 5,
}

impl LinkDirection {
    pub const ALL: [LinkDirection; 6] = [
        LinkDirection::XPos,
        LinkDirection::XNeg,
        LinkDirection::YPos,
        LinkDirection::YNeg,
        LinkDirection::ZPos,
        LinkDirection::ZNeg,
    ];

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    #[inline]
    pub fn axis(self) -> Axis {
        match self {
            LinkDirection::XPos | LinkDirection::XNeg => Axis::X,
            LinkDirection::YPos | LinkDirection::YNeg => Axis::Y,
            LinkDirection::ZPos | LinkDirection::ZNeg => Axis::Z,
        }
    }

    #[inline]
    pub fn is_negative(self) -> bool {
        self.index() % 2 == 1
    }

    #[inline]
    pub fn is_positive(self) -> bool {
        !self.is_negative()
    }

    #[inline]
    pub fn opposite(self) -> LinkDirection {
        Self::ALL[self.index() ^ 1]
    }

    #[inline]
    pub fn from_axis(axis: Axis, positive: bool) -> LinkDirection {
        Self::ALL[2 * axis.index() + if positive { 0 } else { 1 }]
    }

    /// Offset to the neighbouring voxel in this direction.
    pub fn neighbour_offset(self) -> Index3D {
        match self {
            LinkDirection::XPos => Index3D::new(1, 0, 0),
            LinkDirection::XNeg => Index3D::new(-1, 0, 0),
            LinkDirection::YPos => Index3D::new(0, 1, 0),
            LinkDirection::YNeg => Index3D::new(0, -1, 0),
            LinkDirection::ZPos => Index3D::new(0, 0, 1),
            LinkDirection::ZNeg => Index3D::new(0, 0, -1),
        }
    }
}

/// One of the eight voxel corners, bit-encoded as (X, Y, Z) sign bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VoxelCorner {
    Nnn = 0,
    Nnp = 1,
    Npn = 2,
    Npp = 3,
    Pnn = 4,
    Pnp = 5,
    Ppn = 6,
    Ppp = 7,
}

impl VoxelCorner {
    pub const ALL: [VoxelCorner; 8] = [
        VoxelCorner::Nnn,
        VoxelCorner::Nnp,
        VoxelCorner::Npn,
        VoxelCorner::Npp,
        VoxelCorner::Pnn,
        VoxelCorner::Pnp,
        VoxelCorner::Ppn,
        VoxelCorner::Ppp,
    ];

    #[inline]
    pub fn bits(self) -> u8 {
        self as u8
    }
}

// boolean state flags
const SURFACE: u8 = 1 << 1;
const FLOOR_ENABLED: u8 = 1 << 2;
const FLOOR_STATIC_FRICTION: u8 = 1 << 3;
const COLLISIONS_ENABLED: u8 = 1 << 5;

/// Runtime state of one lattice site.
#[derive(Debug, Clone)]
pub struct Voxel {
    mat: VoxelMaterialId,
    ix: i32,
    iy: i32,
    iz: i32,
    links: [Option<LinkId>; 6],

    pub(crate) pos: Vec3,
    pub(crate) lin_mom: Vec3,
    pub(crate) orient: Quat,
    pub(crate) ang_mom: Vec3,

    temp: f64,
    previous_dt: f64,
    p_strain: Vec3,
    bool_states: u8,
    ext: Option<Box<External>>,

    pub(crate) last_watch_position: Vec3,
    pub(crate) col_watch: Vec<CollisionId>,
    pub(crate) nearby: Vec<VoxelId>,
}

impl Voxel {
    pub(crate) fn new(mat: VoxelMaterialId, ix: i32, iy: i32, iz: i32, nominal_size: f64) -> Self {
        let mut voxel = Self {
            mat,
            ix,
            iy,
            iz,
            links: [None; 6],
            pos: Vec3::zeros(),
            lin_mom: Vec3::zeros(),
            orient: quat_identity(),
            ang_mom: Vec3::zeros(),
            temp: 0.0,
            previous_dt: 0.0,
            p_strain: Vec3::zeros(),
            bool_states: SURFACE,
            ext: None,
            last_watch_position: Vec3::zeros(),
            col_watch: Vec::new(),
            nearby: Vec::new(),
        };
        voxel.pos = Vec3::new(
            ix as f64 * nominal_size,
            iy as f64 * nominal_size,
            iz as f64 * nominal_size,
        );
        voxel
    }

    /// Returns to the nominal pose with zero momentum. Externals persist.
    pub(crate) fn reset(&mut self, mat: &VoxelMaterial) {
        self.pos = self.original_position(mat);
        self.orient = quat_identity();
        self.halt_motion();
        self.set_floor_static_friction(true);
        self.temp = 0.0;
        self.previous_dt = 0.0;
        self.p_strain = Vec3::zeros();
    }

    pub fn index_x(&self) -> i32 {
        self.ix
    }

    pub fn index_y(&self) -> i32 {
        self.iy
    }

    pub fn index_z(&self) -> i32 {
        self.iz
    }

    pub fn index(&self) -> Index3D {
        Index3D::new(self.ix, self.iy, self.iz)
    }

    pub fn material(&self) -> VoxelMaterialId {
        self.mat
    }

    pub fn link(&self, direction: LinkDirection) -> Option<LinkId> {
        self.links[direction.index()]
    }

    pub fn link_count(&self) -> usize {
        self.links.iter().filter(|l| l.is_some()).count()
    }

    pub(crate) fn add_link_info(&mut self, direction: LinkDirection, link: LinkId) {
        self.links[direction.index()] = Some(link);
        self.update_surface();
    }

    pub(crate) fn remove_link_info(&mut self, direction: LinkDirection) {
        self.links[direction.index()] = None;
        self.update_surface();
    }

    fn update_surface(&mut self) {
        if self.links.iter().any(|l| l.is_none()) {
            self.bool_states |= SURFACE;
        } else {
            self.bool_states &= !SURFACE;
        }
    }

    /// True if at least one of the six faces is exposed.
    pub fn is_surface(&self) -> bool {
        self.bool_states & SURFACE != 0
    }

    /// True if all six faces connect to neighbours.
    pub fn is_interior(&self) -> bool {
        !self.is_surface()
    }

    pub fn external(&self) -> Option<&External> {
        self.ext.as_deref()
    }

    /// The external object for this voxel, allocated on first use.
    pub fn external_mut(&mut self) -> &mut External {
        self.ext.get_or_insert_with(Default::default)
    }

    pub fn external_exists(&self) -> bool {
        self.ext.is_some()
    }

    /// Swaps in a new material, scaling momenta to preserve velocity and
    /// angular velocity.
    pub(crate) fn replace_material(
        &mut self,
        old: &VoxelMaterial,
        new_id: VoxelMaterialId,
        new: &VoxelMaterial,
    ) {
        if old.mass() != 0.0 {
            self.lin_mom *= new.mass() / old.mass();
        }
        if old.moment_inertia() != 0.0 {
            self.ang_mom *= new.moment_inertia() / old.moment_inertia();
        }
        self.set_floor_static_friction(false);
        self.mat = new_id;
    }

    pub fn temperature(&self) -> f64 {
        self.temp
    }

    pub(crate) fn set_temperature(&mut self, temperature: f64) {
        self.temp = temperature;
    }

    pub fn position(&self) -> Vec3 {
        self.pos
    }

    pub fn orientation(&self) -> Quat {
        self.orient
    }

    pub fn original_position(&self, mat: &VoxelMaterial) -> Vec3 {
        let s = mat.nominal_size();
        Vec3::new(self.ix as f64 * s, self.iy as f64 * s, self.iz as f64 * s)
    }

    pub fn displacement(&self, mat: &VoxelMaterial) -> Vec3 {
        self.pos - self.original_position(mat)
    }

    pub fn velocity(&self, mat: &VoxelMaterial) -> Vec3 {
        self.lin_mom * mat.mass_inverse()
    }

    pub fn angular_velocity(&self, mat: &VoxelMaterial) -> Vec3 {
        self.ang_mom * mat.moment_inertia_inverse()
    }

    pub fn kinetic_energy(&self, mat: &VoxelMaterial) -> f64 {
        0.5 * (mat.mass_inverse() * self.lin_mom.norm_squared()
            + mat.moment_inertia_inverse() * self.ang_mom.norm_squared())
    }

    pub fn halt_motion(&mut self) {
        self.lin_mom = Vec3::zeros();
        self.ang_mom = Vec3::zeros();
    }

    /// Zero-stress size per axis at the current temperature.
    pub fn base_size(&self, mat: &VoxelMaterial) -> Vec3 {
        mat.size() * (1.0 + self.temp * mat.material.cte())
    }

    pub fn base_size_axis(&self, mat: &VoxelMaterial, axis: Axis) -> f64 {
        mat.size()[axis.index()] * (1.0 + self.temp * mat.material.cte())
    }

    pub fn base_size_average(&self, mat: &VoxelMaterial) -> f64 {
        let size = self.base_size(mat);
        (size.x + size.y + size.z) / 3.0
    }

    pub fn is_floor_enabled(&self) -> bool {
        self.bool_states & FLOOR_ENABLED != 0
    }

    pub(crate) fn enable_floor(&mut self, enabled: bool) {
        if enabled {
            self.bool_states |= FLOOR_ENABLED;
        } else {
            self.bool_states &= !FLOOR_ENABLED;
        }
    }

    pub fn is_floor_static_friction(&self) -> bool {
        self.bool_states & FLOOR_STATIC_FRICTION != 0
    }

    pub(crate) fn set_floor_static_friction(&mut self, active: bool) {
        if active {
            self.bool_states |= FLOOR_STATIC_FRICTION;
        } else {
            self.bool_states &= !FLOOR_STATIC_FRICTION;
        }
    }

    pub fn is_collisions_enabled(&self) -> bool {
        self.bool_states & COLLISIONS_ENABLED != 0
    }

    pub(crate) fn enable_collisions(&mut self, enabled: bool) {
        if enabled {
            self.bool_states |= COLLISIONS_ENABLED;
        } else {
            self.bool_states &= !COLLISIONS_ENABLED;
        }
    }

    /// Interference between the voxel's lower face and the floor at z = 0.
    /// Positive numbers mean penetration.
    pub fn floor_penetration(&self, mat: &VoxelMaterial) -> f64 {
        self.base_size_average(mat) / 2.0 - mat.nominal_size() / 2.0 - self.pos.z
    }

    /// Multiplier applied to the link damping roots: zeta * 2 sqrt(m) / dt.
    pub fn damping_multiplier(&self, mat: &VoxelMaterial) -> f64 {
        if self.previous_dt == 0.0 {
            return 0.0;
        }
        2.0 * mat.sqrt_mass() * mat.material.internal_damping() / self.previous_dt
    }

    /// Sum of all forces acting on this voxel in the global frame.
    pub(crate) fn force(
        &self,
        self_id: VoxelId,
        mat: &VoxelMaterial,
        links: &[Option<Link>],
        collisions: &[Collision],
    ) -> Vec3 {
        // forces from the beam links arrive in this voxel's local frame
        let mut total = Vec3::zeros();
        for (i, slot) in self.links.iter().enumerate() {
            if let Some(lid) = slot {
                if let Some(link) = links[lid.0].as_ref() {
                    total += link.force(LinkDirection::ALL[i].is_negative());
                }
            }
        }
        total = rotate_vec(&self.orient, &total);

        if let Some(ext) = &self.ext {
            total += ext.force();
        }
        total -= self.velocity(mat) * mat.global_damping_translate_c();
        total.z += mat.gravity_force();

        if self.is_collisions_enabled() {
            for cid in &self.col_watch {
                total -= collisions[cid.0].contact_force(self_id);
            }
        }

        total
    }

    /// Sum of all moments acting on this voxel in the global frame.
    pub(crate) fn moment(&self, mat: &VoxelMaterial, links: &[Option<Link>]) -> Vec3 {
        let mut total = Vec3::zeros();
        for (i, slot) in self.links.iter().enumerate() {
            if let Some(lid) = slot {
                if let Some(link) = links[lid.0].as_ref() {
                    total += link.moment(LinkDirection::ALL[i].is_negative());
                }
            }
        }
        total = rotate_vec(&self.orient, &total);

        if let Some(ext) = &self.ext {
            total += ext.moment();
        }
        total -= self.angular_velocity(mat) * mat.global_damping_rotate_c();
        total
    }

    /// Applied external force, or the reaction force for fixed translations.
    pub fn external_force(
        &self,
        self_id: VoxelId,
        mat: &VoxelMaterial,
        links: &[Option<Link>],
        collisions: &[Collision],
    ) -> Vec3 {
        let Some(ext) = &self.ext else {
            return Vec3::zeros();
        };
        let mut result = ext.force();
        if ext.is_fixed(X_TRANSLATE) || ext.is_fixed(Y_TRANSLATE) || ext.is_fixed(Z_TRANSLATE) {
            let reaction = -self.force(self_id, mat, links, collisions);
            if ext.is_fixed(X_TRANSLATE) {
                result.x = reaction.x;
            }
            if ext.is_fixed(Y_TRANSLATE) {
                result.y = reaction.y;
            }
            if ext.is_fixed(Z_TRANSLATE) {
                result.z = reaction.z;
            }
        }
        result
    }

    /// Applied external moment, or the reaction moment for fixed rotations.
    pub fn external_moment(&self, mat: &VoxelMaterial, links: &[Option<Link>]) -> Vec3 {
        let Some(ext) = &self.ext else {
            return Vec3::zeros();
        };
        let mut result = ext.moment();
        if ext.is_fixed(X_ROTATE) || ext.is_fixed(Y_ROTATE) || ext.is_fixed(Z_ROTATE) {
            let reaction = -self.moment(mat, links);
            if ext.is_fixed(X_ROTATE) {
                result.x = reaction.x;
            }
            if ext.is_fixed(Y_ROTATE) {
                result.y = reaction.y;
            }
            if ext.is_fixed(Z_ROTATE) {
                result.z = reaction.z;
            }
        }
        result
    }

    // Floor contact: spring-damper normal force plus static/kinetic friction.
    // Mutates the force so the momentum update below sees the contact terms.
    fn floor_force(&mut self, mat: &VoxelMaterial, total_force: &mut Vec3) {
        let penetration = self.floor_penetration(mat);
        if penetration >= 0.0 {
            let vel = self.velocity(mat);
            let horizontal_vel = Vec3::new(vel.x, vel.y, 0.0);
            let normal_force = mat.penetration_stiffness() * penetration;
            total_force.z += normal_force - mat.collision_damping_translate_c() * vel.z;

            if self.is_floor_static_friction() {
                let surface_force_sq =
                    total_force.x * total_force.x + total_force.y * total_force.y;
                let friction_force = mat.material.static_friction() * normal_force;
                if surface_force_sq > friction_force * friction_force {
                    // breaking static friction: leave the forces as computed
                    // to initiate motion this step
                    self.set_floor_static_friction(false);
                }
            } else if horizontal_vel.norm_squared() > 0.0 {
                *total_force -= mat.material.kinetic_friction()
                    * normal_force
                    * horizontal_vel.normalize();
            }
        } else {
            self.set_floor_static_friction(false);
        }
    }

    /// Advances this voxel's state by `dt` under all current forces.
    pub(crate) fn time_step(
        &mut self,
        dt: f64,
        self_id: VoxelId,
        mat: &VoxelMaterial,
        links: &[Option<Link>],
        collisions: &[Collision],
    ) {
        self.previous_dt = dt;
        if dt == 0.0 {
            return;
        }

        // a fully prescribed voxel just snaps to its target pose; note this
        // skips floor contact entirely, so no reaction force accumulates
        let prescribed_pose = self
            .ext
            .as_ref()
            .filter(|ext| ext.is_fixed_all())
            .map(|ext| (ext.translation(), ext.rotation_quat()));
        if let Some((translation, rotation)) = prescribed_pose {
            self.pos = self.original_position(mat) + translation;
            self.orient = rotation;
            self.halt_motion();
            return;
        }

        // translation
        let mut cur_force = self.force(self_id, mat, links, collisions);
        let force_before_floor = cur_force;
        if self.is_floor_enabled() {
            self.floor_force(mat, &mut cur_force);
        }
        let fric_force = cur_force - force_before_floor;

        self.lin_mom += cur_force * dt;
        let mut translate = self.lin_mom * (dt * mat.mass_inverse());

        if self.is_floor_enabled() && self.floor_penetration(mat) >= 0.0 {
            // work-energy check: if the friction work cancels the horizontal
            // kinetic energy, the voxel stops into static friction
            let work = fric_force.x * translate.x + fric_force.y * translate.y;
            let h_kinetic = 0.5
                * mat.mass_inverse()
                * (self.lin_mom.x * self.lin_mom.x + self.lin_mom.y * self.lin_mom.y);
            if h_kinetic + work <= 0.0 {
                self.set_floor_static_friction(true);
            }
            if self.is_floor_static_friction() {
                self.lin_mom.x = 0.0;
                self.lin_mom.y = 0.0;
                translate.x = 0.0;
                translate.y = 0.0;
            }
        } else {
            self.set_floor_static_friction(false);
        }

        self.pos += translate;

        // rotation
        let cur_moment = self.moment(mat, links);
        self.ang_mom += cur_moment * dt;
        self.orient = quat_from_rotation_vector(&(self.ang_mom * (dt * mat.moment_inertia_inverse())))
            * self.orient;

        // enforce prescribed degrees of freedom
        if let Some(ext) = &self.ext {
            let size = mat.nominal_size();
            if ext.is_fixed(X_TRANSLATE) {
                self.pos.x = self.ix as f64 * size + ext.translation().x;
                self.lin_mom.x = 0.0;
            }
            if ext.is_fixed(Y_TRANSLATE) {
                self.pos.y = self.iy as f64 * size + ext.translation().y;
                self.lin_mom.y = 0.0;
            }
            if ext.is_fixed(Z_TRANSLATE) {
                self.pos.z = self.iz as f64 * size + ext.translation().z;
                self.lin_mom.z = 0.0;
            }
            if ext.is_fixed_any_rotation() {
                if ext.is_fixed_all_rotation() {
                    self.orient = ext.rotation_quat();
                    self.ang_mom = Vec3::zeros();
                } else {
                    let mut rot = rotation_vector(&self.orient);
                    if ext.is_fixed(X_ROTATE) {
                        rot.x = 0.0;
                        self.ang_mom.x = 0.0;
                    }
                    if ext.is_fixed(Y_ROTATE) {
                        rot.y = 0.0;
                        self.ang_mom.y = 0.0;
                    }
                    if ext.is_fixed(Z_ROTATE) {
                        rot.z = 0.0;
                        self.ang_mom.z = 0.0;
                    }
                    self.orient = quat_from_rotation_vector(&rot);
                }
            }
        }
    }

    /// Per-axis strain of the voxel from its link strains. With
    /// `poissons_strain` the unloaded axes take the volumetric contraction
    /// `(1 + sum)^(-nu) - 1`.
    pub fn strain(
        &self,
        poissons_strain: bool,
        mat: &VoxelMaterial,
        links: &[Option<Link>],
    ) -> Vec3 {
        let mut result = Vec3::zeros();
        let mut bonds_per_axis = [0u8; 3];
        let mut tension = [false; 3];

        for (i, slot) in self.links.iter().enumerate() {
            if let Some(lid) = slot {
                if let Some(link) = links[lid.0].as_ref() {
                    let direction = LinkDirection::ALL[i];
                    let axis = direction.axis().index();
                    result[axis] += link.axial_strain_end(direction.is_negative());
                    bonds_per_axis[axis] += 1;
                }
            }
        }

        for axis in 0..3 {
            if bonds_per_axis[axis] == 2 {
                result[axis] *= 0.5;
            }
            if poissons_strain {
                // in tension if pulled from both sides, or from one side
                // while fixed or loaded on this axis
                let ext_active = self.ext.as_ref().is_some_and(|ext| {
                    ext.is_fixed(1 << axis) || ext.force()[axis] != 0.0
                });
                tension[axis] =
                    bonds_per_axis[axis] == 2 || (bonds_per_axis[axis] == 1 && ext_active);
            }
        }

        if poissons_strain && !(tension[0] && tension[1] && tension[2]) {
            let mut sum = 0.0;
            for axis in 0..3 {
                if tension[axis] {
                    sum += result[axis];
                }
            }
            let value = (1.0 + sum).powf(-mat.material.poissons_ratio()) - 1.0;
            for axis in 0..3 {
                if !tension[axis] {
                    result[axis] = value;
                }
            }
        }

        result
    }

    /// Recomputes and caches the Poisson strain. The lattice runs this for
    /// every voxel before the link-force phase of each time step.
    pub(crate) fn update_poissons_strain(&mut self, mat: &VoxelMaterial, links: &[Option<Link>]) {
        self.p_strain = if mat.material.poissons_ratio() == 0.0 {
            self.strain(false, mat, links)
        } else {
            self.strain(true, mat, links)
        };
    }

    /// Sum of the cached Poisson strains on the two axes transverse to
    /// `axis`.
    pub fn transverse_strain_sum(&self, mat: &VoxelMaterial, axis: Axis) -> f64 {
        if mat.material.poissons_ratio() == 0.0 {
            return 0.0;
        }
        match axis {
            Axis::X => self.p_strain.y + self.p_strain.z,
            Axis::Y => self.p_strain.x + self.p_strain.z,
            Axis::Z => self.p_strain.x + self.p_strain.y,
        }
    }

    /// Current cross-section area transverse to `axis`, deformed by the
    /// cached Poisson strain.
    pub fn transverse_area(&self, mat: &VoxelMaterial, axis: Axis) -> f64 {
        let size = mat.nominal_size();
        if mat.material.poissons_ratio() == 0.0 {
            return size * size;
        }
        let ps = self.p_strain;
        match axis {
            Axis::X => size * size * (1.0 + ps.y) * (1.0 + ps.z),
            Axis::Y => size * size * (1.0 + ps.x) * (1.0 + ps.z),
            Axis::Z => size * size * (1.0 + ps.x) * (1.0 + ps.y),
        }
    }

    /// Volumetric strain: the trace of the strain state.
    pub fn volumetric_strain(&self, mat: &VoxelMaterial, links: &[Option<Link>]) -> f64 {
        let s = self.strain(false, mat, links);
        s.x + s.y + s.z
    }

    /// Engineering internal pressure, Pa.
    pub fn pressure(&self, mat: &VoxelMaterial, links: &[Option<Link>]) -> f64 {
        -mat.material.youngs_modulus() * self.volumetric_strain(mat, links)
            / (3.0 * (1.0 - 2.0 * mat.material.poissons_ratio()))
    }

    /// True if any connected link has yielded.
    pub fn is_yielded(&self, links: &[Option<Link>], link_mats: &[LinkMaterial]) -> bool {
        self.links.iter().flatten().any(|lid| {
            links[lid.0]
                .as_ref()
                .is_some_and(|link| link.is_yielded(link_mats))
        })
    }

    /// True if any connected link has failed.
    pub fn is_failed(&self, links: &[Option<Link>], link_mats: &[LinkMaterial]) -> bool {
        self.links.iter().flatten().any(|lid| {
            links[lid.0]
                .as_ref()
                .is_some_and(|link| link.is_failed(link_mats))
        })
    }

    /// Deformed offset of a corner in the local frame.
    pub fn corner_offset(
        &self,
        corner: VoxelCorner,
        mat: &VoxelMaterial,
        links: &[Option<Link>],
        link_mats: &[LinkMaterial],
    ) -> Vec3 {
        let mut strains = Vec3::zeros();
        for axis in 0..3 {
            let positive = corner.bits() & (1 << (2 - axis)) != 0;
            let direction = LinkDirection::ALL[2 * axis + if positive { 0 } else { 1 }];
            let link = self.links[direction.index()]
                .and_then(|lid| links[lid.0].as_ref())
                .filter(|link| !link.is_failed(link_mats));
            strains[axis] = match link {
                Some(link) => {
                    (1.0 + link.axial_strain_end(positive)) * if positive { 1.0 } else { -1.0 }
                }
                None => {
                    if positive {
                        1.0
                    } else {
                        -1.0
                    }
                }
            };
        }
        (0.5 * self.base_size(mat)).component_mul(&strains)
    }

    /// Deformed position of a corner in the global frame.
    pub fn corner_position(
        &self,
        corner: VoxelCorner,
        mat: &VoxelMaterial,
        links: &[Option<Link>],
        link_mats: &[LinkMaterial],
    ) -> Vec3 {
        self.pos + rotate_vec(&self.orient, &self.corner_offset(corner, mat, links, link_mats))
    }
}
