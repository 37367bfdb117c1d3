//! The voxel lattice: ownership, plumbing and the time step
//!
//! [`Lattice`] owns every voxel, link, collision and material. Voxels and
//! links live in arena vectors addressed by stable integer handles, with
//! sparse 3D grids mapping lattice coordinates to handles (one grid for
//! voxels, one per axis for links).
//!
//! A time step runs three strictly sequenced bulk passes: link force update,
//! collision force update, voxel integration. Each pass writes only to its
//! own elements, so the passes parallelize with rayon without locks.

use crate::array3d::{Array3D, Index3D};
use crate::collision::{Collision, CollisionId};
use crate::error::{IbexError, Result};
use crate::external::External;
use crate::link::{Link, LinkId};
use crate::materials::{
    LinkMaterial, LinkMaterialId, Material, MaterialConfig, VoxelMaterial, VoxelMaterialId,
};
use crate::math::{quat_angle, Vec3};
use crate::solver::LinearSolver;
use crate::voxel::{LinkDirection, Voxel, VoxelCorner, VoxelId};
use log::{debug, warn};
use rayon::prelude::*;

/// Default nominal voxel edge length: 1 mm.
pub const DEFAULT_VOXEL_SIZE: f64 = 0.001;

// any link strained beyond this aborts the step as diverged
const MAX_ALLOWED_STRAIN: f64 = 100.0;

/// Per-voxel or per-link quantity for lattice-wide reductions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateInfo {
    StrainEnergy,
    EngineeringStress,
    EngineeringStrain,
    Displacement,
    Velocity,
    KineticEnergy,
    AngularDisplacement,
    AngularVelocity,
    Pressure,
    Mass,
}

/// Reduction applied by [`Lattice::state_info`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    Min,
    Max,
    Total,
    Average,
}

pub(crate) fn vmat<'a>(
    mats: &'a [Option<VoxelMaterial>],
    id: VoxelMaterialId,
) -> &'a VoxelMaterial {
    mats[id.0].as_ref().expect("voxel material was removed")
}

pub(crate) fn vox<'a>(voxels: &'a [Option<Voxel>], id: VoxelId) -> &'a Voxel {
    voxels[id.0].as_ref().expect("voxel was removed")
}

/// Defines and simulates a configuration of voxels.
#[derive(Debug)]
pub struct Lattice {
    vox_size: f64,
    current_time: f64,
    ambient_temp: f64,
    grav: f64,
    floor_enabled: bool,
    collisions_enabled: bool,

    // in voxel units: radius to collide a voxel at, and the extra distance
    // between envelopes to watch for collisions from
    bounding_radius: f64,
    watch_distance: f64,

    voxel_mats: Vec<Option<VoxelMaterial>>,
    link_mats: Vec<LinkMaterial>,

    voxels: Vec<Option<Voxel>>,
    free_voxels: Vec<usize>,
    links: Vec<Option<Link>>,
    free_links: Vec<usize>,

    voxel_grid: Array3D<Option<VoxelId>>,
    link_grids: [Array3D<Option<LinkId>>; 3],

    collisions: Vec<Collision>,
    collisions_stale: bool,
    nearby_stale: bool,
}

impl Lattice {
    /// Creates an empty lattice with the given nominal voxel edge length in
    /// meters.
    pub fn new(voxel_size: f64) -> Self {
        Self {
            vox_size: if voxel_size <= 0.0 {
                DEFAULT_VOXEL_SIZE
            } else {
                voxel_size
            },
            current_time: 0.0,
            ambient_temp: 0.0,
            grav: 0.0,
            floor_enabled: false,
            collisions_enabled: false,
            bounding_radius: 0.75,
            watch_distance: 1.0,
            voxel_mats: Vec::new(),
            link_mats: Vec::new(),
            voxels: Vec::new(),
            free_voxels: Vec::new(),
            links: Vec::new(),
            free_links: Vec::new(),
            voxel_grid: Array3D::new(None),
            link_grids: [Array3D::new(None), Array3D::new(None), Array3D::new(None)],
            collisions: Vec::new(),
            collisions_stale: true,
            nearby_stale: true,
        }
    }

    /// Deallocates everything, returning to an empty lattice with the same
    /// voxel size.
    pub fn clear(&mut self) {
        self.voxel_mats.clear();
        self.link_mats.clear();
        self.voxels.clear();
        self.free_voxels.clear();
        self.links.clear();
        self.free_links.clear();
        self.voxel_grid.clear();
        for grid in &mut self.link_grids {
            grid.clear();
        }
        self.collisions.clear();
        self.current_time = 0.0;
        self.ambient_temp = 0.0;
        self.grav = 0.0;
        self.floor_enabled = false;
        self.collisions_enabled = false;
        self.collisions_stale = true;
        self.nearby_stale = true;
        self.bounding_radius = 0.75;
        self.watch_distance = 1.0;
    }

    // ----- materials -----

    /// Adds a linear elastic material with the given Young's modulus (Pa)
    /// and density (kg/m^3).
    pub fn add_material(&mut self, youngs_modulus: f64, density: f64) -> Result<VoxelMaterialId> {
        let material = Material::new(youngs_modulus, density)?;
        Ok(self.add_material_object(material))
    }

    /// Adds a material from a configuration document.
    pub fn add_material_config(&mut self, config: &MaterialConfig) -> Result<VoxelMaterialId> {
        let material = Material::from_config(config)?;
        Ok(self.add_material_object(material))
    }

    /// Adds an already-built material.
    pub fn add_material_object(&mut self, material: Material) -> VoxelMaterialId {
        let mut voxel_mat = VoxelMaterial::new(material, self.vox_size);
        voxel_mat.set_gravity_multiplier(self.grav);
        let id = VoxelMaterialId(self.voxel_mats.len());
        self.voxel_mats.push(Some(voxel_mat));
        id
    }

    pub fn material(&self, id: VoxelMaterialId) -> Option<&Material> {
        self.voxel_mats
            .get(id.0)
            .and_then(|m| m.as_ref())
            .map(|m| &m.material)
    }

    pub fn voxel_material(&self, id: VoxelMaterialId) -> Option<&VoxelMaterial> {
        self.voxel_mats.get(id.0).and_then(|m| m.as_ref())
    }

    pub fn link_material(&self, id: LinkMaterialId) -> Option<&LinkMaterial> {
        self.link_mats.get(id.0)
    }

    pub fn material_count(&self) -> usize {
        self.voxel_mats.iter().flatten().count()
    }

    /// Live materials with their handles.
    pub fn materials(&self) -> impl Iterator<Item = (VoxelMaterialId, &VoxelMaterial)> {
        self.voxel_mats
            .iter()
            .enumerate()
            .filter_map(|(i, m)| m.as_ref().map(|m| (VoxelMaterialId(i), m)))
    }

    /// Mutates a material's physical properties and refreshes everything
    /// derived from it, including the combined materials of any links built
    /// from it.
    pub fn modify_material(
        &mut self,
        id: VoxelMaterialId,
        f: impl FnOnce(&mut Material),
    ) -> Result<()> {
        let mat = self
            .voxel_mats
            .get_mut(id.0)
            .and_then(|m| m.as_mut())
            .ok_or(IbexError::UnknownMaterial)?;
        f(&mut mat.material);
        mat.update_derived();
        self.recombine_link_materials(id)
    }

    // rebuild every combined material that depends on the changed one
    fn recombine_link_materials(&mut self, changed: VoxelMaterialId) -> Result<()> {
        for i in 0..self.link_mats.len() {
            let (id1, id2) = self.link_mats[i].constituents();
            if id1 != changed && id2 != changed {
                continue;
            }
            let (Some(m1), Some(m2)) = (self.voxel_material(id1), self.voxel_material(id2)) else {
                continue;
            };
            self.link_mats[i] = LinkMaterial::combine(id1, m1, id2, m2)?;
        }
        Ok(())
    }

    /// Removes a material and every voxel using it.
    pub fn remove_material(&mut self, id: VoxelMaterialId) -> Result<()> {
        if self.voxel_material(id).is_none() {
            return Err(IbexError::UnknownMaterial);
        }
        let doomed: Vec<Index3D> = self
            .voxels
            .iter()
            .flatten()
            .filter(|v| v.material() == id)
            .map(|v| v.index())
            .collect();
        for index in doomed {
            self.remove_voxel(index.x, index.y, index.z);
        }
        self.voxel_mats[id.0] = None;
        Ok(())
    }

    /// Replaces every voxel of one material with another.
    pub fn replace_material(
        &mut self,
        replace_me: VoxelMaterialId,
        replace_with: VoxelMaterialId,
    ) -> Result<()> {
        if self.voxel_material(replace_me).is_none() || self.voxel_material(replace_with).is_none()
        {
            return Err(IbexError::UnknownMaterial);
        }
        let targets: Vec<Index3D> = self
            .voxels
            .iter()
            .flatten()
            .filter(|v| v.material() == replace_me)
            .map(|v| v.index())
            .collect();
        for index in targets {
            self.set_voxel(replace_with, index.x, index.y, index.z)?;
        }
        Ok(())
    }

    // find or build the combined material for a voxel material pair
    fn combined_material(
        &mut self,
        mat1: VoxelMaterialId,
        mat2: VoxelMaterialId,
    ) -> Result<LinkMaterialId> {
        for (i, lm) in self.link_mats.iter().enumerate() {
            if lm.is_combination_of(mat1, mat2) {
                return Ok(LinkMaterialId(i));
            }
        }
        let m1 = self.voxel_material(mat1).ok_or(IbexError::UnknownMaterial)?;
        let m2 = self.voxel_material(mat2).ok_or(IbexError::UnknownMaterial)?;
        let combined = LinkMaterial::combine(mat1, m1, mat2, m2)?;
        let id = LinkMaterialId(self.link_mats.len());
        self.link_mats.push(combined);
        Ok(id)
    }

    // ----- voxels and links -----

    /// Creates a voxel at (x, y, z), or replaces the material of the voxel
    /// already there.
    pub fn set_voxel(&mut self, material: VoxelMaterialId, x: i32, y: i32, z: i32) -> Result<VoxelId> {
        if self.voxel_material(material).is_none() {
            return Err(IbexError::UnknownMaterial);
        }

        if let Some(vid) = self.voxel_at(x, y, z) {
            // replace in place: preserves pose, scales momenta to keep the
            // velocities, and rebuilds the surrounding links
            self.collisions_stale = true;
            let old_id = vox(&self.voxels, vid).material();
            if old_id != material {
                let mats = &self.voxel_mats;
                let old = vmat(mats, old_id);
                let new = vmat(mats, material);
                if let Some(voxel) = self.voxels[vid.0].as_mut() {
                    voxel.replace_material(old, material, new);
                }
            }
            for direction in LinkDirection::ALL {
                self.remove_link(x, y, z, direction);
            }
            for direction in LinkDirection::ALL {
                self.add_link(x, y, z, direction)?;
            }
            Ok(vid)
        } else {
            self.add_voxel(material, x, y, z)
        }
    }

    fn add_voxel(&mut self, material: VoxelMaterialId, x: i32, y: i32, z: i32) -> Result<VoxelId> {
        self.nearby_stale = true;
        self.collisions_stale = true;

        let mut voxel = Voxel::new(material, x, y, z, self.vox_size);
        voxel.set_temperature(self.ambient_temp);
        voxel.enable_floor(self.floor_enabled);
        voxel.enable_collisions(self.collisions_enabled);

        let id = match self.free_voxels.pop() {
            Some(slot) => {
                self.voxels[slot] = Some(voxel);
                VoxelId(slot)
            }
            None => {
                self.voxels.push(Some(voxel));
                VoxelId(self.voxels.len() - 1)
            }
        };

        if !self.voxel_grid.set(Index3D::new(x, y, z), Some(id)) {
            self.voxels[id.0] = None;
            self.free_voxels.push(id.0);
            return Err(IbexError::AllocationFailure);
        }

        for direction in LinkDirection::ALL {
            self.add_link(x, y, z, direction)?;
        }
        Ok(id)
    }

    /// Removes the voxel at (x, y, z) and all links to it.
    pub fn remove_voxel(&mut self, x: i32, y: i32, z: i32) {
        let Some(vid) = self.voxel_at(x, y, z) else {
            return;
        };
        self.nearby_stale = true;
        self.collisions_stale = true;

        for direction in LinkDirection::ALL {
            self.remove_link(x, y, z, direction);
        }
        self.voxel_grid.remove(Index3D::new(x, y, z));
        self.voxels[vid.0] = None;
        self.free_voxels.push(vid.0);
    }

    pub fn voxel_at(&self, x: i32, y: i32, z: i32) -> Option<VoxelId> {
        *self.voxel_grid.get(x, y, z)
    }

    pub fn voxel(&self, id: VoxelId) -> Option<&Voxel> {
        self.voxels.get(id.0).and_then(|v| v.as_ref())
    }

    pub fn voxel_count(&self) -> usize {
        self.voxels.iter().flatten().count()
    }

    /// Live voxels with their handles.
    pub fn voxels(&self) -> impl Iterator<Item = (VoxelId, &Voxel)> {
        self.voxels
            .iter()
            .enumerate()
            .filter_map(|(i, v)| v.as_ref().map(|v| (VoxelId(i), v)))
    }

    /// Lazily allocates and returns the external of the given voxel.
    pub fn external(&mut self, id: VoxelId) -> Option<&mut External> {
        self.voxels
            .get_mut(id.0)
            .and_then(|v| v.as_mut())
            .map(|v| v.external_mut())
    }

    pub fn index_min(&self) -> Index3D {
        self.voxel_grid.min_indices()
    }

    pub fn index_max(&self) -> Index3D {
        self.voxel_grid.max_indices()
    }

    // The link grid for an axis is indexed by the negative-end voxel
    // coordinate.
    fn link_grid_index(x: i32, y: i32, z: i32, direction: LinkDirection) -> Index3D {
        if direction.is_negative() {
            Index3D::new(x, y, z) + direction.neighbour_offset()
        } else {
            Index3D::new(x, y, z)
        }
    }

    /// The link leaving voxel (x, y, z) in `direction`, if present.
    pub fn link_at(&self, x: i32, y: i32, z: i32, direction: LinkDirection) -> Option<LinkId> {
        *self.link_grids[direction.axis().index()]
            .at(Self::link_grid_index(x, y, z, direction))
    }

    pub fn link(&self, id: LinkId) -> Option<&Link> {
        self.links.get(id.0).and_then(|l| l.as_ref())
    }

    pub fn link_count(&self) -> usize {
        self.links.iter().flatten().count()
    }

    /// Live links with their handles.
    pub fn links(&self) -> impl Iterator<Item = (LinkId, &Link)> {
        self.links
            .iter()
            .enumerate()
            .filter_map(|(i, l)| l.as_ref().map(|l| (LinkId(i), l)))
    }

    fn add_link(&mut self, x: i32, y: i32, z: i32, direction: LinkDirection) -> Result<Option<LinkId>> {
        if let Some(existing) = self.link_at(x, y, z, direction) {
            return Ok(Some(existing));
        }

        let v1 = self.voxel_at(x, y, z);
        let offset = direction.neighbour_offset();
        let v2 = self.voxel_at(x + offset.x, y + offset.y, z + offset.z);
        let (Some(v1), Some(v2)) = (v1, v2) else {
            return Ok(None);
        };

        let mat1 = vox(&self.voxels, v1).material();
        let mat2 = vox(&self.voxels, v2).material();
        let lmat = self.combined_material(mat1, mat2)?;

        // the negative end is the voxel with the smaller index on the axis
        let (v_neg, v_pos) = if direction.is_negative() {
            (v2, v1)
        } else {
            (v1, v2)
        };
        let link = Link::new(v_neg, v_pos, direction.axis(), lmat);

        let id = match self.free_links.pop() {
            Some(slot) => {
                self.links[slot] = Some(link);
                LinkId(slot)
            }
            None => {
                self.links.push(Some(link));
                LinkId(self.links.len() - 1)
            }
        };
        self.reset_link_state(id);

        if !self.link_grids[direction.axis().index()]
            .set(Self::link_grid_index(x, y, z, direction), Some(id))
        {
            self.links[id.0] = None;
            self.free_links.push(id.0);
            return Err(IbexError::AllocationFailure);
        }

        if let Some(voxel) = self.voxels[v1.0].as_mut() {
            voxel.add_link_info(direction, id);
        }
        if let Some(voxel) = self.voxels[v2.0].as_mut() {
            voxel.add_link_info(direction.opposite(), id);
        }
        Ok(Some(id))
    }

    fn remove_link(&mut self, x: i32, y: i32, z: i32, direction: LinkDirection) {
        let Some(lid) = self.link_at(x, y, z, direction) else {
            return;
        };

        self.link_grids[direction.axis().index()]
            .remove(Self::link_grid_index(x, y, z, direction));

        if let Some(vid) = self.voxel_at(x, y, z) {
            if let Some(voxel) = self.voxels[vid.0].as_mut() {
                voxel.remove_link_info(direction);
            }
        }
        let offset = direction.neighbour_offset();
        if let Some(vid) = self.voxel_at(x + offset.x, y + offset.y, z + offset.z) {
            if let Some(voxel) = self.voxels[vid.0].as_mut() {
                voxel.remove_link_info(direction.opposite());
            }
        }

        self.links[lid.0] = None;
        self.free_links.push(lid.0);
    }

    fn reset_link_state(&mut self, lid: LinkId) {
        let Some((v_neg_id, v_pos_id)) = self.links[lid.0]
            .as_ref()
            .map(|l| (l.voxel(false), l.voxel(true)))
        else {
            return;
        };
        let voxels = &self.voxels;
        let mats = &self.voxel_mats;
        let v_neg = vox(voxels, v_neg_id);
        let v_pos = vox(voxels, v_pos_id);
        let mat_neg = vmat(mats, v_neg.material());
        let mat_pos = vmat(mats, v_pos.material());
        if let Some(link) = self.links[lid.0].as_mut() {
            link.reset(v_neg, v_pos, mat_neg, mat_pos);
        }
    }

    pub fn adjacent_voxel(&self, id: VoxelId, direction: LinkDirection) -> Option<VoxelId> {
        let voxel = self.voxel(id)?;
        let link = self.link(voxel.link(direction)?)?;
        Some(if link.voxel(true) == id {
            link.voxel(false)
        } else {
            link.voxel(true)
        })
    }

    // ----- environment -----

    pub fn voxel_size(&self) -> f64 {
        self.vox_size
    }

    /// Rescales the lattice to a new voxel size, halting all motion.
    pub fn set_voxel_size(&mut self, voxel_size: f64) {
        let scale = voxel_size / self.vox_size;
        self.vox_size = voxel_size;

        for mat in self.voxel_mats.iter_mut().flatten() {
            mat.set_nominal_size(voxel_size);
        }
        for voxel in self.voxels.iter_mut().flatten() {
            voxel.pos *= scale;
            voxel.halt_motion();
            voxel.set_floor_static_friction(false);
        }
        for i in 0..self.links.len() {
            if self.links[i].is_some() {
                self.reset_link_state(LinkId(i));
            }
        }
        self.collisions_stale = true;
    }

    pub fn ambient_temperature(&self) -> f64 {
        self.ambient_temp
    }

    /// Sets the ambient temperature (relative to the zero-expansion
    /// reference), optionally applying it to every voxel immediately.
    pub fn set_ambient_temperature(&mut self, temperature: f64, all_voxels: bool) {
        self.ambient_temp = temperature;
        if !all_voxels {
            return;
        }
        for voxel in self.voxels.iter_mut().flatten() {
            voxel.set_temperature(temperature);
        }
        for i in 0..self.links.len() {
            let Some((v_neg_id, v_pos_id)) = self.links[i]
                .as_ref()
                .map(|l| (l.voxel(false), l.voxel(true)))
            else {
                continue;
            };
            let voxels = &self.voxels;
            let mats = &self.voxel_mats;
            let v_neg = vox(voxels, v_neg_id);
            let v_pos = vox(voxels, v_pos_id);
            let mat_neg = vmat(mats, v_neg.material());
            let mat_pos = vmat(mats, v_pos.material());
            if let Some(link) = self.links[i].as_mut() {
                link.update_rest_length(v_neg, v_pos, mat_neg, mat_pos);
            }
        }
    }

    pub fn gravity(&self) -> f64 {
        self.grav
    }

    /// Sets gravity as a multiple of earth gravity (1.0 = 9.80665 m/s^2
    /// downward).
    pub fn set_gravity(&mut self, g: f64) {
        self.grav = g;
        for mat in self.voxel_mats.iter_mut().flatten() {
            mat.set_gravity_multiplier(g);
        }
    }

    pub fn is_floor_enabled(&self) -> bool {
        self.floor_enabled
    }

    /// Enables a collision floor at z = 0.
    pub fn enable_floor(&mut self, enabled: bool) {
        self.floor_enabled = enabled;
        for voxel in self.voxels.iter_mut().flatten() {
            voxel.enable_floor(enabled);
        }
    }

    pub fn is_collisions_enabled(&self) -> bool {
        self.collisions_enabled
    }

    /// Enables voxel-voxel collision detection and response.
    pub fn enable_collisions(&mut self, enabled: bool) {
        if self.collisions_enabled == enabled {
            return;
        }
        self.collisions_enabled = enabled;
        for voxel in self.voxels.iter_mut().flatten() {
            voxel.enable_collisions(enabled);
        }
        if !enabled {
            self.clear_collisions();
        }
        self.collisions_stale = true;
    }

    pub fn current_time(&self) -> f64 {
        self.current_time
    }

    // ----- stepping -----

    /// The largest stable explicit time step: one radian of the highest
    /// axial natural frequency anywhere in the lattice.
    pub fn recommended_time_step(&self) -> f64 {
        let mut max_freq2: f64 = 0.0;

        for (_, link) in self.links() {
            let lmat = &self.link_mats[link.material().0];
            let m_neg = vmat(&self.voxel_mats, vox(&self.voxels, link.voxel(false)).material());
            let m_pos = vmat(&self.voxel_mats, vox(&self.voxels, link.voxel(true)).material());
            let freq2 = link.axial_stiffness(lmat) / m_neg.mass().min(m_pos.mass());
            if freq2 > max_freq2 {
                max_freq2 = freq2;
            }
        }

        if max_freq2 <= 0.0 {
            // no links: fall back to the axial stiffness of a lone voxel
            for (_, voxel) in self.voxels() {
                let mat = vmat(&self.voxel_mats, voxel.material());
                let freq2 =
                    mat.material.youngs_modulus() * mat.nominal_size() / mat.mass();
                if freq2 > max_freq2 {
                    max_freq2 = freq2;
                }
            }
        }

        if max_freq2 <= 0.0 {
            0.0
        } else {
            1.0 / (2.0 * std::f64::consts::PI * max_freq2.sqrt())
        }
    }

    /// Advances the simulation by `dt` seconds. Any `dt` below zero uses
    /// [`Lattice::recommended_time_step`]. Fails without advancing when a
    /// link strain indicates divergence.
    pub fn do_time_step(&mut self, dt: f64) -> Result<()> {
        if dt == 0.0 {
            return Ok(());
        }
        let dt = if dt < 0.0 {
            self.recommended_time_step()
        } else {
            dt
        };
        if dt == 0.0 {
            return Ok(());
        }

        // refresh the per-voxel Poisson strain caches the links read below
        self.update_poissons_strains();

        // phase 1: link forces (disjoint writes, one link each)
        {
            let voxels = &self.voxels;
            let voxel_mats = &self.voxel_mats;
            let link_mats = &self.link_mats;
            self.links.par_iter_mut().for_each(|slot| {
                if let Some(link) = slot.as_mut() {
                    let v_neg = vox(voxels, link.voxel(false));
                    let v_pos = vox(voxels, link.voxel(true));
                    let mat_neg = vmat(voxel_mats, v_neg.material());
                    let mat_pos = vmat(voxel_mats, v_pos.material());
                    link.update_forces(
                        v_neg,
                        v_pos,
                        mat_neg,
                        mat_pos,
                        &link_mats[link.material().0],
                    );
                }
            });
        }

        let diverged = self
            .links
            .par_iter()
            .filter_map(|slot| slot.as_ref())
            .any(|link| link.axial_strain() > MAX_ALLOWED_STRAIN);
        if diverged {
            warn!("time step aborted: link strain exceeded {}", MAX_ALLOWED_STRAIN);
            return Err(IbexError::Diverged(MAX_ALLOWED_STRAIN));
        }

        // phase 2: collision forces
        if self.collisions_enabled {
            self.update_collisions();
        }

        // phase 3: voxel integration
        {
            let links = &self.links;
            let voxel_mats = &self.voxel_mats;
            let collisions = &self.collisions;
            self.voxels
                .par_iter_mut()
                .enumerate()
                .for_each(|(i, slot)| {
                    if let Some(voxel) = slot.as_mut() {
                        let mat = vmat(voxel_mats, voxel.material());
                        voxel.time_step(dt, VoxelId(i), mat, links, collisions);
                    }
                });
        }

        self.current_time += dt;
        Ok(())
    }

    fn update_poissons_strains(&mut self) {
        let links = &self.links;
        let voxel_mats = &self.voxel_mats;
        self.voxels.par_iter_mut().for_each(|slot| {
            if let Some(voxel) = slot.as_mut() {
                let mat = vmat(voxel_mats, voxel.material());
                voxel.update_poissons_strain(mat, links);
            }
        });
    }

    /// Returns every voxel to its nominal pose and every link to its
    /// unstressed state. Externals persist.
    pub fn reset_time(&mut self) {
        self.current_time = 0.0;
        self.collisions_stale = true;
        self.nearby_stale = true;

        for slot in self.voxels.iter_mut() {
            if let Some(voxel) = slot.as_mut() {
                let mat = self.voxel_mats[voxel.material().0]
                    .as_ref()
                    .expect("voxel material was removed");
                voxel.reset(mat);
            }
        }
        for i in 0..self.links.len() {
            if self.links[i].is_some() {
                self.reset_link_state(LinkId(i));
            }
        }
    }

    /// Linearizes about the current state and solves for static equilibrium,
    /// writing the result into the voxel poses.
    pub fn do_linear_solve(&mut self) -> Result<()> {
        let mut solver = LinearSolver::new();
        solver.solve(self)
    }

    // ----- collisions -----

    fn clear_collisions(&mut self) {
        self.collisions.clear();
        for voxel in self.voxels.iter_mut().flatten() {
            voxel.col_watch.clear();
        }
    }

    fn update_collisions(&mut self) {
        let watch_radius_vx = 2.0 * self.bounding_radius + self.watch_distance;
        let watch_radius_m = self.vox_size * watch_radius_vx;
        // half the slack distance, accounting for the voxel's own radius
        let recalc_dist = self.vox_size * self.watch_distance / 2.0;

        if self.nearby_stale {
            self.regenerate_nearby((2.0 * (1.0 + self.watch_distance)).round() as usize);
            self.nearby_stale = false;
            self.collisions_stale = true;
        }

        if !self.collisions_stale {
            let stale = self
                .voxels
                .par_iter()
                .filter_map(|slot| slot.as_ref())
                .any(|voxel| {
                    voxel.is_surface()
                        && (voxel.pos - voxel.last_watch_position).norm_squared()
                            > recalc_dist * recalc_dist
                });
            if stale {
                self.collisions_stale = true;
            }
        }

        if self.collisions_stale {
            self.regenerate_collisions(watch_radius_m * watch_radius_m);
        }

        let voxels = &self.voxels;
        let voxel_mats = &self.voxel_mats;
        self.collisions.par_iter_mut().for_each(|collision| {
            let v1 = vox(voxels, collision.voxel1());
            let v2 = vox(voxels, collision.voxel2());
            collision.update_contact_force(
                v1,
                vmat(voxel_mats, v1.material()),
                v2,
                vmat(voxel_mats, v2.material()),
            );
        });
    }

    // rebuild every voxel's set of lattice-connected surface voxels within
    // `link_depth` hops; such pairs never collide
    fn regenerate_nearby(&mut self, link_depth: usize) {
        let mut all_nearby: Vec<(usize, Vec<VoxelId>)> = Vec::new();
        for (vid, _) in self.voxels() {
            let mut reached = vec![vid];
            let mut current = 0;
            for _ in 0..link_depth {
                let pass_end = reached.len();
                while current != pass_end {
                    let at = reached[current];
                    current += 1;
                    for direction in LinkDirection::ALL {
                        if let Some(next) = self.adjacent_voxel(at, direction) {
                            if !reached.contains(&next) {
                                reached.push(next);
                            }
                        }
                    }
                }
            }
            let nearby: Vec<VoxelId> = reached
                .into_iter()
                .filter(|&other| other != vid && vox(&self.voxels, other).is_surface())
                .collect();
            all_nearby.push((vid.0, nearby));
        }
        for (slot, nearby) in all_nearby {
            if let Some(voxel) = self.voxels[slot].as_mut() {
                voxel.nearby = nearby;
            }
        }
    }

    fn regenerate_collisions(&mut self, thresh_radius_sq: f64) {
        self.clear_collisions();

        let surface: Vec<usize> = self
            .voxels
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| {
                slot.as_ref()
                    .filter(|voxel| voxel.is_surface())
                    .map(|_| i)
            })
            .collect();

        // remember where collisions were last computed
        for &i in &surface {
            if let Some(voxel) = self.voxels[i].as_mut() {
                voxel.last_watch_position = voxel.pos;
            }
        }

        let mut pairs: Vec<(usize, usize)> = Vec::new();
        for (n, &i) in surface.iter().enumerate() {
            let v1 = vox(&self.voxels, VoxelId(i));
            for &j in &surface[n + 1..] {
                let v2 = vox(&self.voxels, VoxelId(j));
                if (v1.pos - v2.pos).norm_squared() > thresh_radius_sq {
                    continue;
                }
                if v1.nearby.contains(&VoxelId(j)) {
                    continue;
                }
                pairs.push((i, j));
            }
        }

        for (i, j) in pairs {
            let mats = &self.voxel_mats;
            let mat1 = vmat(mats, vox(&self.voxels, VoxelId(i)).material());
            let mat2 = vmat(mats, vox(&self.voxels, VoxelId(j)).material());
            let collision = Collision::new(VoxelId(i), mat1, VoxelId(j), mat2);
            let cid = CollisionId(self.collisions.len());
            self.collisions.push(collision);
            if let Some(voxel) = self.voxels[i].as_mut() {
                voxel.col_watch.push(cid);
            }
            if let Some(voxel) = self.voxels[j].as_mut() {
                voxel.col_watch.push(cid);
            }
        }

        debug!("regenerated collision list: {} pairs", self.collisions.len());
        self.collisions_stale = false;
    }

    pub fn collision_count(&self) -> usize {
        self.collisions.len()
    }

    // ----- queries -----

    pub fn voxel_displacement(&self, id: VoxelId) -> Option<Vec3> {
        let voxel = self.voxel(id)?;
        Some(voxel.displacement(vmat(&self.voxel_mats, voxel.material())))
    }

    pub fn voxel_velocity(&self, id: VoxelId) -> Option<Vec3> {
        let voxel = self.voxel(id)?;
        Some(voxel.velocity(vmat(&self.voxel_mats, voxel.material())))
    }

    pub fn voxel_angular_velocity(&self, id: VoxelId) -> Option<Vec3> {
        let voxel = self.voxel(id)?;
        Some(voxel.angular_velocity(vmat(&self.voxel_mats, voxel.material())))
    }

    pub fn voxel_kinetic_energy(&self, id: VoxelId) -> Option<f64> {
        let voxel = self.voxel(id)?;
        Some(voxel.kinetic_energy(vmat(&self.voxel_mats, voxel.material())))
    }

    pub fn voxel_pressure(&self, id: VoxelId) -> Option<f64> {
        let voxel = self.voxel(id)?;
        Some(voxel.pressure(vmat(&self.voxel_mats, voxel.material()), &self.links))
    }

    pub fn voxel_volumetric_strain(&self, id: VoxelId) -> Option<f64> {
        let voxel = self.voxel(id)?;
        Some(voxel.volumetric_strain(vmat(&self.voxel_mats, voxel.material()), &self.links))
    }

    /// Per-axis strain of a voxel, optionally with Poisson contraction on
    /// the unloaded axes.
    pub fn voxel_strain(&self, id: VoxelId, poissons: bool) -> Option<Vec3> {
        let voxel = self.voxel(id)?;
        Some(voxel.strain(poissons, vmat(&self.voxel_mats, voxel.material()), &self.links))
    }

    /// Applied external force, or the reaction force for fixed translations.
    pub fn voxel_external_force(&self, id: VoxelId) -> Option<Vec3> {
        let voxel = self.voxel(id)?;
        Some(voxel.external_force(
            id,
            vmat(&self.voxel_mats, voxel.material()),
            &self.links,
            &self.collisions,
        ))
    }

    /// Applied external moment, or the reaction moment for fixed rotations.
    pub fn voxel_external_moment(&self, id: VoxelId) -> Option<Vec3> {
        let voxel = self.voxel(id)?;
        Some(voxel.external_moment(vmat(&self.voxel_mats, voxel.material()), &self.links))
    }

    pub fn voxel_corner_position(&self, id: VoxelId, corner: VoxelCorner) -> Option<Vec3> {
        let voxel = self.voxel(id)?;
        Some(voxel.corner_position(
            corner,
            vmat(&self.voxel_mats, voxel.material()),
            &self.links,
            &self.link_mats,
        ))
    }

    pub fn is_voxel_yielded(&self, id: VoxelId) -> Option<bool> {
        Some(self.voxel(id)?.is_yielded(&self.links, &self.link_mats))
    }

    pub fn is_voxel_failed(&self, id: VoxelId) -> Option<bool> {
        Some(self.voxel(id)?.is_failed(&self.links, &self.link_mats))
    }

    pub fn link_strain_energy(&self, id: LinkId) -> Option<f64> {
        let link = self.link(id)?;
        Some(link.strain_energy(&self.link_mats[link.material().0]))
    }

    pub fn is_link_yielded(&self, id: LinkId) -> Option<bool> {
        Some(self.link(id)?.is_yielded(&self.link_mats))
    }

    pub fn is_link_failed(&self, id: LinkId) -> Option<bool> {
        Some(self.link(id)?.is_failed(&self.link_mats))
    }

    /// Lattice-wide reduction of a voxel or link quantity.
    pub fn state_info(&self, info: StateInfo, value_type: ValueType) -> f64 {
        let values: Vec<f64> = match info {
            StateInfo::StrainEnergy | StateInfo::EngineeringStress | StateInfo::EngineeringStrain => {
                self.links()
                    .map(|(_, link)| match info {
                        StateInfo::StrainEnergy => {
                            link.strain_energy(&self.link_mats[link.material().0])
                        }
                        StateInfo::EngineeringStress => link.axial_stress(),
                        _ => link.axial_strain(),
                    })
                    .collect()
            }
            _ => self
                .voxels()
                .map(|(_, voxel)| {
                    let mat = vmat(&self.voxel_mats, voxel.material());
                    match info {
                        StateInfo::Displacement => voxel.displacement(mat).norm(),
                        StateInfo::Velocity => voxel.velocity(mat).norm(),
                        StateInfo::KineticEnergy => voxel.kinetic_energy(mat),
                        StateInfo::AngularDisplacement => quat_angle(&voxel.orientation()),
                        StateInfo::AngularVelocity => voxel.angular_velocity(mat).norm(),
                        StateInfo::Pressure => voxel.pressure(mat, &self.links),
                        StateInfo::Mass => mat.mass(),
                        _ => 0.0,
                    }
                })
                .collect(),
        };

        if values.is_empty() {
            return 0.0;
        }
        match value_type {
            ValueType::Min => values.iter().cloned().fold(f64::INFINITY, f64::min),
            ValueType::Max => values.iter().cloned().fold(f64::NEG_INFINITY, f64::max),
            ValueType::Total => values.iter().sum(),
            ValueType::Average => values.iter().sum::<f64>() / values.len() as f64,
        }
    }

    // ----- internal access for the linear solver -----

    pub(crate) fn arena_voxels(&self) -> &[Option<Voxel>] {
        &self.voxels
    }

    pub(crate) fn arena_voxels_mut(&mut self) -> &mut [Option<Voxel>] {
        &mut self.voxels
    }

    pub(crate) fn arena_links(&self) -> &[Option<Link>] {
        &self.links
    }

    pub(crate) fn arena_voxel_mats(&self) -> &[Option<VoxelMaterial>] {
        &self.voxel_mats
    }

    pub(crate) fn arena_link_mats(&self) -> &[LinkMaterial] {
        &self.link_mats
    }
}

impl Default for Lattice {
    fn default() -> Self {
        Self::new(DEFAULT_VOXEL_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_voxel_lattice() -> (Lattice, VoxelId, VoxelId) {
        let mut lattice = Lattice::new(0.001);
        let mat = lattice.add_material(1e6, 1000.0).unwrap();
        let v0 = lattice.set_voxel(mat, 0, 0, 0).unwrap();
        let v1 = lattice.set_voxel(mat, 1, 0, 0).unwrap();
        (lattice, v0, v1)
    }

    #[test]
    fn adjacent_voxels_get_linked() {
        let (lattice, v0, v1) = two_voxel_lattice();
        assert_eq!(lattice.voxel_count(), 2);
        assert_eq!(lattice.link_count(), 1);
        assert_eq!(lattice.adjacent_voxel(v0, LinkDirection::XPos), Some(v1));
        assert_eq!(lattice.adjacent_voxel(v1, LinkDirection::XNeg), Some(v0));
        assert_eq!(lattice.adjacent_voxel(v0, LinkDirection::YPos), None);
    }

    #[test]
    fn remove_voxel_removes_links() {
        let (mut lattice, v0, _) = two_voxel_lattice();
        lattice.remove_voxel(1, 0, 0);
        assert_eq!(lattice.voxel_count(), 1);
        assert_eq!(lattice.link_count(), 0);
        assert_eq!(lattice.voxel(v0).unwrap().link_count(), 0);
        assert!(lattice.voxel(v0).unwrap().is_surface());
    }

    #[test]
    fn combined_material_cache_is_shared() {
        let mut lattice = Lattice::new(0.001);
        let mat = lattice.add_material(1e6, 1000.0).unwrap();
        for i in 0..4 {
            lattice.set_voxel(mat, i, 0, 0).unwrap();
        }
        // three links, all the same material pair, one combined entry
        assert_eq!(lattice.link_count(), 3);
        assert_eq!(lattice.arena_link_mats().len(), 1);
    }

    #[test]
    fn recommended_time_step_positive() {
        let (lattice, _, _) = two_voxel_lattice();
        let dt = lattice.recommended_time_step();
        // k = E*L = 1000 N/m, m = 1e-6 kg: dt = 1/(2 pi sqrt(k/m))
        let expected = 1.0 / (2.0 * std::f64::consts::PI * (1000.0f64 / 1e-6).sqrt());
        assert!((dt - expected).abs() / expected < 1e-9);
    }

    #[test]
    fn reset_time_restores_nominal_state() {
        let (mut lattice, _, v1) = two_voxel_lattice();
        lattice
            .external(v1)
            .unwrap()
            .set_force(Vec3::new(1e-3, 0.0, 0.0));
        for _ in 0..10 {
            lattice.do_time_step(-1.0).unwrap();
        }
        assert!(lattice.voxel_displacement(v1).unwrap().norm() > 0.0);

        lattice.reset_time();
        assert_eq!(lattice.voxel_displacement(v1).unwrap().norm(), 0.0);
        assert_eq!(lattice.voxel_velocity(v1).unwrap().norm(), 0.0);
        let (_, link) = lattice.links().next().unwrap();
        assert_eq!(link.axial_strain(), 0.0);
        assert_eq!(link.force(true).norm(), 0.0);
    }

    #[test]
    fn replace_material_scales_momentum() {
        let (mut lattice, _, v1) = two_voxel_lattice();
        let heavy = lattice.add_material(1e6, 4000.0).unwrap();
        lattice
            .external(v1)
            .unwrap()
            .set_force(Vec3::new(1e-3, 0.0, 0.0));
        for _ in 0..5 {
            lattice.do_time_step(-1.0).unwrap();
        }
        let vel_before = lattice.voxel_velocity(v1).unwrap();
        lattice.set_voxel(heavy, 1, 0, 0).unwrap();
        let vel_after = lattice.voxel_velocity(v1).unwrap();
        assert!((vel_before - vel_after).norm() < 1e-12 * vel_before.norm().max(1.0));
    }
}
