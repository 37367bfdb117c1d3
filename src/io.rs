//! Persisted lattice state and 3D scalar field formats
//!
//! A lattice serializes to a JSON document carrying the global parameters,
//! the material catalog, a flat array of (x, y, z, materialIndex) quadruples
//! and a deduplicated list of externals with the voxel indices they apply
//! to. A separate array-of-floats document encodes sparse 3D scalar fields.

use crate::array3d::{Array3D, Index3D};
use crate::error::{IbexError, Result};
use crate::external::External;
use crate::lattice::Lattice;
use crate::materials::MaterialConfig;
use crate::math::Vec3;
use crate::voxel::VoxelId;
use log::info;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

fn is_zero(value: &f64) -> bool {
    *value == 0.0
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// One external boundary condition shared by a set of voxels.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExternalDocument {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fixed: Option<[bool; 6]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub translate: Option<[f64; 3]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rotate: Option<[f64; 3]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub force: Option<[f64; 3]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub moment: Option<[f64; 3]>,
    pub voxel_indices: Vec<usize>,
}

/// The complete persisted state of a lattice.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LatticeDocument {
    pub voxel_size: f64,
    #[serde(skip_serializing_if = "is_zero")]
    pub relative_ambient_temperature: f64,
    #[serde(skip_serializing_if = "is_zero")]
    pub gravity_acceleration: f64,
    #[serde(skip_serializing_if = "is_false")]
    pub floor_enabled: bool,
    #[serde(skip_serializing_if = "is_false")]
    pub collisions_enabled: bool,
    pub materials: Vec<MaterialConfig>,
    /// Flat array of (x, y, z, materialIndex) quadruples.
    pub voxels: Vec<i32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub externals: Vec<ExternalDocument>,
}

/// Lattice serialization entry points.
pub struct LatticeIO;

impl LatticeIO {
    /// Captures the lattice structure into a document.
    pub fn to_document(lattice: &Lattice) -> LatticeDocument {
        let mut doc = LatticeDocument {
            voxel_size: lattice.voxel_size(),
            relative_ambient_temperature: lattice.ambient_temperature(),
            gravity_acceleration: lattice.gravity(),
            floor_enabled: lattice.is_floor_enabled(),
            collisions_enabled: lattice.is_collisions_enabled(),
            ..Default::default()
        };

        // material handle -> document index
        let mut mat_to_index: HashMap<usize, usize> = HashMap::new();
        for (id, mat) in lattice.materials() {
            mat_to_index.insert(id.0, doc.materials.len());
            doc.materials.push(mat.material.to_config());
        }

        // voxel quadruples plus deduplicated externals
        let mut externals: Vec<(External, Vec<usize>)> = Vec::new();
        for (voxel_index, (_, voxel)) in lattice.voxels().enumerate() {
            doc.voxels.push(voxel.index_x());
            doc.voxels.push(voxel.index_y());
            doc.voxels.push(voxel.index_z());
            doc.voxels.push(mat_to_index[&voxel.material().0] as i32);

            if let Some(ext) = voxel.external() {
                if !ext.is_empty() {
                    match externals.iter_mut().find(|(e, _)| e == ext) {
                        Some((_, indices)) => indices.push(voxel_index),
                        None => externals.push((ext.clone(), vec![voxel_index])),
                    }
                }
            }
        }

        for (ext, voxel_indices) in externals {
            let mut entry = ExternalDocument {
                voxel_indices,
                ..Default::default()
            };
            if ext.is_fixed_any() {
                let mut fixed = [false; 6];
                for (bit, slot) in fixed.iter_mut().enumerate() {
                    *slot = ext.is_fixed(1 << bit);
                }
                entry.fixed = Some(fixed);
            }
            if ext.is_fixed_any_translation() && ext.translation() != Vec3::zeros() {
                let t = ext.translation();
                entry.translate = Some([t.x, t.y, t.z]);
            }
            if ext.is_fixed_any_rotation() && ext.rotation() != Vec3::zeros() {
                let r = ext.rotation();
                entry.rotate = Some([r.x, r.y, r.z]);
            }
            if !ext.is_fixed_all_translation() && ext.force() != Vec3::zeros() {
                let f = ext.force();
                entry.force = Some([f.x, f.y, f.z]);
            }
            if !ext.is_fixed_all_rotation() && ext.moment() != Vec3::zeros() {
                let m = ext.moment();
                entry.moment = Some([m.x, m.y, m.z]);
            }
            doc.externals.push(entry);
        }

        doc
    }

    /// Rebuilds a lattice from a document.
    pub fn from_document(doc: &LatticeDocument) -> Result<Lattice> {
        if doc.voxels.len() % 4 != 0 {
            return Err(IbexError::ValidationError(
                "Voxel array length must be a multiple of 4".to_string(),
            ));
        }

        let mut lattice = Lattice::new(doc.voxel_size);
        lattice.set_gravity(doc.gravity_acceleration);
        lattice.enable_floor(doc.floor_enabled);
        lattice.enable_collisions(doc.collisions_enabled);
        lattice.set_ambient_temperature(doc.relative_ambient_temperature, false);

        let mut material_ids = Vec::with_capacity(doc.materials.len());
        for config in &doc.materials {
            material_ids.push(lattice.add_material_config(config)?);
        }

        let mut voxel_ids: Vec<VoxelId> = Vec::with_capacity(doc.voxels.len() / 4);
        for quad in doc.voxels.chunks_exact(4) {
            let mat_index = quad[3] as usize;
            let mat = *material_ids.get(mat_index).ok_or_else(|| {
                IbexError::ValidationError(format!("Voxel references unknown material {}", mat_index))
            })?;
            voxel_ids.push(lattice.set_voxel(mat, quad[0], quad[1], quad[2])?);
        }

        for entry in &doc.externals {
            let fixed = entry.fixed.unwrap_or([false; 6]);
            let translate = entry.translate.unwrap_or([0.0; 3]);
            let rotate = entry.rotate.unwrap_or([0.0; 3]);
            let force = entry.force.unwrap_or([0.0; 3]);
            let moment = entry.moment.unwrap_or([0.0; 3]);

            for &voxel_index in &entry.voxel_indices {
                let vid = *voxel_ids.get(voxel_index).ok_or_else(|| {
                    IbexError::ValidationError(format!(
                        "External references unknown voxel {}",
                        voxel_index
                    ))
                })?;
                let ext = lattice.external(vid).ok_or_else(|| {
                    IbexError::ValidationError("Voxel disappeared while loading".to_string())
                })?;
                for (bit, &is_fixed) in fixed.iter().enumerate() {
                    if is_fixed {
                        let value = if bit < 3 { translate[bit] } else { rotate[bit - 3] };
                        ext.set_displacement(1 << bit, value);
                    }
                }
                ext.add_force(Vec3::new(force[0], force[1], force[2]));
                ext.add_moment(Vec3::new(moment[0], moment[1], moment[2]));
            }
        }

        Ok(lattice)
    }

    /// Saves a lattice as pretty-printed JSON.
    pub fn save_to_file<P: AsRef<Path>>(lattice: &Lattice, path: P) -> Result<()> {
        let doc = Self::to_document(lattice);
        let json = serde_json::to_string_pretty(&doc)?;
        std::fs::write(path.as_ref(), json)?;
        info!("saved lattice to {}", path.as_ref().display());
        Ok(())
    }

    /// Loads a lattice from a JSON file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Lattice> {
        let json = std::fs::read_to_string(path.as_ref())?;
        let doc: LatticeDocument = serde_json::from_str(&json)?;
        info!("loaded lattice from {}", path.as_ref().display());
        Self::from_document(&doc)
    }
}

/// Array-of-floats encoding of a sparse 3D scalar field.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ScalarFieldDocument {
    pub spacing: f64,
    pub default_value: f64,
    pub size: [i32; 3],
    pub offset: [i32; 3],
    pub c_min: [i32; 3],
    pub c_max: [i32; 3],
    pub array_data: Vec<f64>,
}

impl ScalarFieldDocument {
    /// Encodes a field with its lattice spacing.
    pub fn from_array(spacing: f64, default_value: f64, array: &Array3D<f64>) -> Self {
        let size = array.window_size();
        let offset = array.window_offset();
        let c_min = array.min_indices();
        let c_max = array.max_indices();

        let mut array_data = Vec::with_capacity((size.x * size.y * size.z).max(0) as usize);
        for k in offset.z..offset.z + size.z {
            for j in offset.y..offset.y + size.y {
                for i in offset.x..offset.x + size.x {
                    array_data.push(*array.get(i, j, k));
                }
            }
        }

        Self {
            spacing,
            default_value,
            size: [size.x, size.y, size.z],
            offset: [offset.x, offset.y, offset.z],
            c_min: [c_min.x, c_min.y, c_min.z],
            c_max: [c_max.x, c_max.y, c_max.z],
            array_data,
        }
    }

    /// Decodes back into a spacing and field.
    pub fn to_array(&self) -> Result<(f64, Array3D<f64>)> {
        let expected = (self.size[0] as i64 * self.size[1] as i64 * self.size[2] as i64).max(0);
        if self.array_data.len() as i64 != expected {
            return Err(IbexError::ValidationError(format!(
                "Scalar field data length {} does not match size {:?}",
                self.array_data.len(),
                self.size
            )));
        }

        let mut array = Array3D::new(self.default_value);
        let mut cursor = 0;
        for k in self.offset[2]..self.offset[2] + self.size[2] {
            for j in self.offset[1]..self.offset[1] + self.size[1] {
                for i in self.offset[0]..self.offset[0] + self.size[0] {
                    let value = self.array_data[cursor];
                    cursor += 1;
                    if value != self.default_value && !array.set(Index3D::new(i, j, k), value) {
                        return Err(IbexError::AllocationFailure);
                    }
                }
            }
        }
        Ok((self.spacing, array))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::{X_TRANSLATE, Z_TRANSLATE};

    #[test]
    fn lattice_document_round_trip() {
        let mut lattice = Lattice::new(0.001);
        let soft = lattice.add_material(1e6, 1000.0).unwrap();
        let stiff = lattice.add_material(1e8, 2000.0).unwrap();
        let v0 = lattice.set_voxel(soft, 0, 0, 0).unwrap();
        lattice.set_voxel(stiff, 1, 0, 0).unwrap();
        lattice.set_voxel(soft, 2, 0, 0).unwrap();
        lattice.enable_floor(true);
        lattice.set_gravity(1.0);

        lattice.external(v0).unwrap().set_displacement(X_TRANSLATE, 1e-4);
        lattice
            .external(v0)
            .unwrap()
            .set_force(Vec3::new(0.0, 0.0, -1e-3));

        let doc = LatticeIO::to_document(&lattice);
        assert_eq!(doc.voxels.len(), 12);
        assert_eq!(doc.materials.len(), 2);
        assert_eq!(doc.externals.len(), 1);

        let json = serde_json::to_string(&doc).unwrap();
        let parsed: LatticeDocument = serde_json::from_str(&json).unwrap();
        let rebuilt = LatticeIO::from_document(&parsed).unwrap();

        assert_eq!(rebuilt.voxel_count(), 3);
        assert_eq!(rebuilt.link_count(), 2);
        assert!(rebuilt.is_floor_enabled());
        let v0_rebuilt = rebuilt.voxel_at(0, 0, 0).unwrap();
        let ext = rebuilt.voxel(v0_rebuilt).unwrap().external().unwrap();
        assert!(ext.is_fixed(X_TRANSLATE));
        assert_eq!(ext.translation().x, 1e-4);
        assert_eq!(ext.force().z, -1e-3);
    }

    #[test]
    fn externals_are_deduplicated() {
        let mut lattice = Lattice::new(0.001);
        let mat = lattice.add_material(1e6, 1000.0).unwrap();
        for i in 0..3 {
            let vid = lattice.set_voxel(mat, i, 0, 0).unwrap();
            lattice.external(vid).unwrap().set_displacement(Z_TRANSLATE, 0.0);
        }
        let doc = LatticeIO::to_document(&lattice);
        assert_eq!(doc.externals.len(), 1);
        assert_eq!(doc.externals[0].voxel_indices.len(), 3);
    }

    #[test]
    fn scalar_field_round_trip() {
        let mut field = Array3D::new(0.0f64);
        field.set(Index3D::new(-1, 0, 2), 3.5);
        field.set(Index3D::new(4, 1, 2), -1.25);

        let doc = ScalarFieldDocument::from_array(0.001, 0.0, &field);
        let (spacing, rebuilt) = doc.to_array().unwrap();
        assert_eq!(spacing, 0.001);
        assert_eq!(*rebuilt.get(-1, 0, 2), 3.5);
        assert_eq!(*rebuilt.get(4, 1, 2), -1.25);
        assert_eq!(*rebuilt.get(0, 0, 0), 0.0);
        assert_eq!(rebuilt.min_indices(), field.min_indices());
        assert_eq!(rebuilt.max_indices(), field.max_indices());
    }
}
