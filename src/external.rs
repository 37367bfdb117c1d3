//! Prescribed boundary conditions and applied loads for a single voxel

use crate::math::{quat_from_rotation_vector, quat_identity, Quat, Vec3};
use serde::{Deserialize, Serialize};

/// Bit mask over the six degrees of freedom of a voxel.
pub type DofFlags = u8;

pub const DOF_NONE: DofFlags = 0;
pub const X_TRANSLATE: DofFlags = 1 << 0;
pub const Y_TRANSLATE: DofFlags = 1 << 1;
pub const Z_TRANSLATE: DofFlags = 1 << 2;
pub const X_ROTATE: DofFlags = 1 << 3;
pub const Y_ROTATE: DofFlags = 1 << 4;
pub const Z_ROTATE: DofFlags = 1 << 5;
pub const ALL_TRANSLATE: DofFlags = X_TRANSLATE | Y_TRANSLATE | Z_TRANSLATE;
pub const ALL_ROTATE: DofFlags = X_ROTATE | Y_ROTATE | Z_ROTATE;
pub const DOF_ALL: DofFlags = ALL_TRANSLATE | ALL_ROTATE;

/// Assembles a DOF mask from individual axis flags.
pub fn dof(
    x_translate: bool,
    y_translate: bool,
    z_translate: bool,
    x_rotate: bool,
    y_rotate: bool,
    z_rotate: bool,
) -> DofFlags {
    let mut flags = DOF_NONE;
    if x_translate {
        flags |= X_TRANSLATE;
    }
    if y_translate {
        flags |= Y_TRANSLATE;
    }
    if z_translate {
        flags |= Z_TRANSLATE;
    }
    if x_rotate {
        flags |= X_ROTATE;
    }
    if y_rotate {
        flags |= Y_ROTATE;
    }
    if z_rotate {
        flags |= Z_ROTATE;
    }
    flags
}

/// The external state of a voxel: fixed degrees of freedom with prescribed
/// displacements, plus applied force and moment.
///
/// Prescribing a displacement on a DOF fixes it. The prescribed rotation is
/// stored as a rotation vector and cached in quaternion form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct External {
    dof_fixed: DofFlags,
    ext_force: Vec3,
    ext_moment: Vec3,
    ext_translation: Vec3,
    ext_rotation: Vec3,
    #[serde(skip, default = "quat_identity")]
    rotation_q: Quat,
}

impl Default for External {
    fn default() -> Self {
        Self {
            dof_fixed: DOF_NONE,
            ext_force: Vec3::zeros(),
            ext_moment: Vec3::zeros(),
            ext_translation: Vec3::zeros(),
            ext_rotation: Vec3::zeros(),
            rotation_q: quat_identity(),
        }
    }
}

impl PartialEq for External {
    fn eq(&self, other: &Self) -> bool {
        // the cached quaternion is derived from ext_rotation
        self.dof_fixed == other.dof_fixed
            && self.ext_force == other.ext_force
            && self.ext_moment == other.ext_moment
            && self.ext_translation == other.ext_translation
            && self.ext_rotation == other.ext_rotation
    }
}

impl External {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clears all fixes, displacements, forces and moments.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// True if nothing is fixed and no load is applied.
    pub fn is_empty(&self) -> bool {
        self.dof_fixed == DOF_NONE
            && self.ext_force == Vec3::zeros()
            && self.ext_moment == Vec3::zeros()
    }

    pub fn is_fixed(&self, dof: DofFlags) -> bool {
        self.dof_fixed & dof == dof && dof != DOF_NONE
    }

    pub fn is_fixed_any(&self) -> bool {
        self.dof_fixed != DOF_NONE
    }

    pub fn is_fixed_all(&self) -> bool {
        self.dof_fixed == DOF_ALL
    }

    pub fn is_fixed_any_translation(&self) -> bool {
        self.dof_fixed & ALL_TRANSLATE != 0
    }

    pub fn is_fixed_all_translation(&self) -> bool {
        self.dof_fixed & ALL_TRANSLATE == ALL_TRANSLATE
    }

    pub fn is_fixed_any_rotation(&self) -> bool {
        self.dof_fixed & ALL_ROTATE != 0
    }

    pub fn is_fixed_all_rotation(&self) -> bool {
        self.dof_fixed & ALL_ROTATE == ALL_ROTATE
    }

    pub fn fixed_dofs(&self) -> DofFlags {
        self.dof_fixed
    }

    /// Fixes (or frees) each DOF with zero prescribed displacement.
    pub fn set_fixed(
        &mut self,
        x_translate: bool,
        y_translate: bool,
        z_translate: bool,
        x_rotate: bool,
        y_rotate: bool,
        z_rotate: bool,
    ) {
        self.dof_fixed = dof(
            x_translate,
            y_translate,
            z_translate,
            x_rotate,
            y_rotate,
            z_rotate,
        );
        self.ext_translation = Vec3::zeros();
        self.ext_rotation = Vec3::zeros();
        self.rotation_changed();
    }

    /// Fixes the given DOFs at the prescribed displacement (meters for
    /// translations, radians of rotation vector for rotations).
    pub fn set_displacement(&mut self, dof: DofFlags, displacement: f64) {
        self.dof_fixed |= dof;
        if displacement != 0.0 {
            if dof & X_TRANSLATE != 0 {
                self.ext_translation.x = displacement;
            }
            if dof & Y_TRANSLATE != 0 {
                self.ext_translation.y = displacement;
            }
            if dof & Z_TRANSLATE != 0 {
                self.ext_translation.z = displacement;
            }
            if dof & X_ROTATE != 0 {
                self.ext_rotation.x = displacement;
            }
            if dof & Y_ROTATE != 0 {
                self.ext_rotation.y = displacement;
            }
            if dof & Z_ROTATE != 0 {
                self.ext_rotation.z = displacement;
            }
        }
        self.rotation_changed();
    }

    /// Fixes all six DOFs at the prescribed pose.
    pub fn set_displacement_all(&mut self, translation: Vec3, rotation: Vec3) {
        self.dof_fixed = DOF_ALL;
        self.ext_translation = translation;
        self.ext_rotation = rotation;
        self.rotation_changed();
    }

    /// Frees the given DOFs and zeros their prescribed displacements.
    pub fn clear_displacement(&mut self, dof: DofFlags) {
        self.dof_fixed &= !dof;
        if dof & X_TRANSLATE != 0 {
            self.ext_translation.x = 0.0;
        }
        if dof & Y_TRANSLATE != 0 {
            self.ext_translation.y = 0.0;
        }
        if dof & Z_TRANSLATE != 0 {
            self.ext_translation.z = 0.0;
        }
        if dof & X_ROTATE != 0 {
            self.ext_rotation.x = 0.0;
        }
        if dof & Y_ROTATE != 0 {
            self.ext_rotation.y = 0.0;
        }
        if dof & Z_ROTATE != 0 {
            self.ext_rotation.z = 0.0;
        }
        self.rotation_changed();
    }

    pub fn clear_displacement_all(&mut self) {
        self.dof_fixed = DOF_NONE;
        self.ext_translation = Vec3::zeros();
        self.ext_rotation = Vec3::zeros();
        self.rotation_changed();
    }

    pub fn force(&self) -> Vec3 {
        self.ext_force
    }

    pub fn set_force(&mut self, force: Vec3) {
        self.ext_force = force;
    }

    pub fn add_force(&mut self, force: Vec3) {
        self.ext_force += force;
    }

    pub fn clear_force(&mut self) {
        self.ext_force = Vec3::zeros();
    }

    pub fn moment(&self) -> Vec3 {
        self.ext_moment
    }

    pub fn set_moment(&mut self, moment: Vec3) {
        self.ext_moment = moment;
    }

    pub fn add_moment(&mut self, moment: Vec3) {
        self.ext_moment += moment;
    }

    pub fn clear_moment(&mut self) {
        self.ext_moment = Vec3::zeros();
    }

    pub fn translation(&self) -> Vec3 {
        self.ext_translation
    }

    pub fn rotation(&self) -> Vec3 {
        self.ext_rotation
    }

    /// Prescribed rotation in quaternion form (cached).
    pub fn rotation_quat(&self) -> Quat {
        self.rotation_q
    }

    /// Recomputes the cached quaternion; call after deserializing.
    pub(crate) fn rotation_changed(&mut self) {
        self.rotation_q = if self.ext_rotation != Vec3::zeros() {
            quat_from_rotation_vector(&self.ext_rotation)
        } else {
            quat_identity()
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn displacement_implies_fixed() {
        let mut ext = External::new();
        ext.set_displacement(X_TRANSLATE, 1e-3);
        assert!(ext.is_fixed(X_TRANSLATE));
        assert!(!ext.is_fixed(Y_TRANSLATE));
        assert_eq!(ext.translation().x, 1e-3);
    }

    #[test]
    fn clear_displacement_frees_and_zeros() {
        let mut ext = External::new();
        ext.set_displacement_all(Vec3::new(1.0, 2.0, 3.0), Vec3::new(0.1, 0.0, 0.0));
        assert!(ext.is_fixed_all());
        ext.clear_displacement(X_TRANSLATE | X_ROTATE);
        assert!(!ext.is_fixed(X_TRANSLATE));
        assert_eq!(ext.translation().x, 0.0);
        assert_eq!(ext.rotation().x, 0.0);
        assert!(ext.is_fixed(Y_TRANSLATE));
    }

    #[test]
    fn rotation_quat_tracks_rotation_vector() {
        let mut ext = External::new();
        ext.set_displacement(Z_ROTATE, std::f64::consts::FRAC_PI_2);
        let q = ext.rotation_quat();
        assert!((q.w - (std::f64::consts::FRAC_PI_4).cos()).abs() < 1e-12);
    }

    #[test]
    fn empty_detection() {
        let mut ext = External::new();
        assert!(ext.is_empty());
        ext.add_force(Vec3::new(0.0, 0.0, -1.0));
        assert!(!ext.is_empty());
    }
}
