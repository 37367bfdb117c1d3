//! Material properties and constitutive models
//!
//! [`Material`] carries the constitutive model plus the physical constants
//! shared by voxels and links. [`VoxelMaterial`] specializes a material by the
//! lattice's nominal voxel size and caches mass and damping terms;
//! [`LinkMaterial`] combines the two voxel materials at a link's ends and
//! caches the five beam stiffness constants.

use crate::error::{IbexError, Result, Validate};
use crate::math::Vec3;
use serde::{Deserialize, Serialize};

/// Standard gravitational acceleration, m/s^2.
pub const GRAVITY_ACCELERATION: f64 = 9.80665;

// Stand-in failure stress for linear materials with no failure specified,
// used only to give the piecewise data table a second point.
const DUMMY_FAILURE_STRESS: f64 = 1e6;

/// Handle to a voxel material in the lattice catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VoxelMaterialId(pub usize);

/// Handle to a combined link material in the lattice catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LinkMaterialId(pub usize);

/// Display color of a material.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

impl Color {
    pub fn new(r: u8, g: u8, b: u8, a: u8) -> Self {
        Self { r, g, b, a }
    }
}

/// Stress/strain model of a material.
///
/// The piecewise variant always carries a leading (0, 0) data point; the first
/// segment's slope is the Young's modulus and subsequent segments may not
/// exceed it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MaterialModel {
    /// Single elastic segment, optionally ending in failure.
    Linear {
        youngs_modulus: f64,
        failure_stress: Option<f64>,
    },
    /// Piecewise-linear stress/strain data with yield and failure points.
    Piecewise {
        strain_data: Vec<f64>,
        stress_data: Vec<f64>,
        yield_strain: Option<f64>,
        yield_stress: Option<f64>,
        failure_strain: Option<f64>,
        failure_stress: Option<f64>,
    },
}

impl MaterialModel {
    /// A linear elastic model with no failure point.
    pub fn linear(youngs_modulus: f64) -> Result<Self> {
        Self::linear_failing(youngs_modulus, None)
    }

    /// A linear elastic model that fails at the given stress.
    pub fn linear_failing(youngs_modulus: f64, failure_stress: Option<f64>) -> Result<Self> {
        if youngs_modulus <= 0.0 {
            return Err(IbexError::InvalidMaterial(
                "Young's modulus must be positive".to_string(),
            ));
        }
        if let Some(sigma_f) = failure_stress {
            if sigma_f <= 0.0 {
                return Err(IbexError::InvalidMaterial(
                    "Failure stress must be positive".to_string(),
                ));
            }
        }
        Ok(MaterialModel::Linear {
            youngs_modulus,
            failure_stress,
        })
    }

    /// An elastic-plastic model with one plastic segment.
    ///
    /// Yield is the first data point; failure defaults to three times the
    /// yield stress when unspecified (the data table needs an end point, but
    /// the material is then treated as never failing).
    pub fn bilinear(
        youngs_modulus: f64,
        plastic_modulus: f64,
        yield_stress: f64,
        failure_stress: Option<f64>,
    ) -> Result<Self> {
        if youngs_modulus <= 0.0 {
            return Err(IbexError::InvalidMaterial(
                "Young's modulus must be positive".to_string(),
            ));
        }
        if plastic_modulus <= 0.0 || plastic_modulus >= youngs_modulus {
            return Err(IbexError::InvalidMaterial(
                "Plastic modulus must be positive but less than Young's modulus".to_string(),
            ));
        }
        if yield_stress <= 0.0 {
            return Err(IbexError::InvalidMaterial(
                "Yield stress must be positive".to_string(),
            ));
        }
        if let Some(sigma_f) = failure_stress {
            if sigma_f <= yield_stress {
                return Err(IbexError::InvalidMaterial(
                    "Failure stress must be greater than the yield stress".to_string(),
                ));
            }
        }

        let yield_strain = yield_stress / youngs_modulus;
        let end_stress = failure_stress.unwrap_or(3.0 * yield_stress);
        let intercept = yield_stress - plastic_modulus * yield_strain;
        let end_strain = (end_stress - intercept) / plastic_modulus;

        Ok(MaterialModel::Piecewise {
            strain_data: vec![0.0, yield_strain, end_strain],
            stress_data: vec![0.0, yield_stress, end_stress],
            yield_strain: Some(yield_strain),
            yield_stress: Some(yield_stress),
            failure_strain: failure_stress.map(|_| end_strain),
            failure_stress,
        })
    }

    /// Builds a model from stress/strain data points.
    ///
    /// A leading (0, 0) point is optional. Strains must be positive and
    /// strictly increasing, stresses non-decreasing, and no segment may be
    /// steeper than the first (the Young's modulus). The last point is the
    /// failure point; with three or more points the yield point comes from
    /// the 0.2% offset method, with two it is the first data point, and a
    /// single point collapses to a linear model.
    pub fn from_data(strain_data: &[f64], stress_data: &[f64]) -> Result<Self> {
        if strain_data.len() != stress_data.len() {
            return Err(IbexError::InvalidMaterial(
                "Strain and stress data lengths differ".to_string(),
            ));
        }

        let mut strains = strain_data;
        let mut stresses = stress_data;
        if strains.first() == Some(&0.0) && stresses.first() == Some(&0.0) {
            strains = &strains[1..];
            stresses = &stresses[1..];
        }
        if strains.is_empty() {
            return Err(IbexError::InvalidMaterial(
                "Not enough data points".to_string(),
            ));
        }
        if strains[0] <= 0.0 || stresses[0] <= 0.0 {
            return Err(IbexError::InvalidMaterial(
                "First stress and strain data points negative or zero".to_string(),
            ));
        }

        let youngs_modulus = stresses[0] / strains[0];
        let mut sweep_strain = 0.0;
        let mut sweep_stress = 0.0;
        for (i, (&strain, &stress)) in strains.iter().zip(stresses).enumerate() {
            if strain <= sweep_strain {
                return Err(IbexError::InvalidMaterial(
                    "Out of order strain data".to_string(),
                ));
            }
            if stress < sweep_stress {
                return Err(IbexError::InvalidMaterial(
                    "Stress data is not monotonically increasing".to_string(),
                ));
            }
            // tolerance absorbs rounding when a combined model repeats the
            // elastic slope exactly
            if i > 0
                && (stress - sweep_stress) / (strain - sweep_strain)
                    > youngs_modulus * (1.0 + 1e-12)
            {
                return Err(IbexError::InvalidMaterial(
                    "Slope of stress/strain curve should never exceed that of the first segment (Young's modulus)"
                        .to_string(),
                ));
            }
            sweep_strain = strain;
            sweep_stress = stress;
        }

        if strains.len() == 1 {
            return Self::linear_failing(youngs_modulus, Some(stresses[0]));
        }

        let mut full_strains = Vec::with_capacity(strains.len() + 1);
        let mut full_stresses = Vec::with_capacity(stresses.len() + 1);
        full_strains.push(0.0);
        full_stresses.push(0.0);
        full_strains.extend_from_slice(strains);
        full_stresses.extend_from_slice(stresses);

        let failure_strain = *full_strains.last().unwrap_or(&0.0);
        let failure_stress = *full_stresses.last().unwrap_or(&0.0);

        let (yield_strain, yield_stress) = if strains.len() == 2 {
            (full_strains[1], full_stresses[1])
        } else {
            match yield_from_data(&full_strains, &full_stresses, youngs_modulus) {
                Some(point) => point,
                None => (failure_strain, failure_stress),
            }
        };

        Ok(MaterialModel::Piecewise {
            strain_data: full_strains,
            stress_data: full_stresses,
            yield_strain: Some(yield_strain),
            yield_stress: Some(yield_stress),
            failure_strain: Some(failure_strain),
            failure_stress: Some(failure_stress),
        })
    }

    /// Replaces the failure point, keeping the data table. Used when
    /// combining materials where failure is the lesser of the two.
    pub(crate) fn with_failure_stress(self, new_failure: Option<f64>) -> Self {
        match self {
            MaterialModel::Linear { youngs_modulus, .. } => MaterialModel::Linear {
                youngs_modulus,
                failure_stress: new_failure,
            },
            MaterialModel::Piecewise {
                strain_data,
                stress_data,
                yield_strain,
                yield_stress,
                ..
            } => {
                let failure_strain = new_failure
                    .map(|sigma| strain_at_stress(&strain_data, &stress_data, sigma));
                MaterialModel::Piecewise {
                    strain_data,
                    stress_data,
                    yield_strain,
                    yield_stress,
                    failure_strain,
                    failure_stress: new_failure,
                }
            }
        }
    }

    pub fn youngs_modulus(&self) -> f64 {
        match self {
            MaterialModel::Linear { youngs_modulus, .. } => *youngs_modulus,
            MaterialModel::Piecewise {
                strain_data,
                stress_data,
                ..
            } => stress_data[1] / strain_data[1],
        }
    }

    pub fn is_linear(&self) -> bool {
        matches!(self, MaterialModel::Linear { .. })
    }

    /// End of the first (elastic) segment.
    pub fn first_strain(&self) -> f64 {
        match self {
            MaterialModel::Linear { .. } => f64::INFINITY,
            MaterialModel::Piecewise { strain_data, .. } => strain_data[1],
        }
    }

    /// Interpolated stress from the data table, with no volumetric coupling
    /// and no failure check.
    pub fn basic_stress(&self, strain: f64) -> f64 {
        match self {
            MaterialModel::Linear { youngs_modulus, .. } => youngs_modulus * strain,
            MaterialModel::Piecewise {
                strain_data,
                stress_data,
                ..
            } => {
                if strain <= strain_data[1] {
                    return self.youngs_modulus() * strain;
                }
                let n = strain_data.len();
                for i in 2..n {
                    if strain <= strain_data[i] || i == n - 1 {
                        let frac =
                            (strain - strain_data[i - 1]) / (strain_data[i] - strain_data[i - 1]);
                        return stress_data[i - 1] + frac * (stress_data[i] - stress_data[i - 1]);
                    }
                }
                0.0
            }
        }
    }

    /// Secant modulus of the segment containing `strain`; zero past failure.
    pub fn modulus(&self, strain: f64) -> f64 {
        if self.is_failed(strain) {
            return 0.0;
        }
        match self {
            MaterialModel::Linear { youngs_modulus, .. } => *youngs_modulus,
            MaterialModel::Piecewise {
                strain_data,
                stress_data,
                ..
            } => {
                if strain <= strain_data[1] {
                    return self.youngs_modulus();
                }
                let n = strain_data.len();
                for i in 2..n {
                    if strain <= strain_data[i] || i == n - 1 {
                        return (stress_data[i] - stress_data[i - 1])
                            / (strain_data[i] - strain_data[i - 1]);
                    }
                }
                0.0
            }
        }
    }

    /// Inverse lookup: the strain at which the model reaches `stress`.
    pub fn strain_at_stress(&self, stress: f64) -> f64 {
        match self {
            MaterialModel::Linear { youngs_modulus, .. } => stress / youngs_modulus,
            MaterialModel::Piecewise {
                strain_data,
                stress_data,
                ..
            } => strain_at_stress(strain_data, stress_data, stress),
        }
    }

    pub fn failure_stress(&self) -> Option<f64> {
        match self {
            MaterialModel::Linear { failure_stress, .. } => *failure_stress,
            MaterialModel::Piecewise { failure_stress, .. } => *failure_stress,
        }
    }

    pub fn failure_strain(&self) -> Option<f64> {
        match self {
            MaterialModel::Linear {
                youngs_modulus,
                failure_stress,
            } => failure_stress.map(|sigma| sigma / youngs_modulus),
            MaterialModel::Piecewise { failure_strain, .. } => *failure_strain,
        }
    }

    pub fn yield_stress(&self) -> Option<f64> {
        match self {
            MaterialModel::Linear { failure_stress, .. } => *failure_stress,
            MaterialModel::Piecewise { yield_stress, .. } => *yield_stress,
        }
    }

    pub fn yield_strain(&self) -> Option<f64> {
        match self {
            MaterialModel::Linear {
                youngs_modulus,
                failure_stress,
            } => failure_stress.map(|sigma| sigma / youngs_modulus),
            MaterialModel::Piecewise { yield_strain, .. } => *yield_strain,
        }
    }

    pub fn is_failed(&self, strain: f64) -> bool {
        match self.failure_strain() {
            Some(eps_f) => strain > eps_f,
            None => false,
        }
    }

    pub fn is_yielded(&self, strain: f64) -> bool {
        match self.yield_strain() {
            Some(eps_y) => strain > eps_y,
            None => false,
        }
    }

    /// The full data table including the leading (0, 0) point. Linear models
    /// materialize a two-point table ending at the failure point (or a
    /// stand-in if none is set) so that combination walks have breakpoints.
    pub fn data_points(&self) -> (Vec<f64>, Vec<f64>) {
        match self {
            MaterialModel::Linear {
                youngs_modulus,
                failure_stress,
            } => {
                let sigma = failure_stress.unwrap_or(DUMMY_FAILURE_STRESS);
                (vec![0.0, sigma / youngs_modulus], vec![0.0, sigma])
            }
            MaterialModel::Piecewise {
                strain_data,
                stress_data,
                ..
            } => (strain_data.clone(), stress_data.clone()),
        }
    }
}

fn strain_at_stress(strain_data: &[f64], stress_data: &[f64], stress: f64) -> f64 {
    if stress <= stress_data[1] {
        return stress * strain_data[1] / stress_data[1];
    }
    let n = stress_data.len();
    for i in 2..n {
        if stress <= stress_data[i] || i == n - 1 {
            let frac = (stress - stress_data[i - 1]) / (stress_data[i] - stress_data[i - 1]);
            return strain_data[i - 1] + frac * (strain_data[i] - strain_data[i - 1]);
        }
    }
    0.0
}

// 0.2% strain offset method: intersect y = E*(x - 0.002) with the data curve.
fn yield_from_data(strain_data: &[f64], stress_data: &[f64], e: f64) -> Option<(f64, f64)> {
    let offset_b = -0.002 * e;
    let n = strain_data.len() - 1;
    for i in 1..n {
        let (x1, x2) = (strain_data[i], strain_data[i + 1]);
        let (y1, y2) = (stress_data[i], stress_data[i + 1]);
        let slope = (y2 - y1) / (x2 - x1);
        let b = y1 - slope * x1;
        if e != slope {
            let x_intersect = (b - offset_b) / (e - slope);
            if x_intersect > x1 && x_intersect < x2 {
                let frac = (x_intersect - x1) / (x2 - x1);
                return Some((x_intersect, y1 + frac * (y2 - y1)));
            }
        }
    }
    None
}

/// Physical material definition shared by voxels and links.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Material {
    pub name: String,
    pub color: Option<Color>,
    model: MaterialModel,
    nu: f64,
    rho: f64,
    alpha_cte: f64,
    mu_static: f64,
    mu_kinetic: f64,
    zeta_internal: f64,
    zeta_global: f64,
    zeta_collision: f64,
    ext_scale: Vec3,
    e_hat: f64,
}

impl Material {
    /// A linear elastic material with the given stiffness and density.
    pub fn new(youngs_modulus: f64, density: f64) -> Result<Self> {
        Self::with_model(MaterialModel::linear(youngs_modulus)?, density)
    }

    /// A material with an explicit constitutive model.
    pub fn with_model(model: MaterialModel, density: f64) -> Result<Self> {
        if density <= 0.0 {
            return Err(IbexError::InvalidMaterial(
                "Density must be positive".to_string(),
            ));
        }
        let mut mat = Self {
            name: String::new(),
            color: None,
            model,
            nu: 0.0,
            rho: density,
            alpha_cte: 0.0,
            mu_static: 0.0,
            mu_kinetic: 0.0,
            zeta_internal: 1.0,
            zeta_global: 0.0,
            zeta_collision: 0.0,
            ext_scale: Vec3::new(1.0, 1.0, 1.0),
            e_hat: 0.0,
        };
        mat.update_derived();
        Ok(mat)
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn with_color(mut self, color: Color) -> Self {
        self.color = Some(color);
        self
    }

    pub fn with_poissons_ratio(mut self, nu: f64) -> Self {
        self.set_poissons_ratio(nu);
        self
    }

    pub fn with_cte(mut self, alpha: f64) -> Self {
        self.alpha_cte = alpha;
        self
    }

    pub fn with_static_friction(mut self, mu: f64) -> Self {
        self.set_static_friction(mu);
        self
    }

    pub fn with_kinetic_friction(mut self, mu: f64) -> Self {
        self.set_kinetic_friction(mu);
        self
    }

    pub fn with_internal_damping(mut self, zeta: f64) -> Self {
        self.set_internal_damping(zeta);
        self
    }

    pub fn with_global_damping(mut self, zeta: f64) -> Self {
        self.set_global_damping(zeta);
        self
    }

    pub fn with_collision_damping(mut self, zeta: f64) -> Self {
        self.set_collision_damping(zeta);
        self
    }

    pub fn with_external_scale_factor(mut self, factor: Vec3) -> Self {
        self.set_external_scale_factor(factor);
        self
    }

    /// Replaces the constitutive model.
    pub fn set_model(&mut self, model: MaterialModel) {
        self.model = model;
        self.update_derived();
    }

    /// Clamped to [0, 0.5) since 0.5 is incompressible.
    pub fn set_poissons_ratio(&mut self, nu: f64) {
        self.nu = nu.clamp(0.0, 0.5 - 2.0 * f64::EPSILON);
        self.update_derived();
    }

    pub fn set_density(&mut self, density: f64) {
        self.rho = if density <= 0.0 {
            f64::MIN_POSITIVE
        } else {
            density
        };
        self.update_derived();
    }

    pub fn set_cte(&mut self, alpha: f64) {
        self.alpha_cte = alpha;
    }

    pub fn set_static_friction(&mut self, mu: f64) {
        self.mu_static = mu.max(0.0);
    }

    pub fn set_kinetic_friction(&mut self, mu: f64) {
        self.mu_kinetic = mu.max(0.0);
    }

    pub fn set_internal_damping(&mut self, zeta: f64) {
        self.zeta_internal = zeta.max(0.0);
    }

    pub fn set_global_damping(&mut self, zeta: f64) {
        self.zeta_global = zeta.max(0.0);
    }

    pub fn set_collision_damping(&mut self, zeta: f64) {
        self.zeta_collision = zeta.max(0.0);
    }

    pub fn set_external_scale_factor(&mut self, factor: Vec3) {
        self.ext_scale = Vec3::new(
            factor.x.max(f64::MIN_POSITIVE),
            factor.y.max(f64::MIN_POSITIVE),
            factor.z.max(f64::MIN_POSITIVE),
        );
    }

    pub fn model(&self) -> &MaterialModel {
        &self.model
    }

    pub fn youngs_modulus(&self) -> f64 {
        self.model.youngs_modulus()
    }

    pub fn poissons_ratio(&self) -> f64 {
        self.nu
    }

    pub fn density(&self) -> f64 {
        self.rho
    }

    pub fn cte(&self) -> f64 {
        self.alpha_cte
    }

    pub fn static_friction(&self) -> f64 {
        self.mu_static
    }

    pub fn kinetic_friction(&self) -> f64 {
        self.mu_kinetic
    }

    pub fn internal_damping(&self) -> f64 {
        self.zeta_internal
    }

    pub fn global_damping(&self) -> f64 {
        self.zeta_global
    }

    pub fn collision_damping(&self) -> f64 {
        self.zeta_collision
    }

    pub fn external_scale_factor(&self) -> Vec3 {
        self.ext_scale
    }

    /// E / ((1 - 2 nu)(1 + nu)), the modulus entering the volumetric stress
    /// term.
    pub fn e_hat(&self) -> f64 {
        self.e_hat
    }

    /// True when deformation along one axis does not couple into the others.
    pub fn is_xyz_independent(&self) -> bool {
        self.nu == 0.0
    }

    pub fn is_failed(&self, strain: f64) -> bool {
        self.model.is_failed(strain)
    }

    pub fn is_yielded(&self, strain: f64) -> bool {
        self.model.is_yielded(strain)
    }

    /// Stress at `strain`, including the volumetric contribution from the sum
    /// of the two transverse Poisson strains.
    ///
    /// `force_linear` evaluates the elastic (first-segment) relation
    /// regardless of the model, used when unloading along the elastic line.
    pub fn stress(&self, strain: f64, transverse_strain_sum: f64, force_linear: bool) -> f64 {
        if self.is_failed(strain) {
            return 0.0;
        }

        if strain <= self.model.first_strain() || self.model.is_linear() || force_linear {
            if self.nu == 0.0 {
                return self.youngs_modulus() * strain;
            }
            return self.e_hat * ((1.0 - self.nu) * strain + self.nu * transverse_strain_sum);
        }

        let basic_stress = self.model.basic_stress(strain);
        if self.nu == 0.0 {
            return basic_stress;
        }
        // volumetric coupling within a nonlinear segment: rescale onto the
        // local secant modulus before applying the volumetric relation
        let modulus = self.model.modulus(strain);
        let modulus_hat = modulus / ((1.0 - 2.0 * self.nu) * (1.0 + self.nu));
        let effective_strain = basic_stress / modulus;
        let effective_transverse = transverse_strain_sum * (effective_strain / strain);
        modulus_hat * ((1.0 - self.nu) * effective_strain + self.nu * effective_transverse)
    }

    /// Secant modulus at `strain`; zero past failure.
    pub fn modulus(&self, strain: f64) -> f64 {
        self.model.modulus(strain)
    }

    /// Strain at which the model reaches `stress`.
    pub fn strain(&self, stress: f64) -> f64 {
        self.model.strain_at_stress(stress)
    }

    fn update_derived(&mut self) {
        self.e_hat = self.youngs_modulus() / ((1.0 - 2.0 * self.nu) * (1.0 + self.nu));
    }
}

impl Validate for Material {
    fn validate(&self) -> Result<()> {
        if self.youngs_modulus() <= 0.0 {
            return Err(IbexError::InvalidMaterial(
                "Young's modulus must be positive".to_string(),
            ));
        }
        if self.rho <= 0.0 {
            return Err(IbexError::InvalidMaterial(
                "Density must be positive".to_string(),
            ));
        }
        if self.nu < 0.0 || self.nu >= 0.5 {
            return Err(IbexError::InvalidMaterial(
                "Poisson's ratio must be in [0, 0.5)".to_string(),
            ));
        }
        if let (Some(eps_y), Some(eps_f)) =
            (self.model.yield_strain(), self.model.failure_strain())
        {
            if eps_f < eps_y {
                return Err(IbexError::InvalidMaterial(
                    "Failure strain must not precede yield strain".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Recognized options when adding a material from a configuration document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MaterialConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub youngs_modulus: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub epsilon_fail: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strain_data: Option<Vec<f64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stress_data: Option<Vec<f64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub density: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub red: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub green: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blue: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alpha: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub poissons_ratio: Option<f64>,
    #[serde(rename = "CTE", skip_serializing_if = "Option::is_none")]
    pub cte: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub static_friction: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kinetic_friction: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub internal_damping: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub global_damping: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub collision_damping: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_scale_factor: Option<[f64; 3]>,
}

impl Material {
    /// Builds a material from a configuration document.
    ///
    /// Either `youngsModulus` (optionally with `epsilonFail`) or matching
    /// `strainData`/`stressData` arrays select the constitutive model.
    pub fn from_config(config: &MaterialConfig) -> Result<Self> {
        let model = if let Some(e) = config.youngs_modulus {
            let failure_stress = config.epsilon_fail.map(|eps| eps * e);
            MaterialModel::linear_failing(e, failure_stress)?
        } else if let (Some(strains), Some(stresses)) = (&config.strain_data, &config.stress_data) {
            MaterialModel::from_data(strains, stresses)?
        } else {
            return Err(IbexError::InvalidMaterial(
                "No constitutive model specified".to_string(),
            ));
        };

        let mut mat = Material::with_model(model, config.density.unwrap_or(1.0))?;
        if let Some(name) = &config.name {
            mat.name = name.clone();
        }
        if config.red.is_some() || config.green.is_some() || config.blue.is_some() {
            mat.color = Some(Color::new(
                config.red.unwrap_or(0),
                config.green.unwrap_or(0),
                config.blue.unwrap_or(0),
                config.alpha.unwrap_or(255),
            ));
        }
        if let Some(nu) = config.poissons_ratio {
            mat.set_poissons_ratio(nu);
        }
        if let Some(cte) = config.cte {
            mat.set_cte(cte);
        }
        if let Some(mu) = config.static_friction {
            mat.set_static_friction(mu);
        }
        if let Some(mu) = config.kinetic_friction {
            mat.set_kinetic_friction(mu);
        }
        if let Some(zeta) = config.internal_damping {
            mat.set_internal_damping(zeta);
        }
        if let Some(zeta) = config.global_damping {
            mat.set_global_damping(zeta);
        }
        if let Some(zeta) = config.collision_damping {
            mat.set_collision_damping(zeta);
        }
        if let Some(factor) = config.external_scale_factor {
            mat.set_external_scale_factor(Vec3::new(factor[0], factor[1], factor[2]));
        }
        Ok(mat)
    }

    /// The configuration document describing this material; defaults are
    /// omitted.
    pub fn to_config(&self) -> MaterialConfig {
        let mut config = MaterialConfig::default();
        match &self.model {
            MaterialModel::Linear {
                youngs_modulus,
                failure_stress,
            } => {
                config.youngs_modulus = Some(*youngs_modulus);
                config.epsilon_fail = failure_stress.map(|sigma| sigma / youngs_modulus);
            }
            MaterialModel::Piecewise {
                strain_data,
                stress_data,
                ..
            } => {
                config.strain_data = Some(strain_data.clone());
                config.stress_data = Some(stress_data.clone());
            }
        }
        if self.rho != 1.0 {
            config.density = Some(self.rho);
        }
        if !self.name.is_empty() {
            config.name = Some(self.name.clone());
        }
        if let Some(color) = self.color {
            config.red = Some(color.r);
            config.green = Some(color.g);
            config.blue = Some(color.b);
            config.alpha = Some(color.a);
        }
        if self.nu != 0.0 {
            config.poissons_ratio = Some(self.nu);
        }
        if self.alpha_cte != 0.0 {
            config.cte = Some(self.alpha_cte);
        }
        if self.mu_static != 0.0 {
            config.static_friction = Some(self.mu_static);
        }
        if self.mu_kinetic != 0.0 {
            config.kinetic_friction = Some(self.mu_kinetic);
        }
        if self.zeta_internal != 1.0 {
            config.internal_damping = Some(self.zeta_internal);
        }
        if self.zeta_global != 0.0 {
            config.global_damping = Some(self.zeta_global);
        }
        if self.zeta_collision != 0.0 {
            config.collision_damping = Some(self.zeta_collision);
        }
        if self.ext_scale != Vec3::new(1.0, 1.0, 1.0) {
            config.external_scale_factor = Some([self.ext_scale.x, self.ext_scale.y, self.ext_scale.z]);
        }
        config
    }
}

/// A material specialized by the nominal voxel edge length, caching mass and
/// damping quantities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoxelMaterial {
    pub material: Material,
    nom_size: f64,
    grav_mult: f64,
    mass: f64,
    mass_inverse: f64,
    sqrt_mass: f64,
    first_moment: f64,
    moment_inertia: f64,
    moment_inertia_inverse: f64,
    // 2*sqrt(m E L) and 2*sqrt(I E L^3), the damping coefficient roots
    two_sq_mass_e_size: f64,
    two_sq_inertia_e_size3: f64,
}

impl VoxelMaterial {
    pub fn new(material: Material, nominal_size: f64) -> Self {
        let mut mat = Self {
            material,
            nom_size: nominal_size,
            grav_mult: 0.0,
            mass: 0.0,
            mass_inverse: 0.0,
            sqrt_mass: 0.0,
            first_moment: 0.0,
            moment_inertia: 0.0,
            moment_inertia_inverse: 0.0,
            two_sq_mass_e_size: 0.0,
            two_sq_inertia_e_size3: 0.0,
        };
        mat.update_derived();
        mat
    }

    pub(crate) fn update_derived(&mut self) {
        let size = self.nom_size;
        let volume = size * size * size;
        self.mass = volume * self.material.density();
        self.moment_inertia = self.mass * size * size / 6.0;
        self.first_moment = self.mass * size / 2.0;

        if volume == 0.0 || self.mass == 0.0 || self.moment_inertia == 0.0 {
            self.mass_inverse = 0.0;
            self.sqrt_mass = 0.0;
            self.moment_inertia_inverse = 0.0;
            self.two_sq_mass_e_size = 0.0;
            self.two_sq_inertia_e_size3 = 0.0;
            return;
        }

        let e = self.material.youngs_modulus();
        self.mass_inverse = 1.0 / self.mass;
        self.sqrt_mass = self.mass.sqrt();
        self.moment_inertia_inverse = 1.0 / self.moment_inertia;
        self.two_sq_mass_e_size = 2.0 * (self.mass * e * size).sqrt();
        self.two_sq_inertia_e_size3 = 2.0 * (self.moment_inertia * e * size * size * size).sqrt();
    }

    pub fn set_nominal_size(&mut self, size: f64) {
        self.nom_size = if size <= 0.0 { f64::MIN_POSITIVE } else { size };
        self.update_derived();
    }

    pub fn set_gravity_multiplier(&mut self, grav_mult: f64) {
        self.grav_mult = grav_mult;
    }

    pub fn nominal_size(&self) -> f64 {
        self.nom_size
    }

    pub fn gravity_multiplier(&self) -> f64 {
        self.grav_mult
    }

    /// Nominal size per axis, including external scale factors.
    pub fn size(&self) -> Vec3 {
        self.material.external_scale_factor() * self.nom_size
    }

    pub fn mass(&self) -> f64 {
        self.mass
    }

    pub fn mass_inverse(&self) -> f64 {
        self.mass_inverse
    }

    pub fn sqrt_mass(&self) -> f64 {
        self.sqrt_mass
    }

    pub fn first_moment(&self) -> f64 {
        self.first_moment
    }

    pub fn moment_inertia(&self) -> f64 {
        self.moment_inertia
    }

    pub fn moment_inertia_inverse(&self) -> f64 {
        self.moment_inertia_inverse
    }

    /// Gravitational force on a voxel of this material (f = m g, downward).
    pub fn gravity_force(&self) -> f64 {
        -self.mass * GRAVITY_ACCELERATION * self.grav_mult
    }

    /// Stiffness resisting penetration: E A / L with L = half the voxel size.
    pub fn penetration_stiffness(&self) -> f64 {
        2.0 * self.material.youngs_modulus() * self.nom_size
    }

    pub fn internal_damping_translate_c(&self) -> f64 {
        self.material.internal_damping() * self.two_sq_mass_e_size
    }

    pub fn global_damping_translate_c(&self) -> f64 {
        self.material.global_damping() * self.two_sq_mass_e_size
    }

    pub fn global_damping_rotate_c(&self) -> f64 {
        self.material.global_damping() * self.two_sq_inertia_e_size3
    }

    pub fn collision_damping_translate_c(&self) -> f64 {
        self.material.collision_damping() * self.two_sq_mass_e_size
    }
}

/// The synthetic material of a link, combining the voxel materials at its two
/// ends and caching the beam stiffness constants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkMaterial {
    pub material: Material,
    nom_size: f64,
    vox1_mat: VoxelMaterialId,
    vox2_mat: VoxelMaterialId,
    // beam element constants for a cubic beam of length L, unit-square section
    a1: f64, // E L     : axial, N/m
    a2: f64, // G J / L : torsion, N-m
    b1: f64, // 12 E I / L^3 : transverse shear, N/m
    b2: f64, // 6 E I / L^2  : shear/bend coupling, N
    b3: f64, // 2 E I / L    : bending, N-m
    // damping roots with sqrt(m) factored out
    sq_a1: f64,
    sq_a2_x_ip: f64,
    sq_b1: f64,
    sq_b2_x_fmp: f64,
    sq_b3_x_ip: f64,
}

impl LinkMaterial {
    /// Combines two voxel materials into the material of the link joining
    /// them: Young's modulus by springs in series (piecewise over the union
    /// of breakpoints), most scalar properties by simple average, and
    /// Poisson's ratio back-solved so the volumetric modulus also composes in
    /// series.
    pub fn combine(
        id1: VoxelMaterialId,
        mat1: &VoxelMaterial,
        id2: VoxelMaterialId,
        mat2: &VoxelMaterial,
    ) -> Result<Self> {
        let m1 = &mat1.material;
        let m2 = &mat2.material;

        // failure stress is the lesser of the two, or absent if neither fails
        let failure_stress = match (m1.model().failure_stress(), m2.model().failure_stress()) {
            (None, f2) => f2,
            (f1, None) => f1,
            (Some(f1), Some(f2)) => Some(f1.min(f2)),
        };

        let model = if m1.model().is_linear() && m2.model().is_linear() {
            let (e1, e2) = (m1.youngs_modulus(), m2.youngs_modulus());
            MaterialModel::linear_failing(2.0 * e1 * e2 / (e1 + e2), failure_stress)?
        } else {
            // walk the union of breakpoints, composing the segment moduli in
            // series
            let (s1, _) = m1.model().data_points();
            let (s2, _) = m2.model().data_points();
            let mut strains = vec![0.0];
            let mut stresses = vec![0.0];
            let (mut it1, mut it2) = (1, 1);
            while it1 < s1.len() && it2 < s2.len() {
                let strain = s1[it1].min(s2[it2]);
                let advance1 = s1[it1] == strain;
                let advance2 = s2[it2] == strain;
                if advance1 {
                    it1 += 1;
                }
                if advance2 {
                    it2 += 1;
                }

                let modulus1 = m1.modulus(strain - f64::EPSILON);
                let modulus2 = m2.modulus(strain - f64::EPSILON);
                let combined = if modulus1 + modulus2 == 0.0 {
                    0.0
                } else {
                    2.0 * modulus1 * modulus2 / (modulus1 + modulus2)
                };

                let last = strains.len() - 1;
                let stress = stresses[last] + combined * (strain - strains[last]);
                strains.push(strain);
                stresses.push(stress);
            }
            MaterialModel::from_data(&strains, &stresses)?.with_failure_stress(failure_stress)
        };

        let mut material = Material::with_model(model, 0.5 * (m1.density() + m2.density()))?;
        material.set_cte(0.5 * (m1.cte() + m2.cte()));
        material.set_static_friction(0.5 * (m1.static_friction() + m2.static_friction()));
        material.set_kinetic_friction(0.5 * (m1.kinetic_friction() + m2.kinetic_friction()));
        material.set_internal_damping(0.5 * (m1.internal_damping() + m2.internal_damping()));
        material.set_global_damping(0.5 * (m1.global_damping() + m2.global_damping()));
        material.set_collision_damping(0.5 * (m1.collision_damping() + m2.collision_damping()));
        if let (Some(c1), Some(c2)) = (m1.color, m2.color) {
            material.color = Some(Color::new(
                ((c1.r as u16 + c2.r as u16) / 2) as u8,
                ((c1.g as u16 + c2.g as u16) / 2) as u8,
                ((c1.b as u16 + c2.b as u16) / 2) as u8,
                ((c1.a as u16 + c2.a as u16) / 2) as u8,
            ));
        }

        // Poisson's ratio chosen so eHat also composes as springs in series:
        // eHat = E/((1-2nu)(1+nu))  ->  nu^2 + 0.5 nu = (eHat - E)/(2 eHat),
        // solved by completing the square.
        if m1.poissons_ratio() != 0.0 || m2.poissons_ratio() != 0.0 {
            let series_e_hat = 2.0 * m1.e_hat() * m2.e_hat() / (m1.e_hat() + m2.e_hat());
            let e = material.youngs_modulus();
            let c2 = (series_e_hat - e) / (2.0 * series_e_hat) + 0.0625;
            material.set_poissons_ratio(c2.max(0.0).sqrt() - 0.25);
        }

        let mut link_mat = Self {
            material,
            nom_size: 0.5 * (mat1.nominal_size() + mat2.nominal_size()),
            vox1_mat: id1,
            vox2_mat: id2,
            a1: 0.0,
            a2: 0.0,
            b1: 0.0,
            b2: 0.0,
            b3: 0.0,
            sq_a1: 0.0,
            sq_a2_x_ip: 0.0,
            sq_b1: 0.0,
            sq_b2_x_fmp: 0.0,
            sq_b3_x_ip: 0.0,
        };
        link_mat.update_derived();
        Ok(link_mat)
    }

    fn update_derived(&mut self) {
        let e = self.material.youngs_modulus();
        let nu = self.material.poissons_ratio();
        let l = self.nom_size;

        self.a1 = e * l;
        self.a2 = e * l * l * l / (12.0 * (1.0 + nu)); // G J / L for G = E/(2(1+nu))
        self.b1 = e * l;
        self.b2 = e * l * l / 2.0;
        self.b3 = e * l * l * l / 6.0;

        self.sq_a1 = self.a1.sqrt();
        self.sq_a2_x_ip = (self.a2 * l * l / 6.0).sqrt();
        self.sq_b1 = self.b1.sqrt();
        self.sq_b2_x_fmp = (self.b2 * l / 2.0).sqrt();
        self.sq_b3_x_ip = (self.b3 * l * l / 6.0).sqrt();
    }

    /// True if this material was combined from the given pair, in either
    /// order.
    pub fn is_combination_of(&self, id1: VoxelMaterialId, id2: VoxelMaterialId) -> bool {
        (self.vox1_mat == id1 && self.vox2_mat == id2)
            || (self.vox1_mat == id2 && self.vox2_mat == id1)
    }

    pub fn constituents(&self) -> (VoxelMaterialId, VoxelMaterialId) {
        (self.vox1_mat, self.vox2_mat)
    }

    pub fn nominal_size(&self) -> f64 {
        self.nom_size
    }

    pub fn a1(&self) -> f64 {
        self.a1
    }

    pub fn a2(&self) -> f64 {
        self.a2
    }

    pub fn b1(&self) -> f64 {
        self.b1
    }

    pub fn b2(&self) -> f64 {
        self.b2
    }

    pub fn b3(&self) -> f64 {
        self.b3
    }

    pub fn sq_a1(&self) -> f64 {
        self.sq_a1
    }

    pub fn sq_a2_x_ip(&self) -> f64 {
        self.sq_a2_x_ip
    }

    pub fn sq_b1(&self) -> f64 {
        self.sq_b1
    }

    pub fn sq_b2_x_fmp(&self) -> f64 {
        self.sq_b2_x_fmp
    }

    pub fn sq_b3_x_ip(&self) -> f64 {
        self.sq_b3_x_ip
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::{assert_abs_diff_eq, assert_relative_eq};

    #[test]
    fn linear_stress_is_e_times_strain() {
        let mat = Material::new(1e6, 1000.0).unwrap();
        assert_eq!(mat.stress(0.0, 0.0, false), 0.0);
        assert_abs_diff_eq!(mat.stress(0.01, 0.0, false), 1e4, epsilon = 1e-6);
        assert_abs_diff_eq!(mat.stress(-0.01, 0.0, false), -1e4, epsilon = 1e-6);
    }

    #[test]
    fn invalid_models_are_rejected() {
        assert!(Material::new(-1.0, 1000.0).is_err());
        assert!(Material::new(1e6, 0.0).is_err());
        assert!(MaterialModel::from_data(&[0.1, 0.05], &[1.0, 2.0]).is_err());
        assert!(MaterialModel::from_data(&[0.1, 0.2], &[2.0, 1.0]).is_err());
        // second segment steeper than the first
        assert!(MaterialModel::from_data(&[0.1, 0.2], &[1.0, 3.0]).is_err());
    }

    #[test]
    fn bilinear_model_interpolates() {
        let model = MaterialModel::bilinear(1.0, 0.5, 1.0, None).unwrap();
        assert_abs_diff_eq!(model.basic_stress(0.5), 0.5, epsilon = 1e-12);
        assert_abs_diff_eq!(model.basic_stress(1.0), 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(model.basic_stress(1.5), 1.25, epsilon = 1e-12);
        assert_abs_diff_eq!(model.modulus(1.5), 0.5, epsilon = 1e-12);
        assert_eq!(model.yield_strain(), Some(1.0));
        assert!(!model.is_failed(10.0));
    }

    #[test]
    fn piecewise_yield_from_offset() {
        // three-segment model softening toward a plateau
        let model =
            MaterialModel::from_data(&[0.01, 0.02, 0.05], &[100.0, 150.0, 160.0]).unwrap();
        let eps_y = model.yield_strain().unwrap();
        assert!(eps_y > 0.01 && eps_y < 0.05, "yield at {}", eps_y);
        assert_eq!(model.failure_strain(), Some(0.05));
        assert!(model.is_failed(0.06));
    }

    #[test]
    fn failed_material_returns_zero_stress() {
        let model = MaterialModel::linear_failing(1e6, Some(1e4)).unwrap();
        let mat = Material::with_model(model, 1000.0).unwrap();
        assert_eq!(mat.stress(0.02, 0.0, false), 0.0);
        assert_eq!(mat.modulus(0.02), 0.0);
    }

    #[test]
    fn volumetric_stress_term() {
        let mat = Material::new(1e6, 1000.0)
            .unwrap()
            .with_poissons_ratio(0.3);
        let e_hat = 1e6 / ((1.0 - 0.6) * 1.3);
        assert_abs_diff_eq!(mat.e_hat(), e_hat, epsilon = 1e-6);
        let sigma = mat.stress(0.01, -0.004, false);
        assert_abs_diff_eq!(
            sigma,
            e_hat * (0.7 * 0.01 + 0.3 * (-0.004)),
            epsilon = 1e-9
        );
    }

    #[test]
    fn combined_linear_materials_are_springs_in_series() {
        let m1 = VoxelMaterial::new(Material::new(1e6, 1000.0).unwrap(), 0.001);
        let m2 = VoxelMaterial::new(Material::new(3e6, 1000.0).unwrap(), 0.001);
        let combined =
            LinkMaterial::combine(VoxelMaterialId(0), &m1, VoxelMaterialId(1), &m2).unwrap();
        let expected = 2.0 * 1e6 * 3e6 / (1e6 + 3e6);
        assert_relative_eq!(
            combined.material.youngs_modulus(),
            expected,
            max_relative = 1e-12
        );
    }

    #[test]
    fn combined_identical_materials_preserve_modulus() {
        let m = VoxelMaterial::new(
            Material::new(1e6, 1000.0).unwrap().with_poissons_ratio(0.3),
            0.001,
        );
        let combined =
            LinkMaterial::combine(VoxelMaterialId(0), &m, VoxelMaterialId(0), &m).unwrap();
        assert_relative_eq!(combined.material.youngs_modulus(), 1e6, max_relative = 1e-9);
        assert_relative_eq!(
            combined.material.poissons_ratio(),
            0.3,
            max_relative = 1e-6
        );
    }

    #[test]
    fn beam_constants_for_unit_cube() {
        let m = VoxelMaterial::new(Material::new(1e6, 1000.0).unwrap(), 0.001);
        let lm = LinkMaterial::combine(VoxelMaterialId(0), &m, VoxelMaterialId(0), &m).unwrap();
        let (e, l) = (1e6, 0.001);
        assert_relative_eq!(lm.a1(), e * l, max_relative = 1e-12);
        assert_relative_eq!(lm.a2(), e * l * l * l / 12.0, max_relative = 1e-12);
        assert_relative_eq!(lm.b1(), e * l, max_relative = 1e-12);
        assert_relative_eq!(lm.b2(), e * l * l / 2.0, max_relative = 1e-12);
        assert_relative_eq!(lm.b3(), e * l * l * l / 6.0, max_relative = 1e-12);
    }

    #[test]
    fn voxel_material_derived_quantities() {
        let m = VoxelMaterial::new(Material::new(1e6, 1000.0).unwrap(), 0.001);
        assert_abs_diff_eq!(m.mass(), 1e-6, epsilon = 1e-18);
        assert_abs_diff_eq!(m.moment_inertia(), 1e-6 * 1e-6 / 6.0, epsilon = 1e-24);
        assert_abs_diff_eq!(m.first_moment(), 1e-6 * 0.001 / 2.0, epsilon = 1e-18);
        assert_abs_diff_eq!(m.penetration_stiffness(), 2000.0, epsilon = 1e-9);
    }

    #[test]
    fn config_round_trip() {
        let mat = Material::new(2e6, 1500.0)
            .unwrap()
            .with_name("rubber")
            .with_poissons_ratio(0.45)
            .with_static_friction(0.8);
        let config = mat.to_config();
        let back = Material::from_config(&config).unwrap();
        assert_eq!(back.name, "rubber");
        assert_abs_diff_eq!(back.youngs_modulus(), 2e6, epsilon = 1e-6);
        assert_abs_diff_eq!(back.poissons_ratio(), 0.45, epsilon = 1e-12);
        assert_abs_diff_eq!(back.static_friction(), 0.8, epsilon = 1e-12);
    }
}
