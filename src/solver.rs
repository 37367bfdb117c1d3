//! One-shot linearized direct solver for static equilibrium
//!
//! Assembles the 6N x 6N symmetric stiffness matrix of the lattice in
//! compressed sparse row form (upper triangle, diagonal first in each row),
//! eliminates prescribed degrees of freedom, and hands the 1-based system to
//! a sparse symmetric backend. The solution vector is written back into the
//! voxel poses with all momenta zeroed.
//!
//! Progress is published through monotonically increasing atomic counters
//! that a concurrent observer may poll without synchronization; the solve
//! honors a cooperatively-checked cancel flag.

use crate::error::{IbexError, Result};
use crate::external::{DofFlags, X_ROTATE, X_TRANSLATE, Y_ROTATE, Y_TRANSLATE, Z_ROTATE, Z_TRANSLATE};
use crate::lattice::{vmat, vox, Lattice};
use crate::link::Axis;
use crate::math::{quat_from_rotation_vector, rotation_vector, Vec3};
use crate::voxel::VoxelId;
use log::info;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

// column offsets of the 6x6 diagonal block couplings, per DOF
static BLOCK_OFF: [[usize; 3]; 6] = [
    [0, 4, 5],
    [1, 3, 5],
    [2, 3, 4],
    [1, 2, 3],
    [0, 2, 4],
    [0, 1, 5],
];

static DOF_MAP: [DofFlags; 6] = [
    X_TRANSLATE,
    Y_TRANSLATE,
    Z_TRANSLATE,
    X_ROTATE,
    Y_ROTATE,
    Z_ROTATE,
];

// error codes reported by the sparse backend
const CODE_NOT_CONVERGED: i32 = -1;
const CODE_ZERO_PIVOT: i32 = -4;
const CODE_CANCELLED: i32 = -11;

/// Shared progress and cancellation state of a running solve.
///
/// `tick` counts up to 100; readers may poll it relaxed from another thread.
#[derive(Debug, Default)]
pub struct SolverProgress {
    tick: AtomicUsize,
    cancel: AtomicBool,
}

impl SolverProgress {
    pub fn new() -> Self {
        Self::default()
    }

    /// Completed fraction of the solve, in [0, 1].
    pub fn fraction(&self) -> f64 {
        self.tick.load(Ordering::Relaxed) as f64 / 100.0
    }

    /// Requests a cooperative cancellation.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    fn update(&self, fraction: f64) {
        let tick = (fraction * 100.0) as usize;
        if tick > self.tick.load(Ordering::Relaxed) {
            self.tick.store(tick, Ordering::Relaxed);
        }
    }
}

/// Builds and solves the linearized static system of a lattice.
#[derive(Debug)]
pub struct LinearSolver {
    dof: usize,
    ia: Vec<usize>,
    ja: Vec<usize>,
    a: Vec<f64>,
    b: Vec<f64>,
    x: Vec<f64>,
    pub progress: Arc<SolverProgress>,
}

impl Default for LinearSolver {
    fn default() -> Self {
        Self::new()
    }
}

impl LinearSolver {
    pub fn new() -> Self {
        Self {
            dof: 0,
            ia: Vec::new(),
            ja: Vec::new(),
            a: Vec::new(),
            b: Vec::new(),
            x: Vec::new(),
            progress: Arc::new(SolverProgress::new()),
        }
    }

    /// Formulates and solves the system, writing results into the lattice.
    pub fn solve(&mut self, lattice: &mut Lattice) -> Result<()> {
        self.progress.update(0.0);

        let voxel_ids: Vec<VoxelId> = lattice.voxels().map(|(id, _)| id).collect();
        self.dof = voxel_ids.len() * 6;
        if self.dof == 0 {
            return Err(IbexError::ValidationError(
                "Lattice has no voxels to solve".to_string(),
            ));
        }
        info!("linear solve: {} degrees of freedom", self.dof);

        self.calculate_a(lattice, &voxel_ids);
        self.apply_bx(lattice, &voxel_ids);
        self.convert_to_1_base();

        if self.progress.is_cancelled() {
            return Err(IbexError::SolverCancelled);
        }

        self.progress.update(0.05);
        match solve_symmetric_csr(self.dof, &self.ia, &self.ja, &self.a, &self.b, &self.progress) {
            Ok(solution) => self.x = solution,
            Err(CODE_CANCELLED) => return Err(IbexError::SolverCancelled),
            Err(code) => return Err(IbexError::SolverFailure(code)),
        }

        self.progress.update(0.9);
        self.post_results(lattice, &voxel_ids);
        self.progress.update(1.0);
        info!("linear solve complete");
        Ok(())
    }

    // Builds the sparsity pattern and fills in the beam stiffness terms.
    fn calculate_a(&mut self, lattice: &Lattice, voxel_ids: &[VoxelId]) {
        let v_count = voxel_ids.len();
        let l_count = lattice.link_count();
        // overestimate of the nonzero count
        let n_a = 12 * v_count + 18 * l_count;

        // reverse lookup from arena handle to dense solver index
        let arena_len = lattice.arena_voxels().len();
        let mut v2i = vec![usize::MAX; arena_len];
        for (dense, vid) in voxel_ids.iter().enumerate() {
            v2i[vid.0] = dense;
        }

        self.ia = vec![0; self.dof + 1];
        self.ja = vec![0; n_a];
        self.a = vec![0.0; n_a];

        let voxels = lattice.arena_voxels();
        let links = lattice.arena_links();

        let mut ia_counter = 1;
        let mut ja_counter = 0;

        for (i, &vid) in voxel_ids.iter().enumerate() {
            let voxel = vox(voxels, vid);

            // dense indices of connected voxels above this one
            let mut i2_list: Vec<usize> = Vec::new();
            for direction in crate::voxel::LinkDirection::ALL {
                let Some(lid) = voxel.link(direction) else {
                    continue;
                };
                let Some(link) = links[lid.0].as_ref() else {
                    continue;
                };
                let other = if link.voxel(true) == vid {
                    link.voxel(false)
                } else {
                    link.voxel(true)
                };
                let i2 = v2i[other.0];
                if i2 > i && i2 != usize::MAX {
                    i2_list.push(i2);
                }
            }
            i2_list.sort_unstable();

            for j in 0..6 {
                let diag_a_index = ja_counter;

                // diagonal block: the diagonal element plus two off-diagonal
                // couplings for the translational DOFs
                self.ja[ja_counter] = 6 * i + j;
                ja_counter += 1;
                if j < 3 {
                    self.ja[ja_counter] = 6 * i + BLOCK_OFF[j][1];
                    ja_counter += 1;
                    self.ja[ja_counter] = 6 * i + BLOCK_OFF[j][2];
                    ja_counter += 1;
                }

                // off-diagonal blocks toward each connected higher voxel
                for &i2 in &i2_list {
                    for k in 0..3 {
                        self.ja[ja_counter] = 6 * i2 + BLOCK_OFF[j][k];
                        ja_counter += 1;
                    }
                }

                self.ia[ia_counter] = self.ia[ia_counter - 1] + (ja_counter - diag_a_index);
                ia_counter += 1;
            }
        }

        // beam stiffness contributions per link
        let link_mats = lattice.arena_link_mats();
        for link in links.iter().flatten() {
            let lmat = &link_mats[link.material().0];
            let mut i1 = v2i[link.voxel(true).0];
            let mut i2 = v2i[link.voxel(false).0];
            if i1 > i2 {
                std::mem::swap(&mut i1, &mut i2);
            }
            let ax = link.axis().index();
            let (a1, a2, b1, b2, b3) = (lmat.a1(), lmat.a2(), lmat.b1(), lmat.b2(), lmat.b3());

            for j in 0..6 {
                let row1 = i1 * 6 + j;
                let row2 = i2 * 6 + j;
                if j < 3 {
                    let diag_d = if ax == j { a1 } else { b1 };
                    self.add_a_value(row1, row1, diag_d);
                    self.add_a_value(row1, row2, -diag_d);
                    self.add_a_value(row2, row2, diag_d);
                } else {
                    let diag_d = if ax == j % 3 { a2 } else { 2.0 * b3 };
                    let diag_o = if ax == j % 3 { -a2 } else { b3 };
                    self.add_a_value(row1, row1, diag_d);
                    self.add_a_value(row1, row2, diag_o);
                    self.add_a_value(row2, row2, diag_d);
                }
            }

            // shear/bending cross couplings; the layout depends on the axis
            let (r1, c1, r2, c2, val) = match link.axis() {
                Axis::X => (1, 5, 2, 4, b2),
                Axis::Y => (0, 5, 2, 3, -b2),
                Axis::Z => (0, 4, 1, 3, b2),
            };

            self.add_a_value(i1 * 6 + r1, i1 * 6 + c1, val);
            self.add_a_value(i1 * 6 + r1, i2 * 6 + c1, val);
            self.add_a_value(i1 * 6 + c1, i2 * 6 + r1, -val);
            self.add_a_value(i2 * 6 + r1, i2 * 6 + c1, -val);

            self.add_a_value(i1 * 6 + r2, i1 * 6 + c2, -val);
            self.add_a_value(i1 * 6 + r2, i2 * 6 + c2, -val);
            self.add_a_value(i1 * 6 + c2, i2 * 6 + r2, val);
            self.add_a_value(i2 * 6 + r2, i2 * 6 + c2, val);
        }

        self.consolidate_a();
    }

    // Accumulates into an entry already present in the sparsity pattern;
    // silently drops positions outside it.
    fn add_a_value(&mut self, row: usize, column: usize, value: f64) {
        let mut cur = self.ia[row];
        let end = self.ia[row + 1];
        while self.ja[cur] != column {
            cur += 1;
            if cur == end {
                return;
            }
        }
        self.a[cur] += value;
    }

    // Drops zero entries, keeping each row's diagonal so that prescribed-DOF
    // elimination always has a pivot position.
    fn consolidate_a(&mut self) {
        let mut new_ia = vec![0usize; self.dof + 1];
        let mut new_ja = Vec::with_capacity(self.ja.len());
        let mut new_a = Vec::with_capacity(self.a.len());
        for row in 0..self.dof {
            for k in self.ia[row]..self.ia[row + 1] {
                if self.a[k] != 0.0 || self.ja[k] == row {
                    new_ja.push(self.ja[k]);
                    new_a.push(self.a[k]);
                }
            }
            new_ia[row + 1] = new_ja.len();
        }
        self.ia = new_ia;
        self.ja = new_ja;
        self.a = new_a;
    }

    // Builds b and x, then eliminates the fixed degrees of freedom: for each
    // fixed DOF d with prescribed value x_d, subtract x_d times its matrix
    // column from b, then reduce row and column d to an identity row with
    // b[d] = x_d.
    fn apply_bx(&mut self, lattice: &Lattice, voxel_ids: &[VoxelId]) {
        self.x = vec![0.0; self.dof];
        self.b = vec![0.0; self.dof];
        let mut a_to_zero: Vec<usize> = Vec::new();
        let mut fixed = vec![false; self.dof];

        let voxels = lattice.arena_voxels();
        let mats = lattice.arena_voxel_mats();

        for (i, &vid) in voxel_ids.iter().enumerate() {
            let voxel = vox(voxels, vid);
            let mat = vmat(mats, voxel.material());
            let displacement = voxel.displacement(mat);
            let angle = if voxel.orientation().w == 1.0 {
                Vec3::zeros()
            } else {
                rotation_vector(&voxel.orientation())
            };
            let ext = voxel.external();
            let force = ext.map_or_else(Vec3::zeros, |e| e.force());
            let moment = ext.map_or_else(Vec3::zeros, |e| e.moment());

            for j in 0..6 {
                let this_dof = 6 * i + j;
                let is_fixed = ext.is_some_and(|e| e.is_fixed(DOF_MAP[j]));
                fixed[this_dof] = is_fixed;
                self.x[this_dof] = if is_fixed {
                    // prescribed displacement
                    match j {
                        0..=2 => ext.map_or(0.0, |e| e.translation()[j]),
                        _ => ext.map_or(0.0, |e| e.rotation()[j % 3]),
                    }
                } else if j < 3 {
                    displacement[j]
                } else {
                    angle[j % 3]
                };
                if !is_fixed {
                    self.b[this_dof] = if j < 3 { force[j] } else { moment[j % 3] };
                }
            }
        }

        // move the prescribed displacements to the right hand side, marking
        // the coupled entries for zeroing (deferred: an entry may serve two
        // fixed DOFs)
        for this_dof in 0..self.dof {
            if !fixed[this_dof] {
                continue;
            }
            let mut dof_counter = 0;
            for k in 0..self.ia[this_dof + 1] {
                let this_row = k >= self.ia[this_dof];
                if this_row {
                    dof_counter = self.ja[k];
                }
                if k == self.ia[dof_counter + 1] {
                    dof_counter += 1;
                }
                if self.ja[k] == this_dof || this_row {
                    self.b[dof_counter] -= self.x[this_dof] * self.a[k];
                    if k != self.ia[this_dof] {
                        a_to_zero.push(k);
                    }
                }
            }
        }

        for this_dof in 0..self.dof {
            if fixed[this_dof] {
                self.a[self.ia[this_dof]] = 1.0;
                self.b[this_dof] = self.x[this_dof];
            }
        }
        for k in a_to_zero {
            self.a[k] = 0.0;
        }
    }

    fn convert_to_1_base(&mut self) {
        for value in &mut self.ia {
            *value += 1;
        }
        for value in &mut self.ja {
            *value += 1;
        }
    }

    // Writes the solution back: displacements into positions, rotation
    // vectors into orientations, momenta zeroed.
    fn post_results(&self, lattice: &mut Lattice, voxel_ids: &[VoxelId]) {
        let originals: Vec<Vec3> = voxel_ids
            .iter()
            .map(|&vid| {
                let voxel = vox(lattice.arena_voxels(), vid);
                voxel.original_position(vmat(lattice.arena_voxel_mats(), voxel.material()))
            })
            .collect();

        let voxels = lattice.arena_voxels_mut();
        for (i, &vid) in voxel_ids.iter().enumerate() {
            if let Some(voxel) = voxels[vid.0].as_mut() {
                voxel.pos = originals[i]
                    + Vec3::new(self.x[6 * i], self.x[6 * i + 1], self.x[6 * i + 2]);
                voxel.orient = quat_from_rotation_vector(&Vec3::new(
                    self.x[6 * i + 3],
                    self.x[6 * i + 4],
                    self.x[6 * i + 5],
                ));
                voxel.halt_motion();
            }
        }
    }
}

// Sparse symmetric backend: Jacobi-preconditioned conjugate gradient over the
// 1-based upper-triangular CSR system produced by the assembly.
fn solve_symmetric_csr(
    dof: usize,
    ia: &[usize],
    ja: &[usize],
    a: &[f64],
    b: &[f64],
    progress: &SolverProgress,
) -> std::result::Result<Vec<f64>, i32> {
    // the diagonal leads each row by construction
    let mut diag = vec![0.0; dof];
    for row in 0..dof {
        let d = a[ia[row] - 1];
        if d == 0.0 {
            return Err(CODE_ZERO_PIVOT);
        }
        diag[row] = d;
    }

    let matvec = |x: &[f64], y: &mut [f64]| {
        y.iter_mut().for_each(|v| *v = 0.0);
        for row in 0..dof {
            for k in ia[row] - 1..ia[row + 1] - 1 {
                let col = ja[k] - 1;
                let value = a[k];
                y[row] += value * x[col];
                if col != row {
                    y[col] += value * x[row];
                }
            }
        }
    };

    let b_norm = b.iter().map(|v| v * v).sum::<f64>().sqrt();
    if b_norm == 0.0 {
        return Ok(vec![0.0; dof]);
    }
    let tolerance = 1e-12 * b_norm;
    let max_iterations = 20 * dof + 1000;

    let mut x = vec![0.0; dof];
    let mut r = b.to_vec();
    let mut z: Vec<f64> = r.iter().zip(&diag).map(|(ri, di)| ri / di).collect();
    let mut p = z.clone();
    let mut ap = vec![0.0; dof];
    let mut r_dot_z: f64 = r.iter().zip(&z).map(|(a, b)| a * b).sum();

    for iteration in 0..max_iterations {
        if progress.is_cancelled() {
            return Err(CODE_CANCELLED);
        }
        if iteration % 64 == 0 {
            progress.update(0.05 + 0.85 * iteration as f64 / max_iterations as f64);
        }

        matvec(&p, &mut ap);
        let p_dot_ap: f64 = p.iter().zip(&ap).map(|(a, b)| a * b).sum();
        if p_dot_ap == 0.0 {
            return Err(CODE_ZERO_PIVOT);
        }
        let alpha = r_dot_z / p_dot_ap;

        for i in 0..dof {
            x[i] += alpha * p[i];
            r[i] -= alpha * ap[i];
        }

        let r_norm = r.iter().map(|v| v * v).sum::<f64>().sqrt();
        if r_norm < tolerance {
            return Ok(x);
        }

        for i in 0..dof {
            z[i] = r[i] / diag[i];
        }
        let r_dot_z_new: f64 = r.iter().zip(&z).map(|(a, b)| a * b).sum();
        let beta = r_dot_z_new / r_dot_z;
        r_dot_z = r_dot_z_new;
        for i in 0..dof {
            p[i] = z[i] + beta * p[i];
        }
    }

    Err(CODE_NOT_CONVERGED)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::DOF_ALL;
    use approx::assert_abs_diff_eq;

    #[test]
    fn axial_pull_solves_to_analytic_displacement() {
        let mut lattice = Lattice::new(0.001);
        let mat = lattice.add_material(1e6, 1000.0).unwrap();
        let v0 = lattice.set_voxel(mat, 0, 0, 0).unwrap();
        let v1 = lattice.set_voxel(mat, 1, 0, 0).unwrap();

        lattice
            .external(v0)
            .unwrap()
            .set_fixed(true, true, true, true, true, true);
        lattice
            .external(v1)
            .unwrap()
            .set_force(Vec3::new(1e-3, 0.0, 0.0));

        lattice.do_linear_solve().unwrap();

        // k = E L = 1000 N/m, so x = F/k = 1e-6 m
        let disp = lattice.voxel_displacement(v1).unwrap();
        assert_abs_diff_eq!(disp.x, 1e-6, epsilon = 1e-10);
        assert_abs_diff_eq!(disp.y, 0.0, epsilon = 1e-10);
        assert_eq!(lattice.voxel_velocity(v1).unwrap().norm(), 0.0);
    }

    #[test]
    fn prescribed_displacement_is_enforced() {
        let mut lattice = Lattice::new(0.001);
        let mat = lattice.add_material(1e6, 1000.0).unwrap();
        let v0 = lattice.set_voxel(mat, 0, 0, 0).unwrap();
        let v1 = lattice.set_voxel(mat, 1, 0, 0).unwrap();

        lattice
            .external(v0)
            .unwrap()
            .set_fixed(true, true, true, true, true, true);
        let ext1 = lattice.external(v1).unwrap();
        ext1.set_displacement(crate::external::X_TRANSLATE, 2e-6);
        ext1.set_displacement(
            crate::external::Y_TRANSLATE
                | crate::external::Z_TRANSLATE
                | crate::external::X_ROTATE
                | crate::external::Y_ROTATE
                | crate::external::Z_ROTATE,
            0.0,
        );
        assert!(lattice.voxel(v1).unwrap().external().unwrap().is_fixed(DOF_ALL));

        lattice.do_linear_solve().unwrap();
        let disp = lattice.voxel_displacement(v1).unwrap();
        assert_abs_diff_eq!(disp.x, 2e-6, epsilon = 1e-12);
    }

    #[test]
    fn assembly_row_layout_has_diagonal_first() {
        let mut lattice = Lattice::new(0.001);
        let mat = lattice.add_material(1e6, 1000.0).unwrap();
        lattice.set_voxel(mat, 0, 0, 0).unwrap();
        lattice.set_voxel(mat, 1, 0, 0).unwrap();

        let voxel_ids: Vec<VoxelId> = lattice.voxels().map(|(id, _)| id).collect();
        let mut solver = LinearSolver::new();
        solver.dof = voxel_ids.len() * 6;
        solver.calculate_a(&lattice, &voxel_ids);

        // upper triangle with the diagonal leading each row
        for row in 0..solver.dof {
            assert_eq!(solver.ja[solver.ia[row]], row);
            for k in solver.ia[row]..solver.ia[row + 1] {
                assert!(solver.ja[k] >= row);
            }
        }
        // axial diagonal of voxel 0 x-translation carries a1 = E L
        assert_abs_diff_eq!(solver.a[solver.ia[0]], 1000.0, epsilon = 1e-9);
    }

    #[test]
    fn cancelled_solve_reports_cancellation() {
        let mut lattice = Lattice::new(0.001);
        let mat = lattice.add_material(1e6, 1000.0).unwrap();
        let v0 = lattice.set_voxel(mat, 0, 0, 0).unwrap();
        lattice.set_voxel(mat, 1, 0, 0).unwrap();
        lattice
            .external(v0)
            .unwrap()
            .set_fixed(true, true, true, true, true, true);

        let mut solver = LinearSolver::new();
        solver.progress.cancel();
        assert!(matches!(
            solver.solve(&mut lattice),
            Err(IbexError::SolverCancelled)
        ));
    }
}
