//! Structural invariants of the voxel lattice

use approx::assert_relative_eq;
use ibex::prelude::*;

fn cube_lattice(n: i32) -> (Lattice, VoxelMaterialId) {
    let mut lattice = Lattice::new(0.001);
    let mat = lattice.add_material(1e6, 1000.0).unwrap();
    for z in 0..n {
        for y in 0..n {
            for x in 0..n {
                lattice.set_voxel(mat, x, y, z).unwrap();
            }
        }
    }
    (lattice, mat)
}

#[test]
fn links_connect_lattice_neighbours() {
    let (lattice, _) = cube_lattice(3);
    assert_eq!(lattice.voxel_count(), 27);
    // 3 axes x 2 links per row x 9 rows
    assert_eq!(lattice.link_count(), 54);

    for (_, link) in lattice.links() {
        let neg = lattice.voxel(link.voxel(false)).unwrap();
        let pos = lattice.voxel(link.voxel(true)).unwrap();
        let neg_index = [neg.index_x(), neg.index_y(), neg.index_z()];
        let pos_index = [pos.index_x(), pos.index_y(), pos.index_z()];
        let axis = link.axis().index();
        for a in 0..3 {
            if a == axis {
                assert_eq!(pos_index[a], neg_index[a] + 1);
            } else {
                assert_eq!(pos_index[a], neg_index[a]);
            }
        }
    }
}

#[test]
fn link_back_references_agree() {
    let (lattice, _) = cube_lattice(3);

    for (vid, voxel) in lattice.voxels() {
        for direction in LinkDirection::ALL {
            if let Some(lid) = voxel.link(direction) {
                let link = lattice.link(lid).unwrap();
                // the voxel holding a link in a positive direction is that
                // link's negative end, and vice versa
                assert_eq!(link.voxel(direction.is_negative()), vid);
            }
        }
    }
}

#[test]
fn surface_iff_any_open_face() {
    let (lattice, _) = cube_lattice(3);

    for (_, voxel) in lattice.voxels() {
        let open_faces = 6 - voxel.link_count();
        assert_eq!(voxel.is_surface(), open_faces > 0);
    }
    // only the center voxel of a 3x3x3 cube is interior
    let interior = lattice.voxels().filter(|(_, v)| v.is_interior()).count();
    assert_eq!(interior, 1);
    let center = lattice.voxel_at(1, 1, 1).unwrap();
    assert!(lattice.voxel(center).unwrap().is_interior());
}

#[test]
fn combined_link_material_is_springs_in_series() {
    let mut lattice = Lattice::new(0.001);
    let soft = lattice.add_material(1e6, 1000.0).unwrap();
    let stiff = lattice.add_material(4e6, 1000.0).unwrap();
    lattice.set_voxel(soft, 0, 0, 0).unwrap();
    lattice.set_voxel(stiff, 1, 0, 0).unwrap();

    let (_, link) = lattice.links().next().unwrap();
    let lmat = lattice.link_material(link.material()).unwrap();
    let expected = 2.0 * 1e6 * 4e6 / (1e6 + 4e6);
    assert_relative_eq!(
        lmat.material.youngs_modulus(),
        expected,
        max_relative = 1e-12
    );
}

#[test]
fn reset_time_restores_unstressed_state() {
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
        .set_force(Vec3::new(2e-3, 0.0, 0.0));

    for _ in 0..200 {
        lattice.do_time_step(-1.0).unwrap();
    }
    assert!(lattice.voxel_displacement(v1).unwrap().norm() > 1e-7);

    lattice.reset_time();
    assert_eq!(lattice.current_time(), 0.0);
    for (vid, voxel) in lattice.voxels() {
        assert_eq!(lattice.voxel_displacement(vid).unwrap().norm(), 0.0);
        assert_eq!(lattice.voxel_velocity(vid).unwrap().norm(), 0.0);
        assert_eq!(voxel.orientation().w, 1.0);
    }
    for (_, link) in lattice.links() {
        assert_eq!(link.axial_strain(), 0.0);
        assert_eq!(link.axial_stress(), 0.0);
        assert_eq!(link.force(false).norm(), 0.0);
        assert_eq!(link.moment(false).norm(), 0.0);
    }
}

// An undamped cantilever driven at its tip must oscillate without growth for
// a long run at the recommended time step.
#[test]
fn recommended_time_step_is_stable_undamped() {
    let mut lattice = Lattice::new(0.001);
    let mat = lattice.add_material_object(
        Material::new(1e6, 1000.0)
            .unwrap()
            .with_internal_damping(0.0)
            .with_global_damping(0.0),
    );
    for i in 0..3 {
        lattice.set_voxel(mat, i, 0, 0).unwrap();
    }
    let base = lattice.voxel_at(0, 0, 0).unwrap();
    let tip = lattice.voxel_at(2, 0, 0).unwrap();
    lattice
        .external(base)
        .unwrap()
        .set_fixed(true, true, true, true, true, true);
    lattice
        .external(tip)
        .unwrap()
        .set_force(Vec3::new(0.0, 0.0, 1e-6));

    // static tip deflection of the equivalent two-element cantilever
    let e: f64 = 1e6;
    let l: f64 = 0.001;
    let inertia = l * l * l * l / 12.0;
    let length: f64 = 2.0 * l;
    let static_deflection = 1e-6 * length.powi(3) / (3.0 * e * inertia);

    let dt = lattice.recommended_time_step();
    let mut max_tip = 0.0f64;
    for _ in 0..10_000 {
        lattice.do_time_step(dt).unwrap();
        let z = lattice.voxel_displacement(tip).unwrap().z;
        assert!(z.is_finite());
        max_tip = max_tip.max(z.abs());
    }

    // undamped step loading overshoots to at most twice the static value;
    // anything beyond that indicates growing amplitude
    assert!(
        max_tip < 2.5 * static_deflection,
        "tip reached {:.3e}, static value {:.3e}",
        max_tip,
        static_deflection
    );
    assert!(max_tip > 0.5 * static_deflection);
}
