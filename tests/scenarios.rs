//! End-to-end simulation scenarios with analytic expectations

use approx::{assert_abs_diff_eq, assert_relative_eq};
use ibex::materials::GRAVITY_ACCELERATION;
use ibex::prelude::*;

// 1 mm voxels of soft rubber: E = 1 MPa, rho = 1000 kg/m^3, critically-ish
// damped internally with light global damping
fn soft_material() -> Material {
    Material::new(1e6, 1000.0)
        .unwrap()
        .with_internal_damping(1.0)
        .with_global_damping(0.2)
}

#[test]
fn axial_pull_reaches_analytic_equilibrium() {
    let mut lattice = Lattice::new(0.001);
    let mat = lattice.add_material_object(soft_material());
    let fixed = lattice.set_voxel(mat, 0, 0, 0).unwrap();
    let pulled = lattice.set_voxel(mat, 1, 0, 0).unwrap();

    lattice
        .external(fixed)
        .unwrap()
        .set_fixed(true, true, true, true, true, true);
    lattice
        .external(pulled)
        .unwrap()
        .set_force(Vec3::new(1e-3, 0.0, 0.0));

    for _ in 0..1000 {
        lattice.do_time_step(-1.0).unwrap();
    }

    // axial link stiffness k = E L = 1000 N/m: x = F/k = 1e-6 m
    let disp = lattice.voxel_displacement(pulled).unwrap();
    assert_relative_eq!(disp.x, 1e-6, max_relative = 0.01);
    assert_abs_diff_eq!(disp.y, 0.0, epsilon = 1e-12);
    assert_abs_diff_eq!(disp.z, 0.0, epsilon = 1e-12);
}

#[test]
fn transverse_shear_splits_between_guided_ends() {
    let mut lattice = Lattice::new(0.001);
    let mat = lattice.add_material_object(soft_material());
    let v0 = lattice.set_voxel(mat, 0, 0, 0).unwrap();
    let v1 = lattice.set_voxel(mat, 1, 0, 0).unwrap();

    // guided ends: rotations held, translations free, equal and opposite
    // transverse forces
    let ext0 = lattice.external(v0).unwrap();
    ext0.set_fixed(false, false, false, true, true, true);
    ext0.set_force(Vec3::new(0.0, -1e-3, 0.0));
    let ext1 = lattice.external(v1).unwrap();
    ext1.set_fixed(false, false, false, true, true, true);
    ext1.set_force(Vec3::new(0.0, 1e-3, 0.0));

    for _ in 0..1000 {
        lattice.do_time_step(-1.0).unwrap();
    }

    // shear stiffness b1 = E L = 1000 N/m across the bond; the relative
    // deflection F/b1 = 1e-6 m splits evenly between the two free ends
    let disp1 = lattice.voxel_displacement(v1).unwrap();
    assert_relative_eq!(disp1.y, 5e-7, max_relative = 0.02);
    let disp0 = lattice.voxel_displacement(v0).unwrap();
    assert_relative_eq!(disp0.y, -5e-7, max_relative = 0.02);
}

#[test]
fn cantilever_tip_deflection_matches_beam_theory() {
    let mut lattice = Lattice::new(0.001);
    let mat = lattice.add_material_object(soft_material());
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

    for _ in 0..3000 {
        lattice.do_time_step(-1.0).unwrap();
    }

    // F L^3 / (3 E I) for a beam of length 2 voxels with unit-square
    // cross-section inertia I = a^4/12; cubic beam elements make the
    // discrete chain nodally exact
    let e: f64 = 1e6;
    let a: f64 = 0.001;
    let inertia = a * a * a * a / 12.0;
    let length: f64 = 2.0 * a;
    let expected = 1e-6 * length.powi(3) / (3.0 * e * inertia);

    let disp = lattice.voxel_displacement(tip).unwrap();
    assert_relative_eq!(disp.z, expected, max_relative = 0.03);
}

#[test]
fn poisson_contraction_of_stretched_block() {
    let mut lattice = Lattice::new(0.001);
    let mat = lattice.add_material_object(soft_material().with_poissons_ratio(0.3));

    // 9 voxels long in x, 2x2 cross-section
    for x in 0..9 {
        for y in 0..2 {
            for z in 0..2 {
                lattice.set_voxel(mat, x, y, z).unwrap();
            }
        }
    }

    // near face fully fixed, far face pulled out by one voxel length
    for y in 0..2 {
        for z in 0..2 {
            let near = lattice.voxel_at(0, y, z).unwrap();
            lattice
                .external(near)
                .unwrap()
                .set_fixed(true, true, true, true, true, true);

            let far = lattice.voxel_at(8, y, z).unwrap();
            let ext = lattice.external(far).unwrap();
            ext.set_displacement(X_TRANSLATE, 1e-3);
        }
    }

    for _ in 0..8000 {
        lattice.do_time_step(-1.0).unwrap();
    }

    // mid-block axial strain exceeds the 0.125 average because the clamped
    // faces carry less; the transverse links contract by roughly nu times
    // the axial strain
    let mid_axial = lattice.link_at(4, 0, 0, LinkDirection::XPos).unwrap();
    let axial_strain = lattice.link(mid_axial).unwrap().axial_strain();
    assert_abs_diff_eq!(axial_strain, 0.1306, epsilon = 0.008);

    let mid_transverse = lattice.link_at(4, 0, 0, LinkDirection::YPos).unwrap();
    let transverse_strain = lattice.link(mid_transverse).unwrap().axial_strain();
    assert_abs_diff_eq!(transverse_strain, -0.04048, epsilon = 0.006);

    // static equilibrium: the reaction on the fixed face balances the axial
    // force carried by the mid-plane links
    let mut reaction_x = 0.0;
    for y in 0..2 {
        for z in 0..2 {
            let near = lattice.voxel_at(0, y, z).unwrap();
            reaction_x += lattice.voxel_external_force(near).unwrap().x;
        }
    }
    let mut mid_plane_force = 0.0;
    for y in 0..2 {
        for z in 0..2 {
            let lid = lattice.link_at(4, y, z, LinkDirection::XPos).unwrap();
            mid_plane_force += lattice.link(lid).unwrap().force(false).x.abs();
        }
    }
    assert_relative_eq!(reaction_x.abs(), mid_plane_force, max_relative = 0.1);
}

#[test]
fn static_friction_holds_below_threshold() {
    let mut lattice = Lattice::new(0.001);
    let mat = lattice.add_material_object(
        Material::new(1e6, 1000.0)
            .unwrap()
            .with_static_friction(1.0)
            .with_kinetic_friction(0.1)
            .with_global_damping(1.0),
    );
    let v = lattice.set_voxel(mat, 0, 0, 0).unwrap();
    lattice.enable_floor(true);
    lattice.set_gravity(1.0);

    let weight = 1e-6 * GRAVITY_ACCELERATION;

    // settle onto the floor
    for _ in 0..300 {
        lattice.do_time_step(-1.0).unwrap();
    }
    assert!(lattice.voxel(v).unwrap().is_floor_static_friction());

    // below the static threshold mu_s * N: no horizontal motion at all
    lattice
        .external(v)
        .unwrap()
        .set_force(Vec3::new(0.9 * weight, 0.0, 0.0));
    for _ in 0..300 {
        lattice.do_time_step(-1.0).unwrap();
    }
    let disp = lattice.voxel_displacement(v).unwrap();
    assert_abs_diff_eq!(disp.x, 0.0, epsilon = 1e-12);
}

#[test]
fn kinetic_friction_releases_above_threshold() {
    let mut lattice = Lattice::new(0.001);
    let mat = lattice.add_material_object(
        Material::new(1e6, 1000.0)
            .unwrap()
            .with_static_friction(1.0)
            .with_kinetic_friction(0.1)
            .with_global_damping(1.0),
    );
    let v = lattice.set_voxel(mat, 0, 0, 0).unwrap();
    lattice.enable_floor(true);
    lattice.set_gravity(1.0);

    let weight = 1e-6 * GRAVITY_ACCELERATION;

    for _ in 0..300 {
        lattice.do_time_step(-1.0).unwrap();
    }

    // above the threshold the voxel breaks loose and slides
    lattice
        .external(v)
        .unwrap()
        .set_force(Vec3::new(1.1 * weight, 0.0, 0.0));
    for _ in 0..300 {
        lattice.do_time_step(-1.0).unwrap();
    }
    let disp = lattice.voxel_displacement(v).unwrap();
    assert!(disp.x > 1e-8, "voxel stuck: displacement {:.3e}", disp.x);
}

#[test]
fn bilinear_material_unloads_along_elastic_line() {
    let mut lattice = Lattice::new(0.001);
    // E = 1 Pa, plastic modulus 0.5 Pa, yield at strain 1
    let mat = lattice.add_material_object(
        Material::with_model(
            MaterialModel::bilinear(1.0, 0.5, 1.0, None).unwrap(),
            1000.0,
        )
        .unwrap(),
    );
    let v0 = lattice.set_voxel(mat, 0, 0, 0).unwrap();
    let v1 = lattice.set_voxel(mat, 1, 0, 0).unwrap();

    lattice
        .external(v0)
        .unwrap()
        .set_fixed(true, true, true, true, true, true);
    lattice
        .external(v1)
        .unwrap()
        .set_displacement_all(Vec3::zeros(), Vec3::zeros());

    let link = lattice.links().next().unwrap().0;
    let stretch_to = |lattice: &mut Lattice, strain: f64| {
        lattice
            .external(v1)
            .unwrap()
            .set_displacement(X_TRANSLATE, strain * 0.001);
        // one step to move the prescribed voxel, one to re-evaluate the link
        lattice.do_time_step(-1.0).unwrap();
        lattice.do_time_step(-1.0).unwrap();
    };

    // load into the plastic segment: sigma(1.5) = 1 + 0.5 * 0.5
    stretch_to(&mut lattice, 1.5);
    assert_abs_diff_eq!(
        lattice.link(link).unwrap().axial_stress(),
        1.25,
        epsilon = 1e-9
    );
    assert!(lattice.is_link_yielded(link).unwrap());

    // unloading follows a line of slope E through (1.5, 1.25)
    stretch_to(&mut lattice, 1.0);
    assert_abs_diff_eq!(
        lattice.link(link).unwrap().axial_stress(),
        0.75,
        epsilon = 1e-9
    );

    // residual plastic strain: eps_max - sigma(eps_max)/E = 0.25
    stretch_to(&mut lattice, 0.25);
    assert_abs_diff_eq!(lattice.link(link).unwrap().axial_stress(), 0.0, epsilon = 1e-9);
}

#[test]
fn falling_voxel_bounces_off_fixed_voxel() {
    let mut lattice = Lattice::new(0.001);
    let mat = lattice.add_material_object(
        Material::new(1e6, 1000.0)
            .unwrap()
            .with_internal_damping(0.0)
            .with_global_damping(0.0),
    );
    let anchor = lattice.set_voxel(mat, 0, 0, 0).unwrap();
    let faller = lattice.set_voxel(mat, 0, 0, 2).unwrap();
    lattice
        .external(anchor)
        .unwrap()
        .set_fixed(true, true, true, true, true, true);
    lattice.enable_collisions(true);
    lattice.set_gravity(1.0);

    let mut min_z = f64::INFINITY;
    for _ in 0..6000 {
        lattice.do_time_step(-1.0).unwrap();
        min_z = min_z.min(lattice.voxel(faller).unwrap().position().z);
    }

    // the falling voxel can never pass through the anchored one: contact
    // envelopes (radius 0.625 voxels each) stop it above one voxel length
    assert!(min_z > 0.001, "fell to z = {:.4e}", min_z);
    let final_z = lattice.voxel(faller).unwrap().position().z;
    assert!(final_z > 0.001);
    // and it did approach before rebounding
    assert!(min_z < 0.0015);
}
