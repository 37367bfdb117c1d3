use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use ibex::io::LatticeIO;
use ibex::prelude::*;
use log::info;
use std::path::PathBuf;

/// Ibex: deformable voxel physics engine
#[derive(Parser)]
#[command(name = "ibex")]
#[command(about = "A fast, safe deformable voxel physics engine written in Rust")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Time-step a lattice model
    Run {
        /// Input model file (JSON)
        input: PathBuf,

        /// Number of time steps
        #[arg(short, long, default_value = "1000")]
        steps: usize,

        /// Time step in seconds (negative selects the recommended step)
        #[arg(short, long, default_value = "-1.0", allow_hyphen_values = true)]
        dt: f64,

        /// Output file for the final state
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Run the linearized static solver on a model
    Solve {
        /// Input model file (JSON)
        input: PathBuf,

        /// Output file for the solved state
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Validate a model file
    Validate {
        /// Input model file (JSON)
        input: PathBuf,
    },

    /// Show model information
    Info {
        /// Input model file (JSON)
        input: PathBuf,
    },

    /// Create an example model file
    Create {
        /// Output file path
        output: PathBuf,

        /// Example type (cantilever, block)
        #[arg(long, default_value = "cantilever")]
        example: String,
    },
}

fn main() {
    let cli = Cli::parse();

    let level = if cli.verbose {
        log::LevelFilter::Info
    } else {
        log::LevelFilter::Warn
    };
    env_logger::Builder::from_default_env()
        .filter_level(level)
        .init();

    println!("🐐 Ibex Voxel Physics Engine ⛰️");

    let result = match cli.command {
        Commands::Run {
            input,
            steps,
            dt,
            output,
        } => run_simulation(input, steps, dt, output),
        Commands::Solve { input, output } => run_solve(input, output),
        Commands::Validate { input } => validate_model(input),
        Commands::Info { input } => show_model_info(input),
        Commands::Create { output, example } => create_model(output, &example),
    };

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run_simulation(
    input: PathBuf,
    steps: usize,
    dt: f64,
    output: Option<PathBuf>,
) -> anyhow::Result<()> {
    info!("Loading model from: {}", input.display());
    let mut lattice = LatticeIO::load_from_file(&input)?;

    let recommended = lattice.recommended_time_step();
    println!(
        "Stepping {} voxels, {} links (recommended dt = {:.3e} s)",
        lattice.voxel_count(),
        lattice.link_count(),
        recommended
    );

    for step in 0..steps {
        lattice
            .do_time_step(dt)
            .with_context(|| format!("simulation diverged at step {}", step))?;
    }

    println!(
        "Simulated {:.6e} s: max displacement {:.6e} m, total kinetic energy {:.6e} J",
        lattice.current_time(),
        lattice.state_info(StateInfo::Displacement, ValueType::Max),
        lattice.state_info(StateInfo::KineticEnergy, ValueType::Total),
    );

    if let Some(path) = output {
        LatticeIO::save_to_file(&lattice, &path)?;
        println!("Final state written to {}", path.display());
    }
    Ok(())
}

fn run_solve(input: PathBuf, output: Option<PathBuf>) -> anyhow::Result<()> {
    info!("Loading model from: {}", input.display());
    let mut lattice = LatticeIO::load_from_file(&input)?;

    lattice.do_linear_solve().context("linear solve failed")?;

    println!(
        "Solved: max displacement {:.6e} m",
        lattice.state_info(StateInfo::Displacement, ValueType::Max)
    );

    if let Some(path) = output {
        LatticeIO::save_to_file(&lattice, &path)?;
        println!("Solved state written to {}", path.display());
    }
    Ok(())
}

fn validate_model(input: PathBuf) -> anyhow::Result<()> {
    let lattice = LatticeIO::load_from_file(&input)?;

    for (id, mat) in lattice.materials() {
        mat.material
            .validate()
            .with_context(|| format!("material {} is invalid", id.0))?;
    }
    if lattice.voxel_count() == 0 {
        bail!("model contains no voxels");
    }

    println!("✓ Model validation passed!");
    println!(
        "  {} materials, {} voxels, {} links",
        lattice.material_count(),
        lattice.voxel_count(),
        lattice.link_count()
    );
    Ok(())
}

fn show_model_info(input: PathBuf) -> anyhow::Result<()> {
    let lattice = LatticeIO::load_from_file(&input)?;

    println!("Voxel size: {} m", lattice.voxel_size());
    println!("Gravity: {} g", lattice.gravity());
    println!("Floor: {}", lattice.is_floor_enabled());
    println!("Collisions: {}", lattice.is_collisions_enabled());
    println!(
        "Voxels: {} ({} links)",
        lattice.voxel_count(),
        lattice.link_count()
    );

    println!("Materials:");
    for (id, mat) in lattice.materials() {
        let name = if mat.material.name.is_empty() {
            "(unnamed)"
        } else {
            mat.material.name.as_str()
        };
        println!(
            "  {}: {} E = {:.2e} Pa, rho = {} kg/m^3",
            id.0,
            name,
            mat.material.youngs_modulus(),
            mat.material.density()
        );
    }

    let min = lattice.index_min();
    let max = lattice.index_max();
    if lattice.voxel_count() > 0 {
        println!(
            "Bounds: ({}, {}, {}) to ({}, {}, {})",
            min.x, min.y, min.z, max.x, max.y, max.z
        );
    }
    Ok(())
}

fn create_model(output: PathBuf, example: &str) -> anyhow::Result<()> {
    let lattice = match example {
        "cantilever" => create_cantilever()?,
        "block" => create_block()?,
        _ => bail!("unknown example type (available: cantilever, block)"),
    };

    LatticeIO::save_to_file(&lattice, &output)?;
    println!("Model created at {}", output.display());
    Ok(())
}

fn create_cantilever() -> anyhow::Result<Lattice> {
    let mut lattice = Lattice::new(0.001);
    let rubber = lattice.add_material_object(
        Material::new(1e6, 1000.0)?
            .with_name("soft rubber")
            .with_internal_damping(1.0)
            .with_global_damping(0.1),
    );

    for i in 0..5 {
        lattice.set_voxel(rubber, i, 0, 0)?;
    }
    let base = lattice.voxel_at(0, 0, 0).expect("base voxel exists");
    let tip = lattice.voxel_at(4, 0, 0).expect("tip voxel exists");

    lattice
        .external(base)
        .expect("base voxel exists")
        .set_fixed(true, true, true, true, true, true);
    lattice
        .external(tip)
        .expect("tip voxel exists")
        .set_force(Vec3::new(0.0, 0.0, -1e-4));
    Ok(lattice)
}

fn create_block() -> anyhow::Result<Lattice> {
    let mut lattice = Lattice::new(0.001);
    let rubber = lattice.add_material_object(
        Material::new(1e6, 1000.0)?
            .with_name("soft rubber")
            .with_poissons_ratio(0.3)
            .with_internal_damping(1.0)
            .with_global_damping(0.2),
    );

    for z in 0..3 {
        for y in 0..3 {
            for x in 0..3 {
                lattice.set_voxel(rubber, x, y, z)?;
            }
        }
    }
    Ok(lattice)
}
