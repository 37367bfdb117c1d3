//! Error types for Ibex

use thiserror::Error;

/// Main error type for Ibex operations
#[derive(Error, Debug)]
pub enum IbexError {
    #[error("Invalid material: {0}")]
    InvalidMaterial(String),

    #[error("Invalid voxel index: ({0}, {1}, {2})")]
    InvalidVoxelIndex(i32, i32, i32),

    #[error("Unknown material handle")]
    UnknownMaterial,

    #[error("Lattice storage allocation failed")]
    AllocationFailure,

    #[error("Simulation diverged: link axial strain exceeded {0}")]
    Diverged(f64),

    #[error("Linear solver failed with code {0}")]
    SolverFailure(i32),

    #[error("Linear solve cancelled")]
    SolverCancelled,

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

/// Result type for Ibex operations
pub type Result<T> = std::result::Result<T, IbexError>;

/// Validation trait for simulation components
pub trait Validate {
    fn validate(&self) -> Result<()>;
}
