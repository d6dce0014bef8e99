//! kinship-rs: relationship matrices and population structure
//!
//! - [`vanraden_kinship`]: genomic relationship matrix (VanRaden method 1 or 2)
//! - [`Pedigree`] / [`numerator_relationship`]: pedigree A-matrix with cycle detection
//! - [`pca`] and [`distance_matrix`]: principal components and genetic distances
//!
//! # Example
//! ```ignore
//! use breed_core::standardize;
//! use kinship_rs::vanraden_kinship;
//!
//! let (geno, _) = standardize(&[vec![0.0, 1.0, 2.0], vec![0.0, 1.0, 2.0], vec![2.0, 1.0, 0.0]], None)?;
//! let kin = vanraden_kinship(&geno, None)?;
//! ```

pub mod pedigree;
pub mod structure;
pub mod vanraden;

pub use pedigree::{coancestry, numerator_relationship, Pedigree, PedigreeStats};
pub use structure::{distance_matrix, pairwise_distance, pca, DistanceMatrix, DistanceMethod, PcaOptions, PcaResult};
pub use vanraden::{centered_dosages, vanraden_kinship, KinshipOptions};

use breed_core::RelationshipMatrix;
use serde::{Deserialize, Serialize};

/// Inbreeding coefficients read off a relationship matrix diagonal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InbreedingSummary {
    pub sample_ids: Vec<String>,
    pub coefficients: Vec<f64>,
    pub mean: f64,
    pub min: f64,
    pub max: f64,
}

pub fn inbreeding_summary(rel: &RelationshipMatrix) -> InbreedingSummary {
    let coefficients = rel.inbreeding();
    let n = coefficients.len().max(1) as f64;
    InbreedingSummary {
        sample_ids: rel.sample_ids.clone(),
        mean: coefficients.iter().sum::<f64>() / n,
        min: coefficients.iter().cloned().fold(f64::INFINITY, f64::min),
        max: coefficients.iter().cloned().fold(f64::NEG_INFINITY, f64::max),
        coefficients,
    }
}
