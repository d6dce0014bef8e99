//! breed-core: shared data model for the breed workspace
//!
//! Holds the genotype, relationship, pedigree and tabular types passed between
//! the kinship, mixed-model, GWAS and breeding-value crates, the common error
//! taxonomy, and the genotype standardisation step that every analysis starts
//! from.
//!
//! # Example
//! ```ignore
//! use breed_core::{standardize, StandardizeOptions};
//!
//! let raw = vec![vec![0.0, 1.0, 2.0], vec![2.0, 1.0, 0.0]];
//! let (geno, freqs) = standardize(&raw, Some(StandardizeOptions::default()))?;
//! ```

pub mod error;
pub mod genotype;
pub mod numeric;
pub mod types;

pub use error::{BreedError, DegenerateReason, ErrorKind, Result};
pub use genotype::{standardize, DosageEncoding, GenotypeMatrixBuilder, StandardizeOptions};
pub use types::{
    align_phenotypes, Column, Dataset, GenotypeMatrix, MarkerMetadata, MarkerSummary, PedigreeRecord,
    RelationshipMatrix, RelationshipMethod,
};
