//! gwas-rs: genome-wide association scans
//!
//! Single-marker GLM and relationship-corrected MLM tests. For MLM the
//! variance ratio is fixed once per scan (REML on the null model, or from a
//! supplied heritability) and reused for every marker.
//!
//! ## Module Organization
//! - `scan`: [`ScanContext`] unit-of-work API and the parallel [`run_gwas`]
//! - `threshold`: Bonferroni and FDR cutoffs
//! - `summary`: Manhattan/QQ arrays, genomic inflation, output truncation
//! - `types`: options and result records
//!
//! ## Example
//! ```ignore
//! use gwas_rs::{run_gwas, GwasMethod, GwasOptions};
//!
//! let opts = GwasOptions { method: GwasMethod::Mlm, ..Default::default() };
//! let result = run_gwas(&geno, &phenotypes, Some(&kinship), &[], Some(opts))?;
//! println!("{} significant of {}", result.n_significant, result.n_tested);
//! ```

pub mod scan;
pub mod summary;
pub mod threshold;
pub mod types;

pub use scan::{run_gwas, ScanContext};
pub use summary::{apply_output_policy, genomic_inflation, manhattan, qq};
pub use threshold::{fdr_cutoff, significance_threshold, SignificanceThreshold, ThresholdMethod};
pub use types::{
    AssociationResult, GwasMethod, GwasOptions, ManhattanPoint, MarkerOutcome, MarkerRecord, NullModelSummary,
    OutputPolicy, QqPoint, SkippedMarker,
};
