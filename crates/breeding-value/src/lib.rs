//! breeding-value: decisions on top of estimated breeding values
//!
//! ## Module Organization
//! - `cross`: progeny mean, variance and usefulness of planned crosses
//! - `selection`: candidate ranking and expected response
//! - `accuracy`: prediction accuracy and k-fold cross-validation
//! - `store`: the [`AnalysisStore`] capability and an in-memory implementation
//! - `service`: [`BreedingValueService`], estimation plus the above with shared settings
//!
//! ## Example
//! ```ignore
//! use breeding_value::{BreedingValueService, MemoryStore};
//!
//! let service = BreedingValueService::with_heritability(0.4);
//! let mut store = MemoryStore::new();
//! let report = service.estimate_genomic(&geno, &phenotypes, None, Some(&mut store))?;
//! let ranking = service.rank_candidates(&report.candidates, 0.1)?;
//! let cross = service.predict_cross(report.ebv("P1").unwrap_or(0.0), 0.2, report.trait_mean())?;
//! ```

pub mod accuracy;
pub mod cross;
pub mod selection;
pub mod service;
pub mod store;

pub use accuracy::{
    calculate_accuracy, cross_validate, AccuracyReport, CrossValidationResult, CvMethod, CvOptions, FoldResult,
};
pub use cross::{
    predict_cross, predict_cross_with_genotypes, rank_crosses, CrossCriterion, CrossOptions, CrossPrediction,
    ParentPanel, PredictionRange, RankCrossOptions,
};
pub use selection::{
    rank_candidates, selection_intensity_for, selection_response, Candidate, CandidateRanking, RankedCandidate,
    SelectionSummary,
};
pub use service::{BreedingValueReport, BreedingValueService};
pub use store::{AnalysisKind, AnalysisRecord, AnalysisStore, MemoryStore, StoredBreedingValue};
