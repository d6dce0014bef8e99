//! blup-rs: linear mixed models for breeding data
//!
//! Henderson's mixed-model equations with variance ratios taken from
//! heritability and per-term shares, a closed-form GBLUP, the equivalent
//! marker-effect (rrBLUP) form, a formula front end and REML for the null
//! model used by genome-wide scans.
//!
//! # Example
//! ```ignore
//! use blup_rs::{fit_formula, MixedModelOptions};
//!
//! let sol = fit_formula("yield ~ env + (1|geno)", &data, &covariances,
//!     Some(MixedModelOptions::with_heritability(0.4)))?;
//! let ebv = sol.breeding_values();
//! ```

pub mod designs;
pub mod formula;
pub mod gblup;
pub mod mme;
pub mod model;
pub mod reml;
pub mod rrblup;

pub use designs::{alpha_lattice, multi_environment, rcbd, MultiEnvironmentOptions};
pub use formula::{fit_formula, fit_model, CovarianceTag, ModelDescription, RandomTermSpec};
pub use gblup::{gblup, GENETIC_TERM, INTERCEPT};
pub use mme::solve_mme;
pub use model::{
    Covariance, MixedModelOptions, MixedModelSolution, MixedModelSpec, RandomEffectSolution, RandomTerm,
    TermRole, VarianceComponents,
};
pub use reml::{reml_null_model, NullModelFit, NullModelOptions, SpectralNullModel};
pub use rrblup::{rr_blup, MarkerEffects};
