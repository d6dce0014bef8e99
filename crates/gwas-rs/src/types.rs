//! Options and result records for association scans.

use breed_core::{BreedError, DegenerateReason, Result};
use serde::{Deserialize, Serialize};

use crate::threshold::{SignificanceThreshold, ThresholdMethod};

/// Per-marker test model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GwasMethod {
    /// Ordinary least squares of phenotype on dosage plus covariates
    Glm,
    /// Generalised least squares under `K + λI`, λ fixed for the whole scan
    Mlm,
}

impl GwasMethod {
    pub fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "glm" => Ok(GwasMethod::Glm),
            "mlm" | "lmm" => Ok(GwasMethod::Mlm),
            other => Err(BreedError::invalid(format!(
                "Unknown GWAS method: {}. Use: glm or mlm",
                other
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            GwasMethod::Glm => "GLM",
            GwasMethod::Mlm => "MLM",
        }
    }
}

/// Which tested markers are returned in [`AssociationResult::markers`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputPolicy {
    All,
    /// Every significant marker plus the `n` smallest p-values of the rest
    SignificantPlusTop(usize),
}

impl Default for OutputPolicy {
    fn default() -> Self {
        OutputPolicy::SignificantPlusTop(1000)
    }
}

/// Options for a genome-wide scan
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GwasOptions {
    pub method: GwasMethod,
    /// Genome-wide error rate (default: 0.05)
    pub alpha: f64,
    pub threshold: ThresholdMethod,
    /// Markers below this minor allele frequency are skipped (default: 0.0)
    pub min_maf: f64,
    pub output: OutputPolicy,
    /// Leading principal components added as covariates (default: 0)
    pub n_pcs: usize,
    /// Fixes the MLM ratio at `(1 - h²)/h²`; `None` estimates it by REML.
    pub heritability: Option<f64>,
}

impl Default for GwasOptions {
    fn default() -> Self {
        Self {
            method: GwasMethod::Glm,
            alpha: 0.05,
            threshold: ThresholdMethod::Bonferroni,
            min_maf: 0.0,
            output: OutputPolicy::default(),
            n_pcs: 0,
            heritability: None,
        }
    }
}

impl GwasOptions {
    pub fn validate(&self) -> Result<()> {
        if !(self.alpha > 0.0 && self.alpha < 1.0) {
            return Err(BreedError::invalid(format!("alpha must lie in (0, 1), got {}", self.alpha)));
        }
        if !(0.0..=0.5).contains(&self.min_maf) {
            return Err(BreedError::invalid(format!("min_maf must lie in [0, 0.5], got {}", self.min_maf)));
        }
        if let Some(h2) = self.heritability {
            if !(h2 > 0.0 && h2 < 1.0) {
                return Err(BreedError::invalid(format!("heritability must lie in (0, 1), got {}", h2)));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarkerRecord {
    /// Column of the marker in the genotype matrix
    pub index: usize,
    pub marker_id: String,
    pub chrom: String,
    pub pos: u64,
    pub effect: f64,
    pub std_error: f64,
    /// t statistic of the marker coefficient
    pub statistic: f64,
    pub p_value: f64,
    /// -log10(p)
    pub score: f64,
    pub maf: f64,
    pub n_obs: usize,
    pub significant: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkippedMarker {
    pub index: usize,
    pub marker_id: String,
    pub chrom: String,
    pub pos: u64,
    pub reason: DegenerateReason,
}

impl SkippedMarker {
    pub fn to_error(&self) -> BreedError {
        BreedError::DegenerateMarker {
            marker: self.marker_id.clone(),
            chrom: self.chrom.clone(),
            pos: self.pos,
            reason: self.reason.clone(),
        }
    }
}

/// Result of one per-marker unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MarkerOutcome {
    Tested(MarkerRecord),
    Skipped(SkippedMarker),
}

impl MarkerOutcome {
    pub fn index(&self) -> usize {
        match self {
            MarkerOutcome::Tested(r) => r.index,
            MarkerOutcome::Skipped(s) => s.index,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManhattanPoint {
    pub chrom: String,
    pub pos: u64,
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QqPoint {
    pub expected: f64,
    pub observed: f64,
}

/// Null-model variance ratio shared by every marker of an MLM scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NullModelSummary {
    pub lambda: f64,
    pub heritability: f64,
    /// `true` when λ came from a supplied heritability rather than REML
    pub fixed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssociationResult {
    pub method: GwasMethod,
    pub threshold: SignificanceThreshold,
    pub n_tested: usize,
    pub n_significant: usize,
    /// Reported markers in genome order; see [`OutputPolicy`]
    pub markers: Vec<MarkerRecord>,
    pub truncated: bool,
    pub skipped: Vec<SkippedMarker>,
    /// One point per tested marker
    pub manhattan: Vec<ManhattanPoint>,
    pub qq: Vec<QqPoint>,
    pub lambda_gc: f64,
    pub null_model: Option<NullModelSummary>,
}

impl AssociationResult {
    pub fn significant(&self) -> impl Iterator<Item = &MarkerRecord> {
        self.markers.iter().filter(|m| m.significant)
    }

    pub fn threshold_method(&self) -> ThresholdMethod {
        self.threshold.method
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_parsing() {
        assert_eq!(GwasMethod::from_str("GLM").unwrap(), GwasMethod::Glm);
        assert_eq!(GwasMethod::from_str("lmm").unwrap(), GwasMethod::Mlm);
        assert!(GwasMethod::from_str("farmcpu").is_err());
        assert_eq!(GwasMethod::Mlm.as_str(), "MLM");
    }

    #[test]
    fn test_options_validation() {
        assert!(GwasOptions::default().validate().is_ok());
        let bad = GwasOptions {
            alpha: 0.0,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
        let bad = GwasOptions {
            heritability: Some(1.0),
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_skipped_marker_error_kind() {
        let s = SkippedMarker {
            index: 3,
            marker_id: "snp3".into(),
            chrom: "1".into(),
            pos: 1200,
            reason: DegenerateReason::Monomorphic,
        };
        let err = s.to_error();
        assert_eq!(err.kind(), breed_core::ErrorKind::DegenerateMarker);
        assert_eq!(err.offending_input(), "snp3 at 1:1200");
    }
}
