//! Genome-wide significance thresholds
//!
//! - Bonferroni: `alpha / m` over the `m` tested markers
//! - FDR: Benjamini-Hochberg step-up at level `alpha`

use breed_core::{BreedError, Result};
use serde::{Deserialize, Serialize};

/// Threshold calculation method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ThresholdMethod {
    Bonferroni,
    /// False Discovery Rate (Benjamini-Hochberg)
    Fdr,
}

impl ThresholdMethod {
    pub fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "bonferroni" => Ok(ThresholdMethod::Bonferroni),
            "fdr" | "bh" => Ok(ThresholdMethod::Fdr),
            other => Err(BreedError::invalid(format!(
                "Unknown threshold method: {}. Use: bonferroni or fdr",
                other
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ThresholdMethod::Bonferroni => "Bonferroni",
            ThresholdMethod::Fdr => "FDR",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignificanceThreshold {
    pub method: ThresholdMethod,
    pub alpha: f64,
    /// Markers with `p <= p_value` are significant
    pub p_value: f64,
    /// The same cutoff as -log10(p)
    pub score: f64,
    pub n_markers: usize,
}

impl SignificanceThreshold {
    pub fn is_significant(&self, p: f64) -> bool {
        p <= self.p_value
    }
}

/// Largest p-value passing the Benjamini-Hochberg step-up, if any.
pub fn fdr_cutoff(p_values: &[f64], level: f64) -> Option<f64> {
    let mut sorted: Vec<f64> = p_values.iter().copied().filter(|p| p.is_finite()).collect();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let m = sorted.len() as f64;

    let mut cutoff = None;
    for (i, &p) in sorted.iter().enumerate() {
        if p <= (i + 1) as f64 / m * level {
            cutoff = Some(p);
        }
    }
    cutoff
}

/// Threshold for the p-values of all tested markers.
///
/// When no marker passes the FDR step-up, the cutoff is set above the
/// strongest observed score so nothing is flagged.
pub fn significance_threshold(p_values: &[f64], method: ThresholdMethod, alpha: f64) -> SignificanceThreshold {
    let n_markers = p_values.len();
    let p_value = match method {
        ThresholdMethod::Bonferroni => alpha / n_markers.max(1) as f64,
        ThresholdMethod::Fdr => fdr_cutoff(p_values, alpha).unwrap_or_else(|| {
            let min_p = p_values.iter().copied().fold(alpha, f64::min).max(1e-300);
            10f64.powf(1.2 * min_p.log10())
        }),
    };
    SignificanceThreshold {
        method,
        alpha,
        p_value,
        score: -p_value.log10(),
        n_markers,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_threshold_method_parsing() {
        assert_eq!(ThresholdMethod::from_str("bonferroni").unwrap(), ThresholdMethod::Bonferroni);
        assert_eq!(ThresholdMethod::from_str("FDR").unwrap(), ThresholdMethod::Fdr);
        assert!(ThresholdMethod::from_str("m.eff").is_err());
    }

    #[test]
    fn test_bonferroni_threshold() {
        // 1000 markers, alpha = 0.05: -log10(5e-5) ≈ 4.30
        let p = vec![0.5; 1000];
        let t = significance_threshold(&p, ThresholdMethod::Bonferroni, 0.05);
        assert_relative_eq!(t.p_value, 5e-5, epsilon = 1e-15);
        assert!((t.score - 4.30).abs() < 0.01);
        assert!(t.is_significant(1e-5));
        assert!(!t.is_significant(1e-4));
    }

    #[test]
    fn test_fdr_cutoff() {
        let p = vec![0.001, 0.01, 0.02, 0.03, 0.04, 0.05, 0.1, 0.2, 0.5];
        // k/m * 0.05 for k = 2 is 0.0111 >= 0.01; k = 3 gives 0.0167 < 0.02
        assert_eq!(fdr_cutoff(&p, 0.05), Some(0.01));
        let t = significance_threshold(&p, ThresholdMethod::Fdr, 0.05);
        assert!(t.score > 1.0);
    }

    #[test]
    fn test_fdr_nothing_passes() {
        let p = vec![0.3, 0.6, 0.9];
        assert_eq!(fdr_cutoff(&p, 0.05), None);
        let t = significance_threshold(&p, ThresholdMethod::Fdr, 0.05);
        assert!(p.iter().all(|&x| !t.is_significant(x)));
    }
}
