//! Genotype standardisation.
//!
//! Raw calls arrive as one dosage sequence per individual. The builder checks
//! the shape, converts centred encodings into the canonical `0..=ploidy`
//! domain, imputes missing calls (`NaN`) with the marker mean and records a
//! [`MarkerSummary`] per marker.

use log::{debug, warn};
use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::error::{BreedError, Result};
use crate::types::{GenotypeMatrix, MarkerMetadata, MarkerSummary};

/// Encoding of the incoming dosages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DosageEncoding {
    /// Centred if any value is negative, canonical otherwise.
    #[default]
    Auto,
    /// Already in `0..=ploidy`.
    Canonical,
    /// `-ploidy/2..=ploidy/2`, e.g. {-1, 0, 1} for diploids.
    Centered,
}

impl DosageEncoding {
    pub fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "auto" => Ok(DosageEncoding::Auto),
            "canonical" | "012" | "dosage" => Ok(DosageEncoding::Canonical),
            "centered" | "centred" | "-101" => Ok(DosageEncoding::Centered),
            other => Err(BreedError::invalid(format!(
                "unknown dosage encoding: {}. Use: auto, canonical, centered",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StandardizeOptions {
    /// Ploidy level (default: 2)
    pub ploidy: u8,
    /// Input encoding (default: Auto)
    pub encoding: DosageEncoding,
    /// Slack allowed at the domain boundaries (default: 1e-8)
    pub tolerance: f64,
}

impl Default for StandardizeOptions {
    fn default() -> Self {
        Self {
            ploidy: 2,
            encoding: DosageEncoding::Auto,
            tolerance: 1e-8,
        }
    }
}

/// Builds an imputed [`GenotypeMatrix`] from raw per-individual dosage rows.
#[derive(Debug, Clone, Default)]
pub struct GenotypeMatrixBuilder {
    options: StandardizeOptions,
    sample_ids: Option<Vec<String>>,
    marker_ids: Option<Vec<String>>,
    marker_metadata: Option<Vec<MarkerMetadata>>,
}

impl GenotypeMatrixBuilder {
    pub fn new(options: Option<StandardizeOptions>) -> Self {
        Self {
            options: options.unwrap_or_default(),
            ..Default::default()
        }
    }

    pub fn sample_ids(mut self, ids: Vec<String>) -> Self {
        self.sample_ids = Some(ids);
        self
    }

    pub fn marker_ids(mut self, ids: Vec<String>) -> Self {
        self.marker_ids = Some(ids);
        self
    }

    pub fn marker_metadata(mut self, metadata: Vec<MarkerMetadata>) -> Self {
        self.marker_metadata = Some(metadata);
        self
    }

    /// Returns the standardised matrix and the per-marker allele frequencies.
    pub fn standardize(&self, raw: &[Vec<f64>]) -> Result<(GenotypeMatrix, Vec<f64>)> {
        let opts = &self.options;
        if opts.ploidy == 0 {
            return Err(BreedError::invalid("ploidy must be at least 1"));
        }
        let n = raw.len();
        if n == 0 {
            return Err(BreedError::invalid("genotype matrix has no individuals"));
        }
        let m = raw[0].len();
        if m == 0 {
            return Err(BreedError::invalid("genotype matrix has no markers"));
        }
        for (i, row) in raw.iter().enumerate() {
            if row.len() != m {
                return Err(BreedError::dimension(format!("genotype row {}", i), m, row.len()));
            }
        }

        let sample_ids = match &self.sample_ids {
            Some(ids) if ids.len() != n => {
                return Err(BreedError::dimension("sample ids", n, ids.len()));
            }
            Some(ids) => ids.clone(),
            None => (1..=n).map(|i| format!("IND{}", i)).collect(),
        };
        let marker_ids = match &self.marker_ids {
            Some(ids) if ids.len() != m => {
                return Err(BreedError::dimension("marker ids", m, ids.len()));
            }
            Some(ids) => ids.clone(),
            None => (1..=m).map(|j| format!("M{}", j)).collect(),
        };
        if let Some(meta) = &self.marker_metadata {
            if meta.len() != m {
                return Err(BreedError::dimension("marker map", m, meta.len()));
            }
        }

        let ploidy = opts.ploidy as f64;
        let tol = opts.tolerance;
        let centered = match opts.encoding {
            DosageEncoding::Centered => true,
            DosageEncoding::Canonical => false,
            DosageEncoding::Auto => raw.iter().flatten().any(|v| v.is_finite() && *v < -tol),
        };
        let shift = if centered { ploidy / 2.0 } else { 0.0 };
        if centered {
            debug!("Detected centred dosage encoding; shifting by {}", shift);
        }

        let mut dosages = Array2::<f64>::from_elem((n, m), f64::NAN);
        for (i, row) in raw.iter().enumerate() {
            for (j, &v) in row.iter().enumerate() {
                if v.is_nan() {
                    continue;
                }
                let d = v + shift;
                if !d.is_finite() || d < -tol || d > ploidy + tol {
                    return Err(BreedError::InvalidDosage {
                        individual: i,
                        marker: j,
                        value: v,
                        ploidy: opts.ploidy,
                    });
                }
                dosages[(i, j)] = d;
            }
        }

        let mut markers = Vec::with_capacity(m);
        let mut n_imputed = 0usize;
        for j in 0..m {
            let mut col = dosages.column_mut(j);
            let observed: Vec<f64> = col.iter().copied().filter(|v| !v.is_nan()).collect();
            let n_obs = observed.len();

            if n_obs == 0 {
                warn!("Marker {} has no observed calls; imputing 0 and flagging monomorphic", marker_ids[j]);
                col.fill(0.0);
                n_imputed += n;
                markers.push(MarkerSummary {
                    allele_freq: 0.0,
                    maf: 0.0,
                    heterozygosity: 0.0,
                    missing_rate: 1.0,
                    monomorphic: true,
                });
                continue;
            }

            let mean = observed.iter().sum::<f64>() / n_obs as f64;
            for v in col.iter_mut() {
                if v.is_nan() {
                    *v = mean;
                    n_imputed += 1;
                }
            }

            let (lo, hi) = observed
                .iter()
                .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
            let het = observed.iter().filter(|&&v| v > tol && v < ploidy - tol).count();
            let freq = mean / ploidy;
            markers.push(MarkerSummary {
                allele_freq: freq,
                maf: freq.min(1.0 - freq),
                heterozygosity: het as f64 / n_obs as f64,
                missing_rate: (n - n_obs) as f64 / n as f64,
                monomorphic: hi - lo <= tol,
            });
        }

        let n_mono = markers.iter().filter(|s| s.monomorphic).count();
        debug!(
            "Standardised {} individuals x {} markers ({} imputed calls, {} monomorphic markers)",
            n, m, n_imputed, n_mono
        );

        let freqs = markers.iter().map(|s| s.allele_freq).collect();
        let matrix = GenotypeMatrix {
            ploidy: opts.ploidy,
            sample_ids,
            marker_ids,
            marker_metadata: self.marker_metadata.clone(),
            dosages,
            markers,
        };
        Ok((matrix, freqs))
    }
}

/// Standardise raw dosages with default ids.
pub fn standardize(raw: &[Vec<f64>], options: Option<StandardizeOptions>) -> Result<(GenotypeMatrix, Vec<f64>)> {
    GenotypeMatrixBuilder::new(options).standardize(raw)
}
