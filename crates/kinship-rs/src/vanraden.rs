//! Genomic relationship matrices (VanRaden 2008).

use breed_core::{BreedError, GenotypeMatrix, RelationshipMatrix, RelationshipMethod, Result};
use log::{debug, warn};
use ndarray::Array2;
use serde::{Deserialize, Serialize};

use breed_core::numeric::mirror_upper;

/// Options for genomic relationship matrices
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KinshipOptions {
    /// VanRaden1 (default) or VanRaden2
    pub method: RelationshipMethod,
    /// Substituted when every marker is monomorphic (default: 1.0)
    pub fallback_denominator: f64,
}

impl Default for KinshipOptions {
    fn default() -> Self {
        Self {
            method: RelationshipMethod::VanRaden1,
            fallback_denominator: 1.0,
        }
    }
}

impl KinshipOptions {
    pub fn validate(&self) -> Result<()> {
        if !(self.fallback_denominator.is_finite() && self.fallback_denominator > 0.0) {
            return Err(BreedError::invalid(format!(
                "fallback_denominator must be positive and finite, got {}",
                self.fallback_denominator
            )));
        }
        Ok(())
    }
}

/// Marker matrix centred by `ploidy * p`, individuals x markers.
pub fn centered_dosages(geno: &GenotypeMatrix) -> Array2<f64> {
    let ploidy = geno.ploidy as f64;
    let mut z = geno.dosages.clone();
    for (j, summary) in geno.markers.iter().enumerate() {
        let offset = ploidy * summary.allele_freq;
        z.column_mut(j).mapv_inplace(|v| v - offset);
    }
    z
}

/// Genomic relationship matrix.
///
/// Method 1: `K = Z Zᵀ / (ploidy · Σ p(1-p))`.
/// Method 2: each centred marker is weighted by `1 / (ploidy · p(1-p))` and the
/// product is divided by the number of polymorphic markers.
///
/// A zero denominator (all markers monomorphic) is replaced by
/// `fallback_denominator` and flagged on the result.
pub fn vanraden_kinship(geno: &GenotypeMatrix, options: Option<KinshipOptions>) -> Result<RelationshipMatrix> {
    let opts = options.unwrap_or_default();
    opts.validate()?;
    let n_samples = geno.n_samples();
    let n_markers = geno.n_markers();
    if n_samples == 0 || n_markers == 0 {
        return Err(BreedError::invalid("genotype matrix is empty"));
    }
    if geno.markers.len() != n_markers {
        return Err(BreedError::dimension("marker summaries", n_markers, geno.markers.len()));
    }
    let ploidy = geno.ploidy as f64;
    let mut z = centered_dosages(geno);

    let denom = match opts.method {
        RelationshipMethod::VanRaden1 => geno
            .markers
            .iter()
            .map(|m| ploidy * m.allele_freq * (1.0 - m.allele_freq))
            .sum::<f64>(),
        RelationshipMethod::VanRaden2 => {
            let mut n_poly = 0usize;
            for (j, m) in geno.markers.iter().enumerate() {
                let var = ploidy * m.allele_freq * (1.0 - m.allele_freq);
                if m.monomorphic || var <= 1e-10 {
                    z.column_mut(j).fill(0.0);
                } else {
                    let w = var.sqrt();
                    z.column_mut(j).mapv_inplace(|v| v / w);
                    n_poly += 1;
                }
            }
            n_poly as f64
        }
        other => {
            return Err(BreedError::invalid(format!(
                "{} is not a genomic relationship method",
                other.as_str()
            )))
        }
    };

    let (denominator, fallback) = if denom > 0.0 {
        (denom, false)
    } else {
        warn!(
            "VanRaden denominator is zero (all {} markers monomorphic); using {}",
            n_markers, opts.fallback_denominator
        );
        (opts.fallback_denominator, true)
    };

    let mut kin = z.dot(&z.t()) / denominator;
    mirror_upper(&mut kin);
    debug!(
        "Built {} relationship matrix for {} individuals from {} markers (denominator {:.4})",
        opts.method.as_str(),
        n_samples,
        n_markers,
        denominator
    );

    Ok(RelationshipMatrix {
        sample_ids: geno.sample_ids.clone(),
        matrix: kin,
        method: opts.method,
        denominator,
        denominator_fallback: fallback,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use breed_core::standardize;

    #[test]
    fn test_vanraden1_known_values() {
        let (geno, _) = standardize(&[vec![0.0, 2.0], vec![2.0, 0.0]], None).unwrap();
        let kin = vanraden_kinship(&geno, None).unwrap();
        // p = 0.5 for both markers, denominator = 2 * 2 * 0.25 = 1
        assert_relative_eq!(kin.denominator, 1.0);
        assert_relative_eq!(kin.matrix[(0, 0)], 2.0);
        assert_relative_eq!(kin.matrix[(0, 1)], -2.0);
        assert!(!kin.denominator_fallback);
    }

    #[test]
    fn test_monomorphic_panel_uses_fallback() {
        let (geno, _) = standardize(&[vec![2.0, 0.0], vec![2.0, 0.0]], None).unwrap();
        let kin = vanraden_kinship(&geno, None).unwrap();
        assert!(kin.denominator_fallback);
        assert_eq!(kin.denominator, 1.0);
        assert!(kin.matrix.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_vanraden2_diagonal_near_one() {
        let raw = vec![
            vec![0.0, 1.0, 2.0, 1.0],
            vec![1.0, 1.0, 0.0, 2.0],
            vec![2.0, 0.0, 1.0, 1.0],
            vec![1.0, 2.0, 1.0, 0.0],
        ];
        let (geno, _) = standardize(&raw, None).unwrap();
        let opts = KinshipOptions {
            method: RelationshipMethod::VanRaden2,
            ..Default::default()
        };
        let kin = vanraden_kinship(&geno, Some(opts)).unwrap();
        assert_eq!(kin.method, RelationshipMethod::VanRaden2);
        assert_relative_eq!(kin.denominator, 4.0);
        let mean_diag = kin.matrix.diag().sum() / 4.0;
        assert!(mean_diag > 0.5 && mean_diag < 1.5);
        assert!(kin.is_symmetric(0.0));
    }

    #[test]
    fn test_fallback_denominator_must_be_positive() {
        let (geno, _) = standardize(&[vec![1.0, 2.0], vec![1.0, 2.0]], None).unwrap();
        for bad in [0.0, -2.0, f64::NAN, f64::INFINITY] {
            let opts = KinshipOptions {
                fallback_denominator: bad,
                ..Default::default()
            };
            let err = vanraden_kinship(&geno, Some(opts)).unwrap_err();
            assert_eq!(err.kind(), breed_core::ErrorKind::InvalidInput);
        }
    }

    #[test]
    fn test_pedigree_method_rejected() {
        let (geno, _) = standardize(&[vec![0.0], vec![1.0]], None).unwrap();
        let opts = KinshipOptions {
            method: RelationshipMethod::Pedigree,
            ..Default::default()
        };
        assert!(vanraden_kinship(&geno, Some(opts)).is_err());
    }
}
