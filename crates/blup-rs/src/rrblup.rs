//! Ridge-regression BLUP of marker effects.
//!
//! Solved in the individual (dual) space: `α̂ = Zᵀ(ZZᵀ + λ_m I)⁻¹(y - 1μ̂)` with
//! centred dosages `Z` and `λ_m = λ · d`, `d` being the VanRaden denominator.
//! The implied breeding values `Zα̂` are then exactly the GBLUP values for the
//! matching VanRaden relationship matrix.

use breed_core::{align_phenotypes, BreedError, GenotypeMatrix, Result};
use kinship_rs::centered_dosages;
use log::{info, warn};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::mme::factor_with_ridge;
use crate::model::MixedModelOptions;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarkerEffects {
    pub marker_ids: Vec<String>,
    pub effects: Vec<f64>,
    pub intercept: f64,
    /// `ploidy · p` per marker, subtracted from dosages before scoring.
    pub centers: Vec<f64>,
    /// Marker-level shrinkage `λ_m`.
    pub lambda: f64,
    pub sample_ids: Vec<String>,
    /// Breeding values `Zα̂` for every genotyped individual, phenotyped or not.
    pub gebv: Vec<f64>,
}

impl MarkerEffects {
    /// Genomic breeding values for new individuals genotyped on the same markers.
    pub fn predict(&self, geno: &GenotypeMatrix) -> Result<Vec<f64>> {
        if geno.n_markers() != self.effects.len() {
            return Err(BreedError::dimension("marker panel", self.effects.len(), geno.n_markers()));
        }
        Ok(geno
            .dosages
            .rows()
            .into_iter()
            .map(|row| {
                row.iter()
                    .zip(&self.centers)
                    .zip(&self.effects)
                    .map(|((x, c), a)| (x - c) * a)
                    .sum()
            })
            .collect())
    }

    /// Predicted phenotype: intercept plus breeding value.
    pub fn predict_phenotype(&self, geno: &GenotypeMatrix) -> Result<Vec<f64>> {
        Ok(self.predict(geno)?.into_iter().map(|g| g + self.intercept).collect())
    }
}

pub fn rr_blup(
    geno: &GenotypeMatrix,
    phenotypes: &HashMap<String, f64>,
    options: Option<MixedModelOptions>,
) -> Result<MarkerEffects> {
    let opts = options.unwrap_or_default();
    opts.validate()?;
    let (obs, y) = align_phenotypes(&geno.sample_ids, phenotypes);
    let n = obs.len();
    if n < 2 {
        return Err(BreedError::invalid(format!(
            "rrBLUP needs at least 2 phenotyped individuals, got {}",
            n
        )));
    }
    let m = geno.n_markers();
    let ploidy = geno.ploidy as f64;

    let denom: f64 = geno
        .markers
        .iter()
        .map(|s| ploidy * s.allele_freq * (1.0 - s.allele_freq))
        .sum();
    let denom = if denom > 0.0 {
        denom
    } else {
        warn!("All markers monomorphic; rrBLUP shrinkage uses unit scaling");
        1.0
    };
    let lambda = opts.variance_ratio() * denom;

    let z_all = centered_dosages(geno);
    let z = DMatrix::from_fn(n, m, |i, j| z_all[(obs[i], j)]);
    let y = DVector::from_vec(y);
    let ones = DVector::<f64>::from_element(n, 1.0);

    let mut v = &z * z.transpose();
    for i in 0..n {
        v[(i, i)] += lambda;
    }
    let (chol, _) = factor_with_ridge(&v, 0, &opts, "rrBLUP system ZZᵀ + λI")?;
    let v_inv_1 = chol.solve(&ones);
    let mu = v_inv_1.dot(&y) / ones.dot(&v_inv_1);
    let resid = &y - &ones * mu;
    let alpha = z.tr_mul(&chol.solve(&resid));

    let centers: Vec<f64> = geno.markers.iter().map(|s| ploidy * s.allele_freq).collect();
    let effects: Vec<f64> = alpha.iter().copied().collect();
    let gebv: Vec<f64> = z_all
        .rows()
        .into_iter()
        .map(|row| row.iter().zip(&effects).map(|(x, a)| x * a).sum())
        .collect();

    info!("rrBLUP: {} markers, {} phenotyped individuals, lambda_m = {:.4}", m, n, lambda);

    Ok(MarkerEffects {
        marker_ids: geno.marker_ids.clone(),
        effects,
        intercept: mu,
        centers,
        lambda,
        sample_ids: geno.sample_ids.clone(),
        gebv,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gblup::gblup;
    use approx::assert_relative_eq;
    use breed_core::standardize;
    use kinship_rs::vanraden_kinship;

    #[test]
    fn test_matches_gblup() {
        let raw = vec![
            vec![0.0, 1.0, 2.0, 1.0, 0.0],
            vec![1.0, 1.0, 0.0, 2.0, 1.0],
            vec![2.0, 0.0, 1.0, 1.0, 2.0],
            vec![1.0, 2.0, 1.0, 0.0, 1.0],
            vec![0.0, 2.0, 2.0, 1.0, 1.0],
        ];
        let (geno, _) = standardize(&raw, None).unwrap();
        let pheno: HashMap<String, f64> = [("IND1", 3.1), ("IND2", 4.0), ("IND3", 5.2), ("IND5", 2.7)]
            .iter()
            .map(|(k, v)| (k.to_string(), *v))
            .collect();

        let opts = MixedModelOptions::with_heritability(0.4);
        let rr = rr_blup(&geno, &pheno, Some(opts.clone())).unwrap();

        let kin = vanraden_kinship(&geno, None).unwrap();
        let g = gblup(&kin, &pheno, Some(opts)).unwrap();
        assert_eq!(g.ridge_applied, 0.0);
        let bv = g.breeding_values().unwrap();
        for i in 0..5 {
            assert_relative_eq!(rr.gebv[i], bv.values[i], epsilon = 1e-8);
        }
        assert_relative_eq!(rr.intercept, g.fixed_effects[0], epsilon = 1e-8);

        let predicted = rr.predict(&geno).unwrap();
        assert_relative_eq!(predicted[3], rr.gebv[3], epsilon = 1e-12);
    }
}
