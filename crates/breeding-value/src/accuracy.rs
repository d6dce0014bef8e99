//! Prediction accuracy and k-fold cross-validation.

use blup_rs::{gblup, rr_blup, MixedModelOptions};
use breed_core::numeric::{mean, pearson};
use breed_core::{BreedError, GenotypeMatrix, Result};
use kinship_rs::{vanraden_kinship, KinshipOptions};
use log::{debug, info};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccuracyReport {
    pub n: usize,
    /// Pearson correlation; 0 when either side has no variance
    pub correlation: f64,
    pub r_squared: f64,
    pub mse: f64,
    pub rmse: f64,
    /// Mean of `predicted − observed`
    pub bias: f64,
}

pub fn calculate_accuracy(predicted: &[f64], observed: &[f64]) -> Result<AccuracyReport> {
    let n = predicted.len();
    if n != observed.len() {
        return Err(BreedError::dimension("observed values", n, observed.len()));
    }
    if n < 3 {
        return Err(BreedError::invalid(format!("accuracy needs at least 3 pairs, got {}", n)));
    }
    if predicted.iter().chain(observed).any(|v| !v.is_finite()) {
        return Err(BreedError::invalid("accuracy inputs contain missing values"));
    }
    let correlation = pearson(predicted, observed);
    let mse = predicted.iter().zip(observed).map(|(p, o)| (p - o).powi(2)).sum::<f64>() / n as f64;
    let bias = predicted.iter().zip(observed).map(|(p, o)| p - o).sum::<f64>() / n as f64;
    Ok(AccuracyReport {
        n,
        correlation,
        r_squared: correlation * correlation,
        mse,
        rmse: mse.sqrt(),
        bias,
    })
}

/// Prediction model evaluated by [`cross_validate`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CvMethod {
    Gblup,
    RrBlup,
}

impl CvMethod {
    pub fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "gblup" => Ok(CvMethod::Gblup),
            "rrblup" | "rr-blup" => Ok(CvMethod::RrBlup),
            other => Err(BreedError::invalid(format!(
                "Unknown cross-validation method: {}. Use: gblup or rrblup",
                other
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CvMethod::Gblup => "GBLUP",
            CvMethod::RrBlup => "rrBLUP",
        }
    }
}

/// Options for k-fold cross-validation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CvOptions {
    pub method: CvMethod,
    /// Number of folds (default: 5)
    pub k_folds: usize,
    /// Independent fold assignments (default: 1)
    pub repeats: usize,
    /// Seed for fold assignment (default: 42)
    pub seed: u64,
    pub model: MixedModelOptions,
}

impl Default for CvOptions {
    fn default() -> Self {
        Self {
            method: CvMethod::Gblup,
            k_folds: 5,
            repeats: 1,
            seed: 42,
            model: MixedModelOptions::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FoldResult {
    pub repeat: usize,
    pub fold: usize,
    pub n_train: usize,
    pub n_test: usize,
    /// Correlation of predicted breeding values with held-out phenotypes
    pub accuracy: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrossValidationResult {
    pub method: CvMethod,
    pub folds: Vec<FoldResult>,
    pub mean_accuracy: f64,
    /// Standard error of the fold accuracies
    pub se_accuracy: f64,
}

/// Phenotyped individuals shuffled into `k` folds; returns fold index per id.
fn assign_folds(ids: &[String], k: usize, seed: u64) -> Vec<usize> {
    let mut order: Vec<usize> = (0..ids.len()).collect();
    let mut rng = StdRng::seed_from_u64(seed);
    order.shuffle(&mut rng);
    let mut folds = vec![0; ids.len()];
    for (pos, &i) in order.iter().enumerate() {
        folds[i] = pos % k;
    }
    folds
}

pub fn cross_validate(
    geno: &GenotypeMatrix,
    phenotypes: &HashMap<String, f64>,
    options: Option<CvOptions>,
) -> Result<CrossValidationResult> {
    let opts = options.unwrap_or_default();
    opts.model.validate()?;
    let ids: Vec<String> = geno
        .sample_ids
        .iter()
        .filter(|id| phenotypes.get(*id).is_some_and(|v| v.is_finite()))
        .cloned()
        .collect();
    if opts.k_folds < 2 || opts.repeats == 0 {
        return Err(BreedError::invalid(format!(
            "cross-validation needs k_folds >= 2 and repeats >= 1, got {} and {}",
            opts.k_folds, opts.repeats
        )));
    }
    if ids.len() < 2 * opts.k_folds {
        return Err(BreedError::invalid(format!(
            "{} phenotyped individuals are too few for {}-fold cross-validation",
            ids.len(),
            opts.k_folds
        )));
    }

    let kinship = match opts.method {
        CvMethod::Gblup => Some(vanraden_kinship(geno, Some(KinshipOptions::default()))?),
        CvMethod::RrBlup => None,
    };

    let mut folds = Vec::with_capacity(opts.k_folds * opts.repeats);
    for repeat in 0..opts.repeats {
        let assignment = assign_folds(&ids, opts.k_folds, opts.seed.wrapping_add(repeat as u64));
        for fold in 0..opts.k_folds {
            let train: HashMap<String, f64> = ids
                .iter()
                .zip(&assignment)
                .filter(|&(_, &f)| f != fold)
                .map(|(id, _)| (id.clone(), phenotypes[id]))
                .collect();
            let test: Vec<&String> = ids
                .iter()
                .zip(&assignment)
                .filter(|&(_, &f)| f == fold)
                .map(|(id, _)| id)
                .collect();

            let predicted: HashMap<String, f64> = match &kinship {
                Some(k) => {
                    let sol = gblup(k, &train, Some(opts.model.clone()))?;
                    let bv = sol
                        .breeding_values()
                        .ok_or_else(|| BreedError::invalid("GBLUP returned no genetic term"))?;
                    bv.levels.iter().cloned().zip(bv.values.iter().copied()).collect()
                }
                None => {
                    let fit = rr_blup(geno, &train, Some(opts.model.clone()))?;
                    fit.sample_ids.iter().cloned().zip(fit.gebv.iter().copied()).collect()
                }
            };
            let pred: Vec<f64> = test.iter().map(|id| predicted[id.as_str()]).collect();
            let obs: Vec<f64> = test.iter().map(|id| phenotypes[*id]).collect();
            let accuracy = pearson(&pred, &obs);
            debug!("Repeat {} fold {}: r = {:.3} ({} test)", repeat + 1, fold + 1, accuracy, test.len());
            folds.push(FoldResult {
                repeat,
                fold,
                n_train: train.len(),
                n_test: test.len(),
                accuracy,
            });
        }
    }

    let accs: Vec<f64> = folds.iter().map(|f| f.accuracy).collect();
    let mean_accuracy = mean(&accs);
    let sd = (accs.iter().map(|a| (a - mean_accuracy).powi(2)).sum::<f64>() / accs.len() as f64).sqrt();
    let se_accuracy = sd / (accs.len() as f64).sqrt();
    info!(
        "{} {}-fold cross-validation x {}: mean r = {:.3} (SE {:.3})",
        opts.method.as_str(),
        opts.k_folds,
        opts.repeats,
        mean_accuracy,
        se_accuracy
    );

    Ok(CrossValidationResult {
        method: opts.method,
        folds,
        mean_accuracy,
        se_accuracy,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_accuracy_metrics() {
        let r = calculate_accuracy(&[1.0, 2.0, 3.0, 4.0], &[1.5, 2.5, 3.5, 4.5]).unwrap();
        assert_relative_eq!(r.correlation, 1.0, epsilon = 1e-12);
        assert_relative_eq!(r.r_squared, 1.0, epsilon = 1e-12);
        assert_relative_eq!(r.mse, 0.25, epsilon = 1e-12);
        assert_relative_eq!(r.rmse, 0.5, epsilon = 1e-12);
        assert_relative_eq!(r.bias, -0.5, epsilon = 1e-12);
    }

    #[test]
    fn test_accuracy_input_checks() {
        assert!(calculate_accuracy(&[1.0, 2.0], &[1.0, 2.0]).is_err());
        let err = calculate_accuracy(&[1.0, 2.0, 3.0], &[1.0, 2.0]).unwrap_err();
        assert_eq!(err.kind(), breed_core::ErrorKind::DimensionMismatch);
        let flat = calculate_accuracy(&[2.0, 2.0, 2.0], &[1.0, 2.0, 3.0]).unwrap();
        assert_eq!(flat.correlation, 0.0);
    }

    #[test]
    fn test_fold_assignment_balanced_and_seeded() {
        let ids: Vec<String> = (0..11).map(|i| format!("s{}", i)).collect();
        let a = assign_folds(&ids, 3, 7);
        let b = assign_folds(&ids, 3, 7);
        assert_eq!(a, b);
        let mut counts = [0; 3];
        for f in &a {
            counts[*f] += 1;
        }
        assert_eq!(counts, [4, 4, 3]);
    }

    #[test]
    fn test_method_parsing() {
        assert_eq!(CvMethod::from_str("GBLUP").unwrap(), CvMethod::Gblup);
        assert_eq!(CvMethod::from_str("rrblup").unwrap(), CvMethod::RrBlup);
        assert!(CvMethod::from_str("bayesB").is_err());
    }
}
