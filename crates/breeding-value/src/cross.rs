//! Progeny prediction for planned crosses.
//!
//! The progeny mean is the mid-parent breeding value. Its spread is the
//! Mendelian sampling variance `0.5·h²·(1 − h²)·σ²p`, or, when marker effects
//! are available, the segregation variance implied by the parents'
//! heterozygous loci. Usefulness is `mean + i·σ` (Schnell & Utz).

use breed_core::{BreedError, GenotypeMatrix, RelationshipMatrix, Result};
use kinship_rs::{pairwise_distance, DistanceMethod};
use log::debug;
use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, Normal};
use std::collections::HashMap;

/// Options for cross prediction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrossOptions {
    /// Selection intensity used in the usefulness criterion (default: 2.06, top 5%)
    pub selection_intensity: f64,
    /// Phenotypic variance scaling the Mendelian sampling variance (default: 1.0)
    pub phenotypic_variance: f64,
    /// Phenotype a progeny must exceed to count as superior; `None` uses the trait mean.
    pub superior_threshold: Option<f64>,
}

impl Default for CrossOptions {
    fn default() -> Self {
        Self {
            selection_intensity: 2.06,
            phenotypic_variance: 1.0,
            superior_threshold: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionRange {
    pub low: f64,
    pub high: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrossPrediction {
    pub parent1: Option<String>,
    pub parent2: Option<String>,
    /// Expected progeny breeding value (mid-parent)
    pub predicted_mean: f64,
    /// Trait mean plus the predicted breeding value
    pub predicted_phenotype: f64,
    pub predicted_variance: f64,
    pub usefulness_criterion: f64,
    /// Predicted phenotype ± 2 SD
    pub range: PredictionRange,
    /// P(progeny phenotype > threshold)
    pub superior_probability: f64,
    /// Modified Rogers distance between the parents
    pub genetic_distance: Option<f64>,
    /// Expected inbreeding of the progeny
    pub progeny_inbreeding: Option<f64>,
}

fn check_heritability(h2: f64) -> Result<()> {
    if !(h2 > 0.0 && h2 <= 1.0) {
        return Err(BreedError::invalid(format!("heritability must lie in (0, 1], got {}", h2)));
    }
    Ok(())
}

fn superior_probability(mean: f64, variance: f64, threshold: f64) -> Result<f64> {
    if variance <= 0.0 {
        return Ok(if mean > threshold { 1.0 } else { 0.0 });
    }
    let normal = Normal::new(mean, variance.sqrt()).map_err(|e| BreedError::invalid(e.to_string()))?;
    Ok(normal.sf(threshold))
}

fn assemble(
    parents: (Option<&str>, Option<&str>),
    ebv1: f64,
    ebv2: f64,
    trait_mean: f64,
    variance: f64,
    opts: &CrossOptions,
) -> Result<CrossPrediction> {
    if !(ebv1.is_finite() && ebv2.is_finite() && trait_mean.is_finite()) {
        return Err(BreedError::invalid(format!(
            "cross inputs must be finite (ebv1 = {}, ebv2 = {}, mean = {})",
            ebv1, ebv2, trait_mean
        )));
    }
    let predicted_mean = 0.5 * (ebv1 + ebv2);
    let predicted_phenotype = trait_mean + predicted_mean;
    let sd = variance.max(0.0).sqrt();
    let threshold = opts.superior_threshold.unwrap_or(trait_mean);
    Ok(CrossPrediction {
        parent1: parents.0.map(str::to_string),
        parent2: parents.1.map(str::to_string),
        predicted_mean,
        predicted_phenotype,
        predicted_variance: variance,
        usefulness_criterion: predicted_mean + opts.selection_intensity * sd,
        range: PredictionRange {
            low: predicted_phenotype - 2.0 * sd,
            high: predicted_phenotype + 2.0 * sd,
        },
        superior_probability: superior_probability(predicted_phenotype, variance, threshold)?,
        genetic_distance: None,
        progeny_inbreeding: None,
    })
}

/// Predict progeny of two parents from their breeding values alone.
pub fn predict_cross(
    ebv1: f64,
    ebv2: f64,
    trait_mean: f64,
    heritability: f64,
    options: Option<CrossOptions>,
) -> Result<CrossPrediction> {
    let opts = options.unwrap_or_default();
    check_heritability(heritability)?;
    let variance = 0.5 * heritability * (1.0 - heritability) * opts.phenotypic_variance;
    assemble((None, None), ebv1, ebv2, trait_mean, variance, &opts)
}

/// Genotyped parents with their breeding values.
#[derive(Debug, Clone, Copy)]
pub struct ParentPanel<'a> {
    pub geno: &'a GenotypeMatrix,
    pub ebvs: &'a HashMap<String, f64>,
    /// Used for progeny inbreeding; identity-by-state is used without it
    pub kinship: Option<&'a RelationshipMatrix>,
    /// Marker effects in `geno` marker order; enables segregation variance
    pub marker_effects: Option<&'a [f64]>,
}

impl<'a> ParentPanel<'a> {
    fn row(&self, id: &str) -> Result<usize> {
        self.geno
            .sample_index(id)
            .ok_or_else(|| BreedError::invalid(format!("parent '{}' is not genotyped", id)))
    }

    fn ebv(&self, id: &str) -> Result<f64> {
        self.ebvs
            .get(id)
            .copied()
            .ok_or_else(|| BreedError::invalid(format!("parent '{}' has no breeding value", id)))
    }

    /// Sum of `a²` weighted by 0.25 per heterozygous parent at each locus.
    fn segregation_variance(&self, r1: usize, r2: usize, effects: &[f64]) -> f64 {
        let ploidy = self.geno.ploidy as f64;
        let het = |x: f64| x > 0.0 && x < ploidy;
        effects
            .iter()
            .enumerate()
            .map(|(j, a)| {
                let n_het = usize::from(het(self.geno.dosages[(r1, j)])) + usize::from(het(self.geno.dosages[(r2, j)]));
                a * a * 0.25 * n_het as f64
            })
            .sum()
    }

    fn progeny_inbreeding(&self, p1: &str, p2: &str, r1: usize, r2: usize) -> Result<f64> {
        if let Some(k) = self.kinship {
            return k
                .get(p1, p2)
                .map(|k12| 0.5 * k12)
                .ok_or_else(|| BreedError::invalid(format!("parents '{}'/'{}' missing from relationship matrix", p1, p2)));
        }
        let m = self.geno.n_markers().max(1) as f64;
        let same = self
            .geno
            .dosages
            .row(r1)
            .iter()
            .zip(self.geno.dosages.row(r2).iter())
            .filter(|(a, b)| (*a - *b).abs() < 1e-9)
            .count();
        Ok(0.5 * same as f64 / m)
    }
}

/// Predict a cross between two genotyped parents, adding genetic distance and
/// expected progeny inbreeding.
pub fn predict_cross_with_genotypes(
    panel: &ParentPanel,
    parent1: &str,
    parent2: &str,
    trait_mean: f64,
    heritability: f64,
    options: Option<CrossOptions>,
) -> Result<CrossPrediction> {
    let opts = options.unwrap_or_default();
    check_heritability(heritability)?;
    let (r1, r2) = (panel.row(parent1)?, panel.row(parent2)?);

    let variance = match panel.marker_effects {
        Some(effects) => {
            if effects.len() != panel.geno.n_markers() {
                return Err(BreedError::dimension("marker effects", panel.geno.n_markers(), effects.len()));
            }
            panel.segregation_variance(r1, r2, effects)
        }
        None => 0.5 * heritability * (1.0 - heritability) * opts.phenotypic_variance,
    };

    let mut prediction = assemble(
        (Some(parent1), Some(parent2)),
        panel.ebv(parent1)?,
        panel.ebv(parent2)?,
        trait_mean,
        variance,
        &opts,
    )?;
    prediction.genetic_distance = Some(pairwise_distance(
        panel.geno.dosages.row(r1),
        panel.geno.dosages.row(r2),
        panel.geno.ploidy,
        DistanceMethod::ModifiedRogers,
    ));
    prediction.progeny_inbreeding = Some(panel.progeny_inbreeding(parent1, parent2, r1, r2)?);
    Ok(prediction)
}

/// Ordering key for [`rank_crosses`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CrossCriterion {
    Usefulness,
    Mean,
    Variance,
    SuperiorProbability,
}

impl CrossCriterion {
    pub fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "usefulness" => Ok(CrossCriterion::Usefulness),
            "mean" => Ok(CrossCriterion::Mean),
            "variance" => Ok(CrossCriterion::Variance),
            "superior_prob" | "superior" => Ok(CrossCriterion::SuperiorProbability),
            other => Err(BreedError::invalid(format!(
                "Unknown cross criterion: {}. Use: usefulness, mean, variance or superior_prob",
                other
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CrossCriterion::Usefulness => "usefulness",
            CrossCriterion::Mean => "mean",
            CrossCriterion::Variance => "variance",
            CrossCriterion::SuperiorProbability => "superior_prob",
        }
    }

    fn key(&self, p: &CrossPrediction) -> f64 {
        match self {
            CrossCriterion::Usefulness => p.usefulness_criterion,
            CrossCriterion::Mean => p.predicted_mean,
            CrossCriterion::Variance => p.predicted_variance,
            CrossCriterion::SuperiorProbability => p.superior_probability,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankCrossOptions {
    pub criterion: CrossCriterion,
    /// Drop crosses whose progeny inbreeding exceeds this (default: 0.25)
    pub max_inbreeding: Option<f64>,
    /// Drop crosses between parents closer than this
    pub min_distance: Option<f64>,
    /// Keep at most this many crosses (default: 20)
    pub top_n: Option<usize>,
}

impl Default for RankCrossOptions {
    fn default() -> Self {
        Self {
            criterion: CrossCriterion::Usefulness,
            max_inbreeding: Some(0.25),
            min_distance: None,
            top_n: Some(20),
        }
    }
}

/// Predict every pairwise cross among `parents` and rank them, best first.
pub fn rank_crosses(
    panel: &ParentPanel,
    parents: &[String],
    trait_mean: f64,
    heritability: f64,
    cross_options: Option<CrossOptions>,
    rank_options: Option<RankCrossOptions>,
) -> Result<Vec<CrossPrediction>> {
    let cross_opts = cross_options.unwrap_or_default();
    let rank_opts = rank_options.unwrap_or_default();
    if parents.len() < 2 {
        return Err(BreedError::invalid(format!("need at least 2 parents, got {}", parents.len())));
    }

    let mut crosses = Vec::new();
    let mut filtered = 0usize;
    for i in 0..parents.len() {
        for j in (i + 1)..parents.len() {
            let p = predict_cross_with_genotypes(
                panel,
                &parents[i],
                &parents[j],
                trait_mean,
                heritability,
                Some(cross_opts.clone()),
            )?;
            let too_inbred = matches!((rank_opts.max_inbreeding, p.progeny_inbreeding), (Some(max), Some(f)) if f > max);
            let too_close = matches!((rank_opts.min_distance, p.genetic_distance), (Some(min), Some(d)) if d < min);
            if too_inbred || too_close {
                filtered += 1;
                continue;
            }
            crosses.push(p);
        }
    }

    let criterion = rank_opts.criterion;
    crosses.sort_by(|a, b| criterion.key(b).total_cmp(&criterion.key(a)));
    if let Some(n) = rank_opts.top_n {
        crosses.truncate(n);
    }
    debug!(
        "Ranked {} crosses by {} ({} filtered)",
        crosses.len(),
        criterion.as_str(),
        filtered
    );
    Ok(crosses)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use breed_core::{standardize, GenotypeMatrixBuilder};

    #[test]
    fn test_average_parents_have_no_bias() {
        let e = 12.5;
        let p = predict_cross(e, e, e, 0.3, None).unwrap();
        assert_eq!(p.predicted_mean, e);
        assert_relative_eq!(p.predicted_variance, 0.5 * 0.3 * 0.7, epsilon = 1e-12);
        assert_relative_eq!(
            p.usefulness_criterion,
            e + 2.06 * p.predicted_variance.sqrt(),
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_mid_parent_and_range() {
        let p = predict_cross(2.0, 4.0, 10.0, 0.5, None).unwrap();
        assert_relative_eq!(p.predicted_mean, 3.0);
        assert_relative_eq!(p.predicted_phenotype, 13.0);
        let sd = (0.125f64).sqrt();
        assert_relative_eq!(p.range.low, 13.0 - 2.0 * sd, epsilon = 1e-12);
        assert!(p.superior_probability > 0.99);
    }

    #[test]
    fn test_invalid_heritability() {
        assert!(predict_cross(1.0, 1.0, 0.0, 0.0, None).is_err());
        assert!(predict_cross(1.0, 1.0, 0.0, 1.5, None).is_err());
        assert!(predict_cross(f64::NAN, 1.0, 0.0, 0.5, None).is_err());
    }

    fn panel_data() -> (GenotypeMatrix, HashMap<String, f64>) {
        let (geno, _) = GenotypeMatrixBuilder::new(None)
            .sample_ids(vec!["A".into(), "B".into(), "C".into()])
            .standardize(&[vec![0.0, 1.0, 2.0, 1.0], vec![2.0, 1.0, 0.0, 1.0], vec![0.0, 1.0, 2.0, 0.0]])
            .unwrap();
        let ebvs = [("A", 1.0), ("B", 3.0), ("C", 0.5)]
            .iter()
            .map(|(k, v)| (k.to_string(), *v))
            .collect();
        (geno, ebvs)
    }

    #[test]
    fn test_genotyped_cross_adds_distance_and_inbreeding() {
        let (geno, ebvs) = panel_data();
        let panel = ParentPanel {
            geno: &geno,
            ebvs: &ebvs,
            kinship: None,
            marker_effects: None,
        };
        let ab = predict_cross_with_genotypes(&panel, "A", "B", 0.0, 0.5, None).unwrap();
        assert_relative_eq!(ab.predicted_mean, 2.0);
        // |diffs| / 2 = 1, 0, 1, 0 over 4 markers
        assert_relative_eq!(ab.genetic_distance.unwrap(), (2.0f64 / 8.0).sqrt(), epsilon = 1e-12);
        // two of four loci identical in state
        assert_relative_eq!(ab.progeny_inbreeding.unwrap(), 0.25, epsilon = 1e-12);
        assert!(predict_cross_with_genotypes(&panel, "A", "Z", 0.0, 0.5, None).is_err());
    }

    #[test]
    fn test_segregation_variance_from_marker_effects() {
        let (geno, ebvs) = panel_data();
        let effects = [0.4, 1.0, 0.2, 0.5];
        let panel = ParentPanel {
            geno: &geno,
            ebvs: &ebvs,
            kinship: None,
            marker_effects: Some(&effects),
        };
        // A x B: both het at loci 2 and 4
        let ab = predict_cross_with_genotypes(&panel, "A", "B", 0.0, 0.5, None).unwrap();
        assert_relative_eq!(ab.predicted_variance, 0.5 * 1.0 + 0.5 * 0.25, epsilon = 1e-12);
    }

    #[test]
    fn test_rank_crosses_orders_by_criterion() {
        let raw = vec![vec![0.0, 1.0, 2.0], vec![2.0, 1.0, 0.0], vec![1.0, 1.0, 1.0], vec![2.0, 2.0, 0.0]];
        let (geno, _) = standardize(&raw, None).unwrap();
        let ebvs: HashMap<String, f64> = geno.sample_ids.iter().cloned().zip([1.0, 2.0, 3.0, 0.0]).collect();
        let panel = ParentPanel {
            geno: &geno,
            ebvs: &ebvs,
            kinship: None,
            marker_effects: None,
        };
        let opts = RankCrossOptions {
            criterion: CrossCriterion::Mean,
            max_inbreeding: None,
            ..Default::default()
        };
        let ranked = rank_crosses(&panel, &geno.sample_ids, 0.0, 0.4, None, Some(opts)).unwrap();
        assert_eq!(ranked.len(), 6);
        assert_eq!(ranked[0].parent1.as_deref(), Some("IND2"));
        assert_eq!(ranked[0].parent2.as_deref(), Some("IND3"));
        assert!(ranked.windows(2).all(|w| w[0].predicted_mean >= w[1].predicted_mean));
    }
}
