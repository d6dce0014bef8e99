//! Orchestration over the relationship and mixed-model layers.
//!
//! [`BreedingValueService`] holds configuration only. Past analyses live in an
//! [`AnalysisStore`] the caller passes in, so two services never share state.

use blup_rs::{gblup, MixedModelOptions, MixedModelSolution, INTERCEPT};
use breed_core::{BreedError, GenotypeMatrix, PedigreeRecord, RelationshipMatrix, Result};
use kinship_rs::{numerator_relationship, vanraden_kinship, KinshipOptions};
use log::info;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::accuracy::{calculate_accuracy, AccuracyReport};
use crate::cross::{predict_cross, CrossOptions, CrossPrediction};
use crate::selection::{rank_candidates, Candidate, CandidateRanking};
use crate::store::{AnalysisKind, AnalysisRecord, AnalysisStore, StoredBreedingValue};

/// Breeding values from one estimation run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreedingValueReport {
    /// Set when the run was recorded in a store
    pub analysis_id: Option<Uuid>,
    pub kind: AnalysisKind,
    pub solution: MixedModelSolution,
    /// Every individual of the relationship matrix, in matrix order
    pub candidates: Vec<Candidate>,
}

impl BreedingValueReport {
    /// GLS estimate of the population mean.
    pub fn trait_mean(&self) -> f64 {
        self.solution.fixed_effect(INTERCEPT).unwrap_or(0.0)
    }

    pub fn ebv(&self, id: &str) -> Option<f64> {
        self.candidates.iter().find(|c| c.id == id).map(|c| c.ebv)
    }

    pub fn ebv_map(&self) -> HashMap<String, f64> {
        self.candidates.iter().map(|c| (c.id.clone(), c.ebv)).collect()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BreedingValueService {
    pub model: MixedModelOptions,
    pub cross: CrossOptions,
    /// Label written into stored records (default: "value")
    pub trait_name: Option<String>,
}

impl BreedingValueService {
    pub fn new(model: MixedModelOptions, cross: CrossOptions) -> Self {
        Self {
            model,
            cross,
            trait_name: None,
        }
    }

    pub fn with_heritability(h2: f64) -> Self {
        Self::new(MixedModelOptions::with_heritability(h2), CrossOptions::default())
    }

    /// GBLUP on a VanRaden relationship matrix built from `geno`.
    pub fn estimate_genomic(
        &self,
        geno: &GenotypeMatrix,
        phenotypes: &HashMap<String, f64>,
        kinship_options: Option<KinshipOptions>,
        store: Option<&mut dyn AnalysisStore>,
    ) -> Result<BreedingValueReport> {
        let kinship = vanraden_kinship(geno, kinship_options)?;
        self.estimate(AnalysisKind::Genomic, &kinship, phenotypes, Some(geno.n_markers()), store)
    }

    /// BLUP on the numerator relationship matrix of a pedigree.
    pub fn estimate_pedigree(
        &self,
        records: &[PedigreeRecord],
        phenotypes: &HashMap<String, f64>,
        store: Option<&mut dyn AnalysisStore>,
    ) -> Result<BreedingValueReport> {
        let a = numerator_relationship(records)?;
        self.estimate(AnalysisKind::Pedigree, &a, phenotypes, None, store)
    }

    fn estimate(
        &self,
        kind: AnalysisKind,
        relationship: &RelationshipMatrix,
        phenotypes: &HashMap<String, f64>,
        n_markers: Option<usize>,
        store: Option<&mut dyn AnalysisStore>,
    ) -> Result<BreedingValueReport> {
        let solution = gblup(relationship, phenotypes, Some(self.model.clone()))?;
        let bv = solution
            .breeding_values()
            .ok_or_else(|| BreedError::invalid("model has no genetic term"))?;
        let candidates: Vec<Candidate> = bv
            .levels
            .iter()
            .zip(&bv.values)
            .zip(&bv.reliability)
            .map(|((id, &ebv), &rel)| Candidate {
                id: id.clone(),
                ebv,
                reliability: Some(rel),
            })
            .collect();

        let mut report = BreedingValueReport {
            analysis_id: None,
            kind,
            solution,
            candidates,
        };
        info!(
            "{}: {} individuals, {} phenotyped",
            kind.as_str(),
            report.candidates.len(),
            report.solution.n_obs
        );

        if let Some(store) = store {
            let id = Uuid::new_v4();
            store.save(self.record(id, &report, phenotypes, n_markers)?)?;
            info!("Stored {} analysis {}", kind.as_str(), id);
            report.analysis_id = Some(id);
        }
        Ok(report)
    }

    fn record(
        &self,
        id: Uuid,
        report: &BreedingValueReport,
        phenotypes: &HashMap<String, f64>,
        n_markers: Option<usize>,
    ) -> Result<AnalysisRecord> {
        let ranking = rank_candidates(&report.candidates, 1.0)?;
        let breeding_values = ranking
            .ranked
            .into_iter()
            .map(|r| StoredBreedingValue {
                rank: r.rank,
                phenotype: phenotypes.get(&r.candidate.id).copied().filter(|v| v.is_finite()),
                id: r.candidate.id,
                ebv: r.candidate.ebv,
                reliability: r.candidate.reliability.unwrap_or(0.0),
            })
            .collect();
        Ok(AnalysisRecord {
            id,
            kind: report.kind,
            trait_name: self.trait_name.clone().unwrap_or_else(|| "value".to_string()),
            heritability: self.model.heritability,
            n_individuals: report.candidates.len(),
            n_phenotyped: report.solution.n_obs,
            n_markers,
            overall_mean: report.trait_mean(),
            variance: report.solution.variance.clone(),
            breeding_values,
        })
    }

    /// Progeny prediction with the service's heritability and cross options.
    pub fn predict_cross(&self, ebv1: f64, ebv2: f64, trait_mean: f64) -> Result<CrossPrediction> {
        predict_cross(ebv1, ebv2, trait_mean, self.model.heritability, Some(self.cross.clone()))
    }

    pub fn rank_candidates(&self, entries: &[Candidate], selection_proportion: f64) -> Result<CandidateRanking> {
        rank_candidates(entries, selection_proportion)
    }

    pub fn calculate_accuracy(&self, predicted: &[f64], observed: &[f64]) -> Result<AccuracyReport> {
        calculate_accuracy(predicted, observed)
    }

    pub fn load_analysis(&self, store: &dyn AnalysisStore, id: &Uuid) -> Result<Option<AnalysisRecord>> {
        store.load(id)
    }
}
