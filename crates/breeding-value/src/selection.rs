//! Candidate ranking and expected response to selection.

use breed_core::{BreedError, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub id: String,
    pub ebv: f64,
    pub reliability: Option<f64>,
}

impl Candidate {
    pub fn new(id: impl Into<String>, ebv: f64) -> Self {
        Self {
            id: id.into(),
            ebv,
            reliability: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedCandidate {
    /// 1-based
    pub rank: usize,
    pub candidate: Candidate,
    pub selected: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectionSummary {
    pub n_candidates: usize,
    pub n_selected: usize,
    pub proportion: f64,
    pub mean_all: f64,
    pub mean_selected: f64,
    /// `mean_selected − mean_all`
    pub selection_differential: f64,
    /// Tabulated intensity for `proportion`
    pub intensity: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateRanking {
    pub ranked: Vec<RankedCandidate>,
    pub summary: SelectionSummary,
}

impl CandidateRanking {
    pub fn selected(&self) -> impl Iterator<Item = &Candidate> {
        self.ranked.iter().filter(|r| r.selected).map(|r| &r.candidate)
    }

    /// Candidates in ranked order, e.g. to feed back into [`rank_candidates`].
    pub fn candidates(&self) -> Vec<Candidate> {
        self.ranked.iter().map(|r| r.candidate.clone()).collect()
    }
}

/// Standardised selection intensity for a selected proportion.
pub fn selection_intensity_for(proportion: f64) -> f64 {
    match proportion {
        p if p <= 0.01 => 2.67,
        p if p <= 0.05 => 2.06,
        p if p <= 0.10 => 1.755,
        p if p <= 0.20 => 1.40,
        _ => 0.80,
    }
}

/// Expected response `R = i · r · σg`.
pub fn selection_response(accuracy: f64, proportion: f64, genetic_sd: f64) -> f64 {
    selection_intensity_for(proportion) * accuracy * genetic_sd
}

/// Sort candidates by breeding value, highest first, and select the top
/// `max(1, ⌊n · proportion⌋)`. Equal values keep their input order.
pub fn rank_candidates(entries: &[Candidate], selection_proportion: f64) -> Result<CandidateRanking> {
    if entries.is_empty() {
        return Err(BreedError::invalid("no candidates to rank"));
    }
    if !(selection_proportion > 0.0 && selection_proportion <= 1.0) {
        return Err(BreedError::invalid(format!(
            "selection proportion must lie in (0, 1], got {}",
            selection_proportion
        )));
    }
    if let Some(bad) = entries.iter().find(|c| !c.ebv.is_finite()) {
        return Err(BreedError::invalid(format!(
            "candidate '{}' has a non-finite breeding value",
            bad.id
        )));
    }

    let n = entries.len();
    let n_selected = ((n as f64 * selection_proportion).floor() as usize).max(1);
    let mut order: Vec<&Candidate> = entries.iter().collect();
    order.sort_by(|a, b| b.ebv.total_cmp(&a.ebv));

    let ranked: Vec<RankedCandidate> = order
        .into_iter()
        .enumerate()
        .map(|(i, c)| RankedCandidate {
            rank: i + 1,
            candidate: c.clone(),
            selected: i < n_selected,
        })
        .collect();

    let mean_all = entries.iter().map(|c| c.ebv).sum::<f64>() / n as f64;
    let mean_selected = ranked[..n_selected].iter().map(|r| r.candidate.ebv).sum::<f64>() / n_selected as f64;

    Ok(CandidateRanking {
        ranked,
        summary: SelectionSummary {
            n_candidates: n,
            n_selected,
            proportion: selection_proportion,
            mean_all,
            mean_selected,
            selection_differential: mean_selected - mean_all,
            intensity: selection_intensity_for(selection_proportion),
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn entries() -> Vec<Candidate> {
        vec![
            Candidate::new("a", 1.0),
            Candidate::new("b", 3.0),
            Candidate::new("c", 2.0),
            Candidate::new("d", 3.0),
            Candidate::new("e", -1.0),
        ]
    }

    #[test]
    fn test_descending_and_stable() {
        let r = rank_candidates(&entries(), 0.4).unwrap();
        let ids: Vec<&str> = r.ranked.iter().map(|x| x.candidate.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "d", "c", "a", "e"]);
        assert_eq!(r.summary.n_selected, 2);
        assert_relative_eq!(r.summary.mean_all, 1.6);
        assert_relative_eq!(r.summary.mean_selected, 3.0);
        assert_relative_eq!(r.summary.selection_differential, 1.4, epsilon = 1e-12);
    }

    #[test]
    fn test_at_least_one_selected() {
        let r = rank_candidates(&entries(), 0.01).unwrap();
        assert_eq!(r.summary.n_selected, 1);
        assert_eq!(r.selected().count(), 1);
        assert_eq!(r.summary.intensity, 2.67);
    }

    #[test]
    fn test_rejects_bad_input() {
        assert!(rank_candidates(&[], 0.1).is_err());
        assert!(rank_candidates(&entries(), 0.0).is_err());
        let mut e = entries();
        e[2].ebv = f64::NAN;
        assert!(rank_candidates(&e, 0.1).is_err());
    }

    #[test]
    fn test_intensity_table_and_response() {
        assert_eq!(selection_intensity_for(0.05), 2.06);
        assert_eq!(selection_intensity_for(0.1), 1.755);
        assert_eq!(selection_intensity_for(0.5), 0.80);
        assert_relative_eq!(selection_response(0.6, 0.2, 2.0), 1.4 * 0.6 * 2.0);
    }
}
