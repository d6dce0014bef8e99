//! Plot-ready summaries and output truncation.

use breed_core::{BreedError, Result};
use statrs::distribution::{ContinuousCDF, Normal};

use crate::types::{ManhattanPoint, MarkerRecord, OutputPolicy, QqPoint};

/// Median of the 1-df chi-square distribution.
const CHISQ1_MEDIAN: f64 = 0.454_936_423_119_572_7;

pub fn manhattan(records: &[MarkerRecord]) -> Vec<ManhattanPoint> {
    records
        .iter()
        .map(|r| ManhattanPoint {
            chrom: r.chrom.clone(),
            pos: r.pos,
            score: r.score,
        })
        .collect()
}

/// Expected vs observed -log10(p), strongest first. Expected uses `(i - 0.5)/m`.
pub fn qq(p_values: &[f64]) -> Vec<QqPoint> {
    let mut sorted: Vec<f64> = p_values.iter().copied().filter(|p| p.is_finite()).collect();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let m = sorted.len() as f64;
    sorted
        .iter()
        .enumerate()
        .map(|(i, &p)| QqPoint {
            expected: -((i as f64 + 0.5) / m).log10(),
            observed: -p.max(1e-300).log10(),
        })
        .collect()
}

/// Genomic inflation factor: median 1-df chi-square over its expectation.
pub fn genomic_inflation(p_values: &[f64]) -> Result<f64> {
    let normal = Normal::new(0.0, 1.0).map_err(|e| BreedError::invalid(e.to_string()))?;
    let mut chisq: Vec<f64> = p_values
        .iter()
        .filter(|p| p.is_finite())
        .map(|&p| {
            let z = normal.inverse_cdf((p / 2.0).clamp(1e-300, 0.5));
            z * z
        })
        .collect();
    if chisq.is_empty() {
        return Ok(f64::NAN);
    }
    chisq.sort_by(|a, b| a.total_cmp(b));
    let mid = chisq.len() / 2;
    let median = if chisq.len() % 2 == 0 {
        0.5 * (chisq[mid - 1] + chisq[mid])
    } else {
        chisq[mid]
    };
    Ok(median / CHISQ1_MEDIAN)
}

/// Apply `policy` to records already in genome order. Returns the kept
/// records (still in genome order) and whether anything was dropped.
pub fn apply_output_policy(records: Vec<MarkerRecord>, policy: OutputPolicy) -> (Vec<MarkerRecord>, bool) {
    let top_n = match policy {
        OutputPolicy::All => return (records, false),
        OutputPolicy::SignificantPlusTop(n) => n,
    };
    let mut rest: Vec<usize> = (0..records.len()).filter(|&i| !records[i].significant).collect();
    if rest.len() <= top_n {
        return (records, false);
    }
    rest.sort_by(|&a, &b| records[a].p_value.total_cmp(&records[b].p_value).then(a.cmp(&b)));
    let mut keep = vec![false; records.len()];
    for (i, r) in records.iter().enumerate() {
        keep[i] = r.significant;
    }
    for &i in rest.iter().take(top_n) {
        keep[i] = true;
    }
    let kept = records
        .into_iter()
        .zip(keep)
        .filter_map(|(r, k)| k.then_some(r))
        .collect();
    (kept, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn record(index: usize, p: f64, significant: bool) -> MarkerRecord {
        MarkerRecord {
            index,
            marker_id: format!("m{}", index),
            chrom: "1".into(),
            pos: index as u64 * 100,
            effect: 0.0,
            std_error: 1.0,
            statistic: 0.0,
            p_value: p,
            score: -p.log10(),
            maf: 0.3,
            n_obs: 10,
            significant,
        }
    }

    #[test]
    fn test_truncation_keeps_significant_and_top() {
        let records = vec![
            record(0, 0.5, false),
            record(1, 1e-9, true),
            record(2, 0.01, false),
            record(3, 0.2, false),
            record(4, 0.001, false),
        ];
        let (kept, truncated) = apply_output_policy(records, OutputPolicy::SignificantPlusTop(2));
        assert!(truncated);
        let ids: Vec<usize> = kept.iter().map(|r| r.index).collect();
        assert_eq!(ids, vec![1, 2, 4]);
    }

    #[test]
    fn test_truncation_noop_when_small() {
        let records = vec![record(0, 0.5, false), record(1, 0.2, false)];
        let (kept, truncated) = apply_output_policy(records, OutputPolicy::SignificantPlusTop(5));
        assert!(!truncated);
        assert_eq!(kept.len(), 2);
    }

    #[test]
    fn test_qq_sorted() {
        let points = qq(&[0.5, 0.01, 0.2, 0.9]);
        assert_eq!(points.len(), 4);
        assert_relative_eq!(points[0].observed, 2.0, epsilon = 1e-12);
        assert_relative_eq!(points[0].expected, -(0.125f64).log10(), epsilon = 1e-12);
        assert!(points.windows(2).all(|w| w[0].observed >= w[1].observed));
    }

    #[test]
    fn test_inflation_near_one_for_uniform_p() {
        let p: Vec<f64> = (1..=999).map(|i| i as f64 / 1000.0).collect();
        let lambda = genomic_inflation(&p).unwrap();
        assert!((lambda - 1.0).abs() < 0.01, "lambda = {}", lambda);
    }
}
