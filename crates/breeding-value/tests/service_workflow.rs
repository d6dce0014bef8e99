use approx::assert_relative_eq;
use breed_core::{standardize, GenotypeMatrix, PedigreeRecord};
use breeding_value::{
    calculate_accuracy, cross_validate, predict_cross, rank_candidates, AnalysisKind, AnalysisStore,
    BreedingValueService, Candidate, CvMethod, CvOptions, MemoryStore,
};
use std::collections::HashMap;

fn splitmix(x: u64) -> u64 {
    let mut z = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// 24 individuals x 40 markers; the trait is the dosage sum of the first 6 markers plus noise.
fn genomic_panel() -> (GenotypeMatrix, HashMap<String, f64>) {
    let raw: Vec<Vec<f64>> = (0..24)
        .map(|i| {
            (0..40)
                .map(|j| (splitmix((i * 100 + j) as u64) % 3) as f64)
                .collect()
        })
        .collect();
    let (geno, _) = standardize(&raw, None).unwrap();
    let pheno = raw
        .iter()
        .enumerate()
        .map(|(i, row)| {
            let noise = (splitmix(9000 + i as u64) % 100) as f64 / 200.0;
            (geno.sample_ids[i].clone(), 20.0 + row[..6].iter().sum::<f64>() + noise)
        })
        .collect();
    (geno, pheno)
}

// ============================================================
// Cross prediction and ranking properties
// ============================================================
#[test]
fn average_parents_predict_their_own_value() {
    for &e in &[-3.5, 0.0, 0.25, 7.0, 150.0] {
        for &h2 in &[0.1, 0.5, 0.9, 1.0] {
            let p = predict_cross(e, e, e, h2, None).unwrap();
            assert_eq!(p.predicted_mean, e);
            assert!(p.predicted_variance >= 0.0);
            assert!(p.usefulness_criterion >= p.predicted_mean);
        }
    }
}

#[test]
fn ranking_is_idempotent() {
    let entries: Vec<Candidate> = [("L1", 0.4), ("L2", 1.2), ("L3", 0.4), ("L4", -0.3), ("L5", 1.2), ("L6", 0.9)]
        .iter()
        .map(|(id, ebv)| Candidate::new(*id, *ebv))
        .collect();

    let first = rank_candidates(&entries, 0.5).unwrap();
    let again = rank_candidates(&entries, 0.5).unwrap();
    assert_eq!(first, again);

    let reranked = rank_candidates(&first.candidates(), 0.5).unwrap();
    assert_eq!(reranked, first);

    let order: Vec<&str> = first.ranked.iter().map(|r| r.candidate.id.as_str()).collect();
    assert_eq!(order, vec!["L2", "L5", "L6", "L1", "L3", "L4"]);
    let selected: Vec<&str> = first.selected().map(|c| c.id.as_str()).collect();
    assert_eq!(selected, vec!["L2", "L5", "L6"]);
}

// ============================================================
// Estimation through the service
// ============================================================
#[test]
fn pedigree_estimate_is_recorded_in_caller_store() {
    let ped = vec![
        PedigreeRecord::founder("S"),
        PedigreeRecord::founder("D1"),
        PedigreeRecord::founder("D2"),
        PedigreeRecord::new("HS1", Some("S"), Some("D1")),
        PedigreeRecord::new("HS2", Some("S"), Some("D2")),
        PedigreeRecord::new("FS", Some("S"), Some("D1")),
    ];
    let pheno: HashMap<String, f64> = [("S", 12.0), ("D1", 9.0), ("D2", 11.0), ("HS1", 10.5), ("HS2", 12.5)]
        .iter()
        .map(|(k, v)| (k.to_string(), *v))
        .collect();

    let service = BreedingValueService::with_heritability(0.3);
    let mut store = MemoryStore::new();
    let report = service.estimate_pedigree(&ped, &pheno, Some(&mut store)).unwrap();

    let id = report.analysis_id.unwrap();
    assert_eq!(store.list().unwrap(), vec![id]);
    let record = service.load_analysis(&store, &id).unwrap().unwrap();
    assert_eq!(record.kind, AnalysisKind::Pedigree);
    assert_eq!(record.n_individuals, 6);
    assert_eq!(record.n_phenotyped, 5);
    assert!(record.breeding_values.windows(2).all(|w| w[0].ebv >= w[1].ebv));
    assert_eq!(record.breeding_values[0].rank, 1);
    let fs = record.breeding_values.iter().find(|b| b.id == "FS").unwrap();
    assert!(fs.phenotype.is_none());

    // unphenotyped, childless individual gets its parent average
    let parent_avg = 0.5 * (report.ebv("S").unwrap() + report.ebv("D1").unwrap());
    assert_relative_eq!(report.ebv("FS").unwrap(), parent_avg, epsilon = 1e-9);

    // a second run adds a second record
    let other = service.estimate_pedigree(&ped, &pheno, Some(&mut store)).unwrap();
    assert_ne!(other.analysis_id, report.analysis_id);
    assert_eq!(store.len(), 2);
}

#[test]
fn genomic_estimate_feeds_ranking_and_accuracy() {
    let (geno, pheno) = genomic_panel();
    let service = BreedingValueService::with_heritability(0.5);
    let report = service.estimate_genomic(&geno, &pheno, None, None).unwrap();
    assert!(report.analysis_id.is_none());
    assert_eq!(report.kind, AnalysisKind::Genomic);
    assert_eq!(report.candidates.len(), 24);

    let ebv: Vec<f64> = geno.sample_ids.iter().map(|id| report.ebv(id).unwrap()).collect();
    let obs: Vec<f64> = geno.sample_ids.iter().map(|id| pheno[id]).collect();
    let acc = service.calculate_accuracy(&ebv, &obs).unwrap();
    assert!(acc.correlation > 0.5);
    assert_relative_eq!(acc.r_squared, acc.correlation.powi(2));

    let ranking = service.rank_candidates(&report.candidates, 0.25).unwrap();
    assert_eq!(ranking.summary.n_selected, 6);
    assert!(ranking.summary.selection_differential > 0.0);

    let top = &ranking.ranked[0].candidate;
    let cross = service.predict_cross(top.ebv, top.ebv, report.trait_mean()).unwrap();
    assert_eq!(cross.predicted_mean, top.ebv);
}

// ============================================================
// Cross-validation
// ============================================================
#[test]
fn cross_validation_is_reproducible_by_seed() {
    let (geno, pheno) = genomic_panel();
    let opts = CvOptions {
        k_folds: 4,
        repeats: 2,
        seed: 11,
        ..Default::default()
    };
    let a = cross_validate(&geno, &pheno, Some(opts.clone())).unwrap();
    let b = cross_validate(&geno, &pheno, Some(opts)).unwrap();
    assert_eq!(a, b);
    assert_eq!(a.folds.len(), 8);
    for repeat in 0..2 {
        let tested: usize = a.folds.iter().filter(|f| f.repeat == repeat).map(|f| f.n_test).sum();
        assert_eq!(tested, 24);
    }
    assert!(a.folds.iter().all(|f| (-1.0..=1.0).contains(&f.accuracy)));
    assert!(a.se_accuracy >= 0.0);
}

#[test]
fn cross_validation_runs_marker_model() {
    let (geno, pheno) = genomic_panel();
    let opts = CvOptions {
        method: CvMethod::RrBlup,
        k_folds: 3,
        ..Default::default()
    };
    let cv = cross_validate(&geno, &pheno, Some(opts)).unwrap();
    assert_eq!(cv.method, CvMethod::RrBlup);
    assert_eq!(cv.folds.len(), 3);
    assert!(cv.folds.iter().all(|f| f.n_train + f.n_test == 24));

    let too_many_folds = CvOptions {
        k_folds: 20,
        ..Default::default()
    };
    assert!(cross_validate(&geno, &pheno, Some(too_many_folds)).is_err());
    assert!(calculate_accuracy(&[1.0, 2.0, 3.0], &[1.0, 2.0, 3.0, 4.0]).is_err());
}
