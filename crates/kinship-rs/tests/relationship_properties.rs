//! Relationship matrix properties and reference scenarios
//!
//! The centred-encoding case reproduces the rrBLUP A.mat reference values for
//! a 3 x 5 {-1, 0, 1} matrix (A.mat and VanRaden method 1 coincide when no
//! markers are filtered or shrunk).

use approx::assert_relative_eq;
use breed_core::{standardize, BreedError, ErrorKind, PedigreeRecord, RelationshipMatrix};
use kinship_rs::{numerator_relationship, vanraden_kinship, Pedigree};

/// Tolerance for floating point comparisons
const TOLERANCE: f64 = 1e-6;

fn assert_symmetric_nonnegative_diag(k: &RelationshipMatrix) {
    let n = k.n();
    for i in 0..n {
        assert!(k.matrix[(i, i)] >= 0.0, "negative diagonal at {}", i);
        for j in 0..n {
            assert_eq!(k.matrix[(i, j)], k.matrix[(j, i)], "asymmetry at ({}, {})", i, j);
        }
    }
}

// ============================================================
// Genomic: identical and inverse individuals
// ============================================================
// Genotypes:
// [0, 1, 2]
// [0, 1, 2]
// [2, 1, 0]
#[test]
fn identical_individuals_share_maximal_relationship() {
    let raw = vec![vec![0.0, 1.0, 2.0], vec![0.0, 1.0, 2.0], vec![2.0, 1.0, 0.0]];
    let (geno, _) = standardize(&raw, None).unwrap();
    let k = vanraden_kinship(&geno, None).unwrap();

    assert_symmetric_nonnegative_diag(&k);
    assert_relative_eq!(k.matrix[(0, 1)], k.matrix[(0, 0)], epsilon = TOLERANCE);
    assert_relative_eq!(k.matrix[(0, 1)], k.matrix[(1, 1)], epsilon = TOLERANCE);
    assert!(k.matrix[(2, 0)] < k.matrix[(0, 1)] - 1.0);
    assert!(k.matrix[(2, 1)] < 0.0);
}

// ============================================================
// Genomic: centred input, rrBLUP A.mat reference
// ============================================================
// Output:
// [1.2, -0.4, -0.8]
// [-0.4, 1.2, -0.8]
// [-0.8, -0.8, 1.6]
#[test]
fn centred_input_matches_amat_reference() {
    #[rustfmt::skip]
    let raw = vec![
        vec![-1.0,  0.0,  1.0,  0.0, -1.0],
        vec![ 0.0,  1.0, -1.0,  1.0,  0.0],
        vec![ 1.0, -1.0,  0.0, -1.0,  1.0],
    ];
    let (geno, _) = standardize(&raw, None).unwrap();
    let k = vanraden_kinship(&geno, None).unwrap();

    #[rustfmt::skip]
    let expected = [
        1.2, -0.4, -0.8,
       -0.4,  1.2, -0.8,
       -0.8, -0.8,  1.6,
    ];
    for i in 0..3 {
        for j in 0..3 {
            assert_relative_eq!(k.matrix[(i, j)], expected[i * 3 + j], epsilon = TOLERANCE);
        }
    }
    assert_relative_eq!(k.denominator, 2.5, epsilon = TOLERANCE);
}

#[test]
fn missing_calls_keep_matrix_well_formed() {
    let raw = vec![
        vec![0.0, f64::NAN, 2.0, 1.0],
        vec![1.0, 1.0, f64::NAN, 0.0],
        vec![2.0, 2.0, 0.0, f64::NAN],
        vec![1.0, 0.0, 1.0, 2.0],
    ];
    let (geno, _) = standardize(&raw, None).unwrap();
    let k = vanraden_kinship(&geno, None).unwrap();
    assert_symmetric_nonnegative_diag(&k);
    assert!(k.matrix.iter().all(|v| v.is_finite()));
}

// ============================================================
// Pedigree: half-sibs and full-sibs
// ============================================================
#[test]
fn half_sibs_through_single_listed_parent() {
    let ped = vec![
        PedigreeRecord::founder("P1"),
        PedigreeRecord::new("HS1", Some("P1"), None),
        PedigreeRecord::new("HS2", Some("P1"), None),
    ];
    let a = numerator_relationship(&ped).unwrap();
    assert_symmetric_nonnegative_diag(&a);
    assert_relative_eq!(a.get("HS1", "HS2").unwrap(), 0.25, epsilon = TOLERANCE);
    assert_relative_eq!(a.get("HS1", "HS1").unwrap(), 1.0, epsilon = TOLERANCE);
}

#[test]
fn half_sibs_with_distinct_second_parents() {
    let ped = vec![
        PedigreeRecord::founder("S"),
        PedigreeRecord::founder("D1"),
        PedigreeRecord::founder("D2"),
        PedigreeRecord::new("H1", Some("S"), Some("D1")),
        PedigreeRecord::new("H2", Some("S"), Some("D2")),
    ];
    let a = numerator_relationship(&ped).unwrap();
    assert_relative_eq!(a.get("H1", "H2").unwrap(), 0.25, epsilon = TOLERANCE);
}

#[test]
fn full_sibs() {
    let ped = vec![
        PedigreeRecord::founder("S"),
        PedigreeRecord::founder("D"),
        PedigreeRecord::new("F1", Some("S"), Some("D")),
        PedigreeRecord::new("F2", Some("D"), Some("S")),
    ];
    let a = numerator_relationship(&ped).unwrap();
    assert_symmetric_nonnegative_diag(&a);
    assert_relative_eq!(a.get("F1", "F2").unwrap(), 0.5, epsilon = TOLERANCE);
}

// ============================================================
// Pedigree: cycles are rejected before computation
// ============================================================
// A -> B -> C -> A
#[test]
fn three_cycle_is_rejected() {
    let ped = vec![
        PedigreeRecord::new("A", Some("C"), None),
        PedigreeRecord::new("B", Some("A"), None),
        PedigreeRecord::new("C", Some("B"), None),
    ];
    let err = numerator_relationship(&ped).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CyclicPedigree);
    match err {
        BreedError::CyclicPedigree { members } => assert_eq!(members, vec!["A", "B", "C"]),
        other => panic!("unexpected error {}", other),
    }
    assert!(Pedigree::from_records(&ped).is_err());
}
