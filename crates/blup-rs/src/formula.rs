//! Model formulas such as `yield ~ Env + (1|Block) + (1|Genotype)`.
//!
//! A formula is parsed once into a [`ModelDescription`]; design matrices are
//! then built from that structured form and a [`Dataset`].
//!
//! Grammar: `response ~ term (+ term)*` where a term is
//! - a column name or an interaction `A:B` (fixed effect),
//! - `1`, `0` or `-1` (intercept on/off; `A - 1` also removes it),
//! - `(1|G)` or `(1|G:E)` (random intercept per level of G or G:E).

use breed_core::{BreedError, Column, Dataset, RelationshipMatrix, Result};
use log::debug;
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

use crate::mme::solve_mme;
use crate::model::{Covariance, MixedModelOptions, MixedModelSolution, MixedModelSpec, RandomTerm, TermRole};

/// Covariance structure requested for a random term.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CovarianceTag {
    Identity,
    /// Bound to a relationship matrix supplied under the term's key.
    Relationship,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RandomTermSpec {
    pub factors: Vec<String>,
    pub covariance: CovarianceTag,
    pub role: TermRole,
    pub share: Option<f64>,
}

impl RandomTermSpec {
    /// `G` or `G:E`.
    pub fn key(&self) -> String {
        self.factors.join(":")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDescription {
    pub response: String,
    pub intercept: bool,
    /// Each fixed term is one column or an interaction of several.
    pub fixed: Vec<Vec<String>>,
    pub random: Vec<RandomTermSpec>,
}

fn check_name(name: &str) -> Result<String> {
    let name = name.trim();
    if name.is_empty() || !name.chars().all(|c| c.is_alphanumeric() || c == '_' || c == '.') {
        return Err(BreedError::invalid(format!("invalid term name '{}' in formula", name)));
    }
    Ok(name.to_string())
}

fn parse_factors(term: &str) -> Result<Vec<String>> {
    term.split(':').map(check_name).collect()
}

/// Split on `sep` outside parentheses.
fn split_top_level(s: &str, sep: char) -> Result<Vec<String>> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut current = String::new();
    for c in s.chars() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth < 0 {
                    return Err(BreedError::invalid(format!("unbalanced ')' in '{}'", s)));
                }
            }
            _ => {}
        }
        if c == sep && depth == 0 {
            parts.push(std::mem::take(&mut current));
        } else {
            current.push(c);
        }
    }
    if depth != 0 {
        return Err(BreedError::invalid(format!("unbalanced '(' in '{}'", s)));
    }
    parts.push(current);
    Ok(parts)
}

impl ModelDescription {
    pub fn parse(formula: &str) -> Result<Self> {
        let (lhs, rhs) = formula
            .split_once('~')
            .ok_or_else(|| BreedError::invalid(format!("formula '{}' has no '~'", formula)))?;
        if rhs.contains('~') {
            return Err(BreedError::invalid(format!("formula '{}' has more than one '~'", formula)));
        }
        let response = check_name(lhs)?;

        let mut desc = ModelDescription {
            response,
            intercept: true,
            fixed: Vec::new(),
            random: Vec::new(),
        };

        for raw in split_top_level(rhs, '+')? {
            let mut term = raw.trim();
            if term.is_empty() {
                return Err(BreedError::invalid(format!("empty term in formula '{}'", formula)));
            }
            if !term.starts_with('(') {
                if let Some((before, after)) = term.split_once('-') {
                    if after.trim() != "1" {
                        return Err(BreedError::invalid(format!("unsupported term '{}'", term)));
                    }
                    desc.intercept = false;
                    term = before.trim();
                    if term.is_empty() {
                        continue;
                    }
                }
            }
            match term {
                "1" => desc.intercept = true,
                "0" => desc.intercept = false,
                t if t.starts_with('(') && t.ends_with(')') => {
                    let inner = &t[1..t.len() - 1];
                    let (slope, group) = inner
                        .split_once('|')
                        .ok_or_else(|| BreedError::invalid(format!("random term '{}' lacks '|'", t)))?;
                    if slope.trim() != "1" {
                        return Err(BreedError::invalid(format!(
                            "only random intercepts (1|group) are supported, got '{}'",
                            t
                        )));
                    }
                    desc.random.push(RandomTermSpec {
                        factors: parse_factors(group)?,
                        covariance: CovarianceTag::Identity,
                        role: TermRole::Other,
                        share: None,
                    });
                }
                t => desc.fixed.push(parse_factors(t)?),
            }
        }
        Ok(desc)
    }

    /// Mark `(1|factor)` as the genetic term and interactions containing it as G x E.
    pub fn with_genetic_factor(mut self, factor: &str) -> Self {
        for term in &mut self.random {
            if term.factors.len() == 1 && term.factors[0] == factor {
                term.role = TermRole::Genetic;
            } else if term.factors.iter().any(|f| f == factor) {
                term.role = TermRole::GenotypeByEnvironment;
            }
        }
        self
    }

    /// Bind the random term `key` to a relationship matrix.
    pub fn with_covariance(mut self, key: &str) -> Self {
        for term in &mut self.random {
            if term.key() == key {
                term.covariance = CovarianceTag::Relationship;
            }
        }
        self
    }

    pub fn with_share(mut self, key: &str, share: f64) -> Self {
        for term in &mut self.random {
            if term.key() == key {
                term.share = Some(share);
            }
        }
        self
    }

    /// Every column the model reads.
    fn columns(&self) -> BTreeSet<&str> {
        let mut cols: BTreeSet<&str> = BTreeSet::new();
        cols.insert(&self.response);
        for term in &self.fixed {
            cols.extend(term.iter().map(String::as_str));
        }
        for term in &self.random {
            cols.extend(term.factors.iter().map(String::as_str));
        }
        cols
    }

    /// Build design matrices. Rows with a missing response, a non-finite
    /// numeric covariate or an empty factor level are dropped. Random terms
    /// whose key appears in `covariances` use that matrix.
    pub fn build(&self, data: &Dataset, covariances: &HashMap<String, RelationshipMatrix>) -> Result<MixedModelSpec> {
        let mut lookup: HashMap<&str, &Column> = HashMap::new();
        for name in self.columns() {
            let col = data
                .column(name)
                .ok_or_else(|| BreedError::invalid(format!("column '{}' not found in dataset", name)))?;
            lookup.insert(name, col);
        }
        let response = match lookup[self.response.as_str()] {
            Column::Numeric(v) => v,
            Column::Factor(_) => {
                return Err(BreedError::invalid(format!("response '{}' is not numeric", self.response)));
            }
        };

        let rows: Vec<usize> = (0..data.n_rows())
            .filter(|&i| {
                response[i].is_finite()
                    && lookup.values().all(|col| match col {
                        Column::Numeric(v) => v[i].is_finite(),
                        Column::Factor(v) => !v[i].is_empty() && v[i] != "NA",
                    })
            })
            .collect();
        if rows.len() < data.n_rows() {
            debug!("Dropped {} incomplete rows", data.n_rows() - rows.len());
        }
        let n = rows.len();

        let labels = |factors: &[String], i: usize| -> String {
            factors
                .iter()
                .map(|f| lookup[f.as_str()].level(i))
                .collect::<Vec<_>>()
                .join(":")
        };

        let mut columns: Vec<(String, Vec<f64>)> = Vec::new();
        if self.intercept {
            columns.push(("(Intercept)".to_string(), vec![1.0; n]));
        }
        let mut full_rank_coded = self.intercept;
        for term in &self.fixed {
            let numeric: Vec<&Vec<f64>> = term
                .iter()
                .filter_map(|f| match lookup[f.as_str()] {
                    Column::Numeric(v) => Some(v),
                    Column::Factor(_) => None,
                })
                .collect();
            let key = term.join(":");
            if numeric.len() == term.len() {
                let values = rows.iter().map(|&i| numeric.iter().map(|v| v[i]).product()).collect();
                columns.push((key, values));
                continue;
            }
            if !numeric.is_empty() {
                return Err(BreedError::invalid(format!(
                    "interaction '{}' mixes numeric and factor columns",
                    key
                )));
            }
            let row_levels: Vec<String> = rows.iter().map(|&i| labels(term, i)).collect();
            let levels: BTreeSet<&String> = row_levels.iter().collect();
            let skip = usize::from(full_rank_coded);
            full_rank_coded = true;
            for level in levels.into_iter().skip(skip) {
                let values = row_levels.iter().map(|l| if l == level { 1.0 } else { 0.0 }).collect();
                columns.push((format!("{}[{}]", key, level), values));
            }
        }
        let x = Array2::from_shape_fn((n, columns.len()), |(i, j)| columns[j].1[i]);
        let fixed_names = columns.into_iter().map(|(name, _)| name).collect();

        let mut random = Vec::with_capacity(self.random.len());
        for spec in &self.random {
            let key = spec.key();
            let row_levels: Vec<String> = rows.iter().map(|&i| labels(&spec.factors, i)).collect();
            let bound = match (spec.covariance, covariances.get(&key)) {
                (_, Some(rel)) => Some(rel),
                (CovarianceTag::Relationship, None) => {
                    return Err(BreedError::invalid(format!(
                        "no relationship matrix supplied for random term '{}'",
                        key
                    )));
                }
                (CovarianceTag::Identity, None) => None,
            };

            let (levels, covariance, role) = match bound {
                Some(rel) => (
                    rel.sample_ids.clone(),
                    Covariance::Relationship(rel.matrix.clone()),
                    match spec.role {
                        TermRole::Other => TermRole::Genetic,
                        role => role,
                    },
                ),
                None => {
                    let levels: BTreeSet<&String> = row_levels.iter().collect();
                    (levels.into_iter().cloned().collect(), Covariance::Identity, spec.role)
                }
            };
            let index: HashMap<&str, usize> = levels.iter().enumerate().map(|(j, l)| (l.as_str(), j)).collect();

            let mut z = Array2::<f64>::zeros((n, levels.len()));
            for (i, label) in row_levels.iter().enumerate() {
                let j = *index.get(label.as_str()).ok_or_else(|| {
                    BreedError::invalid(format!("level '{}' of '{}' missing from relationship matrix", label, key))
                })?;
                z[(i, j)] = 1.0;
            }
            random.push(RandomTerm {
                name: key,
                levels,
                z,
                covariance,
                role,
                share: spec.share,
            });
        }

        Ok(MixedModelSpec {
            y: rows.iter().map(|&i| response[i]).collect(),
            x,
            fixed_names,
            random,
        })
    }
}

/// Parse, build and solve in one step.
pub fn fit_formula(
    formula: &str,
    data: &Dataset,
    covariances: &HashMap<String, RelationshipMatrix>,
    options: Option<MixedModelOptions>,
) -> Result<MixedModelSolution> {
    let desc = ModelDescription::parse(formula)?;
    fit_model(&desc, data, covariances, options)
}

pub fn fit_model(
    desc: &ModelDescription,
    data: &Dataset,
    covariances: &HashMap<String, RelationshipMatrix>,
    options: Option<MixedModelOptions>,
) -> Result<MixedModelSolution> {
    let spec = desc.build(data, covariances)?;
    solve_mme(&spec, options)
}
