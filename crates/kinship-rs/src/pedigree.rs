//! Pedigree relationships (numerator relationship matrix, A).
//!
//! Individuals live in an arena and refer to their parents by index. The
//! parent graph is checked for cycles with a topological sort before any
//! relationship is computed; the tabular method then fills A in that order.

use breed_core::{BreedError, PedigreeRecord, RelationshipMatrix, RelationshipMethod, Result};
use log::{debug, warn};
use ndarray::Array2;
use petgraph::algo::{tarjan_scc, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone)]
struct Individual {
    id: String,
    parents: [Option<usize>; 2],
}

/// Validated, acyclic pedigree.
#[derive(Debug, Clone)]
pub struct Pedigree {
    individuals: Vec<Individual>,
    index: HashMap<String, usize>,
    /// Parents always precede their offspring.
    order: Vec<usize>,
    /// Parents referenced by a record but not listed themselves.
    added_founders: usize,
}

impl Pedigree {
    pub fn from_records(records: &[PedigreeRecord]) -> Result<Self> {
        let mut individuals: Vec<Individual> = Vec::with_capacity(records.len());
        let mut index: HashMap<String, usize> = HashMap::with_capacity(records.len());

        for rec in records {
            if rec.id.is_empty() {
                return Err(BreedError::invalid("pedigree record with empty id"));
            }
            if index.contains_key(&rec.id) {
                return Err(BreedError::invalid(format!("duplicate pedigree id '{}'", rec.id)));
            }
            index.insert(rec.id.clone(), individuals.len());
            individuals.push(Individual {
                id: rec.id.clone(),
                parents: [None, None],
            });
        }

        let mut added_founders = 0usize;
        for (i, rec) in records.iter().enumerate() {
            for (slot, parent) in [&rec.parent1, &rec.parent2].into_iter().enumerate() {
                let Some(pid) = parent.as_deref() else { continue };
                let idx = match index.get(pid) {
                    Some(&idx) => idx,
                    None => {
                        let idx = individuals.len();
                        index.insert(pid.to_string(), idx);
                        individuals.push(Individual {
                            id: pid.to_string(),
                            parents: [None, None],
                        });
                        added_founders += 1;
                        idx
                    }
                };
                individuals[i].parents[slot] = Some(idx);
            }
        }
        if added_founders > 0 {
            warn!("Added {} unlisted parents to the pedigree as founders", added_founders);
        }

        let order = topological_order(&individuals)?;
        debug!(
            "Pedigree with {} individuals ({} added founders) is acyclic",
            individuals.len(),
            added_founders
        );

        Ok(Self {
            individuals,
            index,
            order,
            added_founders,
        })
    }

    pub fn len(&self) -> usize {
        self.individuals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.individuals.is_empty()
    }

    /// Ids in arena order: listed records first, then added founders.
    pub fn ids(&self) -> Vec<String> {
        self.individuals.iter().map(|ind| ind.id.clone()).collect()
    }

    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    pub fn parents_of(&self, id: &str) -> Option<(Option<&str>, Option<&str>)> {
        let ind = &self.individuals[self.index_of(id)?];
        let name = |p: Option<usize>| p.map(|k| self.individuals[k].id.as_str());
        Some((name(ind.parents[0]), name(ind.parents[1])))
    }

    pub fn topological_order(&self) -> &[usize] {
        &self.order
    }

    /// Generation depth: 0 for founders, otherwise one more than the deepest parent.
    pub fn generations(&self) -> Vec<usize> {
        let mut depth = vec![0usize; self.len()];
        for &i in &self.order {
            depth[i] = self.individuals[i]
                .parents
                .iter()
                .flatten()
                .map(|&p| depth[p] + 1)
                .max()
                .unwrap_or(0);
        }
        depth
    }

    /// Numerator relationship matrix by the tabular method.
    ///
    /// `A[i][i] = 1 + 0.5 * A[sire][dam]` and
    /// `A[i][j] = 0.5 * (A[sire][j] + A[dam][j])` for every `j` earlier in the
    /// order; unknown parents contribute zero.
    pub fn relationship_matrix(&self) -> RelationshipMatrix {
        let n = self.len();
        let mut a = Array2::<f64>::zeros((n, n));
        let mut done: Vec<usize> = Vec::with_capacity(n);

        for &i in &self.order {
            let [s, d] = self.individuals[i].parents;
            a[(i, i)] = match (s, d) {
                (Some(s), Some(d)) => 1.0 + 0.5 * a[(s, d)],
                _ => 1.0,
            };
            for &j in &done {
                let from_s = s.map_or(0.0, |s| a[(s, j)]);
                let from_d = d.map_or(0.0, |d| a[(d, j)]);
                let v = 0.5 * (from_s + from_d);
                a[(i, j)] = v;
                a[(j, i)] = v;
            }
            done.push(i);
        }

        RelationshipMatrix {
            sample_ids: self.ids(),
            matrix: a,
            method: RelationshipMethod::Pedigree,
            denominator: 1.0,
            denominator_fallback: false,
        }
    }

    /// Summary statistics, given this pedigree's relationship matrix.
    pub fn statistics(&self, a: &RelationshipMatrix) -> PedigreeStats {
        let n = self.len();
        let n_founders = self
            .individuals
            .iter()
            .filter(|ind| ind.parents.iter().all(Option::is_none))
            .count();
        let known_slots: usize = self
            .individuals
            .iter()
            .map(|ind| ind.parents.iter().filter(|p| p.is_some()).count())
            .sum();
        let inbreeding = a.inbreeding();
        let max_inbreeding = inbreeding.iter().cloned().fold(0.0, f64::max);
        let mean_inbreeding = if n > 0 {
            inbreeding.iter().sum::<f64>() / n as f64
        } else {
            0.0
        };
        PedigreeStats {
            n_individuals: n,
            n_founders,
            n_added_founders: self.added_founders,
            max_generation: self.generations().into_iter().max().unwrap_or(0),
            completeness: if n > 0 {
                known_slots as f64 / (2 * n) as f64
            } else {
                0.0
            },
            mean_inbreeding,
            max_inbreeding,
            n_inbred: inbreeding.iter().filter(|&&f| f > 1e-12).count(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PedigreeStats {
    pub n_individuals: usize,
    pub n_founders: usize,
    pub n_added_founders: usize,
    pub max_generation: usize,
    /// Share of known parent slots.
    pub completeness: f64,
    pub mean_inbreeding: f64,
    pub max_inbreeding: f64,
    pub n_inbred: usize,
}

/// Parents-first order, or `CyclicPedigree` naming every individual on a cycle.
fn topological_order(individuals: &[Individual]) -> Result<Vec<usize>> {
    let mut graph: DiGraph<usize, ()> = DiGraph::with_capacity(individuals.len(), individuals.len() * 2);
    let nodes: Vec<NodeIndex> = (0..individuals.len()).map(|i| graph.add_node(i)).collect();
    for (child, ind) in individuals.iter().enumerate() {
        for p in ind.parents.iter().flatten() {
            graph.add_edge(nodes[*p], nodes[child], ());
        }
    }

    match toposort(&graph, None) {
        Ok(sorted) => Ok(sorted.into_iter().map(|node| graph[node]).collect()),
        Err(_) => {
            let mut members: Vec<usize> = tarjan_scc(&graph)
                .into_iter()
                .filter(|scc| scc.len() > 1 || graph.contains_edge(scc[0], scc[0]))
                .flatten()
                .map(|node| graph[node])
                .collect();
            members.sort_unstable();
            Err(BreedError::CyclicPedigree {
                members: members.into_iter().map(|i| individuals[i].id.clone()).collect(),
            })
        }
    }
}

/// Build A directly from records.
pub fn numerator_relationship(records: &[PedigreeRecord]) -> Result<RelationshipMatrix> {
    Ok(Pedigree::from_records(records)?.relationship_matrix())
}

/// Coefficient of coancestry `A[x][y] / 2`, i.e. the inbreeding of their offspring.
pub fn coancestry(a: &RelationshipMatrix, x: &str, y: &str) -> Option<f64> {
    a.get(x, y).map(|v| v / 2.0)
}
