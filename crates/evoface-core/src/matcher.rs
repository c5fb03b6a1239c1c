//! 1:N identity matching with weighted base/dynamic fusion.

use std::cmp::Ordering;

use ndarray::Array2;
use serde::Serialize;

use crate::table::IdentityTable;
use crate::types::Embedding;

/// Candidates at or above this fused score are logged at debug level.
const DIAGNOSTIC_FLOOR: f32 = 0.4;

#[derive(Debug, Clone)]
pub struct MatcherConfig {
    /// Minimum fused score for acceptance.
    pub recognition_threshold: f32,
    /// Minimum separation between the best and second-best fused scores.
    pub ambiguity_gap: f32,
    /// Base score below which an accepted match carries a warning.
    pub warning_base_score: f32,
    /// Cold-start threshold: fused score needed to seed a first dynamic template.
    pub evolution_cold_start: f32,
    /// With a dynamic template present, evolve when base exceeds this...
    pub evolution_min_base: f32,
    /// ...or when dynamic exceeds this.
    pub evolution_min_dynamic: f32,
    pub base_weight: f32,
    pub dynamic_weight: f32,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            recognition_threshold: 0.5,
            ambiguity_gap: 0.05,
            warning_base_score: 0.3,
            evolution_cold_start: 0.5,
            evolution_min_base: 0.5,
            evolution_min_dynamic: 0.85,
            base_weight: 0.4,
            dynamic_weight: 0.6,
        }
    }
}

/// Outcome of one matching cycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MatchResult {
    /// Accepted identity, `None` on reject or ambiguity.
    pub identity_id: Option<String>,
    /// Best-scoring candidate regardless of acceptance.
    pub candidate_id: Option<String>,
    pub fused_score: f32,
    pub base_score: f32,
    pub dynamic_score: f32,
    /// Fused score of the runner-up, when at least two identities exist.
    pub runner_up_score: Option<f32>,
    pub ambiguous: bool,
    pub warning: bool,
    /// The accepted match is trustworthy enough to update the dynamic template.
    pub should_evolve: bool,
}

impl MatchResult {
    pub fn is_accepted(&self) -> bool {
        self.identity_id.is_some()
    }
}

pub struct IdentityMatcher {
    config: MatcherConfig,
}

impl IdentityMatcher {
    pub fn new(config: MatcherConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &MatcherConfig {
        &self.config
    }

    /// Score a probe against every enrolled identity.
    ///
    /// Fused rows are `normalize(base_weight * base + dynamic_weight * dynamic)`
    /// for the whole table at once; scores are their dot products with the
    /// probe. Ties on fused score resolve to the lexicographically lowest id.
    pub fn identify(&self, table: &IdentityTable, probe: &Embedding) -> MatchResult {
        if table.is_empty() || probe.dim() != table.dim() {
            if probe.dim() != table.dim() {
                tracing::warn!(
                    probe_dim = probe.dim(),
                    table_dim = table.dim(),
                    "identify: probe dimension does not match table"
                );
            }
            return MatchResult::default();
        }

        let fused = self.fused_matrix(table);
        let scores = fused.dot(&probe.view());

        let mut ranked: Vec<usize> = (0..table.len()).collect();
        ranked.sort_by(|&a, &b| {
            rank_candidates(
                (scores[a], table.meta(a).id.as_str()),
                (scores[b], table.meta(b).id.as_str()),
            )
        });

        for &row in ranked.iter().take_while(|&&r| scores[r] >= DIAGNOSTIC_FLOOR) {
            tracing::debug!(
                identity_id = %table.meta(row).id,
                fused = scores[row],
                "identify: candidate"
            );
        }

        let top = ranked[0];
        let fused_score = scores[top];
        let runner_up_score = ranked.get(1).map(|&r| scores[r]);
        let candidate_id = table.meta(top).id.clone();

        if let Some(second) = runner_up_score {
            if fused_score - second < self.config.ambiguity_gap {
                tracing::info!(
                    candidate = %candidate_id,
                    top = fused_score,
                    second,
                    gap = self.config.ambiguity_gap,
                    "identify: ambiguous match"
                );
                return MatchResult {
                    candidate_id: Some(candidate_id),
                    fused_score,
                    runner_up_score,
                    ambiguous: true,
                    ..MatchResult::default()
                };
            }
        }

        let has_dynamic = table.has_dynamic(top);
        let base_score = table.base_row(top).dot(&probe.view());
        let dynamic_score = if has_dynamic {
            table.dynamic_row(top).dot(&probe.view())
        } else {
            0.0
        };
        let warning = base_score < self.config.warning_base_score;
        let accepted = fused_score >= self.config.recognition_threshold;

        let should_evolve = accepted
            && if has_dynamic {
                base_score > self.config.evolution_min_base
                    || dynamic_score > self.config.evolution_min_dynamic
            } else {
                fused_score > self.config.evolution_cold_start
            };

        MatchResult {
            identity_id: accepted.then(|| candidate_id.clone()),
            candidate_id: Some(candidate_id),
            fused_score,
            base_score,
            dynamic_score,
            runner_up_score,
            ambiguous: false,
            warning,
            should_evolve,
        }
    }

    /// Weighted, row-renormalized fusion of the base and dynamic matrices.
    pub fn fused_matrix(&self, table: &IdentityTable) -> Array2<f32> {
        let mut fused = &table.base_matrix() * self.config.base_weight
            + &table.dynamic_matrix() * self.config.dynamic_weight;
        for mut row in fused.rows_mut() {
            let norm = row.iter().map(|v| v * v).sum::<f32>().sqrt();
            if norm > f32::EPSILON {
                row /= norm;
            }
        }
        fused
    }
}

/// Descending score, then ascending id.
fn rank_candidates(a: (f32, &str), b: (f32, &str)) -> Ordering {
    b.0.total_cmp(&a.0).then_with(|| a.1.cmp(b.1))
}
