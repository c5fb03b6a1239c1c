//! Online update of an identity's dynamic template.
//!
//! Planning is pure: [`FeatureEvolution::plan`] reads the current table and
//! returns the template to write. The caller persists it and then swaps the
//! row in with [`IdentityTable::set_dynamic`] inside the same cycle.

use serde::Serialize;

use crate::matcher::MatchResult;
use crate::table::IdentityTable;
use crate::types::Embedding;

#[derive(Debug, Clone)]
pub struct EvolutionConfig {
    /// Learning rate toward the probe.
    pub alpha: f32,
    /// Never evolve when the probe scores below this against the base template.
    pub safety_floor: f32,
}

impl Default for EvolutionConfig {
    fn default() -> Self {
        Self {
            alpha: 0.1,
            safety_floor: 0.4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    NotRecommended,
    BaseBelowFloor,
    UnknownIdentity,
    Degenerate,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EvolutionPlan {
    Skip(SkipReason),
    /// First dynamic template, seeded from the probe.
    ColdStart(Embedding),
    /// `normalize(alpha * probe + (1 - alpha) * old_dynamic)`.
    Blend(Embedding),
}

impl EvolutionPlan {
    pub fn embedding(&self) -> Option<&Embedding> {
        match self {
            EvolutionPlan::Skip(_) => None,
            EvolutionPlan::ColdStart(e) | EvolutionPlan::Blend(e) => Some(e),
        }
    }
}

pub struct FeatureEvolution {
    config: EvolutionConfig,
}

impl FeatureEvolution {
    pub fn new(config: EvolutionConfig) -> Self {
        Self { config }
    }

    pub fn plan(
        &self,
        table: &IdentityTable,
        identity_id: &str,
        probe: &Embedding,
        result: &MatchResult,
    ) -> EvolutionPlan {
        if !result.should_evolve {
            return EvolutionPlan::Skip(SkipReason::NotRecommended);
        }
        if result.base_score < self.config.safety_floor {
            tracing::warn!(
                identity_id,
                base_score = result.base_score,
                floor = self.config.safety_floor,
                "evolution skipped: live face diverges from enrollment template"
            );
            return EvolutionPlan::Skip(SkipReason::BaseBelowFloor);
        }
        let Some(row) = table.row_of(identity_id) else {
            return EvolutionPlan::Skip(SkipReason::UnknownIdentity);
        };

        match table.dynamic_embedding(row) {
            Some(old) => match probe.blend(&old, self.config.alpha) {
                Ok(updated) => EvolutionPlan::Blend(updated),
                Err(e) => {
                    tracing::warn!(identity_id, error = %e, "evolution skipped: blend failed");
                    EvolutionPlan::Skip(SkipReason::Degenerate)
                }
            },
            None => EvolutionPlan::ColdStart(probe.clone()),
        }
    }
}
