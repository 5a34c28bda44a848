use std::collections::BTreeMap;
use std::path::Path;

use anyhow::bail;
use serde::{Deserialize, Serialize};

pub const DECISION_LOG_SCHEMA_VERSION: u64 = 1;

/// Which fields of a slide were rewritten to fit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TextAdjustments {
    pub title: bool,
    pub governing_message: bool,
    /// Number of claims whose text changed.
    pub claims: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayoutDecision {
    pub slide_id: String,
    pub page: usize,
    pub template: String,
    pub emphasis: String,
    pub provider: String,
    pub rationale: String,
    pub fit_score_before: f64,
    pub fit_score_after: f64,
    pub text_adjustments: TextAdjustments,
    pub review_round: u32,
    #[serde(default)]
    pub review_notes: Vec<String>,
}

/// Snapshots of layout decisions keyed by `(slide_id, round)`.
///
/// A snapshot is never mutated once its round is closed; recording at the same round as the
/// slide's latest snapshot replaces it (the round is still open), recording at a lower round is
/// an error.
#[derive(Debug, Clone, Default)]
pub struct DecisionArena {
    snapshots: BTreeMap<(String, u32), LayoutDecision>,
    order: Vec<String>,
}

impl DecisionArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, decision: LayoutDecision) -> anyhow::Result<()> {
        let slide_id = decision.slide_id.clone();
        let round = decision.review_round;
        match self.latest_round(&slide_id) {
            Some(latest) if round < latest => {
                bail!(
                    "decision for slide '{slide_id}' at round {round} is older than round {latest}"
                );
            }
            Some(_) => {}
            None => self.order.push(slide_id.clone()),
        }
        self.snapshots.insert((slide_id, round), decision);
        Ok(())
    }

    fn latest_round(&self, slide_id: &str) -> Option<u32> {
        self.history(slide_id).last().map(|row| row.review_round)
    }

    /// Highest-round snapshot of the slide.
    pub fn current(&self, slide_id: &str) -> Option<&LayoutDecision> {
        self.history(slide_id).into_iter().last()
    }

    /// All snapshots of the slide, oldest first.
    pub fn history(&self, slide_id: &str) -> Vec<&LayoutDecision> {
        self.snapshots
            .range((slide_id.to_string(), 0)..=(slide_id.to_string(), u32::MAX))
            .map(|(_, decision)| decision)
            .collect()
    }

    pub fn snapshot_count(&self) -> usize {
        self.snapshots.len()
    }

    /// Current decision of every slide, in the order slides were first recorded.
    pub fn current_decisions(&self) -> Vec<LayoutDecision> {
        self.order
            .iter()
            .filter_map(|slide_id| self.current(slide_id).cloned())
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionLog {
    pub schema_version: u64,
    pub run_id: String,
    pub provider: String,
    pub deterministic: bool,
    pub seed: u64,
    pub review_state: String,
    pub review_rounds: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generated_at: Option<String>,
    pub decisions: Vec<LayoutDecision>,
}

pub fn write_decision_log(path: &Path, log: &DecisionLog) -> anyhow::Result<()> {
    write_json_pretty(path, log)
}

pub fn write_json_pretty<T: Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut text = serde_json::to_string_pretty(value)?;
    text.push('\n');
    std::fs::write(path, text)?;
    Ok(())
}
