use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

pub const DEFAULT_HOSTED_ENDPOINT: &str = "https://api.openai.com/v1/chat/completions";
pub const DEFAULT_HOSTED_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_MAX_REVIEW_ROUNDS: u32 = 4;
pub const DEFAULT_QUALIFIER_MARKER: &str = "(Implication:";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostedConfig {
    pub endpoint: String,
    pub model: String,
}

impl Default for HostedConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_HOSTED_ENDPOINT.to_string(),
            model: DEFAULT_HOSTED_MODEL.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReviewConfig {
    /// Minimum `1 - jaccard(prev, next)` before a transition counts as weak.
    pub min_distinctiveness: f64,
    /// Word diff ratio at or above which two governing messages are near-duplicates.
    pub near_duplicate_ratio: f64,
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            min_distinctiveness: 0.3,
            near_duplicate_ratio: 0.92,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CapacityConfig {
    pub floor: usize,
    pub fill_ratio: f64,
    pub claim_max_chars: usize,
}

impl Default for CapacityConfig {
    fn default() -> Self {
        Self {
            floor: 12,
            fill_ratio: 0.9,
            claim_max_chars: 180,
        }
    }
}

/// Run configuration, read once before the pipeline starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub provider: Option<String>,
    pub hosted: HostedConfig,
    pub max_review_rounds: u32,
    pub provider_timeout_ms: u64,
    pub deterministic: bool,
    pub seed: u64,
    pub parallel: bool,
    pub review: ReviewConfig,
    pub capacity: CapacityConfig,
    pub qualifier_marker: String,
    pub catalog_path: Option<PathBuf>,
    pub rules_path: Option<PathBuf>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            provider: None,
            hosted: HostedConfig::default(),
            max_review_rounds: DEFAULT_MAX_REVIEW_ROUNDS,
            provider_timeout_ms: 8_000,
            deterministic: false,
            seed: 0,
            parallel: true,
            review: ReviewConfig::default(),
            capacity: CapacityConfig::default(),
            qualifier_marker: DEFAULT_QUALIFIER_MARKER.to_string(),
            catalog_path: None,
            rules_path: None,
        }
    }
}

impl PipelineConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed reading config {}", path.display()))?;
        let config: Self = serde_json::from_str(&raw)
            .with_context(|| format!("invalid config {}", path.display()))?;
        Ok(config)
    }

    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Applies `DECKFIT_*` overrides; `lookup` returns the raw variable value.
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        if let Some(value) = get("DECKFIT_PROVIDER") {
            self.provider = Some(value);
        }
        if let Some(value) = get("DECKFIT_MAX_ROUNDS") {
            self.max_review_rounds = value
                .parse()
                .with_context(|| format!("DECKFIT_MAX_ROUNDS is not a number: {value}"))?;
        }
        if let Some(value) = get("DECKFIT_TIMEOUT_MS") {
            self.provider_timeout_ms = value
                .parse()
                .with_context(|| format!("DECKFIT_TIMEOUT_MS is not a number: {value}"))?;
        }
        if let Some(value) = get("DECKFIT_DETERMINISTIC") {
            self.deterministic = parse_flag(&value)
                .with_context(|| format!("DECKFIT_DETERMINISTIC is not a flag: {value}"))?;
        }
        if let Some(value) = get("DECKFIT_SEED") {
            self.seed = value
                .parse()
                .with_context(|| format!("DECKFIT_SEED is not a number: {value}"))?;
        }
        if let Some(value) = get("DECKFIT_HOSTED_ENDPOINT") {
            self.hosted.endpoint = value;
        }
        if let Some(value) = get("DECKFIT_HOSTED_MODEL") {
            self.hosted.model = value;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_review_rounds == 0 {
            bail!("max_review_rounds must be at least 1");
        }
        if self.provider_timeout_ms == 0 {
            bail!("provider_timeout_ms must be positive");
        }
        if !(0.0..=1.0).contains(&self.review.min_distinctiveness) {
            bail!("review.min_distinctiveness must be within [0, 1]");
        }
        if !(0.0..=1.0).contains(&self.review.near_duplicate_ratio) {
            bail!("review.near_duplicate_ratio must be within [0, 1]");
        }
        if !(self.capacity.fill_ratio > 0.0 && self.capacity.fill_ratio <= 1.0) {
            bail!("capacity.fill_ratio must be within (0, 1]");
        }
        if self.capacity.floor == 0 {
            bail!("capacity.floor must be positive");
        }
        if self.capacity.claim_max_chars < self.capacity.floor {
            bail!("capacity.claim_max_chars must not be below capacity.floor");
        }
        let marker = self.qualifier_marker.trim();
        if !marker.starts_with('(') || marker.len() < 2 {
            bail!("qualifier_marker must start with '(' and name the clause");
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.provider_timeout_ms)
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::PipelineConfig;

    #[test]
    fn partial_file_keeps_defaults() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("deckfit.json");
        std::fs::write(
            &path,
            r#"{"provider": "heuristic", "review": {"min_distinctiveness": 0.4}}"#,
        )?;
        let config = PipelineConfig::load(&path)?;
        assert_eq!(config.provider.as_deref(), Some("heuristic"));
        assert_eq!(config.review.min_distinctiveness, 0.4);
        assert_eq!(config.review.near_duplicate_ratio, 0.92);
        assert_eq!(config.max_review_rounds, 4);
        assert_eq!(config.qualifier_marker, "(Implication:");
        config.validate()?;
        Ok(())
    }

    #[test]
    fn env_overrides_apply_and_reject_garbage() -> anyhow::Result<()> {
        let vars: HashMap<&str, &str> = [
            ("DECKFIT_PROVIDER", "hosted-model"),
            ("DECKFIT_MAX_ROUNDS", "2"),
            ("DECKFIT_DETERMINISTIC", "yes"),
            ("DECKFIT_SEED", "42"),
            ("DECKFIT_HOSTED_MODEL", " "),
        ]
        .into_iter()
        .collect();
        let mut config = PipelineConfig::default();
        config.apply_env_from(|key| vars.get(key).map(|value| value.to_string()))?;
        assert_eq!(config.provider.as_deref(), Some("hosted-model"));
        assert_eq!(config.max_review_rounds, 2);
        assert!(config.deterministic);
        assert_eq!(config.seed, 42);
        assert_eq!(config.hosted.model, "gpt-4o-mini");

        let mut broken = PipelineConfig::default();
        let result = broken.apply_env_from(|key| {
            (key == "DECKFIT_TIMEOUT_MS").then(|| "soon".to_string())
        });
        assert!(result.is_err());
        Ok(())
    }

    #[test]
    fn validate_rejects_zero_rounds_and_bad_marker() {
        let mut config = PipelineConfig {
            max_review_rounds: 0,
            ..PipelineConfig::default()
        };
        assert!(config.validate().is_err());
        config.max_review_rounds = 3;
        config.qualifier_marker = "Implication:".to_string();
        assert!(config.validate().is_err());
    }
}
