use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use deckfit_contracts::deck::SlideContent;
use deckfit_contracts::providers::{ProviderKind, FALLBACK_PROVIDER_LABEL};
use deckfit_contracts::templates::TemplateCatalog;

use crate::providers::{
    error_chain_text, DecisionProvider, DecisionProviderRegistry, DecisionRequest, Emphasis,
    HeuristicProvider,
};

#[derive(Debug, Clone, PartialEq)]
pub struct PlannedLayout {
    pub template: String,
    pub emphasis: Emphasis,
    /// Provider label as recorded in the decision log.
    pub provider: String,
    pub rationale: String,
    pub fallback_reason: Option<String>,
}

impl PlannedLayout {
    pub fn fell_back(&self) -> bool {
        self.fallback_reason.is_some()
    }
}

/// Asks the selected provider for each slide's layout and falls back to the heuristic on any
/// provider failure.
pub struct LayoutPlanner<'a> {
    catalog: &'a TemplateCatalog,
    providers: &'a DecisionProviderRegistry,
    selected: ProviderKind,
    timeout: Duration,
}

impl<'a> LayoutPlanner<'a> {
    pub fn new(
        catalog: &'a TemplateCatalog,
        providers: &'a DecisionProviderRegistry,
        selected: ProviderKind,
        timeout: Duration,
    ) -> Self {
        Self {
            catalog,
            providers,
            selected,
            timeout,
        }
    }

    pub fn plan(&self, slides: &[SlideContent], index: usize) -> Result<PlannedLayout> {
        let slide = slides
            .get(index)
            .ok_or_else(|| anyhow!("slide index {index} out of range"))?;
        let candidates = self.catalog.candidates(&slide.category);
        let request = DecisionRequest {
            page: index + 1,
            slide,
            previous: index.checked_sub(1).and_then(|prev| slides.get(prev)),
            next: slides.get(index + 1),
            candidates: &candidates,
            catalog: self.catalog,
        };

        let failure = match self.providers.get(self.selected) {
            None => format!("provider {} is not registered", self.selected),
            Some(provider) => {
                let started = Instant::now();
                let outcome = provider.decide(&request);
                let elapsed = started.elapsed();
                match outcome {
                    Err(err) => error_chain_text(&err, 240),
                    Ok(_) if elapsed > self.timeout => format!(
                        "timed out after {} ms (limit {} ms)",
                        elapsed.as_millis(),
                        self.timeout.as_millis()
                    ),
                    Ok(decision) if !candidates.iter().any(|row| row.name == decision.template) => {
                        format!("proposed template '{}' is not a candidate", decision.template)
                    }
                    Ok(decision) => {
                        return Ok(PlannedLayout {
                            template: decision.template,
                            emphasis: decision.emphasis,
                            provider: self.selected.as_str().to_string(),
                            rationale: decision.rationale,
                            fallback_reason: None,
                        });
                    }
                }
            }
        };

        log::warn!(
            "slide {} ({}): {} failed, using heuristic: {failure}",
            index + 1,
            slide.id,
            self.selected
        );
        let heuristic = HeuristicProvider.decide(&request)?;
        Ok(PlannedLayout {
            template: heuristic.template,
            emphasis: heuristic.emphasis,
            provider: FALLBACK_PROVIDER_LABEL.to_string(),
            rationale: format!(
                "fallback from {}: {failure}; {}",
                self.selected, heuristic.rationale
            ),
            fallback_reason: Some(failure),
        })
    }
}
