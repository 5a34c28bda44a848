use std::collections::{BTreeSet, HashSet};
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::error::{ContractViolation, Violation};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claim {
    pub text: String,
    #[serde(default)]
    pub supporting_reference_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VisualRequest {
    pub kind: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlideContent {
    pub id: String,
    pub category: String,
    pub title: String,
    pub governing_message: String,
    #[serde(default)]
    pub claims: Vec<Claim>,
    #[serde(default)]
    pub visual_requests: Vec<VisualRequest>,
    #[serde(default)]
    pub source_footer: Vec<String>,
    #[serde(default, skip_serializing_if = "SlideConstraints::is_empty")]
    pub slide_constraints: SlideConstraints,
}

/// Deck-wide defaults; a slide's own constraints override the numeric limits.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeckConstraints {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub forbidden_words: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_max_chars_per_bullet: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_max_bullets: Option<usize>,
}

impl DeckConstraints {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlideConstraints {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub forbidden_words: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_chars_per_bullet: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_bullets: Option<usize>,
}

impl SlideConstraints {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

/// Limits in force for one slide once deck defaults and slide overrides are merged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SlideLimits {
    /// Deck and slide words together, deduplicated and sorted.
    pub forbidden_words: Vec<String>,
    pub max_chars_per_claim: Option<usize>,
    pub max_claims: Option<usize>,
}

impl SlideLimits {
    pub fn claims_exceeded(&self, claim_count: usize) -> bool {
        self.max_claims.is_some_and(|max| claim_count > max)
    }
}

impl SlideContent {
    /// `title + governing_message`, the text compared between neighbouring slides.
    pub fn headline(&self) -> String {
        format!("{} {}", self.title.trim(), self.governing_message.trim())
    }
}

/// The deck as produced by the upstream content generator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "DeckConstraints::is_empty")]
    pub global_constraints: DeckConstraints,
    pub slides: Vec<SlideContent>,
}

impl ContentSpec {
    pub fn from_json_str(raw: &str) -> Result<Self, ContractViolation> {
        serde_json::from_str(raw).map_err(|err| ContractViolation::Malformed(err.to_string()))
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed reading content spec {}", path.display()))?;
        Ok(Self::from_json_str(&raw)?)
    }

    pub fn limits_for(&self, slide: &SlideContent) -> SlideLimits {
        let own = &slide.slide_constraints;
        let deck = &self.global_constraints;
        let forbidden_words = deck
            .forbidden_words
            .iter()
            .chain(own.forbidden_words.iter())
            .map(|word| word.trim().to_string())
            .filter(|word| !word.is_empty())
            .collect::<BTreeSet<String>>()
            .into_iter()
            .collect();
        SlideLimits {
            forbidden_words,
            max_chars_per_claim: own
                .max_chars_per_bullet
                .or(deck.default_max_chars_per_bullet),
            max_claims: own.max_bullets.or(deck.default_max_bullets),
        }
    }

    /// Checks the input contract and returns a copy whose categories are canonical.
    ///
    /// `resolve_category` maps a raw category (or legacy layout alias) to the catalog
    /// category, or `None` when the catalog does not know it.
    pub fn validated<F>(&self, resolve_category: F) -> Result<ContentSpec, ContractViolation>
    where
        F: Fn(&str) -> Option<String>,
    {
        if self.slides.is_empty() {
            return Err(ContractViolation::EmptyDeck);
        }

        let mut violations = Vec::new();
        let mut seen_ids = HashSet::new();
        let mut resolved = self.clone();

        let deck = &self.global_constraints;
        check_limits(
            "global_constraints",
            &deck.forbidden_words,
            &[
                ("default_max_chars_per_bullet", deck.default_max_chars_per_bullet),
                ("default_max_bullets", deck.default_max_bullets),
            ],
            &mut violations,
        );

        for (idx, slide) in resolved.slides.iter_mut().enumerate() {
            let path = format!("slides[{idx}]");
            if slide.id.trim().is_empty() {
                violations.push(Violation::new(format!("{path}.id"), "must not be empty"));
            } else if !seen_ids.insert(slide.id.clone()) {
                violations.push(Violation::new(
                    format!("{path}.id"),
                    format!("duplicate slide id '{}'", slide.id),
                ));
            }
            if slide.title.trim().is_empty() {
                violations.push(Violation::new(format!("{path}.title"), "must not be empty"));
            }
            if slide.governing_message.trim().is_empty() {
                violations.push(Violation::new(
                    format!("{path}.governing_message"),
                    "must not be empty",
                ));
            }
            match resolve_category(&slide.category) {
                Some(category) => slide.category = category,
                None => violations.push(Violation::new(
                    format!("{path}.category"),
                    format!("unknown template category '{}'", slide.category),
                )),
            }
            for (claim_idx, claim) in slide.claims.iter().enumerate() {
                let claim_path = format!("{path}.claims[{claim_idx}]");
                if claim.text.trim().is_empty() {
                    violations.push(Violation::new(
                        format!("{claim_path}.text"),
                        "must not be empty",
                    ));
                }
                let has_reference = claim
                    .supporting_reference_ids
                    .iter()
                    .any(|reference| !reference.trim().is_empty());
                if !has_reference {
                    violations.push(Violation::new(
                        format!("{claim_path}.supporting_reference_ids"),
                        "claim needs at least one supporting reference id",
                    ));
                }
            }
            for (visual_idx, visual) in slide.visual_requests.iter().enumerate() {
                if visual.kind.trim().is_empty() {
                    violations.push(Violation::new(
                        format!("{path}.visual_requests[{visual_idx}].kind"),
                        "must not be empty",
                    ));
                }
            }
            let own = &slide.slide_constraints;
            check_limits(
                &format!("{path}.slide_constraints"),
                &own.forbidden_words,
                &[
                    ("max_chars_per_bullet", own.max_chars_per_bullet),
                    ("max_bullets", own.max_bullets),
                ],
                &mut violations,
            );
        }

        if violations.is_empty() {
            Ok(resolved)
        } else {
            Err(ContractViolation::Invalid(violations))
        }
    }
}

fn check_limits(
    path: &str,
    forbidden_words: &[String],
    limits: &[(&str, Option<usize>)],
    violations: &mut Vec<Violation>,
) {
    for (idx, word) in forbidden_words.iter().enumerate() {
        if word.trim().is_empty() {
            violations.push(Violation::new(
                format!("{path}.forbidden_words[{idx}]"),
                "must not be empty",
            ));
        }
    }
    for (name, value) in limits {
        if *value == Some(0) {
            violations.push(Violation::new(format!("{path}.{name}"), "must be positive"));
        }
    }
}

/// A slide after fitting: the content shape plus the template it was fitted against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EffectiveSlide {
    #[serde(flatten)]
    pub content: SlideContent,
    pub template: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub constraint_violations: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EffectiveSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "DeckConstraints::is_empty")]
    pub global_constraints: DeckConstraints,
    pub slides: Vec<EffectiveSlide>,
}
