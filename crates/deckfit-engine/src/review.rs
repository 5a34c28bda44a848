use std::collections::BTreeSet;

use anyhow::{anyhow, Result};
use deckfit_contracts::deck::{SlideContent, SlideLimits};
use deckfit_contracts::decisions::DecisionArena;
use deckfit_contracts::events::EventWriter;
use deckfit_contracts::templates::{TemplateCatalog, TemplateProfile};
use serde_json::json;
use similar::TextDiff;

use crate::config::{CapacityConfig, ReviewConfig};
use crate::providers::infer_emphasis;
use crate::rules::RuleTable;
use crate::scoring::FitScorer;
use crate::textfit::{
    body_overflows, char_len, fit_to_capacity, qualifier_well_formed, strip_qualifier,
    text_adjustments, FitOutcome, SlideFit, TextFitEngine,
};
use crate::{map_object, CancelFlag};

/// Facts shorter than this are not worth keeping in a regenerated message.
const MIN_FACT_CHARS: usize = 16;
const FACTS_PER_MESSAGE: usize = 2;
/// Score lead a repair must open for another template before the slide moves to it.
const REPLAN_MARGIN: f64 = 5.0;

/// Working copy of one slide while the deck is reviewed.
#[derive(Debug, Clone)]
pub struct SlideState {
    pub page: usize,
    /// Validated input slide; never rewritten.
    pub source: SlideContent,
    pub current: SlideContent,
    pub template: String,
    pub claim_budget: usize,
    pub violations: BTreeSet<String>,
    pub message_rewrites: usize,
    pub limits: SlideLimits,
    /// Shared rule table extended with the slide's forbidden words, when it has any.
    pub rules: Option<RuleTable>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewState {
    Repairing,
    Stable,
    MaxRoundsReached,
}

impl ReviewState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Repairing => "repairing",
            Self::Stable => "stable",
            Self::MaxRoundsReached => "max_rounds_reached",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DefectKind {
    DuplicateGoverningMessage,
    WeakTransition,
    OffToneMessage,
    ForbiddenPhrase,
    MalformedQualifier,
}

impl DefectKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DuplicateGoverningMessage => "duplicate_governing_message",
            Self::WeakTransition => "weak_transition",
            Self::OffToneMessage => "off_tone_message",
            Self::ForbiddenPhrase => "forbidden_phrase",
            Self::MalformedQualifier => "malformed_qualifier",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Defect {
    pub slide_index: usize,
    pub kind: DefectKind,
    pub detail: String,
    /// Set for claim-level defects.
    pub claim_index: Option<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReviewOutcome {
    pub state: ReviewState,
    pub rounds: u32,
    pub repairs: usize,
    /// `<slide_id>:<kind>` for every defect still present when the loop gave up.
    pub unresolved: Vec<String>,
}

/// Bounded scan/repair passes over the whole deck.
pub struct ReviewLoop<'a> {
    catalog: &'a TemplateCatalog,
    rules: &'a RuleTable,
    fitter: &'a TextFitEngine,
    config: &'a ReviewConfig,
    capacity: &'a CapacityConfig,
    max_rounds: u32,
    scorer: FitScorer,
}

impl<'a> ReviewLoop<'a> {
    pub fn new(
        catalog: &'a TemplateCatalog,
        rules: &'a RuleTable,
        fitter: &'a TextFitEngine,
        config: &'a ReviewConfig,
        capacity: &'a CapacityConfig,
        max_rounds: u32,
    ) -> Self {
        Self {
            catalog,
            rules,
            fitter,
            config,
            capacity,
            max_rounds,
            scorer: FitScorer,
        }
    }

    /// Defects of the deck in deck order; at most one message defect per slide.
    pub fn scan(&self, states: &[SlideState]) -> Vec<Defect> {
        let marker = self.fitter.qualifier_marker();
        let normalized = states
            .iter()
            .map(|state| normalize_message(&state.current.governing_message, marker))
            .collect::<Vec<String>>();

        let mut defects = Vec::new();
        for (idx, state) in states.iter().enumerate() {
            let message = &state.current.governing_message;
            let duplicate_of = (0..idx).find(|earlier| {
                near_duplicate(
                    &normalized[*earlier],
                    &normalized[idx],
                    self.config.near_duplicate_ratio,
                )
            });
            let weak = idx.checked_sub(1).and_then(|prev| {
                let distinctiveness =
                    1.0 - jaccard(&states[prev].current.headline(), &state.current.headline());
                (distinctiveness < self.config.min_distinctiveness).then_some(distinctiveness)
            });
            let rules = self.rules_for(state);
            let forbidden = rules.forbidden_matches(message);

            let message_defect = if let Some(earlier) = duplicate_of {
                Some((
                    DefectKind::DuplicateGoverningMessage,
                    format!("repeats message of {}", states[earlier].current.id),
                ))
            } else if let Some(distinctiveness) = weak {
                Some((
                    DefectKind::WeakTransition,
                    format!(
                        "distinctiveness {distinctiveness:.2} vs {} (min {:.2})",
                        states[idx - 1].current.id,
                        self.config.min_distinctiveness
                    ),
                ))
            } else if !rules.has_decision_term(message) {
                Some((
                    DefectKind::OffToneMessage,
                    "governing message has no decision term".to_string(),
                ))
            } else if !forbidden.is_empty() {
                Some((
                    DefectKind::ForbiddenPhrase,
                    format!("governing_message contains {}", forbidden.join(", ")),
                ))
            } else {
                None
            };
            if let Some((kind, detail)) = message_defect {
                defects.push(Defect {
                    slide_index: idx,
                    kind,
                    detail,
                    claim_index: None,
                });
            }

            for (claim_idx, claim) in state.current.claims.iter().enumerate() {
                let forbidden = rules.forbidden_matches(&claim.text);
                let defect = if !forbidden.is_empty() {
                    Some((
                        DefectKind::ForbiddenPhrase,
                        format!("claims[{claim_idx}] contains {}", forbidden.join(", ")),
                    ))
                } else if !qualifier_well_formed(&claim.text, marker) {
                    Some((
                        DefectKind::MalformedQualifier,
                        format!("claims[{claim_idx}] qualifier is malformed"),
                    ))
                } else {
                    None
                };
                if let Some((kind, detail)) = defect {
                    defects.push(Defect {
                        slide_index: idx,
                        kind,
                        detail,
                        claim_index: Some(claim_idx),
                    });
                }
            }
        }
        defects
    }

    /// Runs scan/repair rounds until a scan is clean or `max_rounds` is reached.
    ///
    /// Repairs made in round `r` are recorded as snapshots stamped `r + 1`.
    pub fn run(
        &self,
        states: &mut [SlideState],
        arena: &mut DecisionArena,
        events: &EventWriter,
        cancel: &CancelFlag,
    ) -> Result<ReviewOutcome> {
        let mut repairs = 0usize;
        for round in 1..=self.max_rounds {
            cancel.check()?;
            let defects = self.scan(states);
            let state = if defects.is_empty() {
                ReviewState::Stable
            } else if round == self.max_rounds {
                ReviewState::MaxRoundsReached
            } else {
                ReviewState::Repairing
            };
            events.emit(
                "review_round",
                map_object(json!({
                    "round": round,
                    "defects": defects.len(),
                    "kinds": defects.iter().map(|row| row.kind.as_str()).collect::<Vec<&str>>(),
                    "state": state.as_str(),
                })),
            )?;
            log::debug!("review round {round}: {} defect(s)", defects.len());

            match state {
                ReviewState::Stable => {
                    return Ok(ReviewOutcome {
                        state,
                        rounds: round,
                        repairs,
                        unresolved: Vec::new(),
                    });
                }
                ReviewState::MaxRoundsReached => {
                    let mut unresolved = Vec::with_capacity(defects.len());
                    for defect in &defects {
                        let slide = &states[defect.slide_index];
                        let note = format!(
                            "unresolved:{}@r{round}: {}",
                            defect.kind.as_str(),
                            defect.detail
                        );
                        self.snapshot(arena, slide, round, note)?;
                        unresolved.push(format!("{}:{}", slide.current.id, defect.kind.as_str()));
                    }
                    log::warn!(
                        "review stopped after {round} round(s) with {} unresolved defect(s)",
                        unresolved.len()
                    );
                    return Ok(ReviewOutcome {
                        state,
                        rounds: round,
                        repairs,
                        unresolved,
                    });
                }
                ReviewState::Repairing => {}
            }

            for defect in &defects {
                let slide = &mut states[defect.slide_index];
                let detail = self.repair(slide, defect)?;
                repairs += 1;
                let note = format!("{}@r{round}: {detail}", defect.kind.as_str());
                self.snapshot(arena, slide, round + 1, note)?;
                events.emit(
                    "slide_repaired",
                    map_object(json!({
                        "slide_id": slide.current.id,
                        "page": slide.page,
                        "kind": defect.kind.as_str(),
                        "round": round,
                        "detail": detail,
                    })),
                )?;
            }
        }

        Ok(ReviewOutcome {
            state: ReviewState::MaxRoundsReached,
            rounds: self.max_rounds,
            repairs,
            unresolved: Vec::new(),
        })
    }

    /// Applies one repair and returns the note detail.
    fn repair(&self, state: &mut SlideState, defect: &Defect) -> Result<String> {
        let template = self.template(state)?;
        let message_cap = template.zone_capacities.message;
        let lead_before = self.best_alternative(state)?.map(|(_, lead)| lead);
        let rules = state.rules.clone();
        let rules = rules.as_ref().unwrap_or(self.rules);
        let mut detail = defect.detail.clone();

        let touched = match (defect.kind, defect.claim_index) {
            (DefectKind::DuplicateGoverningMessage | DefectKind::WeakTransition, _) => {
                let regenerated = self.regenerate_message(state, template, rules);
                state.message_rewrites += 1;
                state.current.governing_message = regenerated.text.clone();
                detail.push_str("; regenerated message");
                ("governing_message".to_string(), regenerated)
            }
            (DefectKind::OffToneMessage, _) => {
                let refit = self.fitter.fit_message_preserving_decision_verb(
                    &state.source.governing_message,
                    message_cap,
                    rules,
                );
                let outcome = if rules.has_decision_term(&refit.text) {
                    detail.push_str("; refit from source");
                    refit
                } else {
                    let regenerated = self.regenerate_message(state, template, rules);
                    state.message_rewrites += 1;
                    detail.push_str("; regenerated message");
                    regenerated
                };
                state.current.governing_message = outcome.text.clone();
                ("governing_message".to_string(), outcome)
            }
            (DefectKind::ForbiddenPhrase, None) => {
                let stripped = rules.strip_forbidden(&state.current.governing_message);
                let outcome =
                    self.fitter
                        .fit_message_preserving_decision_verb(&stripped, message_cap, rules);
                state.current.governing_message = outcome.text.clone();
                detail.push_str("; phrase removed");
                ("governing_message".to_string(), outcome)
            }
            (DefectKind::ForbiddenPhrase, Some(idx)) | (DefectKind::MalformedQualifier, Some(idx)) => {
                let claim = state
                    .current
                    .claims
                    .get_mut(idx)
                    .ok_or_else(|| anyhow!("claim {idx} missing on {}", state.source.id))?;
                let text = if defect.kind == DefectKind::ForbiddenPhrase {
                    rules.strip_forbidden(&claim.text)
                } else {
                    claim.text.clone()
                };
                let outcome = if text.trim().is_empty() {
                    detail.push_str("; nothing left after removal, kept as is");
                    FitOutcome::unchanged(&claim.text)
                } else {
                    self.fitter
                        .fit_claim_preserving_qualifier(&text, state.claim_budget)
                };
                claim.text = outcome.text.clone();
                (format!("claims[{idx}]"), outcome)
            }
            (DefectKind::MalformedQualifier, None) => {
                return Err(anyhow!("qualifier defect without a claim index"));
            }
        };

        let (field, outcome) = touched;
        if outcome.constraint_violated {
            detail.push_str(&format!(" (constraint violated: {field})"));
            state.violations.insert(field);
        } else {
            state.violations.remove(&field);
        }
        flag(
            &mut state.violations,
            "body",
            body_overflows(&state.current, template),
        );

        if let Some((best, lead)) = self.best_alternative(state)? {
            if lead - lead_before.unwrap_or(0.0) > REPLAN_MARGIN {
                self.replan(state, best, rules);
                detail.push_str(&format!("; re-planned {} -> {}", template.name, best.name));
            }
        }
        Ok(detail)
    }

    /// Best-scoring candidate other than the slide's template, with its lead over that template.
    fn best_alternative(&self, state: &SlideState) -> Result<Option<(&'a TemplateProfile, f64)>> {
        let current = self.scorer.score(&state.current, self.template(state)?).total;
        let candidates = self.catalog.candidates(&state.current.category);
        Ok(self
            .scorer
            .rank(&state.current, &candidates)
            .into_iter()
            .next()
            .filter(|(best, _)| best.name != state.template)
            .map(|(best, breakdown)| (best, breakdown.total - current)))
    }

    /// Moves the slide to `template` and refits its current text against the new zones.
    fn replan(&self, state: &mut SlideState, template: &TemplateProfile, rules: &RuleTable) {
        let claim_budget = self.scorer.claim_budget(
            template,
            state.current.claims.len(),
            self.capacity,
            state.limits.max_chars_per_claim,
        );
        let fit = fit_with_limits(
            self.fitter,
            &state.current,
            template,
            claim_budget,
            rules,
            &state.limits,
        );
        log::debug!(
            "{} re-planned {} -> {}",
            state.source.id,
            state.template,
            template.name
        );
        state
            .violations
            .retain(|field| field != "body" && field != "claims");
        state.violations.extend(fit.violations);
        state.current = fit.content;
        state.template = template.name.clone();
        state.claim_budget = claim_budget;
    }

    fn rules_for<'s>(&'s self, state: &'s SlideState) -> &'s RuleTable {
        state.rules.as_ref().unwrap_or(self.rules)
    }

    /// Builds `"<fact>; <fact> => <verb> <focus>"` from the slide's own claims.
    fn regenerate_message(
        &self,
        state: &SlideState,
        template: &TemplateProfile,
        rules: &RuleTable,
    ) -> FitOutcome {
        let capacity = template.zone_capacities.message;
        let attempt = state.message_rewrites;
        let verb = rules.regeneration_verb(&state.current.category, attempt);
        let suffix = format!("{verb} {}", focus_phrase(&state.current.title));
        let facts = pick_facts(&state.current, attempt, self.fitter.qualifier_marker());

        let message = if facts.is_empty() {
            suffix
        } else {
            let fact_budget = capacity.saturating_sub(char_len(&suffix) + 4);
            if fact_budget < MIN_FACT_CHARS {
                suffix
            } else {
                let facts = fit_to_capacity(&facts.join("; "), fact_budget);
                format!("{} => {suffix}", facts.text)
            }
        };
        self.fitter
            .fit_message_preserving_decision_verb(&message, capacity, rules)
    }

    fn snapshot(
        &self,
        arena: &mut DecisionArena,
        state: &SlideState,
        round: u32,
        note: String,
    ) -> Result<()> {
        let mut decision = arena
            .current(&state.source.id)
            .cloned()
            .ok_or_else(|| anyhow!("no decision recorded for {}", state.source.id))?;
        let template = self.template(state)?;
        if decision.template != template.name {
            decision.template = template.name.clone();
            decision.emphasis = infer_emphasis(&state.current, template).as_str().to_string();
            decision.fit_score_before = self.scorer.score(&state.source, template).total;
        }
        decision.review_round = decision.review_round.max(round);
        decision.review_notes.push(note);
        decision.fit_score_after = self.scorer.score(&state.current, template).total;
        decision.text_adjustments = text_adjustments(&state.source, &state.current);
        arena.record(decision)
    }

    fn template(&self, state: &SlideState) -> Result<&'a TemplateProfile> {
        self.catalog
            .get(&state.template)
            .ok_or_else(|| anyhow!("template '{}' is not in the catalog", state.template))
    }
}

/// `fit_slide` plus the slide's claim-count limit.
pub(crate) fn fit_with_limits(
    fitter: &TextFitEngine,
    slide: &SlideContent,
    template: &TemplateProfile,
    claim_budget: usize,
    rules: &RuleTable,
    limits: &SlideLimits,
) -> SlideFit {
    let mut fit = fitter.fit_slide(slide, template, claim_budget, rules);
    if limits.claims_exceeded(fit.content.claims.len()) {
        fit.violations.push("claims".to_string());
    }
    fit
}

fn flag(violations: &mut BTreeSet<String>, field: &str, violated: bool) {
    if violated {
        violations.insert(field.to_string());
    } else {
        violations.remove(field);
    }
}

fn tokens(text: &str) -> BTreeSet<String> {
    text.split(|ch: char| !ch.is_alphanumeric())
        .filter(|token| !token.is_empty())
        .map(str::to_lowercase)
        .collect()
}

fn jaccard(left: &str, right: &str) -> f64 {
    let left = tokens(left);
    let right = tokens(right);
    let union = left.union(&right).count();
    if union == 0 {
        return 0.0;
    }
    left.intersection(&right).count() as f64 / union as f64
}

fn normalize_message(text: &str, marker: &str) -> String {
    strip_qualifier(text, marker)
        .split(|ch: char| !ch.is_alphanumeric())
        .filter(|token| !token.is_empty())
        .map(str::to_lowercase)
        .collect::<Vec<String>>()
        .join(" ")
}

fn near_duplicate(left: &str, right: &str, ratio: f64) -> bool {
    if left.is_empty() || right.is_empty() {
        return false;
    }
    left == right || f64::from(TextDiff::from_words(left, right).ratio()) >= ratio
}

/// Title turned into the object of a verb: trailing punctuation dropped, leading capital lowered
/// unless the first word is an acronym.
fn focus_phrase(title: &str) -> String {
    let trimmed = title.trim().trim_end_matches(['.', '!', '?', ':']);
    let mut chars = trimmed.chars();
    match (chars.next(), chars.next()) {
        (Some(first), Some(second)) if first.is_uppercase() && second.is_lowercase() => {
            first.to_lowercase().chain(trimmed.chars().skip(1)).collect()
        }
        _ => trimmed.to_string(),
    }
}

/// Qualifier-free claim texts, numeric ones first, rotated by `attempt`.
fn pick_facts(slide: &SlideContent, attempt: usize, marker: &str) -> Vec<String> {
    let facts = slide
        .claims
        .iter()
        .map(|claim| {
            strip_qualifier(&claim.text, marker)
                .trim()
                .trim_end_matches(['.', '…'])
                .trim()
                .to_string()
        })
        .filter(|fact| !fact.is_empty())
        .collect::<Vec<String>>();
    if facts.is_empty() {
        return facts;
    }
    let mut order = (0..facts.len()).collect::<Vec<usize>>();
    order.sort_by_key(|idx| (!facts[*idx].chars().any(|ch| ch.is_ascii_digit()), *idx));
    let len = order.len();
    order.rotate_left(attempt % len);
    order
        .into_iter()
        .take(FACTS_PER_MESSAGE)
        .map(|idx| facts[idx].clone())
        .collect()
}
