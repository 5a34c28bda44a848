pub mod capacity;
pub mod catalog;
pub mod config;
pub mod planner;
pub mod providers;
pub mod review;
pub mod rules;
pub mod scoring;
pub mod textfit;

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use anyhow::{anyhow, bail, Result};
use deckfit_contracts::deck::{
    ContentSpec, EffectiveSlide, EffectiveSpec, SlideContent, SlideLimits,
};
use deckfit_contracts::decisions::{
    DecisionArena, DecisionLog, LayoutDecision, DECISION_LOG_SCHEMA_VERSION,
};
use deckfit_contracts::error::ContractViolation;
use deckfit_contracts::events::EventWriter;
use deckfit_contracts::providers::{select_provider, ProviderSelection};
use deckfit_contracts::summary::RunSummary;
use deckfit_contracts::templates::TemplateCatalog;
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};

use crate::capacity::{estimate_lines, CapacityModel, DEFAULT_CHARS_PER_LINE, MAX_LINES_PER_CLAIM};
use crate::catalog::{bundled_catalog, load_catalog};
use crate::planner::{LayoutPlanner, PlannedLayout};
use crate::providers::{default_provider_registry, DecisionProvider, DecisionProviderRegistry};
use crate::review::{fit_with_limits, ReviewLoop, SlideState};
use crate::rules::RuleTable;
use crate::scoring::FitScorer;
use crate::textfit::{text_adjustments, SlideFit, TextFitEngine};

pub use config::PipelineConfig;

/// Shared cancellation flag, checked before planning and at the start of every review round.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            bail!("run cancelled");
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct RunOutput {
    pub run_id: String,
    pub effective: EffectiveSpec,
    pub decision_log: DecisionLog,
    pub summary: RunSummary,
}

struct DraftSlide {
    planned: PlannedLayout,
    fit: SlideFit,
    limits: SlideLimits,
    claim_budget: usize,
    fit_score_before: f64,
    fit_score_after: f64,
}

/// One configured pipeline: catalog, rule table, fitter and provider registry, built once and
/// reused for any number of runs.
pub struct LayoutEngine {
    config: PipelineConfig,
    catalog: TemplateCatalog,
    rules: RuleTable,
    fitter: TextFitEngine,
    providers: DecisionProviderRegistry,
    selection: ProviderSelection,
}

impl LayoutEngine {
    pub fn new(config: PipelineConfig) -> Result<Self> {
        config.validate()?;
        let capacity = CapacityModel::new(config.capacity.floor, config.capacity.fill_ratio);
        let catalog = match &config.catalog_path {
            Some(path) => load_catalog(path, &capacity)?,
            None => bundled_catalog(&capacity)?,
        };
        let rules = match &config.rules_path {
            Some(path) => RuleTable::load(path)?,
            None => RuleTable::bundled()?,
        };
        let providers = default_provider_registry(&config)?;
        log::debug!("registered providers: {}", providers.names().join(", "));
        let selection = select_provider(config.provider.as_deref(), config.deterministic);
        if let Some(reason) = &selection.fallback_reason {
            log::info!("provider {}: {reason}", selection.kind);
        }
        Ok(Self {
            fitter: TextFitEngine::new(config.qualifier_marker.clone()),
            config,
            catalog,
            rules,
            providers,
            selection,
        })
    }

    /// Replaces the provider registered under the same kind.
    pub fn register_provider<P: DecisionProvider + 'static>(&mut self, provider: P) {
        self.providers.register(provider);
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn catalog(&self) -> &TemplateCatalog {
        &self.catalog
    }

    pub fn selection(&self) -> &ProviderSelection {
        &self.selection
    }

    /// Checks the input contract and resolves category aliases.
    pub fn validate(&self, spec: &ContentSpec) -> Result<ContentSpec, ContractViolation> {
        spec.validated(|raw| self.catalog.resolve_category(raw))
    }

    /// Content-derived in deterministic mode, random otherwise.
    pub fn run_id_for(&self, spec: &ContentSpec) -> String {
        if !self.config.deterministic {
            return format!("run-{}", uuid::Uuid::new_v4().simple());
        }
        let digest = stable_hash(&json!({
            "spec": spec,
            "seed": self.config.seed,
            "provider": self.selection.kind.as_str(),
            "max_review_rounds": self.config.max_review_rounds,
        }));
        format!("run-{}", &digest[..16])
    }

    /// Plans, fits and reviews `spec`. The run id is taken from `events`.
    pub fn run(
        &self,
        spec: &ContentSpec,
        events: &EventWriter,
        cancel: &CancelFlag,
    ) -> Result<RunOutput> {
        let deterministic = self.config.deterministic;
        let started_at = (!deterministic).then(now_utc_iso);
        let run_id = events.run_id().to_string();
        let validated = self.validate(spec)?;
        let slides = &validated.slides;

        events.emit(
            "run_started",
            map_object(json!({
                "slides": slides.len(),
                "deterministic": deterministic,
                "seed": self.config.seed,
                "max_review_rounds": self.config.max_review_rounds,
                "templates": self.catalog.list().count(),
            })),
        )?;
        events.emit(
            "provider_selected",
            map_object(json!({
                "provider": self.selection.kind.as_str(),
                "requested": self.selection.requested,
                "fallback_reason": self.selection.fallback_reason,
            })),
        )?;
        log::info!(
            "run {run_id}: {} slide(s) with provider {}",
            slides.len(),
            self.selection.kind
        );

        cancel.check()?;
        let planner = LayoutPlanner::new(
            &self.catalog,
            &self.providers,
            self.selection.kind,
            self.config.timeout(),
        );
        let drafts = map_slides(self.config.parallel, slides.len(), |index| {
            self.draft_slide(&planner, &validated, index)
        })?;

        let mut arena = DecisionArena::new();
        let mut states = Vec::with_capacity(slides.len());
        let mut fallbacks = 0usize;
        for (index, (slide, draft)) in slides.iter().zip(drafts).enumerate() {
            let page = index + 1;
            events.emit(
                "slide_planned",
                map_object(json!({
                    "slide_id": slide.id,
                    "page": page,
                    "template": draft.planned.template,
                    "emphasis": draft.planned.emphasis.as_str(),
                    "provider": draft.planned.provider,
                    "fit_score_before": draft.fit_score_before,
                    "fit_score_after": draft.fit_score_after,
                    "constraint_violations": draft.fit.violations,
                })),
            )?;
            if let Some(reason) = &draft.planned.fallback_reason {
                fallbacks += 1;
                events.emit(
                    "provider_fallback",
                    map_object(json!({
                        "slide_id": slide.id,
                        "page": page,
                        "provider": self.selection.kind.as_str(),
                        "reason": reason,
                    })),
                )?;
            }

            let mut rationale = draft.planned.rationale.clone();
            if let Some(note) = line_estimate_note(slide) {
                rationale.push_str("; ");
                rationale.push_str(&note);
            }
            arena.record(LayoutDecision {
                slide_id: slide.id.clone(),
                page,
                template: draft.planned.template.clone(),
                emphasis: draft.planned.emphasis.as_str().to_string(),
                provider: draft.planned.provider.clone(),
                rationale,
                fit_score_before: draft.fit_score_before,
                fit_score_after: draft.fit_score_after,
                text_adjustments: text_adjustments(slide, &draft.fit.content),
                review_round: 1,
                review_notes: draft
                    .fit
                    .violations
                    .iter()
                    .map(|field| format!("constraint_violated@r1: {field}"))
                    .collect(),
            })?;
            let rules = if draft.limits.forbidden_words.is_empty() {
                None
            } else {
                Some(self.rules.with_forbidden_words(&draft.limits.forbidden_words)?)
            };
            states.push(SlideState {
                page,
                source: slide.clone(),
                current: draft.fit.content,
                template: draft.planned.template,
                claim_budget: draft.claim_budget,
                violations: draft.fit.violations.into_iter().collect::<BTreeSet<String>>(),
                message_rewrites: 0,
                limits: draft.limits,
                rules,
            });
        }

        let review = ReviewLoop::new(
            &self.catalog,
            &self.rules,
            &self.fitter,
            &self.config.review,
            &self.config.capacity,
            self.config.max_review_rounds,
        );
        let outcome = review.run(&mut states, &mut arena, events, cancel)?;

        let effective = EffectiveSpec {
            title: validated.title.clone(),
            global_constraints: validated.global_constraints.clone(),
            slides: states
                .iter()
                .map(|state| EffectiveSlide {
                    content: state.current.clone(),
                    template: state.template.clone(),
                    constraint_violations: state.violations.iter().cloned().collect(),
                })
                .collect(),
        };
        let constraint_violations = states
            .iter()
            .map(|state| state.violations.len())
            .sum::<usize>();
        let finished_at = (!deterministic).then(now_utc_iso);
        let decision_log = DecisionLog {
            schema_version: DECISION_LOG_SCHEMA_VERSION,
            run_id: run_id.clone(),
            provider: self.selection.kind.as_str().to_string(),
            deterministic,
            seed: self.config.seed,
            review_state: outcome.state.as_str().to_string(),
            review_rounds: outcome.rounds,
            generated_at: finished_at.clone(),
            decisions: arena.current_decisions(),
        };
        let summary = RunSummary {
            run_id: run_id.clone(),
            review_state: outcome.state.as_str().to_string(),
            review_rounds: outcome.rounds,
            slides: states.len(),
            repairs: outcome.repairs,
            unresolved: outcome.unresolved,
            fallbacks,
            constraint_violations,
            started_at,
            finished_at,
        };

        events.emit(
            "run_finished",
            map_object(json!({
                "review_state": summary.review_state,
                "review_rounds": summary.review_rounds,
                "repairs": summary.repairs,
                "unresolved": summary.unresolved.len(),
                "fallbacks": summary.fallbacks,
                "constraint_violations": summary.constraint_violations,
            })),
        )?;
        log::info!(
            "run {run_id}: {} after {} round(s), {} repair(s), {} unresolved",
            summary.review_state,
            summary.review_rounds,
            summary.repairs,
            summary.unresolved.len()
        );

        Ok(RunOutput {
            run_id,
            effective,
            decision_log,
            summary,
        })
    }

    fn draft_slide(
        &self,
        planner: &LayoutPlanner<'_>,
        spec: &ContentSpec,
        index: usize,
    ) -> Result<DraftSlide> {
        let planned = planner.plan(&spec.slides, index)?;
        let slide = &spec.slides[index];
        let limits = spec.limits_for(slide);
        let template = self
            .catalog
            .get(&planned.template)
            .ok_or_else(|| anyhow!("template '{}' is not in the catalog", planned.template))?;
        let scorer = FitScorer;
        let claim_budget = scorer.claim_budget(
            template,
            slide.claims.len(),
            &self.config.capacity,
            limits.max_chars_per_claim,
        );
        let fit = fit_with_limits(
            &self.fitter,
            slide,
            template,
            claim_budget,
            &self.rules,
            &limits,
        );
        Ok(DraftSlide {
            fit_score_before: scorer.score(slide, template).total,
            fit_score_after: scorer.score(&fit.content, template).total,
            planned,
            fit,
            limits,
            claim_budget,
        })
    }
}

/// Runs `job` for every slide index and returns the results in deck order.
///
/// With `parallel`, indices are striped across scoped worker threads that all join before this
/// returns.
pub fn map_slides<T, F>(parallel: bool, count: usize, job: F) -> Result<Vec<T>>
where
    T: Send,
    F: Fn(usize) -> Result<T> + Sync,
{
    if !parallel || count < 2 {
        return (0..count).map(job).collect();
    }
    let workers = thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .clamp(1, count);
    let mut slots = (0..count).map(|_| None).collect::<Vec<Option<Result<T>>>>();
    thread::scope(|scope| -> Result<()> {
        let job = &job;
        let handles = (0..workers)
            .map(|worker| {
                scope.spawn(move || {
                    (worker..count)
                        .step_by(workers)
                        .map(|index| (index, job(index)))
                        .collect::<Vec<(usize, Result<T>)>>()
                })
            })
            .collect::<Vec<_>>();
        for handle in handles {
            let rows = handle
                .join()
                .map_err(|_| anyhow!("slide worker panicked"))?;
            for (index, row) in rows {
                slots[index] = Some(row);
            }
        }
        Ok(())
    })?;
    slots
        .into_iter()
        .enumerate()
        .map(|(index, slot)| slot.unwrap_or_else(|| Err(anyhow!("slide {index} was not planned"))))
        .collect()
}

fn line_estimate_note(slide: &SlideContent) -> Option<String> {
    let long = slide
        .claims
        .iter()
        .enumerate()
        .filter_map(|(idx, claim)| {
            let lines = estimate_lines(&claim.text, DEFAULT_CHARS_PER_LINE);
            (lines > MAX_LINES_PER_CLAIM).then(|| format!("claims[{idx}] ~{lines} lines"))
        })
        .collect::<Vec<String>>();
    if long.is_empty() {
        return None;
    }
    Some(format!(
        "over {MAX_LINES_PER_CLAIM} lines at {DEFAULT_CHARS_PER_LINE} chars/line: {}",
        long.join(", ")
    ))
}

fn stable_hash(payload: &Value) -> String {
    let bytes = serde_json::to_vec(payload).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

pub(crate) fn map_object(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

fn now_utc_iso() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Micros, false)
}

#[cfg(test)]
mod tests {
    use anyhow::bail;
    use deckfit_contracts::deck::{
        Claim, ContentSpec, DeckConstraints, SlideConstraints, SlideContent,
    };
    use deckfit_contracts::error::ContractViolation;
    use deckfit_contracts::events::EventWriter;
    use deckfit_contracts::providers::ProviderKind;
    use serde_json::Value;

    use super::{map_slides, CancelFlag, LayoutEngine, PipelineConfig};
    use crate::providers::{DecisionProvider, DecisionRequest, ProviderDecision};

    struct UnreachableHost;

    impl DecisionProvider for UnreachableHost {
        fn kind(&self) -> ProviderKind {
            ProviderKind::HostedModel
        }

        fn decide(&self, _request: &DecisionRequest<'_>) -> anyhow::Result<ProviderDecision> {
            bail!("connection refused")
        }
    }

    fn slide(id: &str, category: &str, title: &str, message: &str, claims: &[&str]) -> SlideContent {
        SlideContent {
            id: id.to_string(),
            category: category.to_string(),
            title: title.to_string(),
            governing_message: message.to_string(),
            claims: claims
                .iter()
                .enumerate()
                .map(|(idx, text)| Claim {
                    text: text.to_string(),
                    supporting_reference_ids: vec![format!("sources.md#{id}-{idx}")],
                })
                .collect(),
            visual_requests: Vec::new(),
            source_footer: vec!["Company filings".to_string()],
            slide_constraints: SlideConstraints::default(),
        }
    }

    fn duplicate_deck() -> ContentSpec {
        ContentSpec {
            title: Some("Retention review".to_string()),
            global_constraints: DeckConstraints::default(),
            slides: vec![
                slide(
                    "s1",
                    "analysis",
                    "Churn in enterprise accounts",
                    "Prioritize retention over new logos.",
                    &["Churn doubled to 9% in FY2024.", "Renewal rates fell in every region."],
                ),
                slide(
                    "s2",
                    "content",
                    "Support backlog trends",
                    "Prioritize retention over new logos.",
                    &["Ticket backlog rose 40% since March.", "Median response time is 31 hours."],
                ),
            ],
        }
    }

    fn deterministic_config(provider: &str) -> PipelineConfig {
        PipelineConfig {
            provider: Some(provider.to_string()),
            deterministic: true,
            seed: 7,
            ..PipelineConfig::default()
        }
    }

    #[test]
    fn duplicate_message_deck_stabilizes_at_round_two() -> anyhow::Result<()> {
        let engine = LayoutEngine::new(deterministic_config("heuristic"))?;
        let spec = duplicate_deck();
        let events = EventWriter::disabled(engine.run_id_for(&spec));
        let output = engine.run(&spec, &events, &CancelFlag::new())?;

        assert_eq!(output.decision_log.review_state, "stable");
        assert_eq!(output.decision_log.review_rounds, 2);
        assert!(output.summary.converged());
        assert_eq!(output.summary.repairs, 1);

        let decisions = &output.decision_log.decisions;
        assert_eq!(decisions.len(), 2);
        assert_eq!(decisions[0].review_round, 1);
        assert!(decisions[0].review_notes.is_empty());
        assert_eq!(decisions[1].review_round, 2);
        assert_eq!(decisions[1].review_notes.len(), 1);
        assert!(decisions[1].review_notes[0].starts_with("duplicate_governing_message@r1: "));

        let slides = &output.effective.slides;
        assert_eq!(slides[1].content.category, "analysis");
        assert_ne!(
            slides[0].content.governing_message,
            slides[1].content.governing_message
        );
        Ok(())
    }

    #[test]
    fn deterministic_runs_replay_byte_identical() -> anyhow::Result<()> {
        let spec = duplicate_deck();
        let mut rendered = Vec::new();
        for _ in 0..2 {
            let engine = LayoutEngine::new(deterministic_config("local-reasoning"))?;
            let events = EventWriter::disabled(engine.run_id_for(&spec));
            let output = engine.run(&spec, &events, &CancelFlag::new())?;
            assert!(output.decision_log.generated_at.is_none());
            assert!(output.run_id.starts_with("run-"));
            assert_eq!(output.run_id.len(), 20);
            rendered.push((
                serde_json::to_string_pretty(&output.decision_log)?,
                serde_json::to_string_pretty(&output.effective)?,
            ));
        }
        assert_eq!(rendered[0].0, rendered[1].0);
        assert_eq!(rendered[0].1, rendered[1].1);
        Ok(())
    }

    #[test]
    fn repeated_title_and_message_settle_after_one_regeneration() -> anyhow::Result<()> {
        let mut spec = duplicate_deck();
        spec.slides[1].title = spec.slides[0].title.clone();
        let engine = LayoutEngine::new(deterministic_config("heuristic"))?;
        let output = engine.run(&spec, &EventWriter::disabled("run-dup"), &CancelFlag::new())?;

        assert_eq!(output.decision_log.review_state, "stable");
        assert_eq!(output.decision_log.review_rounds, 2);
        let notes = &output.decision_log.decisions[1].review_notes;
        assert_eq!(notes.len(), 1);
        assert!(notes[0].starts_with("duplicate_governing_message@r1: repeats message of s1"));
        assert!(output.decision_log.decisions[0].review_notes.is_empty());
        assert_eq!(
            output.effective.slides[1].content.governing_message,
            "Ticket backlog rose 40% since March; Median response time is 31 hours => Prioritize churn in enterprise accounts"
        );
        Ok(())
    }

    #[test]
    fn deck_and_slide_constraints_shape_the_fit() -> anyhow::Result<()> {
        let mut guarded = slide(
            "s1",
            "analysis",
            "Partner channel mix",
            "Prioritize partner synergy in APAC.",
            &["Two partners drive 70% of channel revenue in APAC today.", "Partner NPS is 41."],
        );
        guarded.slide_constraints = SlideConstraints {
            forbidden_words: Vec::new(),
            max_chars_per_bullet: Some(40),
            max_bullets: Some(1),
        };
        let spec = ContentSpec {
            title: None,
            global_constraints: DeckConstraints {
                forbidden_words: vec!["synergy".to_string()],
                ..DeckConstraints::default()
            },
            slides: vec![guarded],
        };
        let engine = LayoutEngine::new(deterministic_config("heuristic"))?;
        let output = engine.run(&spec, &EventWriter::disabled("run-limits"), &CancelFlag::new())?;

        let effective = &output.effective.slides[0];
        assert_eq!(effective.content.governing_message, "Prioritize partner in APAC.");
        assert!(effective.content.claims[0].text.chars().count() <= 40);
        assert_eq!(effective.content.claims[1].text, "Partner NPS is 41.");
        assert_eq!(
            effective.content.claims[0].supporting_reference_ids,
            vec!["sources.md#s1-0".to_string()]
        );
        assert!(effective.constraint_violations.contains(&"claims".to_string()));
        assert_eq!(output.effective.global_constraints, spec.global_constraints);
        assert_eq!(output.decision_log.review_state, "stable");
        let notes = &output.decision_log.decisions[0].review_notes;
        assert!(notes.iter().any(|note| note == "constraint_violated@r1: claims"));
        assert!(notes.iter().any(|note| note.contains("word:synergy")));
        Ok(())
    }

    #[test]
    fn rewriting_keeps_reference_ids() -> anyhow::Result<()> {
        let long_claim = format!(
            "{} (Implication: shift field sales capacity to APAC",
            "APAC pipeline coverage grew to 3.4x while North America stalled at 1.9x, ".repeat(4)
        );
        let spec = ContentSpec {
            title: None,
            global_constraints: DeckConstraints::default(),
            slides: vec![slide(
                "s1",
                "chart_focus",
                "Pipeline coverage by region",
                "Reallocate field capacity toward APAC where coverage is strongest.",
                &[long_claim.as_str(), "Win rates held at 22% in both regions."],
            )],
        };
        let engine = LayoutEngine::new(deterministic_config("heuristic"))?;
        let output = engine.run(&spec, &EventWriter::disabled("run-refs"), &CancelFlag::new())?;

        let effective = &output.effective.slides[0];
        assert_eq!(effective.content.category, "chart");
        for (before, after) in spec.slides[0].claims.iter().zip(&effective.content.claims) {
            assert_eq!(before.supporting_reference_ids, after.supporting_reference_ids);
        }
        let fitted = &effective.content.claims[0].text;
        assert!(fitted.chars().count() <= 180);
        assert!(fitted.ends_with(')'));
        assert_eq!(fitted.matches("(Implication:").count(), 1);
        assert!(output.decision_log.decisions[0].text_adjustments.claims >= 1);
        assert!(output.decision_log.decisions[0]
            .rationale
            .contains("lines at 38 chars/line"));
        Ok(())
    }

    #[test]
    fn unknown_category_is_a_contract_violation() -> anyhow::Result<()> {
        let engine = LayoutEngine::new(deterministic_config("heuristic"))?;
        let spec = ContentSpec {
            title: None,
            global_constraints: DeckConstraints::default(),
            slides: vec![slide(
                "s1",
                "org_chart",
                "Team",
                "Prioritize hiring.",
                &["Headcount is 42."],
            )],
        };
        let err = match engine.run(&spec, &EventWriter::disabled("run-x"), &CancelFlag::new()) {
            Ok(_) => bail!("expected a contract violation"),
            Err(err) => err,
        };
        let violation = err.downcast_ref::<ContractViolation>();
        assert!(matches!(violation, Some(ContractViolation::Invalid(_))));
        Ok(())
    }

    #[test]
    fn failing_provider_falls_back_and_is_logged() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let events_path = temp.path().join("events.jsonl");
        let mut engine = LayoutEngine::new(PipelineConfig {
            provider: Some("hosted-model".to_string()),
            parallel: false,
            ..PipelineConfig::default()
        })?;
        engine.register_provider(UnreachableHost);
        let spec = duplicate_deck();
        let events = EventWriter::new(Some(events_path.clone()), engine.run_id_for(&spec), true);
        let output = engine.run(&spec, &events, &CancelFlag::new())?;

        assert_eq!(output.summary.fallbacks, 2);
        assert!(output.summary.started_at.is_some());
        assert!(output.decision_log.generated_at.is_some());
        for decision in &output.decision_log.decisions {
            assert_eq!(decision.provider, "fallback");
            assert!(decision
                .rationale
                .starts_with("fallback from hosted-model: connection refused"));
        }

        let raw = std::fs::read_to_string(&events_path)?;
        let rows = raw
            .lines()
            .map(serde_json::from_str::<Value>)
            .collect::<Result<Vec<Value>, _>>()?;
        let types = rows
            .iter()
            .filter_map(|row| row.get("type").and_then(Value::as_str))
            .collect::<Vec<&str>>();
        assert_eq!(types.first(), Some(&"run_started"));
        assert_eq!(types.last(), Some(&"run_finished"));
        assert_eq!(types.iter().filter(|kind| **kind == "provider_fallback").count(), 2);
        assert!(rows.iter().all(|row| row.get("ts").is_some()));
        Ok(())
    }

    #[test]
    fn deterministic_mode_refuses_the_hosted_provider() -> anyhow::Result<()> {
        let engine = LayoutEngine::new(deterministic_config("hosted-model"))?;
        assert_eq!(engine.selection().kind, ProviderKind::LocalReasoning);
        assert!(engine.selection().fallback_reason.is_some());
        Ok(())
    }

    #[test]
    fn cancelled_run_returns_an_error() -> anyhow::Result<()> {
        let engine = LayoutEngine::new(deterministic_config("heuristic"))?;
        let cancel = CancelFlag::new();
        cancel.cancel();
        let result = engine.run(&duplicate_deck(), &EventWriter::disabled("run-c"), &cancel);
        assert_eq!(
            result.err().map(|err| err.to_string()).as_deref(),
            Some("run cancelled")
        );
        Ok(())
    }

    #[test]
    fn map_slides_keeps_deck_order() -> anyhow::Result<()> {
        let parallel = map_slides(true, 9, |index| Ok(index * 3))?;
        let serial = map_slides(false, 9, |index| Ok(index * 3))?;
        assert_eq!(parallel, serial);
        assert!(map_slides(true, 4, |index| if index == 2 {
            Err(anyhow::anyhow!("bad slide"))
        } else {
            Ok(index)
        })
        .is_err());
        Ok(())
    }
}
