use deckfit_contracts::deck::SlideContent;
use deckfit_contracts::templates::{TemplateCatalog, TemplateProfile};
use serde::Serialize;

use crate::config::CapacityConfig;
use crate::textfit::char_len;

const ZONE_BASE: f64 = 10.0;
const OVERFLOW_WEIGHT: f64 = 40.0;
const UNDERFILL_RATIO: f64 = 0.2;
const BODY_UNDERFILL_WEIGHT: f64 = 6.0;
/// Short titles and messages are normal, so their under-fill costs less than an empty body.
const TEXT_UNDERFILL_WEIGHT: f64 = 2.0;
const BODY_WEIGHT: f64 = 2.0;
const VISUAL_MATCH: f64 = 12.0;
const VISUAL_MISS_PER_ITEM: f64 = 6.0;
const CLAIM_MATCH: f64 = 6.0;
const CLAIM_MISS_PER_ITEM: f64 = 4.0;
const CATEGORY_BONUS: f64 = 20.0;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FitBreakdown {
    pub template: String,
    pub title: f64,
    pub message: f64,
    pub body: f64,
    pub visuals: f64,
    pub claims: f64,
    pub category: f64,
    pub total: f64,
}

/// Scores slide content against a template; higher is better.
#[derive(Debug, Clone, Copy, Default)]
pub struct FitScorer;

impl FitScorer {
    pub fn score(&self, slide: &SlideContent, template: &TemplateProfile) -> FitBreakdown {
        let capacities = template.zone_capacities;
        let body_len = slide
            .claims
            .iter()
            .map(|claim| char_len(&claim.text))
            .sum::<usize>();

        let title = zone_term(char_len(&slide.title), capacities.title, TEXT_UNDERFILL_WEIGHT);
        let message = zone_term(
            char_len(&slide.governing_message),
            capacities.message,
            TEXT_UNDERFILL_WEIGHT,
        );
        let body = BODY_WEIGHT * zone_term(body_len, capacities.body, BODY_UNDERFILL_WEIGHT);

        let range = template.expected_visual_count_range;
        let visual_count = slide.visual_requests.len();
        let visuals = if range.contains(visual_count) {
            VISUAL_MATCH
        } else {
            -VISUAL_MISS_PER_ITEM * range.distance(visual_count) as f64
        };
        let range = template.expected_claim_count_range;
        let claim_count = slide.claims.len();
        let claims = if range.contains(claim_count) {
            CLAIM_MATCH
        } else {
            -CLAIM_MISS_PER_ITEM * range.distance(claim_count) as f64
        };
        let category = if template.category == slide.category {
            CATEGORY_BONUS
        } else {
            0.0
        };

        FitBreakdown {
            template: template.name.clone(),
            title: round3(title),
            message: round3(message),
            body: round3(body),
            visuals: round3(visuals),
            claims: round3(claims),
            category,
            total: round3(title + message + body + visuals + claims + category),
        }
    }

    /// Candidates ordered best first; equal totals keep declaration order.
    pub fn rank<'a>(
        &self,
        slide: &SlideContent,
        candidates: &[&'a TemplateProfile],
    ) -> Vec<(&'a TemplateProfile, FitBreakdown)> {
        let mut scored = candidates
            .iter()
            .map(|template| (*template, self.score(slide, template)))
            .collect::<Vec<(&TemplateProfile, FitBreakdown)>>();
        scored.sort_by(|left, right| right.1.total.total_cmp(&left.1.total));
        scored
    }

    pub fn best<'a>(
        &self,
        slide: &SlideContent,
        catalog: &'a TemplateCatalog,
    ) -> Option<(&'a TemplateProfile, FitBreakdown)> {
        self.rank(slide, &catalog.candidates(&slide.category))
            .into_iter()
            .next()
    }

    /// Per-claim character budget: an even share of the body, clamped to the claim cap.
    ///
    /// `slide_cap` is the slide's own per-claim limit; it can only tighten the configured cap,
    /// and it wins over the floor.
    pub fn claim_budget(
        &self,
        template: &TemplateProfile,
        claim_count: usize,
        capacity: &CapacityConfig,
        slide_cap: Option<usize>,
    ) -> usize {
        let cap = slide_cap.map_or(capacity.claim_max_chars, |limit| {
            limit.min(capacity.claim_max_chars)
        });
        if claim_count == 0 {
            return cap;
        }
        (template.zone_capacities.body / claim_count).clamp(capacity.floor.min(cap), cap)
    }
}

fn zone_term(len: usize, capacity: usize, underfill_weight: f64) -> f64 {
    let capacity = capacity.max(1) as f64;
    let len = len as f64;
    if len > capacity {
        return ZONE_BASE - OVERFLOW_WEIGHT * (len - capacity) / capacity;
    }
    let underfill_limit = capacity * UNDERFILL_RATIO;
    if len < underfill_limit {
        return ZONE_BASE - underfill_weight * (underfill_limit - len) / underfill_limit;
    }
    ZONE_BASE
}

pub(crate) fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}
