use deckfit_contracts::deck::SlideContent;
use deckfit_contracts::decisions::TextAdjustments;
use deckfit_contracts::templates::TemplateProfile;

use crate::rules::{capitalize_first, tidy_spacing, RuleTable};

pub const ELLIPSIS: char = '…';

/// Shortest lead kept in front of a qualifier clause before the clause itself is shortened.
const MIN_LEAD_CHARS: usize = 12;
const MIN_QUALIFIER_BODY: usize = 4;

const SENTENCE_ENDS: [char; 4] = ['.', '!', '?', '。'];
const CLAUSE_ENDS: [char; 3] = [',', ';', ':'];
const TRAILING_SEPARATORS: [char; 7] = [',', ';', ':', '-', '–', '—', '('];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FitOutcome {
    pub text: String,
    pub truncated: bool,
    /// A preservation rule could not be honoured; `text` is best effort.
    pub constraint_violated: bool,
}

impl FitOutcome {
    pub(crate) fn unchanged(text: &str) -> Self {
        Self {
            text: text.to_string(),
            truncated: false,
            constraint_violated: false,
        }
    }

    fn cut(text: String, constraint_violated: bool) -> Self {
        Self {
            text,
            truncated: true,
            constraint_violated,
        }
    }
}

pub fn char_len(text: &str) -> usize {
    text.chars().count()
}

/// Shrinks `text` to at most `budget` characters.
///
/// Cuts land on the latest sentence or clause boundary in the upper half of the budget, else on
/// a word boundary, else on a hard cut backed off out of numbers and open parentheses.
pub fn fit_to_capacity(text: &str, budget: usize) -> FitOutcome {
    let chars: Vec<char> = text.chars().collect();
    if chars.len() <= budget {
        return FitOutcome::unchanged(text);
    }
    if budget == 0 {
        return FitOutcome::cut(String::new(), true);
    }

    let floor = (budget / 2).max(1);
    let sentence = (floor..=budget)
        .rev()
        .find(|&end| is_sentence_cut(&chars, end));
    let clause = (floor..=budget)
        .rev()
        .find(|&end| is_clause_cut(&chars, end));
    match (sentence, clause) {
        (Some(sentence_end), Some(clause_end)) if clause_end > sentence_end => {
            return FitOutcome::cut(with_ellipsis(&chars[..clause_end - 1]), false);
        }
        (Some(sentence_end), _) => {
            let kept = chars[..sentence_end].iter().collect::<String>();
            return FitOutcome::cut(kept.trim_end().to_string(), false);
        }
        (None, Some(clause_end)) => {
            return FitOutcome::cut(with_ellipsis(&chars[..clause_end - 1]), false);
        }
        (None, None) => {}
    }

    let word = (1..budget).rev().find(|&end| {
        chars[end].is_whitespace()
            && balanced(&chars[..end])
            && chars[..end].iter().any(|ch| !ch.is_whitespace())
    });
    if let Some(end) = word {
        return FitOutcome::cut(with_ellipsis(&chars[..end]), false);
    }

    let mut end = budget - 1;
    while end > 0 && (splits_number(&chars, end) || !balanced(&chars[..end])) {
        end -= 1;
    }
    if end == 0 {
        return FitOutcome::cut(ELLIPSIS.to_string(), true);
    }
    FitOutcome::cut(with_ellipsis(&chars[..end]), false)
}

fn is_sentence_cut(chars: &[char], end: usize) -> bool {
    end > 0
        && SENTENCE_ENDS.contains(&chars[end - 1])
        && chars.get(end).map_or(true, |ch| ch.is_whitespace())
        && !splits_number(chars, end)
        && balanced(&chars[..end])
}

fn is_clause_cut(chars: &[char], end: usize) -> bool {
    end > 1
        && CLAUSE_ENDS.contains(&chars[end - 1])
        && chars.get(end).is_some_and(|ch| ch.is_whitespace())
        && balanced(&chars[..end - 1])
}

fn with_ellipsis(kept: &[char]) -> String {
    let text = kept.iter().collect::<String>();
    let mut out = text
        .trim_end()
        .trim_end_matches(TRAILING_SEPARATORS)
        .trim_end()
        .to_string();
    out.push(ELLIPSIS);
    out
}

fn balanced(chars: &[char]) -> bool {
    let mut depth = 0i32;
    for ch in chars {
        match ch {
            '(' => depth += 1,
            ')' => depth -= 1,
            _ => {}
        }
    }
    depth <= 0
}

/// Whether a cut between `end - 1` and `end` falls inside a numeric literal.
fn splits_number(chars: &[char], end: usize) -> bool {
    end > 0 && end < chars.len() && in_number(chars, end - 1) && in_number(chars, end)
}

fn in_number(chars: &[char], idx: usize) -> bool {
    let ch = chars[idx];
    if ch.is_ascii_digit() {
        return true;
    }
    matches!(ch, '.' | ',')
        && idx > 0
        && idx + 1 < chars.len()
        && chars[idx - 1].is_ascii_digit()
        && chars[idx + 1].is_ascii_digit()
}

/// A claim split into the text before its qualifier clause and the clause body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Qualifier {
    pub lead: String,
    pub body: String,
    pub well_formed: bool,
}

fn find_marker(text: &str, marker: &str) -> Option<usize> {
    // ASCII lowercasing keeps byte offsets aligned with `text`.
    text.to_ascii_lowercase()
        .find(&marker.trim().to_ascii_lowercase())
}

fn matching_close(after_marker: &str) -> Option<usize> {
    let mut depth = 1i32;
    for (idx, ch) in after_marker.char_indices() {
        match ch {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth == 0 {
                    return Some(idx);
                }
            }
            _ => {}
        }
    }
    None
}

/// Splits `text` at its qualifier clauses; `None` when the marker does not occur.
///
/// Several clauses are merged into one body, an unterminated clause runs to the end of the text,
/// and text after the clause is folded back into the lead.
pub fn parse_qualifier(text: &str, marker: &str) -> Option<Qualifier> {
    let marker = marker.trim();
    let mut lead_parts: Vec<&str> = Vec::new();
    let mut bodies: Vec<&str> = Vec::new();
    let mut rest = text;
    let mut all_closed = true;

    while let Some(start) = find_marker(rest, marker) {
        lead_parts.push(&rest[..start]);
        let after = &rest[start + marker.len()..];
        match matching_close(after) {
            Some(idx) => {
                bodies.push(&after[..idx]);
                rest = &after[idx + 1..];
            }
            None => {
                bodies.push(after);
                rest = "";
                all_closed = false;
            }
        }
    }
    if bodies.is_empty() {
        return None;
    }

    let trailing = rest.trim();
    let nested = bodies.iter().any(|body| find_marker(body, marker).is_some());
    let separated = lead_parts
        .first()
        .map_or(true, |lead| lead.is_empty() || lead.ends_with(' '));
    let well_formed = bodies.len() == 1
        && all_closed
        && trailing.is_empty()
        && !nested
        && separated
        && !bodies[0].trim().is_empty();

    let mut lead = lead_parts
        .iter()
        .map(|part| part.trim())
        .filter(|part| !part.is_empty())
        .collect::<Vec<&str>>()
        .join(" ");
    if !trailing.is_empty() {
        if lead.is_empty() {
            lead = trailing.to_string();
        } else if trailing.starts_with(['.', ',', ';', ':', '!', '?']) {
            lead.push_str(trailing);
        } else {
            lead.push(' ');
            lead.push_str(trailing);
        }
    }

    Some(Qualifier {
        lead,
        body: normalize_body(&bodies.join("; "), marker),
        well_formed,
    })
}

fn normalize_body(raw: &str, marker: &str) -> String {
    let mut flattened = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(start) = find_marker(rest, marker) {
        flattened.push_str(&rest[..start]);
        flattened.push_str("; ");
        rest = &rest[start + marker.len()..];
    }
    flattened.push_str(rest);

    let mut depth = 0usize;
    let mut balanced_body = String::with_capacity(flattened.len());
    for ch in flattened.chars() {
        match ch {
            '(' => depth += 1,
            ')' if depth == 0 => continue,
            ')' => depth -= 1,
            _ => {}
        }
        balanced_body.push(ch);
    }
    balanced_body.extend(std::iter::repeat(')').take(depth));

    tidy_spacing(&balanced_body)
        .trim_end_matches([';', ',', ' '])
        .to_string()
}

/// True when `text` has no qualifier or exactly one well-bracketed, non-empty clause that ends
/// the text and is separated from the lead by a space.
pub fn qualifier_well_formed(text: &str, marker: &str) -> bool {
    parse_qualifier(text, marker).map_or(true, |parsed| parsed.well_formed)
}

pub fn strip_qualifier(text: &str, marker: &str) -> String {
    match parse_qualifier(text, marker) {
        Some(parsed) => parsed.lead,
        None => text.trim().to_string(),
    }
}

fn qualifier_clause(marker: &str, body: &str) -> String {
    format!("{} {body})", marker.trim())
}

fn join_lead(lead: &str, clause: &str) -> String {
    if lead.is_empty() {
        clause.to_string()
    } else {
        format!("{lead} {clause}")
    }
}

/// Text fitting with the configured qualifier marker.
#[derive(Debug, Clone)]
pub struct TextFitEngine {
    qualifier_marker: String,
}

impl TextFitEngine {
    pub fn new(qualifier_marker: impl Into<String>) -> Self {
        Self {
            qualifier_marker: qualifier_marker.into().trim().to_string(),
        }
    }

    pub fn qualifier_marker(&self) -> &str {
        &self.qualifier_marker
    }

    /// Fits a claim, shortening the lead first and the qualifier body only when the lead alone
    /// cannot make room. Malformed qualifiers come back normalized.
    pub fn fit_claim_preserving_qualifier(&self, text: &str, budget: usize) -> FitOutcome {
        let marker = self.qualifier_marker.as_str();
        let Some(parsed) = parse_qualifier(text, marker) else {
            return fit_to_capacity(text, budget);
        };

        if parsed.body.is_empty() {
            let fitted = fit_to_capacity(&parsed.lead, budget);
            let truncated = fitted.truncated || fitted.text != text;
            return FitOutcome {
                truncated,
                ..fitted
            };
        }

        let clause = qualifier_clause(marker, &parsed.body);
        let normalized = join_lead(&parsed.lead, &clause);
        if char_len(&normalized) <= budget {
            return FitOutcome {
                truncated: false,
                constraint_violated: false,
                text: normalized,
            };
        }

        let lead_len = char_len(&parsed.lead);
        let clause_len = char_len(&clause);
        if lead_len > 0 && budget > clause_len + 1 {
            let available = budget - clause_len - 1;
            if available >= MIN_LEAD_CHARS.min(lead_len) {
                let lead = fit_to_capacity(&parsed.lead, available);
                if !lead.text.is_empty() && lead.text != ELLIPSIS.to_string() {
                    return FitOutcome::cut(
                        join_lead(&lead.text, &clause),
                        lead.constraint_violated,
                    );
                }
            }
        }

        let lead = fit_to_capacity(&parsed.lead, MIN_LEAD_CHARS.min(budget));
        let overhead = char_len(marker) + 2 + usize::from(!lead.text.is_empty());
        let used = char_len(&lead.text) + overhead;
        if budget >= used + MIN_QUALIFIER_BODY {
            let body = fit_to_capacity(&parsed.body, budget - used);
            if body.text.chars().any(char::is_alphanumeric) {
                return FitOutcome::cut(
                    join_lead(&lead.text, &qualifier_clause(marker, &body.text)),
                    lead.constraint_violated || body.constraint_violated,
                );
            }
        }

        let fallback = if parsed.lead.is_empty() {
            &parsed.body
        } else {
            &parsed.lead
        };
        FitOutcome::cut(fit_to_capacity(fallback, budget).text, true)
    }

    /// Fits a governing message so that a decision term present in the source survives.
    ///
    /// When the plain tail cut loses every decision term, middle clauses are dropped first, then
    /// the head clause, then the words in front of the term.
    pub fn fit_message_preserving_decision_verb(
        &self,
        text: &str,
        budget: usize,
        rules: &RuleTable,
    ) -> FitOutcome {
        if char_len(text) <= budget {
            return FitOutcome::unchanged(text);
        }
        let naive = fit_to_capacity(text, budget);
        let Some(hit) = rules.first_decision_term(text) else {
            return naive;
        };
        if rules.has_decision_term(&naive.text) {
            return naive;
        }

        let accept = |candidate: &str| {
            let fitted = fit_to_capacity(candidate, budget);
            rules
                .has_decision_term(&fitted.text)
                .then(|| FitOutcome::cut(fitted.text, fitted.constraint_violated))
        };

        let spans = clause_spans(text);
        let decision_clause = spans
            .iter()
            .position(|(start, end)| hit.start >= *start && hit.start < *end);
        if let Some(k) = decision_clause.filter(|k| *k > 0) {
            let (head_start, head_end) = spans[0];
            let separator = &text[head_end..spans[1].0];
            let tail = &text[spans[k].0..];
            let head_and_tail = format!("{}{separator}{tail}", &text[head_start..head_end]);
            if k > 1 {
                if let Some(outcome) = accept(&head_and_tail) {
                    return outcome;
                }
            }
            if let Some(outcome) = accept(&capitalize_first(tail)) {
                return outcome;
            }
        }
        if let Some(outcome) = accept(&capitalize_first(&text[hit.start..])) {
            return outcome;
        }
        FitOutcome::cut(naive.text, true)
    }

    /// Fits every text zone of `slide` to `template`. Claims are touched only when over budget.
    pub fn fit_slide(
        &self,
        slide: &SlideContent,
        template: &TemplateProfile,
        claim_budget: usize,
        rules: &RuleTable,
    ) -> SlideFit {
        let capacities = template.zone_capacities;
        let mut content = slide.clone();
        let mut violations = Vec::new();

        let title = fit_to_capacity(&slide.title, capacities.title);
        if title.constraint_violated {
            violations.push("title".to_string());
        }
        content.title = title.text;

        let message = self.fit_message_preserving_decision_verb(
            &slide.governing_message,
            capacities.message,
            rules,
        );
        if message.constraint_violated {
            violations.push("governing_message".to_string());
        }
        content.governing_message = message.text;

        for (idx, claim) in content.claims.iter_mut().enumerate() {
            if char_len(&claim.text) <= claim_budget {
                continue;
            }
            let fitted = self.fit_claim_preserving_qualifier(&claim.text, claim_budget);
            if fitted.constraint_violated {
                violations.push(format!("claims[{idx}]"));
            }
            claim.text = fitted.text;
        }
        if body_overflows(&content, template) {
            violations.push("body".to_string());
        }

        SlideFit {
            content,
            violations,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SlideFit {
    pub content: SlideContent,
    /// Field paths that could not be fitted without breaking a preservation rule.
    pub violations: Vec<String>,
}

/// True when the claims together exceed the body zone even though each fits its own budget.
pub fn body_overflows(content: &SlideContent, template: &TemplateProfile) -> bool {
    content
        .claims
        .iter()
        .map(|claim| char_len(&claim.text))
        .sum::<usize>()
        > template.zone_capacities.body
}

pub fn text_adjustments(source: &SlideContent, current: &SlideContent) -> TextAdjustments {
    TextAdjustments {
        title: source.title != current.title,
        governing_message: source.governing_message != current.governing_message,
        claims: source
            .claims
            .iter()
            .zip(current.claims.iter())
            .filter(|(before, after)| before.text != after.text)
            .count(),
    }
}

/// Byte spans of the clauses of `text`, split on `, `, `; ` and spaced dashes.
fn clause_spans(text: &str) -> Vec<(usize, usize)> {
    let chars: Vec<(usize, char)> = text.char_indices().collect();
    let mut spans = Vec::new();
    let mut start = 0usize;
    let mut idx = 0usize;
    let push_span = |spans: &mut Vec<(usize, usize)>, start: usize, end: usize| {
        let trimmed_end = start + text[start..end].trim_end().len();
        if trimmed_end > start {
            spans.push((start, trimmed_end));
        }
    };
    while idx < chars.len() {
        let (pos, ch) = chars[idx];
        let next_space = chars
            .get(idx + 1)
            .is_some_and(|(_, next)| next.is_whitespace());
        let prev_space = idx > 0 && chars[idx - 1].1.is_whitespace();
        let delimiter = (matches!(ch, ',' | ';') && next_space)
            || (matches!(ch, '-' | '–' | '—') && prev_space && next_space);
        if !delimiter {
            idx += 1;
            continue;
        }
        push_span(&mut spans, start, pos);
        let mut next = idx + 1;
        while next < chars.len() && chars[next].1.is_whitespace() {
            next += 1;
        }
        start = chars.get(next).map_or(text.len(), |(offset, _)| *offset);
        idx = next;
    }
    push_span(&mut spans, start, text.len());
    spans
}
