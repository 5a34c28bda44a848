use std::path::Path;

use anyhow::{bail, Context, Result};
use indexmap::IndexMap;
use regex::Regex;
use serde::Deserialize;

const DEFAULT_RULES_JSON: &str = include_str!("../resources/default_rules.json");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleKind {
    /// Marks a governing message as carrying a decision.
    Decision,
    /// Phrases removed wherever they appear.
    Forbidden,
}

#[derive(Debug, Clone)]
pub struct TextRule {
    pub label: String,
    pub kind: RuleKind,
    pub pattern: Regex,
}

/// Byte span of a rule hit inside the searched text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleHit {
    pub label: String,
    pub start: usize,
    pub end: usize,
}

#[derive(Debug, Deserialize)]
struct RuleFile {
    rules: Vec<RuleEntry>,
    #[serde(default)]
    regeneration_verbs: IndexMap<String, Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct RuleEntry {
    label: String,
    kind: RuleKind,
    pattern: String,
}

/// Tone and phrase heuristics, injected into the fitter and the review loop.
#[derive(Debug, Clone)]
pub struct RuleTable {
    rules: Vec<TextRule>,
    regeneration_verbs: IndexMap<String, Vec<String>>,
}

impl RuleTable {
    pub fn bundled() -> Result<Self> {
        Self::parse(DEFAULT_RULES_JSON).context("bundled rule table is invalid")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed reading rule table {}", path.display()))?;
        Self::parse(&raw).with_context(|| format!("invalid rule table {}", path.display()))
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let file: RuleFile = serde_json::from_str(raw)?;
        let mut rules = Vec::with_capacity(file.rules.len());
        for entry in file.rules {
            let pattern = Regex::new(&entry.pattern)
                .with_context(|| format!("rule '{}' has an invalid pattern", entry.label))?;
            rules.push(TextRule {
                label: entry.label,
                kind: entry.kind,
                pattern,
            });
        }
        Self::new(rules, file.regeneration_verbs)
    }

    pub fn new(
        rules: Vec<TextRule>,
        regeneration_verbs: IndexMap<String, Vec<String>>,
    ) -> Result<Self> {
        let table = Self {
            rules,
            regeneration_verbs,
        };
        if !table.rules.iter().any(|rule| rule.kind == RuleKind::Decision) {
            bail!("rule table needs at least one decision rule");
        }
        if table.fallback_verbs().is_empty() {
            bail!("rule table needs regeneration verbs for category '*'");
        }
        for (category, verbs) in &table.regeneration_verbs {
            for verb in verbs {
                if !table.has_decision_term(verb) {
                    bail!("regeneration verb '{verb}' for '{category}' matches no decision rule");
                }
            }
        }
        Ok(table)
    }

    /// Copy of the table with one literal forbidden rule per word, labelled `word:<word>`.
    ///
    /// Matching ignores case. Word boundaries apply only at ends that are ASCII alphanumeric,
    /// so words in scripts that attach particles still match inside a token.
    pub fn with_forbidden_words(&self, words: &[String]) -> Result<Self> {
        let mut table = self.clone();
        for word in words {
            let word = word.trim();
            if word.is_empty() {
                continue;
            }
            let lead = if word.starts_with(|ch: char| ch.is_ascii_alphanumeric()) {
                r"\b"
            } else {
                ""
            };
            let tail = if word.ends_with(|ch: char| ch.is_ascii_alphanumeric()) {
                r"\b"
            } else {
                ""
            };
            let pattern = Regex::new(&format!("(?i){lead}{}{tail}", regex::escape(word)))
                .with_context(|| format!("forbidden word '{word}' is not a valid pattern"))?;
            table.rules.push(TextRule {
                label: format!("word:{word}"),
                kind: RuleKind::Forbidden,
                pattern,
            });
        }
        Ok(table)
    }

    fn of_kind(&self, kind: RuleKind) -> impl Iterator<Item = &TextRule> {
        self.rules.iter().filter(move |rule| rule.kind == kind)
    }

    pub fn has_decision_term(&self, text: &str) -> bool {
        self.of_kind(RuleKind::Decision)
            .any(|rule| rule.pattern.is_match(text))
    }

    /// All decision hits ordered by position.
    pub fn decision_hits(&self, text: &str) -> Vec<RuleHit> {
        let mut hits = self
            .of_kind(RuleKind::Decision)
            .flat_map(|rule| {
                rule.pattern.find_iter(text).map(|found| RuleHit {
                    label: rule.label.clone(),
                    start: found.start(),
                    end: found.end(),
                })
            })
            .collect::<Vec<RuleHit>>();
        hits.sort_by_key(|hit| (hit.start, hit.end));
        hits
    }

    pub fn first_decision_term(&self, text: &str) -> Option<RuleHit> {
        self.decision_hits(text).into_iter().next()
    }

    /// Labels of forbidden rules matching `text`, in rule order.
    pub fn forbidden_matches(&self, text: &str) -> Vec<String> {
        self.of_kind(RuleKind::Forbidden)
            .filter(|rule| rule.pattern.is_match(text))
            .map(|rule| rule.label.clone())
            .collect()
    }

    /// Removes forbidden phrases and tidies the whitespace and punctuation left behind.
    pub fn strip_forbidden(&self, text: &str) -> String {
        let mut out = text.to_string();
        for rule in self.of_kind(RuleKind::Forbidden) {
            out = rule.pattern.replace_all(&out, "").into_owned();
        }
        let tidy = tidy_spacing(&out);
        if text.trim_start().starts_with(char::is_uppercase) {
            capitalize_first(&tidy)
        } else {
            tidy
        }
    }

    pub fn regeneration_verb(&self, category: &str, attempt: usize) -> &str {
        let verbs = self
            .regeneration_verbs
            .get(category)
            .filter(|verbs| !verbs.is_empty())
            .map(Vec::as_slice)
            .unwrap_or_else(|| self.fallback_verbs());
        verbs
            .get(attempt % verbs.len().max(1))
            .map(String::as_str)
            .unwrap_or("Prioritize")
    }

    fn fallback_verbs(&self) -> &[String] {
        self.regeneration_verbs
            .get("*")
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

pub(crate) fn tidy_spacing(text: &str) -> String {
    let collapsed = text
        .replace("()", "")
        .split_whitespace()
        .collect::<Vec<&str>>()
        .join(" ");
    let mut out = String::with_capacity(collapsed.len());
    for ch in collapsed.chars() {
        if matches!(ch, ',' | ';' | ':' | '.' | '!' | '?' | ')') && out.ends_with(' ') {
            out.pop();
        }
        // A separator left dangling before a terminator or a closing parenthesis.
        if matches!(ch, '.' | '!' | '?' | ')') && out.ends_with([',', ';']) {
            out.pop();
        }
        if matches!(ch, ',' | ';') && (out.is_empty() || out.ends_with([',', ';', '('])) {
            continue;
        }
        out.push(ch);
    }
    out.trim_start_matches([',', ';', ' '])
        .trim()
        .to_string()
}

pub(crate) fn capitalize_first(text: &str) -> String {
    let mut chars = text.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use indexmap::IndexMap;

    use super::RuleTable;

    #[test]
    fn bundled_table_detects_decision_terms() -> anyhow::Result<()> {
        let rules = RuleTable::bundled()?;
        assert!(rules.has_decision_term("Prioritize the enterprise segment."));
        assert!(rules.has_decision_term("We must cut onboarding time."));
        assert!(rules.has_decision_term("물류 거점을 재정렬하고 운영 효율을 점검합니다"));
        assert!(!rules.has_decision_term("Revenue grew 12% in Q3."));

        let hit = rules.first_decision_term("Costs rose, so reallocate budget and strengthen sales");
        assert_eq!(hit.map(|row| row.label), Some("commit".to_string()));
        Ok(())
    }

    #[test]
    fn forbidden_phrases_are_stripped_cleanly() -> anyhow::Result<()> {
        let rules = RuleTable::bundled()?;
        let text = "Perhaps we should expand to APAC, maybe by Q3 (TBD).";
        assert_eq!(rules.forbidden_matches(text), vec!["hedging", "placeholder"]);
        assert_eq!(
            rules.strip_forbidden(text),
            "We should expand to APAC, by Q3."
        );
        assert!(rules.forbidden_matches("Expand to APAC by Q3.").is_empty());
        Ok(())
    }

    #[test]
    fn stripping_drops_separators_left_before_terminators() -> anyhow::Result<()> {
        let rules = RuleTable::bundled()?;
        assert_eq!(
            rules.strip_forbidden("Maybe we should prioritize APAC, TBD."),
            "We should prioritize APAC."
        );
        assert_eq!(
            rules.strip_forbidden("Expand to APAC (by Q3; TBD)!"),
            "Expand to APAC (by Q3)!"
        );
        Ok(())
    }

    #[test]
    fn deck_words_join_the_forbidden_rules() -> anyhow::Result<()> {
        let rules = RuleTable::bundled()?
            .with_forbidden_words(&["synergy".to_string(), "혁신".to_string()])?;
        let text = "Prioritize Synergy across 혁신적 teams.";
        assert_eq!(rules.forbidden_matches(text), vec!["word:synergy", "word:혁신"]);
        assert_eq!(rules.strip_forbidden(text), "Prioritize across 적 teams.");
        assert!(rules.forbidden_matches("Synergyless plan.").is_empty());
        assert!(RuleTable::bundled()?.forbidden_matches(text).is_empty());
        Ok(())
    }

    #[test]
    fn regeneration_verbs_rotate_and_fall_back() -> anyhow::Result<()> {
        let rules = RuleTable::bundled()?;
        assert_eq!(rules.regeneration_verb("timeline", 0), "Accelerate");
        assert_eq!(rules.regeneration_verb("timeline", 1), "Secure");
        assert_eq!(rules.regeneration_verb("timeline", 2), "Accelerate");
        assert_eq!(rules.regeneration_verb("unknown", 1), "Strengthen");
        assert_eq!(rules.regeneration_verb("unknown", 0), rules.regeneration_verb("*", 0));
        Ok(())
    }

    #[test]
    fn verbs_must_match_a_decision_rule() {
        let raw = r#"{
            "rules": [{"label": "priority", "kind": "decision", "pattern": "(?i)prioriti[sz]e"}],
            "regeneration_verbs": {"*": ["Ponder"]}
        }"#;
        assert!(RuleTable::parse(raw).is_err());
        assert!(RuleTable::new(Vec::new(), IndexMap::new()).is_err());
    }
}
