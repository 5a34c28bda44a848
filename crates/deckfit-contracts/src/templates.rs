use anyhow::bail;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Category of templates that any slide may use.
pub const UNIVERSAL_CATEGORY: &str = "*";

/// Claim count a template accepts when its profile does not say.
pub const DEFAULT_MAX_CLAIMS: usize = 9;

/// Character budget per content zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZoneCapacities {
    pub title: usize,
    pub message: usize,
    pub body: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountRange {
    pub min: usize,
    pub max: usize,
}

impl CountRange {
    pub fn default_claims() -> Self {
        Self {
            min: 0,
            max: DEFAULT_MAX_CLAIMS,
        }
    }

    pub fn contains(&self, count: usize) -> bool {
        count >= self.min && count <= self.max
    }

    /// How far the count is outside the range; zero when inside.
    pub fn distance(&self, count: usize) -> usize {
        if count < self.min {
            self.min - count
        } else {
            count.saturating_sub(self.max)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateProfile {
    pub name: String,
    pub category: String,
    pub zone_capacities: ZoneCapacities,
    pub expected_visual_count_range: CountRange,
    #[serde(default = "CountRange::default_claims")]
    pub expected_claim_count_range: CountRange,
    #[serde(default)]
    pub visual_kinds: Vec<String>,
}

impl TemplateProfile {
    pub fn is_universal(&self) -> bool {
        self.category == UNIVERSAL_CATEGORY
    }

    pub fn supports_visual(&self, kind: &str) -> bool {
        self.visual_kinds
            .iter()
            .any(|item| item.eq_ignore_ascii_case(kind.trim()))
    }
}

/// Read-only set of templates, kept in declaration order.
#[derive(Debug, Clone)]
pub struct TemplateCatalog {
    templates: IndexMap<String, TemplateProfile>,
    aliases: IndexMap<String, String>,
}

impl TemplateCatalog {
    pub fn new(
        templates: Vec<TemplateProfile>,
        aliases: IndexMap<String, String>,
    ) -> anyhow::Result<Self> {
        let mut map = IndexMap::new();
        for template in templates {
            if template.name.trim().is_empty() {
                bail!("template with empty name in catalog");
            }
            if map.contains_key(&template.name) {
                bail!("duplicate template '{}' in catalog", template.name);
            }
            map.insert(template.name.clone(), template);
        }
        if !map.values().any(TemplateProfile::is_universal) {
            bail!("catalog needs a universal template (category '{UNIVERSAL_CATEGORY}')");
        }

        let mut normalized_aliases = IndexMap::new();
        for (alias, target) in aliases {
            let target = normalize_key(&target);
            if !map.values().any(|template| template.category == target) {
                bail!("alias '{alias}' points at unknown category '{target}'");
            }
            normalized_aliases.insert(normalize_key(&alias), target);
        }

        Ok(Self {
            templates: map,
            aliases: normalized_aliases,
        })
    }

    pub fn get(&self, name: &str) -> Option<&TemplateProfile> {
        self.templates.get(name)
    }

    pub fn list(&self) -> impl Iterator<Item = &TemplateProfile> {
        self.templates.values()
    }

    /// Distinct non-universal categories in declaration order.
    pub fn categories(&self) -> Vec<&str> {
        let mut out: Vec<&str> = Vec::new();
        for template in self.templates.values() {
            if template.is_universal() || out.contains(&template.category.as_str()) {
                continue;
            }
            out.push(template.category.as_str());
        }
        out
    }

    pub fn resolve_category(&self, raw: &str) -> Option<String> {
        let key = normalize_key(raw);
        if key.is_empty() || key == UNIVERSAL_CATEGORY {
            return None;
        }
        if self.categories().contains(&key.as_str()) {
            return Some(key);
        }
        self.aliases.get(&key).cloned()
    }

    /// Templates registered for `category` followed by the universal fallbacks.
    pub fn candidates(&self, category: &str) -> Vec<&TemplateProfile> {
        let key = normalize_key(category);
        let mut out = self
            .templates
            .values()
            .filter(|template| template.category == key)
            .collect::<Vec<&TemplateProfile>>();
        out.extend(self.templates.values().filter(|template| template.is_universal()));
        out
    }
}

fn normalize_key(raw: &str) -> String {
    raw.trim().to_ascii_lowercase()
}
