use std::path::Path;

use anyhow::{Context, Result};
use deckfit_contracts::templates::{
    CountRange, TemplateCatalog, TemplateProfile, ZoneCapacities,
};
use indexmap::IndexMap;
use serde::Deserialize;

use crate::capacity::{CapacityModel, ZoneGeometry};

const DEFAULT_TEMPLATES_JSON: &str = include_str!("../resources/default_templates.json");

#[derive(Debug, Deserialize)]
struct CatalogFile {
    #[serde(default)]
    aliases: IndexMap<String, String>,
    templates: Vec<TemplateEntry>,
}

#[derive(Debug, Deserialize)]
struct TemplateEntry {
    name: String,
    category: String,
    zones: ZoneSet,
    visual_count: [usize; 2],
    #[serde(default)]
    claim_count: Option<[usize; 2]>,
    #[serde(default)]
    visual_kinds: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ZoneSet {
    title: ZoneGeometry,
    message: ZoneGeometry,
    body: ZoneGeometry,
}

pub fn bundled_catalog(capacity: &CapacityModel) -> Result<TemplateCatalog> {
    parse_catalog(DEFAULT_TEMPLATES_JSON, capacity).context("bundled template catalog is invalid")
}

/// Loads a catalog file that replaces the bundled one.
pub fn load_catalog(path: &Path, capacity: &CapacityModel) -> Result<TemplateCatalog> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed reading template catalog {}", path.display()))?;
    parse_catalog(&raw, capacity)
        .with_context(|| format!("invalid template catalog {}", path.display()))
}

pub fn parse_catalog(raw: &str, capacity: &CapacityModel) -> Result<TemplateCatalog> {
    let file: CatalogFile = serde_json::from_str(raw)?;
    let templates = file
        .templates
        .into_iter()
        .map(|entry| {
            let [min, max] = entry.visual_count;
            let expected_claim_count_range = entry
                .claim_count
                .map(|[low, high]| CountRange {
                    min: low.min(high),
                    max: high.max(low),
                })
                .unwrap_or_else(CountRange::default_claims);
            TemplateProfile {
                zone_capacities: ZoneCapacities {
                    title: capacity.char_budget(&entry.zones.title),
                    message: capacity.char_budget(&entry.zones.message),
                    body: capacity.char_budget(&entry.zones.body),
                },
                expected_visual_count_range: CountRange {
                    min: min.min(max),
                    max: max.max(min),
                },
                expected_claim_count_range,
                visual_kinds: entry
                    .visual_kinds
                    .into_iter()
                    .map(|kind| kind.trim().to_ascii_lowercase())
                    .collect(),
                name: entry.name,
                category: entry.category.trim().to_ascii_lowercase(),
            }
        })
        .collect::<Vec<TemplateProfile>>();
    TemplateCatalog::new(templates, file.aliases)
}

#[cfg(test)]
mod tests {
    use super::{bundled_catalog, load_catalog};
    use crate::capacity::CapacityModel;

    #[test]
    fn bundled_catalog_covers_core_categories() -> anyhow::Result<()> {
        let catalog = bundled_catalog(&CapacityModel::new(12, 0.9))?;
        for category in ["cover", "exec_summary", "analysis", "comparison", "chart", "timeline"] {
            assert!(catalog.categories().contains(&category), "{category}");
        }
        assert_eq!(catalog.resolve_category("chart_focus").as_deref(), Some("chart"));
        assert_eq!(catalog.resolve_category("process_flow").as_deref(), Some("timeline"));
        assert_eq!(catalog.resolve_category("three_column").as_deref(), Some("strategy"));

        let two_column = catalog.get("two_column").map(|row| row.zone_capacities);
        assert_eq!(two_column.map(|zones| zones.title), Some(59));
        assert_eq!(two_column.map(|zones| zones.message), Some(180));
        let full_text = catalog.get("analysis_full_text").map(|row| row.expected_claim_count_range);
        assert_eq!(full_text.map(|range| (range.min, range.max)), Some((3, 9)));
        let last = catalog.candidates("analysis").last().map(|row| row.name.clone());
        assert_eq!(last.as_deref(), Some("content_universal"));
        Ok(())
    }

    #[test]
    fn override_catalog_replaces_bundled() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("templates.json");
        std::fs::write(
            &path,
            r#"{"templates": [{
                "name": "only", "category": "*",
                "zones": {
                    "title": {"width_pt": 500, "height_pt": 40, "font_size_pt": 20},
                    "message": {"width_pt": 500, "height_pt": 40, "font_size_pt": 14},
                    "body": {"width_pt": 500, "height_pt": 200, "font_size_pt": 11}
                },
                "visual_count": [2, 0]
            }]}"#,
        )?;
        let catalog = load_catalog(&path, &CapacityModel::new(12, 0.9))?;
        assert_eq!(catalog.list().count(), 1);
        assert!(catalog.categories().is_empty());
        let range = catalog.get("only").map(|row| row.expected_visual_count_range);
        assert_eq!(range.map(|value| (value.min, value.max)), Some((0, 2)));
        let claims = catalog.get("only").map(|row| row.expected_claim_count_range);
        assert_eq!(claims.map(|value| (value.min, value.max)), Some((0, 9)));
        Ok(())
    }
}
