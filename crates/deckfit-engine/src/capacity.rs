use serde::{Deserialize, Serialize};

/// Average glyph advance relative to the font size.
pub const CHAR_WIDTH_EM: f64 = 0.55;
pub const LINE_HEIGHT_EM: f64 = 1.2;
pub const DEFAULT_CHARS_PER_LINE: usize = 38;
pub const MAX_LINES_PER_CLAIM: usize = 4;

/// Box of a template zone in points.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ZoneGeometry {
    pub width_pt: f64,
    pub height_pt: f64,
    pub font_size_pt: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CapacityModel {
    pub floor: usize,
    pub fill_ratio: f64,
}

impl CapacityModel {
    pub fn new(floor: usize, fill_ratio: f64) -> Self {
        Self { floor, fill_ratio }
    }

    /// Characters the zone holds at its font size, never below the floor.
    ///
    /// Non-decreasing in width and height, non-increasing in font size.
    pub fn char_budget(&self, zone: &ZoneGeometry) -> usize {
        let ZoneGeometry {
            width_pt,
            height_pt,
            font_size_pt,
        } = *zone;
        let usable = [width_pt, height_pt, font_size_pt, self.fill_ratio]
            .iter()
            .all(|value| value.is_finite() && *value > 0.0);
        if !usable {
            return self.floor;
        }
        let chars_per_line = floor_tolerant(width_pt / (font_size_pt * CHAR_WIDTH_EM));
        let lines = floor_tolerant(height_pt / (font_size_pt * LINE_HEIGHT_EM)).max(1.0);
        let raw = floor_tolerant(chars_per_line * lines * self.fill_ratio.min(1.0));
        (raw as usize).max(self.floor)
    }
}

/// Floor that absorbs float noise such as `880 / (16 * 0.55) = 99.999…`.
fn floor_tolerant(value: f64) -> f64 {
    (value + 1e-9).floor()
}

/// Wrapped line count of `text` at `chars_per_line`, wrapping on whitespace.
pub fn estimate_lines(text: &str, chars_per_line: usize) -> usize {
    let width = chars_per_line.max(1);
    let mut lines = 0usize;
    let mut current = 0usize;
    for word in text.split_whitespace() {
        let len = word.chars().count();
        if current == 0 {
            lines += 1;
            current = len;
        } else if current + 1 + len <= width {
            current += 1 + len;
        } else {
            lines += 1;
            current = len;
        }
        while current > width {
            lines += 1;
            current -= width;
        }
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::{estimate_lines, CapacityModel, ZoneGeometry};

    fn zone(width_pt: f64, height_pt: f64, font_size_pt: f64) -> ZoneGeometry {
        ZoneGeometry {
            width_pt,
            height_pt,
            font_size_pt,
        }
    }

    #[test]
    fn budget_is_monotonic_in_geometry_and_font() {
        let model = CapacityModel::new(12, 0.9);
        let base = model.char_budget(&zone(400.0, 200.0, 12.0));
        assert!(model.char_budget(&zone(480.0, 200.0, 12.0)) >= base);
        assert!(model.char_budget(&zone(400.0, 260.0, 12.0)) >= base);
        assert!(model.char_budget(&zone(400.0, 200.0, 16.0)) <= base);

        let mut previous = usize::MAX;
        for font in [8.0, 10.0, 12.0, 16.0, 24.0, 40.0] {
            let budget = model.char_budget(&zone(300.0, 120.0, font));
            assert!(budget <= previous);
            previous = budget;
        }
    }

    #[test]
    fn budget_never_drops_below_floor() {
        let model = CapacityModel::new(12, 0.9);
        assert_eq!(model.char_budget(&zone(10.0, 5.0, 40.0)), 12);
        assert_eq!(model.char_budget(&zone(f64::NAN, 100.0, 12.0)), 12);
        assert_eq!(model.char_budget(&zone(400.0, 100.0, 0.0)), 12);
    }

    #[test]
    fn title_zone_budget_matches_hand_calculation() {
        let model = CapacityModel::new(12, 0.9);
        // 880 / 13.2 = 66 chars per line, 40 / 28.8 = 1 line, 66 * 0.9 = 59.4
        assert_eq!(model.char_budget(&zone(880.0, 40.0, 24.0)), 59);
    }

    #[test]
    fn line_estimate_wraps_on_words() {
        assert_eq!(estimate_lines("", 38), 0);
        assert_eq!(estimate_lines("short claim", 38), 1);
        let long = "word ".repeat(40);
        assert_eq!(estimate_lines(&long, 38), 6);
    }
}
