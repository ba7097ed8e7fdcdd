//! Extractor for pages that group rates under a section heading.
//!
//! The central bank page lists each currency in its own block: a section
//! marker (e.g. `dolar`), a currency label (`USD`) and then the rate.
//! Markup around those pieces changes often, so the search falls back
//! through three progressively looser strategies:
//!
//! 1. section marker → label within `section_window` → first number within
//!    `label_window` after the label;
//! 2. the label alone anywhere in the page, checked against the label range;
//! 3. any in-range number inside `<script>` or `<code>` blocks.

use regex::Regex;
use rust_decimal::Decimal;
use std::sync::OnceLock;
use tracing::debug;

use super::{first_simple_in_range, leading_simple_in_range, marker_ends, marker_regex, window, Extractor};
use crate::types::ValidRange;

pub const DEFAULT_SECTION_WINDOW: usize = 2000;
pub const DEFAULT_LABEL_WINDOW: usize = 400;

fn embedded_blocks() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?is)<script[^>]*>(.*?)</script>|<code[^>]*>(.*?)</code>").expect("static regex")
    })
}

pub struct SectionLabelExtractor {
    name: String,
    section: Regex,
    label: Regex,
    section_window: usize,
    label_window: usize,
    /// Extra bound for the label-only strategy.
    label_range: Option<ValidRange>,
}

impl SectionLabelExtractor {
    pub fn new(name: impl Into<String>, section: &str, label: &str) -> Self {
        Self {
            name: name.into(),
            section: marker_regex(section),
            label: marker_regex(label),
            section_window: DEFAULT_SECTION_WINDOW,
            label_window: DEFAULT_LABEL_WINDOW,
            label_range: None,
        }
    }

    pub fn with_windows(mut self, section_window: usize, label_window: usize) -> Self {
        self.section_window = section_window;
        self.label_window = label_window;
        self
    }

    pub fn with_label_range(mut self, range: ValidRange) -> Self {
        self.label_range = Some(range);
        self
    }

    /// Strategy 1: label inside the section, number right after the label.
    ///
    /// Only the label has to fall inside the section window; the number
    /// window is taken from the full text.
    fn within_section(&self, text: &str, range: &ValidRange) -> Option<Decimal> {
        marker_ends(&self.section, text).find_map(|section_end| {
            let section = window(text, section_end, self.section_window);
            marker_ends(&self.label, section).find_map(|label_end| {
                let after_label = window(text, section_end + label_end, self.label_window);
                leading_simple_in_range(after_label, range)
            })
        })
    }

    /// Strategy 2: the label anywhere, under the (possibly narrower) label range.
    fn label_only(&self, text: &str, range: &ValidRange) -> Option<Decimal> {
        let range = match &self.label_range {
            Some(label_range) => range.intersect(label_range)?,
            None => *range,
        };
        marker_ends(&self.label, text).find_map(|label_end| {
            leading_simple_in_range(window(text, label_end, self.label_window), &range)
        })
    }

    /// Strategy 3: numbers embedded in inline scripts or code blocks.
    fn embedded(&self, text: &str, range: &ValidRange) -> Option<Decimal> {
        embedded_blocks().captures_iter(text).find_map(|c| {
            let block = c.get(1).or_else(|| c.get(2))?.as_str();
            first_simple_in_range(block, range)
        })
    }
}

impl Extractor for SectionLabelExtractor {
    fn name(&self) -> &str {
        &self.name
    }

    fn extract(&self, text: &str, range: &ValidRange) -> Option<Decimal> {
        if let Some(v) = self.within_section(text, range) {
            debug!(extractor = %self.name, value = %v, "Matched within section");
            return Some(v);
        }
        if let Some(v) = self.label_only(text, range) {
            debug!(extractor = %self.name, value = %v, "Matched on label alone");
            return Some(v);
        }
        if let Some(v) = self.embedded(text, range) {
            debug!(extractor = %self.name, value = %v, "Matched in embedded block");
            return Some(v);
        }
        debug!(extractor = %self.name, "No candidate found");
        None
    }
}
