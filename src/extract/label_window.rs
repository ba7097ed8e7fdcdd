//! Extractor for rate-monitor pages.
//!
//! Monitor sites print a label (often the institution name, `BCV`) followed
//! somewhere later by the rate, sometimes with thousands grouping
//! (`1.234,56`). The first number after each label occurrence is collapsed
//! into a single decimal and checked against the range.

use regex::Regex;
use rust_decimal::Decimal;
use tracing::debug;

use super::{leading_grouped_in_range, marker_ends, marker_regex, window, Extractor};
use crate::types::ValidRange;

pub const DEFAULT_WINDOW: usize = 800;

pub struct LabelWindowExtractor {
    name: String,
    label: Regex,
    window: usize,
}

impl LabelWindowExtractor {
    pub fn new(name: impl Into<String>, label: &str) -> Self {
        Self {
            name: name.into(),
            label: marker_regex(label),
            window: DEFAULT_WINDOW,
        }
    }

    pub fn with_window(mut self, window: usize) -> Self {
        self.window = window;
        self
    }
}

impl Extractor for LabelWindowExtractor {
    fn name(&self) -> &str {
        &self.name
    }

    fn extract(&self, text: &str, range: &ValidRange) -> Option<Decimal> {
        let found = marker_ends(&self.label, text)
            .find_map(|end| leading_grouped_in_range(window(text, end, self.window), range));
        match found {
            Some(v) => debug!(extractor = %self.name, value = %v, "Matched after label"),
            None => debug!(extractor = %self.name, "No candidate found"),
        }
        found
    }
}
