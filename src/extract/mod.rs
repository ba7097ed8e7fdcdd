//! Numeric value extraction from unstructured page text.
//!
//! Defines the `Extractor` trait and the decimal token patterns shared by
//! the concrete extractors. Pages are not a stable format, so every search
//! is bounded to a window after a marker and every candidate is checked
//! against the declared valid range before it is returned.

pub mod label_window;
pub mod section_label;

use regex::Regex;
use rust_decimal::Decimal;
use std::str::FromStr;
use std::sync::OnceLock;

use crate::types::ValidRange;

pub use label_window::LabelWindowExtractor;
pub use section_label::SectionLabelExtractor;

/// Pluggable value extraction for one source.
///
/// Returns `None` on a soft miss so the resolver can move on to the next
/// source. Implementations must never return a value outside `range`.
pub trait Extractor: Send + Sync {
    /// Short identifier used in logs.
    fn name(&self) -> &str;

    fn extract(&self, text: &str, range: &ValidRange) -> Option<Decimal>;
}

// ---------------------------------------------------------------------------
// Token patterns
// ---------------------------------------------------------------------------

/// 2–4 integer digits, `,` or `.`, at least two fractional digits. The
/// leading group rejects matches that start inside a longer number; a
/// separator is only allowed before the token when it follows a non-digit
/// (`Bs.236,50`).
fn simple_decimal() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?:^|[^0-9.,]|[^0-9][.,])([0-9]{2,4}[.,][0-9]{2,})").expect("static regex")
    })
}

/// Either digit groups of three separated by `.`/`,` ending in a decimal
/// part (`1.234,56`), or a plain decimal (`36,50`).
fn grouped_decimal() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?:^|[^0-9.,]|[^0-9][.,])([0-9]{1,3}(?:[.,][0-9]{3})+[.,][0-9]{2,}|[0-9]+[.,][0-9]{2,})")
            .expect("static regex")
    })
}

/// Parse a simple decimal token, treating a comma as the decimal point.
pub fn normalize_simple(token: &str) -> Option<Decimal> {
    Decimal::from_str(&token.replace(',', ".")).ok()
}

/// Collapse a possibly grouped token into one decimal: the last separator
/// is the decimal point, earlier ones are thousands grouping.
pub fn normalize_grouped(token: &str) -> Option<Decimal> {
    let split = token.rfind(['.', ','])?;
    let (int_part, frac_part) = token.split_at(split);
    let int_digits: String = int_part.chars().filter(char::is_ascii_digit).collect();
    let frac_digits = &frac_part[1..];
    if int_digits.is_empty() || frac_digits.is_empty() {
        return None;
    }
    Decimal::from_str(&format!("{int_digits}.{frac_digits}")).ok()
}

/// First simple decimal token in `text` that lies in `range`.
pub fn first_simple_in_range(text: &str, range: &ValidRange) -> Option<Decimal> {
    simple_decimal()
        .captures_iter(text)
        .filter_map(|c| normalize_simple(c.get(1)?.as_str()))
        .find(|v| range.contains(*v))
}

/// The first simple decimal token in `text`, accepted only if in range.
///
/// Unlike `first_simple_in_range`, later tokens are not considered: the
/// number closest to a label is the one that belongs to it.
pub fn leading_simple_in_range(text: &str, range: &ValidRange) -> Option<Decimal> {
    let token = simple_decimal().captures(text)?.get(1)?.as_str();
    normalize_simple(token).filter(|v| range.contains(*v))
}

/// The first grouped decimal token in `text`, accepted only if in range.
pub fn leading_grouped_in_range(text: &str, range: &ValidRange) -> Option<Decimal> {
    let token = grouped_decimal().captures(text)?.get(1)?.as_str();
    normalize_grouped(token).filter(|v| range.contains(*v))
}

// ---------------------------------------------------------------------------
// Windows and markers
// ---------------------------------------------------------------------------

/// Up to `len` bytes of `text` starting at `start`, snapped to char boundaries.
pub fn window(text: &str, start: usize, len: usize) -> &str {
    let mut start = start.min(text.len());
    while !text.is_char_boundary(start) {
        start += 1;
    }
    let mut end = start.saturating_add(len).min(text.len());
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[start..end]
}

/// Case-insensitive literal matcher for a marker string.
pub fn marker_regex(marker: &str) -> Regex {
    // An escaped literal with a fixed flag always compiles.
    Regex::new(&format!("(?i){}", regex::escape(marker))).expect("escaped marker")
}

/// Byte offsets just past each occurrence of `marker` in `text`.
pub fn marker_ends<'t>(marker: &'t Regex, text: &'t str) -> impl Iterator<Item = usize> + 't {
    marker.find_iter(text).map(|m| m.end())
}
