//! Pattern-based headcount extraction.
//!
//! Every pattern in [`HEADCOUNT_PATTERNS`] is run over the whole text and every
//! match is kept. Matches are ranked by confidence, then by value; when the
//! accepted matches disagree on the number, the winner's confidence is scaled by
//! [`AMBIGUITY_PENALTY`].

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use tracing::{debug, info};

use crate::models::{is_plausible_headcount, ExtractionCandidate, ExtractionMethod};

/// Confidence multiplier applied when matches resolve to different values.
pub const AMBIGUITY_PENALTY: f64 = 0.8;

/// Default number of characters kept on either side of a match.
pub const DEFAULT_CONTEXT_RADIUS: usize = 50;

/// A labeled headcount pattern. The first capture group holds the number.
pub struct HeadcountPattern {
    pub name: &'static str,
    pub confidence: f64,
    pub regex: Regex,
}

const DIGITS: &str = r"([0-9０-９][0-9０-９,，]*)";
const ASCII_DIGITS: &str = r"([0-9][0-9,]*)";

fn pattern(name: &'static str, confidence: f64, source: &str) -> HeadcountPattern {
    let regex = Regex::new(&format!("(?i){}", source))
        .unwrap_or_else(|e| panic!("invalid headcount pattern {name}: {e}"));
    HeadcountPattern {
        name,
        confidence,
        regex,
    }
}

/// Ordered pattern table, most explicit labels first.
pub static HEADCOUNT_PATTERNS: LazyLock<Vec<HeadcountPattern>> = LazyLock::new(|| {
    vec![
        // Japanese labels
        pattern("従業員数_名/人", 0.95, &format!(r"従業員数[\s:：]*{DIGITS}\s*(?:名|人)")),
        pattern("従業員_名/人", 0.9, &format!(r"従業員[\s:：]*{DIGITS}\s*(?:名|人)")),
        pattern("社員数_名/人", 0.9, &format!(r"社員数[\s:：]*{DIGITS}\s*(?:名|人)")),
        pattern(
            "従業員_単体/連結",
            0.85,
            &format!(r"従業員\s*(?:（単体）|（連結）|\(単体\)|\(連結\))?[\s:：]*{DIGITS}"),
        ),
        pattern("スタッフ数", 0.8, &format!(r"スタッフ数[\s:：]*{DIGITS}\s*(?:名|人)")),
        pattern("人員", 0.75, &format!(r"人員[\s:：]*{DIGITS}\s*(?:名|人)")),
        // English labels
        pattern("Number of Employees", 0.95, &format!(r"Number\s+of\s+Employees?[\s:：]*{ASCII_DIGITS}")),
        pattern("Employees", 0.9, &format!(r"Employees?[\s:：]*{ASCII_DIGITS}")),
        pattern("Staff", 0.8, &format!(r"Staff[\s:：]*{ASCII_DIGITS}")),
        pattern("Workforce", 0.8, &format!(r"Workforce[\s:：]*{ASCII_DIGITS}")),
        pattern("Team Size", 0.7, &format!(r"Team\s+(?:Size|Members?)[\s:：]*{ASCII_DIGITS}")),
        // Table and list layouts
        pattern(
            "表形式",
            0.7,
            &format!(r"(?:従業員|社員|Employees?)[^0-9０-９]*?{DIGITS}\s*(?:名|人)?(?:[^0-9０-９,，]|$)"),
        ),
    ]
});

/// Convert full-width digits to ASCII and strip thousands separators.
pub fn normalize_digits(raw: &str) -> String {
    raw.chars()
        .filter_map(|c| match c {
            '０'..='９' => char::from_u32(c as u32 - '０' as u32 + '0' as u32),
            ',' | '，' => None,
            other => Some(other),
        })
        .collect()
}

/// Parse a captured number, rejecting implausible headcounts.
pub fn parse_headcount(raw: &str) -> Option<u64> {
    let normalized = normalize_digits(raw);
    let value: u64 = normalized.parse().ok()?;
    if is_plausible_headcount(value) {
        Some(value)
    } else {
        debug!(value, "Headcount outside plausible range");
        None
    }
}

/// One accepted pattern match.
#[derive(Debug, Clone, PartialEq)]
pub struct PatternMatch {
    pub value: u64,
    pub confidence: f64,
    pub pattern: &'static str,
    pub context: String,
}

/// Stateless headcount extractor over the pattern table.
#[derive(Debug, Clone, Copy)]
pub struct RegexExtractor {
    context_radius: usize,
}

impl Default for RegexExtractor {
    fn default() -> Self {
        Self::new(DEFAULT_CONTEXT_RADIUS)
    }
}

impl RegexExtractor {
    pub fn new(context_radius: usize) -> Self {
        Self { context_radius }
    }

    /// Collect every accepted match from every pattern.
    pub fn matches(&self, text: &str) -> Vec<PatternMatch> {
        let mut found = Vec::new();
        for pattern in HEADCOUNT_PATTERNS.iter() {
            for caps in pattern.regex.captures_iter(text) {
                let (Some(whole), Some(number)) = (caps.get(0), caps.get(1)) else {
                    continue;
                };
                let Some(value) = parse_headcount(number.as_str()) else {
                    continue;
                };
                let context = context_window(text, whole.start(), whole.end(), self.context_radius);
                debug!(pattern = pattern.name, value, context = %context, "Pattern match");
                found.push(PatternMatch {
                    value,
                    confidence: pattern.confidence,
                    pattern: pattern.name,
                    context,
                });
            }
        }
        found
    }

    /// Extract the best headcount candidate from `text`.
    pub fn extract(&self, text: &str) -> ExtractionCandidate {
        if text.trim().is_empty() {
            return ExtractionCandidate::not_found("regex");
        }

        let mut matches = self.matches(text);
        if matches.is_empty() {
            debug!("No headcount pattern matched");
            return ExtractionCandidate::not_found("regex");
        }

        matches.sort_by(|a, b| {
            b.confidence
                .total_cmp(&a.confidence)
                .then_with(|| b.value.cmp(&a.value))
        });

        let distinct: HashSet<u64> = matches.iter().map(|m| m.value).collect();
        let best = &matches[0];
        let confidence = if distinct.len() > 1 {
            best.confidence * AMBIGUITY_PENALTY
        } else {
            best.confidence
        };

        info!(
            value = best.value,
            pattern = best.pattern,
            confidence,
            candidates = matches.len(),
            distinct_values = distinct.len(),
            "Extracted headcount by pattern"
        );

        ExtractionCandidate::found(
            best.value,
            confidence,
            best.context.clone(),
            ExtractionMethod::Regex,
            best.pattern,
        )
    }
}

/// Text around a byte span, at most `radius` characters either side, cut back to
/// the nearest sentence or line boundary inside that window.
pub fn context_window(text: &str, start: usize, end: usize, radius: usize) -> String {
    let before: Vec<(usize, char)> = text[..start].char_indices().rev().take(radius).collect();
    let window_start = before.last().map(|(i, _)| *i).unwrap_or(start);

    let mut window_end = end;
    for (count, (i, c)) in text[end..].char_indices().enumerate() {
        if count >= radius {
            break;
        }
        window_end = end + i + c.len_utf8();
    }

    // Start just after the last boundary before the match
    let mut lead = window_start;
    for (i, c) in text[window_start..start].char_indices() {
        if is_boundary(text, window_start + i, c) {
            lead = window_start + i + c.len_utf8();
        }
    }

    // End at the first boundary after the match, keeping the terminator
    let mut tail = window_end;
    for (i, c) in text[end..window_end].char_indices() {
        if is_boundary(text, end + i, c) {
            tail = if c == '\n' { end + i } else { end + i + c.len_utf8() };
            break;
        }
    }

    text[lead..tail].trim().to_string()
}

fn is_boundary(text: &str, at: usize, c: char) -> bool {
    match c {
        '\n' | '。' | '！' | '？' | '!' | '?' => true,
        '.' => text[at + 1..]
            .chars()
            .next()
            .map(char::is_whitespace)
            .unwrap_or(true),
        _ => false,
    }
}
