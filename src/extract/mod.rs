//! Headcount extraction from page text.

pub mod patterns;

pub use patterns::{
    normalize_digits, parse_headcount, HeadcountPattern, PatternMatch, RegexExtractor,
    AMBIGUITY_PENALTY, DEFAULT_CONTEXT_RADIUS, HEADCOUNT_PATTERNS,
};
