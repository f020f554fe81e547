//! Id-range expressions such as `2-6 8 38-52 80-`.

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Inclusive id bounds; a missing side is open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdRange {
    pub start: Option<i64>,
    pub end: Option<i64>,
}

impl IdRange {
    pub fn new(start: Option<i64>, end: Option<i64>) -> Self {
        Self { start, end }
    }

    pub fn single(id: i64) -> Self {
        Self::new(Some(id), Some(id))
    }

    pub fn contains(&self, id: i64) -> bool {
        self.start.map_or(true, |start| id >= start) && self.end.map_or(true, |end| id <= end)
    }
}

impl fmt::Display for IdRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.start, self.end) {
            (Some(start), Some(end)) if start == end => write!(f, "{start}"),
            (Some(start), Some(end)) => write!(f, "{start}-{end}"),
            (Some(start), None) => write!(f, "{start}-"),
            (None, Some(end)) => write!(f, "-{end}"),
            (None, None) => write!(f, "-"),
        }
    }
}

fn patterns() -> &'static (Regex, Regex, Regex) {
    static PATTERNS: OnceLock<(Regex, Regex, Regex)> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        (
            Regex::new(r"[^0-9-]").expect("valid regex"),
            Regex::new(r"\s*-+\s*").expect("valid regex"),
            Regex::new(r"\s+").expect("valid regex"),
        )
    })
}

/// Normalized tokens of an expression. Tokens with more than one hyphen are
/// dropped with a warning and do not fail the whole expression.
pub fn range_tokens(expression: &str) -> Vec<String> {
    let (invalid, hyphens, spaces) = patterns();
    let cleaned = invalid.replace_all(expression, " ");
    let cleaned = hyphens.replace_all(&cleaned, "-");
    let cleaned = spaces.replace_all(&cleaned, " ");
    cleaned
        .trim()
        .split(' ')
        .filter(|token| !token.is_empty())
        .filter(|token| {
            let ambiguous = token.matches('-').count() > 1;
            if ambiguous {
                warn!(token = %token, "dropping ambiguous id range token");
            }
            !ambiguous
        })
        .map(str::to_string)
        .collect()
}

pub fn parse_id_ranges(expression: &str) -> Vec<IdRange> {
    range_tokens(expression)
        .iter()
        .filter_map(|token| parse_token(token))
        .collect()
}

fn parse_token(token: &str) -> Option<IdRange> {
    let bound = |value: &str| value.parse::<i64>().ok();
    let range = match token.split_once('-') {
        None => IdRange::single(bound(token)?),
        Some((start, end)) => IdRange::new(bound(start), bound(end)),
    };
    if range.start.is_none() && range.end.is_none() {
        warn!(token = %token, "dropping empty id range token");
        return None;
    }
    Some(range)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_are_normalized() {
        assert_eq!(
            range_tokens("2-6 8 38-52 80-"),
            vec!["2-6", "8", "38-52", "80-"]
        );
        assert_eq!(range_tokens(" 2 -- 6,  8; 10"), vec!["2-6", "8", "10"]);
        assert_eq!(range_tokens("-9 12"), vec!["-9", "12"]);
    }

    #[test]
    fn ambiguous_tokens_are_dropped() {
        assert!(range_tokens("1-2-3").is_empty());
        assert_eq!(range_tokens("1-2-3 7"), vec!["7"]);
    }

    #[test]
    fn ranges_parse_open_bounds() {
        assert_eq!(
            parse_id_ranges("-3 2-6 8 80-"),
            vec![
                IdRange::new(None, Some(3)),
                IdRange::new(Some(2), Some(6)),
                IdRange::single(8),
                IdRange::new(Some(80), None),
            ]
        );
        assert!(parse_id_ranges("-").is_empty());
        assert!(IdRange::new(Some(80), None).contains(1000));
        assert!(!IdRange::new(None, Some(3)).contains(4));
        assert_eq!(IdRange::new(Some(80), None).to_string(), "80-");
    }
}
