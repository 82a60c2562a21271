//! Customer number parsing and validation
//!
//! Operators paste customer numbers in bulk (comma, space or newline
//! separated). Two formats exist:
//!
//! - [`CusnoFormat::Standard`]: 9 or 10 digits, kept verbatim.
//! - [`CusnoFormat::Legacy`]: 10 digits with a leading `0`, or 9 digits not
//!   starting with `0`; the leading `0` is stripped so both normalize to 9.

use std::collections::HashSet;
use std::sync::OnceLock;

use regex::Regex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CusnoFormat {
    Standard,
    Legacy,
}

/// Classification of a partially typed entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputState {
    Idle,
    Valid,
    Partial,
    Invalid,
}

fn standard_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\d{9,10}$").expect("valid regex"))
}

fn legacy_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^0\d{9}$|^[1-9]\d{8}$").expect("valid regex"))
}

fn standard_separator() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[\s,]+").expect("valid regex"))
}

fn legacy_separator() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\D+").expect("valid regex"))
}

impl CusnoFormat {
    pub fn is_valid(self, cusno: &str) -> bool {
        match self {
            CusnoFormat::Standard => standard_regex().is_match(cusno),
            CusnoFormat::Legacy => legacy_regex().is_match(cusno),
        }
    }

    pub fn normalize(self, cusno: &str) -> String {
        let cusno = cusno.trim();
        match self {
            CusnoFormat::Standard => cusno.to_string(),
            CusnoFormat::Legacy => cusno.strip_prefix('0').unwrap_or(cusno).to_string(),
        }
    }

    fn split(self, input: &str) -> Vec<&str> {
        let separator = match self {
            CusnoFormat::Standard => standard_separator(),
            CusnoFormat::Legacy => legacy_separator(),
        };
        separator
            .split(input.trim())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect()
    }

    /// Valid numbers in input order, normalized.
    pub fn extract_valid(self, input: &str) -> Vec<String> {
        self.split(input)
            .into_iter()
            .filter(|c| self.is_valid(c))
            .map(|c| self.normalize(c))
            .collect()
    }

    pub fn extract_invalid(self, input: &str) -> Vec<String> {
        self.split(input)
            .into_iter()
            .filter(|c| !self.is_valid(c))
            .map(str::to_string)
            .collect()
    }

    /// Remove numbers that were already taken from the raw input.
    pub fn remove_completed(self, input: &str, completed: &[String]) -> String {
        if completed.is_empty() {
            return input.to_string();
        }
        completed
            .iter()
            .fold(input.to_string(), |acc, cusno| acc.replacen(cusno.as_str(), "", 1))
            .trim()
            .to_string()
    }

    pub fn classify(self, entry: &str) -> InputState {
        let trimmed = entry.trim();
        if trimmed.is_empty() {
            return InputState::Idle;
        }
        if !trimmed.bytes().all(|b| b.is_ascii_digit()) {
            return InputState::Invalid;
        }
        if self.is_valid(trimmed) {
            InputState::Valid
        } else if trimmed.len() < 9 {
            InputState::Partial
        } else {
            InputState::Invalid
        }
    }
}

pub fn join(cusnos: &[String]) -> String {
    cusnos.join(",")
}

/// Append `additions` to `existing`, skipping duplicates and keeping first-seen order.
pub fn merge_unique(existing: &[String], additions: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    existing
        .iter()
        .chain(additions.iter())
        .filter(|c| seen.insert(c.as_str()))
        .cloned()
        .collect()
}
