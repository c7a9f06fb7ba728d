//! Root-cause classification of execution failures.
//!
//! The static SQLSTATE tables below are the single routing source for the
//! triage router: `schema` codes are escalated to the schema owner, `sql_quality`
//! codes send the test case back to generation.

use crate::model::{FailureCategory, FailureClassification};
use regex::Regex;
use std::sync::OnceLock;

pub const SCHEMA_CODES: &[(&str, &str)] = &[
    ("23502", "not_null_violation"),
    ("23503", "foreign_key_violation"),
    ("23505", "unique_violation"),
    ("23514", "check_violation"),
    ("42P01", "undefined_table"),
    ("42703", "undefined_column"),
    ("42704", "undefined_object"),
    ("42P02", "undefined_parameter"),
    ("42701", "duplicate_column"),
    ("42P04", "duplicate_database"),
    ("42723", "duplicate_function"),
    ("42P06", "duplicate_schema"),
    ("42P07", "duplicate_table"),
    ("42710", "duplicate_object"),
];

pub const SQL_QUALITY_CODES: &[(&str, &str)] = &[
    ("42601", "syntax_error"),
    ("42883", "undefined_function"),
    ("42702", "ambiguous_column"),
    ("42725", "ambiguous_function"),
    ("42P08", "ambiguous_parameter"),
    ("42P09", "ambiguous_alias"),
    ("42611", "invalid_column_definition"),
    ("42P11", "invalid_cursor_definition"),
    ("42P12", "invalid_database_definition"),
    ("42P13", "invalid_function_definition"),
    ("42P14", "invalid_prepared_statement_definition"),
    ("42P15", "invalid_schema_definition"),
    ("42P16", "invalid_table_definition"),
    ("42P17", "invalid_object_definition"),
    ("22P02", "invalid_text_representation"),
    ("22003", "numeric_value_out_of_range"),
    ("22012", "division_by_zero"),
    ("22023", "invalid_parameter_value"),
];

const SCHEMA_KEYWORDS: &[&str] = &[
    "does not exist",
    "relation",
    "column",
    "table",
    "constraint",
    "foreign key",
    "not null",
    "unique",
];

const SQL_QUALITY_KEYWORDS: &[&str] = &["syntax error", "invalid syntax", "parse error"];

fn code_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"\(([0-9A-Z]{5})\)",
            r"(?i)error code:?\s+([0-9A-Z]{5})\b",
            r"(?i)\bcode:\s*([0-9A-Z]{5})\b",
            r"(?i)SQLSTATE\[([0-9A-Z]{5})\]",
        ]
        .iter()
        .map(|p| Regex::new(p).expect("valid regex"))
        .collect()
    })
}

/// Pulls a SQLSTATE-shaped code out of a database error message.
///
/// Five alphanumeric characters with at least one digit, so a parenthesised
/// identifier such as `(users)` is not mistaken for a code.
pub fn extract_error_code(message: &str) -> Option<String> {
    code_patterns().iter().find_map(|re| {
        re.captures_iter(message)
            .filter_map(|c| c.get(1))
            .map(|m| m.as_str().to_ascii_uppercase())
            .find(|code| code.chars().any(|ch| ch.is_ascii_digit()))
    })
}

/// Table lookup for a single code. `None` means the code is not routed.
pub fn lookup_code(code: &str) -> Option<(FailureCategory, &'static str)> {
    let code = code.to_ascii_uppercase();
    if let Some((_, name)) = SCHEMA_CODES.iter().find(|(c, _)| *c == code) {
        return Some((FailureCategory::Schema, name));
    }
    SQL_QUALITY_CODES
        .iter()
        .find(|(c, _)| *c == code)
        .map(|(_, name)| (FailureCategory::SqlQuality, *name))
}

pub fn classify(message: &str) -> FailureClassification {
    if let Some(code) = extract_error_code(message) {
        return match lookup_code(&code) {
            Some((category, name)) => FailureClassification {
                category,
                error_code: Some(code),
                error_name: Some(name.to_string()),
                should_retry_with_schema_fix: category == FailureCategory::Schema,
            },
            None => FailureClassification {
                category: FailureCategory::Unknown,
                error_code: Some(code),
                error_name: None,
                should_retry_with_schema_fix: false,
            },
        };
    }

    let lower = message.to_lowercase();
    let category = if SCHEMA_KEYWORDS.iter().any(|k| lower.contains(k)) {
        FailureCategory::Schema
    } else if SQL_QUALITY_KEYWORDS.iter().any(|k| lower.contains(k)) {
        FailureCategory::SqlQuality
    } else {
        FailureCategory::Unknown
    };

    FailureClassification {
        category,
        error_code: None,
        error_name: None,
        should_retry_with_schema_fix: category == FailureCategory::Schema,
    }
}
