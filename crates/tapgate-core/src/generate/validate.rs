//! Candidate checks run before a generated test is accepted.
//!
//! Assertion scripts (pgTAP style) are checked for structure; anything else
//! must parse as SQL in the schema's dialect.

use crate::model::SqlDialect;
use regex::Regex;
use sqlparser::dialect::{Dialect, PostgreSqlDialect, SQLiteDialect};
use sqlparser::parser::Parser;
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateShape {
    AssertionScript,
    Statements(usize),
}

const SCRIPT_ONLY_ASSERTIONS: &[&str] = &[
    "ok",
    "cmp_ok",
    "isa_ok",
    "throws_ok",
    "throws_like",
    "lives_ok",
    "performs_ok",
    "results_eq",
    "results_ne",
    "set_eq",
    "set_ne",
    "bag_eq",
    "bag_ne",
    "row_eq",
    "is_empty",
    "isnt_empty",
    "has_table",
    "hasnt_table",
    "has_column",
    "hasnt_column",
    "col_not_null",
    "col_is_null",
    "col_is_pk",
    "col_is_fk",
    "col_type_is",
    "col_has_default",
    "has_pk",
    "has_fk",
    "fk_ok",
    "has_index",
    "has_function",
    "has_trigger",
    "has_view",
    "has_schema",
];

// Valid assertions that are too generic to identify a script on their own.
const GENERIC_ASSERTIONS: &[&str] = &["is", "isnt", "matches", "alike", "unalike", "pass", "fail"];

fn call_re(names: &[&str]) -> Regex {
    let alternation = names.join("|");
    Regex::new(&format!(r"(?i)\b(?:{})\s*\(", alternation)).expect("valid regex")
}

fn plan_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| call_re(&["plan", "no_plan"]))
}

fn finish_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| call_re(&["finish"]))
}

fn distinctive_assertion_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| call_re(SCRIPT_ONLY_ASSERTIONS))
}

fn any_assertion_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        let all: Vec<&str> = SCRIPT_ONLY_ASSERTIONS
            .iter()
            .chain(GENERIC_ASSERTIONS.iter())
            .copied()
            .collect();
        call_re(&all)
    })
}

fn transaction_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)^(begin|commit|rollback|abort|start\s+transaction|savepoint|release(\s+savepoint)?|end(\s+(transaction|work))?)\b",
        )
        .expect("valid regex")
    })
}

/// Blanks out comments, quoted strings and dollar-quoted bodies so keyword
/// scans only see top-level SQL.
pub fn mask_literals(sql: &str) -> String {
    let chars: Vec<char> = sql.chars().collect();
    let mut out = String::with_capacity(sql.len());
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();

        if c == '-' && next == Some('-') {
            while i < chars.len() && chars[i] != '\n' {
                i += 1;
            }
            continue;
        }

        if c == '/' && next == Some('*') {
            i += 2;
            while i < chars.len() && !(chars[i] == '*' && chars.get(i + 1) == Some(&'/')) {
                i += 1;
            }
            i = (i + 2).min(chars.len());
            out.push(' ');
            continue;
        }

        if c == '\'' {
            i += 1;
            while i < chars.len() {
                if chars[i] == '\'' {
                    if chars.get(i + 1) == Some(&'\'') {
                        i += 2;
                        continue;
                    }
                    break;
                }
                i += 1;
            }
            i = (i + 1).min(chars.len());
            out.push_str("''");
            continue;
        }

        if c == '$' {
            let mut j = i + 1;
            while j < chars.len() && (chars[j].is_alphanumeric() || chars[j] == '_') {
                j += 1;
            }
            if chars.get(j) == Some(&'$') {
                let tag: String = chars[i..=j].iter().collect();
                let body_start = j + 1;
                let rest: String = chars[body_start..].iter().collect();
                match rest.find(&tag) {
                    Some(pos) => {
                        i = body_start + rest[..pos].chars().count() + tag.chars().count();
                    }
                    None => i = chars.len(),
                }
                out.push_str("$$");
                continue;
            }
        }

        out.push(c);
        i += 1;
    }

    out
}

/// First transaction-control keyword found at statement start, if any.
pub fn find_transaction_control(sql: &str) -> Option<String> {
    mask_literals(sql)
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .find_map(|stmt| {
            transaction_re()
                .find(stmt)
                .map(|m| m.as_str().split_whitespace().collect::<Vec<_>>().join(" ").to_uppercase())
        })
}

pub fn looks_like_assertion_script(sql: &str) -> bool {
    let masked = mask_literals(sql);
    plan_re().is_match(&masked)
        || finish_re().is_match(&masked)
        || distinctive_assertion_re().is_match(&masked)
}

fn dialect_for(dialect: SqlDialect) -> Box<dyn Dialect> {
    match dialect {
        SqlDialect::Postgres => Box::new(PostgreSqlDialect {}),
        SqlDialect::Sqlite => Box::new(SQLiteDialect {}),
    }
}

/// Checks a candidate. `Err` carries every violated rule in human-readable form.
pub fn validate_candidate(sql: &str, dialect: SqlDialect) -> Result<CandidateShape, Vec<String>> {
    if sql.trim().is_empty() {
        return Err(vec!["candidate SQL is empty".to_string()]);
    }

    if looks_like_assertion_script(sql) {
        return validate_script(sql);
    }

    let dialect = dialect_for(dialect);
    match Parser::parse_sql(dialect.as_ref(), sql) {
        Ok(statements) if statements.is_empty() => {
            Err(vec!["candidate contains no SQL statement".to_string()])
        }
        Ok(statements) => Ok(CandidateShape::Statements(statements.len())),
        Err(e) => Err(vec![format!("SQL syntax error: {}", e)]),
    }
}

fn validate_script(sql: &str) -> Result<CandidateShape, Vec<String>> {
    let masked = mask_literals(sql);
    let mut violations = Vec::new();

    if !plan_re().is_match(&masked) {
        violations.push("assertion script must declare a plan: plan(n) or no_plan()".to_string());
    }
    if !finish_re().is_match(&masked) {
        violations.push("assertion script must call finish()".to_string());
    }
    if !any_assertion_re().is_match(&masked) {
        violations.push("assertion script must contain at least one assertion".to_string());
    }
    if let Some(keyword) = find_transaction_control(sql) {
        violations.push(format!(
            "transaction control is not allowed ({}); the runner owns transaction boundaries",
            keyword
        ));
    }

    if violations.is_empty() {
        Ok(CandidateShape::AssertionScript)
    } else {
        Err(violations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GOOD_SCRIPT: &str = "\
SELECT plan(2);
SELECT has_table('orders');
SELECT is((SELECT count(*)::int FROM orders), 0, 'orders start empty');
SELECT * FROM finish();
";

    #[test]
    fn complete_script_is_accepted() {
        assert_eq!(
            validate_candidate(GOOD_SCRIPT, SqlDialect::Postgres),
            Ok(CandidateShape::AssertionScript)
        );
    }

    #[test]
    fn script_missing_plan_and_finish_lists_both() {
        let err = validate_candidate("SELECT has_table('orders');", SqlDialect::Postgres).unwrap_err();
        assert_eq!(err.len(), 2);
        assert!(err[0].contains("plan"));
        assert!(err[1].contains("finish()"));
    }

    #[test]
    fn script_without_assertions_is_rejected() {
        let err = validate_candidate("SELECT plan(1);\nSELECT * FROM finish();", SqlDialect::Postgres)
            .unwrap_err();
        assert_eq!(err, vec!["assertion script must contain at least one assertion".to_string()]);
    }

    #[test]
    fn script_with_transaction_control_is_rejected() {
        let script = format!("BEGIN;\n{}ROLLBACK;\n", GOOD_SCRIPT);
        let err = validate_candidate(&script, SqlDialect::Postgres).unwrap_err();
        assert_eq!(err.len(), 1);
        assert!(err[0].contains("BEGIN"));
    }

    #[test]
    fn plpgsql_begin_inside_dollar_quotes_is_fine() {
        let script = "\
SELECT plan(1);
DO $body$ DECLARE n int; BEGIN SELECT 1 INTO n; END $body$;
SELECT ok(true, 'block ran');
SELECT * FROM finish();
";
        assert_eq!(
            validate_candidate(script, SqlDialect::Postgres),
            Ok(CandidateShape::AssertionScript)
        );
    }

    #[test]
    fn plain_sql_must_parse() {
        let ok = validate_candidate(
            "INSERT INTO orders (id, total) VALUES (1, 10);\nSELECT CASE WHEN count(*) = 1 THEN 'ok 1 - inserted' ELSE 'not ok 1 - inserted' END FROM orders;",
            SqlDialect::Sqlite,
        );
        assert_eq!(ok, Ok(CandidateShape::Statements(2)));

        let err = validate_candidate("SELEC * FRM orders", SqlDialect::Sqlite).unwrap_err();
        assert!(err[0].starts_with("SQL syntax error"));
    }

    #[test]
    fn blank_candidate_is_rejected() {
        assert!(validate_candidate("  \n", SqlDialect::Sqlite).is_err());
        assert!(validate_candidate("-- nothing here", SqlDialect::Sqlite).is_err());
    }

    #[test]
    fn keywords_inside_strings_and_comments_are_ignored() {
        assert_eq!(find_transaction_control("SELECT 'BEGIN; COMMIT'; -- ROLLBACK"), None);
        assert_eq!(
            find_transaction_control("select 1;\n  start   transaction;"),
            Some("START TRANSACTION".to_string())
        );
        assert!(!looks_like_assertion_script("SELECT 'plan(1)'"));
        assert!(!looks_like_assertion_script("SELECT is_active FROM users"));
    }
}
