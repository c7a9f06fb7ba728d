//! Line-oriented TAP report parser.
//!
//! Handles plan lines (`1..N`, anywhere in the stream), `ok`/`not ok` result
//! lines with optional `# TODO`/`# SKIP` directives, YAML-ish diagnostic blocks
//! between `---` and `...`, and `#` comment lines.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TapPlan {
    pub start: u32,
    pub end: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TapDirectiveKind {
    Todo,
    Skip,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TapDirective {
    pub kind: TapDirectiveKind,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TapTestResult {
    pub ok: bool,
    pub number: u32,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directive: Option<TapDirective>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub diagnostics: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub comments: Vec<String>,
}

impl TapTestResult {
    pub fn is_todo(&self) -> bool {
        matches!(&self.directive, Some(d) if d.kind == TapDirectiveKind::Todo)
    }

    pub fn is_skip(&self) -> bool {
        matches!(&self.directive, Some(d) if d.kind == TapDirectiveKind::Skip)
    }

    /// Counted as a real failure: `not ok` without a TODO or SKIP directive.
    pub fn is_failure(&self) -> bool {
        !self.ok && self.directive.is_none()
    }

    /// One-line rendering used in failure messages.
    pub fn detail(&self) -> String {
        let mut out = format!("#{}", self.number);
        if !self.description.is_empty() {
            out.push(' ');
            out.push_str(&self.description);
        }
        let mut extra = Vec::new();
        for key in ["message", "got", "wanted", "expected", "error"] {
            if let Some(v) = self.diagnostics.get(key) {
                let text = match v {
                    Value::String(s) => s.replace('\n', " "),
                    other => other.to_string(),
                };
                extra.push(format!("{}: {}", key, text.trim()));
            }
        }
        if extra.is_empty() {
            extra.extend(self.comments.iter().map(|c| c.trim().to_string()));
        }
        if !extra.is_empty() {
            out.push_str(" (");
            out.push_str(&extra.join("; "));
            out.push(')');
        }
        out
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TapSummary {
    pub plan: Option<TapPlan>,
    pub tests: Vec<TapTestResult>,
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub todo: usize,
    /// Comments seen before the first result line.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub comments: Vec<String>,
}

impl TapSummary {
    pub fn failures(&self) -> impl Iterator<Item = &TapTestResult> {
        self.tests.iter().filter(|t| t.is_failure())
    }
}

fn plan_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(\d+)\.\.(\d+)(?:\s*#.*)?$").expect("valid regex"))
}

fn result_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)^(not\s+)?ok\b(?:\s+(\d+))?\s*(.*)$").expect("valid regex")
    })
}

fn directive_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)#\s*(todo|skip)\w*\b\s*(.*)$").expect("valid regex"))
}

fn key_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^([A-Za-z_][A-Za-z0-9_.-]*)\s*:(?:\s+(.*)|\s*)$").expect("valid regex")
    })
}

struct DiagEntry {
    key: String,
    indent: usize,
    inline: String,
    block: Option<char>,
    lines: Vec<(usize, String)>,
}

impl DiagEntry {
    fn finish(self) -> (String, Value) {
        let DiagEntry {
            key,
            inline,
            block,
            lines,
            ..
        } = self;

        let min_indent = lines.iter().map(|(i, _)| *i).min().unwrap_or(0);
        let continued: Vec<String> = lines
            .into_iter()
            .map(|(indent, text)| {
                let pad = " ".repeat(indent.saturating_sub(min_indent));
                format!("{}{}", pad, text)
            })
            .collect();

        if let Some(style) = block {
            let sep = if style == '>' { " " } else { "\n" };
            return (key, Value::String(continued.join(sep)));
        }

        if continued.is_empty() {
            return (key, coerce(&inline));
        }

        let mut parts = Vec::with_capacity(continued.len() + 1);
        if !inline.is_empty() {
            parts.push(inline);
        }
        parts.extend(continued);
        let joined = parts.join("\n");
        (key, coerce(&joined))
    }
}

/// JSON interpretation of a diagnostic value, falling back to the trimmed raw text.
fn coerce(raw: &str) -> Value {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Value::String(String::new());
    }
    serde_json::from_str::<Value>(trimmed).unwrap_or_else(|_| Value::String(trimmed.to_string()))
}

fn indent_of(line: &str) -> usize {
    line.len() - line.trim_start().len()
}

#[derive(Default)]
struct DiagBlock {
    entries: Vec<DiagEntry>,
}

impl DiagBlock {
    fn push_line(&mut self, raw: &str) {
        let indent = indent_of(raw);
        let text = raw.trim();

        if let Some(current) = self.entries.last_mut() {
            if indent > current.indent && (current.block.is_some() || !key_re().is_match(text)) {
                current.lines.push((indent, text.to_string()));
                return;
            }
        }

        if let Some(caps) = key_re().captures(text) {
            let key = caps.get(1).map(|m| m.as_str().to_string()).unwrap_or_default();
            let value = caps.get(2).map(|m| m.as_str().trim()).unwrap_or("");
            let block = match value {
                "|" | "|-" | "|+" => Some('|'),
                ">" | ">-" | ">+" => Some('>'),
                _ => None,
            };
            self.entries.push(DiagEntry {
                key,
                indent,
                inline: if block.is_some() {
                    String::new()
                } else {
                    value.to_string()
                },
                block,
                lines: Vec::new(),
            });
        } else if let Some(current) = self.entries.last_mut() {
            current.lines.push((indent, text.to_string()));
        }
    }

    fn finish(self) -> Map<String, Value> {
        self.entries.into_iter().map(DiagEntry::finish).collect()
    }
}

pub fn parse(output: &str) -> TapSummary {
    let mut summary = TapSummary::default();
    let mut diag: Option<DiagBlock> = None;
    let mut last_number: u32 = 0;

    for raw in output.lines() {
        let line = raw.trim_end();
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        if let Some(block) = diag.as_mut() {
            if trimmed == "..." {
                let map = diag.take().map(DiagBlock::finish).unwrap_or_default();
                if let Some(last) = summary.tests.last_mut() {
                    last.diagnostics.extend(map);
                }
            } else {
                block.push_line(line);
            }
            continue;
        }

        if trimmed == "---" {
            diag = Some(DiagBlock::default());
            continue;
        }

        if let Some(caps) = plan_re().captures(trimmed) {
            let start = caps.get(1).and_then(|m| m.as_str().parse().ok());
            let end = caps.get(2).and_then(|m| m.as_str().parse().ok());
            if let (Some(start), Some(end)) = (start, end) {
                summary.plan = Some(TapPlan { start, end });
                continue;
            }
        }

        if let Some(caps) = result_re().captures(trimmed) {
            let ok = caps.get(1).is_none();
            let number = caps
                .get(2)
                .and_then(|m| m.as_str().parse().ok())
                .unwrap_or_else(|| last_number.saturating_add(1));
            last_number = number;

            let rest = caps.get(3).map(|m| m.as_str()).unwrap_or("");
            let (description, directive) = split_directive(rest);

            summary.tests.push(TapTestResult {
                ok,
                number,
                description,
                directive,
                diagnostics: Map::new(),
                comments: Vec::new(),
            });
            continue;
        }

        if let Some(comment) = trimmed.strip_prefix('#') {
            let comment = comment.trim().to_string();
            match summary.tests.last_mut() {
                Some(last) => last.comments.push(comment),
                None => summary.comments.push(comment),
            }
        }
    }

    // Unterminated diagnostic block at end of output.
    if let Some(block) = diag.take() {
        if let Some(last) = summary.tests.last_mut() {
            last.diagnostics.extend(block.finish());
        }
    }

    tally(&mut summary);
    summary
}

fn split_directive(rest: &str) -> (String, Option<TapDirective>) {
    let directive = directive_re().captures(rest).and_then(|caps| {
        let whole = caps.get(0)?;
        // `\#` is an escaped hash inside the description.
        if rest[..whole.start()].ends_with('\\') {
            return None;
        }
        let kind = match caps.get(1)?.as_str().to_ascii_lowercase().as_str() {
            "todo" => TapDirectiveKind::Todo,
            _ => TapDirectiveKind::Skip,
        };
        let reason = caps.get(2).map(|m| m.as_str().trim().to_string()).unwrap_or_default();
        Some((whole.start(), TapDirective { kind, reason }))
    });

    let (desc, directive) = match directive {
        Some((at, d)) => (&rest[..at], Some(d)),
        None => (rest, None),
    };

    let desc = desc.trim();
    let desc = desc.strip_prefix('-').map(str::trim_start).unwrap_or(desc);
    (desc.replace("\\#", "#"), directive)
}

fn tally(summary: &mut TapSummary) {
    summary.total = summary.tests.len();
    summary.passed = 0;
    summary.failed = 0;
    summary.skipped = 0;
    summary.todo = 0;
    for t in &summary.tests {
        if t.is_skip() {
            summary.skipped += 1;
        } else if t.is_todo() {
            summary.todo += 1;
        } else if t.ok {
            summary.passed += 1;
        } else {
            summary.failed += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn assert_partition(s: &TapSummary) {
        assert_eq!(s.total, s.tests.len());
        assert_eq!(s.passed + s.failed + s.skipped + s.todo, s.total);
    }

    #[test]
    fn single_passing_case() {
        let s = parse("1..1\nok 1 - Valid case");
        assert_eq!(s.plan, Some(TapPlan { start: 1, end: 1 }));
        assert_eq!(s.total, 1);
        assert_eq!(s.passed, 1);
        assert_eq!(s.failed, 0);
        assert_eq!(s.tests[0].description, "Valid case");
        assert_partition(&s);
    }

    #[test]
    fn todo_is_excluded_from_failed() {
        let s = parse("1..2\nok 1 - A\nnot ok 2 - B # TODO fix");
        assert_eq!(s.todo, 1);
        assert_eq!(s.failed, 0);
        assert_eq!(s.passed, 1);
        let d = s.tests[1].directive.as_ref().unwrap();
        assert_eq!(d.kind, TapDirectiveKind::Todo);
        assert_eq!(d.reason, "fix");
        assert_eq!(s.tests[1].description, "B");
        assert_partition(&s);
    }

    #[test]
    fn skip_counts_regardless_of_ok() {
        let s = parse("ok 1 - a # SKIP no index\nnot ok 2 - b # skip later\nnot ok 3 - c");
        assert_eq!(s.skipped, 2);
        assert_eq!(s.failed, 1);
        assert_eq!(s.passed, 0);
        assert_partition(&s);
    }

    #[test]
    fn ok_token_is_case_insensitive_and_plan_may_trail() {
        let s = parse("OK 1 - first\nNot Ok 2 - second\n1..2\n");
        assert_eq!(s.passed, 1);
        assert_eq!(s.failed, 1);
        assert_eq!(s.plan, Some(TapPlan { start: 1, end: 2 }));
    }

    #[test]
    fn diagnostic_block_with_literal_multi_line_value() {
        let out = "\
1..1
not ok 1 - totals match
  ---
  message: |
    expected 3 rows
    got 2 rows
  got: 2
  wanted: \"3\"
  strict: true
  ...
";
        let s = parse(out);
        assert_eq!(s.failed, 1);
        let diag = &s.tests[0].diagnostics;
        assert_eq!(diag["message"], json!("expected 3 rows\ngot 2 rows"));
        assert_eq!(diag["got"], json!(2));
        assert_eq!(diag["wanted"], json!("3"));
        assert_eq!(diag["strict"], json!(true));
    }

    #[test]
    fn plain_continuation_lines_join_into_one_value() {
        let out = "not ok 1\n---\nerror: relation missing\n  in schema public\nseverity: high\n...";
        let s = parse(out);
        let diag = &s.tests[0].diagnostics;
        assert_eq!(diag["error"], json!("relation missing\nin schema public"));
        assert_eq!(diag["severity"], json!("high"));
    }

    #[test]
    fn comments_attach_to_current_result() {
        let out = "# preamble\nnot ok 1 - insert order\n# Failed test 1: \"insert order\"\n#   have: 0\n\nok 2";
        let s = parse(out);
        assert_eq!(s.comments, vec!["preamble".to_string()]);
        assert_eq!(
            s.tests[0].comments,
            vec!["Failed test 1: \"insert order\"".to_string(), "have: 0".to_string()]
        );
        assert!(s.tests[1].comments.is_empty());
        assert_eq!(s.tests[1].number, 2);
    }

    #[test]
    fn missing_numbers_continue_the_sequence() {
        let s = parse("ok\nok - named\nnot ok");
        let numbers: Vec<u32> = s.tests.iter().map(|t| t.number).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
        assert_eq!(s.tests[1].description, "named");
    }

    #[test]
    fn unnumbered_result_after_max_number_does_not_overflow() {
        let s = parse("ok 4294967295 - max\nok - next");
        assert_eq!(s.total, 2);
        assert_eq!(s.passed, 2);
        assert_eq!(s.tests[1].number, u32::MAX);
        assert_partition(&s);
    }

    #[test]
    fn directive_words_may_carry_a_suffix() {
        let s = parse("not ok 1 - a # skipped no index\nnot ok 2 - b # todolist\nnot ok 3 - c # skipping");
        assert_eq!(s.skipped, 2);
        assert_eq!(s.todo, 1);
        assert_eq!(s.failed, 0);
        let d = s.tests[0].directive.as_ref().unwrap();
        assert_eq!(d.kind, TapDirectiveKind::Skip);
        assert_eq!(d.reason, "no index");
        assert_eq!(s.tests[1].directive.as_ref().unwrap().kind, TapDirectiveKind::Todo);
        assert_eq!(s.tests[1].description, "b");
        assert_partition(&s);
    }

    #[test]
    fn escaped_hash_is_not_a_directive() {
        let s = parse("not ok 1 - issue \\# TODO later");
        assert_eq!(s.failed, 1);
        assert!(s.tests[0].directive.is_none());
        assert_eq!(s.tests[0].description, "issue # TODO later");
    }

    #[test]
    fn empty_output_is_zero_total() {
        let s = parse("");
        assert_eq!(s, TapSummary::default());
        let s = parse("\n\n   \n");
        assert_eq!(s.total, 0);
        assert!(s.plan.is_none());
    }

    #[test]
    fn detail_prefers_diagnostics_then_comments() {
        let s = parse("not ok 4 - amounts\n# have: 1\n# want: 2");
        assert_eq!(s.tests[0].detail(), "#4 amounts (have: 1; want: 2)");

        let s = parse("not ok 1 - x\n---\nmessage: boom\n...");
        assert_eq!(s.tests[0].detail(), "#1 x (message: boom)");
    }
}
