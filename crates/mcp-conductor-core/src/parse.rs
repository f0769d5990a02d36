//! Extraction of generated SQL from LLM output.
//!
//! Parsers are attempted in order: whole-body JSON, fenced JSON block,
//! structured text with named sections, and a bare-SELECT last resort. The
//! first candidate that survives validation wins; a candidate that parses
//! but fails the SQL gate surfaces as a validation error rather than a
//! parse error so disallowed statements are reported as such.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::sql;
use crate::types::{GeneratedSql, ResolvedEntity};

const JSON_CONFIDENCE: f64 = 0.9;
const STRUCTURED_CONFIDENCE: f64 = 0.7;
const BARE_CONFIDENCE: f64 = 0.5;

/// Wire shape of a conforming generation response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResponseBody {
    pub sql_query: String,
    #[serde(default)]
    pub resolved_entities: Vec<ResolvedEntity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub changes_made: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

impl ResponseBody {
    fn into_generated(self) -> GeneratedSql {
        GeneratedSql {
            sql: self.sql_query.trim().trim_end_matches(';').trim().to_string(),
            resolved_entities: self.resolved_entities,
            explanation: self.explanation,
            confidence: self.confidence.unwrap_or(JSON_CONFIDENCE),
            changes_made: self.changes_made,
        }
    }
}

/// Parse an opaque LLM response into validated SQL.
pub fn parse_llm_response(text: &str) -> Result<GeneratedSql, Error> {
    let mut validation_failure: Option<String> = None;
    for candidate in candidates(text) {
        match validate(&candidate) {
            Ok(()) => return Ok(candidate),
            Err(reason) => {
                tracing::debug!(target = "pipeline", %reason, "parser candidate rejected");
                validation_failure.get_or_insert(reason);
            }
        }
    }
    match validation_failure {
        Some(reason) => Err(Error::SqlValidation(reason)),
        None => Err(Error::ResponseParse("no SQL found in response".into())),
    }
}

fn validate(candidate: &GeneratedSql) -> Result<(), String> {
    if candidate.sql.trim().is_empty() {
        return Err("empty sql".into());
    }
    sql::validate_select(&candidate.sql)
}

fn candidates(text: &str) -> Vec<GeneratedSql> {
    let mut out = Vec::new();
    if let Some(c) = parse_json_body(text) {
        out.push(c);
    }
    if let Some(c) = parse_fenced_json(text) {
        out.push(c);
    }
    if let Some(c) = parse_structured_text(text) {
        out.push(c);
    }
    if let Some(c) = parse_bare_select(text) {
        out.push(c);
    }
    out
}

// Parser 1: the whole body is a JSON object carrying sql_query.
fn parse_json_body(text: &str) -> Option<GeneratedSql> {
    let body: ResponseBody = serde_json::from_str(text.trim()).ok()?;
    Some(body.into_generated())
}

fn fence_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(?s)```(?:json)?\s*\n(.*?)```").unwrap())
}

// Parser 2: first fenced block, tagged json or untagged.
fn parse_fenced_json(text: &str) -> Option<GeneratedSql> {
    let caps = fence_pattern().captures(text)?;
    let body: ResponseBody = serde_json::from_str(caps[1].trim()).ok()?;
    Some(body.into_generated())
}

fn select_start_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(?i)\bSELECT\b").unwrap())
}

// First SELECT run: to the statement terminator when present, otherwise to
// a blank line, a section header, a fence, or the end of the text.
fn extract_sql(text: &str) -> Option<String> {
    let start = select_start_pattern().find(text)?.start();
    let rest = &text[start..];
    let end = rest.find(';').unwrap_or_else(|| {
        ["\n\n", "\nExplanation", "\nResolved Entities", "\nChanges Made", "```"]
            .iter()
            .filter_map(|stop| rest.find(stop))
            .min()
            .unwrap_or(rest.len())
    });
    let sql = rest[..end].trim();
    if sql.is_empty() { None } else { Some(sql.to_string()) }
}

fn section_header_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?im)^\s*(Explanation|Resolved Entities|Changes Made)\s*:").unwrap()
    })
}

fn section<'a>(text: &'a str, header: &str) -> Option<&'a str> {
    let matches: Vec<_> = section_header_pattern().captures_iter(text).collect();
    for (i, caps) in matches.iter().enumerate() {
        if !caps[1].eq_ignore_ascii_case(header) {
            continue;
        }
        let start = caps.get(0).unwrap().end();
        let end = matches
            .get(i + 1)
            .map(|next| next.get(0).unwrap().start())
            .unwrap_or(text.len());
        return Some(text[start..end].trim());
    }
    None
}

fn entity_line_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r#"^[-*]?\s*"?([^":]+?)"?\s*(?:->|:)\s*(.+)$"#).unwrap())
}

// Parser 3: SELECT statement plus at least one named section.
fn parse_structured_text(text: &str) -> Option<GeneratedSql> {
    let sql = extract_sql(text)?;
    let explanation = section(text, "Explanation").map(|s| s.to_string());
    let entities_text = section(text, "Resolved Entities");
    let changes_text = section(text, "Changes Made");
    if explanation.is_none() && entities_text.is_none() && changes_text.is_none() {
        return None;
    }
    let resolved_entities = entities_text
        .map(|block| {
            block
                .lines()
                .filter_map(|line| {
                    let caps = entity_line_pattern().captures(line.trim())?;
                    Some(ResolvedEntity {
                        original_term: caps[1].trim().to_string(),
                        resolved_value: caps[2].trim().to_string(),
                        source_server: None,
                        confidence: 1.0,
                    })
                })
                .collect()
        })
        .unwrap_or_default();
    let changes_made = changes_text
        .map(|block| {
            block
                .lines()
                .map(|l| l.trim_start_matches(['-', '*', ' ']).trim().to_string())
                .filter(|l| !l.is_empty())
                .collect()
        })
        .unwrap_or_default();
    Some(GeneratedSql {
        sql,
        resolved_entities,
        explanation,
        confidence: STRUCTURED_CONFIDENCE,
        changes_made,
    })
}

// Parser 4: last resort, the first SELECT run alone.
fn parse_bare_select(text: &str) -> Option<GeneratedSql> {
    let sql = extract_sql(text)?;
    Some(GeneratedSql {
        sql,
        resolved_entities: Vec::new(),
        explanation: None,
        confidence: BARE_CONFIDENCE,
        changes_made: Vec::new(),
    })
}
