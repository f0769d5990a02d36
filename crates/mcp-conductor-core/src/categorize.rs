//! Deterministic classification of SQL engine failures.

use serde::{Deserialize, Serialize};

/// Closed taxonomy of SQL execution failures. The recovery engine keys its
/// correction instructions off this classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCategory {
    SyntaxError,
    MissingColumn,
    MissingTable,
    DataTypeMismatch,
    AmbiguousColumn,
    AggregationError,
    PermissionError,
    UnknownError,
}

impl ErrorCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCategory::SyntaxError => "SYNTAX_ERROR",
            ErrorCategory::MissingColumn => "MISSING_COLUMN",
            ErrorCategory::MissingTable => "MISSING_TABLE",
            ErrorCategory::DataTypeMismatch => "DATA_TYPE_MISMATCH",
            ErrorCategory::AmbiguousColumn => "AMBIGUOUS_COLUMN",
            ErrorCategory::AggregationError => "AGGREGATION_ERROR",
            ErrorCategory::PermissionError => "PERMISSION_ERROR",
            ErrorCategory::UnknownError => "UNKNOWN_ERROR",
        }
    }

    /// Permission failures are terminal; everything else may be retried.
    pub fn is_recoverable(self) -> bool {
        !matches!(self, ErrorCategory::PermissionError)
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// Ordered match table. First hit wins, top to bottom.
const DIRECT_MATCHES: &[(ErrorCategory, &[&str])] = &[
    (
        ErrorCategory::SyntaxError,
        &["syntax error", "unexpected token", "parse error", "expected"],
    ),
    (
        ErrorCategory::MissingColumn,
        &["column", "no such column", "unknown column", "field"],
    ),
    (
        ErrorCategory::MissingTable,
        &["table", "no such table", "relation"],
    ),
    (
        ErrorCategory::DataTypeMismatch,
        &[
            "type mismatch",
            "cannot cast",
            "invalid input syntax for type",
            "operator does not exist",
        ],
    ),
    (
        ErrorCategory::AmbiguousColumn,
        &["is ambiguous", "ambiguous column"],
    ),
    (
        ErrorCategory::AggregationError,
        &[
            "must appear in the group by",
            "aggregate functions are not allowed",
            "aggregate function calls cannot be nested",
        ],
    ),
    (
        ErrorCategory::PermissionError,
        &[
            "permission denied",
            "access denied",
            "insufficient privileges",
            "not authorized",
        ],
    ),
];

const DIRECT_CONFIDENCE: f64 = 0.9;
const HEURISTIC_CONFIDENCE: f64 = 0.6;
const UNKNOWN_CONFIDENCE: f64 = 0.3;

/// Classify an engine error message. Case-insensitive substring matching,
/// first-match by table order; a bare keyword hit falls back to a lower
/// confidence; anything unmatched is `UnknownError`.
pub fn categorize(engine_message: &str) -> (ErrorCategory, f64) {
    let msg = engine_message.to_lowercase();

    // Direct phrase matches. The column/table entries require the qualifier
    // wording so that a sentence merely mentioning "column" does not match
    // here; those fall through to the keyword heuristic below.
    for (category, phrases) in DIRECT_MATCHES {
        let hit = match category {
            ErrorCategory::MissingColumn => {
                (msg.contains("column") && (msg.contains("does not exist") || msg.contains("not found")))
                    || msg.contains("no such column")
                    || msg.contains("unknown column")
                    || (msg.contains("field") && msg.contains("not found"))
            }
            ErrorCategory::MissingTable => {
                (msg.contains("table") && msg.contains("does not exist"))
                    || msg.contains("no such table")
                    || (msg.contains("relation") && msg.contains("does not exist"))
            }
            ErrorCategory::SyntaxError => {
                msg.contains("syntax error")
                    || msg.contains("unexpected token")
                    || msg.contains("parse error")
                    || (msg.contains("expected") && msg.contains("but got"))
            }
            _ => phrases.iter().any(|p| msg.contains(p)),
        };
        if hit {
            return (*category, DIRECT_CONFIDENCE);
        }
    }

    // Keyword-only heuristic.
    if msg.contains("column") {
        return (ErrorCategory::MissingColumn, HEURISTIC_CONFIDENCE);
    }
    if msg.contains("table") {
        return (ErrorCategory::MissingTable, HEURISTIC_CONFIDENCE);
    }
    if msg.contains("type") {
        return (ErrorCategory::DataTypeMismatch, HEURISTIC_CONFIDENCE);
    }
    if msg.contains("group") {
        return (ErrorCategory::AggregationError, HEURISTIC_CONFIDENCE);
    }

    (ErrorCategory::UnknownError, UNKNOWN_CONFIDENCE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn syntax_errors() {
        let (c, conf) = categorize("syntax error at or near 'FORM'");
        assert_eq!(c, ErrorCategory::SyntaxError);
        assert!((conf - 0.9).abs() < f64::EPSILON);
        assert_eq!(categorize("Parse error near SELECT").0, ErrorCategory::SyntaxError);
        assert_eq!(
            categorize("expected identifier but got ','").0,
            ErrorCategory::SyntaxError
        );
    }

    #[test]
    fn missing_column_and_table() {
        assert_eq!(
            categorize("column \"revnue\" does not exist").0,
            ErrorCategory::MissingColumn
        );
        assert_eq!(categorize("no such column: foo").0, ErrorCategory::MissingColumn);
        assert_eq!(
            categorize("Unknown column 'x' in 'field list'").0,
            ErrorCategory::MissingColumn
        );
        assert_eq!(
            categorize("table 'sale' does not exist").0,
            ErrorCategory::MissingTable
        );
        assert_eq!(
            categorize("relation \"orders\" does not exist").0,
            ErrorCategory::MissingTable
        );
    }

    #[test]
    fn type_and_aggregation() {
        assert_eq!(
            categorize("operator does not exist: text = integer").0,
            ErrorCategory::DataTypeMismatch
        );
        assert_eq!(
            categorize("invalid input syntax for type integer").0,
            ErrorCategory::DataTypeMismatch
        );
        assert_eq!(
            categorize("column \"t.x\" must appear in the GROUP BY clause").0,
            ErrorCategory::AggregationError
        );
        assert_eq!(
            categorize("aggregate function calls cannot be nested").0,
            ErrorCategory::AggregationError
        );
    }

    #[test]
    fn ambiguity() {
        assert_eq!(
            categorize("column reference \"id\" is ambiguous").0,
            ErrorCategory::AmbiguousColumn
        );
    }

    #[test]
    fn permission_is_terminal() {
        let (c, _) = categorize("permission denied for relation sensitive");
        assert_eq!(c, ErrorCategory::PermissionError);
        assert!(!c.is_recoverable());
        assert_eq!(categorize("user not authorized").0, ErrorCategory::PermissionError);
    }

    #[test]
    fn keyword_heuristic_gets_lower_confidence() {
        let (c, conf) = categorize("something odd about a column here");
        assert_eq!(c, ErrorCategory::MissingColumn);
        assert!((conf - 0.6).abs() < f64::EPSILON);
        let (c, conf) = categorize("weird type thing");
        assert_eq!(c, ErrorCategory::DataTypeMismatch);
        assert!((conf - 0.6).abs() < f64::EPSILON);
    }

    #[test]
    fn unknown_default() {
        let (c, conf) = categorize("something went wrong");
        assert_eq!(c, ErrorCategory::UnknownError);
        assert!((conf - 0.3).abs() < f64::EPSILON);
        assert!(c.is_recoverable());
    }

    #[test]
    fn match_order_prefers_earlier_category() {
        // Mentions both a syntax phrase and a table phrase; syntax is listed
        // first in the table and wins.
        let (c, _) = categorize("syntax error near 'sales': table 'sales' does not exist");
        assert_eq!(c, ErrorCategory::SyntaxError);
    }

    #[test]
    fn serde_shape_is_screaming_snake() {
        let s = serde_json::to_string(&ErrorCategory::MissingTable).unwrap();
        assert_eq!(s, "\"MISSING_TABLE\"");
    }
}
