//! Positioned issues produced by template validation.

use serde::{Deserialize, Serialize};

use crate::backend::{ExpandResponse, ValidationIssue};

/// Source tag attached to every diagnostic published by the engine.
pub const DIAGNOSTIC_SOURCE: &str = "epw";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
}

/// One issue anchored to a document. `line` and `column` are 0-based;
/// a missing `end_column` spans to the end of the line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Diagnostic {
    pub line: u32,
    pub column: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_column: Option<u32>,
    pub severity: Severity,
    pub message: String,
    pub source: String,
}

impl Diagnostic {
    fn from_issue(issue: &ValidationIssue, severity: Severity) -> Self {
        let (line, column) = match issue.position {
            Some(pos) => (
                pos.line.saturating_sub(1),
                pos.column.map(|c| c.saturating_sub(1)).unwrap_or(0),
            ),
            None => (0, 0),
        };
        Self {
            line,
            column,
            end_column: None,
            severity,
            message: issue.message.clone(),
            source: DIAGNOSTIC_SOURCE.to_string(),
        }
    }
}

/// Errors first, then warnings. An empty result means the template is
/// valid and previously published diagnostics should be cleared.
pub fn from_validation(response: &ExpandResponse) -> Vec<Diagnostic> {
    response
        .errors
        .iter()
        .map(|i| Diagnostic::from_issue(i, Severity::Error))
        .chain(
            response
                .warnings
                .iter()
                .map(|i| Diagnostic::from_issue(i, Severity::Warning)),
        )
        .collect()
}
