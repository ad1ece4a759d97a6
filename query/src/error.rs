//! The closed query-error taxonomy and the raw-error classifier.
//!
//! The engine is a black box, so classification works on textual patterns
//! over the raw error, centralized in one table. The raw text is preserved
//! as a diagnostic field but is never the primary message shown to callers.

use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidQuery,
    UnknownColumn,
    UnknownTable,
    SyntaxError,
    AccessDenied,
    NotFound,
    Transient,
    Cancelled,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidQuery => "invalid_query",
            Self::UnknownColumn => "unknown_column",
            Self::UnknownTable => "unknown_table",
            Self::SyntaxError => "syntax_error",
            Self::AccessDenied => "access_denied",
            Self::NotFound => "not_found",
            Self::Transient => "transient",
            Self::Cancelled => "cancelled",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct QueryError {
    pub kind: ErrorKind,

    /// Actionable, engine-free description.
    pub message: String,

    pub suggestions: Vec<String>,

    /// The raw engine/transport error. Carried for diagnostics; response
    /// serialization includes it only in diagnostic mode.
    pub original: Option<String>,
}

impl QueryError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            suggestions: vec![],
            original: None,
        }
    }

    pub fn invalid_query(rule: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidQuery, rule)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "the query was cancelled")
    }

    pub fn deadline_exceeded(deadline: Duration) -> Self {
        Self::new(
            ErrorKind::Transient,
            format!("query deadline of {}ms exceeded", deadline.as_millis()),
        )
        .with_suggestion("retry with a longer deadline or a narrower date window")
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message.into())
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }

    pub fn with_suggestions(mut self, suggestions: impl IntoIterator<Item = String>) -> Self {
        self.suggestions.extend(suggestions);
        self
    }

    pub fn with_original(mut self, original: impl Into<String>) -> Self {
        self.original = Some(original.into());
        self
    }

    /// The wire shape of a failed query. `original` is included only in
    /// diagnostic mode.
    pub fn body(&self, diagnostic: bool) -> ErrorBody<'_> {
        ErrorBody {
            error_kind: self.kind,
            message: &self.message,
            suggestions: &self.suggestions,
            original: if diagnostic {
                self.original.as_deref()
            } else {
                None
            },
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorBody<'a> {
    pub error_kind: ErrorKind,
    pub message: &'a str,
    pub suggestions: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original: Option<&'a str>,
}

/// One row of the classification table: the kind a pattern maps to, and how
/// to phrase the primary message.
struct Rule {
    kind: ErrorKind,
    pattern: Regex,
}

static RULES: LazyLock<Vec<Rule>> = LazyLock::new(|| {
    let rule = |kind, pattern: &str| Rule {
        kind,
        pattern: Regex::new(pattern).unwrap(),
    };
    // Order matters: the first match wins, so the specific shapes come
    // before the generic "not found" bucket.
    vec![
        rule(
            ErrorKind::UnknownColumn,
            r"(?i)no field named|column .{0,120} (?:not found|does(?: not|n't) exist)|unknown column",
        ),
        rule(
            ErrorKind::UnknownTable,
            r"(?i)table .{0,160} (?:not found|does(?: not|n't) exist)|no table named|unknown table",
        ),
        rule(
            ErrorKind::SyntaxError,
            r"(?i)parser ?error|syntax error|sql error:|expected .{0,80}, found",
        ),
        rule(
            ErrorKind::AccessDenied,
            r"(?i)access denied|forbidden|status: 403|invalid security token|expired token|credential|not authorized|unauthenticated",
        ),
        rule(
            ErrorKind::Transient,
            r"(?i)timed? ?out|connection (?:reset|refused|closed|aborted)|broken pipe|temporarily unavailable|too many requests|status: (?:429|500|502|503|504)|throttl|slow ?down|service unavailable|retry",
        ),
        rule(
            ErrorKind::NotFound,
            r"(?i)not found|status: 404|no such key|does not exist",
        ),
    ]
});

static COLUMN_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?i)no field named ['"`]?(\w+(?:\.\w+)*)|column ['"`]?(\w+(?:\.\w+)*)['"`]? not found"#,
    )
    .unwrap()
});

static CANDIDATES: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)valid fields are ([^.;]+)|candidates?:? ([^.;]+)|did you mean '([^']+)'")
        .unwrap()
});

static TABLE_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)table ['"`]?(\w+(?:\.\w+)*)['"`]? not found"#).unwrap()
});

static SYNTAX_POSITION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)at line (\d+), column (\d+)").unwrap());

static RETRY_AFTER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)retry[ -]?after[:= ]+(\d+)").unwrap());

/// Maps a raw engine/transport error into the taxonomy. Pure: identical
/// input always yields an identical result.
pub fn classify(raw: &str) -> QueryError {
    let kind = RULES
        .iter()
        .find(|rule| rule.pattern.is_match(raw))
        .map(|rule| rule.kind)
        .unwrap_or(ErrorKind::Internal);

    let mut error = match kind {
        ErrorKind::UnknownColumn => {
            let message = match extract_column_name(raw) {
                Some(column) => format!("column '{column}' does not exist"),
                None => "a referenced column does not exist".to_string(),
            };
            QueryError::new(kind, message)
                .with_suggestions(extract_candidates(raw))
                .with_suggestion("inspect the table's columns with a LIMIT 0 query")
        }
        ErrorKind::UnknownTable => {
            let message = match extract_table_name(raw) {
                Some(table) => format!("table '{table}' is not registered"),
                None => "a referenced table is not registered".to_string(),
            };
            QueryError::new(kind, message)
        }
        ErrorKind::SyntaxError => {
            let mut error = QueryError::new(kind, "the statement could not be parsed");
            if let Some(position) = SYNTAX_POSITION.captures(raw) {
                error = error.with_suggestion(format!(
                    "check the statement near line {}, column {}",
                    &position[1], &position[2]
                ));
            }
            error
        }
        ErrorKind::AccessDenied => QueryError::new(
            kind,
            "access to the data source was denied",
        )
        .with_suggestion(
            "check credential resolution: static keys, then session token, then named \
             profile, then role assumption, then the ambient environment",
        )
        .with_suggestion("a synced local cache with prefer_local avoids remote access entirely"),
        ErrorKind::Transient => {
            let mut error =
                QueryError::new(kind, "the data source is temporarily unavailable");
            match RETRY_AFTER.captures(raw) {
                Some(hint) => {
                    error = error.with_suggestion(format!("retry after {} seconds", &hint[1]))
                }
                None => error = error.with_suggestion("retry with backoff"),
            }
            error
        }
        ErrorKind::NotFound => {
            QueryError::new(kind, "the requested data was not found")
        }
        _ => QueryError::new(
            ErrorKind::Internal,
            format!("internal query error (correlation id {})", correlation_id(raw)),
        ),
    };

    error.original = Some(raw.to_string());
    error
}

fn extract_column_name(raw: &str) -> Option<String> {
    let captures = COLUMN_NAME.captures(raw)?;
    captures
        .iter()
        .skip(1)
        .flatten()
        .next()
        .map(|m| m.as_str().to_string())
}

fn extract_table_name(raw: &str) -> Option<String> {
    TABLE_NAME
        .captures(raw)
        .map(|captures| captures[1].to_string())
}

/// Candidate names the engine proposed, lifted out of its message.
fn extract_candidates(raw: &str) -> Vec<String> {
    let Some(captures) = CANDIDATES.captures(raw) else {
        return vec![];
    };
    let Some(list) = captures.iter().skip(1).flatten().next() else {
        return vec![];
    };
    list.as_str()
        .split(',')
        .map(|candidate| {
            candidate
                .trim()
                .trim_matches(|c| c == '"' || c == '\'' || c == '`')
                .to_string()
        })
        .filter(|candidate| !candidate.is_empty())
        .collect()
}

/// Deterministic opaque id tying a user-facing `Internal` error back to the
/// raw text in the logs.
fn correlation_id(raw: &str) -> String {
    let mut hasher = DefaultHasher::new();
    raw.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}
