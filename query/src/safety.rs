//! Admissibility checks applied before anything reaches the engine.
//!
//! A query is admitted iff it is a single read statement within the
//! configured length cap, and the requested row limit is in bounds. The
//! engine adapter additionally verifies the resulting plan, so a statement
//! slipping through here still cannot mutate anything.

use common::DataConfig;
use datafusion::sql::parser::{DFParser, Statement};
use datafusion::sql::sqlparser::ast::Statement as SqlStatement;

use crate::error::{classify, QueryError};

#[derive(Debug, Clone, Copy)]
pub struct SafetyLimits {
    pub max_rows: usize,
    pub max_query_len: usize,
}

impl SafetyLimits {
    pub fn from_config(config: &DataConfig) -> Self {
        Self {
            max_rows: config.max_rows,
            max_query_len: config.max_query_len,
        }
    }
}

/// Parses exactly one statement out of `sql`. More than one is inadmissible;
/// a parse failure is classified as the engine's syntax error.
pub fn parse_single_statement(sql: &str) -> Result<Statement, QueryError> {
    let mut statements =
        DFParser::parse_sql(sql).map_err(|e| classify(&e.to_string()))?;
    if statements.len() != 1 {
        return Err(QueryError::invalid_query(format!(
            "exactly one statement is admitted, found {}",
            statements.len()
        )));
    }
    // Unwrap: length checked above.
    Ok(statements.pop_back().unwrap())
}

/// Statement-shape validation: single statement, read-only, within the
/// length cap.
pub fn validate_sql(sql: &str, limits: &SafetyLimits) -> Result<(), QueryError> {
    if sql.len() > limits.max_query_len {
        return Err(QueryError::invalid_query(format!(
            "query length {} exceeds the cap of {} bytes",
            sql.len(),
            limits.max_query_len
        )));
    }
    validate_read_only(sql)
}

/// The read-only subset of validation, without the length cap. Trusted
/// internal SQL (materialized view definitions) goes through this.
pub fn validate_read_only(sql: &str) -> Result<(), QueryError> {
    let statement = parse_single_statement(sql)?;
    if !is_read_statement(&statement) {
        return Err(
            QueryError::invalid_query("only read statements are admitted")
                .with_suggestion("allowed statement shape: a single SELECT (or WITH … SELECT)"),
        );
    }
    Ok(())
}

pub fn validate_row_limit(row_limit: usize, limits: &SafetyLimits) -> Result<(), QueryError> {
    if row_limit < 1 || row_limit > limits.max_rows {
        return Err(QueryError::invalid_query(format!(
            "row limit {} outside the admitted range [1, {}]",
            row_limit, limits.max_rows
        )));
    }
    Ok(())
}

/// Only plain queries count as reads. DDL, DML, grant/revoke, session
/// settings, EXPLAIN and engine-specific statements all fall out here.
fn is_read_statement(statement: &Statement) -> bool {
    match statement {
        Statement::Statement(inner) => matches!(inner.as_ref(), SqlStatement::Query(_)),
        _ => false,
    }
}
