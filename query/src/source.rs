//! Query-target classification and the local/remote backing decision.

use std::fmt;
use std::path::{Path, PathBuf};

use common::export::COLUMNAR_EXT;
use common::DataConfig;
use data_store::cache::LocalCache;
use data_store::FileRef;
use fs_err as fs;
use serde::Serialize;
use tracing::debug;

use crate::error::QueryError;

/// Where the rows for a query physically come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DataSource {
    Local,
    Remote,
    DirectFile,
}

impl fmt::Display for DataSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Local => "local",
            Self::Remote => "remote",
            Self::DirectFile => "direct-file",
        })
    }
}

#[derive(Debug)]
pub enum ResolvedSource {
    /// The target names a columnar file; it is registered as a one-file table.
    DirectFile { file: FileRef },

    /// The target is (or loaded into) SQL text against the base table.
    Sql { sql: String, origin: SqlOrigin },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqlOrigin {
    Inline,
    Stored(PathBuf),
}

#[derive(Debug)]
pub struct Resolution {
    pub source: ResolvedSource,
    pub data_source: DataSource,
}

/// Classifies a query target and decides the physical backing of the logical
/// table, recorded in the result metadata.
pub fn resolve(
    target: &str,
    config: &DataConfig,
    cache: Option<&LocalCache>,
    force_remote: bool,
) -> Result<Resolution, QueryError> {
    if target.ends_with(COLUMNAR_EXT) {
        if let Some(file) = existing_columnar_file(target) {
            return Ok(Resolution {
                source: ResolvedSource::DirectFile { file },
                data_source: DataSource::DirectFile,
            });
        }
    }

    if target.ends_with(".sql") {
        if let Some(path) = stored_query_path(target, config)? {
            let sql = fs::read_to_string(&path)
                .map_err(|e| QueryError::internal(format!("could not load stored query: {e}")))?;
            return Ok(Resolution {
                source: ResolvedSource::Sql {
                    sql,
                    origin: SqlOrigin::Stored(path),
                },
                data_source: choose_backing(config, cache, force_remote),
            });
        }
    }

    if looks_like_sql(target) {
        return Ok(Resolution {
            source: ResolvedSource::Sql {
                sql: target.to_string(),
                origin: SqlOrigin::Inline,
            },
            data_source: choose_backing(config, cache, force_remote),
        });
    }

    let mut error = QueryError::invalid_query(
        "target is neither SQL, a stored query file, nor a columnar data file",
    );
    if target.ends_with(COLUMNAR_EXT) || target.ends_with(".sql") {
        error = error.with_suggestion(format!("no file exists at '{target}'"));
    }
    if config.query_library_root.is_none() && target.ends_with(".sql") {
        error = error.with_suggestion("no query library root is configured");
    }
    Err(error)
}

fn existing_columnar_file(target: &str) -> Option<FileRef> {
    let path = Path::new(target);
    if !path.is_file() {
        return None;
    }
    let path = fs::canonicalize(path).ok()?;
    FileRef::standalone(&path)
}

/// A stored query must live under the configured library root; relative
/// targets that escape it (or absolute ones outside it) are not stored
/// queries.
fn stored_query_path(target: &str, config: &DataConfig) -> Result<Option<PathBuf>, QueryError> {
    let Some(root) = &config.query_library_root else {
        return Ok(None);
    };
    let candidate = if Path::new(target).is_absolute() {
        PathBuf::from(target)
    } else {
        root.join(target)
    };
    if !candidate.is_file() {
        return Ok(None);
    }
    let root = fs::canonicalize(root)
        .map_err(|e| QueryError::internal(format!("query library root is unreadable: {e}")))?;
    let candidate = fs::canonicalize(&candidate)
        .map_err(|e| QueryError::internal(format!("stored query is unreadable: {e}")))?;
    if !candidate.starts_with(&root) {
        debug!(target, "stored-query target escapes the library root");
        return Ok(None);
    }
    Ok(Some(candidate))
}

/// A conservative whitespace/keyword check; proper parsing happens in the
/// safety validator. Mutating keywords are accepted here on purpose so they
/// reach the validator and are rejected with the right rule.
fn looks_like_sql(target: &str) -> bool {
    let trimmed = target.trim();
    if !trimmed.contains(char::is_whitespace) {
        return false;
    }
    let first = trimmed
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .to_ascii_lowercase();
    const KEYWORDS: &[&str] = &[
        "select", "with", "values", "explain", "describe", "show", "insert", "update", "delete",
        "merge", "create", "drop", "alter", "truncate", "grant", "revoke", "set", "copy", "call",
        "vacuum", "analyze", "pragma", "begin", "commit", "rollback",
    ];
    KEYWORDS.contains(&first.as_str()) || trimmed.to_ascii_lowercase().contains(" from ")
}

fn choose_backing(
    config: &DataConfig,
    cache: Option<&LocalCache>,
    force_remote: bool,
) -> DataSource {
    if force_remote {
        return DataSource::Remote;
    }
    if config.prefer_local() && cache.map(LocalCache::is_usable).unwrap_or(false) {
        return DataSource::Local;
    }
    DataSource::Remote
}
