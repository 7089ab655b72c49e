//! Statement routing
//!
//! The front end handles a handful of session-level commands itself and
//! passes everything else to the execution engine untouched.

use std::sync::OnceLock;

use regex_lite::Regex;

use crate::error::{FrontendError, Result};
use crate::metrics::StatementKind;

/// Schema prefix selecting the global cache namespace
pub const GLOBAL_SCHEMA: &str = "global_temp";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Statement {
    /// `SET`
    SetList,
    /// `SET key`
    SetShow(String),
    /// `SET key = value`
    SetAssign { key: String, value: String },
    /// `CACHE [GLOBAL] TABLE name AS query`
    Cache { name: String, global: bool, query: String },
    /// `UNCACHE [GLOBAL] TABLE [IF EXISTS] name`
    Uncache { name: String, global: bool, if_exists: bool },
    /// `SELECT * FROM [global_temp.]name`, answered from the cache
    ScanCached { name: String, global: bool },
    /// Anything else, for the engine
    Query(String),
}

struct Patterns {
    set_list: Regex,
    set_assign: Regex,
    set_show: Regex,
    cache: Regex,
    uncache: Regex,
    scan: Regex,
}

fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(|| Patterns {
        set_list: Regex::new(r"(?is)^set$").unwrap(),
        set_assign: Regex::new(r"(?is)^set\s+([^\s=]+)\s*=\s*(.*)$").unwrap(),
        set_show: Regex::new(r"(?is)^set\s+([^\s=]+)$").unwrap(),
        cache: Regex::new(r"(?is)^cache\s+(global\s+)?table\s+(\S+)\s+as\s+(.+)$").unwrap(),
        uncache: Regex::new(r"(?is)^uncache\s+(global\s+)?table\s+(if\s+exists\s+)?(\S+)$").unwrap(),
        scan: Regex::new(r"(?is)^select\s+\*\s+from\s+(\S+)$").unwrap(),
    })
}

/// Split an optional `global_temp.` prefix off a table name
fn qualified_name(raw: &str, global_keyword: bool) -> (String, bool) {
    match raw.split_once('.') {
        Some((schema, name)) if schema.eq_ignore_ascii_case(GLOBAL_SCHEMA) => (name.to_string(), true),
        _ => (raw.to_string(), global_keyword),
    }
}

fn strip_quotes(value: &str) -> &str {
    let value = value.trim();
    if value.len() >= 2
        && ((value.starts_with('\'') && value.ends_with('\''))
            || (value.starts_with('"') && value.ends_with('"')))
    {
        &value[1..value.len() - 1]
    } else {
        value
    }
}

fn leading_keyword(sql: &str) -> String {
    sql.split_whitespace().next().unwrap_or("").to_ascii_lowercase()
}

impl Statement {
    pub fn parse(sql: &str) -> Result<Self> {
        let sql = sql.trim().trim_end_matches(';').trim();
        if sql.is_empty() {
            return Err(FrontendError::Syntax("empty statement".to_string()));
        }
        let p = patterns();

        match leading_keyword(sql).as_str() {
            "set" => {
                if p.set_list.is_match(sql) {
                    return Ok(Statement::SetList);
                }
                if let Some(caps) = p.set_assign.captures(sql) {
                    return Ok(Statement::SetAssign {
                        key: caps[1].to_string(),
                        value: strip_quotes(&caps[2]).to_string(),
                    });
                }
                if let Some(caps) = p.set_show.captures(sql) {
                    return Ok(Statement::SetShow(caps[1].to_string()));
                }
                Err(FrontendError::Syntax(format!("cannot parse SET statement '{}'", sql)))
            }
            "cache" => {
                let caps = p.cache.captures(sql).ok_or_else(|| {
                    FrontendError::Syntax("expected CACHE [GLOBAL] TABLE <name> AS <query>".to_string())
                })?;
                let (name, global) = qualified_name(&caps[2], caps.get(1).is_some());
                Ok(Statement::Cache { name, global, query: caps[3].trim().to_string() })
            }
            "uncache" => {
                let caps = p.uncache.captures(sql).ok_or_else(|| {
                    FrontendError::Syntax(
                        "expected UNCACHE [GLOBAL] TABLE [IF EXISTS] <name>".to_string(),
                    )
                })?;
                let (name, global) = qualified_name(&caps[3], caps.get(1).is_some());
                Ok(Statement::Uncache { name, global, if_exists: caps.get(2).is_some() })
            }
            "select" => match p.scan.captures(sql) {
                Some(caps) => {
                    let (name, global) = qualified_name(&caps[1], false);
                    Ok(Statement::ScanCached { name, global })
                }
                None => Ok(Statement::Query(sql.to_string())),
            },
            _ => Ok(Statement::Query(sql.to_string())),
        }
    }

    pub fn kind(&self) -> StatementKind {
        match self {
            Statement::SetList | Statement::SetShow(_) | Statement::SetAssign { .. } => {
                StatementKind::Set
            }
            Statement::Cache { .. } => StatementKind::Cache,
            Statement::Uncache { .. } => StatementKind::Uncache,
            Statement::ScanCached { .. } => StatementKind::Scan,
            Statement::Query(_) => StatementKind::Query,
        }
    }
}

#[cfg(test)]
mod statement_tests {
    use super::*;

    #[test]
    fn test_set_forms() {
        assert_eq!(Statement::parse("SET").unwrap(), Statement::SetList);
        assert_eq!(Statement::parse("set a.b").unwrap(), Statement::SetShow("a.b".into()));
        assert_eq!(
            Statement::parse("SET sqlfront.statement.timeout = 1;").unwrap(),
            Statement::SetAssign { key: "sqlfront.statement.timeout".into(), value: "1".into() }
        );
        assert_eq!(
            Statement::parse("SET app.name='my app'").unwrap(),
            Statement::SetAssign { key: "app.name".into(), value: "my app".into() }
        );
    }

    #[test]
    fn test_cache_forms() {
        assert_eq!(
            Statement::parse("CACHE TABLE t1 AS SELECT 1").unwrap(),
            Statement::Cache { name: "t1".into(), global: false, query: "SELECT 1".into() }
        );
        assert_eq!(
            Statement::parse("cache global table t2 as select 2").unwrap(),
            Statement::Cache { name: "t2".into(), global: true, query: "select 2".into() }
        );
        assert_eq!(
            Statement::parse("CACHE TABLE global_temp.t3 AS SELECT 3").unwrap(),
            Statement::Cache { name: "t3".into(), global: true, query: "SELECT 3".into() }
        );
        assert!(matches!(Statement::parse("CACHE t1"), Err(FrontendError::Syntax(_))));
    }

    #[test]
    fn test_uncache_forms() {
        assert_eq!(
            Statement::parse("UNCACHE TABLE IF EXISTS t1").unwrap(),
            Statement::Uncache { name: "t1".into(), global: false, if_exists: true }
        );
        assert_eq!(
            Statement::parse("uncache global table t2").unwrap(),
            Statement::Uncache { name: "t2".into(), global: true, if_exists: false }
        );
    }

    #[test]
    fn test_scan_and_query() {
        assert_eq!(
            Statement::parse("SELECT * FROM global_temp.g").unwrap(),
            Statement::ScanCached { name: "g".into(), global: true }
        );
        assert_eq!(
            Statement::parse("select * from t").unwrap(),
            Statement::ScanCached { name: "t".into(), global: false }
        );
        assert_eq!(
            Statement::parse("SELECT sleep(10)").unwrap(),
            Statement::Query("SELECT sleep(10)".into())
        );
        assert_eq!(Statement::parse("SELECT 1").unwrap().kind(), StatementKind::Query);
    }

    #[test]
    fn test_empty_statement() {
        assert!(matches!(Statement::parse("  ; "), Err(FrontendError::Syntax(_))));
    }
}
