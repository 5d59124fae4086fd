//! Extraction of the metadata/SQL pair from `.sql.md` route sources.
//!
//! A source file opens with a `+++`-delimited TOML frontmatter block,
//! followed by a fenced ` ```sql ` code block holding the query.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::CompileError;

static TOML_FRONTMATTER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^\s*\+\+\+(.*?)\+\+\+").expect("Failed to compile regular expression!"));

static SQL_FENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```sql[ \t]*\r?\n(.*?)```").expect("Failed to compile regular expression!"));

/// Split a `.sql.md` source into its TOML metadata table and SQL body.
pub fn split_source(text: &str) -> Result<(toml::Table, String), CompileError> {
    let frontmatter = TOML_FRONTMATTER
        .captures(text)
        .ok_or_else(|| CompileError::Source {
            detail: "missing +++ frontmatter block".into(),
        })?;

    let metadata: toml::Table = toml::from_str(frontmatter.get(1).unwrap().as_str())?;

    let rest = &text[frontmatter.get(0).unwrap().end()..];
    let sql = SQL_FENCE
        .captures(rest)
        .ok_or_else(|| CompileError::Source {
            detail: "missing ```sql code fence".into(),
        })?
        .get(1)
        .unwrap()
        .as_str()
        .trim()
        .to_owned();

    if sql.is_empty() {
        return Err(CompileError::Source {
            detail: "sql block is empty".into(),
        });
    }

    Ok((metadata, sql))
}

#[cfg(test)]
mod test {
    use super::*;
    use indoc::indoc;

    #[test]
    fn splits_metadata_and_sql() {
        let source = indoc! {r#"
            +++
            id = "cached"
            path = "/cached"

            [cache]
            order_by = ["bird"]
            +++

            ```sql
            SELECT 'duck' AS bird
            ```
        "#};

        let (metadata, sql) = split_source(source).unwrap();

        assert_eq!(metadata["id"].as_str(), Some("cached"));
        assert_eq!(sql, "SELECT 'duck' AS bird");
    }

    #[test]
    fn rejects_missing_frontmatter() {
        let err = split_source("```sql\nSELECT 1\n```").unwrap_err();
        assert!(matches!(err, CompileError::Source { .. }));
    }

    #[test]
    fn rejects_missing_fence() {
        let err = split_source("+++\nid = \"x\"\n+++\nSELECT 1").unwrap_err();
        assert!(matches!(err, CompileError::Source { .. }));
    }

    #[test]
    fn rejects_empty_sql() {
        let err = split_source("+++\nid = \"x\"\n+++\n```sql\n```").unwrap_err();
        assert!(matches!(err, CompileError::Source { .. }));
    }
}
