//! Placeholder rewriting: `{{name}}` and `$name` surface forms become the
//! canonical `$param_<name>` bind form, and every occurrence is captured in
//! appearance order (repetition preserved) for positional binding.

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::{Captures, Regex};

use crate::error::CompileError;
use crate::route::ParameterSpec;

static PLACEHOLDER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_]*)\s*\}\}|\$([A-Za-z_][A-Za-z0-9_]*)")
        .expect("Failed to compile regular expression!")
});

/// Rewrite the authored SQL into its prepared form.
///
/// Returns the parameter appearance order and the rewritten SQL. Rewriting
/// is idempotent: feeding the output back through produces identical bytes,
/// because canonical `$param_<name>` references are recognised and recorded
/// without further rewriting.
pub fn prepare_sql(
    sql: &str,
    params: &[ParameterSpec],
    constants: &BTreeMap<String, String>,
) -> Result<(Vec<String>, String), CompileError> {
    let declared: Vec<&str> = params.iter().map(|spec| spec.name.as_str()).collect();

    let mut order = Vec::new();
    let mut unknown = None;

    let prepared = PLACEHOLDER.replace_all(sql, |caps: &Captures| {
        let name = caps
            .get(1)
            .or_else(|| caps.get(2))
            .map(|m| m.as_str())
            .unwrap_or_default();

        // Already-canonical references stay untouched but still count
        // towards the binding order.
        if let Some(stripped) = name.strip_prefix("param_") {
            if declared.contains(&stripped) {
                order.push(stripped.to_owned());
                return format!("$param_{stripped}");
            }
        }

        if declared.contains(&name) {
            order.push(name.to_owned());
            return format!("$param_{name}");
        }

        if let Some(value) = constants.get(name) {
            return constant_literal(value);
        }

        if unknown.is_none() {
            unknown = Some(name.to_owned());
        }

        caps.get(0).unwrap().as_str().to_owned()
    });

    if let Some(name) = unknown {
        return Err(CompileError::UnknownParameter { name });
    }

    Ok((order, prepared.into_owned()))
}

/// Render a constant as a SQL literal. Values that parse cleanly as numbers
/// are substituted bare; everything else is single-quoted with `''` escaping.
fn constant_literal(value: &str) -> String {
    let bare = !value.is_empty()
        && (value.parse::<i64>().is_ok() || value.parse::<f64>().is_ok());

    if bare {
        value.to_owned()
    } else {
        format!("'{}'", value.replace('\'', "''"))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::route::ParamType;

    fn specs(names: &[&str]) -> Vec<ParameterSpec> {
        names
            .iter()
            .map(|name| ParameterSpec::new(*name, ParamType::String))
            .collect()
    }

    #[test]
    fn translates_both_surface_forms() {
        let (order, prepared) = prepare_sql(
            "SELECT $name FROM dual WHERE id = {{id}}",
            &specs(&["id", "name"]),
            &BTreeMap::new(),
        )
        .unwrap();

        assert_eq!(order, vec!["name", "id"]);
        assert_eq!(prepared, "SELECT $param_name FROM dual WHERE id = $param_id");
    }

    #[test]
    fn preserves_repetition_in_order() {
        let (order, prepared) = prepare_sql(
            "SELECT $a, {{b}}, $a, $b",
            &specs(&["a", "b"]),
            &BTreeMap::new(),
        )
        .unwrap();

        assert_eq!(order, vec!["a", "b", "a", "b"]);
        assert_eq!(prepared.matches("$param_a").count(), 2);
        assert_eq!(prepared.matches("$param_b").count(), 2);
    }

    #[test]
    fn rewriting_is_idempotent() {
        let params = specs(&["id"]);
        let (first_order, first) =
            prepare_sql("SELECT {{id}}, $id", &params, &BTreeMap::new()).unwrap();
        let (second_order, second) = prepare_sql(&first, &params, &BTreeMap::new()).unwrap();

        assert_eq!(first, second);
        assert_eq!(first_order, second_order);
    }

    #[test]
    fn unknown_placeholders_fail() {
        let err = prepare_sql("SELECT {{missing}}", &[], &BTreeMap::new()).unwrap_err();
        assert!(matches!(err, CompileError::UnknownParameter { name } if name == "missing"));

        let err =
            prepare_sql("SELECT $unknown", &specs(&["known"]), &BTreeMap::new()).unwrap_err();
        assert!(matches!(err, CompileError::UnknownParameter { name } if name == "unknown"));
    }

    #[test]
    fn constants_substitute_as_literals() {
        let mut constants = BTreeMap::new();
        constants.insert("source_path".to_owned(), "data/it's.csv".to_owned());
        constants.insert("max_rows".to_owned(), "100".to_owned());

        let (order, prepared) = prepare_sql(
            "SELECT * FROM read_csv({{source_path}}) LIMIT $max_rows",
            &[],
            &constants,
        )
        .unwrap();

        assert!(order.is_empty());
        assert_eq!(
            prepared,
            "SELECT * FROM read_csv('data/it''s.csv') LIMIT 100"
        );
    }
}
