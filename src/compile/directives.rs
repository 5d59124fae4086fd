//! Inline route directives.
//!
//! Authors may embed `-- @name key=value ... [payload]` comment lines in the
//! SQL body. Directives merge into the structured metadata by appending to
//! lists and shallow-overwriting scalar keys, with structured metadata
//! winning on conflicts.

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::Regex;

static DIRECTIVE_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)^\s*--\s*@([A-Za-z_][A-Za-z0-9_-]*)[ \t]*(.*)$")
        .expect("Failed to compile regular expression!")
});

/// A single parsed `-- @name ...` line.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteDirective {
    pub name: String,
    pub args: BTreeMap<String, String>,
    pub value: Option<String>,
}

/// The payload a directive contributes during merging.
#[derive(Debug, Clone, PartialEq)]
pub enum DirectivePayload {
    Json(serde_json::Value),
    Args(BTreeMap<String, String>),
    Text(String),
}

/// Scan the SQL body for directive lines, in order of appearance.
pub fn scan_directives(sql: &str) -> Vec<RouteDirective> {
    DIRECTIVE_LINE
        .captures_iter(sql)
        .map(|caps| {
            let name = caps[1].to_owned();
            let rest = caps[2].trim();
            let (args, value) = parse_rest(rest);
            RouteDirective { name, args, value }
        })
        .collect()
}

fn parse_rest(rest: &str) -> (BTreeMap<String, String>, Option<String>) {
    if rest.is_empty() {
        return (BTreeMap::new(), None);
    }

    // A structured payload swallows the whole remainder.
    if rest.starts_with('{') || rest.starts_with('[') {
        return (BTreeMap::new(), Some(rest.to_owned()));
    }

    let mut args = BTreeMap::new();
    let mut tail = Vec::new();

    for token in rest.split_whitespace() {
        if tail.is_empty() {
            if let Some((key, value)) = token.split_once('=') {
                if !key.is_empty() {
                    args.insert(key.to_owned(), value.to_owned());
                    continue;
                }
            }
        }
        tail.push(token);
    }

    let value = match tail.is_empty() {
        true => None,
        false => Some(tail.join(" ")),
    };

    (args, value)
}

/// Collect the payloads of every directive matching `name`.
///
/// A JSON-looking value parses as JSON; otherwise the args map wins over a
/// bare text value; directives with neither contribute nothing.
pub fn collect_directive_payloads(
    directives: &[RouteDirective],
    name: &str,
) -> Vec<DirectivePayload> {
    directives
        .iter()
        .filter(|d| d.name == name)
        .filter_map(|d| {
            if let Some(raw) = d.value.as_deref().map(str::trim) {
                if raw.starts_with('{') || raw.starts_with('[') {
                    if let Ok(json) = serde_json::from_str(raw) {
                        return Some(DirectivePayload::Json(json));
                    }
                }
                if !d.args.is_empty() {
                    return Some(DirectivePayload::Args(d.args.clone()));
                }
                if !raw.is_empty() {
                    return Some(DirectivePayload::Text(raw.to_owned()));
                }
            }
            if !d.args.is_empty() {
                return Some(DirectivePayload::Args(d.args.clone()));
            }
            None
        })
        .collect()
}

/// Normalise a scalar-or-list metadata value into a list of lowercased strings.
pub fn normalize_string_list(value: Option<&toml::Value>) -> Vec<String> {
    match value {
        None => Vec::new(),
        Some(toml::Value::Array(items)) => items
            .iter()
            .map(toml_scalar_text)
            .map(|item| item.to_lowercase())
            .collect(),
        Some(toml::Value::String(text)) => text
            .split(|c: char| c == ',' || c.is_whitespace())
            .filter(|part| !part.is_empty())
            .map(|part| part.trim().to_lowercase())
            .collect(),
        Some(other) => vec![toml_scalar_text(other).to_lowercase()],
    }
}

fn toml_scalar_text(value: &toml::Value) -> String {
    match value {
        toml::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Convert a JSON directive payload into a TOML value for merging.
pub fn json_to_toml(value: &serde_json::Value) -> toml::Value {
    use serde_json::Value;

    match value {
        Value::Null => toml::Value::String(String::new()),
        Value::Bool(b) => toml::Value::Boolean(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                toml::Value::Integer(i)
            } else {
                toml::Value::Float(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        Value::String(s) => toml::Value::String(s.clone()),
        Value::Array(items) => toml::Value::Array(items.iter().map(json_to_toml).collect()),
        Value::Object(map) => {
            let mut table = toml::Table::new();
            for (key, item) in map {
                table.insert(key.clone(), json_to_toml(item));
            }
            toml::Value::Table(table)
        }
    }
}

/// Merge a directive-contributed table into an existing metadata table:
/// lists append, absent keys are filled in, and present scalar keys are
/// left alone (structured metadata wins on conflicts).
pub fn merge_into_table(target: &mut toml::Table, incoming: &toml::Table) {
    for (key, value) in incoming {
        match target.get_mut(key) {
            None => {
                target.insert(key.clone(), value.clone());
            }
            Some(toml::Value::Array(existing)) => match value {
                toml::Value::Array(items) => existing.extend(items.iter().cloned()),
                other => existing.push(other.clone()),
            },
            Some(_) => {}
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn args(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn scans_directive_lines() {
        let sql = "-- @cache order_by=ts rows_per_page=5\nSELECT 1\n-- @meta {\"alpha\": 1}\n";
        let directives = scan_directives(sql);

        assert_eq!(directives.len(), 2);
        assert_eq!(directives[0].name, "cache");
        assert_eq!(
            directives[0].args,
            args(&[("order_by", "ts"), ("rows_per_page", "5")])
        );
        assert_eq!(directives[0].value, None);
        assert_eq!(directives[1].value.as_deref(), Some("{\"alpha\": 1}"));
    }

    #[test]
    fn payloads_filter_and_parse() {
        let directives = vec![
            RouteDirective {
                name: "meta".into(),
                args: BTreeMap::new(),
                value: Some("{\"alpha\": 1}".into()),
            },
            RouteDirective {
                name: "meta".into(),
                args: args(&[("foo", "bar")]),
                value: None,
            },
            RouteDirective {
                name: "meta".into(),
                args: BTreeMap::new(),
                value: Some("payload".into()),
            },
            RouteDirective {
                name: "meta".into(),
                args: BTreeMap::new(),
                value: None,
            },
            RouteDirective {
                name: "params".into(),
                args: BTreeMap::new(),
                value: Some("{\"ignored\": true}".into()),
            },
        ];

        let payloads = collect_directive_payloads(&directives, "meta");

        assert_eq!(
            payloads,
            vec![
                DirectivePayload::Json(serde_json::json!({"alpha": 1})),
                DirectivePayload::Args(args(&[("foo", "bar")])),
                DirectivePayload::Text("payload".into()),
            ]
        );
    }

    #[test]
    fn args_win_over_text_value() {
        let directives = vec![RouteDirective {
            name: "cache".into(),
            args: args(&[("order_by", "id")]),
            value: Some("stray".into()),
        }];

        let payloads = collect_directive_payloads(&directives, "cache");
        assert_eq!(payloads, vec![DirectivePayload::Args(args(&[("order_by", "id")]))]);
    }

    #[test]
    fn string_list_normalisation() {
        assert_eq!(normalize_string_list(None), Vec::<String>::new());
        assert_eq!(
            normalize_string_list(Some(&toml::Value::String("CSV JSON".into()))),
            vec!["csv", "json"]
        );
        assert_eq!(
            normalize_string_list(Some(&toml::Value::String("csv, json , arrow".into()))),
            vec!["csv", "json", "arrow"]
        );
        assert_eq!(
            normalize_string_list(Some(&toml::Value::Array(vec![
                toml::Value::String("CSV".into()),
                toml::Value::String("CSV".into()),
                toml::Value::String("ARROW".into()),
            ]))),
            vec!["csv", "csv", "arrow"]
        );
    }

    #[test]
    fn merging_prefers_structured_metadata() {
        let mut target = toml::Table::new();
        target.insert("order_by".into(), toml::Value::Array(vec!["id".into()]));
        target.insert("rows_per_page".into(), toml::Value::Integer(10));

        let mut incoming = toml::Table::new();
        incoming.insert("order_by".into(), toml::Value::Array(vec!["ts".into()]));
        incoming.insert("rows_per_page".into(), toml::Value::Integer(99));
        incoming.insert("profile".into(), toml::Value::String("hot".into()));

        merge_into_table(&mut target, &incoming);

        let order: Vec<_> = target["order_by"].as_array().unwrap().to_vec();
        assert_eq!(order.len(), 2);
        assert_eq!(target["rows_per_page"].as_integer(), Some(10));
        assert_eq!(target["profile"].as_str(), Some("hot"));
    }
}
