//! Invariant value tokens.
//!
//! Tokens encode value identity inside the invariant index: `__null__` for
//! null, `str:` / `num:` / `bool:` / `datetime:` prefixes for typed values.
//! Normalisation lowercases when the invariant declares `case_insensitive`
//! and splits list-valued parameters on the declared separator.

use arrow::array::ArrayRef;
use arrow::datatypes::DataType;

use crate::route::{canonical_float, InvariantFilterSetting, ParamValue};
use crate::table::cell_text;

pub const NULL_TOKEN: &str = "__null__";

/// Token(s) for a supplied parameter value, honouring the invariant's
/// separator and case settings. Null yields no constraining tokens.
pub fn param_tokens(value: &ParamValue, setting: &InvariantFilterSetting) -> Vec<String> {
    match value {
        ParamValue::Null => Vec::new(),
        ParamValue::Str(text) => match &setting.separator {
            Some(sep) if !sep.is_empty() => text
                .split(sep.as_str())
                .map(str::trim)
                .filter(|part| !part.is_empty())
                .map(|part| string_token(part, setting.case_insensitive))
                .collect(),
            _ => vec![string_token(text, setting.case_insensitive)],
        },
        ParamValue::Int(n) => vec![format!("num:{n}")],
        ParamValue::Float(f) => vec![format!("num:{}", canonical_float(*f))],
        ParamValue::Bool(b) => vec![format!("bool:{b}")],
        ParamValue::Date(_) | ParamValue::Datetime(_) => {
            vec![format!("datetime:{}", value.canonical_text().unwrap())]
        }
    }
}

/// Token for one cell of an invariant column, paired with the original-case
/// sample text. Uses the same normalisation as [`param_tokens`] so that page
/// lookups and in-page filters agree.
pub fn cell_token(array: &ArrayRef, row: usize, case_insensitive: bool) -> (String, String) {
    let Some(text) = cell_text(array, row) else {
        return (NULL_TOKEN.to_owned(), String::new());
    };

    let token = match array.data_type() {
        DataType::Boolean => format!("bool:{text}"),
        DataType::Int8
        | DataType::Int16
        | DataType::Int32
        | DataType::Int64
        | DataType::UInt8
        | DataType::UInt16
        | DataType::UInt32
        | DataType::UInt64 => format!("num:{text}"),
        DataType::Float16 | DataType::Float32 | DataType::Float64 => {
            match text.parse::<f64>() {
                Ok(f) => format!("num:{}", canonical_float(f)),
                Err(_) => format!("num:{text}"),
            }
        }
        DataType::Date32 | DataType::Date64 | DataType::Timestamp(_, _) => {
            format!("datetime:{text}")
        }
        _ => string_token(&text, case_insensitive),
    };

    (token, text)
}

fn string_token(text: &str, case_insensitive: bool) -> String {
    let escaped = text.replace('\\', "\\\\").replace('\n', "\\n");

    match case_insensitive {
        true => format!("str:{}", escaped.to_lowercase()),
        false => format!("str:{escaped}"),
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use arrow::array::{Int64Array, StringArray};

    use super::*;

    fn setting(separator: Option<&str>, case_insensitive: bool) -> InvariantFilterSetting {
        InvariantFilterSetting {
            param: "p".into(),
            column: "p".into(),
            separator: separator.map(str::to_owned),
            case_insensitive,
        }
    }

    #[test]
    fn null_yields_no_tokens() {
        assert!(param_tokens(&ParamValue::Null, &setting(None, false)).is_empty());
    }

    #[test]
    fn separator_splits_into_a_token_set() {
        let tokens = param_tokens(
            &ParamValue::Str("widget, gadget".into()),
            &setting(Some(","), false),
        );

        assert_eq!(tokens, vec!["str:widget", "str:gadget"]);
    }

    #[test]
    fn case_insensitive_normalises() {
        let tokens = param_tokens(&ParamValue::Str("Widget".into()), &setting(None, true));
        assert_eq!(tokens, vec!["str:widget"]);
    }

    #[test]
    fn numeric_tokens_are_canonical() {
        assert_eq!(
            param_tokens(&ParamValue::Float(2.0), &setting(None, false)),
            vec!["num:2"]
        );
        assert_eq!(
            param_tokens(&ParamValue::Int(2), &setting(None, false)),
            vec!["num:2"]
        );
    }

    #[test]
    fn cell_tokens_match_param_tokens() {
        let strings: ArrayRef = Arc::new(StringArray::from(vec![Some("Widget"), None]));
        let (token, sample) = cell_token(&strings, 0, true);

        assert_eq!(token, "str:widget");
        assert_eq!(sample, "Widget");
        assert_eq!(cell_token(&strings, 1, true).0, NULL_TOKEN);

        let numbers: ArrayRef = Arc::new(Int64Array::from(vec![7]));
        assert_eq!(cell_token(&numbers, 0, false).0, "num:7");
        assert_eq!(
            param_tokens(&ParamValue::Int(7), &setting(None, false))[0],
            "num:7"
        );
    }
}
