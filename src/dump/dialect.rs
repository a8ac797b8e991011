//! Row framing rules for the output dialect (spec §4.1 "Writer").

use crate::config::{BinaryEncoding, Dialect, DialectOptions};
use crate::session::{ColumnType, Value};

/// Encode one field per the dialect's terminators, quoting, escaping and
/// optional enclosing rules. Binary-like columns are rendered hex/base64
/// rather than raw, per `binary_encoding`.
pub fn encode_field(
    value: &Value,
    column_type: ColumnType,
    dialect: Dialect,
    opts: &DialectOptions,
    binary_encoding: BinaryEncoding,
) -> String {
    if value.is_null() {
        return match dialect {
            Dialect::Json => "null".to_string(),
            _ => String::new(),
        };
    }

    if column_type.is_encoding_unsafe() {
        if let Value::Bytes(bytes) = value {
            let encoded = match binary_encoding {
                BinaryEncoding::Hex => hex_encode(bytes),
                BinaryEncoding::Base64 => base64::encode(bytes),
            };
            return quote_if_needed(&encoded, dialect, opts);
        }
    }

    let raw = render_scalar(value);
    match dialect {
        Dialect::Json => json_escape(&raw),
        _ => quote_and_escape(&raw, dialect, opts),
    }
}

fn render_scalar(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Int(i) => i.to_string(),
        Value::UInt(u) => u.to_string(),
        Value::Float(f) => f.to_string(),
        Value::Text(s) => s.clone(),
        Value::Bytes(b) => String::from_utf8_lossy(b).into_owned(),
    }
}

fn quote_if_needed(s: &str, dialect: Dialect, opts: &DialectOptions) -> String {
    match dialect {
        Dialect::Json => json_escape(s),
        _ => quote_and_escape(s, dialect, opts),
    }
}

fn quote_and_escape(s: &str, dialect: Dialect, opts: &DialectOptions) -> String {
    let needs_quote = opts.enclosing_char.is_some()
        && (s.contains(opts.field_terminator.as_str())
            || s.contains(opts.line_terminator.as_str())
            || opts.enclosing_char.map_or(false, |c| s.contains(c)));

    match (dialect, opts.enclosing_char) {
        (_, Some(quote)) if needs_quote || dialect == Dialect::Csv => {
            let escaped = s.replace(quote, &format!("{}{}", quote, quote));
            format!("{}{}{}", quote, escaped, quote)
        }
        _ => {
            if let Some(escape) = opts.escape_char {
                s.replace(escape, &format!("{}{}", escape, escape))
                    .replace(opts.field_terminator.as_str(), &format!("{}{}", escape, opts.field_terminator))
            } else {
                s.to_string()
            }
        }
    }
}

fn json_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => out.push_str(&format!("\\u{:04x}", c as u32)),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        s.push_str(&format!("{:02x}", b));
    }
    s
}

/// File extension for a dialect, used when naming chunk data files
/// (spec §6 "Output directory layout").
pub fn extension(dialect: Dialect) -> &'static str {
    match dialect {
        Dialect::Csv => "csv",
        Dialect::Tsv => "tsv",
        Dialect::Json => "json",
        Dialect::Custom => "txt",
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::{BinaryEncoding, Dialect, DialectOptions};

    #[test]
    fn null_is_empty_in_csv() {
        let opts = DialectOptions::for_dialect(Dialect::Csv);
        let s = encode_field(&Value::Null, ColumnType::Integer, Dialect::Csv, &opts, BinaryEncoding::Hex);
        assert_eq!(s, "");
    }

    #[test]
    fn null_is_literal_in_json() {
        let opts = DialectOptions::for_dialect(Dialect::Json);
        let s = encode_field(&Value::Null, ColumnType::Integer, Dialect::Json, &opts, BinaryEncoding::Hex);
        assert_eq!(s, "null");
    }

    #[test]
    fn binary_column_is_hex_encoded() {
        let opts = DialectOptions::for_dialect(Dialect::Tsv);
        let s = encode_field(
            &Value::Bytes(vec![0xde, 0xad, 0xbe, 0xef]),
            ColumnType::Binary,
            Dialect::Tsv,
            &opts,
            BinaryEncoding::Hex,
        );
        assert_eq!(s, "deadbeef");
    }

    #[test]
    fn csv_quotes_fields_containing_comma() {
        let opts = DialectOptions::for_dialect(Dialect::Csv);
        let s = encode_field(
            &Value::Text("a,b".into()),
            ColumnType::String,
            Dialect::Csv,
            &opts,
            BinaryEncoding::Hex,
        );
        assert_eq!(s, "\"a,b\"");
    }
}
