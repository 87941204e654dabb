//! Decoding and rendering of Python literal expressions.

use tree_sitter::Node;

use super::{named_children, node_text};
use crate::domain::spec::{parse_float, parse_int, quote_python_str, Value};

/// Decode the literal at `node`, or `None` when the expression is not a
/// plain literal (names, calls, f-strings, bytes, ...).
pub fn literal_value(source: &str, node: Node<'_>) -> Option<Value> {
    let text = node_text(source, node);
    match node.kind() {
        "integer" => parse_int(text).map(Value::Int),
        "float" => parse_float(text).map(Value::Float),
        "true" => Some(Value::Bool(true)),
        "false" => Some(Value::Bool(false)),
        "none" => Some(Value::None),
        "string" => decode_string(text).map(Value::Str),
        "unary_operator" => {
            let op = node.child_by_field_name("operator")?;
            let arg = literal_value(source, node.child_by_field_name("argument")?)?;
            match (node_text(source, op), arg) {
                ("-", Value::Int(i)) => i.checked_neg().map(Value::Int),
                ("-", Value::Float(f)) => Some(Value::Float(-f)),
                ("+", v @ (Value::Int(_) | Value::Float(_))) => Some(v),
                _ => None,
            }
        }
        "parenthesized_expression" => match named_children(node).as_slice() {
            [inner] => literal_value(source, *inner),
            _ => None,
        },
        _ => None,
    }
}

/// The pieces of a string literal's source text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StringParts<'a> {
    pub prefix: &'a str,
    pub quote: &'a str,
    pub inner: &'a str,
}

impl StringParts<'_> {
    pub fn is_raw(&self) -> bool {
        self.prefix.contains(['r', 'R'])
    }

    /// Prefixes other than `u` change how the body is interpreted.
    pub fn has_semantic_prefix(&self) -> bool {
        self.prefix.chars().any(|c| !matches!(c, 'u' | 'U'))
    }

    pub fn is_triple(&self) -> bool {
        self.quote.len() == 3
    }
}

/// Split a string literal into prefix, delimiter and raw body.
pub fn split_string(text: &str) -> Option<StringParts<'_>> {
    let prefix_len = text.find(['"', '\''])?;
    let (prefix, body) = text.split_at(prefix_len);
    if !prefix.chars().all(|c| "rRuUbBfF".contains(c)) {
        return None;
    }
    let quote = ["\"\"\"", "'''", "\"", "'"]
        .into_iter()
        .find(|q| body.len() >= 2 * q.len() && body.starts_with(q) && body.ends_with(q))?;
    let inner = &body[quote.len()..body.len() - quote.len()];
    Some(StringParts {
        prefix,
        quote,
        inner,
    })
}

/// Decode a (non-f, non-bytes) string literal to its value.
pub fn decode_string(text: &str) -> Option<String> {
    let parts = split_string(text)?;
    if parts.prefix.contains(['f', 'F', 'b', 'B']) {
        return None;
    }
    if parts.is_raw() {
        return Some(parts.inner.to_string());
    }
    unescape(parts.inner)
}

fn unescape(body: &str) -> Option<String> {
    let mut out = String::with_capacity(body.len());
    let mut chars = body.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        let Some(esc) = chars.next() else {
            out.push('\\');
            break;
        };
        match esc {
            '\n' => {}
            '\\' => out.push('\\'),
            '\'' => out.push('\''),
            '"' => out.push('"'),
            'n' => out.push('\n'),
            't' => out.push('\t'),
            'r' => out.push('\r'),
            'a' => out.push('\u{07}'),
            'b' => out.push('\u{08}'),
            'f' => out.push('\u{0c}'),
            'v' => out.push('\u{0b}'),
            'x' | 'u' | 'U' => {
                let width = match esc {
                    'x' => 2,
                    'u' => 4,
                    _ => 8,
                };
                let hex: String = (0..width).filter_map(|_| chars.next()).collect();
                let code = u32::from_str_radix(&hex, 16).ok()?;
                out.push(char::from_u32(code)?);
            }
            '0'..='7' => {
                let mut oct = String::from(esc);
                while oct.len() < 3 {
                    match chars.peek() {
                        Some(d @ '0'..='7') => {
                            oct.push(*d);
                            chars.next();
                        }
                        _ => break,
                    }
                }
                let code = u32::from_str_radix(&oct, 8).ok()?;
                out.push(char::from_u32(code)?);
            }
            // \N{NAME} needs the unicode name database.
            'N' => return None,
            other => {
                out.push('\\');
                out.push(other);
            }
        }
    }
    Some(out)
}

/// Render `value` as a string literal using the delimiter style of an
/// existing literal.
pub fn render_string_like(existing: &StringParts<'_>, value: &str) -> String {
    let prefix = if existing.prefix.contains(['u', 'U']) && !existing.has_semantic_prefix() {
        existing.prefix
    } else {
        ""
    };
    if existing.is_triple() {
        let q = existing.quote;
        let qc = q.chars().next().unwrap_or('"');
        let mut escaped = value.replace('\\', "\\\\").replace(q, &format!("\\{qc}\\{qc}\\{qc}"));
        if escaped.ends_with(qc) {
            escaped.pop();
            escaped.push('\\');
            escaped.push(qc);
        }
        format!("{prefix}{q}{escaped}{q}")
    } else {
        let qc = existing.quote.chars().next().unwrap_or('"');
        format!("{prefix}{}", quote_python_str(value, qc))
    }
}

/// Render `value` in place of an existing literal, keeping its quote style
/// for strings.
pub fn render_replacing(existing_text: &str, value: &Value) -> String {
    match (value, split_string(existing_text)) {
        (Value::Str(s), Some(parts)) if !parts.has_semantic_prefix() => {
            render_string_like(&parts, s)
        }
        (Value::Str(s), _) => quote_python_str(s, '"'),
        (other, _) => other.python_literal(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::python::SourceFile;

    fn value_of(expr: &str) -> Option<Value> {
        let file = SourceFile::parse(format!("x = {expr}\n")).unwrap();
        let stmt = named_children(file.root())[0];
        let assign = named_children(stmt)[0];
        let right = assign.child_by_field_name("right").unwrap();
        literal_value(file.source(), right)
    }

    #[test]
    fn test_scalar_literals() {
        assert_eq!(value_of("0.3"), Some(Value::Float(0.3)));
        assert_eq!(value_of("-5"), Some(Value::Int(-5)));
        assert_eq!(value_of("1_000"), Some(Value::Int(1000)));
        assert_eq!(value_of("True"), Some(Value::Bool(true)));
        assert_eq!(value_of("None"), Some(Value::None));
        assert_eq!(value_of("'fast'"), Some(Value::Str("fast".into())));
    }

    #[test]
    fn test_non_literals_are_rejected() {
        assert_eq!(value_of("compute()"), None);
        assert_eq!(value_of("f'{x}'"), None);
        assert_eq!(value_of("b'raw'"), None);
        assert_eq!(value_of("OTHER"), None);
    }

    #[test]
    fn test_escapes_decode() {
        assert_eq!(decode_string(r#""a\nb\x41""#), Some("a\nbA".to_string()));
        assert_eq!(decode_string(r#"r"a\nb""#), Some(r"a\nb".to_string()));
        assert_eq!(decode_string(r#""""doc""""#), Some("doc".to_string()));
    }

    #[test]
    fn test_render_keeps_quote_style() {
        assert_eq!(render_replacing("'slow'", &Value::Str("fast".into())), "'fast'");
        let parts = split_string("\"\"\"Old.\"\"\"").unwrap();
        assert_eq!(render_string_like(&parts, "New."), "\"\"\"New.\"\"\"");
        assert_eq!(render_replacing("0.3", &Value::Float(0.65)), "0.65");
    }
}
