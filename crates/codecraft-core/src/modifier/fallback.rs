//! Restricted text fallback.
//!
//! Raw (`r"""..."""`) docstrings cannot be re-rendered from their decoded
//! value without risking a change in meaning, so they get a verbatim text
//! substitution instead. It is only allowed when the old and new text differ
//! in whitespace alone; the result is flagged `Confidence::Reduced` and still
//! goes through the post-check.

use crate::python::literal::StringParts;

fn squash(s: &str) -> String {
    s.chars().filter(|c| !c.is_whitespace()).collect()
}

/// New literal text for a whitespace-only docstring change, or `None` when
/// the change is not whitespace-only or cannot be expressed verbatim.
pub fn whitespace_only_rewrite(
    parts: &StringParts<'_>,
    current: &str,
    new: &str,
) -> Option<String> {
    if !parts.is_raw() || parts.prefix.contains(['b', 'B', 'f', 'F']) {
        return None;
    }
    if squash(current) != squash(new) {
        return None;
    }
    let quote_char = parts.quote.chars().next()?;
    let expressible = !new.contains(parts.quote)
        && !new.ends_with('\\')
        && !new.ends_with(quote_char)
        && (parts.is_triple() || !new.contains('\n'));
    if !expressible {
        return None;
    }
    Some(format!("{}{}{}{}", parts.prefix, parts.quote, new, parts.quote))
}
