//! Python source handling on top of `tree-sitter-python`.
//!
//! Everything that needs to understand the mutated code base goes through
//! this module: parsing, literal decoding, locating symbols and computing the
//! structural outline used for scope confinement.

pub mod literal;
pub mod locate;
pub mod outline;

use tree_sitter::{Node, Parser, Tree};

use crate::domain::error::{CodecraftError, Result};

pub use literal::literal_value;
pub use outline::{diff_outlines, Outline};

/// A parsed Python module together with its source text.
pub struct SourceFile {
    source: String,
    tree: Tree,
}

impl SourceFile {
    pub fn parse(source: impl Into<String>) -> Result<Self> {
        let source = source.into();
        let tree = parse_tree(&source)?;
        Ok(Self { source, tree })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn root(&self) -> Node<'_> {
        self.tree.root_node()
    }

    /// Text covered by `node`.
    pub fn text(&self, node: Node<'_>) -> &str {
        node_text(&self.source, node)
    }

    /// 1-based (line, column) of the first syntax error, if any.
    pub fn syntax_error(&self) -> Option<(usize, usize)> {
        let root = self.tree.root_node();
        if !root.has_error() {
            return None;
        }
        let node = innermost_error(root)?;
        // An ERROR node spans the tokens the parser skipped; the last one
        // is where it gave up.
        let at = if node.is_error() { last_leaf(node) } else { node };
        let p = at.start_position();
        Some((p.row + 1, p.column + 1))
    }
}

fn parse_tree(source: &str) -> Result<Tree> {
    let mut parser = Parser::new();
    parser
        .set_language(&tree_sitter_python::LANGUAGE.into())
        .map_err(|e| CodecraftError::Config(format!("python grammar unavailable: {e}")))?;
    parser
        .parse(source, None)
        .ok_or_else(|| CodecraftError::Config("tree-sitter parse was cancelled".to_string()))
}

/// Deepest ERROR or MISSING node along the first erroneous path.
fn innermost_error(node: Node<'_>) -> Option<Node<'_>> {
    let nested = children(node)
        .into_iter()
        .filter(|c| c.has_error() || c.is_missing())
        .find_map(innermost_error);
    nested.or_else(|| (node.is_error() || node.is_missing()).then_some(node))
}

fn last_leaf(mut node: Node<'_>) -> Node<'_> {
    while let Some(last) = children(node).last().copied() {
        node = last;
    }
    node
}

pub(crate) fn node_text<'s>(source: &'s str, node: Node<'_>) -> &'s str {
    source.get(node.start_byte()..node.end_byte()).unwrap_or_default()
}

pub(crate) fn named_children(node: Node<'_>) -> Vec<Node<'_>> {
    let mut cursor = node.walk();
    node.named_children(&mut cursor).collect()
}

pub(crate) fn children(node: Node<'_>) -> Vec<Node<'_>> {
    let mut cursor = node.walk();
    node.children(&mut cursor).collect()
}

/// Collapse whitespace runs so formatting-only differences compare equal.
pub(crate) fn normalize_ws(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// `source` with the given byte ranges cut out (ranges must be sorted and
/// non-overlapping).
pub(crate) fn text_excluding(
    source: &str,
    start: usize,
    end: usize,
    cut: &[(usize, usize)],
) -> String {
    let mut out = String::new();
    let mut pos = start;
    for &(a, b) in cut {
        if a < pos || b > end {
            continue;
        }
        out.push_str(source.get(pos..a).unwrap_or_default());
        pos = b;
    }
    out.push_str(source.get(pos..end).unwrap_or_default());
    out
}

/// Replace `source[start..end]` with `replacement`.
pub(crate) fn splice(source: &str, start: usize, end: usize, replacement: &str) -> String {
    let mut out = String::with_capacity(source.len() + replacement.len());
    out.push_str(&source[..start]);
    out.push_str(replacement);
    out.push_str(&source[end..]);
    out
}

/// Strip the common leading indentation from every non-blank line.
pub(crate) fn dedent(code: &str) -> String {
    let indent = code
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| l.len() - l.trim_start().len())
        .min()
        .unwrap_or(0);
    code.lines()
        .map(|l| l.get(indent..).unwrap_or_else(|| l.trim_start()))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_source_has_no_syntax_error() {
        let file = SourceFile::parse("class A:\n    x = 1\n").unwrap();
        assert!(file.syntax_error().is_none());
    }

    #[test]
    fn test_syntax_error_reports_position() {
        let file = SourceFile::parse("class A:\n    x = (1,\n").unwrap();
        let (line, _col) = file.syntax_error().unwrap();
        assert_eq!(line, 2);
    }

    #[test]
    fn test_syntax_error_after_valid_lines_is_not_at_top() {
        let file = SourceFile::parse("a = 1\nb = 2\nc = 3\nd = (4,\n").unwrap();
        let (line, _col) = file.syntax_error().unwrap();
        assert_eq!(line, 4);
    }

    #[test]
    fn test_dedent_keeps_relative_indent() {
        let code = "    def f(self):\n        return 1";
        assert_eq!(dedent(code), "def f(self):\n    return 1");
    }

    #[test]
    fn test_text_excluding_cuts_ranges() {
        let s = "abcdefgh";
        assert_eq!(text_excluding(s, 0, 8, &[(1, 3), (5, 6)]), "adegh");
    }
}
