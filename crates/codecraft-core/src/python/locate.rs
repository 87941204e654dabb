//! Structural lookups: classes, attributes, dict entries, docstrings.
//!
//! Lookups are exact and never fall back to text search. Only top-level
//! classes and functions and their direct members are addressable.

use tree_sitter::Node;

use super::literal::decode_string;
use super::{named_children, node_text, normalize_ws, SourceFile};
use crate::domain::error::SafetyViolation;
use crate::domain::spec::{ChangeType, TechnicalSpec};

/// Unwrap a `decorated_definition` to the class/function it decorates.
pub fn definition_of(node: Node<'_>) -> Node<'_> {
    if node.kind() == "decorated_definition" {
        node.child_by_field_name("definition").unwrap_or(node)
    } else {
        node
    }
}

/// Name of a class or function definition.
pub fn definition_name<'s>(source: &'s str, def: Node<'_>) -> Option<&'s str> {
    def.child_by_field_name("name").map(|n| node_text(source, n))
}

/// Statements of a module or block, skipping comments.
pub fn statements(container: Node<'_>) -> Vec<Node<'_>> {
    named_children(container)
        .into_iter()
        .filter(|n| n.kind() != "comment")
        .collect()
}

pub fn is_import(node: Node<'_>) -> bool {
    matches!(
        node.kind(),
        "import_statement" | "import_from_statement" | "future_import_statement"
    )
}

/// The `assignment` wrapped by an expression statement, if that is all it holds.
pub fn assignment_in(stmt: Node<'_>) -> Option<Node<'_>> {
    if stmt.kind() != "expression_statement" {
        return None;
    }
    match named_children(stmt).as_slice() {
        [a] if a.kind() == "assignment" => Some(*a),
        _ => None,
    }
}

/// Simple target name of `x = ...` / `x: T = ...`.
pub fn assigned_name<'s>(source: &'s str, assignment: Node<'_>) -> Option<&'s str> {
    let left = assignment.child_by_field_name("left")?;
    (left.kind() == "identifier").then(|| node_text(source, left))
}

/// Attribute name of `self.x = ...`.
pub fn self_attribute<'s>(source: &'s str, assignment: Node<'_>) -> Option<&'s str> {
    let left = assignment.child_by_field_name("left")?;
    if left.kind() != "attribute" {
        return None;
    }
    let object = left.child_by_field_name("object")?;
    let attr = left.child_by_field_name("attribute")?;
    (node_text(source, object) == "self").then(|| node_text(source, attr))
}

/// A top-level class definition by name.
pub fn find_class<'t>(source: &str, root: Node<'t>, name: &str) -> Option<Node<'t>> {
    statements(root)
        .into_iter()
        .map(definition_of)
        .find(|d| d.kind() == "class_definition" && definition_name(source, *d) == Some(name))
}

/// A function defined directly in `container` (module or class block).
pub fn find_function<'t>(source: &str, container: Node<'t>, name: &str) -> Option<Node<'t>> {
    statements(container)
        .into_iter()
        .map(definition_of)
        .find(|d| d.kind() == "function_definition" && definition_name(source, *d) == Some(name))
}

/// A simple-name assignment made directly in `container`. The last one
/// wins, matching Python's runtime binding.
pub fn find_assignment<'t>(source: &str, container: Node<'t>, name: &str) -> Option<Node<'t>> {
    statements(container)
        .into_iter()
        .filter_map(assignment_in)
        .filter(|a| assigned_name(source, *a) == Some(name))
        .last()
}

/// A `self.<attr> = ...` made directly in the body of `function`.
pub fn find_self_assignment<'t>(source: &str, function: Node<'t>, attr: &str) -> Option<Node<'t>> {
    let body = function.child_by_field_name("body")?;
    statements(body)
        .into_iter()
        .filter_map(assignment_in)
        .filter(|a| self_attribute(source, *a) == Some(attr))
        .last()
}

/// Decoded key of a dict-literal entry (`"a": 1` and `1: 1` both work).
pub fn dict_key_text(source: &str, key: Node<'_>) -> String {
    let raw = node_text(source, key);
    if key.kind() == "string" {
        if let Some(decoded) = decode_string(raw) {
            return decoded;
        }
    }
    normalize_ws(raw)
}

/// The `pair` for `key` in a dictionary literal.
pub fn find_dict_entry<'t>(source: &str, dict: Node<'t>, key: &str) -> Option<Node<'t>> {
    named_children(dict).into_iter().filter(|p| p.kind() == "pair").find(|p| {
        p.child_by_field_name("key")
            .is_some_and(|k| dict_key_text(source, k) == key)
    })
}

/// The docstring `string` node of a module or block, with its statement.
pub fn docstring_of(container: Node<'_>) -> Option<(Node<'_>, Node<'_>)> {
    let first = statements(container).into_iter().next()?;
    if first.kind() != "expression_statement" {
        return None;
    }
    match named_children(first).as_slice() {
        [s] if s.kind() == "string" => Some((first, *s)),
        _ => None,
    }
}

/// Where an attribute assignment was found in a class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttributeSite {
    ClassBody,
    InitSelf,
}

/// Class attribute lookup: the class body first, then `self.x` in `__init__`.
pub fn find_class_attribute<'t>(
    source: &str,
    class: Node<'t>,
    attr: &str,
) -> Option<(AttributeSite, Node<'t>)> {
    let body = class.child_by_field_name("body")?;
    if let Some(a) = find_assignment(source, body, attr) {
        return Some((AttributeSite::ClassBody, a));
    }
    let init = find_function(source, body, "__init__")?;
    find_self_assignment(source, init, attr).map(|a| (AttributeSite::InitSelf, a))
}

/// Where a new top-level import goes: after the last import, else after the
/// module docstring, else after leading comments (shebang, encoding).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImportSlot {
    pub offset: usize,
    /// Whether the statement must be preceded by a newline.
    pub after_node: bool,
}

pub fn import_slot(root: Node<'_>) -> ImportSlot {
    let stmts = statements(root);
    if let Some(last) = stmts.iter().filter(|n| is_import(**n)).last() {
        return ImportSlot {
            offset: last.end_byte(),
            after_node: true,
        };
    }
    if let Some((stmt, _)) = docstring_of(root) {
        return ImportSlot {
            offset: stmt.end_byte(),
            after_node: true,
        };
    }
    let leading_comment = named_children(root)
        .into_iter()
        .take_while(|n| n.kind() == "comment")
        .last();
    match leading_comment {
        Some(c) => ImportSlot {
            offset: c.end_byte(),
            after_node: true,
        },
        None => ImportSlot {
            offset: 0,
            after_node: false,
        },
    }
}

/// The resolved location a [`TechnicalSpec`] applies to.
#[derive(Debug, Clone, Copy)]
pub enum Target<'t> {
    /// A literal right-hand side (ParameterChange, ConfigUpdate).
    Literal { value: Node<'t> },
    /// A class body a method is appended to.
    ClassBody { class: Node<'t>, body: Node<'t> },
    /// A class header whose base list is replaced.
    Bases { class: Node<'t> },
    /// A module that receives a new import.
    Module { slot: ImportSlot },
    /// An existing docstring literal.
    Docstring { string: Node<'t> },
}

/// A resolved target plus the outline key the edit is allowed to touch.
#[derive(Debug, Clone)]
pub struct Located<'t> {
    pub target: Target<'t>,
    pub key: String,
}

/// Resolve the target of `spec` in `file`; fails closed when absent.
pub fn locate<'t>(
    file: &'t SourceFile,
    spec: &TechnicalSpec,
) -> Result<Located<'t>, SafetyViolation> {
    let source = file.source();
    let root = file.root();
    let missing = || SafetyViolation::SymbolNotFound(spec.symbol_path());
    let class = match spec.class_name() {
        Some(name) => Some(find_class(source, root, name).ok_or_else(missing)?),
        None => None,
    };
    let body_of = |def: Node<'t>| def.child_by_field_name("body").ok_or_else(missing);

    match spec.change_type() {
        ChangeType::ParameterChange | ChangeType::ConfigUpdate => {
            let attr = spec.attribute_name().ok_or_else(missing)?;
            match class {
                Some(class_node) => {
                    let class_name = spec.class_name().unwrap_or_default();
                    let (site, assignment) =
                        find_class_attribute(source, class_node, attr).ok_or_else(missing)?;
                    let value = assignment.child_by_field_name("right").ok_or_else(missing)?;
                    let key = match site {
                        AttributeSite::ClassBody => format!("{class_name}.{attr}"),
                        AttributeSite::InitSelf => format!("{class_name}.__init__.self.{attr}"),
                    };
                    Ok(Located {
                        target: Target::Literal { value },
                        key,
                    })
                }
                None => locate_module_value(source, root, attr).ok_or_else(missing),
            }
        }
        ChangeType::MethodAddition => {
            let class_node = class.ok_or_else(missing)?;
            let body = body_of(class_node)?;
            let name = spec.attribute_name().ok_or_else(missing)?;
            Ok(Located {
                target: Target::ClassBody {
                    class: class_node,
                    body,
                },
                key: format!("{}.{name}", spec.class_name().unwrap_or_default()),
            })
        }
        ChangeType::ClassModification => {
            let class_node = class.ok_or_else(missing)?;
            Ok(Located {
                target: Target::Bases { class: class_node },
                key: format!("{}.__bases__", spec.class_name().unwrap_or_default()),
            })
        }
        ChangeType::ImportAddition => Ok(Located {
            target: Target::Module {
                slot: import_slot(root),
            },
            key: format!("import:{}", normalize_ws(&spec.new_value().source_text())),
        }),
        ChangeType::DocstringUpdate => {
            let (container, key) = match (class, spec.attribute_name()) {
                (Some(class_node), Some(method)) => {
                    let body = body_of(class_node)?;
                    let f = find_function(source, body, method).ok_or_else(missing)?;
                    (
                        body_of(f)?,
                        format!("{}.{method}.__doc__", spec.class_name().unwrap_or_default()),
                    )
                }
                (Some(class_node), None) => (
                    body_of(class_node)?,
                    format!("{}.__doc__", spec.class_name().unwrap_or_default()),
                ),
                (None, Some(func)) => {
                    let f = find_function(source, root, func).ok_or_else(missing)?;
                    (body_of(f)?, format!("{func}.__doc__"))
                }
                (None, None) => (root, "__doc__".to_string()),
            };
            let (_, string) = docstring_of(container).ok_or_else(missing)?;
            Ok(Located {
                target: Target::Docstring { string },
                key,
            })
        }
    }
}

fn locate_module_value<'t>(source: &str, root: Node<'t>, attr: &str) -> Option<Located<'t>> {
    if let Some(assignment) = find_assignment(source, root, attr) {
        let value = assignment.child_by_field_name("right")?;
        return Some(Located {
            target: Target::Literal { value },
            key: attr.to_string(),
        });
    }
    let (dict_name, key) = attr.split_once('.')?;
    let assignment = find_assignment(source, root, dict_name)?;
    let dict = assignment.child_by_field_name("right")?;
    if dict.kind() != "dictionary" {
        return None;
    }
    let pair = find_dict_entry(source, dict, key)?;
    Some(Located {
        target: Target::Literal {
            value: pair.child_by_field_name("value")?,
        },
        key: format!("{dict_name}[{key}]"),
    })
}
