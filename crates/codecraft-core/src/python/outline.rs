//! Structural outline of a module, used to prove an edit stayed in scope.
//!
//! An [`Outline`] maps symbol keys to normalized source text:
//!
//! | key                         | covers                                     |
//! |-----------------------------|--------------------------------------------|
//! | `__doc__`                   | module docstring (raw)                     |
//! | `import:<stmt>`             | one top-level import                       |
//! | `NAME` / `NAME[key]`        | module assignment / dict-literal entry     |
//! | `func`, `func.__doc__`      | module function (minus docstring)          |
//! | `Class`, `Class.__bases__`  | class header, base-class list              |
//! | `Class.attr`                | class-body assignment                      |
//! | `Class.meth`                | method (minus docstring, minus `self.x =`) |
//! | `Class.__init__.self.attr`  | `self.attr = ...` in `__init__`            |
//! | `stmt:<text>`               | any other statement                        |
//!
//! Docstrings keep their raw text so whitespace-only edits are visible.

use std::collections::BTreeMap;

use tree_sitter::Node;

use super::locate::{
    assigned_name, assignment_in, definition_name, definition_of, dict_key_text, docstring_of,
    is_import, self_attribute, statements,
};
use super::{named_children, node_text, normalize_ws, text_excluding, SourceFile};

/// Symbol key → normalized text.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Outline {
    entries: BTreeMap<String, String>,
}

impl Outline {
    pub fn build(file: &SourceFile) -> Self {
        let mut outline = Outline::default();
        let source = file.source();
        let root = file.root();

        let doc_stmt = docstring_of(root).map(|(stmt, string)| {
            outline.insert("__doc__".to_string(), node_text(source, string).to_string());
            stmt.id()
        });

        for stmt in statements(root) {
            if Some(stmt.id()) == doc_stmt {
                continue;
            }
            let def = definition_of(stmt);
            match def.kind() {
                _ if is_import(stmt) => {
                    let text = normalize_ws(node_text(source, stmt));
                    outline.insert(format!("import:{text}"), text);
                }
                "class_definition" => outline.add_class(source, stmt, def),
                "function_definition" => {
                    let name = definition_name(source, def).unwrap_or_default().to_string();
                    outline.add_function(source, &name, stmt, def, &[]);
                }
                _ => match assignment_in(stmt) {
                    Some(a) => outline.add_module_assignment(source, stmt, a),
                    None => {
                        let text = normalize_ws(node_text(source, stmt));
                        outline.insert(format!("stmt:{text}"), text);
                    }
                },
            }
        }
        outline
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn insert(&mut self, key: String, text: String) {
        if !self.entries.contains_key(&key) {
            self.entries.insert(key, text);
            return;
        }
        let mut n = 2;
        while self.entries.contains_key(&format!("{key}#{n}")) {
            n += 1;
        }
        self.entries.insert(format!("{key}#{n}"), text);
    }

    fn add_module_assignment(&mut self, source: &str, stmt: Node<'_>, assignment: Node<'_>) {
        let Some(name) = assigned_name(source, assignment) else {
            let text = normalize_ws(node_text(source, stmt));
            self.insert(format!("stmt:{text}"), text);
            return;
        };
        match assignment.child_by_field_name("right") {
            Some(dict) if dict.kind() == "dictionary" => {
                // Entry values get their own keys; the header keeps the key set.
                let mut shape = Vec::new();
                for child in named_children(dict) {
                    if child.kind() == "pair" {
                        let key = child
                            .child_by_field_name("key")
                            .map(|k| dict_key_text(source, k))
                            .unwrap_or_default();
                        let value = child
                            .child_by_field_name("value")
                            .map(|v| normalize_ws(node_text(source, v)))
                            .unwrap_or_default();
                        self.insert(format!("{name}[{key}]"), value);
                        shape.push(key);
                    } else if child.kind() != "comment" {
                        shape.push(normalize_ws(node_text(source, child)));
                    }
                }
                let header = normalize_ws(&text_excluding(
                    source,
                    stmt.start_byte(),
                    stmt.end_byte(),
                    &[(dict.start_byte(), dict.end_byte())],
                ));
                self.insert(name.to_string(), format!("{header}{{{}}}", shape.join(", ")));
            }
            _ => self.insert(name.to_string(), normalize_ws(node_text(source, stmt))),
        }
    }

    /// `cut` lists extra byte ranges excluded from the function's own text.
    fn add_function(
        &mut self,
        source: &str,
        key: &str,
        stmt: Node<'_>,
        def: Node<'_>,
        cut: &[(usize, usize)],
    ) {
        let mut ranges: Vec<(usize, usize)> = cut.to_vec();
        if let Some((doc_stmt, string)) = def.child_by_field_name("body").and_then(docstring_of) {
            self.insert(
                format!("{key}.__doc__"),
                node_text(source, string).to_string(),
            );
            ranges.push((doc_stmt.start_byte(), doc_stmt.end_byte()));
        }
        ranges.sort_unstable();
        let text = text_excluding(source, stmt.start_byte(), stmt.end_byte(), &ranges);
        self.insert(key.to_string(), normalize_ws(&text));
    }

    fn add_class(&mut self, source: &str, stmt: Node<'_>, class: Node<'_>) {
        let Some(name) = definition_name(source, class) else {
            return;
        };
        let name = name.to_string();
        let header_end = class
            .child_by_field_name("name")
            .map(|n| n.start_byte())
            .unwrap_or_else(|| class.start_byte());
        // Decorators plus `class Name`; the base list has its own key.
        let header = source.get(stmt.start_byte()..header_end).unwrap_or_default();
        self.insert(name.clone(), normalize_ws(&format!("{header}{name}")));
        let bases = class
            .child_by_field_name("superclasses")
            .map(|b| normalize_ws(node_text(source, b)))
            .unwrap_or_default();
        self.insert(format!("{name}.__bases__"), bases);

        let Some(body) = class.child_by_field_name("body") else {
            return;
        };
        let doc_stmt = docstring_of(body).map(|(stmt, string)| {
            self.insert(
                format!("{name}.__doc__"),
                node_text(source, string).to_string(),
            );
            stmt.id()
        });

        for member in statements(body) {
            if Some(member.id()) == doc_stmt {
                continue;
            }
            let def = definition_of(member);
            match def.kind() {
                "function_definition" => {
                    let method = definition_name(source, def).unwrap_or_default();
                    let key = format!("{name}.{method}");
                    let mut cut = Vec::new();
                    if method == "__init__" {
                        for (attr, init_stmt) in self_assignments(source, def) {
                            self.insert(
                                format!("{name}.__init__.self.{attr}"),
                                normalize_ws(node_text(source, init_stmt)),
                            );
                            cut.push((init_stmt.start_byte(), init_stmt.end_byte()));
                        }
                    }
                    self.add_function(source, &key, member, def, &cut);
                }
                "class_definition" => {
                    let inner = definition_name(source, def).unwrap_or_default();
                    self.insert(
                        format!("{name}.{inner}"),
                        normalize_ws(node_text(source, member)),
                    );
                }
                _ => {
                    let text = normalize_ws(node_text(source, member));
                    match assignment_in(member).and_then(|a| assigned_name(source, a)) {
                        Some(attr) => self.insert(format!("{name}.{attr}"), text),
                        None => self.insert(format!("{name}.stmt:{text}"), text),
                    }
                }
            }
        }
    }
}

fn self_assignments<'s, 't>(source: &'s str, function: Node<'t>) -> Vec<(&'s str, Node<'t>)> {
    let Some(body) = function.child_by_field_name("body") else {
        return Vec::new();
    };
    statements(body)
        .into_iter()
        .filter_map(|stmt| {
            let attr = assignment_in(stmt).and_then(|a| self_attribute(source, a))?;
            Some((attr, stmt))
        })
        .collect()
}

/// Keys whose text differs between `before` and `after` (added, removed or
/// changed), sorted.
pub fn diff_outlines(before: &Outline, after: &Outline) -> Vec<String> {
    let mut changed: Vec<String> = before
        .entries
        .iter()
        .filter(|(k, v)| after.entries.get(*k) != Some(*v))
        .map(|(k, _)| k.clone())
        .collect();
    changed.extend(
        after
            .entries
            .keys()
            .filter(|k| !before.entries.contains_key(*k))
            .cloned(),
    );
    changed.sort();
    changed.dedup();
    changed
}

/// Whether `key` falls under `expected` (the key itself or one nested below it).
pub fn key_within(key: &str, expected: &str) -> bool {
    key == expected
        || key
            .strip_prefix(expected)
            .is_some_and(|rest| rest.starts_with('.'))
}
