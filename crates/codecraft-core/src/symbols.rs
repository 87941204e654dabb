//! Index of addressable Python symbols under the allowed source root.
//!
//! The parser uses it to resolve a proposal that names only a class or an
//! attribute to a concrete file.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::debug;
use walkdir::{DirEntry, WalkDir};

use crate::domain::spec::Value;
use crate::python::locate::{
    assigned_name, assignment_in, definition_name, definition_of, dict_key_text, self_attribute,
    statements,
};
use crate::python::{literal_value, named_children, SourceFile};

const SKIPPED_DIRS: &[&str] = &[
    "__pycache__",
    "venv",
    "env",
    "node_modules",
    "build",
    "dist",
    "codecraft_generated",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SymbolKind {
    Class,
    ClassAttribute,
    InitAttribute,
    Method,
    Function,
    ModuleAssignment,
    DictEntry,
}

impl SymbolKind {
    pub fn is_class_attribute(&self) -> bool {
        matches!(self, SymbolKind::ClassAttribute | SymbolKind::InitAttribute)
    }
}

/// One addressable symbol.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Symbol {
    /// Repository-relative path with `/` separators.
    pub file: String,
    pub class: Option<String>,
    /// Attribute, method or module name; `DICT.key` for dict entries.
    pub name: String,
    pub kind: SymbolKind,
    /// Current literal value, when the symbol is a literal assignment.
    pub value: Option<Value>,
    /// 1-based line of the definition.
    pub line: usize,
}

/// Symbols of every indexed file.
#[derive(Debug, Clone, Default)]
pub struct SymbolIndex {
    symbols: Vec<Symbol>,
}

impl SymbolIndex {
    /// Walk `source_root` (inside `repo_root`) and index every module.
    /// Test modules, hidden directories and virtualenvs are skipped;
    /// unreadable or non-UTF-8 files are ignored.
    pub fn build(repo_root: &Path, source_root: &Path) -> Self {
        let mut index = SymbolIndex::default();
        let walker = WalkDir::new(source_root)
            .follow_links(false)
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || !is_skipped_dir(e));
        for entry in walker.filter_map(|e| e.ok()) {
            if !entry.file_type().is_file() || !is_indexed_module(entry.path()) {
                continue;
            }
            let Ok(rel) = entry.path().strip_prefix(repo_root) else {
                continue;
            };
            let Ok(source) = fs::read_to_string(entry.path()) else {
                debug!(path = %entry.path().display(), "skipping unreadable module");
                continue;
            };
            index.add_module(&to_slash(rel), source);
        }
        debug!(symbols = index.symbols.len(), "symbol index built");
        index
    }

    /// Index a single module's source under `file`.
    pub fn add_module(&mut self, file: &str, source: String) {
        let Ok(parsed) = SourceFile::parse(source) else {
            return;
        };
        let src = parsed.source();
        let line = |n: tree_sitter::Node<'_>| n.start_position().row + 1;
        let mut push = |class: Option<&str>, name: &str, kind, value, at| {
            self.symbols.push(Symbol {
                file: file.to_string(),
                class: class.map(str::to_string),
                name: name.to_string(),
                kind,
                value,
                line: at,
            })
        };

        for stmt in statements(parsed.root()) {
            let def = definition_of(stmt);
            match def.kind() {
                "class_definition" => {
                    let Some(class) = definition_name(src, def) else {
                        continue;
                    };
                    push(None, class, SymbolKind::Class, None, line(def));
                    let Some(body) = def.child_by_field_name("body") else {
                        continue;
                    };
                    for member in statements(body) {
                        let member_def = definition_of(member);
                        if member_def.kind() == "function_definition" {
                            let Some(method) = definition_name(src, member_def) else {
                                continue;
                            };
                            push(Some(class), method, SymbolKind::Method, None, line(member_def));
                            if method == "__init__" {
                                for (attr, a) in init_assignments(src, member_def) {
                                    let value = a
                                        .child_by_field_name("right")
                                        .and_then(|r| literal_value(src, r));
                                    push(
                                        Some(class),
                                        attr,
                                        SymbolKind::InitAttribute,
                                        value,
                                        line(a),
                                    );
                                }
                            }
                        } else if let Some(a) = assignment_in(member) {
                            if let Some(attr) = assigned_name(src, a) {
                                let value = a
                                    .child_by_field_name("right")
                                    .and_then(|r| literal_value(src, r));
                                push(Some(class), attr, SymbolKind::ClassAttribute, value, line(a));
                            }
                        }
                    }
                }
                "function_definition" => {
                    if let Some(name) = definition_name(src, def) {
                        push(None, name, SymbolKind::Function, None, line(def));
                    }
                }
                _ => {
                    let Some(a) = assignment_in(stmt) else {
                        continue;
                    };
                    let Some(name) = assigned_name(src, a) else {
                        continue;
                    };
                    let right = a.child_by_field_name("right");
                    push(
                        None,
                        name,
                        SymbolKind::ModuleAssignment,
                        right.and_then(|r| literal_value(src, r)),
                        line(a),
                    );
                    if let Some(dict) = right.filter(|r| r.kind() == "dictionary") {
                        for pair in named_children(dict).into_iter().filter(|p| p.kind() == "pair") {
                            let Some(key) = pair.child_by_field_name("key") else {
                                continue;
                            };
                            let value = pair
                                .child_by_field_name("value")
                                .and_then(|v| literal_value(src, v));
                            let dotted = format!("{name}.{}", dict_key_text(src, key));
                            push(None, &dotted, SymbolKind::DictEntry, value, line(pair));
                        }
                    }
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    pub fn symbols(&self) -> &[Symbol] {
        &self.symbols
    }

    /// Files defining a top-level class named `class`, deduplicated.
    pub fn files_defining_class(&self, class: &str) -> Vec<&str> {
        let mut files: Vec<&str> = self
            .symbols
            .iter()
            .filter(|s| s.kind == SymbolKind::Class && s.name == class)
            .map(|s| s.file.as_str())
            .collect();
        files.sort_unstable();
        files.dedup();
        files
    }

    /// Class attributes named `attr`, optionally restricted to a class
    /// and/or a file.
    pub fn class_attributes(
        &self,
        attr: &str,
        class: Option<&str>,
        file: Option<&str>,
    ) -> Vec<&Symbol> {
        self.symbols
            .iter()
            .filter(|s| s.kind.is_class_attribute() && s.name == attr)
            .filter(|s| class.is_none() || s.class.as_deref() == class)
            .filter(|s| file.is_none() || Some(s.file.as_str()) == file)
            .collect()
    }

    /// Module-level names (or `DICT.key` entries) named `name`.
    pub fn module_values(&self, name: &str, file: Option<&str>) -> Vec<&Symbol> {
        self.symbols
            .iter()
            .filter(|s| {
                matches!(s.kind, SymbolKind::ModuleAssignment | SymbolKind::DictEntry)
                    && s.name == name
            })
            .filter(|s| file.is_none() || Some(s.file.as_str()) == file)
            .collect()
    }

    /// Files that define a module-level function named `name`.
    pub fn files_defining_function(&self, name: &str) -> Vec<&str> {
        self.symbols
            .iter()
            .filter(|s| s.kind == SymbolKind::Function && s.name == name)
            .map(|s| s.file.as_str())
            .collect()
    }
}

fn init_assignments<'s, 't>(
    source: &'s str,
    init: tree_sitter::Node<'t>,
) -> Vec<(&'s str, tree_sitter::Node<'t>)> {
    let Some(body) = init.child_by_field_name("body") else {
        return Vec::new();
    };
    statements(body)
        .into_iter()
        .filter_map(assignment_in)
        .filter_map(|a| self_attribute(source, a).map(|attr| (attr, a)))
        .collect()
}

fn is_skipped_dir(entry: &DirEntry) -> bool {
    let name = entry.file_name().to_string_lossy();
    entry.file_type().is_dir() && (name.starts_with('.') || SKIPPED_DIRS.contains(&&*name))
}

fn is_indexed_module(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    name.ends_with(".py")
        && !name.starts_with("test_")
        && !name.ends_with("_test.py")
        && name != "conftest.py"
}

/// Repository-relative path rendered with `/` separators.
pub fn to_slash(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Join a `/`-separated relative path onto `root`.
pub fn from_slash(root: &Path, rel: &str) -> PathBuf {
    rel.split('/')
        .filter(|p| !p.is_empty() && *p != ".")
        .fold(root.to_path_buf(), |acc, part| acc.join(part))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(root: &Path, rel: &str, content: &str) {
        let path = from_slash(root, rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    #[test]
    fn test_index_resolves_classes_and_attributes() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "src/oracle.py",
            "class OracleEngine:\n    threshold: float = 0.3\n\n    def __init__(self):\n        self.window = 10\n",
        );
        write(dir.path(), "src/settings.py", "CONFIG = {'retries': 3}\nMAX_RETRIES = 5\n");
        write(dir.path(), "tests/test_oracle.py", "class OracleEngine:\n    pass\n");
        write(dir.path(), ".venv/lib/x.py", "class OracleEngine:\n    pass\n");

        let index = SymbolIndex::build(dir.path(), dir.path());
        assert_eq!(index.files_defining_class("OracleEngine"), vec!["src/oracle.py"]);

        let attrs = index.class_attributes("threshold", None, None);
        assert_eq!(attrs.len(), 1);
        assert_eq!(attrs[0].value, Some(Value::Float(0.3)));
        assert_eq!(attrs[0].class.as_deref(), Some("OracleEngine"));

        let window = index.class_attributes("window", Some("OracleEngine"), None);
        assert_eq!(window[0].kind, SymbolKind::InitAttribute);

        let entry = index.module_values("CONFIG.retries", None);
        assert_eq!(entry[0].value, Some(Value::Int(3)));
        assert_eq!(index.module_values("MAX_RETRIES", None)[0].file, "src/settings.py");
    }

    #[test]
    fn test_slash_paths() {
        let root = Path::new("/repo");
        assert_eq!(from_slash(root, "src/a.py"), Path::new("/repo/src/a.py"));
        assert_eq!(to_slash(Path::new("src").join("a.py").as_path()), "src/a.py");
    }
}
