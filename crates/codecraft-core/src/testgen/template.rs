//! Generated pytest sources.
//!
//! A generated test reads the modified module with Python's `ast` module and
//! asserts the intended change is present. It never imports the code under
//! test and needs nothing beyond the standard library.

use std::fmt::Write as _;
use std::path::{Component, Path};

use crate::domain::spec::{quote_python_str, ChangeType, DataType, TechnicalSpec, Value};

const PRELUDE: &str = r#"import ast
import pathlib
import textwrap


def _module():
    return ast.parse(SOURCE.read_text(encoding="utf-8"), filename=str(SOURCE))


def _find(body, kinds, name):
    for node in body:
        if isinstance(node, kinds) and node.name == name:
            return node
    raise AssertionError("%s not found in %s" % (name, SOURCE))


def _class(tree, name):
    return _find(tree.body, ast.ClassDef, name)


def _function(body, name):
    return _find(body, (ast.FunctionDef, ast.AsyncFunctionDef), name)


def _targets(stmt):
    if isinstance(stmt, ast.Assign):
        return stmt.targets
    if isinstance(stmt, ast.AnnAssign) and stmt.value is not None:
        return [stmt.target]
    return []


def _assigned(body, name):
    found = None
    for stmt in body:
        if any(isinstance(t, ast.Name) and t.id == name for t in _targets(stmt)):
            found = stmt.value
    return found


def _self_assigned(cls, name):
    init = next(
        (n for n in cls.body if isinstance(n, ast.FunctionDef) and n.name == "__init__"),
        None,
    )
    found = None
    for stmt in init.body if init is not None else []:
        for t in _targets(stmt):
            if (
                isinstance(t, ast.Attribute)
                and isinstance(t.value, ast.Name)
                and t.value.id == "self"
                and t.attr == name
            ):
                found = stmt.value
    return found


def _key_text(node):
    try:
        return str(ast.literal_eval(node))
    except ValueError:
        return " ".join(ast.unparse(node).split())


def _dict_entry(node, key):
    assert isinstance(node, ast.Dict), "expected a dict literal"
    for k, v in zip(node.keys, node.values):
        if k is not None and _key_text(k) == key:
            return v
    raise AssertionError("key %r not found" % key)
"#;

/// Python identifier fragment for a proposal id.
pub fn python_ident(proposal_id: &str) -> String {
    proposal_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

fn py(s: &str) -> String {
    quote_python_str(s, '"')
}

fn python_type(data_type: DataType) -> &'static str {
    match data_type {
        DataType::None => "type(None)",
        DataType::Bool => "bool",
        DataType::Int => "int",
        DataType::Float => "float",
        DataType::Str | DataType::Code => "str",
    }
}

/// Render the test module for `spec`. `depth` is the number of directories
/// between the repository root and the generated file.
pub fn render(spec: &TechnicalSpec, depth: usize) -> String {
    let ident = python_ident(spec.proposal_id());
    let parts = spec
        .file_path()
        .components()
        .filter_map(|c| match c {
            Component::Normal(p) => Some(py(&p.to_string_lossy())),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join(", ");

    let mut out = String::new();
    let _ = writeln!(
        out,
        "\"\"\"Generated by CodeCraft Sage for proposal {}: {}.\"\"\"",
        spec.proposal_id(),
        spec.short_description().replace('"', "'").replace('\\', "/")
    );
    out.push_str(PRELUDE);
    let _ = write!(
        out,
        "\n\nSOURCE = pathlib.Path(__file__).resolve().parents[{}].joinpath({parts})\n",
        depth
    );

    let _ = write!(
        out,
        "\n\ndef test_prop_{ident}_module_compiles():\n    compile(SOURCE.read_text(encoding=\"utf-8\"), str(SOURCE), \"exec\")\n"
    );
    let _ = write!(
        out,
        "\n\ndef test_prop_{ident}_change_applied():\n    tree = _module()\n{}",
        assertion_body(spec)
    );
    out
}

fn assertion_body(spec: &TechnicalSpec) -> String {
    let class = spec.class_name().map(py);
    let attr = spec.attribute_name().unwrap_or_default();
    let new_value = spec.new_value();
    match spec.change_type() {
        ChangeType::ParameterChange | ChangeType::ConfigUpdate => {
            let lookup = match (&class, attr.split_once('.')) {
                (Some(cls), _) => format!(
                    "    cls = _class(tree, {cls})\n    node = _assigned(cls.body, {a})\n    if node is None:\n        node = _self_assigned(cls, {a})\n",
                    a = py(attr)
                ),
                (None, Some((dict, key))) if spec.change_type() == ChangeType::ConfigUpdate => {
                    format!(
                        "    node = _dict_entry(_assigned(tree.body, {}), {})\n",
                        py(dict),
                        py(key)
                    )
                }
                (None, _) => format!("    node = _assigned(tree.body, {})\n", py(attr)),
            };
            format!(
                "{lookup}    assert node is not None, {missing}\n    value = ast.literal_eval(node)\n    assert type(value) is {ty}\n    assert value == {expected}\n",
                missing = py(&format!("{} is not assigned", spec.symbol_path())),
                ty = python_type(new_value.data_type()),
                expected = new_value.python_literal(),
            )
        }
        ChangeType::MethodAddition => format!(
            "    method = _function(_class(tree, {cls}).body, {name})\n    expected = ast.parse(textwrap.dedent({code})).body[0]\n    assert ast.dump(method) == ast.dump(expected)\n",
            cls = class.unwrap_or_default(),
            name = py(attr),
            code = py(&new_value.source_text()),
        ),
        ChangeType::ClassModification => format!(
            "    cls = _class(tree, {cls})\n    expected = ast.parse(\"class _Expected(\" + {bases} + \"):\\n    pass\\n\").body[0]\n    assert [ast.dump(b) for b in cls.bases] == [ast.dump(b) for b in expected.bases]\n    assert [ast.dump(k) for k in cls.keywords] == [ast.dump(k) for k in expected.keywords]\n",
            cls = class.unwrap_or_default(),
            bases = py(&new_value.source_text()),
        ),
        ChangeType::ImportAddition => format!(
            "    expected = ast.dump(ast.parse({stmt}).body[0])\n    assert any(ast.dump(node) == expected for node in tree.body)\n",
            stmt = py(&new_value.source_text()),
        ),
        ChangeType::DocstringUpdate => {
            let owner = match (&class, spec.attribute_name()) {
                (Some(cls), Some(m)) => format!("_function(_class(tree, {cls}).body, {})", py(m)),
                (Some(cls), None) => format!("_class(tree, {cls})"),
                (None, Some(f)) => format!("_function(tree.body, {})", py(f)),
                (None, None) => "tree".to_string(),
            };
            let expected = match new_value {
                Value::Str(s) => py(s),
                other => py(&other.source_text()),
            };
            format!("    assert ast.get_docstring({owner}, clean=False) == {expected}\n")
        }
    }
}

/// Directory levels between the repository root and a generated test.
pub fn depth_below_root(generated: &Path) -> usize {
    generated
        .parent()
        .map(|p| {
            p.components()
                .filter(|c| matches!(c, Component::Normal(_)))
                .count()
        })
        .unwrap_or(0)
}
