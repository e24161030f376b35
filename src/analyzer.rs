//! Assignment analysis of user code
//!
//! Statically finds the names a piece of Python code binds, so that an
//! `execute` can report which tables it touched even when a name is rebound
//! to a brand-new table object (a before/after diff of the namespace would
//! miss that).
//!
//! Counted as bindings, anywhere in the tree:
//! - `x = ...`, including chained `a = b = ...`
//! - unpacking targets, arbitrarily nested: `a, (b, [c, *d]) = ...`
//! - annotated assignment `x: T = ...` and bare `x: T`
//! - augmented assignment `x += ...`
//! - assignment expressions `(x := ...)`
//!
//! Attribute (`obj.attr = ...`) and subscript (`obj[k] = ...`) targets
//! mutate an existing object and are not counted. Code that does not parse
//! yields an empty set; the result is advisory only.
//!
//! The grammar is lenient where Python 3 is not: it still accepts the
//! Python 2 `print` and `exec` statements, the `<>` operator, and tuple
//! targets of augmented assignment. Those, and backticks outside string
//! literals and comments, are treated as syntax errors here.

use std::collections::BTreeSet;
use std::ops::Range;

use tree_sitter::{Node, Parser};

/// Names bound by `code`, or an empty set when it does not parse
pub fn assigned_names(code: &str) -> BTreeSet<String> {
    let mut parser = Parser::new();
    if parser
        .set_language(&tree_sitter_python::LANGUAGE.into())
        .is_err()
    {
        tracing::warn!("Python grammar unavailable; skipping assignment analysis");
        return BTreeSet::new();
    }

    let Some(tree) = parser.parse(code, None) else {
        return BTreeSet::new();
    };
    let root = tree.root_node();
    if !is_python3(&root, code.as_bytes()) {
        return BTreeSet::new();
    }

    let mut names = BTreeSet::new();
    collect_assignments(&root, code.as_bytes(), &mut names);
    names
}

/// Whether the tree is free of parse errors and Python 2 only syntax
fn is_python3(root: &Node, source: &[u8]) -> bool {
    if root.has_error() {
        return false;
    }
    let mut literals = Vec::new();
    if !scan_constructs(root, &mut literals) {
        return false;
    }
    source
        .iter()
        .enumerate()
        .filter(|(_, byte)| **byte == b'`')
        .all(|(at, _)| literals.iter().any(|range| range.contains(&at)))
}

/// Walk every node, recording literal ranges; false on a rejected construct
fn scan_constructs(node: &Node, literals: &mut Vec<Range<usize>>) -> bool {
    match node.kind() {
        "print_statement" | "exec_statement" | "<>" => return false,
        "augmented_assignment" => {
            let target = node.child_by_field_name("left").map(|left| left.kind());
            if !matches!(
                target,
                Some("identifier" | "keyword_identifier" | "attribute" | "subscript")
            ) {
                return false;
            }
        }
        "string" | "comment" => {
            literals.push(node.byte_range());
            return true;
        }
        _ => {}
    }

    let mut cursor = node.walk();
    let valid = node
        .children(&mut cursor)
        .all(|child| scan_constructs(&child, literals));
    valid
}

fn collect_assignments(node: &Node, source: &[u8], names: &mut BTreeSet<String>) {
    match node.kind() {
        "assignment" | "augmented_assignment" => {
            if let Some(left) = node.child_by_field_name("left") {
                collect_targets(&left, source, names);
            }
        }
        "named_expression" => {
            if let Some(name) = node.child_by_field_name("name") {
                collect_targets(&name, source, names);
            }
        }
        _ => {}
    }

    let mut cursor = node.walk();
    for child in node.named_children(&mut cursor) {
        collect_assignments(&child, source, names);
    }
}

fn collect_targets(target: &Node, source: &[u8], names: &mut BTreeSet<String>) {
    match target.kind() {
        "identifier" | "keyword_identifier" => {
            if let Ok(text) = target.utf8_text(source) {
                names.insert(text.to_string());
            }
        }
        "pattern_list" | "tuple_pattern" | "list_pattern" | "tuple" | "list"
        | "expression_list" | "list_splat_pattern" | "list_splat" | "parenthesized_expression" => {
            let mut cursor = target.walk();
            for child in target.named_children(&mut cursor) {
                collect_targets(&child, source, names);
            }
        }
        // attribute, subscript and anything else bind no new name
        _ => {}
    }
}
