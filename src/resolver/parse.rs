//! Preprocessor directive trees.
//!
//! Parses a source file with the C++ grammar and folds the preprocessor
//! constructs into an ordered [`DirectiveNode`] tree:
//! `#include`/`#define`/`#undef` leaves, `Conditional` frames for
//! `#if`/`#ifdef`/`#elif`/`#else`/`#endif` chains, and opaque `Code` spans
//! for everything in between. `#ifdef NAME`/`#ifndef NAME` normalize to the
//! conditions `defined(NAME)`/`!defined(NAME)` so the analyzer funnels every
//! branch through one expression evaluator.

use crate::utils;
use std::ops::Range;
use tree_sitter::Node;

/// One entry of a directive tree, in source order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DirectiveNode {
    Include { path: String, system: bool, line: u32 },
    Define { name: String, value: Option<String> },
    Undef { name: String },
    Conditional { branches: Vec<Branch>, else_body: Option<Vec<DirectiveNode>> },
    /// Non-directive source, retained only for position tracking.
    Code { span: Range<usize> },
}

/// One `#if`/`#elif` arm of a conditional frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Branch {
    pub condition: String,
    pub line: u32,
    pub body: Vec<DirectiveNode>,
}

/// Structural failure of a file's directive nesting.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("{message} (line {line})")]
pub struct ParseError {
    pub message: String,
    pub line: u32,
}

impl ParseError {
    fn new(message: impl Into<String>, line: u32) -> Self {
        Self { message: message.into(), line }
    }
}

/// Parses `source` into its ordered directive tree.
///
/// Fails the whole file when conditionals are unbalanced, reporting the
/// position of the unmatched opener.
pub fn parse(source: &str) -> Result<Vec<DirectiveNode>, ParseError> {
    check_balance(&utils::sanitize_source(source))?;

    let mut parser = tree_sitter::Parser::new();
    let language: tree_sitter::Language = tree_sitter_cpp::LANGUAGE.into();
    parser
        .set_language(&language)
        .map_err(|err| ParseError::new(format!("cannot load C++ grammar: {err}"), 0))?;
    let tree = parser
        .parse(source, None)
        .ok_or_else(|| ParseError::new("syntax tree construction failed", 0))?;

    let mut out = Vec::new();
    convert_into(tree.root_node(), source, &mut out);
    Ok(out)
}

/// Verifies every `#if`/`#ifdef`/`#ifndef` closes at its own nesting depth.
///
/// Operates on sanitized text, so directive-looking lines inside comments or
/// string literals don't count.
fn check_balance(sanitized: &str) -> Result<(), ParseError> {
    let mut stack: Vec<(String, u32)> = Vec::new();
    let mut lines = sanitized.lines().enumerate();
    while let Some((idx, line)) = lines.next() {
        let lineno = idx as u32 + 1;
        let mut logical = line.trim_end().to_string();
        while logical.ends_with('\\') {
            logical.pop();
            match lines.next() {
                Some((_, next)) => logical.push_str(next.trim_end()),
                None => break,
            }
        }
        let trimmed = logical.trim_start();
        let Some(rest) = trimmed.strip_prefix('#') else { continue };
        let word: String =
            rest.trim_start().chars().take_while(|c| c.is_ascii_alphabetic()).collect();
        match word.as_str() {
            "if" | "ifdef" | "ifndef" => stack.push((word, lineno)),
            "elif" | "elifdef" | "elifndef" | "else" => {
                if stack.is_empty() {
                    return Err(ParseError::new(format!("#{word} without matching #if"), lineno));
                }
            }
            "endif" => {
                if stack.pop().is_none() {
                    return Err(ParseError::new("#endif without matching #if", lineno));
                }
            }
            _ => {}
        }
    }
    if let Some((word, lineno)) = stack.pop() {
        return Err(ParseError::new(format!("unterminated #{word}"), lineno));
    }
    Ok(())
}

fn node_text<'s>(node: Node<'_>, src: &'s str) -> &'s str {
    node.utf8_text(src.as_bytes()).unwrap_or_default()
}

fn node_line(node: Node<'_>) -> u32 {
    node.start_position().row as u32 + 1
}

fn named_children<'t>(node: Node<'t>) -> Vec<Node<'t>> {
    (0..node.named_child_count()).filter_map(|i| node.named_child(i)).collect()
}

fn contains_directive(node: Node<'_>) -> bool {
    if node.kind().starts_with("preproc") {
        return true;
    }
    named_children(node).into_iter().any(contains_directive)
}

fn push_code(out: &mut Vec<DirectiveNode>, span: Range<usize>) {
    if let Some(DirectiveNode::Code { span: prev }) = out.last_mut() {
        if prev.end <= span.start {
            prev.end = span.end;
            return;
        }
    }
    out.push(DirectiveNode::Code { span });
}

fn convert_into(node: Node<'_>, src: &str, out: &mut Vec<DirectiveNode>) {
    match node.kind() {
        "preproc_include" => match node.child_by_field_name("path") {
            Some(path) => {
                let raw = node_text(path, src).trim().to_string();
                let (name, system) = match path.kind() {
                    "system_lib_string" => {
                        (raw.trim_start_matches('<').trim_end_matches('>').to_string(), true)
                    }
                    "string_literal" => (raw.trim_matches('"').to_string(), false),
                    // computed include (`#include MACRO`); nothing to resolve
                    _ => {
                        push_code(out, node.byte_range());
                        return;
                    }
                };
                out.push(DirectiveNode::Include { path: name, system, line: node_line(node) });
            }
            None => push_code(out, node.byte_range()),
        },
        "preproc_def" => {
            if let Some(name) = node.child_by_field_name("name") {
                let value = node
                    .child_by_field_name("value")
                    .map(|v| clean_directive_text(node_text(v, src)))
                    .filter(|v| !v.is_empty());
                out.push(DirectiveNode::Define { name: node_text(name, src).to_string(), value });
            }
        }
        // function-like macros count as defined but never substitute as values
        "preproc_function_def" => {
            if let Some(name) = node.child_by_field_name("name") {
                out.push(DirectiveNode::Define {
                    name: node_text(name, src).to_string(),
                    value: None,
                });
            }
        }
        "preproc_call" => {
            let directive = node
                .child_by_field_name("directive")
                .map(|d| node_text(d, src).trim().to_string())
                .unwrap_or_default();
            let argument = node
                .child_by_field_name("argument")
                .and_then(|a| node_text(a, src).split_whitespace().next().map(String::from));
            match (directive.as_str(), argument) {
                ("#undef", Some(name)) => out.push(DirectiveNode::Undef { name }),
                // #pragma, #error and friends are outside the simulated subset
                _ => push_code(out, node.byte_range()),
            }
        }
        "preproc_if" | "preproc_ifdef" => out.push(convert_conditional(node, src)),
        _ => {
            if contains_directive(node) {
                for child in named_children(node) {
                    convert_into(child, src, out);
                }
            } else {
                push_code(out, node.byte_range());
            }
        }
    }
}

fn convert_conditional(node: Node<'_>, src: &str) -> DirectiveNode {
    let mut branches = Vec::new();
    let mut else_body = None;
    let mut cursor = Some(node);

    while let Some(n) = cursor {
        match n.kind() {
            "preproc_if" | "preproc_elif" => {
                let condition = n.child_by_field_name("condition");
                let alternative = n.child_by_field_name("alternative");
                let text = condition
                    .map(|c| clean_condition(node_text(c, src)))
                    .unwrap_or_default();
                branches.push(Branch {
                    condition: text,
                    line: node_line(n),
                    body: convert_body(n, src, &[condition, alternative]),
                });
                cursor = alternative;
            }
            "preproc_ifdef" | "preproc_elifdef" => {
                let negated = n
                    .child(0)
                    .map(|c| matches!(c.kind(), "#ifndef" | "#elifndef"))
                    .unwrap_or(false);
                let name_node = n.child_by_field_name("name");
                let alternative = n.child_by_field_name("alternative");
                let name = name_node.map(|c| node_text(c, src).to_string()).unwrap_or_default();
                let condition =
                    if negated { format!("!defined({name})") } else { format!("defined({name})") };
                branches.push(Branch {
                    condition,
                    line: node_line(n),
                    body: convert_body(n, src, &[name_node, alternative]),
                });
                cursor = alternative;
            }
            "preproc_else" => {
                let mut body = Vec::new();
                for child in named_children(n) {
                    convert_into(child, src, &mut body);
                }
                else_body = Some(body);
                cursor = None;
            }
            _ => cursor = None,
        }
    }

    DirectiveNode::Conditional { branches, else_body }
}

fn convert_body(
    node: Node<'_>,
    src: &str,
    skip: &[Option<Node<'_>>],
) -> Vec<DirectiveNode> {
    let skip_ids: Vec<usize> = skip.iter().flatten().map(Node::id).collect();
    let mut body = Vec::new();
    for child in named_children(node) {
        if skip_ids.contains(&child.id()) {
            continue;
        }
        convert_into(child, src, &mut body);
    }
    body
}

/// Unfolds line continuations and strips comments from directive text.
fn clean_directive_text(text: &str) -> String {
    let unfolded = text.replace("\\\r\n", " ").replace("\\\n", " ");
    utils::strip_comments(&unfolded).trim().to_string()
}

/// Cleans a condition and strips the outer parentheses of `#if(X==Y)` style
/// conditions, but only while they balance.
fn clean_condition(text: &str) -> String {
    let mut cond = clean_directive_text(text);
    while let Some(stripped) = strip_outer_parens(&cond) {
        cond = stripped;
    }
    cond
}

fn strip_outer_parens(cond: &str) -> Option<String> {
    let inner = cond.strip_prefix('(')?.strip_suffix(')')?;
    let mut depth = 0i32;
    for c in inner.chars() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth < 0 {
                    return None;
                }
            }
            _ => {}
        }
    }
    (depth == 0).then(|| inner.trim().to_string())
}
