//! Single-file analysis: walks a directive tree with a live macro table,
//! choosing the one active branch of every conditional and collecting the
//! `#include`s that are actually reached.

use crate::{
    error::{Diagnostic, DiagnosticKind},
    resolver::{
        expr,
        parse::{self, Branch, DirectiveNode, ParseError},
        MacroTable,
    },
};
use std::{collections::BTreeSet, path::Path};

/// An `#include` as written in the source.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IncludeRef {
    pub name: String,
    pub system: bool,
    pub line: u32,
}

/// Everything the analyzer learned from one file under one macro context.
#[derive(Clone, Debug, Default)]
pub struct Analysis {
    /// Reached includes, in source order, as written.
    pub includes: Vec<IncludeRef>,
    /// The inbound macro table as modified by the file's `#define`/`#undef`.
    pub defines_after: MacroTable,
    /// Macro names whose state influenced any branch decision or
    /// substitution; the sub-table over this set is the memoization key.
    pub referenced: BTreeSet<String>,
    /// Non-fatal findings (malformed `#if` expressions).
    pub diagnostics: Vec<Diagnostic>,
}

/// Analyzes `content` under `inbound` macros.
///
/// The result is a pure function of `(content, inbound)`: re-running with
/// identical inputs yields an identical [`Analysis`], which is what makes
/// memoization in the dependency analyzer sound.
///
/// Returns the parse failure when directives are unbalanced; the caller
/// decides whether that is fatal (sketch) or a skipped file (headers).
pub fn analyze(
    path: &Path,
    content: &str,
    inbound: &MacroTable,
) -> Result<Analysis, ParseError> {
    let tree = parse::parse(content)?;
    let mut analysis = Analysis { defines_after: inbound.clone(), ..Default::default() };
    walk(&tree, path, &mut analysis);
    trace!(
        file = %path.display(),
        includes = analysis.includes.len(),
        referenced = analysis.referenced.len(),
        "analyzed"
    );
    Ok(analysis)
}

fn walk(nodes: &[DirectiveNode], path: &Path, analysis: &mut Analysis) {
    for node in nodes {
        match node {
            DirectiveNode::Include { path: name, system, line } => {
                analysis.includes.push(IncludeRef {
                    name: name.clone(),
                    system: *system,
                    line: *line,
                });
            }
            DirectiveNode::Define { name, value } => {
                analysis.defines_after.define(name.clone(), value.clone());
            }
            DirectiveNode::Undef { name } => analysis.defines_after.undef(name),
            DirectiveNode::Conditional { branches, else_body } => {
                match take_branch(branches, path, analysis) {
                    Some(body) => walk(body, path, analysis),
                    None => {
                        if let Some(body) = else_body {
                            walk(body, path, analysis);
                        }
                    }
                }
            }
            DirectiveNode::Code { .. } => {}
        }
    }
}

/// Evaluates branch conditions in order against the current table and
/// returns the first true body. A failed evaluation makes that branch false
/// and records a warning; it never aborts the analysis.
fn take_branch<'n>(
    branches: &'n [Branch],
    path: &Path,
    analysis: &mut Analysis,
) -> Option<&'n [DirectiveNode]> {
    for branch in branches {
        match expr::evaluate(&branch.condition, &analysis.defines_after, &mut analysis.referenced)
        {
            Ok(value) if value != 0 => return Some(&branch.body),
            Ok(_) => {}
            Err(err) => {
                warn!(
                    file = %path.display(),
                    line = branch.line,
                    condition = %branch.condition,
                    %err,
                    "cannot evaluate condition, treating branch as false"
                );
                analysis.diagnostics.push(
                    Diagnostic::warning(
                        DiagnosticKind::Expr,
                        format!("cannot evaluate `#if {}`: {}", branch.condition, err.reason),
                    )
                    .with_file(path)
                    .with_line(branch.line),
                );
            }
        }
    }
    None
}
