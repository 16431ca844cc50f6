//! The serializable build report.

use crate::{
    error::Diagnostic,
    resolver::{DependencyGraph, DependencyKind},
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// How one node of the plan ended up.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeOutcome {
    /// Object restored from the cache without spawning a compiler.
    Hit,
    /// Command ran and succeeded.
    Compiled,
    /// Command ran and failed.
    Failed,
    /// Never dispatched because an earlier node failed or the build was
    /// cancelled.
    Skipped,
}

/// Per-node entry of the report.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeReport {
    pub id: usize,
    pub kind: String,
    pub target: PathBuf,
    pub outcome: NodeOutcome,
    pub millis: u64,
}

/// Cache traffic of one build.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheCounters {
    pub hits: usize,
    pub misses: usize,
    pub stored: usize,
    /// I/O failures demoted to misses.
    pub errors: usize,
}

/// Summary of one resolved dependency for the report.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencySummary {
    pub kind: DependencyKind,
    pub name: String,
    pub root: PathBuf,
    pub sources: usize,
}

/// Everything a build produced, JSON-serializable for tooling.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BuildReport {
    pub success: bool,
    pub nodes: Vec<NodeReport>,
    pub cache: CacheCounters,
    pub dependencies: Vec<DependencySummary>,
    pub artifacts: Vec<PathBuf>,
    pub diagnostics: Vec<Diagnostic>,
}

impl BuildReport {
    pub(crate) fn with_dependencies(mut self, graph: &DependencyGraph) -> Self {
        self.dependencies = graph
            .units
            .iter()
            .map(|unit| DependencySummary {
                kind: unit.kind,
                name: unit.name.clone(),
                root: unit.root.clone(),
                sources: unit.sources.len(),
            })
            .collect();
        self
    }

    /// Nodes with the given outcome.
    pub fn count(&self, outcome: NodeOutcome) -> usize {
        self.nodes.iter().filter(|n| n.outcome == outcome).count()
    }
}
