//! Executing a build plan with bounded parallelism.
//!
//! Ready nodes (all dependencies satisfied) run on a rayon pool capped at
//! `jobs` threads, one compiler child per worker, so no more than `jobs`
//! compiler processes exist at any instant. Before spawning, every compile
//! consults the object cache under its fingerprint; hits restore the object
//! without a child process. The first failure stops dispatch of further
//! waves while in-flight nodes finish; whatever was never dispatched is
//! reported as skipped.

use crate::{
    cache::{Fingerprint, ObjectCache},
    compile::{failure_text, run_command, BuildNode, BuildPlan, BuildStep, Toolchain},
    error::{Diagnostic, DiagnosticKind, Result, SketchError},
    report::{BuildReport, CacheCounters, NodeOutcome, NodeReport},
    resolver::DependencyGraph,
    utils,
};
use rayon::prelude::*;
use std::{
    fs,
    path::Path,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

/// Execution knobs.
#[derive(Clone, Debug)]
pub struct ExecuteOptions {
    /// Maximum concurrent compiler processes.
    pub jobs: usize,
    /// Object cache; `None` compiles everything.
    pub cache: Option<ObjectCache>,
    /// Cooperative cancellation flag set by the surrounding environment.
    pub cancel: Option<Arc<AtomicBool>>,
    /// How long in-flight children may continue after cancellation.
    pub grace: Duration,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self { jobs: num_cpus::get(), cache: None, cancel: None, grace: Duration::from_secs(5) }
    }
}

/// Runs the plan to completion (or first failure) and reports per-node
/// outcomes, timings and cache traffic.
pub fn execute(
    plan: &BuildPlan,
    graph: &DependencyGraph,
    toolchain: &Toolchain,
    options: &ExecuteOptions,
) -> Result<BuildReport> {
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(options.jobs.max(1))
        .build()
        .map_err(SketchError::msg)?;

    let include_dirs: Vec<String> =
        graph.include_dirs.iter().map(|d| d.display().to_string()).collect();
    let include_state = Fingerprint::digest(include_dirs.iter().map(String::as_bytes));

    let ctx = ExecContext {
        graph,
        toolchain,
        cache: options.cache.as_ref(),
        include_state,
        cancel: options.cancel.clone(),
        grace: options.grace,
    };

    let total = plan.nodes.len();
    let mut outcomes: Vec<Option<NodeOutcome>> = vec![None; total];
    let mut millis: Vec<u64> = vec![0; total];
    let mut counters = CacheCounters::default();
    let mut diagnostics = graph.diagnostics.clone();
    let mut halted = false;

    loop {
        if halted || ctx.cancelled() {
            break;
        }
        let ready: Vec<usize> = plan
            .nodes
            .iter()
            .filter(|node| {
                outcomes[node.id].is_none()
                    && node.deps.iter().all(|dep| {
                        matches!(outcomes[*dep], Some(NodeOutcome::Hit | NodeOutcome::Compiled))
                    })
            })
            .map(|node| node.id)
            .collect();
        if ready.is_empty() {
            break;
        }
        trace!(wave = ready.len(), "dispatching ready nodes");

        let results: Vec<NodeResult> =
            pool.install(|| ready.par_iter().map(|id| ctx.run(&plan.nodes[*id])).collect());

        for result in results {
            outcomes[result.id] = Some(result.outcome);
            millis[result.id] = result.millis;
            counters.hits += result.counters.hits;
            counters.misses += result.counters.misses;
            counters.stored += result.counters.stored;
            counters.errors += result.counters.errors;
            if let Some(diagnostic) = result.diagnostic {
                diagnostics.push(diagnostic);
            }
            if result.outcome == NodeOutcome::Failed {
                halted = true;
            }
        }
    }

    let nodes: Vec<NodeReport> = plan
        .nodes
        .iter()
        .map(|node| NodeReport {
            id: node.id,
            kind: node.step.kind_name().to_string(),
            target: node.step.output().to_path_buf(),
            outcome: outcomes[node.id].unwrap_or(NodeOutcome::Skipped),
            millis: millis[node.id],
        })
        .collect();

    let success = nodes
        .iter()
        .all(|node| matches!(node.outcome, NodeOutcome::Hit | NodeOutcome::Compiled));

    debug!(
        success,
        hits = counters.hits,
        compiled = nodes.iter().filter(|n| n.outcome == NodeOutcome::Compiled).count(),
        failed = nodes.iter().filter(|n| n.outcome == NodeOutcome::Failed).count(),
        "build finished"
    );

    Ok(BuildReport {
        success,
        nodes,
        cache: counters,
        dependencies: Vec::new(),
        artifacts: if success { plan.artifacts.clone() } else { Vec::new() },
        diagnostics,
    }
    .with_dependencies(graph))
}

struct ExecContext<'a> {
    graph: &'a DependencyGraph,
    toolchain: &'a Toolchain,
    cache: Option<&'a ObjectCache>,
    include_state: Fingerprint,
    cancel: Option<Arc<AtomicBool>>,
    grace: Duration,
}

struct NodeResult {
    id: usize,
    outcome: NodeOutcome,
    millis: u64,
    counters: CacheCounters,
    diagnostic: Option<Diagnostic>,
}

impl ExecContext<'_> {
    fn cancelled(&self) -> bool {
        self.cancel.as_ref().map(|flag| flag.load(Ordering::Relaxed)).unwrap_or(false)
    }

    fn run(&self, node: &BuildNode) -> NodeResult {
        let start = Instant::now();
        let mut counters = CacheCounters::default();

        if let Err(err) = utils::create_parent_dir_all(node.step.output()) {
            return self.failed(node, start, counters, err.to_string());
        }

        // compile nodes get a cache fingerprint; everything else always runs
        let fingerprint = match (&node.step, self.cache) {
            (BuildStep::Compile { source, .. }, Some(_)) => {
                match self.fingerprint(node, source) {
                    Ok(fp) => Some(fp),
                    Err(err) => {
                        return self.failed(
                            node,
                            start,
                            counters,
                            format!("cannot read \"{}\": {err}", source.display()),
                        )
                    }
                }
            }
            _ => None,
        };

        if let (BuildStep::Compile { object, .. }, Some(cache), Some(fp)) =
            (&node.step, self.cache, fingerprint)
        {
            match cache.lookup(&fp) {
                Some(bytes) => match fs::write(object, bytes) {
                    Ok(()) => {
                        counters.hits += 1;
                        return NodeResult {
                            id: node.id,
                            outcome: NodeOutcome::Hit,
                            millis: elapsed_ms(start),
                            counters,
                            diagnostic: None,
                        };
                    }
                    Err(err) => {
                        warn!(object = %object.display(), %err, "cannot restore cached object");
                        counters.errors += 1;
                        counters.misses += 1;
                    }
                },
                None => counters.misses += 1,
            }
        }

        match run_command(&node.command, self.cancel.as_ref(), self.grace) {
            Ok(child) if child.output.status.success() => {
                if let (BuildStep::Compile { object, .. }, Some(cache), Some(fp)) =
                    (&node.step, self.cache, fingerprint)
                {
                    self.store_object(cache, &fp, object, &mut counters);
                }
                trace!(
                    target_file = %node.step.output().display(),
                    ms = child.elapsed.as_millis() as u64,
                    "node finished"
                );
                NodeResult {
                    id: node.id,
                    outcome: NodeOutcome::Compiled,
                    millis: elapsed_ms(start),
                    counters,
                    diagnostic: None,
                }
            }
            Ok(child) => {
                let text = self.remap_for(node, failure_text(&child.output));
                self.failed(node, start, counters, text)
            }
            Err(err) => {
                let program = utils::split_command(&node.command)
                    .into_iter()
                    .next()
                    .unwrap_or_default();
                self.failed(node, start, counters, format!("cannot spawn \"{program}\": {err}"))
            }
        }
    }

    fn store_object(
        &self,
        cache: &ObjectCache,
        fingerprint: &Fingerprint,
        object: &Path,
        counters: &mut CacheCounters,
    ) {
        match fs::read(object) {
            Ok(bytes) => {
                if let Err(err) = cache.store(fingerprint, &bytes) {
                    warn!(%fingerprint, %err, "cannot store object in cache");
                    counters.errors += 1;
                } else {
                    counters.stored += 1;
                }
            }
            Err(err) => {
                warn!(object = %object.display(), %err, "compiler produced no readable object");
                counters.errors += 1;
            }
        }
    }

    /// Fingerprint of a compile step: source content, exact command,
    /// toolchain identity and the include-search state that reached it.
    fn fingerprint(&self, node: &BuildNode, source: &Path) -> std::io::Result<Fingerprint> {
        let content = fs::read(source)?;
        let program =
            utils::split_command(&node.command).into_iter().next().unwrap_or_default();
        let identity = self.toolchain.identity(&program);
        let include_hex = self.include_state.to_hex();
        Ok(Fingerprint::digest([
            content.as_slice(),
            node.command.as_bytes(),
            identity.as_bytes(),
            include_hex.as_bytes(),
        ]))
    }

    /// Sketch-unit diagnostics are rewritten to `.ino` coordinates.
    fn remap_for(&self, node: &BuildNode, text: String) -> String {
        match &node.step {
            BuildStep::Compile { source, .. } if *source == self.graph.sketch.unit_path => {
                self.graph.sketch.remap_diagnostic_text(&text)
            }
            _ => text,
        }
    }

    fn failed(
        &self,
        node: &BuildNode,
        start: Instant,
        counters: CacheCounters,
        message: String,
    ) -> NodeResult {
        let kind = match node.step {
            BuildStep::Compile { .. } => DiagnosticKind::Compile,
            _ => DiagnosticKind::Link,
        };
        let file = match &node.step {
            BuildStep::Compile { source, .. } if *source == self.graph.sketch.unit_path => {
                self.graph.sketch.ino.clone()
            }
            BuildStep::Compile { source, .. } => source.clone(),
            other => other.output().to_path_buf(),
        };
        error!(node = node.id, target_file = %file.display(), "node failed");
        NodeResult {
            id: node.id,
            outcome: NodeOutcome::Failed,
            millis: elapsed_ms(start),
            counters,
            diagnostic: Some(Diagnostic::error(kind, message).with_file(file)),
        }
    }
}

fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}
