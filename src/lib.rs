#![doc = include_str!("../README.md")]
#![warn(rustdoc::all)]
#![cfg_attr(not(test), warn(unused_crate_dependencies))]
#![deny(unused_must_use, rust_2018_idioms)]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

#[macro_use]
extern crate tracing;

pub mod error;
pub use error::{Diagnostic, DiagnosticKind, Severity, SketchError, SketchIoError};
use error::Result;

pub mod cache;
pub use cache::{CacheStats, Fingerprint, ObjectCache, SweepOptions, SweepReport};

pub mod config;
pub use config::{BoardConfig, BoardDefinition, ProjectPathsConfig};

pub mod resolver;
pub use resolver::{
    DependencyGraph, DependencyKind, MacroTable, ResolveOptions, ResolvedDependency, SketchUnit,
};

pub mod compile;
pub use compile::{BuildNode, BuildPlan, BuildStep, ExecuteOptions, Toolchain};

pub mod report;
pub use report::{BuildReport, NodeOutcome};

pub mod utils;

use std::{path::PathBuf, sync::atomic::AtomicBool, sync::Arc, time::Duration};

/// Handles accelerated builds of one sketch: dependency resolution,
/// planning and cached execution.
#[derive(Debug)]
pub struct Project<C: BoardConfig = BoardDefinition> {
    /// The board configuration driving macros, search roots and recipes.
    pub config: C,
    /// The layout of the project.
    pub paths: ProjectPathsConfig,
    /// Whether the object cache is consulted.
    pub cached: bool,
    /// Maximum number of compiler processes to run simultaneously.
    jobs: usize,
    /// Extra seed macros (`--build-macros`).
    pub build_macros: Vec<(String, Option<String>)>,
    /// Additional library roots appended after the board's own.
    pub library_roots: Vec<PathBuf>,
    /// Cooperative cancellation handle shared with the environment.
    pub cancel: Option<Arc<AtomicBool>>,
}

impl Project {
    /// Convenience function to call `ProjectBuilder::default()`.
    pub fn builder() -> ProjectBuilder {
        ProjectBuilder::default()
    }
}

impl<C: BoardConfig> Project<C> {
    /// Resolves the sketch's transitive dependency set.
    pub fn resolve(&self) -> Result<DependencyGraph> {
        DependencyGraph::resolve(
            &self.config,
            &self.paths,
            &ResolveOptions {
                build_macros: self.build_macros.clone(),
                library_roots: self.library_roots.clone(),
            },
        )
    }

    /// Plans the build graph for an already resolved dependency set.
    pub fn plan(&self, graph: &DependencyGraph) -> Result<BuildPlan> {
        compile::planner::plan(graph, &self.config, &self.paths)
    }

    /// Resolves, plans and executes in one go.
    pub fn build(&self) -> Result<BuildReport> {
        let graph = self.resolve()?;
        self.build_with_graph(&graph)
    }

    /// Executes against a previously resolved (possibly snapshot-loaded)
    /// graph; the round-trip equivalent of [`Self::build`].
    pub fn build_with_graph(&self, graph: &DependencyGraph) -> Result<BuildReport> {
        graph.sketch.write()?;
        let plan = self.plan(graph)?;
        let toolchain = Toolchain::new();
        let options = ExecuteOptions {
            jobs: self.jobs,
            cache: if self.cached { self.open_cache() } else { None },
            cancel: self.cancel.clone(),
            grace: Duration::from_secs(5),
        };
        compile::execute(&plan, graph, &toolchain, &options)
    }

    /// Resolves and persists the dependency snapshot under the build
    /// directory, returning its location.
    pub fn save_preprocess_result(&self) -> Result<PathBuf> {
        let graph = self.resolve()?;
        let path = self.paths.build_dir.join(resolver::SNAPSHOT_FILE);
        graph.write_snapshot(&path)?;
        Ok(path)
    }

    /// The object cache this project would use, if one can be opened.
    pub fn object_cache(&self) -> Result<ObjectCache> {
        match &self.paths.cache_dir {
            Some(dir) => ObjectCache::open(dir),
            None => ObjectCache::open_default(),
        }
    }

    /// Cache open failures demote to an uncached build.
    fn open_cache(&self) -> Option<ObjectCache> {
        match self.object_cache() {
            Ok(cache) => Some(cache),
            Err(err) => {
                warn!(%err, "cannot open object cache, building without it");
                None
            }
        }
    }

    pub fn jobs(&self) -> usize {
        self.jobs
    }

    /// Sets the maximum number of concurrent compiler processes, clamped to
    /// at least one.
    pub fn set_jobs(&mut self, jobs: usize) {
        self.jobs = jobs.max(1);
    }
}

/// Builder for [`Project`].
#[derive(Debug)]
pub struct ProjectBuilder<C: BoardConfig = BoardDefinition> {
    config: Option<C>,
    sketch: Option<PathBuf>,
    build_dir: Option<PathBuf>,
    cache_dir: Option<PathBuf>,
    cached: bool,
    jobs: usize,
    build_macros: Vec<(String, Option<String>)>,
    library_roots: Vec<PathBuf>,
    cancel: Option<Arc<AtomicBool>>,
}

impl<C: BoardConfig> Default for ProjectBuilder<C> {
    fn default() -> Self {
        Self {
            config: None,
            sketch: None,
            build_dir: None,
            cache_dir: None,
            cached: true,
            jobs: num_cpus::get(),
            build_macros: Vec::new(),
            library_roots: Vec::new(),
            cancel: None,
        }
    }
}

impl<C: BoardConfig> ProjectBuilder<C> {
    pub fn config(mut self, config: C) -> Self {
        self.config = Some(config);
        self
    }

    pub fn sketch(mut self, sketch: impl Into<PathBuf>) -> Self {
        self.sketch = Some(sketch.into());
        self
    }

    pub fn build_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.build_dir = Some(dir.into());
        self
    }

    pub fn cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = Some(dir.into());
        self
    }

    /// Disables the object cache for this project.
    pub fn ephemeral(mut self) -> Self {
        self.cached = false;
        self
    }

    pub fn jobs(mut self, jobs: usize) -> Self {
        self.jobs = jobs.max(1);
        self
    }

    /// Adds one `NAME` or `NAME=VALUE` seed macro.
    pub fn build_macro(mut self, name: impl Into<String>, value: Option<String>) -> Self {
        self.build_macros.push((name.into(), value));
        self
    }

    pub fn library_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.library_roots.push(root.into());
        self
    }

    pub fn cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    pub fn build(self) -> Result<Project<C>> {
        let config =
            self.config.ok_or_else(|| SketchError::msg("no board configuration given"))?;
        let sketch = self.sketch.ok_or_else(|| SketchError::msg("no sketch given"))?;
        let build_dir = match self.build_dir {
            Some(dir) => dir,
            None => sketch
                .parent()
                .map(|dir| dir.join(".build"))
                .ok_or_else(|| SketchError::msg("cannot derive a build directory"))?,
        };
        let mut paths = ProjectPathsConfig::new(sketch, build_dir);
        paths.cache_dir = self.cache_dir;
        Ok(Project {
            config,
            paths,
            cached: self.cached,
            jobs: self.jobs,
            build_macros: self.build_macros,
            library_roots: self.library_roots,
            cancel: self.cancel,
        })
    }
}
