//! Resolution of a sketch's transitive dependency set.
//!
//! Starting from the synthesized sketch translation unit, the analyzer pops
//! `(file, macro table)` pairs off a worklist, analyzes each file's
//! directive tree under its inbound macros, resolves the reached includes
//! against the ordered search roots and enqueues them with the file's
//! outbound table. A library becomes *activated* the first time one of its
//! headers resolves; all its compilable sources then enter the build set.
//!
//! Analyses are memoized per file on the sub-table of macros the file
//! actually read, so revisits under an equivalent context (header guards,
//! include cycles) short-circuit and the traversal terminates on any input.

pub mod analyze;
pub mod expr;
pub mod includes;
pub mod macros;
pub mod parse;
pub mod sketch;

pub use analyze::{Analysis, IncludeRef};
pub use includes::{DependencyKind, IncludeResolver, ResolvedInclude, SearchRoot};
pub use macros::{MacroDef, MacroTable};
pub use parse::{Branch, DirectiveNode, ParseError};
pub use sketch::SketchUnit;

use crate::{
    config::{BoardConfig, ProjectPathsConfig},
    error::{Diagnostic, DiagnosticKind, Result, SketchError},
    utils,
};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque},
    path::{Path, PathBuf},
    sync::Arc,
};

/// File name of the serialized graph snapshot consumed by
/// `compile --preprocess-result` style invocations.
pub const SNAPSHOT_FILE: &str = "preprocessResult.json";

/// One activated unit of the build: the sketch, the core, the variant or a
/// library, with its compilable sources and include directories.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedDependency {
    pub kind: DependencyKind,
    pub name: String,
    pub root: PathBuf,
    pub sources: Vec<PathBuf>,
    pub include_dirs: Vec<PathBuf>,
}

/// The full result of dependency analysis.
///
/// Deterministic for identical inputs: the unit order is fixed (sketch,
/// core, variant, then libraries in root order) and every collection is
/// sorted.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DependencyGraph {
    pub units: Vec<ResolvedDependency>,
    /// File-to-file include reachability, used for incremental reasoning
    /// and reporting.
    pub edges: BTreeMap<PathBuf, BTreeSet<PathBuf>>,
    /// Ordered include directories handed to every compile.
    pub include_dirs: Vec<PathBuf>,
    /// The macro seed analysis started from.
    pub seed: MacroTable,
    /// The search roots analysis ran with, for reproducibility.
    pub roots: Vec<SearchRoot>,
    /// The synthesized sketch translation unit.
    pub sketch: SketchUnit,
    /// Non-fatal findings collected along the way.
    pub diagnostics: Vec<Diagnostic>,
}

/// Caller-supplied knobs for one resolution.
#[derive(Clone, Debug, Default)]
pub struct ResolveOptions {
    /// Extra seed macros (`--build-macros` on the CLI surface).
    pub build_macros: Vec<(String, Option<String>)>,
    /// Additional library roots appended after the board's own.
    pub library_roots: Vec<PathBuf>,
}

impl DependencyGraph {
    /// Resolves the graph for the configured sketch.
    pub fn resolve<C: BoardConfig>(
        config: &C,
        paths: &ProjectPathsConfig,
        options: &ResolveOptions,
    ) -> Result<Self> {
        DependencyAnalyzer::new(config, paths, options)?.run()
    }

    /// All source files of every unit, in unit order.
    pub fn sources(&self) -> impl Iterator<Item = &PathBuf> {
        self.units.iter().flat_map(|unit| unit.sources.iter())
    }

    pub fn unit(&self, kind: DependencyKind, name: &str) -> Option<&ResolvedDependency> {
        self.units.iter().find(|u| u.kind == kind && u.name == name)
    }

    /// Persists the graph (plus seed and roots) so a later invocation can
    /// skip analysis.
    pub fn write_snapshot(&self, path: impl AsRef<Path>) -> Result<()> {
        utils::write_json_file(self, path)
    }

    pub fn read_snapshot(path: impl AsRef<Path>) -> Result<Self> {
        utils::read_json_file(path)
    }
}

/// Content of one analyzed file, read once per invocation.
#[derive(Debug)]
struct SourceFile {
    content: String,
}

/// In-memory source access with an overlay for the synthesized sketch unit,
/// which exists only in memory while analysis runs.
#[derive(Debug, Default)]
struct SourceRegistry {
    files: HashMap<PathBuf, Arc<SourceFile>>,
}

impl SourceRegistry {
    fn insert_overlay(&mut self, path: PathBuf, content: String) {
        self.files.insert(path, Arc::new(SourceFile { content }));
    }

    fn read(&mut self, path: &Path) -> Result<Arc<SourceFile>> {
        if let Some(file) = self.files.get(path) {
            return Ok(file.clone());
        }
        let content = utils::read_to_string(path)?;
        let file = Arc::new(SourceFile { content });
        self.files.insert(path.to_path_buf(), file.clone());
        Ok(file)
    }
}

/// Memoized outcome of analyzing one file under one effective context.
#[derive(Debug)]
struct MemoEntry {
    /// Names the analysis read.
    referenced: BTreeSet<String>,
    /// The inbound table filtered to `referenced` at analysis time.
    context: MacroTable,
}

struct DependencyAnalyzer<'a> {
    paths: &'a ProjectPathsConfig,
    resolver: IncludeResolver,
    registry: SourceRegistry,
    memo: HashMap<PathBuf, Vec<MemoEntry>>,
    edges: BTreeMap<PathBuf, BTreeSet<PathBuf>>,
    activated: BTreeSet<usize>,
    failed: HashSet<PathBuf>,
    diagnostics: Vec<Diagnostic>,
    seed: MacroTable,
    unit: SketchUnit,
}

impl<'a> DependencyAnalyzer<'a> {
    fn new<C: BoardConfig>(
        config: &C,
        paths: &'a ProjectPathsConfig,
        options: &ResolveOptions,
    ) -> Result<Self> {
        if !paths.sketch.is_file() {
            return Err(SketchError::SketchNotFound(paths.sketch.clone()));
        }

        let mut seed = MacroTable::seeded(config.seed_macros());
        for (name, value) in &options.build_macros {
            seed.define_seed(name.clone(), value.clone());
        }

        let sketch_dir = utils::canonicalized(paths.sketch_dir());
        let mut roots = vec![SearchRoot::new(
            DependencyKind::Sketch,
            paths.project_name(),
            sketch_dir,
        )];
        roots.extend(config.search_roots());
        for lib in &options.library_roots {
            let name =
                lib.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
            roots.push(SearchRoot::new(DependencyKind::Library, name, lib));
        }

        let content = utils::read_to_string(&paths.sketch)?;
        let unit = SketchUnit::synthesize(
            &paths.sketch,
            paths.sketch_unit_path(),
            &content,
            &config.core_header(),
        );

        let mut registry = SourceRegistry::default();
        registry.insert_overlay(unit.unit_path.clone(), unit.source.clone());

        debug!(
            sketch = %paths.sketch.display(),
            roots = roots.len(),
            seed = seed.len(),
            "starting dependency analysis"
        );

        Ok(Self {
            paths,
            resolver: IncludeResolver::new(roots),
            registry,
            memo: HashMap::new(),
            edges: BTreeMap::new(),
            activated: BTreeSet::new(),
            failed: HashSet::new(),
            diagnostics: Vec::new(),
            seed,
            unit,
        })
    }

    fn run(mut self) -> Result<DependencyGraph> {
        let unit_path = self.unit.unit_path.clone();
        let mut worklist: VecDeque<(PathBuf, MacroTable)> = VecDeque::new();
        worklist.push_back((unit_path.clone(), self.seed.clone()));

        while let Some((path, table)) = worklist.pop_front() {
            if self.failed.contains(&path) {
                continue;
            }

            if let Some(entries) = self.memo.get(&path) {
                if entries.iter().any(|e| table.subtable(&e.referenced) == e.context) {
                    trace!(file = %path.display(), "memoized under equivalent context");
                    continue;
                }
            }

            let file = match self.registry.read(&path) {
                Ok(file) => file,
                Err(err) => {
                    self.diagnostics.push(
                        Diagnostic::error(DiagnosticKind::Resolve, err.to_string())
                            .with_file(&path),
                    );
                    self.failed.insert(path);
                    continue;
                }
            };

            let analysis = match analyze::analyze(&path, &file.content, &table) {
                Ok(analysis) => analysis,
                Err(parse) => {
                    if path == unit_path {
                        return Err(SketchError::Parse {
                            path: self.unit.ino.clone(),
                            line: self
                                .unit
                                .remap_line(parse.line)
                                .unwrap_or(parse.line),
                            message: parse.message,
                        });
                    }
                    self.diagnostics.push(
                        Diagnostic::error(DiagnosticKind::Parse, parse.message.clone())
                            .with_file(&path)
                            .with_line(parse.line),
                    );
                    self.failed.insert(path);
                    continue;
                }
            };

            self.diagnostics.extend(analysis.diagnostics.iter().cloned());
            self.memo.entry(path.clone()).or_default().push(MemoEntry {
                context: table.subtable(&analysis.referenced),
                referenced: analysis.referenced,
            });

            // quoted includes of the synthesized unit resolve against the
            // original sketch directory, not the build directory
            let current_dir = if path == unit_path {
                utils::canonicalized(self.paths.sketch_dir())
            } else {
                path.parent().unwrap_or_else(|| Path::new(".")).to_path_buf()
            };

            for include in &analysis.includes {
                match self.resolver.resolve(&include.name, include.system, &current_dir) {
                    Some(hit) => {
                        self.edges.entry(path.clone()).or_default().insert(hit.path.clone());
                        if let Some(index) = hit.root {
                            if self.resolver.roots()[index].kind == DependencyKind::Library
                                && self.activated.insert(index)
                            {
                                debug!(
                                    library = %self.resolver.roots()[index].name,
                                    header = %include.name,
                                    "activated library"
                                );
                            }
                        }
                        worklist.push_back((hit.path, analysis.defines_after.clone()));
                    }
                    None if path == unit_path => {
                        return Err(SketchError::UnresolvedInclude {
                            name: include.name.clone(),
                            from: self.unit.ino.clone(),
                        });
                    }
                    None => {
                        self.diagnostics.push(
                            Diagnostic::warning(
                                DiagnosticKind::Resolve,
                                format!("cannot resolve include \"{}\"", include.name),
                            )
                            .with_file(&path)
                            .with_line(include.line),
                        );
                    }
                }
            }
        }

        self.finish()
    }

    /// Assembles the graph: sketch first, then core, variant and the
    /// activated libraries in root order.
    fn finish(self) -> Result<DependencyGraph> {
        let Self { paths, resolver, edges, activated, diagnostics, seed, unit, .. } = self;
        let roots = resolver.roots().to_vec();
        let mut units = Vec::new();

        let sketch_dir = utils::canonicalized(paths.sketch_dir());
        let build_dir = utils::canonicalized(&paths.build_dir);
        let mut sketch_sources = vec![unit.unit_path.clone()];
        sketch_sources.extend(
            utils::source_files(&sketch_dir, utils::SOURCE_EXTENSIONS)
                .into_iter()
                .filter(|p| !p.starts_with(&build_dir)),
        );
        units.push(ResolvedDependency {
            kind: DependencyKind::Sketch,
            name: paths.project_name(),
            root: sketch_dir.clone(),
            sources: sketch_sources,
            include_dirs: vec![sketch_dir],
        });

        for (index, root) in roots.iter().enumerate() {
            let activated_unit = match root.kind {
                // the core and the variant are always part of the build
                DependencyKind::Core | DependencyKind::Variant => true,
                DependencyKind::Library => activated.contains(&index),
                DependencyKind::Sketch => false,
            };
            if !activated_unit {
                continue;
            }
            units.push(ResolvedDependency {
                kind: root.kind,
                name: root.name.clone(),
                root: root.path.clone(),
                sources: unit_sources(root),
                include_dirs: unit_include_dirs(root),
            });
        }

        let include_dirs =
            units.iter().flat_map(|u| u.include_dirs.iter().cloned()).collect::<Vec<_>>();

        debug!(
            units = units.len(),
            files = units.iter().map(|u| u.sources.len()).sum::<usize>(),
            include_dirs = include_dirs.len(),
            "dependency analysis finished"
        );

        Ok(DependencyGraph {
            units,
            edges,
            include_dirs,
            seed,
            roots,
            sketch: unit,
            diagnostics,
        })
    }
}

/// Enumerates the compilable sources of a non-sketch unit, honoring the
/// `src/`-based and flat library layouts.
fn unit_sources(root: &SearchRoot) -> Vec<PathBuf> {
    match root.kind {
        DependencyKind::Core | DependencyKind::Variant => {
            utils::source_files(&root.path, utils::SOURCE_EXTENSIONS)
        }
        _ => {
            let src = root.path.join("src");
            if src.is_dir() {
                utils::source_files(&src, utils::SOURCE_EXTENSIONS)
            } else {
                let mut files: Vec<PathBuf> = walkdir::WalkDir::new(&root.path)
                    .max_depth(1)
                    .sort_by_file_name()
                    .into_iter()
                    .filter_map(std::result::Result::ok)
                    .filter(|e| e.file_type().is_file())
                    .map(|e| e.into_path())
                    .filter(|p| {
                        p.extension()
                            .map(|ext| utils::SOURCE_EXTENSIONS.iter().any(|x| ext == *x))
                            .unwrap_or_default()
                    })
                    .collect();
                let utility = root.path.join("utility");
                if utility.is_dir() {
                    files.extend(utils::source_files(&utility, utils::SOURCE_EXTENSIONS));
                }
                files
            }
        }
    }
}

fn unit_include_dirs(root: &SearchRoot) -> Vec<PathBuf> {
    match root.kind {
        DependencyKind::Core | DependencyKind::Variant => vec![root.path.clone()],
        _ => {
            let src = root.path.join("src");
            if src.is_dir() {
                vec![src]
            } else {
                let mut dirs = vec![root.path.clone()];
                let utility = root.path.join("utility");
                if utility.is_dir() {
                    dirs.push(utility);
                }
                dirs
            }
        }
    }
}
