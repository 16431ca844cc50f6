//! Turning a dependency graph into an executable build graph.
//!
//! The planner emits one `Compile` node per resolved source, one `Archive`
//! node per activated library, a `Link` node combining the sketch, core and
//! variant objects with the archives, and one `Convert` node per
//! `objcopy` recipe the board defines. Nodes carry their fully materialized
//! command line; ordering is expressed through explicit dependency edges
//! and the emission order is already topological.

use crate::{
    config::{BoardConfig, ProjectPathsConfig},
    error::{Result, SketchError},
    resolver::{DependencyGraph, DependencyKind},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Firmware conversion formats emitted after linking.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConvertFormat {
    Hex,
    Bin,
    Eep,
}

impl ConvertFormat {
    const ALL: &'static [ConvertFormat] = &[Self::Hex, Self::Bin, Self::Eep];

    pub fn extension(self) -> &'static str {
        match self {
            Self::Hex => "hex",
            Self::Bin => "bin",
            Self::Eep => "eep",
        }
    }
}

/// What one build node does.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BuildStep {
    Compile { source: PathBuf, object: PathBuf, unit: DependencyKind },
    Archive { archive: PathBuf, objects: Vec<PathBuf> },
    Link { elf: PathBuf, objects: Vec<PathBuf>, archives: Vec<PathBuf> },
    Convert { input: PathBuf, output: PathBuf, format: ConvertFormat },
}

impl BuildStep {
    /// The artifact this node produces.
    pub fn output(&self) -> &Path {
        match self {
            Self::Compile { object, .. } => object,
            Self::Archive { archive, .. } => archive,
            Self::Link { elf, .. } => elf,
            Self::Convert { output, .. } => output,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Compile { .. } => "compile",
            Self::Archive { .. } => "archive",
            Self::Link { .. } => "link",
            Self::Convert { .. } => "convert",
        }
    }
}

/// A node of the build graph with its materialized command.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildNode {
    pub id: usize,
    pub step: BuildStep,
    pub command: String,
    /// Ids of nodes that must complete before this one runs.
    pub deps: Vec<usize>,
}

/// The full plan, nodes in topological order.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildPlan {
    pub nodes: Vec<BuildNode>,
    /// Final artifacts (the ELF and any conversions).
    pub artifacts: Vec<PathBuf>,
}

impl BuildPlan {
    pub fn compile_nodes(&self) -> impl Iterator<Item = &BuildNode> {
        self.nodes.iter().filter(|n| matches!(n.step, BuildStep::Compile { .. }))
    }
}

/// Emits the build graph for `graph` under the board's recipes.
pub fn plan<C: BoardConfig>(
    graph: &DependencyGraph,
    config: &C,
    paths: &ProjectPathsConfig,
) -> Result<BuildPlan> {
    let mut plan = BuildPlan::default();
    let project_name = paths.project_name();
    let includes = includes_arg(&graph.include_dirs);

    let mut link_objects = Vec::new();
    let mut archives = Vec::new();
    let mut link_deps = Vec::new();

    for unit in &graph.units {
        let mut unit_objects = Vec::new();
        let mut unit_node_ids = Vec::new();

        for source in &unit.sources {
            let object = object_path(paths, unit.kind, &unit.name, &unit.root, source);
            let recipe_name = compile_recipe_name(source)?;
            let pattern = config
                .recipe(recipe_name)
                .ok_or_else(|| SketchError::MissingRecipe(recipe_name.to_string()))?;
            let command = materialize(pattern, config, paths, &project_name, |key| match key {
                "source_file" => Some(display(source)),
                "object_file" => Some(display(&object)),
                "includes" => Some(includes.clone()),
                _ => None,
            });

            let id = plan.nodes.len();
            plan.nodes.push(BuildNode {
                id,
                step: BuildStep::Compile {
                    source: source.clone(),
                    object: object.clone(),
                    unit: unit.kind,
                },
                command,
                deps: Vec::new(),
            });
            unit_objects.push(object);
            unit_node_ids.push(id);
        }

        // header-only libraries contribute include dirs but no archive
        if unit.kind == DependencyKind::Library && !unit_objects.is_empty() {
            let archive =
                paths.build_dir.join("libraries").join(format!("{}.a", unit.name));
            let pattern = config
                .recipe("ar")
                .ok_or_else(|| SketchError::MissingRecipe("ar".to_string()))?;
            let command = materialize(pattern, config, paths, &project_name, |key| match key {
                "archive_file" => archive.file_name().map(|n| n.to_string_lossy().into_owned()),
                "archive_file_path" => Some(display(&archive)),
                "object_files" => Some(join_paths(&unit_objects)),
                _ => None,
            });

            let id = plan.nodes.len();
            plan.nodes.push(BuildNode {
                id,
                step: BuildStep::Archive { archive: archive.clone(), objects: unit_objects },
                command,
                deps: unit_node_ids.clone(),
            });
            archives.push(archive);
            link_deps.push(id);
        } else {
            link_objects.extend(unit_objects);
            link_deps.extend(unit_node_ids);
        }
    }

    let elf = paths.build_dir.join(format!("{project_name}.elf"));
    let pattern = config
        .recipe("c.combine")
        .ok_or_else(|| SketchError::MissingRecipe("c.combine".to_string()))?;
    let command = materialize(pattern, config, paths, &project_name, |key| match key {
        "object_files" => Some(join_paths(&link_objects)),
        "archive_files" => Some(join_paths(&archives)),
        "elf_file" => Some(display(&elf)),
        _ => None,
    });
    let link_id = plan.nodes.len();
    plan.nodes.push(BuildNode {
        id: link_id,
        step: BuildStep::Link { elf: elf.clone(), objects: link_objects, archives },
        command,
        deps: link_deps,
    });
    plan.artifacts.push(elf.clone());

    for format in ConvertFormat::ALL {
        let Some(pattern) = config.recipe(&format!("objcopy.{}", format.extension())) else {
            continue;
        };
        let output = paths.build_dir.join(format!("{project_name}.{}", format.extension()));
        let command = materialize(pattern, config, paths, &project_name, |key| match key {
            "elf_file" => Some(display(&elf)),
            "output_file" => Some(display(&output)),
            _ => None,
        });
        let id = plan.nodes.len();
        plan.nodes.push(BuildNode {
            id,
            step: BuildStep::Convert {
                input: elf.clone(),
                output: output.clone(),
                format: *format,
            },
            command,
            deps: vec![link_id],
        });
        plan.artifacts.push(output);
    }

    debug!(
        nodes = plan.nodes.len(),
        artifacts = plan.artifacts.len(),
        "planned build graph"
    );
    Ok(plan)
}

fn display(path: &Path) -> String {
    path.display().to_string()
}

fn join_paths(paths: &[PathBuf]) -> String {
    paths.iter().map(|p| format!("\"{}\"", p.display())).collect::<Vec<_>>().join(" ")
}

fn includes_arg(dirs: &[PathBuf]) -> String {
    dirs.iter().map(|d| format!("\"-I{}\"", d.display())).collect::<Vec<_>>().join(" ")
}

/// Recipe selection by source extension.
fn compile_recipe_name(source: &Path) -> Result<&'static str> {
    match source.extension().and_then(|e| e.to_str()) {
        Some("c") => Ok("c.o"),
        Some("cpp") => Ok("cpp.o"),
        Some("S") => Ok("S.o"),
        other => Err(SketchError::msg(format!(
            "no compile recipe for \"{}\" (extension {:?})",
            source.display(),
            other
        ))),
    }
}

fn materialize<C: BoardConfig>(
    pattern: &str,
    config: &C,
    paths: &ProjectPathsConfig,
    project_name: &str,
    vars: impl Fn(&str) -> Option<String>,
) -> String {
    let build_dir = display(&paths.build_dir);
    super::materialize_recipe(
        pattern,
        &|key| match key {
            "build.path" => Some(build_dir.clone()),
            "build.project_name" => Some(project_name.to_string()),
            other => vars(other),
        },
        &|key| config.property(key).map(Into::into),
    )
}

/// Object path: `<build>/objects/<kind>/<unit>/<relative source>.o`, which
/// keeps equally named sources of different units apart.
fn object_path(
    paths: &ProjectPathsConfig,
    kind: DependencyKind,
    unit_name: &str,
    unit_root: &Path,
    source: &Path,
) -> PathBuf {
    // synthesized sources already live under the build directory; their
    // objects sit next to each other rather than mirroring that nesting
    let relative = if source.starts_with(&paths.build_dir) {
        source.file_name().map(Path::new).unwrap_or(source)
    } else {
        source.strip_prefix(unit_root).unwrap_or_else(|_| {
            source.file_name().map(Path::new).unwrap_or(source)
        })
    };
    let mut file = relative.as_os_str().to_os_string();
    file.push(".o");
    let kind_dir = match kind {
        DependencyKind::Sketch => "sketch",
        DependencyKind::Core => "core",
        DependencyKind::Variant => "variant",
        DependencyKind::Library => "libraries",
    };
    let mut out = paths.objects_dir().join(kind_dir);
    if kind == DependencyKind::Library {
        out = out.join(unit_name);
    }
    out.join(file)
}
