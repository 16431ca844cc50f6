//! Board configuration and project path handling.
//!
//! Parsing of the vendor `boards.txt`/`platform.txt` text files is out of
//! scope for this crate; callers hand over a flat property map and this
//! module exposes it through the [`BoardConfig`] trait the resolver and
//! planner consume: key/value properties, compile recipes and the macro
//! seed derived from the board identity.

use crate::{
    error::{Result, SketchError},
    resolver::{DependencyKind, SearchRoot},
};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

/// Default `ARDUINO` IDE version macro when the board properties don't pin
/// one; `10607` is what vendor cores assume as a floor.
pub const DEFAULT_IDE_VERSION: &str = "10607";

/// Opaque provider of board configuration.
///
/// Implementations yield a flat key/value map plus compile recipe strings.
pub trait BoardConfig {
    /// Returns the raw property for `key`, if present.
    fn property(&self, key: &str) -> Option<&str>;

    /// Returns the recipe pattern for `name` (`"cpp.o"`, `"ar"`,
    /// `"c.combine"`, `"objcopy.hex"`, ...), with placeholders unexpanded.
    fn recipe(&self, name: &str) -> Option<&str>;

    /// Ordered include-search roots: core first, then variant, then
    /// library roots.
    fn search_roots(&self) -> Vec<SearchRoot>;

    /// Macros predefined for every translation unit of this board.
    fn seed_macros(&self) -> Vec<(String, Option<String>)>;

    /// Header whose inclusion turns a sketch into a translation unit.
    fn core_header(&self) -> String {
        self.property("build.core_header").unwrap_or("Arduino.h").to_string()
    }
}

/// A [`BoardConfig`] backed by an in-memory property map.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoardDefinition {
    properties: BTreeMap<String, String>,
    core: PathBuf,
    variant: Option<PathBuf>,
    libraries: Vec<PathBuf>,
}

impl BoardDefinition {
    /// Creates a definition from resolved core/variant directories and the
    /// flattened board properties.
    pub fn from_properties(
        core: impl Into<PathBuf>,
        variant: Option<&Path>,
        properties: impl IntoIterator<Item = (String, String)>,
    ) -> Result<Self> {
        let core = core.into();
        if !core.is_dir() {
            return Err(SketchError::msg(format!(
                "core directory \"{}\" does not exist",
                core.display()
            )));
        }
        Ok(Self {
            properties: properties.into_iter().collect(),
            core,
            variant: variant.map(Into::into),
            libraries: Vec::new(),
        })
    }

    /// Registers a single library root (the directory of one library).
    pub fn add_library(&mut self, root: impl Into<PathBuf>) -> &mut Self {
        self.libraries.push(root.into());
        self
    }

    /// Registers every child directory of `dir` as a library root, in name
    /// order, mirroring a `libraries/` folder layout.
    pub fn add_libraries_dir(&mut self, dir: impl AsRef<Path>) -> Result<&mut Self> {
        let dir = dir.as_ref();
        let mut children = fs::read_dir(dir)
            .map_err(|err| SketchError::io(err, dir))?
            .filter_map(std::result::Result::ok)
            .map(|e| e.path())
            .filter(|p| p.is_dir())
            .collect::<Vec<_>>();
        children.sort();
        self.libraries.extend(children);
        Ok(self)
    }

    pub fn set_property(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn core_dir(&self) -> &Path {
        &self.core
    }

    pub fn variant_dir(&self) -> Option<&Path> {
        self.variant.as_deref()
    }

    fn root_name(path: &Path) -> String {
        path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default()
    }
}

impl BoardConfig for BoardDefinition {
    fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    fn recipe(&self, name: &str) -> Option<&str> {
        self.property(&format!("recipe.{name}.pattern"))
    }

    fn search_roots(&self) -> Vec<SearchRoot> {
        let mut roots = Vec::with_capacity(2 + self.libraries.len());
        roots.push(SearchRoot::new(DependencyKind::Core, Self::root_name(&self.core), &self.core));
        if let Some(variant) = &self.variant {
            roots.push(SearchRoot::new(DependencyKind::Variant, Self::root_name(variant), variant));
        }
        for lib in &self.libraries {
            roots.push(SearchRoot::new(DependencyKind::Library, Self::root_name(lib), lib));
        }
        roots
    }

    fn seed_macros(&self) -> Vec<(String, Option<String>)> {
        let mut seed = Vec::new();
        let ide = self.property("runtime.ide.version").unwrap_or(DEFAULT_IDE_VERSION);
        seed.push(("ARDUINO".to_string(), Some(ide.to_string())));
        if let Some(board) = self.property("build.board") {
            seed.push((format!("ARDUINO_{board}"), None));
        }
        if let Some(arch) = self.property("build.arch") {
            seed.push((format!("ARDUINO_ARCH_{}", arch.to_uppercase()), None));
        }
        if let Some(f_cpu) = self.property("build.f_cpu") {
            seed.push(("F_CPU".to_string(), Some(f_cpu.to_string())));
        }
        if let Some(flags) = self.property("build.extra_flags") {
            seed.extend(parse_define_flags(flags));
        }
        seed
    }
}

/// Extracts `-DNAME[=VALUE]` tokens from a flag string.
pub(crate) fn parse_define_flags(flags: &str) -> Vec<(String, Option<String>)> {
    crate::utils::split_command(flags)
        .into_iter()
        .filter_map(|token| {
            let def = token.strip_prefix("-D")?;
            if def.is_empty() {
                return None;
            }
            Some(match def.split_once('=') {
                Some((name, value)) => (name.to_string(), Some(value.to_string())),
                None => (def.to_string(), None),
            })
        })
        .collect()
}

/// Where a project reads from and builds to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectPathsConfig {
    /// The sketch file (`.ino`, or a plain `.cpp` entry point).
    pub sketch: PathBuf,
    /// Root of all build outputs.
    pub build_dir: PathBuf,
    /// Object cache location; `None` selects the per-user default.
    pub cache_dir: Option<PathBuf>,
}

impl ProjectPathsConfig {
    pub fn new(sketch: impl Into<PathBuf>, build_dir: impl Into<PathBuf>) -> Self {
        Self { sketch: sketch.into(), build_dir: build_dir.into(), cache_dir: None }
    }

    /// The directory holding the sketch and its sibling sources.
    pub fn sketch_dir(&self) -> &Path {
        self.sketch.parent().unwrap_or_else(|| Path::new("."))
    }

    /// Base name used for artifacts (`<name>.elf`, `<name>.hex`).
    pub fn project_name(&self) -> String {
        self.sketch.file_stem().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default()
    }

    /// Directory compile outputs land in.
    pub fn objects_dir(&self) -> PathBuf {
        self.build_dir.join("objects")
    }

    /// Location of the synthesized sketch translation unit.
    pub fn sketch_unit_path(&self) -> PathBuf {
        let file = self
            .sketch
            .file_name()
            .map(|n| format!("{}.cpp", n.to_string_lossy()))
            .unwrap_or_else(|| "sketch.ino.cpp".to_string());
        self.build_dir.join("sketch").join(file)
    }
}
