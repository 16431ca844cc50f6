//! Mapping `#include` names onto the filesystem.

use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};
use walkdir::WalkDir;

/// What role a search root (and the dependency resolved from it) plays in
/// the build.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DependencyKind {
    Sketch,
    Core,
    Variant,
    Library,
}

/// One directory includes are resolved against.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchRoot {
    pub kind: DependencyKind,
    pub name: String,
    pub path: PathBuf,
}

impl SearchRoot {
    pub fn new(kind: DependencyKind, name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self { kind, name: name.into(), path: path.into() }
    }
}

/// A successful resolution: the absolute header path and the index of the
/// root that supplied it (`None` for a current-directory hit of a quoted
/// include).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedInclude {
    pub path: PathBuf,
    pub root: Option<usize>,
}

/// Resolves include names by probing an ordered, fixed list of roots.
///
/// Root-relative results are cached per `(name, is_system)`; the root list
/// never changes for the lifetime of a resolver, so the cache key doesn't
/// need to re-hash it. Current-directory hits of quoted includes depend on
/// the including file and bypass the cache.
#[derive(Debug)]
pub struct IncludeResolver {
    roots: Vec<SearchRoot>,
    cache: HashMap<(String, bool), Option<ResolvedInclude>>,
}

impl IncludeResolver {
    pub fn new(roots: Vec<SearchRoot>) -> Self {
        Self { roots, cache: HashMap::new() }
    }

    pub fn roots(&self) -> &[SearchRoot] {
        &self.roots
    }

    /// Maps an include to an absolute path.
    ///
    /// Quoted includes probe `current_dir` first; system includes skip it.
    /// Roots are then probed in order and the first match wins, which is
    /// also the tie-break when two roots expose the same header.
    pub fn resolve(
        &mut self,
        name: &str,
        system: bool,
        current_dir: &Path,
    ) -> Option<ResolvedInclude> {
        if !system {
            let local = current_dir.join(name);
            if local.is_file() {
                return Some(ResolvedInclude { path: crate::utils::canonicalized(local), root: None });
            }
        }

        if let Some(cached) = self.cache.get(&(name.to_string(), system)) {
            return cached.clone();
        }

        let resolved = self.probe_roots(name);
        match &resolved {
            Some(hit) => trace!(
                name,
                root = hit.root.map(|i| self.roots[i].name.as_str()).unwrap_or(""),
                path = %hit.path.display(),
                "resolved include"
            ),
            None => trace!(name, "include not found in any root"),
        }
        self.cache.insert((name.to_string(), system), resolved.clone());
        resolved
    }

    fn probe_roots(&self, name: &str) -> Option<ResolvedInclude> {
        for (index, root) in self.roots.iter().enumerate() {
            if let Some(path) = probe_root(&root.path, name) {
                return Some(ResolvedInclude {
                    path: crate::utils::canonicalized(path),
                    root: Some(index),
                });
            }
        }
        None
    }
}

/// Probes the layout variants a root may use: flat headers at the top,
/// `src/`-based (including nested subdirectories), and `utility/`.
fn probe_root(root: &Path, name: &str) -> Option<PathBuf> {
    let direct = root.join(name);
    if direct.is_file() {
        return Some(direct);
    }

    let src = root.join("src");
    let in_src = src.join(name);
    if in_src.is_file() {
        return Some(in_src);
    }
    if src.is_dir() {
        if let Some(found) = probe_tree(&src, name) {
            return Some(found);
        }
    }

    let in_utility = root.join("utility").join(name);
    if in_utility.is_file() {
        return Some(in_utility);
    }

    None
}

/// Deep search under `src/` for a relative suffix match, in sorted order so
/// resolution is deterministic.
fn probe_tree(src: &Path, name: &str) -> Option<PathBuf> {
    let suffix = Path::new(name);
    WalkDir::new(src)
        .follow_links(true)
        .sort_by_file_name()
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .find(|p| p.ends_with(suffix))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn touch(path: &Path) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, "").unwrap();
    }

    fn resolver(roots: &[(DependencyKind, &PathBuf)]) -> IncludeResolver {
        IncludeResolver::new(
            roots
                .iter()
                .map(|(kind, path)| {
                    SearchRoot::new(*kind, path.file_name().unwrap().to_string_lossy(), *path)
                })
                .collect(),
        )
    }

    #[test]
    fn quoted_includes_prefer_current_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let sketch = tmp.path().join("sketch");
        let lib = tmp.path().join("Lib");
        touch(&sketch.join("config.h"));
        touch(&lib.join("config.h"));

        let mut resolver = resolver(&[(DependencyKind::Library, &lib)]);
        let hit = resolver.resolve("config.h", false, &sketch).unwrap();
        assert_eq!(hit.root, None);
        assert!(hit.path.ends_with("sketch/config.h"));

        // system includes skip the current dir
        let hit = resolver.resolve("config.h", true, &sketch).unwrap();
        assert_eq!(hit.root, Some(0));
    }

    #[test]
    fn probes_layout_variants() {
        let tmp = tempfile::tempdir().unwrap();
        let flat = tmp.path().join("Flat");
        let srcd = tmp.path().join("Srcd");
        let util = tmp.path().join("Util");
        touch(&flat.join("Flat.h"));
        touch(&srcd.join("src").join("Srcd.h"));
        touch(&srcd.join("src").join("nested").join("deep.h"));
        touch(&util.join("utility").join("helper.h"));

        let mut resolver = resolver(&[
            (DependencyKind::Library, &flat),
            (DependencyKind::Library, &srcd),
            (DependencyKind::Library, &util),
        ]);
        let cwd = tmp.path().to_path_buf();

        assert_eq!(resolver.resolve("Flat.h", true, &cwd).unwrap().root, Some(0));
        assert_eq!(resolver.resolve("Srcd.h", true, &cwd).unwrap().root, Some(1));
        assert_eq!(resolver.resolve("deep.h", true, &cwd).unwrap().root, Some(1));
        assert_eq!(resolver.resolve("helper.h", true, &cwd).unwrap().root, Some(2));
        assert_eq!(resolver.resolve("missing.h", true, &cwd), None);
    }

    #[test]
    fn first_root_wins_on_collisions() {
        let tmp = tempfile::tempdir().unwrap();
        let a = tmp.path().join("A");
        let b = tmp.path().join("B");
        touch(&a.join("shared.h"));
        touch(&b.join("shared.h"));

        let mut resolver =
            resolver(&[(DependencyKind::Library, &a), (DependencyKind::Library, &b)]);
        let hit = resolver.resolve("shared.h", true, tmp.path()).unwrap();
        assert_eq!(hit.root, Some(0));

        // cached second lookup returns the same result
        let again = resolver.resolve("shared.h", true, tmp.path()).unwrap();
        assert_eq!(hit, again);
    }

    #[test]
    fn resolves_subdirectory_includes() {
        let tmp = tempfile::tempdir().unwrap();
        let lib = tmp.path().join("Lib");
        touch(&lib.join("src").join("sub").join("impl.h"));

        let mut resolver = resolver(&[(DependencyKind::Library, &lib)]);
        let hit = resolver.resolve("sub/impl.h", true, tmp.path()).unwrap();
        assert!(hit.path.ends_with("Lib/src/sub/impl.h"));
    }
}
