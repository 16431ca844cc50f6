//! Macro tables flowing through dependency analysis.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// A single `#define`, or a macro injected from the board/CLI seed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MacroDef {
    /// Replacement text; `None` for bare `#define NAME` and function-like
    /// macros (both count as defined, neither substitutes as a value).
    pub value: Option<String>,
    /// Seeded macros win over in-file `#define`s until an `#undef` clears
    /// them.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub seeded: bool,
}

/// Mapping from macro name to its current definition.
///
/// Backed by a `BTreeMap` so equality, iteration and fingerprints are
/// deterministic. Later `#define`s shadow earlier ones; there is no
/// versioning because only the taken branch of a conditional ever mutates
/// the table.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MacroTable {
    defs: BTreeMap<String, MacroDef>,
}

impl MacroTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a table of seed macros, e.g. from
    /// [`BoardConfig::seed_macros`](crate::BoardConfig::seed_macros).
    pub fn seeded(macros: impl IntoIterator<Item = (String, Option<String>)>) -> Self {
        let mut table = Self::new();
        for (name, value) in macros {
            table.define_seed(name, value);
        }
        table
    }

    /// Applies a file-level `#define`. A seeded definition of the same name
    /// is left untouched.
    pub fn define(&mut self, name: impl Into<String>, value: Option<String>) {
        let name = name.into();
        if self.defs.get(&name).map(|def| def.seeded).unwrap_or(false) {
            trace!(%name, "ignoring #define shadowing seeded macro");
            return;
        }
        self.defs.insert(name, MacroDef { value, seeded: false });
    }

    /// Inserts a command-line/board seed macro, overwriting anything there.
    pub fn define_seed(&mut self, name: impl Into<String>, value: Option<String>) {
        self.defs.insert(name.into(), MacroDef { value, seeded: true });
    }

    /// Removes a definition. `#undef` also clears the seeded flag, making
    /// the name fair game for later `#define`s.
    pub fn undef(&mut self, name: &str) {
        self.defs.remove(name);
    }

    pub fn get(&self, name: &str) -> Option<&MacroDef> {
        self.defs.get(name)
    }

    pub fn is_defined(&self, name: &str) -> bool {
        self.defs.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.defs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.defs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &MacroDef)> {
        self.defs.iter()
    }

    /// Projects the table onto `names`: the sub-table of definitions a file
    /// actually read, which is the memoization key for its analysis.
    pub fn subtable(&self, names: &BTreeSet<String>) -> MacroTable {
        MacroTable {
            defs: names
                .iter()
                .filter_map(|name| self.defs.get(name).map(|def| (name.clone(), def.clone())))
                .collect(),
        }
    }
}

impl FromIterator<(String, MacroDef)> for MacroTable {
    fn from_iter<T: IntoIterator<Item = (String, MacroDef)>>(iter: T) -> Self {
        Self { defs: iter.into_iter().collect() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn seeded_macros_resist_redefinition() {
        let mut table = MacroTable::seeded([("F_CPU".to_string(), Some("16000000L".to_string()))]);
        table.define("F_CPU", Some("8000000L".to_string()));
        assert_eq!(table.get("F_CPU").and_then(|d| d.value.as_deref()), Some("16000000L"));

        table.undef("F_CPU");
        assert!(!table.is_defined("F_CPU"));
        table.define("F_CPU", Some("8000000L".to_string()));
        assert_eq!(table.get("F_CPU").and_then(|d| d.value.as_deref()), Some("8000000L"));
    }

    #[test]
    fn subtable_filters_to_referenced_names() {
        let mut table = MacroTable::new();
        table.define("A", Some("1".to_string()));
        table.define("B", None);
        table.define("C", Some("3".to_string()));

        let names: BTreeSet<String> = ["A", "C", "MISSING"].iter().map(|s| s.to_string()).collect();
        let sub = table.subtable(&names);
        assert_eq!(sub.len(), 2);
        assert!(sub.is_defined("A"));
        assert!(sub.is_defined("C"));
        assert!(!sub.is_defined("B"));
    }
}
