//! Turning a sketch into a compilable translation unit.
//!
//! An `.ino` file is C++ minus the boilerplate: the core header include and
//! the forward declarations for functions used before they are defined.
//! Synthesis prepends both, and keeps an offset table so compiler
//! diagnostics can be mapped back onto the original sketch lines. The
//! synthesized unit is what dependency analysis sees and what the planner
//! compiles; the `.ino` itself never reaches the compiler.

use crate::{
    error::Result,
    utils,
};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Matches a top-level function definition head: specifiers and return
/// type, name, parameter list, then an opening brace.
static RE_FUNCTION_HEAD: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?m)^[ \t]*((?:(?:static|inline|unsigned|signed|const|long|short|volatile)[ \t]+)*[A-Za-z_]\w*(?:<[^>\n]*>)?(?:[ \t*&]|[\r\n])+)([A-Za-z_]\w*)[ \t]*\(([^()]*)\)[\s]*\{",
    )
    .unwrap()
});

/// Names that make a regex match a control-flow statement, not a function.
const NON_FUNCTION_WORDS: &[&str] =
    &["if", "else", "for", "while", "switch", "return", "do", "case", "new", "delete", "sizeof"];

/// A sketch rewritten as a C++ translation unit.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SketchUnit {
    /// The original sketch file.
    pub ino: PathBuf,
    /// Where the synthesized unit is written under the build directory.
    pub unit_path: PathBuf,
    /// Full synthesized source text.
    pub source: String,
    /// Generated forward declarations, in source order.
    pub prototypes: Vec<String>,
    /// 1-based line in the synthesized unit where the original content
    /// starts; everything above it was injected.
    pub injected_lines: u32,
}

impl SketchUnit {
    /// Builds the unit from the sketch content.
    ///
    /// `core_header` is the board's entry header (`Arduino.h` for vendor
    /// cores). Sketches that already are plain C++ (`.cpp` entry points)
    /// pass through untouched apart from the path change.
    pub fn synthesize(
        ino: impl Into<PathBuf>,
        unit_path: impl Into<PathBuf>,
        content: &str,
        core_header: &str,
    ) -> Self {
        let ino = ino.into();
        let unit_path = unit_path.into();
        if ino.extension().map(|ext| ext != "ino").unwrap_or(true) {
            return Self {
                ino,
                unit_path,
                source: content.to_string(),
                prototypes: Vec::new(),
                injected_lines: 0,
            };
        }

        let prototypes = extract_prototypes(content);
        let mut source =
            String::with_capacity(content.len() + 64 + prototypes.iter().map(String::len).sum::<usize>());
        source.push_str(&format!("#include <{core_header}>\n"));
        for proto in &prototypes {
            source.push_str(proto);
            source.push('\n');
        }
        let injected_lines = 1 + prototypes.len() as u32;
        source.push_str(content);

        debug!(
            sketch = %ino.display(),
            prototypes = prototypes.len(),
            "synthesized sketch translation unit"
        );
        Self { ino, unit_path, source, prototypes, injected_lines }
    }

    /// Maps a line of the synthesized unit back onto the sketch. Lines in
    /// the injected prelude have no original counterpart.
    pub fn remap_line(&self, line: u32) -> Option<u32> {
        line.checked_sub(self.injected_lines).filter(|l| *l > 0)
    }

    /// Writes the synthesized source under the build directory.
    pub fn write(&self) -> Result<()> {
        utils::create_parent_dir_all(&self.unit_path)?;
        std::fs::write(&self.unit_path, &self.source)
            .map_err(|err| crate::error::SketchError::io(err, &self.unit_path))?;
        Ok(())
    }

    /// Rewrites diagnostics that point into the synthesized unit so they
    /// reference the original sketch coordinates.
    pub fn remap_diagnostic_text(&self, text: &str) -> String {
        let needle = self.unit_path.display().to_string();
        let mut out = String::with_capacity(text.len());
        for line in text.split_inclusive('\n') {
            out.push_str(&self.remap_one(line, &needle));
        }
        out
    }

    fn remap_one(&self, line: &str, needle: &str) -> String {
        let Some(start) = line.find(needle) else { return line.to_string() };
        let rest = &line[start + needle.len()..];
        let Some(num_text) = rest.strip_prefix(':') else { return line.to_string() };
        let digits: String = num_text.chars().take_while(char::is_ascii_digit).collect();
        let Ok(num) = digits.parse::<u32>() else { return line.to_string() };
        let Some(mapped) = self.remap_line(num) else { return line.to_string() };
        format!(
            "{}{}:{}{}",
            &line[..start],
            self.ino.display(),
            mapped,
            &rest[1 + digits.len()..]
        )
    }
}

/// Extracts forward declarations for every top-level function definition.
///
/// Operates on sanitized text (comments and literal contents blanked), then
/// slices the original so default arguments and exotic spacing survive.
fn extract_prototypes(content: &str) -> Vec<String> {
    let sanitized = utils::sanitize_source(content);
    let mut prototypes = Vec::new();
    for caps in RE_FUNCTION_HEAD.captures_iter(&sanitized) {
        let (Some(ret), Some(name), Some(args)) = (caps.get(1), caps.get(2), caps.get(3)) else {
            continue;
        };
        let ret_text = content[ret.range()].split_whitespace().collect::<Vec<_>>().join(" ");
        let name_text = &content[name.range()];
        if NON_FUNCTION_WORDS.contains(&name_text)
            || ret_text.split_whitespace().any(|w| NON_FUNCTION_WORDS.contains(&w))
        {
            continue;
        }
        let args_text = content[args.range()].trim();
        prototypes.push(format!("{ret_text} {name_text}({args_text});"));
    }
    prototypes
}
