//! Utility functions

use crate::error::{Result, SketchError};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{de::DeserializeOwned, Serialize};
use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};
use walkdir::WalkDir;

/// Extensions of compilable translation units.
pub const SOURCE_EXTENSIONS: &[&str] = &["c", "cpp", "S"];

/// Directories under a library root that never contribute build sources.
pub const EXCLUDED_SOURCE_DIRS: &[&str] = &["examples", "tests", "docs", "extras"];

/// Returns an iterator over all compilable files under `root`, sorted by
/// file name so traversal order is stable across platforms and runs.
///
/// Skips the conventional non-source subtrees (`examples/`, `tests/`, ...).
pub fn source_files_iter<'a>(
    root: &Path,
    extensions: &'a [&'a str],
) -> impl Iterator<Item = PathBuf> + 'a {
    WalkDir::new(root)
        .follow_links(true)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| {
            !e.file_type().is_dir()
                || e.file_name()
                    .to_str()
                    .map(|name| !EXCLUDED_SOURCE_DIRS.contains(&name) && !name.starts_with('.'))
                    .unwrap_or(true)
        })
        .filter_map(std::result::Result::ok)
        .filter(|e| e.file_type().is_file())
        .filter(|e| {
            e.path().extension().map(|ext| extensions.iter().any(|x| ext == *x)).unwrap_or_default()
        })
        .map(|e| e.path().into())
}

/// Returns a sorted list of all compilable files under `root`.
pub fn source_files(root: &Path, extensions: &[&str]) -> Vec<PathBuf> {
    source_files_iter(root, extensions).collect()
}

/// Canonicalize the path, returning an absolute path without UNC prefixes on
/// Windows.
pub fn canonicalize(path: impl AsRef<Path>) -> Result<PathBuf> {
    let path = path.as_ref();
    dunce::canonicalize(path).map_err(|err| SketchError::io(err, path))
}

/// Canonicalize the path, or return it untouched if it does not exist.
pub fn canonicalized(path: impl Into<PathBuf>) -> PathBuf {
    let path = path.into();
    canonicalize(&path).unwrap_or(path)
}

pub fn read_to_string(path: impl AsRef<Path>) -> Result<String> {
    let path = path.as_ref();
    fs::read_to_string(path).map_err(|err| SketchError::io(err, path))
}

/// Creates the parent directory of the file so it can be written.
pub fn create_parent_dir_all(file: impl AsRef<Path>) -> Result<()> {
    let file = file.as_ref();
    if let Some(parent) = file.parent() {
        fs::create_dir_all(parent).map_err(|err| SketchError::io(err, parent))?;
    }
    Ok(())
}

pub fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path).map_err(|err| SketchError::io(err, path))?;
    serde_json::from_str(&contents).map_err(Into::into)
}

pub fn write_json_file<T: Serialize>(value: &T, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    create_parent_dir_all(path)?;
    let file = fs::File::create(path).map_err(|err| SketchError::io(err, path))?;
    let mut writer = std::io::BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, value)?;
    writer.flush().map_err(|err| SketchError::io(err, path))?;
    Ok(())
}

/// Seconds since the unix epoch; clamps to zero on clocks before 1970.
pub fn unix_timestamp() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or_default()
}

/// Splits a fully materialized command line into its argv, honoring double
/// and single quotes and backslash escapes outside single quotes.
///
/// Recipes in board configurations are shell-flavored single strings; the
/// executor spawns the program directly, so the split has to agree with what
/// a shell would have produced for the common quoting forms.
pub fn split_command(command: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_arg = false;
    let mut quote: Option<char> = None;
    let mut chars = command.chars().peekable();

    while let Some(c) = chars.next() {
        match quote {
            Some('\'') => {
                if c == '\'' {
                    quote = None;
                } else {
                    current.push(c);
                }
            }
            Some('"') => match c {
                '"' => quote = None,
                '\\' => {
                    if let Some(&next) = chars.peek() {
                        if matches!(next, '"' | '\\' | '$' | '`') {
                            current.push(next);
                            chars.next();
                        } else {
                            current.push(c);
                        }
                    } else {
                        current.push(c);
                    }
                }
                _ => current.push(c),
            },
            _ => match c {
                '\'' | '"' => {
                    quote = Some(c);
                    in_arg = true;
                }
                '\\' => {
                    if let Some(next) = chars.next() {
                        current.push(next);
                        in_arg = true;
                    }
                }
                c if c.is_whitespace() => {
                    if in_arg {
                        args.push(std::mem::take(&mut current));
                        in_arg = false;
                    }
                }
                _ => {
                    current.push(c);
                    in_arg = true;
                }
            },
        }
    }
    if in_arg {
        args.push(current);
    }
    args
}

/// Matches a `-DNAME="..."` flag whose value is a quoted string literal.
static RE_QUOTED_DEFINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(-D[A-Za-z_]\w*=)"([^"]*)""#).unwrap());

/// Escapes macro-definition arguments that embed quoted strings, so the
/// spawned compiler sees the intended literal.
///
/// Board properties carry flags like `-DUSB_PRODUCT="Arduino Uno"` where
/// the quotes belong to the C literal. Substituted verbatim they would be
/// eaten by command splitting; rewrapping as `"-DUSB_PRODUCT=\"Arduino
/// Uno\""` makes the split yield the intended argument.
pub fn escape_macro_defines(flags: &str) -> String {
    RE_QUOTED_DEFINE.replace_all(flags, "\"$1\\\"$2\\\"\"").into_owned()
}

/// Blanks comments and the contents of string and character literals while
/// preserving byte offsets and newlines.
///
/// The output is what directive scanning and prototype extraction operate
/// on: positions map one to one back into the original source.
pub fn sanitize_source(source: &str) -> String {
    blank_source(source, true)
}

/// Blanks comments only, leaving string and character literals intact.
/// Offsets and newlines are preserved like in [`sanitize_source`].
pub fn strip_comments(source: &str) -> String {
    blank_source(source, false)
}

fn blank_source(source: &str, blank_literals: bool) -> String {
    #[derive(PartialEq)]
    enum State {
        Normal,
        LineComment,
        BlockComment,
        Str,
        Char,
    }

    let bytes = source.as_bytes();
    let mut out = bytes.to_vec();
    let mut state = State::Normal;
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        match state {
            State::Normal => match b {
                b'/' if bytes.get(i + 1) == Some(&b'/') => {
                    state = State::LineComment;
                    out[i] = b' ';
                    out[i + 1] = b' ';
                    i += 1;
                }
                b'/' if bytes.get(i + 1) == Some(&b'*') => {
                    state = State::BlockComment;
                    out[i] = b' ';
                    out[i + 1] = b' ';
                    i += 1;
                }
                b'"' => state = State::Str,
                b'\'' => state = State::Char,
                _ => {}
            },
            State::LineComment => {
                if b == b'\n' {
                    state = State::Normal;
                } else {
                    out[i] = b' ';
                }
            }
            State::BlockComment => {
                if b == b'*' && bytes.get(i + 1) == Some(&b'/') {
                    out[i] = b' ';
                    out[i + 1] = b' ';
                    state = State::Normal;
                    i += 1;
                } else if b != b'\n' {
                    out[i] = b' ';
                }
            }
            State::Str | State::Char => {
                let delim = if state == State::Str { b'"' } else { b'\'' };
                if b == b'\\' && i + 1 < bytes.len() {
                    if blank_literals {
                        out[i] = b' ';
                        if bytes[i + 1] != b'\n' {
                            out[i + 1] = b' ';
                        }
                    }
                    i += 1;
                } else if b == delim {
                    state = State::Normal;
                } else if b == b'\n' {
                    // unterminated literal; don't swallow the rest of the file
                    state = State::Normal;
                } else if blank_literals {
                    out[i] = b' ';
                }
            }
        }
        i += 1;
    }

    // every replacement is ASCII and multi-byte sequences are blanked whole
    String::from_utf8(out).unwrap_or_else(|e| {
        String::from_utf8_lossy(e.as_bytes()).into_owned()
    })
}
