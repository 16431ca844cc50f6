//! Driving the board's toolchain.
//!
//! A compile step is a recipe string from the board configuration with its
//! placeholders substituted; this module materializes those commands,
//! probes the toolchain binaries for an identity string (folded into cache
//! fingerprints), and spawns child processes with optional cancellation.

pub mod executor;
pub mod planner;

pub use executor::{execute, ExecuteOptions};
pub use planner::{BuildNode, BuildPlan, BuildStep, ConvertFormat};

use crate::utils;
use semver::Version;
use std::{
    collections::HashMap,
    io::Read,
    process::{Command, Output, Stdio},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

/// Probes and caches the identity of toolchain binaries.
///
/// The identity (program plus the first line of `--version` output, and the
/// parsed version when one is recognizable) goes into every compile
/// fingerprint, so switching compilers invalidates cached objects even when
/// commands and sources are unchanged.
#[derive(Debug, Default)]
pub struct Toolchain {
    identities: Mutex<HashMap<String, String>>,
}

impl Toolchain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a stable identity string for `program`.
    ///
    /// Falls back to the program name itself when the binary cannot be
    /// executed; the build then fails later with a clearer spawn error.
    pub fn identity(&self, program: &str) -> String {
        if let Some(found) = self.identities.lock().unwrap().get(program) {
            return found.clone();
        }
        let identity = probe_version(program)
            .map(|line| format!("{program} {line}"))
            .unwrap_or_else(|| program.to_string());
        trace!(program, %identity, "probed toolchain");
        self.identities.lock().unwrap().insert(program.to_string(), identity.clone());
        identity
    }

    /// Best-effort semantic version of `program`, when its `--version`
    /// banner carries one.
    pub fn version(&self, program: &str) -> Option<Version> {
        let identity = self.identity(program);
        identity
            .split_whitespace()
            .filter_map(|word| Version::parse(word.trim_start_matches('v')).ok())
            .next()
    }
}

fn probe_version(program: &str) -> Option<String> {
    let output = Command::new(program)
        .arg("--version")
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    stdout.lines().next().map(|line| line.trim().to_string()).filter(|line| !line.is_empty())
}

/// Substitutes `{placeholder}`s in a recipe pattern.
///
/// `vars` resolves step-level placeholders (`{source_file}`, `{includes}`,
/// ...); unresolved keys fall through to the board properties and finally
/// to an empty string, which is how vendor tooling treats unknown keys.
/// Values substituted from board properties get their quoted `-D` tokens
/// re-escaped so the split command preserves the intended literals.
pub fn materialize_recipe(
    pattern: &str,
    vars: &dyn Fn(&str) -> Option<String>,
    property: &dyn Fn(&str) -> Option<String>,
) -> String {
    let mut out = String::with_capacity(pattern.len());
    let mut rest = pattern;
    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        match after.find('}') {
            Some(end) => {
                let key = &after[..end];
                if let Some(value) = vars(key) {
                    out.push_str(&value);
                } else if let Some(value) = property(key) {
                    out.push_str(&utils::escape_macro_defines(&value));
                } else {
                    trace!(key, "unresolved recipe placeholder");
                }
                rest = &after[end + 1..];
            }
            None => {
                out.push('{');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

/// The spawned child's captured result.
#[derive(Debug)]
pub struct ChildOutput {
    pub output: Output,
    pub elapsed: Duration,
}

/// Spawns a materialized command and waits for it.
///
/// With a cancel flag set, dispatching stops upstream; an in-flight child
/// is given `grace` to finish and then killed. Output pipes are drained on
/// reader threads so a chatty compiler can't deadlock against a full pipe.
pub fn run_command(
    command: &str,
    cancel: Option<&Arc<AtomicBool>>,
    grace: Duration,
) -> std::io::Result<ChildOutput> {
    let args = utils::split_command(command);
    let (program, rest) = args
        .split_first()
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty command"))?;

    let start = Instant::now();
    let mut child = Command::new(program)
        .args(rest)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let stdout_reader = std::thread::spawn(move || drain(stdout));
    let stderr_reader = std::thread::spawn(move || drain(stderr));

    let status = loop {
        if let Some(status) = child.try_wait()? {
            break status;
        }
        if let Some(cancel) = cancel {
            if cancel.load(Ordering::Relaxed) && start.elapsed() > grace {
                warn!(program = %program, "grace period elapsed, terminating child");
                let _ = child.kill();
                break child.wait()?;
            }
        }
        std::thread::sleep(Duration::from_millis(10));
    };

    let stdout = stdout_reader.join().unwrap_or_default();
    let stderr = stderr_reader.join().unwrap_or_default();
    Ok(ChildOutput { output: Output { status, stdout, stderr }, elapsed: start.elapsed() })
}

fn drain(pipe: Option<impl Read>) -> Vec<u8> {
    let mut buffer = Vec::new();
    if let Some(mut pipe) = pipe {
        let _ = pipe.read_to_end(&mut buffer);
    }
    buffer
}

/// Renders an exit for diagnostics: stderr first, stdout as fallback.
pub(crate) fn failure_text(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let trimmed = stderr.trim();
    if !trimmed.is_empty() {
        return stderr.into_owned();
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    if stdout.trim().is_empty() {
        "<empty output>".to_string()
    } else {
        stdout.into_owned()
    }
}
