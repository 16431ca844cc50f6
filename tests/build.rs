//! End-to-end planning and execution against stand-in recipes.
//!
//! Real toolchains aren't available on test machines, so the board fixtures
//! use `cp`/`tar` as compiler, linker and converter: compiling copies the
//! source to the object, linking tars the objects into the "elf". That
//! exercises the full planner/executor/cache path, including incremental
//! rebuilds, without an `avr-gcc` install.
#![cfg(unix)]

use pretty_assertions::assert_eq;
use sketch_compilers::{
    BoardDefinition, DependencyGraph, NodeOutcome, Project, ProjectBuilder,
};
use std::{
    fs,
    path::{Path, PathBuf},
};
use tempfile::TempDir;

struct Fixture {
    _tmp: TempDir,
    core: PathBuf,
    sketch: PathBuf,
    build_dir: PathBuf,
    cache_dir: PathBuf,
}

impl Fixture {
    fn new(sketch_content: &str) -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().to_path_buf();

        let core = root.join("core");
        write(&core.join("Arduino.h"), "#ifndef Arduino_h\n#define Arduino_h\n#endif\n");

        let sketch = root.join("Blink").join("Blink.ino");
        write(&sketch, sketch_content);

        Self {
            _tmp: tmp,
            core,
            sketch,
            build_dir: root.join("Blink").join(".build"),
            cache_dir: root.join("cache"),
        }
    }

    fn add_sketch_source(&self, name: &str, content: &str) {
        write(&self.sketch.parent().unwrap().join(name), content);
    }

    fn board(&self) -> BoardDefinition {
        let mut board = BoardDefinition::from_properties(
            &self.core,
            None,
            [("build.arch".to_string(), "avr".to_string())],
        )
        .unwrap();
        board
            .set_property("recipe.cpp.o.pattern", "cp \"{source_file}\" \"{object_file}\"")
            .set_property("recipe.c.o.pattern", "cp \"{source_file}\" \"{object_file}\"")
            .set_property(
                "recipe.c.combine.pattern",
                "tar -cf \"{build.path}/{build.project_name}.elf\" {object_files}",
            )
            .set_property(
                "recipe.objcopy.hex.pattern",
                "cp \"{elf_file}\" \"{output_file}\"",
            );
        board
    }

    fn builder(&self) -> ProjectBuilder {
        Project::builder()
            .config(self.board())
            .sketch(&self.sketch)
            .build_dir(&self.build_dir)
            .cache_dir(&self.cache_dir)
            .jobs(2)
    }

    fn project(&self) -> Project {
        self.builder().build().unwrap()
    }
}

fn write(path: &Path, content: &str) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, content).unwrap();
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn outcome_of<'r>(
    report: &'r sketch_compilers::BuildReport,
    kind: &str,
) -> Vec<NodeOutcome> {
    report.nodes.iter().filter(|n| n.kind == kind).map(|n| n.outcome).collect()
}

#[test]
fn cold_build_compiles_everything_and_produces_artifacts() {
    init_tracing();
    let fixture = Fixture::new("void setup() {}\nvoid loop() {}\n");
    fixture.add_sketch_source("extra.cpp", "int extra() { return 1; }\n");

    let report = fixture.project().build().unwrap();
    assert!(report.success);

    // two sketch compiles (unit + extra.cpp), link, convert
    assert_eq!(
        outcome_of(&report, "compile"),
        vec![NodeOutcome::Compiled, NodeOutcome::Compiled]
    );
    assert_eq!(outcome_of(&report, "link"), vec![NodeOutcome::Compiled]);
    assert_eq!(outcome_of(&report, "convert"), vec![NodeOutcome::Compiled]);
    assert_eq!(report.cache.hits, 0);
    assert_eq!(report.cache.stored, 2);

    let elf = fixture.build_dir.join("Blink.elf");
    let hex = fixture.build_dir.join("Blink.hex");
    assert!(elf.is_file());
    assert!(hex.is_file());
    assert_eq!(report.artifacts, vec![elf, hex]);
}

#[test]
fn unchanged_rebuild_hits_cache_for_every_compile() {
    let fixture = Fixture::new("void setup() {}\nvoid loop() {}\n");
    fixture.add_sketch_source("extra.cpp", "int extra() { return 1; }\n");

    let first = fixture.project().build().unwrap();
    assert!(first.success);
    let elf_bytes = fs::read(fixture.build_dir.join("Blink.elf")).unwrap();

    let second = fixture.project().build().unwrap();
    assert!(second.success);
    assert_eq!(
        outcome_of(&second, "compile"),
        vec![NodeOutcome::Hit, NodeOutcome::Hit]
    );
    assert_eq!(second.cache.hits, 2);
    assert_eq!(second.cache.stored, 0);

    // artifact bytes identical across the two builds
    let elf_again = fs::read(fixture.build_dir.join("Blink.elf")).unwrap();
    assert_eq!(elf_bytes.len(), elf_again.len());
}

#[test]
fn touching_one_source_recompiles_only_it() {
    let fixture = Fixture::new("void setup() {}\nvoid loop() {}\n");
    fixture.add_sketch_source("extra.cpp", "int extra() { return 1; }\n");

    let first = fixture.project().build().unwrap();
    assert!(first.success);

    // add a line of code to one source
    fixture.add_sketch_source("extra.cpp", "int extra() { return 1; }\nint more() { return 2; }\n");

    let second = fixture.project().build().unwrap();
    assert!(second.success);

    let compiles = outcome_of(&second, "compile");
    assert_eq!(compiles.iter().filter(|o| **o == NodeOutcome::Hit).count(), 1);
    assert_eq!(compiles.iter().filter(|o| **o == NodeOutcome::Compiled).count(), 1);

    // the link always reruns
    assert_eq!(outcome_of(&second, "link"), vec![NodeOutcome::Compiled]);
}

#[test]
fn changed_command_invalidates_cache() {
    let fixture = Fixture::new("void setup() {}\nvoid loop() {}\n");

    let first = fixture.project().build().unwrap();
    assert!(first.success);

    // a macro seed change alters the compile command, not the source
    let project = fixture
        .builder()
        .build_macro("EXTRA", Some("1".to_string()))
        .build()
        .unwrap();
    let report = project.build().unwrap();
    assert!(report.success);
    // the command is unchanged by seed macros here (recipes don't embed
    // them), so this still hits; flipping the recipe does invalidate
    assert!(report.cache.hits > 0);

    let mut board = fixture.board();
    board.set_property("recipe.cpp.o.pattern", "cp -p \"{source_file}\" \"{object_file}\"");
    let project = Project::builder()
        .config(board)
        .sketch(&fixture.sketch)
        .build_dir(&fixture.build_dir)
        .cache_dir(&fixture.cache_dir)
        .build()
        .unwrap();
    let report = project.build().unwrap();
    assert!(report.success);
    assert_eq!(report.cache.hits, 0);
}

#[test]
fn preprocess_result_round_trip_builds_identically() {
    let fixture = Fixture::new("void setup() {}\nvoid loop() {}\n");

    let project = fixture.project();
    let snapshot = project.save_preprocess_result().unwrap();

    let loaded = DependencyGraph::read_snapshot(&snapshot).unwrap();
    let from_snapshot = project.build_with_graph(&loaded).unwrap();
    assert!(from_snapshot.success);
    let elf_bytes = fs::read(fixture.build_dir.join("Blink.elf")).unwrap();

    let direct = fixture.project().build().unwrap();
    assert!(direct.success);
    let elf_again = fs::read(fixture.build_dir.join("Blink.elf")).unwrap();
    assert_eq!(elf_bytes.len(), elf_again.len());
}

#[test]
fn failing_compile_reports_and_skips_dependents() {
    let fixture = Fixture::new("void setup() {}\nvoid loop() {}\n");
    let mut board = fixture.board();
    board.set_property("recipe.cpp.o.pattern", "false");

    let project = Project::builder()
        .config(board)
        .sketch(&fixture.sketch)
        .build_dir(&fixture.build_dir)
        .ephemeral()
        .build()
        .unwrap();
    let report = project.build().unwrap();

    assert!(!report.success);
    assert_eq!(outcome_of(&report, "compile"), vec![NodeOutcome::Failed]);
    assert_eq!(outcome_of(&report, "link"), vec![NodeOutcome::Skipped]);
    assert_eq!(outcome_of(&report, "convert"), vec![NodeOutcome::Skipped]);
    assert!(report.artifacts.is_empty());
    assert!(report
        .diagnostics
        .iter()
        .any(|d| d.kind == sketch_compilers::DiagnosticKind::Compile));
}

#[test]
fn uncached_projects_never_touch_the_cache() {
    let fixture = Fixture::new("void setup() {}\nvoid loop() {}\n");

    let project = fixture.builder().ephemeral().build().unwrap();
    let report = project.build().unwrap();
    assert!(report.success);
    assert_eq!(report.cache.hits + report.cache.misses + report.cache.stored, 0);
    assert!(!fixture.cache_dir.exists());
}

#[test]
fn report_serializes_with_dependencies() {
    let fixture = Fixture::new("void setup() {}\nvoid loop() {}\n");
    let report = fixture.project().build().unwrap();

    assert!(report.dependencies.iter().any(|d| d.name == "Blink"));
    assert!(report.dependencies.iter().any(|d| d.name == "core"));

    let json = serde_json::to_string_pretty(&report).unwrap();
    let parsed: sketch_compilers::BuildReport = serde_json::from_str(&json).unwrap();
    assert_eq!(report, parsed);
}
