//! Dependency resolution scenarios against on-disk project fixtures.

use pretty_assertions::assert_eq;
use sketch_compilers::{
    BoardDefinition, DependencyKind, Project, ProjectBuilder, SketchError,
};
use std::{
    fs,
    path::{Path, PathBuf},
};
use tempfile::TempDir;

/// A scratch SDK + sketch layout the resolver runs against.
struct Fixture {
    _tmp: TempDir,
    root: PathBuf,
    core: PathBuf,
    sketch: PathBuf,
    libraries: Vec<PathBuf>,
}

impl Fixture {
    fn new(sketch_content: &str) -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().to_path_buf();

        let core = root.join("core");
        write(&core.join("Arduino.h"), "#ifndef Arduino_h\n#define Arduino_h\n#endif\n");
        write(&core.join("main.cpp"), "int main() { return 0; }\n");
        write(&core.join("wiring.c"), "void init(void) {}\n");

        let sketch = root.join("Blink").join("Blink.ino");
        write(&sketch, sketch_content);

        Self { _tmp: tmp, root, core, sketch, libraries: Vec::new() }
    }

    fn add_library(&mut self, name: &str, files: &[(&str, &str)]) -> PathBuf {
        let lib = self.root.join("libraries").join(name);
        for (file, content) in files {
            write(&lib.join(file), content);
        }
        self.libraries.push(lib.clone());
        lib
    }

    fn board(&self) -> BoardDefinition {
        let mut board = BoardDefinition::from_properties(
            &self.core,
            None,
            [
                ("build.board".to_string(), "AVR_UNO".to_string()),
                ("build.arch".to_string(), "avr".to_string()),
                ("build.f_cpu".to_string(), "16000000L".to_string()),
            ],
        )
        .unwrap();
        for lib in &self.libraries {
            board.add_library(lib);
        }
        board
    }

    fn builder(&self) -> ProjectBuilder {
        Project::builder()
            .config(self.board())
            .sketch(&self.sketch)
            .build_dir(self.sketch.parent().unwrap().join(".build"))
            .ephemeral()
    }

    fn project(&self) -> Project {
        self.builder().build().unwrap()
    }
}

fn write(path: &Path, content: &str) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, content).unwrap();
}

fn library_names(graph: &sketch_compilers::DependencyGraph) -> Vec<&str> {
    graph
        .units
        .iter()
        .filter(|u| u.kind == DependencyKind::Library)
        .map(|u| u.name.as_str())
        .collect()
}

#[test]
fn guarded_header_contributes_includes_once() {
    let mut fixture = Fixture::new(
        "#include \"a.h\"\n#include \"a.h\"\nvoid setup() {}\nvoid loop() {}\n",
    );
    fixture.add_library(
        "A",
        &[
            ("a.h", "#ifndef A_H\n#define A_H\n#include \"b.h\"\n#endif\n"),
            ("b.h", "#pragma once\n"),
        ],
    );

    let graph = fixture.project().resolve().unwrap();
    let a_path = graph
        .edges
        .keys()
        .find(|p| p.file_name().map(|n| n == "a.h").unwrap_or(false))
        .expect("a.h analyzed")
        .clone();

    // b.h appears exactly once in the reachability set of a.h
    let reached: Vec<_> = graph.edges[&a_path]
        .iter()
        .filter(|p| p.file_name().map(|n| n == "b.h").unwrap_or(false))
        .collect();
    assert_eq!(reached.len(), 1);
    assert_eq!(library_names(&graph), vec!["A"]);
}

#[test]
fn nested_conditionals_take_single_branch() {
    let mut fixture =
        Fixture::new("#include <cond.h>\nvoid setup() {}\nvoid loop() {}\n");
    fixture.add_library(
        "Cond",
        &[
            (
                "cond.h",
                "#if defined(A)\n#if defined(B)\n#include \"ab.h\"\n#elif defined(C)\n#include \"ac.h\"\n#else\n#include \"aother.h\"\n#endif\n#endif\n",
            ),
            ("ab.h", ""),
            ("ac.h", ""),
            ("aother.h", ""),
        ],
    );

    let project = fixture
        .builder()
        .build_macro("A", Some("1".to_string()))
        .build_macro("C", Some("1".to_string()))
        .build()
        .unwrap();
    let graph = project.resolve().unwrap();

    let cond = graph
        .edges
        .keys()
        .find(|p| p.ends_with("cond.h"))
        .expect("cond.h analyzed");
    let reached: Vec<String> = graph.edges[cond]
        .iter()
        .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
        .collect();
    assert_eq!(reached, vec!["ac.h"]);
}

#[test]
fn integer_guards_activate_matching_library() {
    let mut fixture =
        Fixture::new("#include <ESP_Mail.h>\nvoid setup() {}\nvoid loop() {}\n");
    fixture.add_library(
        "EMail",
        &[(
            "ESP_Mail.h",
            "#if (EMAIL_NETWORK_TYPE == NETWORK_WiFiNINA)\n#include <WiFiNINA.h>\n#endif\n",
        )],
    );
    fixture.add_library("WiFiNINA", &[("src/WiFiNINA.h", ""), ("src/WiFiNINA.cpp", "")]);

    // a mismatching network selection leaves WiFiNINA inactive
    let mismatched = fixture
        .builder()
        .build_macro("EMAIL_NETWORK_TYPE", Some("10".to_string()))
        .build_macro("NETWORK_WiFiNINA", Some("20".to_string()))
        .build()
        .unwrap();
    let graph = mismatched.resolve().unwrap();
    assert_eq!(library_names(&graph), vec!["EMail"]);

    let project = fixture
        .builder()
        .build_macro("EMAIL_NETWORK_TYPE", Some("10".to_string()))
        .build_macro("NETWORK_WiFiNINA", Some("10".to_string()))
        .build()
        .unwrap();
    let graph = project.resolve().unwrap();
    assert_eq!(library_names(&graph), vec!["EMail", "WiFiNINA"]);

    // the src/-based library compiles its src/ tree and exposes it for
    // includes
    let nina = graph
        .unit(DependencyKind::Library, "WiFiNINA")
        .expect("WiFiNINA resolved");
    assert_eq!(nina.sources.len(), 1);
    assert!(nina.sources[0].ends_with("src/WiFiNINA.cpp"));
    assert!(nina.include_dirs[0].ends_with("WiFiNINA/src"));
}

#[test]
fn include_cycles_terminate() {
    let mut fixture =
        Fixture::new("#include \"a.h\"\nvoid setup() {}\nvoid loop() {}\n");
    fixture.add_library(
        "Cycle",
        &[("a.h", "#include \"b.h\"\n"), ("b.h", "#include \"a.h\"\n")],
    );

    let graph = fixture.project().resolve().unwrap();
    assert_eq!(library_names(&graph), vec!["Cycle"]);

    let a = graph.edges.keys().find(|p| p.ends_with("a.h")).unwrap();
    let b = graph.edges.keys().find(|p| p.ends_with("b.h")).unwrap();
    assert!(graph.edges[a].iter().any(|p| p.ends_with("b.h")));
    assert!(graph.edges[b].iter().any(|p| p.ends_with("a.h")));
}

#[test]
fn resolution_is_deterministic() {
    let mut fixture = Fixture::new(
        "#include <one.h>\n#include <two.h>\nvoid setup() {}\nvoid loop() {}\n",
    );
    fixture.add_library("One", &[("one.h", ""), ("one.cpp", "")]);
    fixture.add_library("Two", &[("two.h", ""), ("two.cpp", "")]);

    let project = fixture.project();
    let first = project.resolve().unwrap();
    let second = project.resolve().unwrap();
    assert_eq!(first, second);

    // byte-identical when serialized
    let a = serde_json::to_vec(&first).unwrap();
    let b = serde_json::to_vec(&second).unwrap();
    assert_eq!(a, b);
}

#[test]
fn unreached_libraries_stay_inactive() {
    let mut fixture =
        Fixture::new("#include <used.h>\nvoid setup() {}\nvoid loop() {}\n");
    fixture.add_library("Used", &[("used.h", "")]);
    fixture.add_library("Unused", &[("unused.h", ""), ("unused.cpp", "")]);

    let graph = fixture.project().resolve().unwrap();
    assert_eq!(library_names(&graph), vec!["Used"]);

    // core and variant-less baseline is always part of the build set
    assert!(graph.unit(DependencyKind::Core, "core").is_some());
    assert!(graph.unit(DependencyKind::Sketch, "Blink").is_some());
}

#[test]
fn header_collisions_resolve_first_match_wins() {
    let mut fixture =
        Fixture::new("#include <shared.h>\nvoid setup() {}\nvoid loop() {}\n");
    fixture.add_library("Alpha", &[("shared.h", "")]);
    fixture.add_library("Beta", &[("shared.h", ""), ("beta.cpp", "")]);

    let graph = fixture.project().resolve().unwrap();
    // the loser is not activated
    assert_eq!(library_names(&graph), vec!["Alpha"]);
}

#[test]
fn conditional_includes_respect_board_seed() {
    let mut fixture =
        Fixture::new("#include <port.h>\nvoid setup() {}\nvoid loop() {}\n");
    fixture.add_library(
        "Port",
        &[
            (
                "port.h",
                "#ifdef ARDUINO_ARCH_AVR\n#include \"port_avr.h\"\n#else\n#include \"port_generic.h\"\n#endif\n",
            ),
            ("port_avr.h", ""),
            ("port_generic.h", ""),
        ],
    );

    let graph = fixture.project().resolve().unwrap();
    let port = graph.edges.keys().find(|p| p.ends_with("port.h")).unwrap();
    let reached: Vec<String> = graph.edges[port]
        .iter()
        .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
        .collect();
    assert_eq!(reached, vec!["port_avr.h"]);
}

#[test]
fn sketch_unit_carries_prototypes_and_core_include() {
    let fixture = Fixture::new("void setup() {\n  helper();\n}\nvoid loop() {}\nvoid helper() {}\n");
    let graph = fixture.project().resolve().unwrap();

    assert!(graph.sketch.source.starts_with("#include <Arduino.h>\n"));
    assert_eq!(
        graph.sketch.prototypes,
        vec!["void setup();", "void loop();", "void helper();"]
    );

    // the synthesized unit is the sketch unit's first source
    let sketch = graph.unit(DependencyKind::Sketch, "Blink").unwrap();
    assert_eq!(sketch.sources[0], graph.sketch.unit_path);
}

#[test]
fn snapshot_round_trips() {
    let mut fixture =
        Fixture::new("#include <one.h>\nvoid setup() {}\nvoid loop() {}\n");
    fixture.add_library("One", &[("one.h", ""), ("one.cpp", "")]);

    let project = fixture.project();
    let graph = project.resolve().unwrap();

    let path = project.save_preprocess_result().unwrap();
    assert!(path.ends_with("preprocessResult.json"));
    let loaded = sketch_compilers::DependencyGraph::read_snapshot(&path).unwrap();
    assert_eq!(graph, loaded);
}

#[test]
fn missing_sketch_is_an_input_error() {
    let fixture = Fixture::new("void setup() {}\nvoid loop() {}\n");
    let project = fixture
        .builder()
        .sketch(fixture.root.join("nope").join("Nope.ino"))
        .build()
        .unwrap();
    assert!(matches!(project.resolve(), Err(SketchError::SketchNotFound(_))));
}

#[test]
fn unresolved_sketch_include_aborts() {
    let fixture =
        Fixture::new("#include <no_such_lib.h>\nvoid setup() {}\nvoid loop() {}\n");
    let err = fixture.project().resolve().unwrap_err();
    assert!(
        matches!(err, SketchError::UnresolvedInclude { ref name, .. } if name == "no_such_lib.h")
    );
}

#[test]
fn unresolved_library_include_is_a_warning() {
    let mut fixture =
        Fixture::new("#include <half.h>\nvoid setup() {}\nvoid loop() {}\n");
    fixture.add_library("Half", &[("half.h", "#include \"gone.h\"\n")]);

    let graph = fixture.project().resolve().unwrap();
    assert!(graph
        .diagnostics
        .iter()
        .any(|d| d.message.contains("gone.h")));
}

#[test]
fn unbalanced_library_header_is_nonfatal() {
    let mut fixture = Fixture::new(
        "#include <ok.h>\n#include <broken.h>\nvoid setup() {}\nvoid loop() {}\n",
    );
    fixture.add_library("Ok", &[("ok.h", "")]);
    fixture.add_library("Broken", &[("broken.h", "#ifdef X\nint x;\n")]);

    let graph = fixture.project().resolve().unwrap();
    // the broken header is reported but the rest of the graph stands
    assert!(graph.diagnostics.iter().any(|d| d.message.contains("unterminated")));
    assert!(library_names(&graph).contains(&"Ok"));
}
