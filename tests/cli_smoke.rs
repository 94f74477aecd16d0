use std::path::Path;
use std::process::Command;

// `cargo test` exposes the built binary to integration tests.
fn bin() -> &'static str {
    env!("CARGO_BIN_EXE_codescope")
}

fn write(root: &Path, rel: &str, body: &str) {
    let p = root.join(rel);
    std::fs::create_dir_all(p.parent().unwrap()).unwrap();
    std::fs::write(p, body).unwrap();
}

#[test]
fn index_then_query_round_trip() {
    let tmp = tempfile::tempdir().unwrap();
    write(
        tmp.path(),
        "a.ts",
        "export function handleAuth(req) { return parse(req); }\nclass Project {}\n",
    );

    let status = Command::new(bin())
        .args(["--path"])
        .arg(tmp.path())
        .args(["index", "--overwrite", "--dim", "16"])
        .status()
        .expect("spawn codescope index");
    assert!(status.success());

    let output = Command::new(bin())
        .args(["--path"])
        .arg(tmp.path())
        .args(["--json", "query", "class Project"])
        .output()
        .expect("spawn codescope query");
    assert!(output.status.success());

    let rows: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("query emits JSON rows");
    let rows = rows.as_array().expect("array of hits");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["symbol"], "Project");
    assert_eq!(rows[0]["kind"], "class");
    assert_eq!(rows[0]["start_line"], 2);
}

#[test]
fn unavailable_language_exits_with_code_2() {
    let tmp = tempfile::tempdir().unwrap();
    write(tmp.path(), "a.ts", "export function f() {}\n");

    let status = Command::new(bin())
        .args(["--path"])
        .arg(tmp.path())
        .args(["index", "--overwrite", "--dim", "16"])
        .status()
        .unwrap();
    assert!(status.success());

    let output = Command::new(bin())
        .args(["--path"])
        .arg(tmp.path())
        .args(["query", "f", "--lang", "java"])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(2));
}

#[test]
fn status_reports_ok_after_index() {
    let tmp = tempfile::tempdir().unwrap();
    write(tmp.path(), "a.py", "def main():\n    pass\n");

    let status = Command::new(bin())
        .args(["--path"])
        .arg(tmp.path())
        .args(["index", "--overwrite", "--dim", "16"])
        .status()
        .unwrap();
    assert!(status.success());

    let output = Command::new(bin())
        .args(["--path"])
        .arg(tmp.path())
        .args(["--json", "status"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report["ok"], true);
}

#[test]
fn graph_callers_via_cli() {
    let tmp = tempfile::tempdir().unwrap();
    write(tmp.path(), "a.ts", "function a() { b(); }\nfunction b() {}\n");

    let status = Command::new(bin())
        .args(["--path"])
        .arg(tmp.path())
        .args(["index", "--overwrite", "--dim", "16"])
        .status()
        .unwrap();
    assert!(status.success());

    let output = Command::new(bin())
        .args(["--path"])
        .arg(tmp.path())
        .args(["--json", "graph", "callers", "b"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let rows: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(rows[0]["caller_name"], "a");
}
