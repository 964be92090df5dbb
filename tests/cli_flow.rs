use std::fs;
use std::path::Path;

use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::{json, Value};
use tempfile::TempDir;

fn bin() -> Command {
    Command::cargo_bin("atlas-graph").unwrap()
}

fn node(scope: &str, key: &str, kind: &str) -> Value {
    json!({
        "scope": scope, "op": "upsert", "entity": "node",
        "payload": { "source_system": "gitlab", "external_key": key, "kind": kind, "name": key }
    })
}

fn edge(scope: &str, from: &str, to: &str, kind: &str) -> Value {
    json!({
        "scope": scope, "op": "upsert", "entity": "edge",
        "payload": {
            "from": { "source_system": "gitlab", "external_key": from },
            "to": { "source_system": "gitlab", "external_key": to },
            "kind": kind
        }
    })
}

fn runbook(scope: &str, key: &str) -> Value {
    json!({
        "scope": scope, "op": "upsert", "entity": "doc",
        "payload": {
            "source_system": "wiki", "external_key": format!("{key}-runbook"),
            "node": { "source_system": "gitlab", "external_key": key },
            "kind": "runbook_link", "content_hash": "9c1e77"
        }
    })
}

fn write_lines(path: &Path, msgs: &[Value]) {
    let body: Vec<String> = msgs.iter().map(Value::to_string).collect();
    fs::write(path, body.join("\n") + "\n").unwrap();
}

/// Two scopes: `web` with a small pipeline and `api` sharing its `prod` environment.
fn seeded() -> TempDir {
    let td = TempDir::new().unwrap();
    let input = td.path().join("first.jsonl");
    write_lines(
        &input,
        &[
            node("web", "main", "pipeline"),
            node("web", "build", "job"),
            node("web", "test", "job"),
            node("web", "deploy", "job"),
            node("web", "prod", "environment"),
            edge("web", "build", "main", "contains"),
            edge("web", "test", "main", "contains"),
            edge("web", "deploy", "main", "contains"),
            edge("web", "test", "build", "needs"),
            edge("web", "deploy", "test", "needs"),
            edge("web", "deploy", "prod", "uses"),
            runbook("web", "build"),
            node("api", "release", "job"),
            node("api", "prod", "environment"),
            edge("api", "release", "prod", "uses"),
        ],
    );
    let state = td.path().join("state");
    bin()
        .args(["ingest", "--state"])
        .arg(&state)
        .arg("--input")
        .arg(&input)
        .assert()
        .success()
        .stdout(predicate::str::contains("web").and(predicate::str::contains("api")));
    td
}

fn state(td: &TempDir) -> std::path::PathBuf {
    td.path().join("state")
}

#[test]
fn traverse_walks_from_pipeline_down_in_topological_order() {
    let td = seeded();
    bin()
        .args(["query", "traverse", "--scope", "web", "--start", "main"])
        .args(["--direction", "incoming", "--order", "topo", "--state"])
        .arg(state(&td))
        .assert()
        .success()
        .stdout(predicate::str::is_match(r"(?s)main.*build.*test.*deploy").unwrap());
}

#[test]
fn read_only_queries_answer_from_the_stored_graph() {
    let td = seeded();
    let st = state(&td);
    bin()
        .args(["query", "cycles", "--scope", "web", "--state"])
        .arg(&st)
        .assert()
        .success()
        .stdout(predicate::str::contains("<no cycles>"));
    bin()
        .args(["query", "path", "--scope", "web", "--from", "deploy", "--to", "build", "--state"])
        .arg(&st)
        .assert()
        .success()
        .stdout(predicate::str::contains("deploy").and(predicate::str::contains("test")));
    bin()
        .args(["query", "node-info", "--scope", "web", "--node", "build", "--state"])
        .arg(&st)
        .assert()
        .success()
        .stdout(predicate::str::contains("build (job)").and(predicate::str::contains("doc: runbook_link")));
    bin()
        .args(["query", "hubs", "--scope", "web", "--kind", "environment", "--state"])
        .arg(&st)
        .assert()
        .success()
        .stdout(predicate::str::contains("prod").and(predicate::str::contains("deploy").not()));
}

#[test]
fn coverage_json_lists_every_node() {
    let td = seeded();
    let out = bin()
        .args(["query", "coverage", "--scope", "web", "--format", "json", "--state"])
        .arg(state(&td))
        .output()
        .unwrap();
    assert!(out.status.success());
    let v: Value = serde_json::from_slice(&out.stdout).unwrap();
    assert_eq!(v["scores"].as_array().unwrap().len(), 5);
    let agg = v["aggregate"].as_f64().unwrap();
    assert!(agg > 0.0 && agg < 1.0);
}

#[test]
fn new_neighbor_makes_runbook_drift_and_shows_in_diff() {
    let td = seeded();
    let st = state(&td);
    let before = td.path().join("before.json");
    let after = td.path().join("after.json");
    bin().args(["export", "--scope", "web", "--state"]).arg(&st).arg("--out").arg(&before).assert().success();
    bin()
        .args(["query", "drift", "--scope", "web", "--state"])
        .arg(&st)
        .assert()
        .success()
        .stdout(predicate::str::contains("<no drift>"));

    let second = td.path().join("second.jsonl");
    write_lines(&second, &[node("web", "lint", "job"), edge("web", "lint", "build", "needs")]);
    bin().args(["ingest", "--state"]).arg(&st).arg("--input").arg(&second).assert().success();

    bin()
        .args(["query", "drift", "--scope", "web", "--state"])
        .arg(&st)
        .assert()
        .success()
        .stdout(predicate::str::contains("build").and(predicate::str::contains("lint")));
    bin()
        .args(["query", "coverage", "--scope", "web", "--state"])
        .arg(&st)
        .assert()
        .success()
        .stdout(predicate::str::contains("stale"));

    bin().args(["export", "--scope", "web", "--state"]).arg(&st).arg("--out").arg(&after).assert().success();
    bin()
        .arg("diff")
        .arg("--before")
        .arg(&before)
        .arg("--after")
        .arg(&after)
        .assert()
        .success()
        .stdout(predicate::str::contains("lint").and(predicate::str::contains("2 change(s)")));
}

#[test]
fn export_formats() {
    let td = seeded();
    let st = state(&td);
    bin()
        .args(["export", "--scope", "web", "--format", "dot", "--dot-clusters", "on", "--dot-coverage", "--state"])
        .arg(&st)
        .assert()
        .success()
        .stdout(predicate::str::starts_with("digraph").and(predicate::str::contains("cluster_gitlab")));
    bin()
        .args(["export", "--scope", "web", "--format", "graphml", "--state"])
        .arg(&st)
        .assert()
        .success()
        .stdout(predicate::str::contains("<graphml").and(predicate::str::contains("deploy")));
}

#[test]
fn scopes_and_cross_scope_links() {
    let td = seeded();
    let st = state(&td);
    bin().arg("scopes").arg("--state").arg(&st).assert().success().stdout("api\nweb\n");
    bin()
        .arg("link")
        .arg("--state")
        .arg(&st)
        .assert()
        .success()
        .stdout(predicate::str::contains("shared_env"));
}

#[test]
fn docs_detect_reports_found_and_missing_files() {
    let td = TempDir::new().unwrap();
    fs::write(td.path().join("README.md"), "# web\n").unwrap();
    fs::write(td.path().join("SECURITY.md"), "report to security@\n").unwrap();
    bin()
        .args(["docs", "detect", "--path"])
        .arg(td.path())
        .assert()
        .success()
        .stdout(
            predicate::str::contains("README.md")
                .and(predicate::str::contains("coverage: 40.0%"))
                .and(predicate::str::contains("missing: Architecture documentation")),
        );
}

#[test]
fn unknown_scope_fails_and_bad_config_exits_2() {
    let td = seeded();
    let st = state(&td);
    bin()
        .args(["query", "cycles", "--scope", "nope", "--state"])
        .arg(&st)
        .assert()
        .code(1)
        .stderr(predicate::str::contains("Unknown scope: nope"));

    fs::write(st.join("atlas-graph.toml"), "[ingest]\nbogus = 1\n").unwrap();
    bin()
        .args(["query", "cycles", "--scope", "web", "--state"])
        .arg(&st)
        .assert()
        .code(2);

    fs::write(st.join("atlas-graph.toml"), "[docs]\npartial_threshold = 1.5\n").unwrap();
    bin()
        .args(["query", "coverage", "--scope", "web", "--state"])
        .arg(&st)
        .assert()
        .code(2)
        .stderr(predicate::str::contains("partial_threshold"));
}

#[test]
fn completions_are_generated() {
    bin()
        .args(["completions", "bash"])
        .assert()
        .success()
        .stdout(predicate::str::contains("atlas-graph"));
}
