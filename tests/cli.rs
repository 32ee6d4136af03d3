//! CLI surface tests: drive the binary the way editors and users do.

use assert_cmd::Command;
use predicates::prelude::*;
use select::document::Document;
use select::predicate::Name;

fn codechat() -> Command {
    Command::cargo_bin("codechat-server").unwrap()
}

#[test]
fn no_arguments_prints_help_and_fails() {
    codechat()
        .assert()
        .failure()
        .stderr(predicate::str::contains("Usage"));
}

#[test]
fn version_flag_works() {
    codechat()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn build_renders_markdown_to_stdout() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("hello.md");
    std::fs::write(&file, "# Hello\n\n*hi*\n").unwrap();

    let output = codechat().arg("build").arg(&file).assert().success();
    let stdout = String::from_utf8_lossy(&output.get_output().stdout).into_owned();
    let document = Document::from(stdout.as_str());
    let emphasis: Vec<_> = document.find(Name("em")).map(|node| node.text()).collect();
    assert_eq!(emphasis, vec!["hi"]);
}

#[test]
fn build_reports_missing_converters_on_stderr() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("nope.xyz");
    std::fs::write(&file, "").unwrap();

    codechat()
        .arg("build")
        .arg(&file)
        .assert()
        .failure()
        .stderr(predicate::str::contains("No converter found for this file."));
}

#[test]
fn build_runs_project_builders() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("codechat_config.yaml"),
        "output_path: _build\nargs: sh -c 'mkdir -p _build && echo \"<p>built</p>\" > _build/index.html'\n",
    )
    .unwrap();
    let source = dir.path().join("index.rst");
    std::fs::write(&source, "Title\n=====\n").unwrap();

    let output = codechat().arg("build").arg(&source).assert().success();
    let stdout = String::from_utf8_lossy(&output.get_output().stdout).into_owned();
    assert!(stdout.contains("_build/index.html"), "got: {}", stdout);

    let produced: Vec<_> = walkdir::WalkDir::new(dir.path().join("_build"))
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(produced, vec!["index.html"]);
}

#[test]
fn render_fails_without_a_server() {
    // Nothing listens on the RPC port inside the test environment.
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("x.md");
    std::fs::write(&file, "hi").unwrap();

    codechat()
        .arg("render")
        .arg(&file)
        .arg("--")
        .arg("-1")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Unable to reach the CodeChat Server"));
}
