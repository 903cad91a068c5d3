use assert_cmd::Command;
use std::fs;
use std::path::Path;
use tempfile::tempdir;

const HANDOFF: &str = r#"
version: 1
name: handoff
secrets:
  TOKEN: {}
stages:
  - id: build
    actions:
      - name: write
        run: sh
        args: [-c, "mkdir -p out && echo payload > out/data.txt"]
        produces:
          data: { path: out/data.txt }
  - id: verify
    needs: [build]
    actions:
      - name: read
        run: cat
        args: ["${{ artifacts.data }}"]
        produces:
          content: { stdout: true }
      - name: no-leak
        run: sh
        args: [-c, "test -z \"$TOKEN\""]
  - id: publish
    needs: [verify]
    actions:
      - name: echo-token
        run: sh
        args: [-c, "test \"$TOKEN\" = s3cret && echo token=$TOKEN"]
        secrets: [TOKEN]
        produces:
          receipt: { stdout: true }
"#;

const FAILING: &str = r#"
version: 1
name: broken
stages:
  - { id: build, actions: [{ name: ok, run: "true" }] }
  - { id: scan, needs: [build], actions: [{ name: boom, run: sh, args: [-c, "echo bad image >&2; exit 3"] }] }
  - { id: test, needs: [scan], actions: [{ name: never, run: "true" }] }
"#;

fn pipewright(dir: &Path) -> Command {
    let mut cmd = Command::cargo_bin("pipewright").expect("binary present");
    cmd.current_dir(dir).env("RUST_LOG", "warn");
    cmd
}

fn stdout_of(output: &std::process::Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

#[test]
fn run_passes_artifacts_and_scopes_secrets() {
    let temp = tempdir().unwrap();
    fs::write(temp.path().join("pipeline.yaml"), HANDOFF).unwrap();
    fs::write(temp.path().join("secrets.yaml"), "TOKEN: s3cret\n").unwrap();

    let assert = pipewright(temp.path())
        .env("TOKEN", "from-parent-env")
        .args([
            "run",
            "pipeline.yaml",
            "--secrets-file",
            "secrets.yaml",
            "--run-id",
            "cli-run",
            "--report",
            "report.json",
            "--checksums",
            "SHA256SUMS",
        ])
        .assert()
        .success();
    let stdout = stdout_of(assert.get_output());
    assert!(stdout.contains("Pipeline 'handoff' (run cli-run): SUCCEEDED"), "{stdout}");

    let report = fs::read_to_string(temp.path().join("report.json")).expect("report written");
    assert!(report.contains("\"verdict\": \"succeeded\""));
    assert!(report.contains("payload"));
    assert!(report.contains("token=***"));
    assert!(!report.contains("s3cret"));

    let log_dir = temp.path().join(".pipewright/runs/cli-run");
    let log = fs::read_to_string(log_dir.join("publish/01-echo-token.log")).expect("action log");
    assert!(!log.contains("s3cret"));

    let sums = fs::read_to_string(temp.path().join("SHA256SUMS")).expect("checksums");
    assert!(sums.contains("out/data.txt"));
}

#[test]
fn process_target_log_is_redacted_after_teardown() {
    let temp = tempdir().unwrap();
    fs::write(
        temp.path().join("pipeline.yaml"),
        r#"
version: 1
name: smoke
stages:
  - id: smoke
    target:
      name: web
      kind: process
      run: sh
      args: [-c, "echo \"tok=$TOKEN\"; sleep 30"]
      secrets: [TOKEN]
      probe:
        command: { run: sh, args: [-c, "grep -q tok= .pipewright/runs/log-run/smoke/web.target.log"] }
        timeout_ms: 5000
        interval_ms: 20
    actions:
      - { name: check, run: "true" }
"#,
    )
    .unwrap();
    fs::write(temp.path().join("secrets.yaml"), "TOKEN: tok-s3cret\n").unwrap();

    pipewright(temp.path())
        .args([
            "run",
            "pipeline.yaml",
            "--secrets-file",
            "secrets.yaml",
            "--run-id",
            "log-run",
        ])
        .assert()
        .success();

    let log = fs::read_to_string(temp.path().join(".pipewright/runs/log-run/smoke/web.target.log"))
        .expect("target log");
    assert!(!log.contains("tok-s3cret"), "{log}");
    assert!(log.contains("tok=***"), "{log}");
}

#[test]
fn failing_stage_exits_non_zero_and_skips_dependents() {
    let temp = tempdir().unwrap();
    fs::write(temp.path().join("pipeline.yaml"), FAILING).unwrap();

    let assert = pipewright(temp.path())
        .args(["run", "pipeline.yaml", "--report", "report.json"])
        .assert()
        .failure();
    let stdout = stdout_of(assert.get_output());
    assert!(stdout.contains("FAILED"), "{stdout}");
    assert!(stdout.contains("First failure: scan (action_execution_failed)"));
    assert!(stdout.contains("bad image"));

    let report = fs::read_to_string(temp.path().join("report.json")).expect("report written");
    assert!(report.contains("dependency 'scan' failed"));
}

#[test]
fn dry_run_prints_plan_without_executing() {
    let temp = tempdir().unwrap();
    fs::write(temp.path().join("pipeline.yaml"), HANDOFF).unwrap();

    let assert = pipewright(temp.path())
        .args(["run", "pipeline.yaml", "--dry-run"])
        .assert()
        .success();
    let stdout = stdout_of(assert.get_output());
    assert!(stdout.contains("Plan for 'handoff' (3 stage(s)):"));
    assert!(stdout.contains("batch 3: publish"));
    assert!(!temp.path().join("out").exists());
    assert!(!temp.path().join(".pipewright").exists());
}

#[test]
fn validate_rejects_cycles() {
    let temp = tempdir().unwrap();
    fs::write(
        temp.path().join("cyclic.yaml"),
        r#"
version: 1
stages:
  - { id: a, needs: [b], actions: [{ name: x, run: "true" }] }
  - { id: b, needs: [a], actions: [{ name: y, run: "true" }] }
"#,
    )
    .unwrap();

    let assert = pipewright(temp.path())
        .args(["validate", "cyclic.yaml"])
        .assert()
        .failure();
    let stderr = String::from_utf8_lossy(&assert.get_output().stderr).into_owned();
    assert!(stderr.contains("Dependency cycle detected: a -> b -> a"), "{stderr}");

    pipewright(temp.path())
        .args(["run", "cyclic.yaml"])
        .assert()
        .failure();
    assert!(!temp.path().join(".pipewright").exists());
}

#[test]
fn new_preset_then_lint_and_lock() {
    let temp = tempdir().unwrap();

    pipewright(temp.path())
        .args(["new", "--preset", "minimal"])
        .assert()
        .success();
    assert!(temp.path().join("minimal.pipeline.yaml").exists());

    pipewright(temp.path())
        .args(["lint", "minimal.pipeline.yaml"])
        .assert()
        .success();

    pipewright(temp.path())
        .args(["lock", "minimal.pipeline.yaml"])
        .assert()
        .success();
    let lock = fs::read_to_string(temp.path().join("minimal.pipeline.lock")).expect("lockfile");
    assert!(lock.contains("pipeline: minimal"));
}

#[test]
fn digest_prints_sha256() {
    let temp = tempdir().unwrap();
    fs::write(temp.path().join("abc.txt"), "abc").unwrap();

    let assert = pipewright(temp.path())
        .args(["digest", "abc.txt"])
        .assert()
        .success();
    let stdout = stdout_of(assert.get_output());
    assert!(stdout.starts_with(
        "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad  abc.txt"
    ));
}
