// Regression tests for the one-shot CLI commands
use std::fs;
use std::process::{Command, Output};

const CONFIG: &str = r#"[painting]
rows = 8
columns = 8

[crypto]
asset = "TBTC"
xpub = "tpubTEST"

[fees]
fee_per_vbyte = 2
"#;

fn run(args: &[&str]) -> Output {
    let tmp = tempfile::tempdir().expect("temp dir");
    let cfg_path = tmp.path().join("config.toml");
    fs::write(&cfg_path, CONFIG).unwrap();

    let mut cmd = Command::new(env!("CARGO_BIN_EXE_latticepaint"));
    cmd.arg("--config").arg(cfg_path.to_str().unwrap()).arg("--quiet");
    for a in args {
        cmd.arg(a);
    }
    cmd.output().expect("failed to run latticepaint binary")
}

#[test]
fn size_prints_annotated_tree() {
    let out = run(&["size", "--edges", "0,0-1,0 0,0-0,1"]);
    assert!(out.status.success(), "stderr: {}", String::from_utf8_lossy(&out.stderr));
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("1 tree(s), 2 payment(s) at 2 sat/vB"), "stdout: {}", stdout);
    assert!(stdout.contains("(0, 0)  442 vB  884 sat"), "stdout: {}", stdout);
    assert!(stdout.contains("  (1, 0)  151 vB  302 sat"), "stdout: {}", stdout);
}

#[test]
fn fee_rate_flag_overrides_config() {
    let out = run(&["size", "--edges", "0,0-1,0 0,0-0,1", "--fee-rate", "1"]);
    assert!(out.status.success());
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("(0, 0)  442 vB  442 sat"), "stdout: {}", stdout);
}

#[test]
fn components_splits_disjoint_strokes() {
    let out = run(&["components", "--edges", "0,0-1,0 5,5-5,6 1,0-1,1"]);
    assert!(out.status.success());
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("2 component(s)"), "stdout: {}", stdout);
}

#[test]
fn bad_edges_are_rejected() {
    assert!(!run(&["size", "--edges", "2,2-2,2"]).status.success());
    assert!(!run(&["size", "--edges", "0,0-9,9"]).status.success());
    assert!(!run(&["size", "--edges", "0,0+1,0"]).status.success());
}

#[test]
fn overflowing_fee_rate_fails_cleanly() {
    let out = run(&["size", "--edges", "0,0-1,0", "--fee-rate", "18446744073709551615"]);
    assert!(!out.status.success());
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("overflows"), "stderr: {}", stderr);
    assert!(!stderr.contains("panicked"), "stderr: {}", stderr);
}

#[test]
fn negative_coordinates_are_reported_as_out_of_grid() {
    let out = run(&["size", "--edges", "-1,0-0,0"]);
    assert!(!out.status.success());
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("outside"), "stderr: {}", stderr);
}
