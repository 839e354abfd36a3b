use std::path::PathBuf;
use std::process::{Command, Output};
use std::time::{SystemTime, UNIX_EPOCH};

fn bin_path() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_hyperspec"))
}

fn tmp_dir(name: &str) -> PathBuf {
    let nanos = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_nanos();
    let mut p = std::env::temp_dir();
    p.push(format!("hyperspec_cfg_{}_{}_{}", std::process::id(), nanos, name));
    std::fs::create_dir_all(&p).unwrap();
    p
}

fn run(args: &[&str]) -> Output {
    Command::new(bin_path())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("failed to run {:?} {:?}: {}", bin_path(), args, e))
}

const VALID: &str = r#"
input_data: data.json
input_mc: mc.json
output_dir: out
variable: ct
bins: [1, 4, 8]
selection:
  fCosPA: "fCosPA > 0.999"
"#;

/// Run `spectrum` on `yaml` and check that it fails without writing anything.
fn assert_rejected(name: &str, yaml: &str) -> String {
    let dir = tmp_dir(name);
    let config = dir.join("config.yaml");
    std::fs::write(&config, yaml).unwrap();

    let out = run(&["spectrum", "--config", config.to_string_lossy().as_ref()]);
    assert!(!out.status.success(), "expected failure for:\n{yaml}");
    assert!(!dir.join("out").exists(), "no output should be written for:\n{yaml}");
    let stderr = String::from_utf8_lossy(&out.stderr).to_string();
    let _ = std::fs::remove_dir_all(&dir);
    stderr
}

#[test]
fn version_smoke() {
    let out = run(&["version"]);
    assert!(out.status.success(), "version should succeed");
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("hyperspec "), "unexpected stdout: {}", stdout);
}

#[test]
fn unknown_matter_option_is_rejected() {
    assert_rejected("matter", &format!("{VALID}is_matter: neither\n"));
}

#[test]
fn per_bin_selection_length_must_match_bins() {
    let yaml = VALID.replace(
        "selection:\n  fCosPA: \"fCosPA > 0.999\"\n",
        "selection:\n  - {fCosPA: \"fCosPA > 0.999\"}\n  - {fCosPA: \"fCosPA > 0.998\"}\n  - {fCosPA: \"fCosPA > 0.997\"}\n",
    );
    let stderr = assert_rejected("selection_len", &yaml);
    assert!(stderr.contains("per-bin"), "stderr: {stderr}");
}

#[test]
fn unparsable_selection_is_rejected() {
    let stderr = assert_rejected("selection_parse", &VALID.replace("fCosPA > 0.999", "fCosPA >> 0.999"));
    assert!(stderr.contains("fCosPA"), "stderr: {stderr}");
}

#[test]
fn non_increasing_bins_are_rejected() {
    assert_rejected("bins", &VALID.replace("[1, 4, 8]", "[1, 8, 4]"));
}

#[test]
fn missing_input_fails_before_output() {
    // Valid configuration, but the input tables do not exist.
    assert_rejected("missing_input", VALID);
}

#[test]
fn missing_config_file_fails() {
    let dir = tmp_dir("no_config");
    let out = run(&["mass-fit", "--config", dir.join("absent.yaml").to_string_lossy().as_ref()]);
    assert!(!out.status.success());
    let _ = std::fs::remove_dir_all(&dir);
}
