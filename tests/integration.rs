use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn metaloader_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("metaloader");
    path
}

const STUDY: &str = "#METABOLOMICS WORKBENCH STUDY_ID:ST000315 ANALYSIS_ID:AN000501\n\
VERSION\t1\n\
#SUBJECT_SAMPLE_FACTORS:\tSUBJECT(optional)[tab]SAMPLE[tab]FACTORS(NAME:VALUE pairs separated by |)[tab]Additional sample data\n\
SUBJECT_SAMPLE_FACTORS\t-\tS1\tGroup:Exercise | Visit:1\n\
SUBJECT_SAMPLE_FACTORS\t-\tS2\tGroup:Rest | Visit:1\n\
#MS_METABOLITE_DATA\n\
MS_METABOLITE_DATA:UNITS\tmM\n\
MS_METABOLITE_DATA_START\n\
Samples\tS1\tS2\n\
Glucose\t12.5\t11.0\n\
Lactate\t2.1\tNA\n\
MS_METABOLITE_DATA_END\n\
#END\n";

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let files_dir = root.join("files");
    fs::create_dir_all(files_dir.join("ST000315")).unwrap();
    fs::write(files_dir.join("ST000315/ST000315_AN000501.txt"), STUDY).unwrap();
    fs::write(files_dir.join("ST000315/duplicate.txt"), STUDY).unwrap();
    fs::write(
        files_dir.join("ST000315/metabolites.html"),
        "<html><table><tr><th>Metabolite_name</th></tr></table></html>",
    )
    .unwrap();
    fs::write(files_dir.join("ST000315/summary_res.txt"), "compound\tp\nglucose\t0.01\n").unwrap();

    let config_content = format!(
        r#"[db]
path = "{}/data/metaloader.sqlite"

[ingest]
exclude_globs = []

[upsert]
batch_size = 500

[logging]
level = "warn"
"#,
        root.display()
    );

    let config_path = config_dir.join("metaloader.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_metaloader(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = metaloader_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .env_remove("RUST_LOG")
        .output()
        .unwrap_or_else(|e| panic!("Failed to run metaloader binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let success = output.status.success();
    (stdout, stderr, success)
}

fn files_dir(config_path: &Path) -> PathBuf {
    config_path.parent().unwrap().parent().unwrap().join("files")
}

/// Value of a `  key:   value` summary line.
fn field<'a>(stdout: &'a str, key: &str) -> Option<&'a str> {
    stdout.lines().find_map(|line| {
        line.trim()
            .strip_prefix(key)
            .and_then(|rest| rest.strip_prefix(':'))
            .map(str::trim)
    })
}

#[test]
fn test_init_creates_database() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_metaloader(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (_, _, success1) = run_metaloader(&config_path, &["init"]);
    assert!(success1, "First init failed");

    let (_, _, success2) = run_metaloader(&config_path, &["init"]);
    assert!(success2, "Second init failed (not idempotent)");
}

#[test]
fn test_ingest_file_twice_is_duplicate() {
    let (_tmp, config_path) = setup_test_env();
    let file = files_dir(&config_path).join("ST000315/ST000315_AN000501.txt");
    let file = file.to_str().unwrap();

    let (stdout1, stderr1, ok1) = run_metaloader(&config_path, &["ingest-file", file]);
    assert!(ok1, "ingest-file failed: {}", stderr1);
    assert_eq!(field(&stdout1, "new"), Some("true"));
    assert_eq!(field(&stdout1, "detected type"), Some("mwtab"));

    let (stdout2, _, ok2) = run_metaloader(&config_path, &["ingest-file", file]);
    assert!(ok2);
    assert_eq!(field(&stdout2, "new"), Some("false"));
    assert_eq!(field(&stdout1, "file id"), field(&stdout2, "file id"));
}

#[test]
fn test_ingest_dir_and_parse_import() {
    let (_tmp, config_path) = setup_test_env();
    let dir = files_dir(&config_path);

    let (stdout, stderr, success) =
        run_metaloader(&config_path, &["ingest-dir", dir.to_str().unwrap(), "--progress", "off"]);
    assert!(success, "ingest-dir failed: stdout={}, stderr={}", stdout, stderr);
    assert_eq!(field(&stdout, "found"), Some("4"));
    assert_eq!(field(&stdout, "new"), Some("3"));
    assert_eq!(field(&stdout, "duplicate"), Some("1"));
    assert_eq!(field(&stdout, "errors"), Some("0"));

    let import_id = field(&stdout, "import id").unwrap().to_string();

    let (stdout, stderr, success) =
        run_metaloader(&config_path, &["parse", "import", &import_id]);
    assert!(success, "parse import failed: stdout={}, stderr={}", stdout, stderr);
    assert_eq!(field(&stdout, "parsed"), Some("1"));
    assert_eq!(field(&stdout, "skipped"), Some("2"));
    assert!(stdout.contains("ok"));

    let (stdout, _, success) = run_metaloader(&config_path, &["import", "show", &import_id]);
    assert!(success);
    let shown: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(shown["import"]["status"], "success");
    assert_eq!(shown["files"].as_array().unwrap().len(), 3);
}

#[test]
fn test_ingest_dir_dry_run_writes_nothing() {
    let (_tmp, config_path) = setup_test_env();
    let dir = files_dir(&config_path);

    let (stdout, _, success) = run_metaloader(
        &config_path,
        &["ingest-dir", dir.to_str().unwrap(), "--dry-run", "--progress", "off"],
    );
    assert!(success);
    assert!(stdout.contains("(dry-run)"));
    assert_eq!(field(&stdout, "new"), Some("3"));
    assert!(field(&stdout, "import id").is_none());

    let (stdout, _, success) = run_metaloader(&config_path, &["stats"]);
    assert!(success);
    assert!(stdout.lines().any(|l| l.split_whitespace().collect::<Vec<_>>() == ["files", "0"]));
}

#[test]
fn test_parse_path_then_export() {
    let (_tmp, config_path) = setup_test_env();
    let file = files_dir(&config_path).join("ST000315/ST000315_AN000501.txt");

    let (stdout, stderr, success) =
        run_metaloader(&config_path, &["parse", "path", file.to_str().unwrap()]);
    assert!(success, "parse path failed: stdout={}, stderr={}", stdout, stderr);
    assert_eq!(field(&stdout, "study"), Some("ST000315"));
    assert_eq!(field(&stdout, "analysis"), Some("AN000501"));

    let (stdout, _, success) = run_metaloader(&config_path, &["export", "--study", "ST000315"]);
    assert!(success);
    let rows: Vec<serde_json::Value> = serde_json::from_str(&stdout).unwrap();
    assert_eq!(rows.len(), 4);
    assert!(rows
        .iter()
        .any(|r| r["feature_uid"] == "AN000501:met:lactate" && r["value"].is_null()));
}

#[test]
fn test_parse_path_dry_run() {
    let (_tmp, config_path) = setup_test_env();
    let file = files_dir(&config_path).join("ST000315/ST000315_AN000501.txt");

    let (stdout, _, success) = run_metaloader(
        &config_path,
        &["parse", "path", file.to_str().unwrap(), "--dry-run"],
    );
    assert!(success);
    assert!(stdout.contains("(dry-run)"));

    let (stdout, _, _) = run_metaloader(&config_path, &["export"]);
    let rows: Vec<serde_json::Value> = serde_json::from_str(&stdout).unwrap();
    assert!(rows.is_empty());
}

#[test]
fn test_parse_malformed_file_reports_stage() {
    let (tmp, config_path) = setup_test_env();
    let broken = tmp.path().join("broken.txt");
    fs::write(&broken, "no header here\n").unwrap();

    let (_, stderr, success) =
        run_metaloader(&config_path, &["parse", "path", broken.to_str().unwrap()]);
    assert!(!success);
    assert!(stderr.contains("parse stage failed"), "stderr={}", stderr);
}

#[test]
fn test_finalize_import_twice_fails() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, _, success) = run_metaloader(&config_path, &["import", "create"]);
    assert!(success);
    let id = stdout.trim().to_string();

    let (_, _, ok) = run_metaloader(&config_path, &["import", "finalize", &id]);
    assert!(ok);
    let (_, stderr, ok) = run_metaloader(
        &config_path,
        &["import", "finalize", &id, "--status", "failed"],
    );
    assert!(!ok);
    assert!(stderr.contains("already finalized"));
}

#[test]
fn test_unknown_import_id() {
    let (tmp, config_path) = setup_test_env();
    let file = tmp.path().join("files/ST000315/metabolites.html");

    let (_, stderr, success) = run_metaloader(
        &config_path,
        &["ingest-file", file.to_str().unwrap(), "--import-id", "missing"],
    );
    assert!(!success);
    assert!(stderr.contains("import not found"));
}

#[test]
fn test_export_and_stats_on_fresh_database() {
    let (tmp, config_path) = setup_test_env();
    assert!(!tmp.path().join("data/metaloader.sqlite").exists());

    let (stdout, stderr, success) = run_metaloader(&config_path, &["export"]);
    assert!(success, "export failed: {}", stderr);
    let rows: Vec<serde_json::Value> = serde_json::from_str(&stdout).unwrap();
    assert!(rows.is_empty());

    let (stdout, stderr, success) = run_metaloader(&config_path, &["stats"]);
    assert!(success, "stats failed: {}", stderr);
    assert!(stdout.lines().any(|l| l.split_whitespace().collect::<Vec<_>>() == ["measurements", "0"]));
}
