//! Integration tests for `poster split` and `poster stats`.

mod common;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

#[test]
fn test_split_writes_three_subsets_once() {
    let temp = TempDir::new().unwrap();
    let config = common::write_project(temp.path(), 40);

    Command::cargo_bin("poster")
        .unwrap()
        .arg("split")
        .arg(&config)
        .assert()
        .success()
        .stdout(predicate::str::contains("Split written"))
        .stdout(predicate::str::contains("40 after dedup"));

    for name in ["df_train.csv", "df_valid.csv", "df_test.csv"] {
        assert!(temp.path().join("data").join(name).is_file(), "{name} missing");
    }
    let train_before = std::fs::read_to_string(temp.path().join("data/df_train.csv")).unwrap();

    Command::cargo_bin("poster")
        .unwrap()
        .arg("split")
        .arg(&config)
        .assert()
        .success()
        .stdout(predicate::str::contains("Split already present"));
    let train_after = std::fs::read_to_string(temp.path().join("data/df_train.csv")).unwrap();
    assert_eq!(train_before, train_after);
}

#[test]
fn test_stats_json_reports_every_subset() {
    let temp = TempDir::new().unwrap();
    let config = common::write_project(temp.path(), 40);
    Command::cargo_bin("poster").unwrap().arg("split").arg(&config).assert().success();

    let assert = Command::cargo_bin("poster").unwrap().arg("stats").arg(&config).arg("--json").assert().success();
    let json: serde_json::Value = serde_json::from_slice(&assert.get_output().stdout).unwrap();

    assert_eq!(json["tags"], serde_json::json!(["action", "drama"]));
    let subsets = json["subsets"].as_array().unwrap();
    assert_eq!(subsets.len(), 3);
    let rows: u64 = subsets.iter().map(|s| s["rows"].as_u64().unwrap()).sum();
    assert_eq!(rows, 40);
}

#[test]
fn test_stats_before_split_fails() {
    let temp = TempDir::new().unwrap();
    let config = common::write_project(temp.path(), 8);

    Command::cargo_bin("poster")
        .unwrap()
        .arg("stats")
        .arg(&config)
        .assert()
        .failure()
        .stderr(predicate::str::contains("poster split"));
}
