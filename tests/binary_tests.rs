use assert_cmd::Command;
use predicates::prelude::*;

#[test]
fn help_lists_serve_command() {
    Command::cargo_bin("pg-nlq")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("serve"));
}

#[test]
fn version_flag_works() {
    Command::cargo_bin("pg-nlq")
        .unwrap()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("pg-nlq"));
}

#[test]
fn serve_without_databases_fails_with_exit_one() {
    Command::cargo_bin("pg-nlq")
        .unwrap()
        .arg("serve")
        .env_remove("DATABASE_NAME")
        .env_remove("DATABASE2_NAME")
        .current_dir(std::env::temp_dir())
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("No databases configured"));
}

#[test]
fn serve_rejects_unknown_flags() {
    Command::cargo_bin("pg-nlq")
        .unwrap()
        .args(["serve", "--definitely-not-a-flag"])
        .assert()
        .failure()
        .code(2);
}
