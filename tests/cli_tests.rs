mod common;

use std::process::{Command, Output};

use common::{ISSUER, fixture_keys_dir};

fn sales_admin(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_sales-admin"))
        .args(args)
        .env_remove("AUTH_KEYS_FOLDER")
        .env_remove("AUTH_ISSUER")
        .env_remove("AUTH_ALGORITHMS")
        .output()
        .expect("sales-admin runs")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

#[test]
fn gentoken_then_verify() {
    let keys_dir = fixture_keys_dir();
    let keys_dir = keys_dir.to_str().unwrap();

    let minted = sales_admin(&[
        "gentoken",
        "--keys-dir",
        keys_dir,
        "--kid",
        "k1",
        "--subject",
        "user-42",
        "--roles",
        "USER,ADMIN",
        "--ttl-hours",
        "1",
    ]);
    assert!(minted.status.success(), "{minted:?}");

    let out = stdout(&minted);
    let mut sections = out.splitn(2, "-----\n");
    let token = sections.next().unwrap().trim();
    let public_pem = sections.next().unwrap();
    assert_eq!(token.split('.').count(), 3);
    assert!(public_pem.starts_with("-----BEGIN PUBLIC KEY-----"));

    let verified = sales_admin(&["verify", "--keys-dir", keys_dir, "--token", token]);
    assert!(verified.status.success(), "{verified:?}");
    let out = stdout(&verified);
    assert!(out.contains("subject: user-42"));
    assert!(out.contains(&format!("issuer:  {ISSUER}")));
    assert!(out.contains("roles:   USER,ADMIN"));
}

#[test]
fn verify_reports_rejection_reason() {
    let keys_dir = fixture_keys_dir();
    let keys_dir = keys_dir.to_str().unwrap();

    let minted = sales_admin(&[
        "gentoken",
        "--keys-dir",
        keys_dir,
        "--kid",
        "k2",
        "--subject",
        "u1",
        "--issuer",
        "someone else",
    ]);
    assert!(minted.status.success(), "{minted:?}");
    let out = stdout(&minted);
    let token = out.lines().next().unwrap();

    let verified = sales_admin(&["verify", "--keys-dir", keys_dir, "--token", token]);

    assert!(!verified.status.success());
    let err = String::from_utf8_lossy(&verified.stderr);
    assert!(err.contains("issuer"), "{err}");
}

#[test]
fn gentoken_with_unknown_kid_fails() {
    let keys_dir = fixture_keys_dir();

    let output = sales_admin(&[
        "gentoken",
        "--keys-dir",
        keys_dir.to_str().unwrap(),
        "--kid",
        "missing",
        "--subject",
        "u1",
    ]);

    assert!(!output.status.success());
    assert!(stdout(&output).is_empty());
}
