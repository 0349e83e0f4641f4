//! Exercises the binary surface: stdin input, exit codes, skip warnings.

mod common;

use assert_cmd::Command;
use common::{add_file, pad_payload, raw_header, terminate};

fn archive_with_escape() -> Vec<u8> {
    let mut archive = vec![];
    archive.extend_from_slice(&raw_header(b"../evil", b'0', 4, 0o644, 0));
    pad_payload(&mut archive, b"evil");
    add_file(&mut archive, b"fine", b"ok", 0o644, 0);
    terminate(&mut archive);
    archive
}

#[test]
fn packs_from_stdin() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("image.sqfs");

    let mut archive = vec![];
    add_file(&mut archive, b"hello.txt", b"hello world\n", 0o644, 0);
    terminate(&mut archive);

    Command::cargo_bin("tar2sqfs")
        .unwrap()
        .arg(&out)
        .write_stdin(archive)
        .assert()
        .success();

    let image = std::fs::read(&out).unwrap();
    assert_eq!(&image[0..4], b"hsqs");
    assert_eq!(image.len() % 4096, 0);
}

#[test]
fn escaping_entry_warns_but_succeeds() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("image.sqfs");

    Command::cargo_bin("tar2sqfs")
        .unwrap()
        .arg(&out)
        .write_stdin(archive_with_escape())
        .assert()
        .success()
        .stderr(predicates::str::contains("escapes archive root"));
}

#[test]
fn no_skip_fails_on_escaping_entry() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("image.sqfs");

    Command::cargo_bin("tar2sqfs")
        .unwrap()
        .arg("--no-skip")
        .arg(&out)
        .write_stdin(archive_with_escape())
        .assert()
        .failure()
        .code(1);
}

#[test]
fn refuses_existing_output_without_force() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("image.sqfs");
    std::fs::write(&out, b"precious").unwrap();

    let mut archive = vec![];
    terminate(&mut archive);

    Command::cargo_bin("tar2sqfs")
        .unwrap()
        .arg(&out)
        .write_stdin(archive.clone())
        .assert()
        .failure()
        .code(1);
    // untouched
    assert_eq!(std::fs::read(&out).unwrap(), b"precious");

    Command::cargo_bin("tar2sqfs")
        .unwrap()
        .arg("--force")
        .arg(&out)
        .write_stdin(archive)
        .assert()
        .success();
    assert_eq!(&std::fs::read(&out).unwrap()[0..4], b"hsqs");
}

#[test]
fn comp_extra_help_exits_zero() {
    Command::cargo_bin("tar2sqfs")
        .unwrap()
        .args(["-X", "help", "-c", "gzip", "out.sqfs"])
        .assert()
        .success()
        .stdout(predicates::str::contains("level"));
}
