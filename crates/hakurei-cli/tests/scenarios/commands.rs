//! Subcommands that need no privileges.

use crate::common::{hakurei, run_in};

#[test]
fn help_lists_subcommands() {
    let out = hakurei().arg("--help").output().unwrap();
    assert!(out.status.success());
    let help = String::from_utf8_lossy(&out.stdout);
    for cmd in ["run", "export-seccomp", "ps"] {
        assert!(help.contains(cmd), "{cmd} missing from help:\n{help}");
    }
    assert!(!help.contains("shim"));
}

#[test]
fn export_seccomp_to_stdout() {
    let dir = tempfile::tempdir().unwrap();
    let out = run_in(dir.path(), &["export-seccomp"]);
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
    assert!(!out.stdout.is_empty());
    // struct sock_filter is 8 bytes
    assert_eq!(out.stdout.len() % 8, 0);
}

#[test]
fn export_seccomp_to_file() {
    let dir = tempfile::tempdir().unwrap();
    let strict = dir.path().join("strict.bpf");
    let relaxed = dir.path().join("relaxed.bpf");

    let out = run_in(
        dir.path(),
        &["export-seccomp", "-p", "ext,deny-ns,deny-tty,deny-devel", "-o", strict.to_str().unwrap()],
    );
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
    let out = run_in(dir.path(), &["export-seccomp", "-p", "ext", "-o", relaxed.to_str().unwrap()]);
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));

    let strict = std::fs::read(strict).unwrap();
    let relaxed = std::fs::read(relaxed).unwrap();
    assert_eq!(strict.len() % 8, 0);
    assert!(strict.len() > relaxed.len());
}

#[test]
fn export_seccomp_rejects_unknown_preset() {
    let dir = tempfile::tempdir().unwrap();
    let out = run_in(dir.path(), &["export-seccomp", "-p", "bogus"]);
    assert!(!out.status.success());
    assert!(out.stdout.is_empty());
}

#[test]
fn ps_without_instances() {
    let dir = tempfile::tempdir().unwrap();
    let out = run_in(dir.path(), &["ps"]);
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
    let stdout = String::from_utf8_lossy(&out.stdout);
    let lines: Vec<_> = stdout.lines().collect();
    assert_eq!(lines.len(), 1, "{stdout}");
    assert!(lines[0].starts_with("INSTANCE"));

    let out = run_in(dir.path(), &["ps", "--long"]);
    assert!(out.status.success());
    assert!(out.stdout.is_empty());
}

#[test]
fn run_rejects_bad_identity() {
    let dir = tempfile::tempdir().unwrap();
    let out = run_in(dir.path(), &["run", "-a", "10000", "true"]);
    assert!(!out.status.success());
}
