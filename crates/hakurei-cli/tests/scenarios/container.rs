//! Containers started directly, with the test binary's `hakurei` as init.
//!
//! Each scenario returns early where unprivileged user namespaces are
//! unavailable.

use std::os::fd::OwnedFd;
use std::time::{Duration, Instant};

use hakurei_container::{Container, ContainerError, Ops, Params};
use rustix::pipe::{PipeFlags, pipe_with};

use crate::common::{bind_system, minimal_params, params_with, userns_usable};

fn container(params: Params) -> Container {
    let mut c = Container::new(params);
    c.set_init_program(env!("CARGO_BIN_EXE_hakurei"));
    c
}

fn run(params: Params) -> i32 {
    let mut c = container(params);
    c.start().unwrap();
    c.serve().unwrap();
    c.wait().unwrap()
}

macro_rules! require_userns {
    () => {
        if !userns_usable() {
            eprintln!("Skipping: user namespaces are not usable here");
            return;
        }
    };
}

#[test]
fn exit_code_propagates() {
    require_userns!();
    assert_eq!(run(minimal_params(&["/bin/sh", "-c", "exit 7"])), 7);
}

#[test]
fn proc_tmpfs_and_recursive_bind() {
    require_userns!();
    let mut ops = Ops::new();
    ops.proc("/proc").tmpfs("/tmp", 0, 0o1777);
    bind_system(&mut ops);
    let script = r#"
        [ -r /proc/self/status ] || exit 10
        [ -d /usr/bin ] || exit 11
        echo ok > /tmp/file && [ "$(cat /tmp/file)" = ok ] || exit 12
        [ "$(stat -c %a /tmp)" = 1777 ] || exit 13
        exit 0
    "#;
    assert_eq!(run(params_with(ops, &["sh", "-c", script])), 0);
}

#[test]
fn runs_without_proc() {
    require_userns!();
    let mut ops = Ops::new();
    bind_system(&mut ops);
    let params = params_with(ops, &["sh", "-c", "[ -e /proc/self ] && exit 1; exit 3"]);
    assert_eq!(run(params), 3);
}

#[test]
fn readonly_tmpfs_refuses_writes() {
    require_userns!();
    let mut ops = Ops::new();
    ops.dev("/dev", false)
        .tmpfs("/tmp", 0, 0o1777)
        .readonly("/srv", 0o1777);
    bind_system(&mut ops);
    let script = r#"
        [ -d /srv ] || exit 10
        touch /tmp/x || exit 11
        touch /srv/x 2>/dev/null && exit 12
        exit 0
    "#;
    assert_eq!(run(params_with(ops, &["sh", "-c", script])), 0);
}

#[test]
fn identity_and_read_only_root() {
    require_userns!();
    let script = r#"
        [ "$(id -u)" = 1000 ] || exit 10
        [ "$(id -g)" = 100 ] || exit 11
        [ "$(cat /proc/sys/kernel/hostname)" = hakurei-test ] || exit 12
        touch /file 2>/dev/null && exit 13
        touch /tmp/file || exit 14
        [ -e /proc/self/exe ] || exit 15
        exit 0
    "#;
    assert_eq!(run(minimal_params(&["/bin/sh", "-c", script])), 0);
}

#[test]
fn cancel_interrupts_payload() {
    require_userns!();
    let (r, w): (OwnedFd, OwnedFd) = pipe_with(PipeFlags::CLOEXEC).unwrap();
    let mut c = container(minimal_params(&["/bin/sh", "-c", "sleep 60"]));
    c.set_cancel(r).set_wait_delay(Duration::from_secs(2));
    c.start().unwrap();
    c.serve().unwrap();

    let start = Instant::now();
    std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(300));
        rustix::io::write(&w, &[0]).unwrap();
    });
    assert!(matches!(c.wait(), Err(ContainerError::Canceled)));
    assert!(start.elapsed() < Duration::from_secs(30));
}
