use std::io::Write;
use std::net::TcpListener;
use std::process::{Command, Output, Stdio};

fn run(args: &[&str], stdin: &[u8]) -> Output {
    let mut child = Command::new(env!("CARGO_BIN_EXE_bleed-scan-rs"))
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("binary starts");
    // A usage error exits before reading stdin, so the pipe may already be closed.
    let _ = child.stdin.take().expect("stdin is piped").write_all(stdin);
    child.wait_with_output().expect("binary exits")
}

fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    listener.local_addr().expect("local addr").port()
}

#[test]
fn empty_input_exits_cleanly() {
    let out = run(&[], b"");
    assert!(out.status.success());
    assert!(out.stdout.is_empty());
}

#[test]
fn refused_target_reported_and_bad_lines_skipped() {
    let port = closed_port();
    let input = format!("bogus,127.0.0.1,{port}\nhttps,127.0.0.1,{port}\n");
    let out = run(&["-w", "2"], input.as_bytes());
    assert_eq!(out.status.code(), Some(0));
    assert_eq!(
        String::from_utf8(out.stdout).expect("utf-8 csv"),
        format!("N,https,127.0.0.1,{port},NOT VULNERABLE - CONNECTION REFUSED\n")
    );
}

#[test]
fn zero_workers_is_a_usage_error() {
    let out = run(&["--workers", "0"], b"");
    assert!(!out.status.success());
    assert!(!out.stderr.is_empty());
}
