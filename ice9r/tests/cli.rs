use std::io::{BufRead, BufReader, Read, Write};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::thread;

fn client_exe() -> &'static str {
    env!("CARGO_BIN_EXE_ice9r")
}

// The daemon binary lands next to our own when the whole workspace is
// built; skip gracefully when it is missing.
fn daemon_exe() -> Option<PathBuf> {
    let client = PathBuf::from(client_exe());
    let cand = client.parent()?.join("ice9d");
    if cand.is_file() {
        Some(cand)
    } else {
        None
    }
}

struct Daemon {
    child: Child,
    addr: SocketAddr,
}

impl Daemon {
    fn start() -> Option<Daemon> {
        let exe = daemon_exe()?;
        let mut child = Command::new(exe)
            .arg("-p")
            .arg("0")
            .stderr(Stdio::piped())
            .spawn()
            .expect("spawn ice9d");
        let stderr = child.stderr.take().expect("daemon stderr");
        let mut reader = BufReader::new(stderr);
        let mut line = String::new();
        reader.read_line(&mut line).expect("read listen line");
        let addr: SocketAddr = line
            .trim()
            .strip_prefix("listening on ")
            .unwrap_or_else(|| panic!("unexpected startup line: {line:?}"))
            .parse()
            .expect("parse listen address");
        thread::spawn(move || {
            let mut sink = Vec::new();
            let _ = reader.read_to_end(&mut sink);
        });
        Some(Daemon { child, addr })
    }

    fn client(&self) -> Command {
        let mut cmd = Command::new(client_exe());
        cmd.arg("127.0.0.1")
            .arg("-p")
            .arg(self.addr.port().to_string());
        cmd
    }
}

impl Drop for Daemon {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

#[test]
fn echo_arguments_survive_the_wire() {
    let Some(daemon) = Daemon::start() else {
        eprintln!("SKIP: ice9d not found");
        return;
    };
    let out = daemon
        .client()
        .arg("--")
        .arg("/bin/echo")
        .arg("a b")
        .arg("c\"d")
        .arg("e\\")
        .output()
        .unwrap();
    assert!(
        out.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&out.stderr)
    );
    assert_eq!(out.stdout, b"a b c\"d e\\\n");
}

#[test]
fn exit_code_propagates() {
    let Some(daemon) = Daemon::start() else {
        eprintln!("SKIP: ice9d not found");
        return;
    };
    let out = daemon
        .client()
        .args(["--", "/bin/sh", "-c", "exit 7"])
        .output()
        .unwrap();
    assert_eq!(out.status.code(), Some(7));
}

#[test]
fn stdin_is_forwarded() {
    let Some(daemon) = Daemon::start() else {
        eprintln!("SKIP: ice9d not found");
        return;
    };
    let mut child = daemon
        .client()
        .arg("/bin/cat")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .spawn()
        .unwrap();
    child
        .stdin
        .take()
        .unwrap()
        .write_all(b"hello\nworld\n")
        .unwrap();
    let out = child.wait_with_output().unwrap();
    assert!(out.status.success());
    assert_eq!(out.stdout, b"hello\nworld\n");
}

#[test]
fn verbatim_command_line_mode() {
    let Some(daemon) = Daemon::start() else {
        eprintln!("SKIP: ice9d not found");
        return;
    };
    let out = daemon
        .client()
        .arg("/bin/sh")
        .arg("-e")
        .arg("\"sh\" \"-c\" \"exit 5\"")
        .output()
        .unwrap();
    assert_eq!(out.status.code(), Some(5));
}

#[test]
fn remote_stderr_goes_to_local_stderr() {
    let Some(daemon) = Daemon::start() else {
        eprintln!("SKIP: ice9d not found");
        return;
    };
    let out = daemon
        .client()
        .args(["--", "/bin/sh", "-c", "echo oops >&2"])
        .output()
        .unwrap();
    assert!(out.status.success());
    assert!(out.stdout.is_empty());
    assert_eq!(out.stderr, b"oops\n");
}

#[test]
fn missing_remote_program_exits_nonzero() {
    let Some(daemon) = Daemon::start() else {
        eprintln!("SKIP: ice9d not found");
        return;
    };
    let out = daemon
        .client()
        .arg("/nonexistent/ice9-nosuch-binary")
        .output()
        .unwrap();
    assert_eq!(out.status.code(), Some(74));
}

#[test]
fn usage_error_without_arguments() {
    let out = Command::new(client_exe()).output().unwrap();
    assert_eq!(out.status.code(), Some(64));
    assert!(!out.stderr.is_empty());
}

#[test]
fn usage_error_mixing_e_with_arguments() {
    let out = Command::new(client_exe())
        .args(["127.0.0.1", "/bin/sh", "extra", "-e", "x"])
        .output()
        .unwrap();
    assert_eq!(out.status.code(), Some(64));
}
