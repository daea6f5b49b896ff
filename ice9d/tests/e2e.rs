use std::io::Write;
use std::os::unix::ffi::OsStrExt;
use std::thread;
use std::time::Duration;

use ice9_wire as wire;

use test_util::Daemon;

#[test]
fn echo_run_produces_output_eofs_and_exit() {
    let daemon = Daemon::start();
    let mut s = daemon.connect();
    s.run(b"/bin/echo", &[b"echo", b"hi"]);
    let out = s.collect();
    assert_eq!(out.stdout, b"hi\n");
    assert!(out.stderr.is_empty());
    assert_eq!(out.stdout_eofs, 1);
    assert_eq!(out.stderr_eofs, 1);
    assert_eq!(out.exit_code, Some(0));
    // after the exit frame the daemon closes the socket
    assert!(s.recv().is_none());
}

#[test]
fn stdin_is_relayed_through_cat() {
    let daemon = Daemon::start();
    let mut s = daemon.connect();
    s.run(b"/bin/cat", &[b"cat"]);
    s.send(wire::MSG_STDIN, b"abc\n");
    s.send(wire::MSG_STDIN, b"xyz\n");
    s.send(wire::MSG_STDIN, b"");
    let out = s.collect();
    assert_eq!(out.stdout, b"abc\nxyz\n");
    assert_eq!(out.exit_code, Some(0));
}

#[test]
fn stdin_is_filtered_through_grep() {
    let daemon = Daemon::start();
    let mut s = daemon.connect();
    s.run(b"/bin/sh", &[b"sh", b"-c", b"grep x"]);
    s.send(wire::MSG_STDIN, b"abc\n");
    s.send(wire::MSG_STDIN, b"xyz\n");
    s.send(wire::MSG_STDIN, b"");
    let out = s.collect();
    assert_eq!(out.stdout, b"xyz\n");
    assert_eq!(out.exit_code, Some(0));
}

#[test]
fn missing_program_closes_without_exit_frame() {
    let daemon = Daemon::start();
    let mut s = daemon.connect();
    s.run(b"/nonexistent/ice9-nosuch-binary", &[b"nosuch"]);
    let out = s.collect();
    assert_eq!(out.exit_code, None);
    assert!(out.stdout.is_empty());
}

#[test]
fn exit_code_is_propagated() {
    let daemon = Daemon::start();
    let mut s = daemon.connect();
    s.run(b"/bin/sh", &[b"sh", b"-c", b"exit 42"]);
    let out = s.collect();
    assert_eq!(out.exit_code, Some(42));
    assert_eq!(out.stdout_eofs, 1);
    assert_eq!(out.stderr_eofs, 1);
}

#[test]
fn stderr_travels_on_its_own_stream() {
    let daemon = Daemon::start();
    let mut s = daemon.connect();
    s.run(b"/bin/sh", &[b"sh", b"-c", b"echo out; echo err >&2"]);
    let out = s.collect();
    assert_eq!(out.stdout, b"out\n");
    assert_eq!(out.stderr, b"err\n");
    assert_eq!(out.exit_code, Some(0));
}

#[test]
fn bare_program_names_are_found_on_path() {
    let daemon = Daemon::start();
    let mut s = daemon.connect();
    s.run(b"echo", &[b"echo", b"found"]);
    let out = s.collect();
    assert_eq!(out.stdout, b"found\n");
    assert_eq!(out.exit_code, Some(0));
}

#[test]
fn working_directory_frame_is_honored() {
    let dir = tempfile::tempdir().unwrap();
    let canon = dir.path().canonicalize().unwrap();

    let daemon = Daemon::start();
    let mut s = daemon.connect();
    s.send(wire::MSG_APP, b"/bin/sh");
    s.send(
        wire::MSG_CMDLINE,
        &wire::cmdline::build([&b"sh"[..], b"-c", b"pwd"]),
    );
    s.send(wire::MSG_WORKDIR, canon.as_os_str().as_bytes());
    s.send(wire::MSG_EXEC, b"");
    let out = s.collect();
    let mut expect = canon.as_os_str().as_bytes().to_vec();
    expect.push(b'\n');
    assert_eq!(out.stdout, expect);
    assert_eq!(out.exit_code, Some(0));
}

#[test]
fn missing_command_line_defaults_to_the_program() {
    let daemon = Daemon::start();
    let mut s = daemon.connect();
    s.send(wire::MSG_APP, b"/bin/echo");
    s.send(wire::MSG_EXEC, b"");
    let out = s.collect();
    assert_eq!(out.stdout, b"\n");
    assert_eq!(out.exit_code, Some(0));
}

// Larger than the send buffer, so the output gates have to open and close
// while we drain at our own pace.
#[test]
fn large_output_is_fully_delivered() {
    let daemon = Daemon::start();
    let mut s = daemon.connect();
    s.run(b"/bin/sh", &[b"sh", b"-c", b"head -c 300000 /dev/zero"]);
    let out = s.collect();
    assert_eq!(out.stdout.len(), 300_000);
    assert!(out.stdout.iter().all(|&b| b == 0));
    assert_eq!(out.stdout_eofs, 1);
    assert_eq!(out.stderr_eofs, 1);
    assert_eq!(out.exit_code, Some(0));
}

// The child ignores stdin until it has produced all its output, so the
// stdin pipe fills, a write hangs in flight and later stdin frames stall
// in the receive buffer. Output must keep flowing through the stall, and
// the stalled frames must drain once the child starts reading.
#[test]
fn stalled_stdin_does_not_block_output() {
    let daemon = Daemon::start();
    let mut s = daemon.connect();
    s.run(
        b"/bin/sh",
        &[b"sh", b"-c", b"head -c 200000 /dev/zero; cat >/dev/null; exit 7"],
    );

    let sock = s.sock.try_clone().unwrap();
    let writer = thread::spawn(move || {
        let mut sock = sock;
        let chunk = vec![b'x'; 60_000];
        for _ in 0..4 {
            let mut frame = Vec::new();
            ice9_wire::push_frame(&mut frame, wire::MSG_STDIN, &chunk);
            sock.write_all(&frame).expect("send stdin frame");
        }
        let mut eof = Vec::new();
        ice9_wire::push_frame(&mut eof, wire::MSG_STDIN, b"");
        sock.write_all(&eof).expect("send stdin eof");
    });

    let out = s.collect();
    assert_eq!(out.stdout.len(), 200_000);
    assert_eq!(out.exit_code, Some(7));
    writer.join().unwrap();
}

#[test]
fn unknown_command_closes_the_connection() {
    let daemon = Daemon::start();
    let mut s = daemon.connect();
    s.send(b'Z', b"?");
    let out = s.collect();
    assert_eq!(out.exit_code, None);
}

#[test]
fn stdin_frame_during_setup_closes_the_connection() {
    let daemon = Daemon::start();
    let mut s = daemon.connect();
    s.send(wire::MSG_STDIN, b"early");
    assert!(s.recv().is_none());
}

#[test]
fn empty_application_path_fails_the_spawn() {
    let daemon = Daemon::start();
    let mut s = daemon.connect();
    s.send(wire::MSG_APP, b"");
    s.send(wire::MSG_EXEC, b"");
    let out = s.collect();
    assert_eq!(out.exit_code, None);
}

#[test]
fn seventeenth_connection_is_rejected() {
    let daemon = Daemon::start();

    // Fill all sixteen slots and prove each one is live.
    let mut held = Vec::new();
    for _ in 0..16 {
        let mut s = daemon.connect();
        s.run(b"/bin/cat", &[b"cat"]);
        s.send(wire::MSG_STDIN, b"ping\n");
        let (cmd, payload) = s.recv().unwrap();
        assert_eq!((cmd, payload.as_slice()), (wire::MSG_STDOUT, &b"ping\n"[..]));
        held.push(s);
    }

    // Slot seventeen: accepted, then immediately closed.
    let mut extra = daemon.connect();
    assert!(extra.recv().is_none());

    // Freeing a slot lets the daemon accept again. The freed slot is only
    // reaped on the wake after the rejected one, hence the throwaway
    // connection.
    held.pop();
    thread::sleep(Duration::from_millis(50));
    drop(daemon.connect());
    thread::sleep(Duration::from_millis(50));

    let mut s = daemon.connect();
    s.run(b"/bin/cat", &[b"cat"]);
    s.send(wire::MSG_STDIN, b"pong\n");
    let (cmd, payload) = s.recv().unwrap();
    assert_eq!((cmd, payload.as_slice()), (wire::MSG_STDOUT, &b"pong\n"[..]));
}
