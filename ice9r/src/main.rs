//! ice9r - run a command on a remote host through an ice9 daemon.
//!
//! Sends the setup frames, then relays local stdin to the remote process
//! and its stdout/stderr back until the daemon reports the exit status,
//! which becomes this process's own exit code.

use std::env;
use std::io::{ErrorKind, Read, Write};
use std::net::TcpStream;
use std::os::fd::AsRawFd;
use std::os::unix::ffi::OsStrExt;
use std::process::exit;

use anyhow::{bail, Context, Result};
use ice9_wire as wire;

// sysexits-style codes
const EX_USAGE: i32 = 64;
const EX_DATAERR: i32 = 65;
const EX_IOERR: i32 = 74;

fn print_usage(argv0: &str) {
    eprintln!("usage: {argv0} <host> [-p <port>] <executable> [<arguments> ...]");
    eprintln!("       {argv0} <host> [-p <port>] <executable> -e <command line>");
    eprintln!();
    eprintln!("The first form encodes the given arguments into the remote process's");
    eprintln!("argument string with the standard quoting rules.");
    eprintln!();
    eprintln!("The second form sends an exact argument string, for programs with");
    eprintln!("non-standard argument parsing.");
}

fn main() {
    let argv0 = env::args().next().unwrap_or_else(|| "ice9r".into());

    let mut skip_args = false;
    let mut host: Option<String> = None;
    let mut port: u16 = wire::DEFAULT_PORT;
    let mut program: Option<Vec<u8>> = None;
    let mut verbatim: Option<Vec<u8>> = None;
    let mut cmdline: Vec<u8> = Vec::new();
    let mut extra_args = 0usize;

    let mut args = env::args_os().skip(1);
    while let Some(a) = args.next() {
        let bytes = a.as_os_str().as_bytes();
        if !skip_args && bytes.first() == Some(&b'-') {
            match bytes {
                b"-p" => {
                    let Some(v) = args.next() else {
                        eprintln!("option '-p' requires a parameter");
                        exit(EX_USAGE);
                    };
                    match v.to_string_lossy().parse::<u16>() {
                        Ok(p) => port = p,
                        Err(_) => {
                            eprintln!("invalid port: {}", v.to_string_lossy());
                            exit(EX_USAGE);
                        }
                    }
                }
                b"-e" => {
                    let Some(v) = args.next() else {
                        eprintln!("option '-e' requires a parameter");
                        exit(EX_USAGE);
                    };
                    verbatim = Some(v.as_os_str().as_bytes().to_vec());
                }
                b"--" => skip_args = true,
                _ => {
                    eprintln!("unrecognised option: {}", a.to_string_lossy());
                    exit(EX_USAGE);
                }
            }
        } else if host.is_none() {
            host = Some(a.to_string_lossy().into_owned());
        } else if program.is_none() {
            program = Some(bytes.to_vec());
            wire::cmdline::append_quoted(&mut cmdline, bytes);
        } else {
            wire::cmdline::append_quoted(&mut cmdline, bytes);
            extra_args += 1;
        }
    }

    let (Some(host), Some(program)) = (host, program) else {
        print_usage(&argv0);
        exit(EX_USAGE);
    };

    if program.len() > wire::MAX_PAYLOAD {
        eprintln!("program name too long");
        exit(EX_DATAERR);
    }

    let cmdline = match verbatim {
        Some(v) => {
            if extra_args > 0 {
                eprintln!("additional arguments cannot be combined with '-e'");
                exit(EX_USAGE);
            }
            v
        }
        None => cmdline,
    };

    if cmdline.len() > wire::MAX_PAYLOAD {
        eprintln!("command line is too long");
        exit(EX_DATAERR);
    }

    match run(&host, port, &program, &cmdline) {
        Ok(code) => exit(code),
        Err(e) => {
            eprintln!("{e:#}");
            exit(EX_IOERR);
        }
    }
}

fn run(host: &str, port: u16, program: &[u8], cmdline: &[u8]) -> Result<i32> {
    let mut sock = TcpStream::connect((host, port))
        .with_context(|| format!("cannot connect to {host}:{port}"))?;

    let mut setup = Vec::new();
    wire::push_frame(&mut setup, wire::MSG_APP, program);
    wire::push_frame(&mut setup, wire::MSG_CMDLINE, cmdline);
    wire::push_frame(&mut setup, wire::MSG_EXEC, &[]);
    sock.write_all(&setup).context("send setup")?;

    let mut stdin_open = true;
    let mut stdout_open = true;
    let mut stderr_open = true;

    loop {
        let mut pfds = vec![libc::pollfd {
            fd: sock.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        }];
        if stdin_open {
            pfds.push(libc::pollfd {
                fd: libc::STDIN_FILENO,
                events: libc::POLLIN,
                revents: 0,
            });
        }
        let rc = unsafe { libc::poll(pfds.as_mut_ptr(), pfds.len() as libc::nfds_t, -1) };
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == ErrorKind::Interrupted {
                continue;
            }
            return Err(err).context("poll");
        }

        if pfds[0].revents != 0 {
            let mut header = [0u8; wire::HEADER_LEN];
            if let Err(e) = sock.read_exact(&mut header) {
                if e.kind() == ErrorKind::UnexpectedEof {
                    bail!("server closed the connection before reporting an exit status");
                }
                return Err(e).context("receive");
            }
            let (cmd, len) = wire::decode_header(&header).expect("full header");

            match cmd {
                wire::MSG_STDOUT => {
                    if len == 0 {
                        stdout_open = false;
                    } else {
                        relay_payload(&mut sock, len, stdout_open, &mut std::io::stdout())?;
                    }
                }
                wire::MSG_STDERR => {
                    if len == 0 {
                        stderr_open = false;
                    } else {
                        relay_payload(&mut sock, len, stderr_open, &mut std::io::stderr())?;
                    }
                }
                wire::MSG_EXIT => {
                    if len != 4 {
                        bail!("malformed exit status frame");
                    }
                    let mut code = [0u8; 4];
                    sock.read_exact(&mut code).context("receive exit status")?;
                    return Ok(i32::from_le_bytes(code));
                }
                other => bail!("unrecognised command '{}' from server", other as char),
            }
        }

        if stdin_open && pfds.len() > 1 && pfds[1].revents != 0 {
            let mut buf = [0u8; 1024];
            let n = std::io::stdin().read(&mut buf).context("read stdin")?;
            let mut frame = Vec::with_capacity(wire::HEADER_LEN + n);
            wire::push_frame(&mut frame, wire::MSG_STDIN, &buf[..n]);
            sock.write_all(&frame).context("send stdin")?;
            if n == 0 {
                stdin_open = false;
            }
        }
    }
}

/// Streams one frame's payload from the socket in small chunks. The bytes
/// are always consumed; the local write is skipped once that stream has
/// seen its end-of-file frame.
fn relay_payload(
    sock: &mut TcpStream,
    mut remaining: usize,
    open: bool,
    out: &mut impl Write,
) -> Result<()> {
    let mut buf = [0u8; 1024];
    while remaining > 0 {
        let want = remaining.min(buf.len());
        let n = sock.read(&mut buf[..want]).context("receive")?;
        if n == 0 {
            bail!("server closed the connection mid frame");
        }
        if open {
            out.write_all(&buf[..n]).context("write output")?;
        }
        remaining -= n;
    }
    if open {
        let _ = out.flush();
    }
    Ok(())
}
