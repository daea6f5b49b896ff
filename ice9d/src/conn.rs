//! Per-connection state and frame dispatch.
//!
//! A connection starts in Setup collecting the application path, command
//! line and working directory, moves to Running when the execute request
//! spawns the child, and to Closing once the exit-status frame has been
//! queued. Service methods return false when the slot has to be torn down;
//! the scheduler removes it and calls [`Connection::shutdown`].

use std::env;
use std::ffi::{OsStr, OsString};
use std::io::{ErrorKind, Read, Write};
use std::net::TcpStream;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::{Path, PathBuf};

use ice9_wire as wire;

use crate::buffer::FixedBuf;
use crate::child::{self, ChildProc};
use crate::pathsearch;
use crate::pipe::{self, PipeReader, PipeWriter, PIPE_READ_SIZE};

pub const RECVBUF_SIZE: usize = 72 * 1024;
pub const SENDBUF_SIZE: usize = 128 * 1024;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum ConnState {
    Setup,
    Running,
    Closing,
}

pub struct Connection {
    pub id: u64,
    state: ConnState,
    sock: TcpStream,
    recvbuf: FixedBuf,
    sendbuf: FixedBuf,
    application_path: Option<Vec<u8>>,
    command_line: Option<Vec<u8>>,
    working_directory: Option<Vec<u8>>,
    child: Option<ChildProc>,
    stdin_pipe: Option<PipeWriter>,
    stdout_pipe: Option<PipeReader>,
    stderr_pipe: Option<PipeReader>,
    debug: bool,
}

impl Connection {
    /// The socket must already be nonblocking.
    pub fn new(id: u64, sock: TcpStream) -> Connection {
        Connection {
            id,
            state: ConnState::Setup,
            sock,
            recvbuf: FixedBuf::with_capacity(RECVBUF_SIZE),
            sendbuf: FixedBuf::with_capacity(SENDBUF_SIZE),
            application_path: None,
            command_line: None,
            working_directory: None,
            child: None,
            stdin_pipe: None,
            stdout_pipe: None,
            stderr_pipe: None,
            debug: env::var_os("ICE9_DEBUG").is_some(),
        }
    }

    // Wait-set accessors, gated by backpressure: an input is only offered
    // to the scheduler while the corresponding output has room.

    /// Child stdout completion, when a full-size frame would fit.
    pub fn stdout_event(&self) -> Option<RawFd> {
        if self.sendbuf.free() >= wire::HEADER_LEN + PIPE_READ_SIZE {
            self.stdout_pipe.as_ref().map(|p| p.event_fd())
        } else {
            None
        }
    }

    /// Child stderr completion, same rule as stdout.
    pub fn stderr_event(&self) -> Option<RawFd> {
        if self.sendbuf.free() >= wire::HEADER_LEN + PIPE_READ_SIZE {
            self.stderr_pipe.as_ref().map(|p| p.event_fd())
        } else {
            None
        }
    }

    /// Child exit, only once both output streams hit end of file and the
    /// exit-status frame would fit.
    pub fn child_event(&self) -> Option<RawFd> {
        if self.stdout_pipe.is_none()
            && self.stderr_pipe.is_none()
            && self.sendbuf.free() >= wire::HEADER_LEN + 4
        {
            self.child.as_ref().map(|c| c.event_fd())
        } else {
            None
        }
    }

    /// Stdin write completion, while one is in flight.
    pub fn stdin_event(&self) -> Option<RawFd> {
        self.stdin_pipe
            .as_ref()
            .filter(|p| p.pending())
            .map(|p| p.event_fd())
    }

    pub fn wants_sock_read(&self) -> bool {
        self.recvbuf.free() > 0
    }

    pub fn wants_sock_write(&self) -> bool {
        !self.sendbuf.is_empty()
    }

    pub fn sock_fd(&self) -> RawFd {
        self.sock.as_raw_fd()
    }

    /// Socket readable: pull in what fits and run the frame parser.
    pub fn on_readable(&mut self) -> bool {
        if self.recvbuf.free() == 0 {
            return true;
        }
        match self.sock.read(self.recvbuf.space()) {
            Ok(0) => {
                eprintln!("[{}] connection closed by peer", self.id);
                false
            }
            Ok(n) => {
                self.recvbuf.advance(n);
                self.process_frames()
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => true,
            Err(e) if e.kind() == ErrorKind::Interrupted => true,
            Err(e) => {
                eprintln!("[{}] connection read error: {e}", self.id);
                false
            }
        }
    }

    /// Dispatches every complete frame in the receive buffer. Also run
    /// after a stalled stdin write drains, so a frame buffered behind the
    /// write cannot wait for more socket traffic.
    fn process_frames(&mut self) -> bool {
        loop {
            let Some((cmd, len)) = wire::decode_header(self.recvbuf.filled()) else {
                break;
            };
            let total = wire::HEADER_LEN + len;
            if self.recvbuf.used() < total {
                break;
            }
            if self.debug {
                eprintln!(
                    "[{}] frame '{}' with {} byte payload",
                    self.id, cmd as char, len
                );
            }
            match (cmd, self.state) {
                (wire::MSG_APP, ConnState::Setup) => {
                    self.application_path =
                        Some(self.recvbuf.filled()[wire::HEADER_LEN..total].to_vec());
                }
                (wire::MSG_CMDLINE, ConnState::Setup) => {
                    self.command_line =
                        Some(self.recvbuf.filled()[wire::HEADER_LEN..total].to_vec());
                }
                (wire::MSG_WORKDIR, ConnState::Setup) => {
                    self.working_directory =
                        Some(self.recvbuf.filled()[wire::HEADER_LEN..total].to_vec());
                }
                (wire::MSG_EXEC, ConnState::Setup) => {
                    if !self.execute() {
                        return false;
                    }
                }
                (wire::MSG_STDIN, ConnState::Running) => {
                    if len == 0 {
                        // Client signalled stdin end of file. A write still
                        // in flight finishes on the helper before the fd
                        // goes away with the endpoint.
                        self.stdin_pipe = None;
                    } else if let Some(stdin) = self.stdin_pipe.as_mut() {
                        if stdin.pending() {
                            // Stall: leave the frame buffered and let the
                            // loop re-arm on the write event.
                            return true;
                        }
                        let payload = &self.recvbuf.filled()[wire::HEADER_LEN..total];
                        if let Err(e) = stdin.initiate(payload) {
                            eprintln!("[{}] write error on child stdin: {e}", self.id);
                            return false;
                        }
                    }
                    // Data after stdin end of file is dropped.
                }
                (cmd, state) => {
                    let known = matches!(
                        cmd,
                        wire::MSG_APP
                            | wire::MSG_CMDLINE
                            | wire::MSG_WORKDIR
                            | wire::MSG_EXEC
                            | wire::MSG_STDIN
                    );
                    if known {
                        eprintln!(
                            "[{}] command '{}' not valid in {:?} state",
                            self.id, cmd as char, state
                        );
                    } else {
                        eprintln!("[{}] unrecognised command '{}'", self.id, cmd as char);
                    }
                    return false;
                }
            }
            self.recvbuf.consume(total);
        }
        true
    }

    /// Handles the execute request: pipes, path resolution, spawn.
    fn execute(&mut self) -> bool {
        if self.application_path.is_none() {
            eprintln!("[{}] execute request without an application path", self.id);
            return false;
        }

        let (stdin_pipe, stdin_child) = match pipe::writer_pair() {
            Ok(v) => v,
            Err(e) => {
                eprintln!("[{}] cannot create stdin pipe: {e}", self.id);
                return false;
            }
        };
        let (mut stdout_pipe, stdout_child) = match pipe::reader_pair() {
            Ok(v) => v,
            Err(e) => {
                eprintln!("[{}] cannot create stdout pipe: {e}", self.id);
                return false;
            }
        };
        let (mut stderr_pipe, stderr_child) = match pipe::reader_pair() {
            Ok(v) => v,
            Err(e) => {
                eprintln!("[{}] cannot create stderr pipe: {e}", self.id);
                return false;
            }
        };

        let app = self.application_path.as_deref().unwrap_or_default();
        let app_os = OsStr::from_bytes(app);
        let program = self.resolve_program(app);

        // The command line travels verbatim; it only becomes an argv here.
        // Without one, the application path stands in for it.
        let argv: Vec<OsString> = match self.command_line.as_deref() {
            Some(cl) => {
                let parts = wire::cmdline::split(cl);
                if parts.is_empty() {
                    vec![app_os.to_os_string()]
                } else {
                    parts.into_iter().map(OsString::from_vec).collect()
                }
            }
            None => vec![app_os.to_os_string()],
        };
        let workdir: Option<OsString> = self
            .working_directory
            .as_deref()
            .map(|d| OsStr::from_bytes(d).to_os_string());

        if self.debug {
            eprintln!(
                "[{}] application path: {}",
                self.id,
                app_os.to_string_lossy()
            );
            eprintln!(
                "[{}] command line: {}",
                self.id,
                String::from_utf8_lossy(self.command_line.as_deref().unwrap_or_default())
            );
        }

        match child::spawn(
            &program,
            &argv,
            workdir.as_deref(),
            stdin_child,
            stdout_child,
            stderr_child,
        ) {
            Ok(child) => {
                if stdout_pipe.initiate().is_err() || stderr_pipe.initiate().is_err() {
                    eprintln!("[{}] cannot start pipe reads", self.id);
                    child.kill();
                    return false;
                }
                eprintln!("[{}] started process {}", self.id, child.id());
                self.child = Some(child);
                self.stdin_pipe = Some(stdin_pipe);
                self.stdout_pipe = Some(stdout_pipe);
                self.stderr_pipe = Some(stderr_pipe);
                self.state = ConnState::Running;
                true
            }
            Err(e) => {
                eprintln!("[{}] {e:#}", self.id);
                false
            }
        }
    }

    fn resolve_program(&self, app: &[u8]) -> PathBuf {
        let app_os = OsStr::from_bytes(app);
        if !app.contains(&b'/') {
            if Path::new(app_os).exists() {
                // A bare name sitting in the daemon's own directory; pin it
                // down so exec cannot re-resolve it against PATH or the
                // child's working directory.
                if let Ok(cwd) = env::current_dir() {
                    return cwd.join(app_os);
                }
            } else {
                eprintln!(
                    "[{}] {} not found here, searching PATH",
                    self.id,
                    app_os.to_string_lossy()
                );
                if let Some(found) = pathsearch::search(app_os) {
                    eprintln!("[{}] found {}", self.id, found.display());
                    return found;
                }
            }
        }
        PathBuf::from(app_os)
    }

    /// Completion on a child output pipe: forward data, translate end of
    /// file into an empty frame, re-arm the read.
    pub fn on_stdout(&mut self) -> bool {
        self.pump_output(true)
    }

    pub fn on_stderr(&mut self) -> bool {
        self.pump_output(false)
    }

    fn pump_output(&mut self, is_stdout: bool) -> bool {
        let res = {
            let slot = if is_stdout {
                &mut self.stdout_pipe
            } else {
                &mut self.stderr_pipe
            };
            match slot.as_mut() {
                Some(p) => p.result(),
                None => return true,
            }
        };
        let (tag, name) = if is_stdout {
            (wire::MSG_STDOUT, "stdout")
        } else {
            (wire::MSG_STDERR, "stderr")
        };
        match res {
            None => true,
            Some(Ok(data)) if data.is_empty() => {
                // Write end closed: tell the client this stream is done.
                eprintln!("[{}] end of file on child {name}", self.id);
                if is_stdout {
                    self.stdout_pipe = None;
                } else {
                    self.stderr_pipe = None;
                }
                self.send_frame(tag, &[])
            }
            Some(Ok(data)) => {
                if !self.send_frame(tag, &data) {
                    return false;
                }
                let slot = if is_stdout {
                    &mut self.stdout_pipe
                } else {
                    &mut self.stderr_pipe
                };
                if let Some(p) = slot.as_mut() {
                    if let Err(e) = p.initiate() {
                        eprintln!("[{}] read error on child {name}: {e}", self.id);
                        return false;
                    }
                }
                true
            }
            Some(Err(e)) => {
                eprintln!("[{}] read error on child {name}: {e}", self.id);
                false
            }
        }
    }

    /// Completion of an in-flight stdin write.
    pub fn on_stdin_writable(&mut self) -> bool {
        let res = match self.stdin_pipe.as_mut() {
            Some(p) => p.result(),
            None => return true,
        };
        match res {
            None => true,
            Some(Ok(n)) => {
                if self.debug {
                    eprintln!("[{}] wrote {n} bytes to child stdin", self.id);
                }
                // A frame may have stalled behind this write.
                self.process_frames()
            }
            Some(Err(e)) => {
                eprintln!("[{}] write error on child stdin: {e}", self.id);
                false
            }
        }
    }

    /// The exit wait object fired: queue the exit-status frame and start
    /// draining.
    pub fn on_child_exit(&mut self) -> bool {
        let code = match self.child.as_mut() {
            Some(c) => match c.exit_code() {
                Some(code) => code,
                None => return true,
            },
            None => return true,
        };
        self.child = None;
        eprintln!("[{}] process exited with code {code}", self.id);
        self.state = ConnState::Closing;
        self.send_frame(wire::MSG_EXIT, &code.to_le_bytes())
    }

    /// Appends a frame to the send buffer and flushes. Overrunning the
    /// buffer is unrecoverable for the connection.
    fn send_frame(&mut self, cmd: u8, payload: &[u8]) -> bool {
        debug_assert!(payload.len() <= wire::MAX_PAYLOAD);
        if self.sendbuf.free() < wire::HEADER_LEN + payload.len() {
            eprintln!("[{}] send buffer overrun", self.id);
            return false;
        }
        self.sendbuf
            .push(&wire::encode_header(cmd, payload.len() as u16));
        self.sendbuf.push(payload);
        self.flush()
    }

    /// Attempts a nonblocking send of whatever is queued. Returns false
    /// when the slot is done for: a write error, or Closing with an empty
    /// buffer (the drain completed).
    pub fn flush(&mut self) -> bool {
        if !self.sendbuf.is_empty() {
            match self.sock.write(self.sendbuf.filled()) {
                Ok(n) => self.sendbuf.consume(n),
                Err(e) if e.kind() == ErrorKind::WouldBlock => {}
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => {
                    eprintln!("[{}] connection write error: {e}", self.id);
                    return false;
                }
            }
        }
        !(self.sendbuf.is_empty() && self.state == ConnState::Closing)
    }

    /// Releases the slot's resources. The child dies first so that any
    /// helper blocked in a pipe read sees end of file and unwinds; only
    /// then are the endpoints dropped. Helpers are never joined here.
    pub fn shutdown(&mut self) {
        if let Some(child) = self.child.take() {
            child.kill();
        }
        self.stdin_pipe = None;
        self.stdout_pipe = None;
        self.stderr_pipe = None;
    }
}
