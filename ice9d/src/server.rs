//! Accept loop and readiness scheduler.
//!
//! One poll set covers the listener, every connection socket, and the
//! per-connection pipe and child-exit events, rebuilt each tick under the
//! backpressure gates the connections expose. Socket readiness is serviced
//! as a group (accept, then flush and read every connection once); pipe and
//! child completions are serviced one per tick. The group pass doubles as
//! the fairness mechanism: no slot can monopolise the loop for long.

use std::io::ErrorKind;
use std::net::{Ipv4Addr, SocketAddr, TcpListener};
use std::os::fd::AsRawFd;

use anyhow::{Context, Result};
use socket2::{Domain, Socket, Type};

use crate::conn::Connection;

pub const MAX_CONNECTIONS: usize = 16;
const LISTEN_BACKLOG: i32 = 8;

#[derive(Clone, Copy)]
enum Token {
    Listener,
    Sock(usize),
    Stdout(usize),
    Stderr(usize),
    Stdin(usize),
    Child(usize),
}

pub struct Server {
    listener: TcpListener,
    conns: Vec<Connection>,
    next_id: u64,
}

impl Server {
    pub fn bind(port: u16) -> Result<Server> {
        let socket = Socket::new(Domain::IPV4, Type::STREAM, None).context("socket")?;
        socket.set_reuse_address(true).context("SO_REUSEADDR")?;
        let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
        socket
            .bind(&addr.into())
            .with_context(|| format!("bind {addr}"))?;
        socket.listen(LISTEN_BACKLOG).context("listen")?;
        socket.set_nonblocking(true).context("nonblocking")?;
        let listener: TcpListener = socket.into();

        let local = listener.local_addr().context("local_addr")?;
        eprintln!("listening on {local}");

        Ok(Server {
            listener,
            conns: Vec::with_capacity(MAX_CONNECTIONS),
            next_id: 1,
        })
    }

    /// Runs the event loop. Never returns in normal operation.
    pub fn run(&mut self) -> Result<()> {
        fn add(
            pfds: &mut Vec<libc::pollfd>,
            tokens: &mut Vec<Token>,
            fd: std::os::fd::RawFd,
            events: i16,
            token: Token,
        ) {
            pfds.push(libc::pollfd {
                fd,
                events,
                revents: 0,
            });
            tokens.push(token);
        }

        loop {
            let mut pfds: Vec<libc::pollfd> = Vec::with_capacity(1 + self.conns.len() * 5);
            let mut tokens: Vec<Token> = Vec::with_capacity(pfds.capacity());

            add(
                &mut pfds,
                &mut tokens,
                self.listener.as_raw_fd(),
                libc::POLLIN,
                Token::Listener,
            );

            for (i, conn) in self.conns.iter().enumerate() {
                if let Some(fd) = conn.stdout_event() {
                    add(&mut pfds, &mut tokens, fd, libc::POLLIN, Token::Stdout(i));
                }
                if let Some(fd) = conn.stderr_event() {
                    add(&mut pfds, &mut tokens, fd, libc::POLLIN, Token::Stderr(i));
                }
                if let Some(fd) = conn.child_event() {
                    add(&mut pfds, &mut tokens, fd, libc::POLLIN, Token::Child(i));
                }
                if let Some(fd) = conn.stdin_event() {
                    add(&mut pfds, &mut tokens, fd, libc::POLLIN, Token::Stdin(i));
                }
                let mut events = 0i16;
                if conn.wants_sock_read() {
                    events |= libc::POLLIN;
                }
                if conn.wants_sock_write() {
                    events |= libc::POLLOUT;
                }
                if events != 0 {
                    add(&mut pfds, &mut tokens, conn.sock_fd(), events, Token::Sock(i));
                }
            }

            let rc = unsafe { libc::poll(pfds.as_mut_ptr(), pfds.len() as libc::nfds_t, -1) };
            if rc < 0 {
                let err = std::io::Error::last_os_error();
                if err.kind() == ErrorKind::Interrupted {
                    continue;
                }
                return Err(err).context("poll");
            }

            let network_wake = pfds
                .iter()
                .zip(&tokens)
                .any(|(p, t)| p.revents != 0 && matches!(t, Token::Listener | Token::Sock(_)));

            if network_wake {
                self.accept_new();
                self.service_all_sockets();
            } else if let Some(pos) = pfds.iter().position(|p| p.revents != 0) {
                self.service_one(tokens[pos]);
            }
        }
    }

    fn accept_new(&mut self) {
        match self.listener.accept() {
            Ok((sock, _)) => {
                if self.conns.len() == MAX_CONNECTIONS {
                    eprintln!("too many open connections, dropping connection");
                    return;
                }
                if let Err(e) = sock.set_nonblocking(true) {
                    eprintln!("cannot make accepted socket nonblocking: {e}");
                    return;
                }
                let id = self.next_id;
                self.next_id += 1;
                eprintln!("[{id}] new connection established");
                self.conns.push(Connection::new(id, sock));
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {}
            Err(e) => eprintln!("accept failed: {e}"),
        }
    }

    /// Flush and read every connection once. Slots torn down on the way
    /// shift the rest forward, so the index only advances on survival.
    fn service_all_sockets(&mut self) {
        let mut i = 0;
        while i < self.conns.len() {
            let alive = self.conns[i].flush() && self.conns[i].on_readable();
            if alive {
                i += 1;
            } else {
                self.remove(i);
            }
        }
    }

    fn service_one(&mut self, token: Token) {
        let (i, alive) = match token {
            Token::Stdout(i) => (i, self.conns[i].on_stdout()),
            Token::Stderr(i) => (i, self.conns[i].on_stderr()),
            Token::Stdin(i) => (i, self.conns[i].on_stdin_writable()),
            Token::Child(i) => (i, self.conns[i].on_child_exit()),
            Token::Listener | Token::Sock(_) => return,
        };
        if !alive {
            self.remove(i);
        }
    }

    fn remove(&mut self, i: usize) {
        let mut conn = self.conns.remove(i);
        conn.shutdown();
        eprintln!("[{}] connection closed", conn.id);
    }
}
