//! Readiness-bearing endpoints over anonymous pipes.
//!
//! Anonymous pipes cannot be placed in the poll set directly without
//! risking a blocked event loop, so each endpoint owns a helper thread that
//! performs the actual blocking read or write and reports completion
//! through a self-pipe event. The event's read end is what the scheduler
//! polls; it stays readable from the moment the helper signals until the
//! result is consumed.
//!
//! An endpoint is idle, pending, or completed. `initiate` hands the
//! operation to the helper; `result` takes the outcome back and returns the
//! endpoint to idle. Buffer ownership flips between the two sides through
//! the channels, so no locking is involved.
//!
//! Dropping an endpoint detaches its helper rather than joining it: a
//! helper blocked in a pipe read only returns once the peer closes, so the
//! caller must make that happen first (kill the child, which closes its
//! pipe ends) and never wait on the thread itself.

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::mpsc;
use std::thread;

use anyhow::{anyhow, Result};
use nix::fcntl::OFlag;
use nix::unistd::pipe2;

/// Largest chunk a read endpoint pulls from its pipe in one operation.
pub const PIPE_READ_SIZE: usize = 32 * 1024;

/// Completion event: a self-pipe whose read end is level-triggered readable
/// while signalled. `reset` drains it.
pub struct Event {
    rx: File,
}

pub struct EventSignal {
    tx: File,
}

impl Event {
    pub fn pair() -> Result<(Event, EventSignal)> {
        let (rx, tx) = pipe2(OFlag::O_CLOEXEC)?;
        set_nonblocking(rx.as_raw_fd())?;
        Ok((Event { rx: File::from(rx) }, EventSignal { tx: File::from(tx) }))
    }

    pub fn fd(&self) -> RawFd {
        self.rx.as_raw_fd()
    }

    pub fn reset(&mut self) {
        let mut scratch = [0u8; 64];
        loop {
            match self.rx.read(&mut scratch) {
                Ok(0) => break,
                Ok(_) => continue,
                // WouldBlock: drained
                Err(_) => break,
            }
        }
    }
}

impl EventSignal {
    pub fn signal(&mut self) {
        let _ = self.tx.write(&[1u8]);
    }
}

fn set_nonblocking(fd: RawFd) -> Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error().into());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error().into());
    }
    Ok(())
}

/// Read half of an anonymous pipe with background readiness.
pub struct PipeReader {
    req_tx: mpsc::Sender<()>,
    res_rx: mpsc::Receiver<io::Result<Vec<u8>>>,
    event: Event,
    pending: bool,
}

/// Creates a pipe and wraps its read end in an endpoint. The returned
/// write end is the child-facing half.
pub fn reader_pair() -> Result<(PipeReader, OwnedFd)> {
    let (rx, tx) = pipe2(OFlag::O_CLOEXEC)?;
    Ok((PipeReader::new(rx)?, tx))
}

impl PipeReader {
    pub fn new(fd: OwnedFd) -> Result<PipeReader> {
        let (event, mut signal) = Event::pair()?;
        let (req_tx, req_rx) = mpsc::channel::<()>();
        let (res_tx, res_rx) = mpsc::channel();
        let mut file = File::from(fd);
        thread::Builder::new()
            .name("pipe-read".into())
            .spawn(move || {
                while req_rx.recv().is_ok() {
                    let mut buf = vec![0u8; PIPE_READ_SIZE];
                    let res = file.read(&mut buf).map(|n| {
                        buf.truncate(n);
                        buf
                    });
                    if res_tx.send(res).is_err() {
                        break;
                    }
                    signal.signal();
                }
                // Endpoint gone; the pipe fd closes with `file`.
            })?;
        Ok(PipeReader {
            req_tx,
            res_rx,
            event,
            pending: false,
        })
    }

    /// Queues the next background read. Requires no read in flight.
    pub fn initiate(&mut self) -> Result<()> {
        assert!(!self.pending);
        self.req_tx
            .send(())
            .map_err(|_| anyhow!("pipe reader helper is gone"))?;
        self.pending = true;
        Ok(())
    }

    /// Takes the completed read, if any. An empty buffer is end of file.
    pub fn result(&mut self) -> Option<io::Result<Vec<u8>>> {
        match self.res_rx.try_recv() {
            Ok(res) => {
                self.pending = false;
                self.event.reset();
                Some(res)
            }
            Err(mpsc::TryRecvError::Empty) => None,
            Err(mpsc::TryRecvError::Disconnected) => {
                self.pending = false;
                Some(Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "pipe reader helper is gone",
                )))
            }
        }
    }

    pub fn pending(&self) -> bool {
        self.pending
    }

    pub fn event_fd(&self) -> RawFd {
        self.event.fd()
    }
}

/// Write half of an anonymous pipe with background readiness. At most one
/// write may be in flight.
pub struct PipeWriter {
    req_tx: mpsc::Sender<Vec<u8>>,
    res_rx: mpsc::Receiver<io::Result<usize>>,
    event: Event,
    pending: bool,
}

/// Creates a pipe and wraps its write end in an endpoint. The returned
/// read end is the child-facing half.
pub fn writer_pair() -> Result<(PipeWriter, OwnedFd)> {
    let (rx, tx) = pipe2(OFlag::O_CLOEXEC)?;
    Ok((PipeWriter::new(tx)?, rx))
}

impl PipeWriter {
    pub fn new(fd: OwnedFd) -> Result<PipeWriter> {
        let (event, mut signal) = Event::pair()?;
        let (req_tx, req_rx) = mpsc::channel::<Vec<u8>>();
        let (res_tx, res_rx) = mpsc::channel();
        let mut file = File::from(fd);
        thread::Builder::new()
            .name("pipe-write".into())
            .spawn(move || {
                while let Ok(data) = req_rx.recv() {
                    let res = file.write_all(&data).map(|()| data.len());
                    if res_tx.send(res).is_err() {
                        break;
                    }
                    signal.signal();
                }
            })?;
        Ok(PipeWriter {
            req_tx,
            res_rx,
            event,
            pending: false,
        })
    }

    /// Copies `data` and queues the background write.
    pub fn initiate(&mut self, data: &[u8]) -> Result<()> {
        assert!(!self.pending);
        self.req_tx
            .send(data.to_vec())
            .map_err(|_| anyhow!("pipe writer helper is gone"))?;
        self.pending = true;
        Ok(())
    }

    /// Takes the completed write's byte count, if any.
    pub fn result(&mut self) -> Option<io::Result<usize>> {
        match self.res_rx.try_recv() {
            Ok(res) => {
                self.pending = false;
                self.event.reset();
                Some(res)
            }
            Err(mpsc::TryRecvError::Empty) => None,
            Err(mpsc::TryRecvError::Disconnected) => {
                self.pending = false;
                Some(Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "pipe writer helper is gone",
                )))
            }
        }
    }

    pub fn pending(&self) -> bool {
        self.pending
    }

    pub fn event_fd(&self) -> RawFd {
        self.event.fd()
    }
}
